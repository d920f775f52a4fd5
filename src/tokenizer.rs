//! Tokenization adapters
//!
//! A thin contract over pretrained subword tokenizers. The datasets only need
//! to turn text into ids (and back for inspection), and to know which ids act
//! as padding and end-of-sequence markers.
//!
//! #### Backends
//! - `HfTokenizer`: HuggingFace `tokenizers`, loaded from a local
//!   `tokenizer.json` or downloaded from the Hub
//! - `Gpt2Tokenizer`: tiktoken's GPT-2 BPE

use anyhow::{anyhow, Context};
use hf_hub::api::sync::Api;
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc};
use tiktoken_rs::{get_bpe_from_model, CoreBPE};
use tokenizers::Tokenizer;

/// The `<|endoftext|>` id of the GPT-2 vocabulary, which also serves as padding.
pub const GPT2_EOS_TOKEN_ID: u32 = 50256;

const EOS_TOKEN_CANDIDATES: [&str; 4] = ["<|endoftext|>", "</s>", "<eos>", "<|im_end|>"];

/// Which end of an over-long encoding gets cut off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncationSide {
    /// Drop the oldest tokens and keep the most recent ones.
    #[default]
    Left,
    /// Drop the trailing tokens.
    Right,
}

/// The operations the datasets require from a tokenizer.
pub trait TextTokenizer: Send + Sync {
    /// Encodes `text` without adding any special tokens.
    fn encode_ids(&self, text: &str) -> anyhow::Result<Vec<u32>>;

    fn decode_ids(&self, ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String>;

    /// Returns the surface form of every id, one entry per id.
    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String>;

    fn pad_token_id(&self) -> u32;

    fn eos_token_id(&self) -> u32;

    fn pad_token(&self) -> String {
        self.convert_ids_to_tokens(&[self.pad_token_id()])
            .pop()
            .unwrap_or_default()
    }

    fn eos_token(&self) -> String {
        self.convert_ids_to_tokens(&[self.eos_token_id()])
            .pop()
            .unwrap_or_default()
    }
}

/// Encodes `text` and truncates the result to at most `max_length` ids from
/// the given side.
pub fn encode<T: TextTokenizer + ?Sized>(
    tokenizer: &T,
    text: &str,
    max_length: usize,
    truncation_side: TruncationSide,
) -> anyhow::Result<Vec<u32>> {
    let mut ids = tokenizer.encode_ids(text)?;
    if ids.len() > max_length {
        match truncation_side {
            TruncationSide::Right => ids.truncate(max_length),
            TruncationSide::Left => {
                ids.drain(..ids.len() - max_length);
            }
        }
    }
    Ok(ids)
}

/// A HuggingFace `tokenizers::Tokenizer` with resolved pad and eos ids.
pub struct HfTokenizer {
    inner: Tokenizer,
    pad_token_id: u32,
    eos_token_id: u32,
}

impl HfTokenizer {
    /// Wraps `inner`, looking up the end-of-sequence token among common names.
    ///
    /// When the tokenizer has no padding configured, padding falls back to the
    /// end-of-sequence id.
    pub fn new(inner: Tokenizer) -> anyhow::Result<Self> {
        let eos_token_id = EOS_TOKEN_CANDIDATES
            .iter()
            .find_map(|token| inner.token_to_id(token))
            .ok_or_else(|| anyhow!("Unable to find an end-of-sequence token in the vocabulary."))?;
        let pad_token_id = inner
            .get_padding()
            .map(|params| params.pad_id)
            .unwrap_or(eos_token_id);
        Ok(Self {
            inner,
            pad_token_id,
            eos_token_id,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref()).map_err(|e| {
            anyhow!(
                "Unable to load tokenizer from {}: {e}",
                path.as_ref().display()
            )
        })?;
        Self::new(inner)
    }

    /// Downloads `tokenizer.json` of `model_id` from the HuggingFace Hub.
    pub fn from_pretrained(model_id: &str) -> anyhow::Result<Self> {
        tracing::info!("Fetching tokenizer for {model_id} from the HuggingFace Hub");
        let api = Api::new()?;
        let path = api
            .model(model_id.to_string())
            .get("tokenizer.json")
            .with_context(|| format!("Unable to fetch tokenizer.json for {model_id}"))?;
        Self::from_file(path)
    }

    pub fn with_pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    pub fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = eos_token_id;
        self
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode_ids(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenization failed: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode_ids(&self, ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow!("Decoding failed: {e}"))
    }

    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .map(|id| self.inner.id_to_token(*id).unwrap_or_default())
            .collect()
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

/// tiktoken's GPT-2 BPE, where `<|endoftext|>` is both eos and padding.
pub struct Gpt2Tokenizer {
    bpe: CoreBPE,
}

impl Gpt2Tokenizer {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            bpe: get_bpe_from_model("gpt2")?,
        })
    }
}

impl TextTokenizer for Gpt2Tokenizer {
    fn encode_ids(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        Ok(self.bpe.encode_with_special_tokens(text))
    }

    fn decode_ids(&self, ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        let ids = ids
            .iter()
            .copied()
            .filter(|id| !(skip_special_tokens && *id == GPT2_EOS_TOKEN_ID))
            .collect::<Vec<_>>();
        self.bpe.decode(ids)
    }

    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        // single byte-level pieces are not always valid utf-8 on their own
        ids.iter()
            .map(|id| {
                self.bpe
                    .decode(vec![*id])
                    .unwrap_or_else(|_| char::REPLACEMENT_CHARACTER.to_string())
            })
            .collect()
    }

    fn pad_token_id(&self) -> u32 {
        GPT2_EOS_TOKEN_ID
    }

    fn eos_token_id(&self) -> u32 {
        GPT2_EOS_TOKEN_ID
    }
}

/// Resolves a backbone name into a tokenizer.
///
/// `gpt2` maps to the bundled tiktoken BPE, an existing path is read as a
/// `tokenizer.json`, anything else is treated as a Hub model id.
pub fn load_tokenizer(backbone: &str) -> anyhow::Result<Arc<dyn TextTokenizer>> {
    if backbone == "gpt2" {
        return Ok(Arc::new(Gpt2Tokenizer::new()?));
    }
    let path = Path::new(backbone);
    if path.exists() {
        return Ok(Arc::new(HfTokenizer::from_file(path)?));
    }
    Ok(Arc::new(HfTokenizer::from_pretrained(backbone)?))
}

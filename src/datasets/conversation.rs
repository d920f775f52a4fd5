//! Conversation table and chained-context dataset
//!
//! A conversation is stored one turn per row. Each row carries a prompt, an
//! answer and a back-reference to the previous turn; the final turn of a
//! preference conversation has an empty answer and carries the chosen and
//! rejected responses instead.

use super::{last_n, pad_tokens, PaddedSequence, PaddingSide, IGNORE_INDEX};
use crate::config::{DatasetConfig, TokenizerConfig};
use crate::tokenizer::{encode, TextTokenizer, TruncationSide};
use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use itertools::Itertools;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, NoneAsEmptyString};
use std::{
    collections::{HashMap, HashSet},
    fs::{create_dir_all, read_to_string, File},
    io,
    path::Path,
    sync::Arc,
};

/// One turn of a conversation, as stored in JSON tables.
#[serde_as]
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub instruction: String,
    #[serde(default)]
    pub output: String,
    pub id: String,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub chosen_response: Option<String>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub rejected_response: Option<String>,
}

impl ConversationRecord {
    pub fn new(instruction: &str, output: &str, id: &str, parent_id: Option<&str>) -> Self {
        Self {
            instruction: instruction.to_string(),
            output: output.to_string(),
            id: id.to_string(),
            parent_id: parent_id.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn with_responses(mut self, chosen: &str, rejected: &str) -> Self {
        self.chosen_response = Some(chosen.to_string());
        self.rejected_response = Some(rejected.to_string());
        self
    }
}

/// Downloads a conversation table to `file_path` unless it already exists.
pub fn download_table<P: AsRef<Path>>(url: &str, file_path: P) -> anyhow::Result<()> {
    let file_path = file_path.as_ref();
    if file_path.exists() {
        tracing::debug!("{} already exists, skipping download", file_path.display());
        return Ok(());
    }
    if let Some(parent) = file_path.parent() {
        create_dir_all(parent)?;
    }
    tracing::info!("Downloading {url} to {}", file_path.display());
    let resp = reqwest::blocking::get(url)?.error_for_status()?;
    let content: Bytes = resp.bytes()?;
    let mut out = File::create(file_path)?;
    io::copy(&mut content.as_ref(), &mut out)?;
    Ok(())
}

/// The immutable, column-oriented conversation table.
#[derive(Debug, Clone, Default)]
pub struct ConversationTable {
    prompts: Vec<String>,
    answers: Vec<String>,
    ids: Vec<String>,
    parent_ids: Vec<Option<String>>,
    chosen_responses: Option<Vec<String>>,
    rejected_responses: Option<Vec<String>>,
    id_to_idx: HashMap<String, usize>,
}

impl ConversationTable {
    fn new(
        prompts: Vec<String>,
        answers: Vec<String>,
        ids: Vec<String>,
        parent_ids: Vec<Option<String>>,
        chosen_responses: Option<Vec<String>>,
        rejected_responses: Option<Vec<String>>,
    ) -> anyhow::Result<Self> {
        let mut id_to_idx = HashMap::with_capacity(ids.len());
        for (idx, id) in ids.iter().enumerate() {
            if id_to_idx.insert(id.clone(), idx).is_some() {
                bail!("Duplicate conversation id `{id}`");
            }
        }
        // an empty parent id marks a chain root, same as a missing one
        let parent_ids = parent_ids
            .into_iter()
            .map(|parent| parent.filter(|p| !p.is_empty()))
            .collect();
        Ok(Self {
            prompts,
            answers,
            ids,
            parent_ids,
            chosen_responses,
            rejected_responses,
            id_to_idx,
        })
    }

    pub fn from_records(records: &[ConversationRecord]) -> anyhow::Result<Self> {
        let column = |f: fn(&ConversationRecord) -> String| -> Vec<String> {
            records.iter().map(f).collect()
        };
        Self::new(
            column(|r| r.instruction.clone()),
            column(|r| r.output.clone()),
            column(|r| r.id.clone()),
            records.iter().map(|r| r.parent_id.clone()).collect(),
            Some(column(|r| r.chosen_response.clone().unwrap_or_default())),
            Some(column(|r| r.rejected_response.clone().unwrap_or_default())),
        )
    }

    /// Builds the table from a `DataFrame` using the column mapping of `cfg`.
    ///
    /// Values of any type are cast to strings. Nulls become empty strings.
    /// Response columns are optional here; the preference dataset requires
    /// them.
    pub fn from_dataframe(df: &DataFrame, cfg: &DatasetConfig) -> anyhow::Result<Self> {
        let height = df.height();
        let prompt_columns = cfg
            .prompt_column
            .iter()
            .map(|name| string_column(df, name))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let prompts = (0..height)
            .map(|i| {
                prompt_columns
                    .iter()
                    .map(|column| column[i].as_deref().unwrap_or_default())
                    .join("\n")
            })
            .collect();
        let answers = coerce_nulls(string_column(df, &cfg.answer_column)?, &cfg.answer_column);

        let (ids, parent_ids) = match &cfg.parent_id_column {
            Some(parent_column) => (
                coerce_nulls(string_column(df, &cfg.id_column)?, &cfg.id_column),
                string_column(df, parent_column)?,
            ),
            None => ((0..height).map(|i| i.to_string()).collect(), vec![None; height]),
        };

        let chosen = optional_string_column(df, &cfg.chosen_response_column)?
            .map(|values| coerce_nulls(values, &cfg.chosen_response_column));
        let rejected = optional_string_column(df, &cfg.rejected_response_column)?
            .map(|values| coerce_nulls(values, &cfg.rejected_response_column));

        Self::new(prompts, answers, ids, parent_ids, chosen, rejected)
    }

    /// Reads a `.csv`, `.parquet` or `.json` table.
    ///
    /// JSON tables are arrays of `ConversationRecord` and use its field names
    /// regardless of the column mapping.
    pub fn read<P: AsRef<Path>>(path: P, cfg: &DatasetConfig) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase);
        let table = match extension.as_deref() {
            Some("csv") => {
                let df = CsvReadOptions::default()
                    .with_has_header(true)
                    .try_into_reader_with_file_path(Some(path.to_path_buf()))?
                    .finish()
                    .with_context(|| format!("Unable to read {}", path.display()))?;
                Self::from_dataframe(&df, cfg)?
            }
            Some("parquet") | Some("pq") => {
                let mut file = File::open(path)
                    .with_context(|| format!("Unable to open {}", path.display()))?;
                let df = ParquetReader::new(&mut file).finish()?;
                Self::from_dataframe(&df, cfg)?
            }
            Some("json") => {
                let json_str = read_to_string(path)
                    .with_context(|| format!("Unable to read {}", path.display()))?;
                let records: Vec<ConversationRecord> = serde_json::from_str(&json_str)?;
                Self::from_records(&records)?
            }
            _ => bail!("Unsupported table format: {}", path.display()),
        };
        tracing::info!("Loaded {} conversation turns from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn prompt(&self, row: usize) -> &str {
        &self.prompts[row]
    }

    pub fn answer(&self, row: usize) -> &str {
        &self.answers[row]
    }

    pub fn id(&self, row: usize) -> &str {
        &self.ids[row]
    }

    pub fn chosen_responses(&self) -> Option<&[String]> {
        self.chosen_responses.as_deref()
    }

    pub fn rejected_responses(&self) -> Option<&[String]> {
        self.rejected_responses.as_deref()
    }

    /// Row of the previous turn, if it exists in the table.
    pub fn parent_index(&self, row: usize) -> Option<usize> {
        self.parent_ids[row]
            .as_ref()
            .and_then(|parent| self.id_to_idx.get(parent).copied())
    }

    /// Rows that no other row points to, i.e. the last turn of every chain.
    pub fn leaf_indices(&self) -> Vec<usize> {
        let parents: HashSet<&str> = self.parent_ids.iter().flatten().map(String::as_str).collect();
        (0..self.len())
            .filter(|row| !parents.contains(self.ids[*row].as_str()))
            .collect()
    }

    /// Rows of the conversation ending at `row`, oldest turn first.
    pub fn chain(&self, row: usize) -> anyhow::Result<Vec<usize>> {
        let mut chain = vec![row];
        let mut seen = HashSet::from([row]);
        let mut current = row;
        while let Some(parent) = self.parent_index(current) {
            if !seen.insert(parent) {
                bail!("Conversation ending at `{}` contains a cycle", self.ids[row]);
            }
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        Ok(chain)
    }
}

fn string_column(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<String>>> {
    let series = df
        .column(name)
        .with_context(|| format!("Missing column `{name}`"))?
        .as_materialized_series()
        .cast(&DataType::String)?;
    let values = series
        .str()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect();
    Ok(values)
}

fn optional_string_column(
    df: &DataFrame,
    name: &str,
) -> anyhow::Result<Option<Vec<Option<String>>>> {
    match df.get_column_index(name) {
        Some(_) => Ok(Some(string_column(df, name)?)),
        None => Ok(None),
    }
}

fn coerce_nulls(values: Vec<Option<String>>, name: &str) -> Vec<String> {
    let num_nulls = values.iter().filter(|value| value.is_none()).count();
    if num_nulls > 0 {
        tracing::warn!("Column `{name}` has {num_nulls} missing values, using empty strings");
    }
    values.into_iter().map(Option::unwrap_or_default).collect()
}

/// Resolves `\n`, `\t`, `\r` and `\\` escapes typed into config strings.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// A conversation encoded for causal language modeling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSample {
    /// The whole chain, left-padded to `max_length`.
    pub input: PaddedSequence,
    /// The chain without its final answer, left-padded to `max_length`.
    pub prompt_input_ids: Vec<u32>,
    pub prompt_attention_mask: Vec<u32>,
    /// The final answer, right-padded to `max_length_answer`.
    pub answer_input_ids: Vec<u32>,
    pub answer_attention_mask: Vec<u32>,
}

pub struct ConversationDataset_ {
    table: ConversationTable,
    tokenizer: Arc<dyn TextTokenizer>,
    dataset_cfg: DatasetConfig,
    tokenizer_cfg: TokenizerConfig,
    indices: Vec<usize>,
}

/// Builds chained prompt/answer contexts from a `ConversationTable`.
///
/// NOTE: This is an Arc-wrapped `ConversationDataset_`, cheap to clone and
/// shareable across threads. Samples are encoded on every access.
#[derive(Clone)]
pub struct ConversationDataset(Arc<ConversationDataset_>);

impl std::ops::Deref for ConversationDataset {
    type Target = ConversationDataset_;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl ConversationDataset {
    pub fn new(
        table: ConversationTable,
        tokenizer: Arc<dyn TextTokenizer>,
        dataset_cfg: &DatasetConfig,
        tokenizer_cfg: &TokenizerConfig,
    ) -> Self {
        let indices = if dataset_cfg.limit_chained_samples {
            table.leaf_indices()
        } else {
            (0..table.len()).collect()
        };
        tracing::debug!(
            "Conversation dataset with {} samples over {} turns",
            indices.len(),
            table.len()
        );
        let dataset_ = ConversationDataset_ {
            table,
            tokenizer,
            dataset_cfg: dataset_cfg.clone(),
            tokenizer_cfg: tokenizer_cfg.clone(),
            indices,
        };
        Self(Arc::new(dataset_))
    }

    /// Gets the number of samples.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Checks whether the dataset has no samples.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Table rows backing each sample.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn table(&self) -> &ConversationTable {
        &self.table
    }

    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.tokenizer.as_ref()
    }

    pub fn dataset_config(&self) -> &DatasetConfig {
        &self.dataset_cfg
    }

    pub fn tokenizer_config(&self) -> &TokenizerConfig {
        &self.tokenizer_cfg
    }

    /// Maps a sample index to its table row.
    pub fn row_index(&self, index: usize) -> anyhow::Result<usize> {
        self.indices.get(index).copied().ok_or_else(|| {
            anyhow!(
                "Index {index} out of range for dataset of length {}",
                self.len()
            )
        })
    }

    /// The prompt as it is presented to the model, with start marker, eos
    /// and answer separator.
    pub fn parse_prompt(&self, prompt: &str) -> String {
        let cfg = &self.dataset_cfg;
        let eos = if cfg.add_eos_token_to_prompt {
            self.tokenizer.eos_token()
        } else {
            String::new()
        };
        format!(
            "{}{prompt}{eos}{}",
            unescape(&cfg.text_prompt_start),
            unescape(&cfg.text_answer_separator)
        )
    }

    /// The conversation of sample `index` as text: all prompts and answers
    /// joined by `separator`, ending with the final prompt.
    pub fn chained_prompt_text(&self, index: usize, separator: &str) -> anyhow::Result<String> {
        let row = self.row_index(index)?;
        let chain = self.table.chain(row)?;
        let mut parts = vec![];
        for (pos, turn) in chain.iter().enumerate() {
            parts.push(self.parse_prompt(self.table.prompt(*turn)));
            if pos + 1 < chain.len() {
                parts.push(self.table.answer(*turn).to_string());
            }
        }
        Ok(parts.join(separator))
    }

    /// Encodes a prompt, keeping its last `max_length_prompt` tokens.
    ///
    /// The eos marker is inserted by id so it never depends on how the
    /// tokenizer splits its textual form.
    pub fn encode_prompt(&self, prompt: &str) -> anyhow::Result<Vec<u32>> {
        let cfg = &self.dataset_cfg;
        let text = format!("{}{prompt}", unescape(&cfg.text_prompt_start));
        let mut ids = self.tokenizer.encode_ids(&text)?;
        if cfg.add_eos_token_to_prompt {
            ids.push(self.tokenizer.eos_token_id());
        }
        ids.extend(
            self.tokenizer
                .encode_ids(&unescape(&cfg.text_answer_separator))?,
        );
        Ok(last_n(&ids, self.tokenizer_cfg.max_length_prompt).to_vec())
    }

    /// Encodes an answer, keeping its first tokens and appending eos when
    /// configured. The result never exceeds `max_length_answer`.
    pub fn encode_answer(&self, answer: &str) -> anyhow::Result<Vec<u32>> {
        let add_eos = self.dataset_cfg.add_eos_token_to_answer;
        let max_length = self
            .tokenizer_cfg
            .max_length_answer
            .saturating_sub(usize::from(add_eos));
        let mut ids = encode(
            self.tokenizer.as_ref(),
            answer,
            max_length,
            TruncationSide::Right,
        )?;
        if add_eos {
            ids.push(self.tokenizer.eos_token_id());
        }
        Ok(ids)
    }

    /// Encoded (prompt, answer) pairs of the conversation ending at `row`.
    pub fn prompt_and_answer_encodings(
        &self,
        row: usize,
    ) -> anyhow::Result<Vec<(Vec<u32>, Vec<u32>)>> {
        self.table
            .chain(row)?
            .into_iter()
            .map(|turn| {
                let prompt = self.encode_prompt(self.table.prompt(turn))?;
                let answer = self.encode_answer(self.table.answer(turn))?;
                Ok((prompt, answer))
            })
            .collect()
    }

    fn labels(&self, encodings: &[(Vec<u32>, Vec<u32>)]) -> Vec<i64> {
        let mask_prompt = self.dataset_cfg.mask_prompt_labels;
        let mut labels = encodings
            .iter()
            .flat_map(|(prompt, answer)| {
                let prompt_labels = prompt.iter().map(move |id| {
                    if mask_prompt {
                        IGNORE_INDEX
                    } else {
                        *id as i64
                    }
                });
                prompt_labels.chain(answer.iter().map(|id| *id as i64))
            })
            .collect::<Vec<_>>();
        if self.dataset_cfg.add_eos_token_to_answer {
            // eos may share its id with padding, so set it explicitly
            if let Some(last) = labels.last_mut() {
                *last = self.tokenizer.eos_token_id() as i64;
            }
        }
        let max_length = self.tokenizer_cfg.max_length;
        let kept = last_n(&labels, max_length);
        let mut padded = vec![IGNORE_INDEX; max_length - kept.len()];
        padded.extend_from_slice(kept);
        padded
    }

    /// Returns the encoded conversation of sample `index`.
    pub fn get(&self, index: usize) -> anyhow::Result<ConversationSample> {
        let row = self.row_index(index)?;
        let mut encodings = self.prompt_and_answer_encodings(row)?;
        let pad_token_id = self.tokenizer.pad_token_id();
        let max_length = self.tokenizer_cfg.max_length;

        let input_ids = encodings
            .iter()
            .flat_map(|(prompt, answer)| prompt.iter().chain(answer.iter()).copied())
            .collect::<Vec<_>>();
        let labels = self.labels(&encodings);
        let (input_ids, attention_mask) = pad_tokens(
            &input_ids,
            &vec![1; input_ids.len()],
            max_length,
            pad_token_id,
            PaddingSide::Left,
        );

        let answer = encodings
            .last_mut()
            .map(|(_, answer)| std::mem::take(answer))
            .unwrap_or_default();
        let (answer_input_ids, answer_attention_mask) = pad_tokens(
            &answer,
            &vec![1; answer.len()],
            self.tokenizer_cfg.max_length_answer,
            pad_token_id,
            PaddingSide::Right,
        );

        // the final answer was taken out above, leaving the generation context
        let prompt_ids = encodings
            .iter()
            .flat_map(|(prompt, answer)| prompt.iter().chain(answer.iter()).copied())
            .collect::<Vec<_>>();
        let (prompt_input_ids, prompt_attention_mask) = pad_tokens(
            &prompt_ids,
            &vec![1; prompt_ids.len()],
            max_length,
            pad_token_id,
            PaddingSide::Left,
        );

        Ok(ConversationSample {
            input: PaddedSequence {
                input_ids,
                attention_mask,
                labels,
            },
            prompt_input_ids,
            prompt_attention_mask,
            answer_input_ids,
            answer_attention_mask,
        })
    }
}

//! Preference-pair dataset
//!
//! Every sample is a conversation context followed by two alternative final
//! answers, the chosen and the rejected one. Both branches share the context
//! tokens and a per-sample target length, and only their answer tokens carry
//! labels.

use super::conversation::{ConversationDataset, ConversationSample};
use super::loader::PreferenceBatch;
use super::{pad_tokens, PaddedSequence, PaddingSide, IGNORE_INDEX};
use anyhow::{anyhow, bail};
use candle_core::{Device, Tensor};
use std::{collections::HashMap, sync::Arc};

/// A conversation context with its chosen and rejected continuations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferenceSample {
    pub base: ConversationSample,
    pub chosen: PaddedSequence,
    pub rejected: PaddedSequence,
}

impl PreferenceSample {
    /// All fields as `(name, values)` rows, named as the training loop expects.
    pub fn named_u32_fields(&self) -> Vec<(&'static str, &[u32])> {
        vec![
            ("input_ids", &self.base.input.input_ids[..]),
            ("attention_mask", &self.base.input.attention_mask[..]),
            ("prompt_input_ids", &self.base.prompt_input_ids[..]),
            ("prompt_attention_mask", &self.base.prompt_attention_mask[..]),
            ("answer_input_ids", &self.base.answer_input_ids[..]),
            ("answer_attention_mask", &self.base.answer_attention_mask[..]),
            ("chosen_input_ids", &self.chosen.input_ids[..]),
            ("chosen_attention_mask", &self.chosen.attention_mask[..]),
            ("rejected_input_ids", &self.rejected.input_ids[..]),
            ("rejected_attention_mask", &self.rejected.attention_mask[..]),
        ]
    }

    pub fn named_label_fields(&self) -> Vec<(&'static str, &[i64])> {
        vec![
            ("labels", &self.base.input.labels[..]),
            ("chosen_labels", &self.chosen.labels[..]),
            ("rejected_labels", &self.rejected.labels[..]),
        ]
    }

    /// The sample as named 1-d tensors. Labels are `i64`, everything else `u32`.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        for (name, values) in self.named_u32_fields() {
            tensors.insert(name.to_string(), Tensor::new(values, device)?);
        }
        for (name, values) in self.named_label_fields() {
            tensors.insert(name.to_string(), Tensor::new(values, device)?);
        }
        Ok(tensors)
    }

    /// The left-padded prompt context without its padding.
    pub fn attended_prompt_input_ids(&self) -> Vec<u32> {
        self.base
            .prompt_input_ids
            .iter()
            .zip(self.base.prompt_attention_mask.iter())
            .filter(|(_, mask)| **mask != 0)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Decoded prompts and generated answers of validation batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPredictions {
    pub input_text: Vec<String>,
    pub predicted_text: Vec<String>,
}

impl BatchPredictions {
    /// Appends the predictions of a later batch.
    pub fn extend(&mut self, other: BatchPredictions) {
        self.input_text.extend(other.input_text);
        self.predicted_text.extend(other.predicted_text);
    }

    pub fn len(&self) -> usize {
        self.predicted_text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicted_text.is_empty()
    }
}

/// Predictions of a whole validation pass next to their targets.
///
/// `predicted_text` stays empty when no answers were generated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationOutput {
    pub input_text: Vec<String>,
    pub predicted_text: Vec<String>,
    pub target_text: Vec<String>,
    /// Metric name and one score per sample.
    pub metric: Option<(String, Vec<f64>)>,
}

impl ValidationOutput {
    pub fn with_metric(mut self, name: &str, values: Vec<f64>) -> anyhow::Result<Self> {
        if values.len() != self.target_text.len() {
            bail!(
                "Got {} `{name}` scores for {} validation samples",
                values.len(),
                self.target_text.len()
            );
        }
        self.metric = Some((name.to_string(), values));
        Ok(self)
    }
}

/// Labels for one branch: a copy of `input_ids` with the context positions,
/// every position holding `pad_token_id`, and (through the mask) padding set
/// to `IGNORE_INDEX`.
///
/// With `eos_token_id` given, the label of the last attended position is set
/// to it afterwards, since eos frequently shares its id with padding.
///
/// NOTE: answer tokens that happen to equal `pad_token_id` lose their label
/// as well.
pub fn build_labels(
    input_ids: &[u32],
    attention_mask: &[u32],
    prompt_length: usize,
    pad_token_id: u32,
    eos_token_id: Option<u32>,
) -> Vec<i64> {
    let mut labels = input_ids
        .iter()
        .enumerate()
        .map(|(pos, id)| {
            if pos < prompt_length || *id == pad_token_id {
                IGNORE_INDEX
            } else {
                *id as i64
            }
        })
        .collect::<Vec<_>>();
    if let Some(eos_token_id) = eos_token_id {
        if let Some(last) = attention_mask.iter().rposition(|mask| *mask != 0) {
            labels[last] = eos_token_id as i64;
        }
    }
    labels
}

/// Joins a context with one answer into a right-padded branch of
/// `target_length` positions, then keeps its last `max_length` positions.
pub fn concatenated_inputs_and_labels(
    prompt_input_ids: &[u32],
    answer_input_ids: &[u32],
    target_length: usize,
    max_length: usize,
    pad_token_id: u32,
    eos_token_id: Option<u32>,
) -> PaddedSequence {
    let input_ids = [prompt_input_ids, answer_input_ids].concat();
    let attention_mask = vec![1_u32; input_ids.len()];
    let (input_ids, attention_mask) = pad_tokens(
        &input_ids,
        &attention_mask,
        target_length,
        pad_token_id,
        PaddingSide::Right,
    );
    let labels = build_labels(
        &input_ids,
        &attention_mask,
        prompt_input_ids.len(),
        pad_token_id,
        eos_token_id,
    );
    PaddedSequence {
        input_ids,
        attention_mask,
        labels,
    }
    .keep_last(max_length)
}

pub struct PreferenceDataset_ {
    base: ConversationDataset,
    chosen_responses: Vec<String>,
    rejected_responses: Vec<String>,
}

/// Preference pairs over a `ConversationDataset`.
///
/// NOTE: This is an Arc-wrapped `PreferenceDataset_`
#[derive(Clone)]
pub struct PreferenceDataset(Arc<PreferenceDataset_>);

impl std::ops::Deref for PreferenceDataset {
    type Target = PreferenceDataset_;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PreferenceDataset {
    /// Fails unless `limit_chained_samples` is set: a preference sample needs
    /// the whole conversation leading to the judged turn.
    pub fn new(base: ConversationDataset) -> anyhow::Result<Self> {
        if !base.dataset_config().limit_chained_samples {
            bail!("Need to enable limit_chained_samples for preference training");
        }
        let cfg = base.dataset_config();
        let table = base.table();
        let chosen_responses = table
            .chosen_responses()
            .ok_or_else(|| anyhow!("Missing column `{}`", cfg.chosen_response_column))?
            .to_vec();
        let rejected_responses = table
            .rejected_responses()
            .ok_or_else(|| anyhow!("Missing column `{}`", cfg.rejected_response_column))?
            .to_vec();
        let dataset_ = PreferenceDataset_ {
            base,
            chosen_responses,
            rejected_responses,
        };
        Ok(Self(Arc::new(dataset_)))
    }

    /// Gets the number of preference samples.
    pub fn len(&self) -> usize {
        self.base.len()
    }

    /// Checks whether the dataset has no preference samples.
    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub fn base(&self) -> &ConversationDataset {
        &self.base
    }

    pub fn chosen_response(&self, row: usize) -> &str {
        &self.chosen_responses[row]
    }

    pub fn rejected_response(&self, row: usize) -> &str {
        &self.rejected_responses[row]
    }

    /// Encoded chosen and rejected answers of table row `row`.
    pub fn answer_input_ids(&self, row: usize) -> anyhow::Result<(Vec<u32>, Vec<u32>)> {
        let chosen = self.base.encode_answer(self.chosen_response(row))?;
        let rejected = self.base.encode_answer(self.rejected_response(row))?;
        Ok((chosen, rejected))
    }

    /// Decodes the prompts of `batch` and the answers generated for them,
    /// skipping special tokens and surrounding whitespace.
    pub fn postprocess_batch_predictions(
        &self,
        batch: &PreferenceBatch,
        predicted_answer_ids: &[Vec<u32>],
    ) -> anyhow::Result<BatchPredictions> {
        if predicted_answer_ids.len() != batch.batch_size() {
            bail!(
                "Got {} predicted answers for a batch of {}",
                predicted_answer_ids.len(),
                batch.batch_size()
            );
        }
        let tokenizer = self.base.tokenizer();
        let decode = |ids: &[u32]| -> anyhow::Result<String> {
            Ok(tokenizer.decode_ids(ids, true)?.trim().to_string())
        };
        let predicted_text = predicted_answer_ids
            .iter()
            .map(|ids| decode(ids.as_slice()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let input_text = batch
            .samples()
            .iter()
            .map(|sample| decode(sample.attended_prompt_input_ids().as_slice()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(BatchPredictions {
            input_text,
            predicted_text,
        })
    }

    /// Pairs the predictions of an unshuffled pass over the dataset with the
    /// chosen responses, which serve as targets.
    pub fn postprocess_output(&self, predictions: BatchPredictions) -> anyhow::Result<ValidationOutput> {
        if !predictions.is_empty() && predictions.len() != self.len() {
            bail!(
                "Got {} predictions for {} validation samples",
                predictions.len(),
                self.len()
            );
        }
        let target_text = (0..self.len())
            .map(|index| {
                let row = self.base.row_index(index)?;
                Ok(self.chosen_response(row).to_string())
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(ValidationOutput {
            input_text: predictions.input_text,
            predicted_text: predictions.predicted_text,
            target_text,
            metric: None,
        })
    }

    /// Returns the preference sample at `index`.
    pub fn get(&self, index: usize) -> anyhow::Result<PreferenceSample> {
        let mut base = self.base.get(index)?;
        let row = self.base.row_index(index)?;
        let add_eos = self.base.dataset_config().add_eos_token_to_answer;
        if add_eos {
            // the final (empty) answer ends with eos; each branch appends its own
            base.input = base.input.without_last();
        }

        let (chosen_input_ids, rejected_input_ids) = self.answer_input_ids(row)?;
        let prompt_input_ids = base.input.unpadded_input_ids();

        let max_length = self.base.tokenizer_config().max_length;
        let target_length = [
            prompt_input_ids.len() + chosen_input_ids.len(),
            prompt_input_ids.len() + rejected_input_ids.len(),
            max_length,
        ]
        .into_iter()
        .max()
        .unwrap_or(max_length);

        let tokenizer = self.base.tokenizer();
        let pad_token_id = tokenizer.pad_token_id();
        let eos_token_id = add_eos.then(|| tokenizer.eos_token_id());
        let branch = |answer_input_ids: &[u32]| {
            concatenated_inputs_and_labels(
                &prompt_input_ids,
                answer_input_ids,
                target_length,
                max_length,
                pad_token_id,
                eos_token_id,
            )
        };
        let chosen = branch(&chosen_input_ids);
        let rejected = branch(&rejected_input_ids);

        Ok(PreferenceSample {
            base,
            chosen,
            rejected,
        })
    }
}

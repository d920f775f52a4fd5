//! Datasets for preference fine-tuning
//!
//! - `conversation`: the conversation table and the chained-context dataset
//! - `preference`: chosen/rejected pairs built on top of a chained context
//! - `loader`: batching of preference samples into candle tensors

pub mod conversation;
pub mod loader;
pub mod preference;

/// Label value of positions that take no part in the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Where padding goes when a sequence is shorter than its target length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingSide {
    Left,
    Right,
}

/// A fixed-length triple of input ids, attention mask and labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaddedSequence {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<i64>,
}

impl PaddedSequence {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Drops the final position of all three fields.
    pub fn without_last(&self) -> Self {
        let cut = |n: usize| n.saturating_sub(1);
        Self {
            input_ids: self.input_ids[..cut(self.input_ids.len())].to_vec(),
            attention_mask: self.attention_mask[..cut(self.attention_mask.len())].to_vec(),
            labels: self.labels[..cut(self.labels.len())].to_vec(),
        }
    }

    /// Keeps the last `max_length` positions of all three fields.
    pub fn keep_last(&self, max_length: usize) -> Self {
        Self {
            input_ids: last_n(&self.input_ids, max_length).to_vec(),
            attention_mask: last_n(&self.attention_mask, max_length).to_vec(),
            labels: last_n(&self.labels, max_length).to_vec(),
        }
    }

    /// The input ids at positions with a non-zero attention mask.
    pub fn unpadded_input_ids(&self) -> Vec<u32> {
        self.input_ids
            .iter()
            .zip(self.attention_mask.iter())
            .filter(|(_, mask)| **mask != 0)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// The trailing `n` elements of `xs`, or all of them if there are fewer.
pub(crate) fn last_n<T>(xs: &[T], n: usize) -> &[T] {
    &xs[xs.len().saturating_sub(n)..]
}

/// Pads `input_ids` and `attention_mask` to `max_length`.
///
/// Over-long inputs keep their last `max_length` positions. Padding uses
/// `pad_token_id` for the ids and `0` for the mask.
pub fn pad_tokens(
    input_ids: &[u32],
    attention_mask: &[u32],
    max_length: usize,
    pad_token_id: u32,
    side: PaddingSide,
) -> (Vec<u32>, Vec<u32>) {
    let input_ids = last_n(input_ids, max_length);
    let attention_mask = last_n(attention_mask, max_length);
    let num_pad = max_length - input_ids.len();

    let mut padded_ids = Vec::with_capacity(max_length);
    let mut padded_mask = Vec::with_capacity(max_length);
    match side {
        PaddingSide::Left => {
            padded_ids.extend(std::iter::repeat(pad_token_id).take(num_pad));
            padded_ids.extend_from_slice(input_ids);
            padded_mask.extend(std::iter::repeat(0_u32).take(num_pad));
            padded_mask.extend_from_slice(attention_mask);
        }
        PaddingSide::Right => {
            padded_ids.extend_from_slice(input_ids);
            padded_ids.extend(std::iter::repeat(pad_token_id).take(num_pad));
            padded_mask.extend_from_slice(attention_mask);
            padded_mask.extend(std::iter::repeat(0_u32).take(num_pad));
        }
    }
    (padded_ids, padded_mask)
}

//! Batching of preference samples

use super::preference::{PreferenceDataset, PreferenceSample};
use crate::candle_addons::stack_rows;
use anyhow::{anyhow, Context};
use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::collections::HashMap;

/// Samples of a batch stacked into `(batch_size, len)` tensors, keyed by the
/// names of `PreferenceSample::to_tensors`.
#[derive(Debug, Clone)]
pub struct PreferenceBatch {
    tensors: HashMap<String, Tensor>,
    samples: Vec<PreferenceSample>,
}

impl PreferenceBatch {
    pub fn from_samples(samples: Vec<PreferenceSample>, device: &Device) -> anyhow::Result<Self> {
        if samples.is_empty() {
            return Err(anyhow!("Unable to build a batch without samples."));
        }
        let mut tensors = HashMap::new();

        let u32_fields = samples
            .iter()
            .map(|sample| sample.named_u32_fields())
            .collect::<Vec<_>>();
        for (pos, (name, _)) in u32_fields[0].iter().enumerate() {
            let rows = u32_fields.iter().map(|fields| fields[pos].1).collect::<Vec<_>>();
            let tensor = stack_rows(&rows, device).with_context(|| format!("field `{name}`"))?;
            tensors.insert(name.to_string(), tensor);
        }
        let label_fields = samples
            .iter()
            .map(|sample| sample.named_label_fields())
            .collect::<Vec<_>>();
        for (pos, (name, _)) in label_fields[0].iter().enumerate() {
            let rows = label_fields.iter().map(|fields| fields[pos].1).collect::<Vec<_>>();
            let tensor = stack_rows(&rows, device).with_context(|| format!("field `{name}`"))?;
            tensors.insert(name.to_string(), tensor);
        }

        Ok(Self { tensors, samples })
    }

    pub fn get(&self, name: &str) -> candle_core::Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| candle_core::Error::Msg(format!("Batch has no field `{name}`.")))
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn samples(&self) -> &[PreferenceSample] {
        &self.samples
    }

    pub fn batch_size(&self) -> usize {
        self.samples.len()
    }
}

/// Iterates over the samples of a `PreferenceDataset`, optionally shuffled.
pub struct PreferenceDatasetIter {
    dataset: PreferenceDataset,
    remaining_indices: Vec<usize>,
}

impl PreferenceDatasetIter {
    pub fn new(dataset: PreferenceDataset, shuffle: bool, seed: u64) -> Self {
        let mut remaining_indices = (0..dataset.len()).rev().collect::<Vec<_>>();
        if shuffle {
            remaining_indices.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        Self {
            dataset,
            remaining_indices,
        }
    }
}

impl Iterator for PreferenceDatasetIter {
    type Item = anyhow::Result<PreferenceSample>;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.remaining_indices.pop()?;
        Some(self.dataset.get(idx))
    }
}

/// Groups the samples of a `PreferenceDatasetIter` into `PreferenceBatch`es.
pub struct PreferenceDataBatcher {
    iter: PreferenceDatasetIter,
    batch_size: usize,
    return_last_incomplete_batch: bool,
    device: Device,
}

impl PreferenceDataBatcher {
    pub fn new(iter: PreferenceDatasetIter, device: Device) -> Self {
        Self {
            iter,
            batch_size: 16,
            return_last_incomplete_batch: false,
            device,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn return_last_incomplete_batch(mut self, r: bool) -> Self {
        self.return_last_incomplete_batch = r;
        self
    }
}

impl Iterator for PreferenceDataBatcher {
    type Item = anyhow::Result<PreferenceBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut samples = Vec::with_capacity(self.batch_size);
        while samples.len() < self.batch_size {
            match self.iter.next() {
                Some(Ok(sample)) => samples.push(sample),
                Some(Err(err)) => return Some(Err(err)),
                None => break,
            }
        }
        if samples.is_empty()
            || (samples.len() < self.batch_size && !self.return_last_incomplete_batch)
        {
            return None;
        }
        Some(PreferenceBatch::from_samples(samples, &self.device))
    }
}

pub struct PreferenceDataLoader {
    dataset: PreferenceDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    device: Device,
}

impl PreferenceDataLoader {
    pub fn new(dataset: PreferenceDataset, batch_size: usize, shuffle: bool, drop_last: bool) -> Self {
        Self {
            dataset,
            batch_size,
            shuffle,
            drop_last,
            seed: 42,
            device: Device::Cpu,
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Returns a `PreferenceDataBatcher` over the dataset.
    pub fn batcher(&self) -> PreferenceDataBatcher {
        self.epoch_batcher(0)
    }

    /// Like `batcher`, with a shuffle order that depends on `epoch`.
    pub fn epoch_batcher(&self, epoch: u64) -> PreferenceDataBatcher {
        let iter = PreferenceDatasetIter::new(
            self.dataset.clone(),
            self.shuffle,
            self.seed.wrapping_add(epoch),
        );
        PreferenceDataBatcher::new(iter, self.device.clone())
            .batch_size(self.batch_size)
            .return_last_incomplete_batch(!self.drop_last)
    }

    /// Batches of `num_epochs` consecutive epochs, each shuffled with its own
    /// `epoch_batcher` order.
    pub fn epochs(&self, num_epochs: usize) -> impl Iterator<Item = anyhow::Result<PreferenceBatch>> + '_ {
        (0..num_epochs as u64).flat_map(move |epoch| self.epoch_batcher(epoch))
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        if self.batch_size == 0 {
            return 0;
        }
        if self.drop_last {
            self.dataset.len() / self.batch_size
        } else {
            self.dataset.len().div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dataset(&self) -> &PreferenceDataset {
        &self.dataset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetConfig, TokenizerConfig};
    use crate::datasets::conversation::{ConversationDataset, ConversationRecord, ConversationTable};
    use crate::tokenizer::testing::NumericTokenizer;
    use anyhow::Result;
    use rstest::*;
    use std::sync::Arc;

    /// Five single-turn pairs; the prompt of pair `i` is `100 + i`.
    #[fixture]
    pub fn preference_dataset() -> Result<PreferenceDataset> {
        let records = (0..5)
            .map(|i| {
                ConversationRecord::new(&format!("{}", 100 + i), "", &format!("{i}"), None)
                    .with_responses("1 2", "3 4 5")
            })
            .collect::<Vec<_>>();
        let dataset_cfg = DatasetConfig {
            text_prompt_start: String::new(),
            text_answer_separator: String::new(),
            add_eos_token_to_prompt: false,
            ..Default::default()
        };
        let tokenizer_cfg = TokenizerConfig {
            max_length: 8,
            max_length_prompt: 4,
            max_length_answer: 4,
        };
        let table = ConversationTable::from_records(&records)?;
        let base = ConversationDataset::new(
            table,
            Arc::new(NumericTokenizer::new(0, 0)),
            &dataset_cfg,
            &tokenizer_cfg,
        );
        PreferenceDataset::new(base)
    }

    fn first_prompt_tokens(batch: &PreferenceBatch) -> Vec<u32> {
        batch
            .samples()
            .iter()
            .map(|sample| sample.chosen.input_ids[0])
            .collect()
    }

    #[rstest]
    #[case(false, 3, &[2_usize, 2, 1])]
    #[case(true, 2, &[2_usize, 2])]
    fn test_batches(
        preference_dataset: Result<PreferenceDataset>,
        #[case] drop_last: bool,
        #[case] expected_len: usize,
        #[case] expected_sizes: &[usize],
    ) -> Result<()> {
        let loader = PreferenceDataLoader::new(preference_dataset?, 2, false, drop_last);
        assert_eq!(loader.len(), expected_len);
        assert!(!loader.is_empty());

        let batches = loader.batcher().collect::<Result<Vec<_>>>()?;
        let sizes = batches.iter().map(|b| b.batch_size()).collect::<Vec<_>>();
        assert_eq!(sizes, expected_sizes);
        assert_eq!(first_prompt_tokens(&batches[0]), &[100, 101]);

        for name in ["chosen_input_ids", "rejected_attention_mask", "chosen_labels", "input_ids"] {
            assert_eq!(batches[0].get(name)?.dims(), &[2, 8]);
        }
        assert_eq!(batches[0].get("answer_input_ids")?.dims(), &[2, 4]);
        assert_eq!(batches[0].tensors().len(), 13);
        assert!(batches[0].get("pixel_values").is_err());
        Ok(())
    }

    #[rstest]
    fn test_batch_values(preference_dataset: Result<PreferenceDataset>) -> Result<()> {
        let loader = PreferenceDataLoader::new(preference_dataset?, 2, false, true);
        let batch = loader.batcher().next().ok_or_else(|| anyhow!("no batch"))??;

        let labels = batch.get("rejected_labels")?.to_vec2::<i64>()?;
        assert_eq!(labels[0], &[-100, 3, 4, 5, 0, -100, -100, -100]);
        let ids = batch.get("chosen_input_ids")?.to_vec2::<u32>()?;
        assert_eq!(ids[1], &[101, 1, 2, 0, 0, 0, 0, 0]);
        Ok(())
    }

    #[rstest]
    fn test_shuffle_is_seeded(preference_dataset: Result<PreferenceDataset>) -> Result<()> {
        let dataset = preference_dataset?;
        let order = |seed: u64, epoch: u64| -> Result<Vec<u32>> {
            let loader = PreferenceDataLoader::new(dataset.clone(), 2, true, false).seed(seed);
            let mut tokens = vec![];
            for batch in loader.epoch_batcher(epoch) {
                tokens.extend(first_prompt_tokens(&batch?));
            }
            Ok(tokens)
        };

        let first = order(7, 0)?;
        assert_eq!(first, order(7, 0)?);
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, &[100, 101, 102, 103, 104]);
        // epoch `e` with seed `s` shares its order with seed `s + e`
        assert_eq!(order(7, 1)?, order(8, 0)?);
        Ok(())
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 3)]
    #[case(3, 9)]
    fn test_epochs(
        preference_dataset: Result<PreferenceDataset>,
        #[case] num_epochs: usize,
        #[case] expected_batches: usize,
    ) -> Result<()> {
        let loader = PreferenceDataLoader::new(preference_dataset?, 2, true, false).seed(3);
        let batches = loader.epochs(num_epochs).collect::<Result<Vec<_>>>()?;
        assert_eq!(batches.len(), expected_batches);
        assert_eq!(batches.len(), loader.len() * num_epochs);

        // the second epoch replays `epoch_batcher(1)`
        if num_epochs > 1 {
            let mut second = vec![];
            for batch in loader.epoch_batcher(1) {
                second.extend(first_prompt_tokens(&batch?));
            }
            let replayed = batches[3..6]
                .iter()
                .flat_map(first_prompt_tokens)
                .collect::<Vec<_>>();
            assert_eq!(replayed, second);
        }
        Ok(())
    }

    #[rstest]
    fn test_empty_loader(preference_dataset: Result<PreferenceDataset>) -> Result<()> {
        let loader = PreferenceDataLoader::new(preference_dataset?, 8, false, true);
        assert!(loader.is_empty());
        assert_eq!(loader.batcher().count(), 0);
        assert!(PreferenceBatch::from_samples(vec![], &Device::Cpu).is_err());
        Ok(())
    }
}

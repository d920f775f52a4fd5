//! Experiment configuration
//!
//! The sections mirror the studio's problem-type configuration for preference
//! optimization: where the conversation table lives and how its columns map
//! onto turns, how text is tokenized and truncated, and which preference loss
//! drives training. Every field has a default, so a config file only needs to
//! name what differs.

use crate::losses::LossFunction;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, File},
    io::Write,
    path::{Path, PathBuf},
};

/// Column mapping and text assembly options for the conversation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub train_dataframe: PathBuf,
    pub validation_dataframe: Option<PathBuf>,
    /// Columns joined with a newline to form the prompt of a turn.
    pub prompt_column: Vec<String>,
    pub answer_column: String,
    pub id_column: String,
    /// Column referencing the previous turn. `None` disables chaining.
    pub parent_id_column: Option<String>,
    pub chosen_response_column: String,
    pub rejected_response_column: String,
    /// Prepended to every prompt. Escapes such as `\n` are honoured.
    pub text_prompt_start: String,
    /// Appended to every prompt, before the answer.
    pub text_answer_separator: String,
    pub add_eos_token_to_prompt: bool,
    pub add_eos_token_to_answer: bool,
    /// Only use chain leaves as samples, so each sample carries its entire
    /// conversation. Required for preference training.
    pub limit_chained_samples: bool,
    pub mask_prompt_labels: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            train_dataframe: PathBuf::from("data/train.parquet"),
            validation_dataframe: None,
            prompt_column: vec!["instruction".to_string()],
            answer_column: "output".to_string(),
            id_column: "id".to_string(),
            parent_id_column: Some("parent_id".to_string()),
            chosen_response_column: "chosen_response".to_string(),
            rejected_response_column: "rejected_response".to_string(),
            text_prompt_start: "<|prompt|>".to_string(),
            text_answer_separator: "<|answer|>".to_string(),
            add_eos_token_to_prompt: true,
            add_eos_token_to_answer: true,
            limit_chained_samples: true,
            mask_prompt_labels: false,
        }
    }
}

/// Sequence length budgets, all counted in tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub max_length: usize,
    pub max_length_prompt: usize,
    pub max_length_answer: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            max_length: 512,
            max_length_prompt: 256,
            max_length_answer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub loss_function: LossFunction,
    /// Temperature of the preference loss.
    pub beta: f64,
    pub label_smoothing: f64,
    /// Score sequences by their mean token log-probability instead of the sum.
    pub average_log_prob: bool,
    pub batch_size: usize,
    pub epochs: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            loss_function: LossFunction::default(),
            beta: 0.2,
            label_smoothing: 0.0,
            average_log_prob: false,
            batch_size: 2,
            epochs: 1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub experiment_name: String,
    /// `gpt2`, a path to a `tokenizer.json`, or a HuggingFace Hub model id.
    pub llm_backbone: String,
    pub output_directory: PathBuf,
    pub dataset: DatasetConfig,
    pub tokenizer: TokenizerConfig,
    pub training: TrainingConfig,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            experiment_name: "dpo-experiment".to_string(),
            llm_backbone: "gpt2".to_string(),
            output_directory: PathBuf::from("output"),
            dataset: DatasetConfig::default(),
            tokenizer: TokenizerConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl StudioConfig {
    /// Reads a JSON config and validates it.
    ///
    /// The loss is resolved from its name here, so an unknown loss is reported
    /// before any data is touched.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let json_str = read_to_string(path.as_ref())
            .with_context(|| format!("Unable to read {}", path.as_ref().display()))?;
        let cfg: Self = serde_json::from_str(&json_str)
            .with_context(|| format!("Invalid config in {}", path.as_ref().display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let json_str = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Unable to create {}", path.as_ref().display()))?;
        file.write_all(json_str.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let tok = &self.tokenizer;
        if tok.max_length == 0 {
            bail!("tokenizer.max_length must be positive");
        }
        if tok.max_length_prompt == 0 || tok.max_length_prompt > tok.max_length {
            bail!(
                "tokenizer.max_length_prompt must be in 1..={}, got {}",
                tok.max_length,
                tok.max_length_prompt
            );
        }
        if tok.max_length_answer > tok.max_length
            || tok.max_length_answer <= usize::from(self.dataset.add_eos_token_to_answer)
        {
            bail!(
                "tokenizer.max_length_answer must leave room for answer tokens and fit in {}, got {}",
                tok.max_length,
                tok.max_length_answer
            );
        }
        if self.dataset.prompt_column.is_empty() {
            bail!("dataset.prompt_column needs at least one column");
        }
        let training = &self.training;
        if training.beta.is_nan() || training.beta <= 0.0 {
            bail!("training.beta must be positive, got {}", training.beta);
        }
        if !(0.0..0.5).contains(&training.label_smoothing) {
            bail!(
                "training.label_smoothing must be in [0, 0.5), got {}",
                training.label_smoothing
            );
        }
        if training.batch_size == 0 {
            bail!("training.batch_size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;
    use tempfile::tempdir;

    #[rstest]
    fn test_default_config_is_valid() -> Result<()> {
        let cfg = StudioConfig::default();
        cfg.validate()?;
        assert!(cfg.dataset.limit_chained_samples);
        assert!(!cfg.dataset.mask_prompt_labels);
        assert_eq!(cfg.training.loss_function, LossFunction::Dpo);
        Ok(())
    }

    #[rstest]
    fn test_partial_json_falls_back_to_defaults() -> Result<()> {
        let json_str = r#"{
            "llm_backbone": "gpt2",
            "tokenizer": {"max_length": 128, "max_length_prompt": 64, "max_length_answer": 64},
            "training": {"loss_function": "IPOLoss", "beta": 0.1}
        }"#;
        let cfg: StudioConfig = serde_json::from_str(json_str)?;
        cfg.validate()?;

        assert_eq!(cfg.tokenizer.max_length, 128);
        assert_eq!(cfg.training.loss_function, LossFunction::Ipo);
        assert_eq!(cfg.training.batch_size, TrainingConfig::default().batch_size);
        assert_eq!(cfg.dataset, DatasetConfig::default());
        Ok(())
    }

    #[rstest]
    fn test_unknown_loss_is_rejected_at_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{"training": {"loss_function": "FocalLoss"}}"#)?;

        assert!(StudioConfig::from_json_file(&path).is_err());
        Ok(())
    }

    #[rstest]
    fn test_save_and_reload() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cfg.json");
        let mut cfg = StudioConfig::default();
        cfg.training.loss_function = LossFunction::KtoPair;
        cfg.dataset.parent_id_column = None;
        cfg.save_json(&path)?;

        assert_eq!(StudioConfig::from_json_file(&path)?, cfg);
        Ok(())
    }

    #[rstest]
    #[case::answer_too_short(|c: &mut StudioConfig| c.tokenizer.max_length_answer = 1)]
    #[case::prompt_too_long(|c: &mut StudioConfig| c.tokenizer.max_length_prompt = 1024)]
    #[case::zero_beta(|c: &mut StudioConfig| c.training.beta = 0.0)]
    #[case::smoothing(|c: &mut StudioConfig| c.training.label_smoothing = 0.5)]
    #[case::batch_size(|c: &mut StudioConfig| c.training.batch_size = 0)]
    fn test_validate_rejects(#[case] edit: fn(&mut StudioConfig)) {
        let mut cfg = StudioConfig::default();
        edit(&mut cfg);
        assert!(cfg.validate().is_err());
    }
}

//! Inspection of conversations and batches
//!
//! Frames are in long format with columns `Sample Number`, `Field` and
//! `Content`, one row per displayed field.

use crate::datasets::loader::PreferenceBatch;
use crate::datasets::preference::{PreferenceDataset, ValidationOutput};
use crate::datasets::IGNORE_INDEX;
use crate::tokenizer::TextTokenizer;
use anyhow::bail;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use polars::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;

/// Number of conversations shown by default.
pub const NUM_TEXTS: usize = 20;

const TEXT_SEPARATOR: &str = "TEXT SEPARATOR";

const NO_PREDICTIONS: &str = "No predictions are generated for the selected metric";

#[derive(Default)]
struct LongFrame {
    sample_numbers: Vec<u32>,
    fields: Vec<String>,
    contents: Vec<String>,
}

impl LongFrame {
    fn push(&mut self, sample_number: usize, field: &str, content: String) {
        self.sample_numbers.push(sample_number as u32);
        self.fields.push(field.to_string());
        self.contents.push(content);
    }

    fn finish(self) -> PolarsResult<DataFrame> {
        df!(
            "Sample Number" => self.sample_numbers,
            "Field" => self.fields,
            "Content" => self.contents,
        )
    }
}

/// `amount` distinct indices below `length` drawn with a seeded rng, in
/// ascending order. All indices when `amount >= length`.
pub fn sample_indices(length: usize, amount: usize, seed: u64) -> Vec<usize> {
    if amount >= length {
        return (0..length).collect();
    }
    let mut indices = rand::seq::index::sample(&mut StdRng::seed_from_u64(seed), length, amount).into_vec();
    indices.sort_unstable();
    indices
}

/// The turns of `num_samples` randomly drawn conversations (all of them for
/// `None`) followed by their chosen and rejected responses.
pub fn conversation_frame(
    dataset: &PreferenceDataset,
    num_samples: Option<usize>,
    seed: u64,
) -> anyhow::Result<DataFrame> {
    let base = dataset.base();
    let indices = sample_indices(dataset.len(), num_samples.unwrap_or(dataset.len()), seed);
    let mut frame = LongFrame::default();
    for index in indices {
        let text = base.chained_prompt_text(index, TEXT_SEPARATOR)?;
        for (turn, part) in text.split(TEXT_SEPARATOR).enumerate() {
            let field = if turn % 2 == 0 {
                "Input Text - Prompt"
            } else {
                "Input Text - Answer"
            };
            frame.push(index, field, part.to_string());
        }
        let row = base.row_index(index)?;
        frame.push(index, "Chosen Response", dataset.chosen_response(row).to_string());
        frame.push(index, "Rejected Response", dataset.rejected_response(row).to_string());
    }
    Ok(frame.finish()?)
}

/// Renders tokens as markdown with labeled runs in bold and runs of the pad
/// token collapsed, e.g. `the **answer**<|pad|>x3`.
pub fn tokens_to_markdown(tokens: &[String], labeled: &[bool], pad_token: &str) -> String {
    let mut out = String::new();
    let mut pos = 0;
    while pos < tokens.len() {
        let is_labeled = labeled.get(pos).copied().unwrap_or(false);
        let is_pad = tokens[pos] == pad_token;
        let mut end = pos + 1;
        while end < tokens.len()
            && labeled.get(end).copied().unwrap_or(false) == is_labeled
            && (tokens[end] == pad_token) == is_pad
        {
            end += 1;
        }
        let run = if is_pad {
            match end - pos {
                1 => pad_token.to_string(),
                n => format!("{pad_token}x{n}"),
            }
        } else {
            tokens[pos..end].concat()
        };
        if is_labeled {
            out.push_str(&format!("**{run}**"));
        } else {
            out.push_str(&run);
        }
        pos = end;
    }
    out
}

fn decode_labels(tokenizer: &dyn TextTokenizer, labels: &[i64]) -> anyhow::Result<String> {
    let ids = labels
        .iter()
        .filter(|label| **label != IGNORE_INDEX)
        .map(|label| *label as u32)
        .collect::<Vec<_>>();
    tokenizer.decode_ids(&ids, true)
}

/// Prompt, answers and tokenized branches of every sample in `batch`.
pub fn batch_frame(batch: &PreferenceBatch, tokenizer: &dyn TextTokenizer) -> anyhow::Result<DataFrame> {
    let pad_token = tokenizer.pad_token();
    let mut frame = LongFrame::default();
    for (index, sample) in batch.samples().iter().enumerate() {
        let prompt_ids = sample.attended_prompt_input_ids();
        frame.push(index, "Prompt Text", tokenizer.decode_ids(&prompt_ids, true)?);
        for (name, seq) in [("Chosen", &sample.chosen), ("Rejected", &sample.rejected)] {
            frame.push(
                index,
                &format!("{name} Answer Text"),
                decode_labels(tokenizer, &seq.labels)?,
            );
            let tokens = tokenizer.convert_ids_to_tokens(&seq.input_ids);
            let labeled = seq
                .labels
                .iter()
                .map(|label| *label != IGNORE_INDEX)
                .collect::<Vec<_>>();
            frame.push(
                index,
                &format!("{name} Tokenized Text"),
                tokens_to_markdown(&tokens, &labeled, &pad_token),
            );
        }
    }
    Ok(frame.finish()?)
}

/// One row per validation sample with its chained input, target and predicted
/// text, plus a `Metric (<name>)` column rounded to three decimals when
/// scores are attached.
pub fn validation_frame(dataset: &PreferenceDataset, output: &ValidationOutput) -> anyhow::Result<DataFrame> {
    let num_samples = dataset.len();
    if output.target_text.len() != num_samples {
        bail!(
            "Got {} targets for {} validation samples",
            output.target_text.len(),
            num_samples
        );
    }
    let input_text = (0..num_samples)
        .map(|index| dataset.base().chained_prompt_text(index, ""))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let predicted_text = if output.predicted_text.is_empty() {
        vec![NO_PREDICTIONS.to_string(); num_samples]
    } else {
        output.predicted_text.clone()
    };

    let mut df = df!(
        "Input Text" => input_text,
        "Target Text" => output.target_text.clone(),
        "Predicted Text" => predicted_text,
    )?;
    if let Some((name, values)) = &output.metric {
        let rounded = values
            .iter()
            .map(|value| (value * 1000.0).round() / 1000.0)
            .collect::<Vec<_>>();
        df.with_column(Series::new(format!("Metric ({name})").into(), rounded))?;
    }
    Ok(df)
}

pub fn write_parquet<P: AsRef<Path>>(df: &mut DataFrame, fname: P) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(fname)?;
    ParquetWriter::new(&mut file).finish(df)?;
    Ok(())
}

/// A printable table with every value of `df` rendered as a string.
pub fn frame_to_table(df: &DataFrame) -> anyhow::Result<Table> {
    let columns = df
        .get_columns()
        .iter()
        .map(|column| column.as_materialized_series().cast(&DataType::String))
        .collect::<PolarsResult<Vec<_>>>()?;
    let values = columns
        .iter()
        .map(|series| series.str())
        .collect::<PolarsResult<Vec<_>>>()?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(df.get_column_names().iter().map(|name| name.to_string()));
    for row in 0..df.height() {
        table.add_row(
            values
                .iter()
                .map(|ca| ca.get(row).unwrap_or_default().to_string()),
        );
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatasetConfig, TokenizerConfig};
    use crate::datasets::conversation::{ConversationDataset, ConversationRecord, ConversationTable};
    use crate::datasets::loader::PreferenceDataLoader;
    use crate::datasets::preference::BatchPredictions;
    use crate::tokenizer::testing::NumericTokenizer;
    use anyhow::Result;
    use rstest::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[fixture]
    pub fn preference_dataset() -> Result<PreferenceDataset> {
        let records = vec![
            ConversationRecord::new("1 2", "3", "a", None),
            ConversationRecord::new("4", "", "b", Some("a")).with_responses("5 6", "7"),
        ];
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
            Arc::new(NumericTokenizer::new(9, 0)),
            &dataset_cfg,
            &tokenizer_cfg,
        );
        PreferenceDataset::new(base)
    }

    fn column_strings(df: &DataFrame, name: &str) -> Result<Vec<String>> {
        Ok(df
            .column(name)?
            .str()?
            .into_iter()
            .map(|value| value.unwrap_or_default().to_string())
            .collect())
    }

    #[rstest]
    fn test_conversation_frame(preference_dataset: Result<PreferenceDataset>) -> Result<()> {
        let df = conversation_frame(&preference_dataset?, None, 42)?;

        assert_eq!(
            column_strings(&df, "Field")?,
            &[
                "Input Text - Prompt",
                "Input Text - Answer",
                "Input Text - Prompt",
                "Chosen Response",
                "Rejected Response"
            ]
        );
        assert_eq!(column_strings(&df, "Content")?, &["1 2", "3", "4", "5 6", "7"]);
        Ok(())
    }

    #[rstest]
    #[case(5, 2)]
    #[case(20, 20)]
    #[case(3, 10)]
    #[case(0, 4)]
    fn test_sample_indices(#[case] length: usize, #[case] amount: usize) {
        let indices = sample_indices(length, amount, 7);
        assert_eq!(indices.len(), amount.min(length));
        assert!(indices.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(indices.iter().all(|index| *index < length));
        assert_eq!(indices, sample_indices(length, amount, 7));
    }

    #[rstest]
    fn test_conversation_frame_without_samples(preference_dataset: Result<PreferenceDataset>) -> Result<()> {
        let df = conversation_frame(&preference_dataset?, Some(0), 42)?;
        assert_eq!(df.height(), 0);
        Ok(())
    }

    #[rstest]
    fn test_validation_frame(preference_dataset: Result<PreferenceDataset>) -> Result<()> {
        let dataset = preference_dataset?;
        let output = dataset.postprocess_output(BatchPredictions::default())?;
        let df = validation_frame(&dataset, &output)?;

        let names = df
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, &["Input Text", "Target Text", "Predicted Text"]);
        assert_eq!(column_strings(&df, "Input Text")?, &["1 234"]);
        assert_eq!(column_strings(&df, "Target Text")?, &["5 6"]);
        assert_eq!(column_strings(&df, "Predicted Text")?, &[NO_PREDICTIONS]);

        let predictions = BatchPredictions {
            input_text: vec!["1 2 3 4".to_string()],
            predicted_text: vec!["5 7".to_string()],
        };
        let output = dataset
            .postprocess_output(predictions)?
            .with_metric("BLEU", vec![0.123456])?;
        let mut df = validation_frame(&dataset, &output)?;
        assert_eq!(column_strings(&df, "Predicted Text")?, &["5 7"]);
        let metric = df.column("Metric (BLEU)")?.f64()?.get(0);
        assert_eq!(metric, Some(0.123));

        let dir = tempdir()?;
        let path = dir.path().join("validation_viz.parquet");
        write_parquet(&mut df, &path)?;
        let mut file = std::fs::File::open(&path)?;
        assert!(ParquetReader::new(&mut file).finish()?.equals(&df));
        Ok(())
    }

    #[rstest]
    fn test_validation_frame_rejects_misaligned_targets(
        preference_dataset: Result<PreferenceDataset>,
    ) -> Result<()> {
        let dataset = preference_dataset?;
        let output = ValidationOutput {
            target_text: vec!["5 6".to_string(), "7".to_string()],
            ..Default::default()
        };
        assert!(validation_frame(&dataset, &output).is_err());
        Ok(())
    }

    #[rstest]
    #[case(&["a", "b", "c"], &[false, true, true], "a**bc**")]
    #[case(&["a", "<pad>", "<pad>", "<pad>"], &[true, false, false, false], "**a**<pad>x3")]
    #[case(&["<pad>", "a"], &[false, false], "<pad>a")]
    #[case(&[], &[], "")]
    fn test_tokens_to_markdown(
        #[case] tokens: &[&str],
        #[case] labeled: &[bool],
        #[case] expected: &str,
    ) {
        let tokens = tokens.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        assert_eq!(tokens_to_markdown(&tokens, labeled, "<pad>"), expected);
    }

    #[rstest]
    fn test_batch_frame_and_table(preference_dataset: Result<PreferenceDataset>) -> Result<()> {
        let loader = PreferenceDataLoader::new(preference_dataset?, 1, false, false);
        let batch = loader.batcher().next().ok_or_else(|| anyhow::anyhow!("no batch"))??;
        let mut df = batch_frame(&batch, &NumericTokenizer::new(9, 0))?;

        assert_eq!(df.height(), 5);
        let contents = column_strings(&df, "Content")?;
        // special tokens are skipped when decoding
        assert_eq!(contents[0], "1 2 3 4");
        assert_eq!(contents[1], "5 6");
        assert_eq!(contents[2], "12304**560**");
        assert_eq!(contents[3], "7");
        assert_eq!(contents[4], "12304**70**9");

        let table = frame_to_table(&df)?;
        assert_eq!(table.row_iter().count(), 5);
        assert!(table.to_string().contains("Chosen Answer Text"));

        let dir = tempdir()?;
        let path = dir.path().join("batch_viz.parquet");
        write_parquet(&mut df, &path)?;
        let mut file = std::fs::File::open(&path)?;
        assert!(ParquetReader::new(&mut file).finish()?.equals(&df));
        Ok(())
    }
}

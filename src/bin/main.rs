use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use llm_studio_rs::{
    config::StudioConfig,
    datasets::{
        conversation::{download_table, ConversationDataset, ConversationTable},
        loader::PreferenceDataLoader,
        preference::{BatchPredictions, PreferenceDataset},
    },
    inspect::{
        batch_frame, conversation_frame, frame_to_table, validation_frame, write_parquet, NUM_TEXTS,
    },
    tokenizer::load_tokenizer,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// CLI
#[derive(Debug, Parser)]
#[command(name = "llm-studio-rs")]
#[command(about = "A CLI for preparing and inspecting preference (DPO) training data.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate a config file
    Validate {
        /// Path to the JSON config
        config: PathBuf,
    },
    /// Show randomly drawn conversations of the train table
    Data {
        config: PathBuf,
        /// Number of conversations to show
        #[arg(short, long, default_value_t = NUM_TEXTS)]
        num_samples: usize,
        /// Also write them to `data_viz.parquet` next to the train table
        #[arg(long)]
        save: bool,
    },
    /// Show the first training batch
    Batch {
        config: PathBuf,
        /// Also write the batch to `<output_directory>/batch_viz.parquet`
        #[arg(long)]
        save: bool,
    },
    /// Show the validation table with its target texts
    Validation {
        config: PathBuf,
        /// Also write it to `<output_directory>/validation_viz.parquet`
        #[arg(long)]
        save: bool,
    },
    /// Build every batch of every configured epoch
    Scan {
        config: PathBuf,
    },
    /// Download a table to the configured train path
    Fetch {
        config: PathBuf,
        url: String,
    },
}

fn load_dataset<P: AsRef<Path>>(cfg: &StudioConfig, path: P) -> anyhow::Result<PreferenceDataset> {
    let table = ConversationTable::read(path, &cfg.dataset)?;
    let tokenizer = load_tokenizer(&cfg.llm_backbone)
        .with_context(|| format!("Unable to load tokenizer for `{}`", cfg.llm_backbone))?;
    let base = ConversationDataset::new(table, tokenizer, &cfg.dataset, &cfg.tokenizer);
    PreferenceDataset::new(base)
}

fn save_frame(df: &mut polars::prelude::DataFrame, path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    write_parquet(df, path)?;
    tracing::info!("Wrote {}", path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            let cfg = StudioConfig::from_json_file(&config)?;
            tracing::info!(
                "{} is valid for {}: {} with beta {}",
                config.display(),
                cfg.experiment_name,
                cfg.training.loss_function,
                cfg.training.beta
            );
        }
        Commands::Data {
            config,
            num_samples,
            save,
        } => {
            let cfg = StudioConfig::from_json_file(&config)?;
            let dataset = load_dataset(&cfg, &cfg.dataset.train_dataframe)?;
            let mut df = conversation_frame(&dataset, Some(num_samples), cfg.training.seed)?;
            println!("{}", frame_to_table(&df)?);
            if save {
                let path = cfg
                    .dataset
                    .train_dataframe
                    .with_file_name("data_viz.parquet");
                save_frame(&mut df, &path)?;
            }
        }
        Commands::Batch { config, save } => {
            let cfg = StudioConfig::from_json_file(&config)?;
            let dataset = load_dataset(&cfg, &cfg.dataset.train_dataframe)?;
            let tokenizer = dataset.base().tokenizer();
            let loader =
                PreferenceDataLoader::new(dataset.clone(), cfg.training.batch_size, true, false)
                    .seed(cfg.training.seed);
            let batch = loader
                .batcher()
                .next()
                .context("The train table has no preference samples")??;
            let mut df = batch_frame(&batch, tokenizer)?;
            println!("{}", frame_to_table(&df)?);
            if save {
                save_frame(&mut df, &cfg.output_directory.join("batch_viz.parquet"))?;
            }
        }
        Commands::Validation { config, save } => {
            let cfg = StudioConfig::from_json_file(&config)?;
            let path = cfg
                .dataset
                .validation_dataframe
                .as_ref()
                .ok_or_else(|| anyhow!("No dataset.validation_dataframe configured"))?;
            let dataset = load_dataset(&cfg, path)?;
            let output = dataset.postprocess_output(BatchPredictions::default())?;
            let mut df = validation_frame(&dataset, &output)?;
            println!("{}", frame_to_table(&df)?);
            if save {
                save_frame(&mut df, &cfg.output_directory.join("validation_viz.parquet"))?;
            }
        }
        Commands::Scan { config } => {
            let cfg = StudioConfig::from_json_file(&config)?;
            let dataset = load_dataset(&cfg, &cfg.dataset.train_dataframe)?;
            let loader = PreferenceDataLoader::new(dataset, cfg.training.batch_size, true, false)
                .seed(cfg.training.seed);
            let mut num_batches = 0_usize;
            let mut num_pairs = 0_usize;
            for batch in loader.epochs(cfg.training.epochs) {
                num_pairs += batch?.batch_size();
                num_batches += 1;
            }
            tracing::info!(
                "{}: {} batches ({} pairs) over {} epochs",
                cfg.experiment_name,
                num_batches,
                num_pairs,
                cfg.training.epochs
            );
        }
        Commands::Fetch { config, url } => {
            let cfg = StudioConfig::from_json_file(&config)?;
            download_table(&url, &cfg.dataset.train_dataframe)?;
        }
    }
    Ok(())
}

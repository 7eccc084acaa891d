use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nli_tune::cli;
use nli_tune::config::{TrainOverrides, DEFAULT_DATASET};
use nli_tune::training::DevicePreference;

#[derive(Parser)]
#[command(name = "nli-tune")]
#[command(about = "Fine-tune sentence-embedding models on NLI entailment pairs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a sentence-embedding model with the ranking loss
    Train {
        /// TOML training config (CLI flags take precedence)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: TrainOverrides,
    },

    /// Download a dataset split and write its entailment pairs as JSONL
    Prepare {
        /// Output JSONL file
        #[arg(short, long)]
        output: PathBuf,

        /// HuggingFace dataset repository
        #[arg(long, default_value = DEFAULT_DATASET)]
        dataset: String,

        /// Dataset split
        #[arg(long, default_value = "train")]
        split: String,

        /// Local NLI file (parquet, JSONL or CSV) instead of the Hub dataset
        #[arg(short, long)]
        data: Option<PathBuf>,
    },

    /// Rank candidate sentences by cosine similarity to a query
    Similarity {
        /// Model directory or HuggingFace model ID
        #[arg(short, long)]
        model: String,

        /// Query text
        #[arg(short, long)]
        query: String,

        /// Candidate sentences
        #[arg(short, long, num_args = 1.., required = true)]
        candidates: Vec<String>,

        /// Device: auto, cpu, cuda, or metal
        #[arg(long, default_value = "auto")]
        device: DevicePreference,
    },

    /// List compute devices
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nli_tune=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { config, overrides } => {
            cli::train(config, overrides).await?;
        }

        Commands::Prepare {
            output,
            dataset,
            split,
            data,
        } => {
            cli::prepare(output, dataset, split, data).await?;
        }

        Commands::Similarity {
            model,
            query,
            candidates,
            device,
        } => {
            cli::similarity(model, query, candidates, device).await?;
        }

        Commands::Devices => {
            cli::devices().await?;
        }
    }

    Ok(())
}

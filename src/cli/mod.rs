//! Command-line interface
//!
//! Provides CLI commands for train, prepare, similarity and devices.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{TrainConfig, TrainOverrides};
use crate::training::dataset::{write_pairs_jsonl, DataSource, PairExample};
use crate::training::device::{available_devices, select_device, DevicePreference};
use crate::training::evaluation::PairRetrievalEvaluator;
use crate::training::hub::HubApi;
use crate::training::loss::MultipleNegativesRankingLoss;
use crate::training::models::{cosine_similarity, EmbeddingModel, ModelOptions, SentenceTransformer};
use crate::training::trainer::{Trainer, TrainingResult};
use crate::training::PairDataLoader;

/// Execute the train command
pub async fn train(config_path: Option<PathBuf>, overrides: TrainOverrides) -> Result<()> {
    let config = TrainConfig::resolve(config_path.as_deref(), &overrides)?;

    tracing::info!("Starting NLI fine-tuning");
    tracing::info!("  Model: {}", config.model);
    tracing::info!("  Data: {}", config.train_source());
    tracing::info!("  Output: {}", config.output_dir.display());
    tracing::info!("  Device: {}", config.device);

    let stop = Arc::new(AtomicBool::new(false));
    let ctrl_c = {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl-C received, stopping after the current batch");
                stop.store(true, Ordering::SeqCst);
            }
        })
    };

    let result = tokio::task::spawn_blocking(move || run_training(&config, stop))
        .await
        .context("Training task failed")?;
    ctrl_c.abort();
    let result = result?;

    println!("\nTraining Summary:");
    println!("  Steps: {}", result.metrics.global_step);
    println!("  Final loss: {:.4}", result.metrics.train_loss);
    if let Some(eval) = result.evaluations.last() {
        println!("  Evaluation: {}", eval);
    }
    if result.interrupted {
        println!("  Interrupted: yes");
    }
    println!("  Model saved to: {}", result.output_dir.display());

    Ok(())
}

/// Run the full pipeline: model, data, loader, loss, training loop, save
pub fn run_training(config: &TrainConfig, stop: Arc<AtomicBool>) -> Result<TrainingResult> {
    let device = select_device(config.device)?;

    let train_source = config.train_source();
    let eval_source = config.eval_source();
    let needs_hub = matches!(train_source, DataSource::Hub { .. })
        || matches!(eval_source, Some(DataSource::Hub { .. }));
    let hub = if needs_hub { Some(HubApi::new()?) } else { None };

    let model = SentenceTransformer::load(&config.model, &config.model_options(), &device)?;
    tracing::info!("Model has {} trainable parameters", model.num_parameters());

    let train_pairs = load_pairs(&train_source, hub.as_ref(), config.max_train_examples)?;
    if train_pairs.is_empty() {
        bail!("No entailment pairs found in {}", train_source);
    }

    let evaluator = match &eval_source {
        Some(source) => {
            let pairs = load_pairs(source, hub.as_ref(), config.max_eval_examples)?;
            Some(PairRetrievalEvaluator::new(&pairs, config.batch_size)?)
        }
        None => None,
    };

    let mut loader = PairDataLoader::new(train_pairs, config.loader_config())?;
    let loss = MultipleNegativesRankingLoss::new(config.loss_config());
    let mut trainer = Trainer::new(config.training_config()).with_stop_flag(stop);

    trainer.fit(&model, &mut loader, &loss, evaluator.as_ref())
}

fn load_pairs(
    source: &DataSource,
    hub: Option<&HubApi>,
    limit: Option<usize>,
) -> Result<Vec<PairExample>> {
    let (mut pairs, _) = source.load_pairs(hub)?;
    if let Some(limit) = limit {
        if pairs.len() > limit {
            tracing::info!("Using the first {} of {} pairs from {}", limit, pairs.len(), source);
            pairs.truncate(limit);
        }
    }
    Ok(pairs)
}

/// Execute the prepare command
pub async fn prepare(
    output: PathBuf,
    dataset: String,
    split: String,
    data: Option<PathBuf>,
) -> Result<()> {
    let source = match data {
        Some(path) => DataSource::Local(path),
        None => DataSource::Hub {
            repo: dataset,
            split,
        },
    };
    tracing::info!("Preparing entailment pairs from {}", source);

    let hub = match source {
        DataSource::Hub { .. } => Some(HubApi::new()?),
        DataSource::Local(_) => None,
    };
    let (pairs, stats) = source.load_pairs(hub.as_ref())?;
    write_pairs_jsonl(&output, &pairs)?;

    println!("\nPrepare Summary:");
    if let Some(stats) = stats {
        println!("  {}", stats);
    }
    println!("  Pairs written: {}", pairs.len());
    println!("  Output file: {}", output.display());

    Ok(())
}

/// Execute the similarity command
pub async fn similarity(
    model: String,
    query: String,
    candidates: Vec<String>,
    device: DevicePreference,
) -> Result<()> {
    if candidates.is_empty() {
        bail!("At least one candidate is required");
    }

    let device = select_device(device)?;
    let model = SentenceTransformer::load(&model, &ModelOptions::default(), &device)?;

    let query_embedding = model.encode(std::slice::from_ref(&query))?.detach();
    let candidate_embeddings = model.encode(&candidates)?.detach();
    let scores: Vec<Vec<f32>> =
        cosine_similarity(&query_embedding, &candidate_embeddings)?.to_vec2()?;

    let mut ranked: Vec<(usize, f32)> = scores
        .first()
        .map(|row| row.iter().copied().enumerate().collect())
        .unwrap_or_default();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    println!("\nQuery: {}", query);
    println!("Found {} candidates:\n", ranked.len());
    for (rank, (idx, score)) in ranked.iter().enumerate() {
        println!("Rank {}: {:.4}  {}", rank + 1, score, candidates[*idx]);
    }

    Ok(())
}

/// Execute the devices command
pub async fn devices() -> Result<()> {
    println!("Available devices:");
    for (name, available, note) in available_devices() {
        let status = if available { "available" } else { "unavailable" };
        if note.is_empty() {
            println!("  {:<6} {}", name, status);
        } else {
            println!("  {:<6} {} ({})", name, status, note);
        }
    }
    Ok(())
}

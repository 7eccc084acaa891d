//! Training loop for fine-tuning sentence-embedding models
//!
//! One optimizer step per batch:
//! 1. embed anchors and positives
//! 2. ranking loss + backward
//! 3. clip gradients, set the scheduled learning rate, AdamW step
//!
//! Checkpoints, per-epoch evaluation and the final save all go through
//! [`EmbeddingModel::save`].

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::checkpoint::{checkpoint_dir, rotate_checkpoints, TrainingSummary, CHECKPOINTS_DIR};
use super::dataset::{PairDataLoader, PairExample};
use super::evaluation::{PairRetrievalEvaluator, RetrievalMetrics};
use super::loss::MultipleNegativesRankingLoss;
use super::models::EmbeddingModel;
use super::optimizer::{warmup_steps_for, AdamW, AdamWConfig, LearningRateScheduler, SchedulerKind};

/// Training configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub num_epochs: usize,
    /// Peak learning rate
    pub learning_rate: f64,
    /// Warm-up length as a fraction of total steps
    pub warmup_ratio: f64,
    /// Explicit warm-up steps, overrides `warmup_ratio`
    pub warmup_steps: Option<usize>,
    pub weight_decay: f64,
    /// Maximum gradient norm for clipping (0 disables clipping)
    pub max_grad_norm: f64,
    pub scheduler: SchedulerKind,
    /// Log every N steps
    pub logging_steps: usize,
    /// Save a checkpoint every N steps (0 to disable)
    pub checkpoint_steps: usize,
    /// Keep at most this many checkpoints
    pub checkpoint_save_total_limit: Option<usize>,
    pub output_dir: PathBuf,
    pub show_progress_bar: bool,
    /// Recorded in the training summary
    pub model_name: String,
    /// Recorded in the training summary
    pub dataset_name: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 1,
            learning_rate: 2e-5,
            warmup_ratio: 0.1,
            warmup_steps: None,
            weight_decay: 0.01,
            max_grad_norm: 1.0,
            scheduler: SchedulerKind::WarmupLinear,
            logging_steps: 100,
            checkpoint_steps: 0,
            checkpoint_save_total_limit: None,
            output_dir: PathBuf::from("./output"),
            show_progress_bar: true,
            model_name: String::new(),
            dataset_name: String::new(),
        }
    }
}

/// Training metrics
#[derive(Debug, Clone, Default)]
pub struct TrainingMetrics {
    /// Mean loss since the last log line
    pub train_loss: f64,
    /// Number of optimizer steps taken
    pub global_step: usize,
    /// Current epoch (1-based)
    pub epoch: usize,
    /// Pairs per second over the last step
    pub samples_per_second: f64,
    /// Learning rate used for the last step
    pub learning_rate: f64,
    /// Gradient norm before clipping, last step
    pub grad_norm: f64,
}

impl std::fmt::Display for TrainingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Step {} | Epoch {} | Loss: {:.4} | LR: {:.2e} | Grad norm: {:.3} | {:.1} samples/s",
            self.global_step,
            self.epoch,
            self.train_loss,
            self.learning_rate,
            self.grad_norm,
            self.samples_per_second
        )
    }
}

/// Training result
#[derive(Debug)]
pub struct TrainingResult {
    /// Final metrics
    pub metrics: TrainingMetrics,
    /// Loss per step
    pub history: Vec<f64>,
    /// Evaluation results, one per completed epoch
    pub evaluations: Vec<RetrievalMetrics>,
    /// Stopped early on request
    pub interrupted: bool,
    /// Directory holding the saved model
    pub output_dir: PathBuf,
}

/// Trainer for fine-tuning embedding models
pub struct Trainer {
    config: TrainingConfig,
    stop: Arc<AtomicBool>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a flag that stops training between batches when set
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Create optimizer over the model's parameters
    pub fn create_optimizer(&self, model: &dyn EmbeddingModel) -> Result<AdamW> {
        let config = AdamWConfig {
            lr: self.config.learning_rate,
            weight_decay: self.config.weight_decay,
            ..Default::default()
        };
        AdamW::new(model.trainable_vars(), config)
    }

    /// Create learning rate scheduler for a run of `total_steps` optimizer steps
    pub fn create_scheduler(&self, total_steps: usize) -> LearningRateScheduler {
        let warmup_steps = self
            .config
            .warmup_steps
            .unwrap_or_else(|| warmup_steps_for(total_steps, self.config.warmup_ratio));
        LearningRateScheduler::new(
            self.config.scheduler,
            self.config.learning_rate,
            warmup_steps,
            total_steps,
        )
    }

    fn progress_bar(&self, total_steps: usize) -> ProgressBar {
        if !self.config.show_progress_bar {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb
    }

    /// Train the model on batches from `loader`
    ///
    /// The model is saved to `output_dir` at the end, including after a stop
    /// request.
    pub fn fit(
        &mut self,
        model: &dyn EmbeddingModel,
        loader: &mut PairDataLoader,
        loss_fn: &MultipleNegativesRankingLoss,
        evaluator: Option<&PairRetrievalEvaluator>,
    ) -> Result<TrainingResult> {
        if self.config.num_epochs == 0 {
            bail!("num_epochs must be greater than 0");
        }
        let epoch_steps = loader.plan_epochs(self.config.num_epochs);
        let total_steps: usize = epoch_steps.iter().sum();
        if total_steps == 0 {
            bail!(
                "No training batches: {} pairs with batch size {}",
                loader.num_pairs(),
                loader.batch_size()
            );
        }
        let steps_per_epoch = epoch_steps.first().copied().unwrap_or(0);
        if epoch_steps.iter().any(|&n| n != steps_per_epoch) {
            tracing::debug!("Batches per epoch vary: {:?}", epoch_steps);
        }

        let mut optimizer = self.create_optimizer(model)?;
        let mut scheduler = self.create_scheduler(total_steps);
        let logging_steps = self.config.logging_steps.max(1);

        tracing::info!("Starting training:");
        tracing::info!("  Pairs: {}", loader.num_pairs());
        tracing::info!("  Batch size: {}", loader.batch_size());
        tracing::info!("  Epochs: {}", self.config.num_epochs);
        tracing::info!("  Steps per epoch: {}", steps_per_epoch);
        tracing::info!("  Total optimization steps: {}", total_steps);
        tracing::info!("  Warmup steps: {}", scheduler.warmup_steps());
        tracing::info!("  Learning rate: {} ({:?})", self.config.learning_rate, self.config.scheduler);
        tracing::info!("  Loss scale: {}", loss_fn.scale());
        tracing::info!("  Max gradient norm: {}", self.config.max_grad_norm);

        std::fs::create_dir_all(&self.config.output_dir)?;

        let start = Instant::now();
        let pb = self.progress_bar(total_steps);
        let mut metrics = TrainingMetrics::default();
        let mut history = Vec::with_capacity(total_steps);
        let mut evaluations = Vec::new();
        let mut interrupted = false;
        let mut logged_loss = 0.0;
        let mut logged_steps = 0usize;

        'epochs: for epoch in 0..self.config.num_epochs {
            metrics.epoch = epoch + 1;
            let epoch_start = Instant::now();
            let mut epoch_loss = 0.0;
            let mut epoch_steps = 0usize;

            for batch in loader.epoch() {
                if self.stop.load(Ordering::SeqCst) {
                    interrupted = true;
                    break 'epochs;
                }
                let step_start = Instant::now();

                let loss = self.compute_batch_loss(model, &batch, loss_fn)?;
                let loss_value = loss.to_scalar::<f32>()? as f64;
                let mut grads = loss.backward()?;

                let lr = scheduler.get_lr();
                optimizer.set_learning_rate(lr);
                let grad_norm =
                    optimizer.step_with_clipping(&mut grads, self.config.max_grad_norm)?;
                scheduler.step();

                if self.config.max_grad_norm > 0.0 && grad_norm > self.config.max_grad_norm {
                    tracing::debug!(
                        "Step {}: gradient norm {:.4} clipped to {:.4}",
                        metrics.global_step,
                        grad_norm,
                        self.config.max_grad_norm
                    );
                }

                metrics.global_step += 1;
                metrics.learning_rate = lr;
                metrics.grad_norm = grad_norm;
                metrics.samples_per_second =
                    batch.len() as f64 / step_start.elapsed().as_secs_f64().max(1e-9);

                history.push(loss_value);
                epoch_loss += loss_value;
                epoch_steps += 1;
                logged_loss += loss_value;
                logged_steps += 1;

                pb.inc(1);
                pb.set_message(format!("loss {:.4}", loss_value));

                if metrics.global_step % logging_steps == 0 {
                    metrics.train_loss = logged_loss / logged_steps as f64;
                    logged_loss = 0.0;
                    logged_steps = 0;
                    pb.suspend(|| tracing::info!("{}", metrics));
                }

                if self.config.checkpoint_steps > 0
                    && metrics.global_step % self.config.checkpoint_steps == 0
                {
                    pb.suspend(|| self.save_checkpoint(model, metrics.global_step))?;
                }
            }

            let avg_epoch_loss = if epoch_steps > 0 {
                epoch_loss / epoch_steps as f64
            } else {
                0.0
            };
            pb.suspend(|| {
                tracing::info!(
                    "Epoch {} completed in {:.1}s | Avg loss: {:.4} | Steps: {}",
                    epoch + 1,
                    epoch_start.elapsed().as_secs_f64(),
                    avg_epoch_loss,
                    epoch_steps
                )
            });

            if let Some(evaluator) = evaluator {
                let eval = pb.suspend(|| {
                    evaluator.evaluate_and_record(
                        model,
                        &self.config.output_dir,
                        epoch + 1,
                        metrics.global_step,
                    )
                })?;
                evaluations.push(eval);
            }
        }

        if logged_steps > 0 {
            metrics.train_loss = logged_loss / logged_steps as f64;
        }
        if interrupted {
            pb.abandon_with_message("interrupted");
            tracing::warn!(
                "Training stopped at step {}/{}, saving model",
                metrics.global_step,
                total_steps
            );
        } else {
            pb.finish_with_message("done");
        }

        model.save(&self.config.output_dir)?;

        let summary = TrainingSummary {
            model: self.config.model_name.clone(),
            dataset: self.config.dataset_name.clone(),
            num_pairs: loader.num_pairs(),
            batch_size: loader.batch_size(),
            epochs: self.config.num_epochs,
            steps_per_epoch,
            global_step: metrics.global_step,
            warmup_steps: scheduler.warmup_steps(),
            learning_rate: self.config.learning_rate,
            final_loss: history.last().copied(),
            elapsed_secs: start.elapsed().as_secs_f64(),
            interrupted,
        };
        summary.save(&self.config.output_dir)?;

        tracing::info!(
            "Training finished: {} steps in {:.1}s",
            metrics.global_step,
            summary.elapsed_secs
        );

        Ok(TrainingResult {
            metrics,
            history,
            evaluations,
            interrupted,
            output_dir: self.config.output_dir.clone(),
        })
    }

    /// Compute loss for a single batch
    fn compute_batch_loss(
        &self,
        model: &dyn EmbeddingModel,
        batch: &[&PairExample],
        loss_fn: &MultipleNegativesRankingLoss,
    ) -> Result<candle_core::Tensor> {
        let (anchors, positives): (Vec<String>, Vec<String>) = batch
            .iter()
            .map(|pair| (pair.anchor.clone(), pair.positive.clone()))
            .unzip();

        let anchor_embeddings = model.encode_train(&anchors)?;
        let positive_embeddings = model.encode_train(&positives)?;
        loss_fn.forward(&anchor_embeddings, &positive_embeddings)
    }

    fn save_checkpoint(&self, model: &dyn EmbeddingModel, step: usize) -> Result<()> {
        let dir = checkpoint_dir(&self.config.output_dir, step);
        model.save(&dir)?;
        tracing::info!("Saved checkpoint to {:?}", dir);

        if let Some(limit) = self.config.checkpoint_save_total_limit {
            rotate_checkpoints(&checkpoints_root(&self.config.output_dir), limit)?;
        }
        Ok(())
    }
}

fn checkpoints_root(output_dir: &Path) -> PathBuf {
    output_dir.join(CHECKPOINTS_DIR)
}

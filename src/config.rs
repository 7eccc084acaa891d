//! Training run configuration
//!
//! Values are layered: built-in defaults < optional TOML file < CLI flags.
//!
//! ```toml
//! model = "sentence-transformers/all-MiniLM-L6-v2"
//! batch_size = 32
//! epochs = 2
//! eval_split = "validation"
//! checkpoint_steps = 1000
//! checkpoint_save_total_limit = 3
//! ```

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::training::dataset::{DataSource, LoaderConfig};
use crate::training::device::DevicePreference;
use crate::training::loss::RankingLossConfig;
use crate::training::models::{ModelOptions, PoolingStrategy};
use crate::training::optimizer::SchedulerKind;
use crate::training::trainer::TrainingConfig;

pub const DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_DATASET: &str = "stanfordnlp/snli";

/// Full configuration of a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Hub model id or local model directory
    pub model: String,
    /// Hub dataset repository
    pub dataset: String,
    pub train_split: String,
    /// Split used for per-epoch evaluation; no evaluation when unset
    pub eval_split: Option<String>,
    /// Local training file, replaces the Hub download
    pub data: Option<PathBuf>,
    /// Local evaluation file, replaces `eval_split`
    pub eval_data: Option<PathBuf>,
    pub max_train_examples: Option<usize>,
    pub max_eval_examples: Option<usize>,
    pub batch_size: usize,
    pub epochs: usize,
    pub warmup_ratio: f64,
    /// Explicit warm-up length, overrides `warmup_ratio`
    pub warmup_steps: Option<usize>,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub scheduler: SchedulerKind,
    /// Similarity scale of the ranking loss
    pub scale: f64,
    /// Defaults to the model's own setting
    pub max_seq_length: Option<usize>,
    /// Defaults to the model's pooling config (mean when it has none)
    pub pooling: Option<PoolingStrategy>,
    pub shuffle: bool,
    pub seed: Option<u64>,
    pub no_duplicates: bool,
    pub output_dir: PathBuf,
    /// Save a checkpoint every N steps (0 to disable)
    pub checkpoint_steps: usize,
    pub checkpoint_save_total_limit: Option<usize>,
    pub logging_steps: usize,
    pub show_progress_bar: bool,
    pub device: DevicePreference,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            dataset: DEFAULT_DATASET.to_string(),
            train_split: "train".to_string(),
            eval_split: None,
            data: None,
            eval_data: None,
            max_train_examples: None,
            max_eval_examples: Some(1000),
            batch_size: 16,
            epochs: 1,
            warmup_ratio: 0.1,
            warmup_steps: None,
            learning_rate: 2e-5,
            weight_decay: 0.01,
            max_grad_norm: 1.0,
            scheduler: SchedulerKind::WarmupLinear,
            scale: 20.0,
            max_seq_length: None,
            pooling: None,
            shuffle: true,
            seed: None,
            no_duplicates: false,
            output_dir: PathBuf::from("./output"),
            checkpoint_steps: 0,
            checkpoint_save_total_limit: None,
            logging_steps: 100,
            show_progress_bar: true,
            device: DevicePreference::Auto,
        }
    }
}

/// CLI flags that override the config file
#[derive(Debug, Clone, Default, Args)]
pub struct TrainOverrides {
    /// Base model name or HuggingFace model ID
    #[arg(short, long)]
    pub model: Option<String>,

    /// HuggingFace dataset repository
    #[arg(long)]
    pub dataset: Option<String>,

    /// Training split
    #[arg(long)]
    pub train_split: Option<String>,

    /// Evaluation split (enables per-epoch evaluation)
    #[arg(long)]
    pub eval_split: Option<String>,

    /// Local training data (parquet, JSONL or CSV) instead of the Hub dataset
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Local evaluation data (parquet, JSONL or CSV)
    #[arg(long)]
    pub eval_data: Option<PathBuf>,

    /// Use at most N training pairs
    #[arg(long)]
    pub max_train_examples: Option<usize>,

    /// Use at most N evaluation pairs
    #[arg(long)]
    pub max_eval_examples: Option<usize>,

    /// Output directory for the trained model
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Number of epochs
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Learning rate
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Warmup ratio (fraction of total steps)
    #[arg(long)]
    pub warmup_ratio: Option<f64>,

    /// Warmup steps (overrides the ratio)
    #[arg(long)]
    pub warmup_steps: Option<usize>,

    /// Weight decay
    #[arg(long)]
    pub weight_decay: Option<f64>,

    /// Maximum gradient norm (0 disables clipping)
    #[arg(long)]
    pub max_grad_norm: Option<f64>,

    /// Scheduler: constant, warmup_constant, warmup_linear, warmup_cosine
    #[arg(long)]
    pub scheduler: Option<SchedulerKind>,

    /// Loss similarity scale
    #[arg(long)]
    pub scale: Option<f64>,

    /// Maximum sequence length
    #[arg(long)]
    pub max_seq_length: Option<usize>,

    /// Pooling: mean, cls, or max
    #[arg(long)]
    pub pooling: Option<PoolingStrategy>,

    /// Shuffle every epoch
    #[arg(long)]
    pub shuffle: Option<bool>,

    /// Shuffle seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Never place the same sentence twice in a batch
    #[arg(long)]
    pub no_duplicates: bool,

    /// Save checkpoint every N steps (0 to disable)
    #[arg(long)]
    pub checkpoint_steps: Option<usize>,

    /// Keep at most N checkpoints
    #[arg(long)]
    pub checkpoint_save_total_limit: Option<usize>,

    /// Log every N steps
    #[arg(long)]
    pub logging_steps: Option<usize>,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress_bar: bool,

    /// Device: auto, cpu, cuda, or metal
    #[arg(long)]
    pub device: Option<DevicePreference>,
}

impl TrainConfig {
    /// Load a TOML file; keys it omits keep their defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        tracing::info!("Loaded training config from {:?}", path);
        Ok(config)
    }

    /// Defaults, then the optional TOML file, then CLI flags
    pub fn resolve(path: Option<&Path>, overrides: &TrainOverrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, o: &TrainOverrides) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *target = v.clone();
            }
        }
        fn set_opt<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                target.clone_from(value);
            }
        }

        set(&mut self.model, &o.model);
        set(&mut self.dataset, &o.dataset);
        set(&mut self.train_split, &o.train_split);
        set_opt(&mut self.eval_split, &o.eval_split);
        set_opt(&mut self.data, &o.data);
        set_opt(&mut self.eval_data, &o.eval_data);
        set_opt(&mut self.max_train_examples, &o.max_train_examples);
        set_opt(&mut self.max_eval_examples, &o.max_eval_examples);
        set(&mut self.output_dir, &o.output);
        set(&mut self.batch_size, &o.batch_size);
        set(&mut self.epochs, &o.epochs);
        set(&mut self.learning_rate, &o.learning_rate);
        set(&mut self.warmup_ratio, &o.warmup_ratio);
        set_opt(&mut self.warmup_steps, &o.warmup_steps);
        set(&mut self.weight_decay, &o.weight_decay);
        set(&mut self.max_grad_norm, &o.max_grad_norm);
        set(&mut self.scheduler, &o.scheduler);
        set(&mut self.scale, &o.scale);
        set_opt(&mut self.max_seq_length, &o.max_seq_length);
        set_opt(&mut self.pooling, &o.pooling);
        set(&mut self.shuffle, &o.shuffle);
        set_opt(&mut self.seed, &o.seed);
        set(&mut self.checkpoint_steps, &o.checkpoint_steps);
        set_opt(
            &mut self.checkpoint_save_total_limit,
            &o.checkpoint_save_total_limit,
        );
        set(&mut self.logging_steps, &o.logging_steps);
        set(&mut self.device, &o.device);
        if o.no_duplicates {
            self.no_duplicates = true;
        }
        if o.no_progress_bar {
            self.show_progress_bar = false;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }
        if self.epochs == 0 {
            bail!("epochs must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            bail!("warmup_ratio must be in [0, 1], got {}", self.warmup_ratio);
        }
        if self.learning_rate <= 0.0 {
            bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        if self.scale <= 0.0 {
            bail!("scale must be positive, got {}", self.scale);
        }
        if self.logging_steps == 0 {
            bail!("logging_steps must be greater than 0");
        }
        if self.max_grad_norm < 0.0 {
            bail!("max_grad_norm must not be negative");
        }
        if self.checkpoint_save_total_limit == Some(0) {
            bail!("checkpoint_save_total_limit must be at least 1");
        }
        Ok(())
    }

    pub fn train_source(&self) -> DataSource {
        match &self.data {
            Some(path) => DataSource::Local(path.clone()),
            None => DataSource::Hub {
                repo: self.dataset.clone(),
                split: self.train_split.clone(),
            },
        }
    }

    pub fn eval_source(&self) -> Option<DataSource> {
        if let Some(path) = &self.eval_data {
            return Some(DataSource::Local(path.clone()));
        }
        self.eval_split.as_ref().map(|split| DataSource::Hub {
            repo: self.dataset.clone(),
            split: split.clone(),
        })
    }

    pub fn model_options(&self) -> ModelOptions {
        ModelOptions {
            max_seq_length: self.max_seq_length,
            pooling: self.pooling,
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            seed: self.seed,
            no_duplicates: self.no_duplicates,
        }
    }

    pub fn loss_config(&self) -> RankingLossConfig {
        RankingLossConfig { scale: self.scale }
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            num_epochs: self.epochs,
            learning_rate: self.learning_rate,
            warmup_ratio: self.warmup_ratio,
            warmup_steps: self.warmup_steps,
            weight_decay: self.weight_decay,
            max_grad_norm: self.max_grad_norm,
            scheduler: self.scheduler,
            logging_steps: self.logging_steps,
            checkpoint_steps: self.checkpoint_steps,
            checkpoint_save_total_limit: self.checkpoint_save_total_limit,
            output_dir: self.output_dir.clone(),
            show_progress_bar: self.show_progress_bar,
            model_name: self.model.clone(),
            dataset_name: self.train_source().to_string(),
        }
    }
}

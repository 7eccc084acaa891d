//! Fine-tuning sentence-embedding models on NLI data with Candle
//!
//! For GPU support:
//! ```bash
//! cargo build --features cuda    # NVIDIA GPU
//! cargo build --features metal   # Apple GPU
//! ```
//!
//! # Modules
//!
//! - `device` - CPU/CUDA/Metal device selection
//! - `hub` - HuggingFace Hub integration (models and dataset splits)
//! - `dataset` - NLI records, entailment pairs and the batch loader
//! - `models` - BERT sentence encoder with pooling
//! - `loss` - Multiple-negatives ranking loss
//! - `optimizer` - AdamW, gradient clipping, learning-rate schedules
//! - `trainer` - Training loop
//! - `evaluation` - Pair retrieval evaluation
//! - `checkpoint` - sentence-transformers output layout

pub mod checkpoint;
pub mod dataset;
pub mod device;
pub mod evaluation;
pub mod hub;
pub mod loss;
pub mod models;
pub mod optimizer;
pub mod trainer;

// Re-exports
pub use checkpoint::{save_sentence_transformer, TrainingSummary};
pub use dataset::{
    entailment_pairs, DataSource, LoaderConfig, NliDataset, NliLabel, NliRecord, PairDataLoader,
    PairExample,
};
pub use device::{select_device, DevicePreference};
pub use evaluation::{PairRetrievalEvaluator, RetrievalMetrics};
pub use hub::{HubApi, ModelLoader, ModelPath};
pub use loss::{MultipleNegativesRankingLoss, RankingLossConfig};
pub use models::{EmbeddingModel, ModelOptions, PoolingStrategy, SentenceTransformer};
pub use optimizer::{LearningRateScheduler, SchedulerKind};
pub use trainer::{Trainer, TrainingConfig, TrainingResult};

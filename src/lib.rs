//! # nli-tune
//!
//! Fine-tunes a sentence-embedding model on natural-language-inference data.
//!
//! ## Overview
//!
//! The default run reproduces the classic sentence-transformers NLI recipe:
//!
//! - load `sentence-transformers/all-MiniLM-L6-v2` (BERT encoder + mean pooling)
//! - download the SNLI `train` split and keep the entailment pairs
//! - shuffle into batches of 16
//! - train one epoch with the multiple-negatives ranking loss, 10% warm-up
//! - save the model to `./output` in sentence-transformers format
//!
//! ## Architecture
//!
//! - `training` - dataset, model, loss, optimizer and training loop on Candle
//! - `config` - layered run configuration (defaults, TOML, CLI)
//! - `cli` - Command-line interface

pub mod cli;
pub mod config;
pub mod training;

// Re-export commonly used types
pub use anyhow::{Error, Result};
pub use config::{TrainConfig, TrainOverrides};

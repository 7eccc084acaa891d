//! Sentence-embedding models
//!
//! A sentence embedding model is a transformer encoder followed by a pooling
//! layer. The trainer only sees the [`EmbeddingModel`] trait.

mod encoders;
mod tokenizer;

pub use encoders::{
    apply_pooling, cosine_similarity, normalize_embeddings, BertConfig, BertModel, HiddenAct,
    ModelOptions, SentenceTransformer,
};
pub use tokenizer::{BatchEncodedInput, TokenizerWrapper};

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Model that maps sentences to fixed-size embeddings
pub trait EmbeddingModel: Send + Sync {
    /// Embed a batch of texts
    ///
    /// # Returns
    /// * Embeddings tensor [batch_size, hidden_size], attached to the autograd graph
    fn encode(&self, texts: &[String]) -> Result<Tensor>;

    /// Embed a batch for a training step
    ///
    /// Same as [`encode`](Self::encode) but with training-only layers such as
    /// dropout active. Evaluation and inference use `encode`.
    fn encode_train(&self, texts: &[String]) -> Result<Tensor> {
        self.encode(texts)
    }

    /// Get the embedding dimension
    fn hidden_size(&self) -> usize;

    /// Get the device this model is on
    fn device(&self) -> &Device;

    /// Named trainable parameters
    fn trainable_vars(&self) -> Vec<(String, Var)>;

    /// Write the model to a directory
    fn save(&self, dir: &Path) -> Result<()>;
}

/// Pooling strategies for converting token states to a sentence embedding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingStrategy {
    /// Mean pooling over non-padding tokens
    #[default]
    Mean,
    /// Use [CLS] token embedding
    Cls,
    /// Max pooling over non-padding tokens
    Max,
}

impl std::str::FromStr for PoolingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mean" => Ok(Self::Mean),
            "cls" => Ok(Self::Cls),
            "max" => Ok(Self::Max),
            _ => Err(anyhow::anyhow!(
                "Invalid pooling strategy: {}. Valid options: mean, cls, max",
                s
            )),
        }
    }
}

impl std::fmt::Display for PoolingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mean => write!(f, "mean"),
            Self::Cls => write!(f, "cls"),
            Self::Max => write!(f, "max"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooling_strategy_parse() {
        assert_eq!("MEAN".parse::<PoolingStrategy>().unwrap(), PoolingStrategy::Mean);
        assert_eq!("cls".parse::<PoolingStrategy>().unwrap(), PoolingStrategy::Cls);
        assert!("sum".parse::<PoolingStrategy>().is_err());
        assert_eq!(PoolingStrategy::Max.to_string(), "max");
    }
}

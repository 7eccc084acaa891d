//! Loss functions for training embedding models
//!
//! The ranking loss treats every other positive in the batch as a negative for
//! a given anchor, so no explicit negatives are needed.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};

use super::models::cosine_similarity;

/// Multiple-negatives ranking loss configuration
#[derive(Debug, Clone)]
pub struct RankingLossConfig {
    /// Multiplier applied to cosine similarities before the softmax
    /// (the inverse of a temperature)
    pub scale: f64,
}

impl Default for RankingLossConfig {
    fn default() -> Self {
        Self { scale: 20.0 }
    }
}

/// Multiple-negatives ranking loss (in-batch InfoNCE over cosine similarity)
///
/// For anchors `a_i` and positives `p_i`, the logits are
/// `scale * cos(a_i, p_j)` and the target for row `i` is column `i`.
#[derive(Debug, Clone)]
pub struct MultipleNegativesRankingLoss {
    config: RankingLossConfig,
}

impl MultipleNegativesRankingLoss {
    pub fn new(config: RankingLossConfig) -> Self {
        Self { config }
    }

    pub fn scale(&self) -> f64 {
        self.config.scale
    }

    /// Compute the loss
    ///
    /// # Arguments
    /// * `anchors` - Anchor embeddings [batch_size, hidden_dim]
    /// * `positives` - Positive embeddings [batch_size, hidden_dim]
    ///
    /// # Returns
    /// * Loss scalar tensor
    pub fn forward(&self, anchors: &Tensor, positives: &Tensor) -> Result<Tensor> {
        let batch_size = anchors.dim(0)?;
        if positives.dim(0)? != batch_size {
            bail!(
                "Anchor/positive batch size mismatch: {} vs {}",
                batch_size,
                positives.dim(0)?
            );
        }
        if batch_size == 0 {
            bail!("Cannot compute ranking loss on an empty batch");
        }

        let scores = (cosine_similarity(anchors, positives)? * self.config.scale)?;
        let labels = Tensor::arange(0u32, batch_size as u32, anchors.device())?;
        cross_entropy(&scores, &labels)
    }
}

fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, candle_core::D::Minus1)?;
    Ok(candle_nn::loss::nll(&log_probs, &labels.to_dtype(DType::U32)?)?)
}

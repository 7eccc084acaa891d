//! Pooling and similarity helpers shared by encoder models

use anyhow::Result;
use candle_core::{Tensor, D};

use super::super::PoolingStrategy;

/// Apply pooling to hidden states
///
/// # Arguments
/// * `hidden_states` - [batch_size, seq_len, hidden_size]
/// * `attention_mask` - [batch_size, seq_len], 1 for real tokens
pub fn apply_pooling(
    hidden_states: &Tensor,
    attention_mask: &Tensor,
    strategy: PoolingStrategy,
) -> Result<Tensor> {
    match strategy {
        PoolingStrategy::Mean => mean_pool(hidden_states, attention_mask),
        PoolingStrategy::Cls => cls_pool(hidden_states),
        PoolingStrategy::Max => max_pool(hidden_states, attention_mask),
    }
}

fn mean_pool(hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask.unsqueeze(2)?.to_dtype(hidden_states.dtype())?;
    let sum = hidden_states.broadcast_mul(&mask)?.sum(1)?;
    let count = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
    Ok(sum.broadcast_div(&count)?)
}

fn cls_pool(hidden_states: &Tensor) -> Result<Tensor> {
    Ok(hidden_states.narrow(1, 0, 1)?.squeeze(1)?)
}

fn max_pool(hidden_states: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask.unsqueeze(2)?.to_dtype(hidden_states.dtype())?;
    // padding positions are pushed to -1e9 so they never win the max
    let penalty = ((1.0 - &mask)? * -1e9)?;
    let masked = hidden_states
        .broadcast_mul(&mask)?
        .broadcast_add(&penalty)?;
    Ok(masked.max(1)?)
}

/// Normalize embeddings to unit length
pub fn normalize_embeddings(embeddings: &Tensor) -> Result<Tensor> {
    let norm = embeddings.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    Ok(embeddings.broadcast_div(&norm.clamp(1e-12, f64::MAX)?)?)
}

/// Pairwise cosine similarity: [n, dim] x [m, dim] -> [n, m]
pub fn cosine_similarity(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a_norm = normalize_embeddings(a)?;
    let b_norm = normalize_embeddings(b)?;
    Ok(a_norm.matmul(&b_norm.t()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn hidden() -> (Tensor, Tensor) {
        let device = Device::Cpu;
        // batch 2, seq 3, hidden 2; second sample has one padding token
        let hidden = Tensor::new(
            &[
                [[1f32, 2.], [3., 4.], [5., 6.]],
                [[1., 1.], [3., 3.], [100., 100.]],
            ],
            &device,
        )
        .unwrap();
        let mask = Tensor::new(&[[1f32, 1., 1.], [1., 1., 0.]], &device).unwrap();
        (hidden, mask)
    }

    #[test]
    fn test_mean_pool_ignores_padding() {
        let (hidden, mask) = hidden();
        let pooled: Vec<Vec<f32>> = apply_pooling(&hidden, &mask, PoolingStrategy::Mean)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(pooled, vec![vec![3., 4.], vec![2., 2.]]);
    }

    #[test]
    fn test_cls_and_max_pool() {
        let (hidden, mask) = hidden();
        let cls: Vec<Vec<f32>> = apply_pooling(&hidden, &mask, PoolingStrategy::Cls)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(cls, vec![vec![1., 2.], vec![1., 1.]]);

        let max: Vec<Vec<f32>> = apply_pooling(&hidden, &mask, PoolingStrategy::Max)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(max, vec![vec![5., 6.], vec![3., 3.]]);
    }

    #[test]
    fn test_cosine_similarity() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[1f32, 0.], [0., 2.]], &device).unwrap();
        let b = Tensor::new(&[[3f32, 0.], [1., 1.]], &device).unwrap();
        let sim: Vec<Vec<f32>> = cosine_similarity(&a, &b).unwrap().to_vec2().unwrap();
        assert!((sim[0][0] - 1.0).abs() < 1e-6);
        assert!(sim[1][0].abs() < 1e-6);
        assert!((sim[0][1] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }
}

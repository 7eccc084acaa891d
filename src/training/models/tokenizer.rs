//! Tokenizer wrapper for HuggingFace tokenizers

use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use std::path::Path;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// Wrapper around a HuggingFace tokenizer configured for batch encoding
#[derive(Clone)]
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    max_length: usize,
}

impl TokenizerWrapper {
    /// Load tokenizer from a `tokenizer.json` file
    pub fn from_file(path: impl AsRef<Path>, max_length: usize) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow!("Failed to load tokenizer {:?}: {}", path.as_ref(), e))?;
        Self::new(tokenizer, max_length)
    }

    /// Configure longest-in-batch padding and truncation to `max_length`
    pub fn new(mut tokenizer: Tokenizer, max_length: usize) -> Result<Self> {
        // keep the pad token/id the tokenizer ships with
        let padding = match tokenizer.get_padding() {
            Some(existing) => PaddingParams {
                strategy: PaddingStrategy::BatchLongest,
                ..existing.clone()
            },
            None => PaddingParams {
                strategy: PaddingStrategy::BatchLongest,
                ..Default::default()
            },
        };
        tokenizer.with_padding(Some(padding));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Failed to set truncation: {}", e))?;

        Ok(Self {
            tokenizer,
            max_length,
        })
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn inner(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Encode a batch of texts, padded to the longest sequence
    pub fn encode_batch(&self, texts: &[String]) -> Result<BatchEncodedInput> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("Batch tokenization failed: {}", e))?;

        let batch_size = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        let mut token_type_ids = Vec::with_capacity(batch_size * seq_len);

        for encoding in &encodings {
            input_ids.extend(encoding.get_ids());
            attention_mask.extend(encoding.get_attention_mask());
            token_type_ids.extend(encoding.get_type_ids());
        }

        Ok(BatchEncodedInput {
            input_ids,
            attention_mask,
            token_type_ids,
            batch_size,
            seq_len,
        })
    }
}

/// Batch encoded input, flattened row-major
#[derive(Debug, Clone)]
pub struct BatchEncodedInput {
    pub input_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<u32>,
    pub token_type_ids: Vec<u32>,
    pub batch_size: usize,
    /// Sequence length after padding
    pub seq_len: usize,
}

/// Model-ready tensors, each [batch_size, seq_len]
pub struct BatchTensors {
    pub input_ids: Tensor,
    pub token_type_ids: Tensor,
    pub attention_mask: Tensor,
}

impl BatchEncodedInput {
    pub fn to_tensors(&self, device: &Device) -> Result<BatchTensors> {
        let shape = (self.batch_size, self.seq_len);
        Ok(BatchTensors {
            input_ids: Tensor::from_slice(&self.input_ids, shape, device)?,
            token_type_ids: Tensor::from_slice(&self.token_type_ids, shape, device)?,
            attention_mask: Tensor::from_slice(&self.attention_mask, shape, device)?
                .to_dtype(candle_core::DType::F32)?,
        })
    }
}

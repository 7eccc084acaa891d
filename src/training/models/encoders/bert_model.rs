//! Trainable BERT encoder
//!
//! Built from basic tensor ops so that every weight stays on the autograd
//! graph. candle-nn's fused `layer_norm` and `softmax_last_dim` kernels have
//! no backward pass, so they are not used here.
//!
//! Dropout is applied only when the forward pass runs with `train = true`.

use anyhow::{bail, Result};
use candle_core::{DType, Module, Tensor, D};
use candle_nn::{Embedding, Init, Linear, VarBuilder};
use serde::Deserialize;

/// Softmax along `dim` using exp / sum
fn softmax(x: &Tensor, dim: D) -> Result<Tensor> {
    // shift-invariant, so the max carries no gradient
    let max = x.max_keepdim(dim)?.detach();
    let exp_x = x.broadcast_sub(&max)?.exp()?;
    let sum_exp = exp_x.sum_keepdim(dim)?;
    Ok(exp_x.broadcast_div(&sum_exp)?)
}

fn dropout(x: &Tensor, p: f64, train: bool) -> Result<Tensor> {
    if !train || p <= 0.0 {
        return Ok(x.clone());
    }
    Ok(candle_nn::ops::dropout(x, p as f32)?)
}

/// Activation between the intermediate and output dense layers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum HiddenAct {
    /// Exact (erf) GELU
    #[default]
    #[serde(rename = "gelu")]
    Gelu,
    /// Tanh-approximated GELU
    #[serde(rename = "gelu_new", alias = "gelu_pytorch_tanh")]
    GeluApproximate,
    #[serde(rename = "relu")]
    Relu,
}

impl HiddenAct {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Gelu => x.gelu_erf()?,
            Self::GeluApproximate => x.gelu()?,
            Self::Relu => x.relu()?,
        })
    }
}

/// BERT hyper-parameters read from `config.json`
#[derive(Debug, Clone, Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default)]
    pub hidden_act: HiddenAct,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f64,
    #[serde(default = "default_dropout")]
    pub attention_probs_dropout_prob: f64,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_position_embedding_type")]
    pub position_embedding_type: String,
}

fn default_dropout() -> f64 {
    0.1
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_position_embedding_type() -> String {
    "absolute".to_string()
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: HiddenAct::Gelu,
            hidden_dropout_prob: 0.1,
            attention_probs_dropout_prob: 0.1,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            position_embedding_type: default_position_embedding_type(),
        }
    }
}

impl BertConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        if self.position_embedding_type != "absolute" {
            bail!(
                "Unsupported position_embedding_type: {}",
                self.position_embedding_type
            );
        }
        for (name, p) in [
            ("hidden_dropout_prob", self.hidden_dropout_prob),
            ("attention_probs_dropout_prob", self.attention_probs_dropout_prob),
        ] {
            if !(0.0..1.0).contains(&p) {
                bail!("{} must be in [0, 1), got {}", name, p);
            }
        }
        Ok(())
    }
}

/// Layer normalization: (x - mean) / sqrt(var + eps) * weight + bias
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    pub fn load(vb: VarBuilder, hidden_size: usize, eps: f64) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden_size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let diff = x.broadcast_sub(&mean)?;
        let variance = diff.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (variance + self.eps)?.sqrt()?;
        let normalized = diff.broadcast_div(&std)?;
        Ok(normalized
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }
}

/// Word + position + token type embeddings
#[derive(Debug)]
struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    dropout_prob: f64,
}

impl BertEmbeddings {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        Ok(Self {
            word_embeddings: candle_nn::embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: candle_nn::embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: candle_nn::embedding(
                config.type_vocab_size,
                config.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: LayerNorm::load(
                vb.pp("LayerNorm"),
                config.hidden_size,
                config.layer_norm_eps,
            )?,
            dropout_prob: config.hidden_dropout_prob,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_batch_size, seq_len) = input_ids.dims2()?;

        let word_embeds = self.word_embeddings.forward(input_ids)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let position_embeds = self.position_embeddings.forward(&position_ids)?;
        let token_type_embeds = self.token_type_embeddings.forward(token_type_ids)?;

        let embeddings = (word_embeds + token_type_embeds.broadcast_add(&position_embeds)?)?;
        let embeddings = self.layer_norm.forward(&embeddings)?;
        dropout(&embeddings, self.dropout_prob, train)
    }
}

#[derive(Debug)]
struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_attention_heads: usize,
    attention_head_size: usize,
    dropout_prob: f64,
}

impl BertSelfAttention {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            query: candle_nn::linear(hidden, hidden, vb.pp("query"))?,
            key: candle_nn::linear(hidden, hidden, vb.pp("key"))?,
            value: candle_nn::linear(hidden, hidden, vb.pp("value"))?,
            num_attention_heads: config.num_attention_heads,
            attention_head_size: hidden / config.num_attention_heads,
            dropout_prob: config.attention_probs_dropout_prob,
        })
    }

    /// [batch, seq, hidden] -> [batch, heads, seq, head_size]
    fn split_heads(&self, x: &Tensor, batch_size: usize, seq_len: usize) -> Result<Tensor> {
        Ok(x
            .reshape((
                batch_size,
                seq_len,
                self.num_attention_heads,
                self.attention_head_size,
            ))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, hidden_states: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let query = self.split_heads(&self.query.forward(hidden_states)?, batch_size, seq_len)?;
        let key = self.split_heads(&self.key.forward(hidden_states)?, batch_size, seq_len)?;
        let value = self.split_heads(&self.value.forward(hidden_states)?, batch_size, seq_len)?;

        let key_t = key.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let scale = 1.0 / (self.attention_head_size as f64).sqrt();
        let scores = (query.matmul(&key_t)? * scale)?;
        let scores = scores.broadcast_add(attention_mask)?;

        let probs = softmax(&scores, D::Minus1)?;
        let probs = dropout(&probs, self.dropout_prob, train)?;

        let context = probs.matmul(&value)?.transpose(1, 2)?.contiguous()?;
        Ok(context.reshape((
            batch_size,
            seq_len,
            self.num_attention_heads * self.attention_head_size,
        ))?)
    }
}

/// Dense + dropout + residual + LayerNorm, shared by the attention and
/// feed-forward outputs
#[derive(Debug)]
struct BertResidualOutput {
    dense: Linear,
    layer_norm: LayerNorm,
    dropout_prob: f64,
}

impl BertResidualOutput {
    fn load(vb: VarBuilder, in_dim: usize, config: &BertConfig) -> Result<Self> {
        Ok(Self {
            dense: candle_nn::linear(in_dim, config.hidden_size, vb.pp("dense"))?,
            layer_norm: LayerNorm::load(
                vb.pp("LayerNorm"),
                config.hidden_size,
                config.layer_norm_eps,
            )?,
            dropout_prob: config.hidden_dropout_prob,
        })
    }

    fn forward(&self, hidden_states: &Tensor, input_tensor: &Tensor, train: bool) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?;
        let hidden_states = dropout(&hidden_states, self.dropout_prob, train)?;
        self.layer_norm.forward(&(hidden_states + input_tensor)?)
    }
}

#[derive(Debug)]
struct BertLayer {
    attention: BertSelfAttention,
    attention_output: BertResidualOutput,
    intermediate: Linear,
    activation: HiddenAct,
    output: BertResidualOutput,
}

impl BertLayer {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let attention = vb.pp("attention");
        Ok(Self {
            attention: BertSelfAttention::load(attention.pp("self"), config)?,
            attention_output: BertResidualOutput::load(
                attention.pp("output"),
                config.hidden_size,
                config,
            )?,
            intermediate: candle_nn::linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            activation: config.hidden_act,
            output: BertResidualOutput::load(vb.pp("output"), config.intermediate_size, config)?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let self_output = self.attention.forward(hidden_states, attention_mask, train)?;
        let attention_output = self
            .attention_output
            .forward(&self_output, hidden_states, train)?;
        let intermediate = self
            .activation
            .forward(&self.intermediate.forward(&attention_output)?)?;
        self.output.forward(&intermediate, &attention_output, train)
    }
}

/// BERT encoder returning the last hidden states
#[derive(Debug)]
pub struct BertModel {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    config: BertConfig,
}

impl BertModel {
    /// Build the encoder from `vb`
    ///
    /// Tensor names follow the Hugging Face layout (`embeddings.*`,
    /// `encoder.layer.{i}.*`). Names missing from a `VarMap` backend are
    /// created with fresh values.
    pub fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        config.validate()?;
        let embeddings = BertEmbeddings::load(vb.pp("embeddings"), config)?;
        let vb_layers = vb.pp("encoder").pp("layer");
        let layers = (0..config.num_hidden_layers)
            .map(|i| BertLayer::load(vb_layers.pp(i.to_string()), config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embeddings,
            layers,
            config: config.clone(),
        })
    }

    /// Run the encoder
    ///
    /// # Arguments
    /// * `attention_mask` - [batch, seq], 1 for tokens and 0 for padding
    /// * `train` - apply dropout
    ///
    /// # Returns
    /// * Hidden states [batch, seq, hidden]
    pub fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let mask = extended_attention_mask(attention_mask)?;
        let mut hidden_states = self.embeddings.forward(input_ids, token_type_ids, train)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &mask, train)?;
        }
        Ok(hidden_states)
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }
}

/// [batch, seq] 0/1 mask -> [batch, 1, 1, seq] additive mask (0 or -10000)
fn extended_attention_mask(attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .unsqueeze(1)?;
    Ok(((1.0 - mask)? * -10000.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;

    fn tiny_config() -> BertConfig {
        BertConfig {
            vocab_size: 10,
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 16,
            ..Default::default()
        }
    }

    fn inputs(device: &Device) -> (Tensor, Tensor, Tensor) {
        let ids = Tensor::new(&[[2u32, 3, 4, 0], [5, 6, 0, 0]], device).unwrap();
        let types = ids.zeros_like().unwrap();
        let mask = Tensor::new(&[[1f32, 1., 1., 0.], [1., 1., 0., 0.]], device).unwrap();
        (ids, types, mask)
    }

    #[test]
    fn test_layer_norm() {
        let device = Device::Cpu;
        let weight = Tensor::ones(6, DType::F32, &device).unwrap();
        let bias = Tensor::zeros(6, DType::F32, &device).unwrap();
        let layer_norm = LayerNorm::new(weight, bias, 1e-12);

        let input = Tensor::randn(0f32, 3.0, (2, 5, 6), &device).unwrap();
        let output = layer_norm.forward(&input).unwrap();
        assert_eq!(output.dims(), &[2, 5, 6]);

        let means: Vec<f32> = output.mean(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(means.iter().all(|m| m.abs() < 1e-4));
    }

    #[test]
    fn test_layer_norm_backward() {
        let device = Device::Cpu;
        let weight = Var::ones(4, DType::F32, &device).unwrap();
        let bias = Var::zeros(4, DType::F32, &device).unwrap();
        let layer_norm = LayerNorm::new(weight.as_tensor().clone(), bias.as_tensor().clone(), 1e-5);

        let input = Var::new(&[[1f32, 2., 4., 8.], [0.5, -1., 3., 0.]], &device).unwrap();
        let target = Tensor::new(&[1f32, -1., 2., 0.5], &device).unwrap();
        let loss = layer_norm
            .forward(input.as_tensor())
            .unwrap()
            .broadcast_mul(&target)
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();

        for var in [&weight, &bias, &input] {
            let grad = grads.get(var).expect("missing gradient");
            let norm = grad.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
            assert!(norm > 0.0);
        }
    }

    #[test]
    fn test_softmax_matches_candle() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1f32, 2., 3.], [-1., 0., 10.]], &device).unwrap();
        let ours: Vec<Vec<f32>> = softmax(&x, D::Minus1).unwrap().to_vec2().unwrap();
        let reference: Vec<Vec<f32>> = candle_nn::ops::softmax_last_dim(&x).unwrap().to_vec2().unwrap();
        for (a, b) in ours.iter().flatten().zip(reference.iter().flatten()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_padding_does_not_change_outputs() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let model = BertModel::load(vb, &tiny_config()).unwrap();

        let (ids, types, mask) = inputs(&device);
        let padded = model.forward(&ids, &types, &mask, false).unwrap();
        assert_eq!(padded.dims(), &[2, 4, 8]);

        let short_ids = Tensor::new(&[[5u32, 6]], &device).unwrap();
        let short_mask = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        let short = model
            .forward(&short_ids, &short_ids.zeros_like().unwrap(), &short_mask, false)
            .unwrap();

        let padded: Vec<Vec<f32>> = padded.get(1).unwrap().narrow(0, 0, 2).unwrap().to_vec2().unwrap();
        let short: Vec<Vec<f32>> = short.get(0).unwrap().to_vec2().unwrap();
        for (a, b) in padded.iter().flatten().zip(short.iter().flatten()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_dropout_only_in_training() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let config = BertConfig {
            hidden_dropout_prob: 0.5,
            ..tiny_config()
        };
        let model = BertModel::load(vb, &config).unwrap();
        let (ids, types, mask) = inputs(&device);

        let eval_a = model.forward(&ids, &types, &mask, false).unwrap();
        let eval_b = model.forward(&ids, &types, &mask, false).unwrap();
        let diff = (eval_a.clone() - eval_b).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);

        let train = model.forward(&ids, &types, &mask, true).unwrap();
        let diff = (eval_a - train).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 0.0);
    }

    #[test]
    fn test_config_deserialize() {
        let json = r#"{
            "architectures": ["BertModel"],
            "model_type": "bert",
            "vocab_size": 30522,
            "hidden_size": 384,
            "num_hidden_layers": 6,
            "num_attention_heads": 12,
            "intermediate_size": 1536,
            "hidden_act": "gelu",
            "max_position_embeddings": 512
        }"#;
        let config: BertConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.hidden_size, 384);
        assert_eq!(config.hidden_act, HiddenAct::Gelu);
        assert!((config.hidden_dropout_prob - 0.1).abs() < 1e-12);
        assert!((config.attention_probs_dropout_prob - 0.1).abs() < 1e-12);
        assert_eq!(config.type_vocab_size, 2);
        assert!(config.validate().is_ok());

        let bad = BertConfig {
            num_attention_heads: 5,
            ..config.clone()
        };
        assert!(bad.validate().is_err());
        let relative = BertConfig {
            position_embedding_type: "relative_key".to_string(),
            ..config
        };
        assert!(relative.validate().is_err());
    }
}

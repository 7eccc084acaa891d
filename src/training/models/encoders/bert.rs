//! BERT sentence encoder with trainable weights
//!
//! A [`BertModel`] followed by a pooling layer. All encoder weights live in a
//! `VarMap`, so the whole encoder is fine-tuned.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashSet;
use std::path::Path;

use super::super::{EmbeddingModel, PoolingStrategy, TokenizerWrapper};
use super::bert_model::{BertConfig, BertModel};
use super::encoder_utils::apply_pooling;
use crate::training::checkpoint::{save_sentence_transformer, SentenceTransformerFiles};
use crate::training::hub::{
    read_json, HubModelConfig, ModelLoader, ModelPath, PoolingConfig, SentenceBertConfig,
};

/// Tensor name prefixes imported from a checkpoint
const ENCODER_PREFIXES: &[&str] = &["embeddings.", "encoder.", "pooler."];

/// Kept in the saved weights; not read by the encoder and not trained
const POOLER_PREFIX: &str = "pooler.";

/// Options applied when loading a sentence transformer
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    /// Overrides the model's own maximum sequence length
    pub max_seq_length: Option<usize>,
    /// Overrides the model's pooling config
    pub pooling: Option<PoolingStrategy>,
}

/// BERT encoder + pooling, the sentence-transformers module pair
pub struct SentenceTransformer {
    model: BertModel,
    config: BertConfig,
    tokenizer: TokenizerWrapper,
    var_map: VarMap,
    pooling: PoolingStrategy,
    device: Device,
    source: ModelPath,
}

impl SentenceTransformer {
    /// Load from the Hugging Face Hub or a local directory
    pub fn load(model_id_or_path: &str, options: &ModelOptions, device: &Device) -> Result<Self> {
        let loader = ModelLoader::new()?;
        let model_path = loader.load_model_path(model_id_or_path)?;
        Self::from_model_path(model_path, options, device)
    }

    pub fn from_model_path(
        model_path: ModelPath,
        options: &ModelOptions,
        device: &Device,
    ) -> Result<Self> {
        model_path.validate()?;

        HubModelConfig::from_file(&model_path.config_file)?.validate_bert_compatibility()?;
        let config_str = std::fs::read_to_string(&model_path.config_file)
            .context("Failed to read config.json")?;
        let config: BertConfig =
            serde_json::from_str(&config_str).context("Failed to parse BERT config")?;

        let max_seq_length = resolve_max_seq_length(&model_path, &config, options)?;
        let pooling = resolve_pooling(&model_path, options)?;

        let tokenizer_file = model_path
            .tokenizer_file
            .as_ref()
            .ok_or_else(|| anyhow!("tokenizer.json not found for {}", model_path.model_id))?;
        let tokenizer = TokenizerWrapper::from_file(tokenizer_file, max_seq_length)?;

        let var_map = VarMap::new();
        let imported = import_weights(&var_map, &model_path.weights_file, device)?;

        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let model =
            BertModel::load(vb, &config).context("Failed to initialize BERT model from weights")?;

        let missing: Vec<String> = var_map
            .data()
            .lock()
            .map_err(|_| anyhow!("VarMap lock poisoned"))?
            .keys()
            .filter(|name| !imported.contains(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                "{} weights missing from checkpoint were freshly initialised: {:?}",
                missing.len(),
                missing
            );
        }

        tracing::info!(
            "Loaded {}: {} layers, hidden size {}, max_seq_length {}, {} pooling, dropout {}/{}",
            model_path.model_id,
            config.num_hidden_layers,
            config.hidden_size,
            max_seq_length,
            pooling,
            config.hidden_dropout_prob,
            config.attention_probs_dropout_prob
        );

        Ok(Self {
            model,
            config,
            tokenizer,
            var_map,
            pooling,
            device: device.clone(),
            source: model_path,
        })
    }

    pub fn pooling(&self) -> PoolingStrategy {
        self.pooling
    }

    pub fn max_seq_length(&self) -> usize {
        self.tokenizer.max_length()
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Number of trainable scalars
    pub fn num_parameters(&self) -> usize {
        self.trainable_vars()
            .iter()
            .map(|(_, v)| v.elem_count())
            .sum()
    }

    fn embed(&self, texts: &[String], train: bool) -> Result<Tensor> {
        let batch = self.tokenizer.encode_batch(texts)?;
        let tensors = batch.to_tensors(&self.device)?;

        let hidden_states = self.model.forward(
            &tensors.input_ids,
            &tensors.token_type_ids,
            &tensors.attention_mask,
            train,
        )?;

        apply_pooling(&hidden_states, &tensors.attention_mask, self.pooling)
    }
}

impl EmbeddingModel for SentenceTransformer {
    fn encode(&self, texts: &[String]) -> Result<Tensor> {
        self.embed(texts, false)
    }

    fn encode_train(&self, texts: &[String]) -> Result<Tensor> {
        self.embed(texts, true)
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn trainable_vars(&self) -> Vec<(String, Var)> {
        match self.var_map.data().lock() {
            Ok(data) => {
                let mut vars: Vec<_> = data
                    .iter()
                    .filter(|(name, _)| !name.starts_with(POOLER_PREFIX))
                    .map(|(name, var)| (name.clone(), var.clone()))
                    .collect();
                vars.sort_by(|a, b| a.0.cmp(&b.0));
                vars
            }
            Err(_) => Vec::new(),
        }
    }

    fn save(&self, dir: &Path) -> Result<()> {
        save_sentence_transformer(
            dir,
            &SentenceTransformerFiles {
                var_map: &self.var_map,
                source: &self.source,
                hidden_size: self.config.hidden_size,
                max_seq_length: self.max_seq_length(),
                pooling: self.pooling,
            },
        )
    }
}

fn resolve_max_seq_length(
    model_path: &ModelPath,
    config: &BertConfig,
    options: &ModelOptions,
) -> Result<usize> {
    if let Some(len) = options.max_seq_length {
        return Ok(len.min(config.max_position_embeddings));
    }
    if let Some(path) = &model_path.sentence_bert_config {
        let st_config: SentenceBertConfig = read_json(path)?;
        return Ok(st_config.max_seq_length.min(config.max_position_embeddings));
    }
    Ok(config.max_position_embeddings.min(512))
}

fn resolve_pooling(model_path: &ModelPath, options: &ModelOptions) -> Result<PoolingStrategy> {
    if let Some(pooling) = options.pooling {
        return Ok(pooling);
    }
    if let Some(path) = &model_path.pooling_config {
        let pooling_config: PoolingConfig = read_json(path)?;
        return match pooling_config.strategy() {
            Some(strategy) => Ok(strategy),
            None => {
                tracing::warn!("Unsupported pooling config {:?}, using mean pooling", path);
                Ok(PoolingStrategy::Mean)
            }
        };
    }
    Ok(PoolingStrategy::default())
}

/// Map a checkpoint tensor name to the name the encoder reads
fn canonical_name(name: &str, strip_bert: bool) -> Option<String> {
    let name = if strip_bert {
        name.strip_prefix("bert.")?
    } else {
        name
    };
    if !ENCODER_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return None;
    }
    let name = if let Some(stem) = name.strip_suffix(".gamma") {
        format!("{}.weight", stem)
    } else if let Some(stem) = name.strip_suffix(".beta") {
        format!("{}.bias", stem)
    } else {
        name.to_string()
    };
    Some(name)
}

/// Load checkpoint tensors into the VarMap as trainable F32 variables
///
/// Returns the names that were imported.
fn import_weights(var_map: &VarMap, weights_file: &Path, device: &Device) -> Result<HashSet<String>> {
    let tensors = candle_core::safetensors::load(weights_file, device)
        .with_context(|| format!("Failed to load safetensors weights {:?}", weights_file))?;

    let strip_bert = tensors.keys().any(|k| k.starts_with("bert."));
    let mut data = var_map
        .data()
        .lock()
        .map_err(|_| anyhow!("VarMap lock poisoned"))?;

    let mut imported = HashSet::new();
    for (name, tensor) in tensors {
        if !tensor.dtype().is_float() {
            continue;
        }
        let Some(name) = canonical_name(&name, strip_bert) else {
            tracing::debug!("Skipping non-encoder tensor {}", name);
            continue;
        };
        let var = Var::from_tensor(&tensor.to_dtype(DType::F32)?)?;
        imported.insert(name.clone());
        data.insert(name, var);
    }

    if imported.is_empty() {
        return Err(anyhow!("No encoder weights found in {:?}", weights_file));
    }
    tracing::debug!("Imported {} tensors from {:?}", imported.len(), weights_file);
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::dataset::{LoaderConfig, PairDataLoader, PairExample};
    use crate::training::loss::{MultipleNegativesRankingLoss, RankingLossConfig};
    use crate::training::optimizer::{AdamW, AdamWConfig, SchedulerKind};
    use crate::training::trainer::{Trainer, TrainingConfig};
    use candle_nn::Init;
    use serde_json::json;
    use tempfile::TempDir;

    const VOCAB: &[&str] = &[
        "[PAD]", "[UNK]", "a", "the", "dog", "cat", "child", "runs", "sleeps", "plays", "an",
        "animal", "pet", "kid", "moves", "rests", "outside",
    ];

    fn tiny_config() -> serde_json::Value {
        json!({
            "architectures": ["BertModel"],
            "model_type": "bert",
            "vocab_size": VOCAB.len(),
            "hidden_size": 8,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "intermediate_size": 16,
            "hidden_act": "gelu",
            "hidden_dropout_prob": 0.1,
            "attention_probs_dropout_prob": 0.1,
            "max_position_embeddings": 16,
            "type_vocab_size": 2,
            "layer_norm_eps": 1e-12
        })
    }

    fn tokenizer_json() -> String {
        let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
            .iter()
            .enumerate()
            .map(|(i, word)| (word.to_string(), json!(i)))
            .collect();
        json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
        })
        .to_string()
    }

    /// Random 1-layer BERT in Hugging Face layout, `bert.` prefixed like a
    /// `BertForPreTraining` export
    fn tiny_bert_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let config = tiny_config();
        std::fs::write(dir.path().join("config.json"), config.to_string()).unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), tokenizer_json()).unwrap();

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let bert_config: BertConfig = serde_json::from_value(config).unwrap();
        BertModel::load(vb.pp("bert"), &bert_config).unwrap();
        let randn = Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };
        var_map
            .get((8, 8), "bert.pooler.dense.weight", randn, DType::F32, &device)
            .unwrap();
        var_map
            .get(8, "bert.pooler.dense.bias", Init::Const(0.0), DType::F32, &device)
            .unwrap();
        var_map.save(dir.path().join("model.safetensors")).unwrap();
        dir
    }

    fn load_tiny(dir: &Path) -> SentenceTransformer {
        let model_path = ModelPath::from_local(dir).unwrap();
        SentenceTransformer::from_model_path(model_path, &ModelOptions::default(), &Device::Cpu)
            .unwrap()
    }

    fn texts(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    fn snapshot(model: &SentenceTransformer) -> Vec<(String, Tensor)> {
        model
            .trainable_vars()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().copy().unwrap()))
            .collect()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    // a shared bias on every key shifts each attention row by a constant
    fn softmax_invariant(name: &str) -> bool {
        name.ends_with("attention.self.key.bias")
    }

    #[test]
    fn test_tiny_bert_encode() {
        let dir = tiny_bert_dir();
        let model = load_tiny(dir.path());
        assert_eq!(model.hidden_size(), 8);
        assert_eq!(model.max_seq_length(), 16);
        assert_eq!(model.pooling(), PoolingStrategy::Mean);

        let vars = model.trainable_vars();
        assert_eq!(vars.len(), 21);
        assert!(vars.iter().all(|(name, _)| !name.starts_with("bert.")));
        assert!(vars.iter().all(|(name, _)| !name.starts_with(POOLER_PREFIX)));
        assert_eq!(model.var_map().all_vars().len(), 23);

        let batch = texts(&["a dog runs", "the cat sleeps outside", "a kid"]);
        let emb = model.encode(&batch).unwrap();
        assert_eq!(emb.dims(), &[3, 8]);

        let again = model.encode(&batch).unwrap();
        assert_eq!(max_abs_diff(&emb, &again), 0.0);
        let train = model.encode_train(&batch).unwrap();
        assert_eq!(train.dims(), &[3, 8]);
        assert!(max_abs_diff(&emb, &train) > 0.0);
    }

    #[test]
    fn test_every_encoder_weight_gets_gradient() {
        let dir = tiny_bert_dir();
        let model = load_tiny(dir.path());
        let loss_fn = MultipleNegativesRankingLoss::new(RankingLossConfig::default());

        let anchors = texts(&["a dog runs", "the cat sleeps", "a child plays outside"]);
        let positives = texts(&["an animal moves", "a pet rests", "a kid plays"]);
        let loss = loss_fn
            .forward(
                &model.encode(&anchors).unwrap(),
                &model.encode(&positives).unwrap(),
            )
            .unwrap();
        let grads = loss.backward().unwrap();

        for (name, var) in model.trainable_vars() {
            let grad = grads
                .get(&var)
                .unwrap_or_else(|| panic!("no gradient for {}", name));
            let norm = grad.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
            if !softmax_invariant(&name) {
                assert!(norm > 0.0, "zero gradient for {}", name);
            }
        }

        let before = snapshot(&model);
        let mut optimizer = AdamW::new(
            model.trainable_vars(),
            AdamWConfig {
                lr: 1e-2,
                ..Default::default()
            },
        )
        .unwrap();
        optimizer.step(&grads).unwrap();

        for ((name, var), (_, old)) in model.trainable_vars().into_iter().zip(&before) {
            if !softmax_invariant(&name) {
                assert!(
                    max_abs_diff(var.as_tensor(), old) > 0.0,
                    "{} unchanged after a step",
                    name
                );
            }
        }
    }

    #[test]
    fn test_fit_then_reload() {
        let dir = tiny_bert_dir();
        let out = TempDir::new().unwrap();
        let model = load_tiny(dir.path());
        let before = snapshot(&model);

        let pairs: Vec<PairExample> = [
            ("a dog runs", "an animal moves"),
            ("the cat sleeps", "a pet rests"),
            ("a child plays", "a kid plays outside"),
            ("the dog sleeps", "an animal rests"),
        ]
        .iter()
        .map(|(anchor, positive)| PairExample {
            anchor: anchor.to_string(),
            positive: positive.to_string(),
        })
        .collect();
        let mut loader = PairDataLoader::new(
            pairs,
            LoaderConfig {
                batch_size: 2,
                shuffle: true,
                seed: Some(3),
                no_duplicates: false,
            },
        )
        .unwrap();

        let mut trainer = Trainer::new(TrainingConfig {
            num_epochs: 2,
            learning_rate: 1e-2,
            warmup_steps: Some(0),
            scheduler: SchedulerKind::Constant,
            logging_steps: 1,
            output_dir: out.path().to_path_buf(),
            show_progress_bar: false,
            ..Default::default()
        });
        let loss_fn = MultipleNegativesRankingLoss::new(RankingLossConfig::default());
        let result = trainer.fit(&model, &mut loader, &loss_fn, None).unwrap();
        assert_eq!(result.metrics.global_step, 4);
        assert!(result.history.iter().all(|loss| loss.is_finite()));

        let query = "encoder.layer.0.attention.self.query.weight";
        let trained = model
            .trainable_vars()
            .into_iter()
            .find(|(name, _)| name == query)
            .map(|(_, var)| var.as_tensor().copy().unwrap())
            .unwrap();
        let (_, original) = before.iter().find(|(name, _)| name == query).unwrap();
        assert!(max_abs_diff(&trained, original) > 0.0);

        for file in ["model.safetensors", "config.json", "tokenizer.json", "modules.json"] {
            assert!(out.path().join(file).exists(), "{} missing", file);
        }

        let reloaded = SentenceTransformer::load(
            out.path().to_str().unwrap(),
            &ModelOptions::default(),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(reloaded.max_seq_length(), 16);
        assert_eq!(reloaded.pooling(), PoolingStrategy::Mean);
        let reloaded_query = reloaded
            .trainable_vars()
            .into_iter()
            .find(|(name, _)| name == query)
            .map(|(_, var)| var.as_tensor().clone())
            .unwrap();
        assert_eq!(max_abs_diff(&trained, &reloaded_query), 0.0);

        let batch = texts(&["a dog runs", "a kid"]);
        let a = model.encode(&batch).unwrap();
        let b = reloaded.encode(&batch).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(
            canonical_name("bert.embeddings.LayerNorm.gamma", true).as_deref(),
            Some("embeddings.LayerNorm.weight")
        );
        assert_eq!(
            canonical_name("encoder.layer.0.output.LayerNorm.beta", false).as_deref(),
            Some("encoder.layer.0.output.LayerNorm.bias")
        );
        assert_eq!(
            canonical_name("encoder.layer.0.attention.self.query.weight", false).as_deref(),
            Some("encoder.layer.0.attention.self.query.weight")
        );
        assert_eq!(canonical_name("cls.predictions.bias", true), None);
        assert_eq!(canonical_name("lm_head.weight", false), None);
    }

    #[test]
    fn test_import_weights_skips_buffers() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let device = Device::Cpu;

        let tensors = std::collections::HashMap::from([
            (
                "bert.embeddings.word_embeddings.weight".to_string(),
                Tensor::zeros((4, 2), DType::F32, &device).unwrap(),
            ),
            (
                "bert.embeddings.position_ids".to_string(),
                Tensor::zeros((1, 4), DType::I64, &device).unwrap(),
            ),
            (
                "cls.predictions.bias".to_string(),
                Tensor::zeros(4, DType::F32, &device).unwrap(),
            ),
        ]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let var_map = VarMap::new();
        let imported = import_weights(&var_map, &path, &device).unwrap();
        assert_eq!(imported.len(), 1);
        assert!(imported.contains("embeddings.word_embeddings.weight"));
        assert_eq!(var_map.all_vars().len(), 1);
    }

    #[test]
    #[ignore]
    fn test_load_minilm() {
        let device = Device::Cpu;
        let model = SentenceTransformer::load(
            "sentence-transformers/all-MiniLM-L6-v2",
            &ModelOptions::default(),
            &device,
        )
        .unwrap();
        assert_eq!(model.hidden_size(), 384);
        assert_eq!(model.max_seq_length(), 256);
        assert_eq!(model.pooling(), PoolingStrategy::Mean);

        let emb = model
            .encode(&["A man is playing a guitar.".to_string(), "Hi".to_string()])
            .unwrap();
        assert_eq!(emb.dims(), &[2, 384]);
    }
}

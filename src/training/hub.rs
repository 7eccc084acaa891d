//! HuggingFace Hub integration
//!
//! Resolves model identifiers to local directories (downloading from the Hub
//! when needed) and fetches dataset split files.

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::Api;
use std::path::{Path, PathBuf};

use super::models::PoolingStrategy;

/// Tokenizer side files copied along with `tokenizer.json` when present
pub const TOKENIZER_AUX_FILES: &[&str] = &[
    "tokenizer_config.json",
    "special_tokens_map.json",
    "vocab.txt",
];

/// sentence-transformers module config, relative to the model root
pub const SENTENCE_BERT_CONFIG: &str = "sentence_bert_config.json";
/// sentence-transformers pooling config, relative to the model root
pub const POOLING_CONFIG: &str = "1_Pooling/config.json";

/// HuggingFace Hub API wrapper
pub struct HubApi {
    api: Api,
}

impl HubApi {
    pub fn new() -> Result<Self> {
        let api = Api::new().context("Failed to initialize HuggingFace Hub API")?;
        Ok(Self { api })
    }

    /// Download the files of a model repository
    pub fn download_model(&self, model_id: &str) -> Result<ModelPath> {
        tracing::info!("Downloading model from HuggingFace Hub: {}", model_id);

        let repo = self.api.model(model_id.to_string());

        let config_file = repo
            .get("config.json")
            .with_context(|| format!("Failed to download config.json for {}", model_id))?;
        let weights_file = repo.get("model.safetensors").with_context(|| {
            format!(
                "Failed to download model.safetensors for {} (only safetensors weights are supported)",
                model_id
            )
        })?;
        let tokenizer_file = repo.get("tokenizer.json").ok();

        let aux_files = TOKENIZER_AUX_FILES
            .iter()
            .filter_map(|name| repo.get(name).ok())
            .collect();
        let sentence_bert_config = repo.get(SENTENCE_BERT_CONFIG).ok();
        let pooling_config = repo.get(POOLING_CONFIG).ok();

        let model_dir = config_file
            .parent()
            .ok_or_else(|| anyhow!("Invalid config path"))?
            .to_path_buf();

        Ok(ModelPath {
            path: model_dir,
            model_id: model_id.to_string(),
            is_local: false,
            config_file,
            weights_file,
            tokenizer_file,
            aux_files,
            sentence_bert_config,
            pooling_config,
        })
    }

    /// Download one split of a parquet-converted dataset repository
    pub fn download_dataset_split(&self, repo_id: &str, split: &str) -> Result<PathBuf> {
        let filename = dataset_split_filename(split);
        tracing::info!("Downloading dataset split {}:{} ({})", repo_id, split, filename);

        self.api
            .dataset(repo_id.to_string())
            .get(&filename)
            .with_context(|| format!("Failed to download {} from dataset {}", filename, repo_id))
    }
}

/// Path of a split inside a parquet-converted Hub dataset
pub fn dataset_split_filename(split: &str) -> String {
    format!("plain_text/{}-00000-of-00001.parquet", split)
}

/// Files making up a model on local disk
#[derive(Debug, Clone)]
pub struct ModelPath {
    /// Root directory containing model files
    pub path: PathBuf,
    /// Original model ID (e.g., "sentence-transformers/all-MiniLM-L6-v2")
    pub model_id: String,
    /// Whether this is a local path (not downloaded from Hub)
    pub is_local: bool,
    pub config_file: PathBuf,
    pub weights_file: PathBuf,
    pub tokenizer_file: Option<PathBuf>,
    /// Tokenizer side files (vocab, special tokens, tokenizer config)
    pub aux_files: Vec<PathBuf>,
    pub sentence_bert_config: Option<PathBuf>,
    pub pooling_config: Option<PathBuf>,
}

impl ModelPath {
    /// Create a ModelPath from a local directory
    pub fn from_local(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.is_dir() {
            return Err(anyhow!("Model directory does not exist: {:?}", path));
        }

        let config_file = path.join("config.json");
        if !config_file.exists() {
            return Err(anyhow!("config.json not found in {:?}", path));
        }

        let weights_file = path.join("model.safetensors");
        if !weights_file.exists() {
            return Err(anyhow!(
                "model.safetensors not found in {:?} (only safetensors weights are supported)",
                path
            ));
        }

        let existing = |rel: &str| {
            let p = path.join(rel);
            p.exists().then_some(p)
        };

        Ok(Self {
            model_id: path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            is_local: true,
            config_file,
            weights_file,
            tokenizer_file: existing("tokenizer.json"),
            aux_files: TOKENIZER_AUX_FILES
                .iter()
                .filter_map(|name| existing(name))
                .collect(),
            sentence_bert_config: existing(SENTENCE_BERT_CONFIG),
            pooling_config: existing(POOLING_CONFIG),
            path,
        })
    }

    /// Validate that all required files exist
    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!("Config file not found: {:?}", self.config_file));
        }
        if !self.weights_file.exists() {
            return Err(anyhow!("Weights file not found: {:?}", self.weights_file));
        }
        if self.tokenizer_file.is_none() {
            return Err(anyhow!("tokenizer.json not found for model {}", self.model_id));
        }
        Ok(())
    }
}

/// Configuration from a HuggingFace model's config.json
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HubModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    pub model_type: Option<String>,
    pub vocab_size: Option<usize>,
    pub hidden_size: Option<usize>,
    pub num_hidden_layers: Option<usize>,
    pub num_attention_heads: Option<usize>,
    pub max_position_embeddings: Option<usize>,
}

impl HubModelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        serde_json::from_str(&content).context("Failed to parse config.json")
    }

    /// Check if this is a plain BERT model
    ///
    /// RoBERTa-style checkpoints offset position ids and DistilBERT uses
    /// different tensor names, so neither loads into the BERT encoder.
    pub fn is_bert(&self) -> bool {
        match &self.model_type {
            Some(model_type) => model_type == "bert",
            None => self.architectures.iter().any(|arch| arch.starts_with("Bert")),
        }
    }

    /// Validate that this config is compatible with the candle BERT encoder
    pub fn validate_bert_compatibility(&self) -> Result<()> {
        if !self.is_bert() {
            return Err(anyhow!(
                "Model is not a BERT model. Architectures: {:?}, model_type: {:?}",
                self.architectures,
                self.model_type
            ));
        }
        if self.hidden_size.is_none() {
            return Err(anyhow!("Config missing required field: hidden_size"));
        }
        if self.num_hidden_layers.is_none() {
            return Err(anyhow!("Config missing required field: num_hidden_layers"));
        }
        if self.num_attention_heads.is_none() {
            return Err(anyhow!("Config missing required field: num_attention_heads"));
        }
        Ok(())
    }
}

/// `sentence_bert_config.json`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SentenceBertConfig {
    pub max_seq_length: usize,
    #[serde(default)]
    pub do_lower_case: bool,
}

/// `1_Pooling/config.json`
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolingConfig {
    pub word_embedding_dimension: usize,
    #[serde(default)]
    pub pooling_mode_cls_token: bool,
    #[serde(default)]
    pub pooling_mode_mean_tokens: bool,
    #[serde(default)]
    pub pooling_mode_max_tokens: bool,
    #[serde(default)]
    pub pooling_mode_mean_sqrt_len_tokens: bool,
}

impl PoolingConfig {
    pub fn new(dimension: usize, strategy: PoolingStrategy) -> Self {
        Self {
            word_embedding_dimension: dimension,
            pooling_mode_cls_token: matches!(strategy, PoolingStrategy::Cls),
            pooling_mode_mean_tokens: matches!(strategy, PoolingStrategy::Mean),
            pooling_mode_max_tokens: matches!(strategy, PoolingStrategy::Max),
            pooling_mode_mean_sqrt_len_tokens: false,
        }
    }

    /// The single pooling mode this config enables, if supported
    pub fn strategy(&self) -> Option<PoolingStrategy> {
        match (
            self.pooling_mode_mean_tokens,
            self.pooling_mode_cls_token,
            self.pooling_mode_max_tokens,
        ) {
            (true, false, false) => Some(PoolingStrategy::Mean),
            (false, true, false) => Some(PoolingStrategy::Cls),
            (false, false, true) => Some(PoolingStrategy::Max),
            _ => None,
        }
    }
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}

/// Model loader that handles both local and HuggingFace models
pub struct ModelLoader {
    hub: HubApi,
}

impl ModelLoader {
    pub fn new() -> Result<Self> {
        Ok(Self {
            hub: HubApi::new()?,
        })
    }

    /// Load model path - auto-detects local vs HuggingFace
    ///
    /// If the path exists locally, treats it as a local path. Path-like
    /// arguments that do not exist are rejected instead of being sent to the Hub.
    pub fn load_model_path(&self, model_id_or_path: &str) -> Result<ModelPath> {
        let local_path = Path::new(model_id_or_path);

        if local_path.exists() {
            tracing::info!("Loading model from local path: {}", model_id_or_path);
            ModelPath::from_local(local_path)
        } else if looks_like_path(model_id_or_path) {
            Err(anyhow!(
                "Local model path does not exist: {}",
                model_id_or_path
            ))
        } else {
            self.hub.download_model(model_id_or_path)
        }
    }

    pub fn hub(&self) -> &HubApi {
        &self.hub
    }
}

fn looks_like_path(s: &str) -> bool {
    s.starts_with('.') || s.starts_with('/') || s.starts_with('~')
}

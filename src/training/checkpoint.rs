//! Saving trained models and training checkpoints
//!
//! Output directories follow the sentence-transformers layout, so a saved
//! model can be loaded back with `SentenceTransformer::load` or by the Python
//! library:
//!
//! ```text
//! output/
//!   model.safetensors
//!   config.json
//!   tokenizer.json (+ vocab.txt, tokenizer_config.json, ...)
//!   modules.json
//!   sentence_bert_config.json
//!   1_Pooling/config.json
//!   training_summary.json
//!   checkpoints/checkpoint-{step}/...
//! ```

use anyhow::{anyhow, Context, Result};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::hub::{ModelPath, PoolingConfig, SentenceBertConfig, POOLING_CONFIG, SENTENCE_BERT_CONFIG};
use super::models::PoolingStrategy;

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const MODULES_FILE: &str = "modules.json";
pub const SUMMARY_FILE: &str = "training_summary.json";
pub const CHECKPOINTS_DIR: &str = "checkpoints";

/// Everything needed to write a sentence-transformer directory
pub struct SentenceTransformerFiles<'a> {
    pub var_map: &'a VarMap,
    /// Directory the model was loaded from; config and tokenizer files are copied from it
    pub source: &'a ModelPath,
    pub hidden_size: usize,
    pub max_seq_length: usize,
    pub pooling: PoolingStrategy,
}

/// Entry of `modules.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub idx: usize,
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub module_type: String,
}

fn default_modules() -> Vec<ModuleEntry> {
    vec![
        ModuleEntry {
            idx: 0,
            name: "0".to_string(),
            path: String::new(),
            module_type: "sentence_transformers.models.Transformer".to_string(),
        },
        ModuleEntry {
            idx: 1,
            name: "1".to_string(),
            path: "1_Pooling".to_string(),
            module_type: "sentence_transformers.models.Pooling".to_string(),
        },
    ]
}

/// Write a model directory loadable by sentence-transformers
pub fn save_sentence_transformer(dir: &Path, files: &SentenceTransformerFiles<'_>) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {:?}", dir))?;

    files
        .var_map
        .save(dir.join(WEIGHTS_FILE))
        .context("Failed to save model weights")?;

    copy_into(&files.source.config_file, dir, "config.json")?;
    if let Some(tokenizer) = &files.source.tokenizer_file {
        copy_into(tokenizer, dir, "tokenizer.json")?;
    }
    for aux in &files.source.aux_files {
        let name = aux
            .file_name()
            .ok_or_else(|| anyhow!("Invalid tokenizer file path {:?}", aux))?;
        copy_into(aux, dir, &name.to_string_lossy())?;
    }

    write_json(&dir.join(MODULES_FILE), &default_modules())?;
    write_json(
        &dir.join(SENTENCE_BERT_CONFIG),
        &SentenceBertConfig {
            max_seq_length: files.max_seq_length,
            do_lower_case: false,
        },
    )?;

    let pooling_path = dir.join(POOLING_CONFIG);
    if let Some(parent) = pooling_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_json(
        &pooling_path,
        &PoolingConfig::new(files.hidden_size, files.pooling),
    )?;

    tracing::info!("Saved model to {:?}", dir);
    Ok(())
}

/// Copy `src` to `dir/name`, skipping the copy when both are the same file
fn copy_into(src: &Path, dir: &Path, name: &str) -> Result<()> {
    let dst = dir.join(name);
    if let (Ok(a), Ok(b)) = (src.canonicalize(), dst.canonicalize()) {
        if a == b {
            return Ok(());
        }
    }
    std::fs::copy(src, &dst).with_context(|| format!("Failed to copy {:?} to {:?}", src, dst))?;
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
}

/// Summary written next to the final model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub model: String,
    pub dataset: String,
    pub num_pairs: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub global_step: usize,
    pub warmup_steps: usize,
    pub learning_rate: f64,
    pub final_loss: Option<f64>,
    pub elapsed_secs: f64,
    pub interrupted: bool,
}

impl TrainingSummary {
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(SUMMARY_FILE);
        write_json(&path, self)?;
        Ok(path)
    }
}

/// `output_dir/checkpoints/checkpoint-{step}`
pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir
        .join(CHECKPOINTS_DIR)
        .join(format!("checkpoint-{}", step))
}

fn checkpoint_step(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("checkpoint-")?
        .parse()
        .ok()
}

/// Delete the oldest `checkpoint-{step}` directories so at most `limit` remain
///
/// Returns the removed directories.
pub fn rotate_checkpoints(checkpoints_dir: &Path, limit: usize) -> Result<Vec<PathBuf>> {
    if !checkpoints_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut checkpoints: Vec<(usize, PathBuf)> = std::fs::read_dir(checkpoints_dir)
        .with_context(|| format!("Failed to list {:?}", checkpoints_dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .filter_map(|path| checkpoint_step(&path).map(|step| (step, path)))
        .collect();

    if checkpoints.len() <= limit {
        return Ok(Vec::new());
    }
    checkpoints.sort_by_key(|(step, _)| *step);

    let excess = checkpoints.len() - limit;
    let mut removed = Vec::with_capacity(excess);
    for (_, path) in checkpoints.into_iter().take(excess) {
        tracing::debug!("Removing old checkpoint {:?}", path);
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("Failed to remove checkpoint {:?}", path))?;
        removed.push(path);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use tempfile::TempDir;

    fn source_model(dir: &Path) -> ModelPath {
        std::fs::write(dir.join("config.json"), r#"{"model_type": "bert"}"#).unwrap();
        std::fs::write(dir.join("model.safetensors"), b"").unwrap();
        std::fs::write(dir.join("tokenizer.json"), "{}").unwrap();
        std::fs::write(dir.join("vocab.txt"), "[PAD]\n[UNK]\n").unwrap();
        ModelPath::from_local(dir).unwrap()
    }

    #[test]
    fn test_save_sentence_transformer_layout() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let source = source_model(src.path());

        let var_map = VarMap::new();
        var_map
            .get((2, 3), "embeddings.word_embeddings.weight", candle_nn::Init::Const(0.5), DType::F32, &Device::Cpu)
            .unwrap();

        let dir = out.path().join("model");
        save_sentence_transformer(
            &dir,
            &SentenceTransformerFiles {
                var_map: &var_map,
                source: &source,
                hidden_size: 3,
                max_seq_length: 128,
                pooling: PoolingStrategy::Cls,
            },
        )
        .unwrap();

        for file in ["model.safetensors", "config.json", "tokenizer.json", "vocab.txt", "modules.json"] {
            assert!(dir.join(file).exists(), "missing {}", file);
        }

        let st: SentenceBertConfig =
            serde_json::from_str(&std::fs::read_to_string(dir.join(SENTENCE_BERT_CONFIG)).unwrap())
                .unwrap();
        assert_eq!(st.max_seq_length, 128);

        let pooling: PoolingConfig =
            serde_json::from_str(&std::fs::read_to_string(dir.join(POOLING_CONFIG)).unwrap())
                .unwrap();
        assert_eq!(pooling.word_embedding_dimension, 3);
        assert_eq!(pooling.strategy(), Some(PoolingStrategy::Cls));

        let modules: Vec<ModuleEntry> =
            serde_json::from_str(&std::fs::read_to_string(dir.join(MODULES_FILE)).unwrap()).unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[1].path, "1_Pooling");

        let weights = candle_core::safetensors::load(dir.join(WEIGHTS_FILE), &Device::Cpu).unwrap();
        assert_eq!(
            weights["embeddings.word_embeddings.weight"].dims(),
            &[2, 3]
        );

        // saving over the directory it was loaded from leaves the copied files intact
        let reloaded = ModelPath::from_local(&dir).unwrap();
        save_sentence_transformer(
            &dir,
            &SentenceTransformerFiles {
                var_map: &var_map,
                source: &reloaded,
                hidden_size: 3,
                max_seq_length: 128,
                pooling: PoolingStrategy::Cls,
            },
        )
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.join("vocab.txt")).unwrap(),
            "[PAD]\n[UNK]\n"
        );
    }

    #[test]
    fn test_checkpoint_dir() {
        assert_eq!(
            checkpoint_dir(Path::new("out"), 500),
            Path::new("out/checkpoints/checkpoint-500")
        );
    }

    #[test]
    fn test_rotate_checkpoints_keeps_newest() {
        let out = TempDir::new().unwrap();
        for step in [100, 1000, 200, 300] {
            std::fs::create_dir_all(checkpoint_dir(out.path(), step)).unwrap();
        }
        let checkpoints = out.path().join(CHECKPOINTS_DIR);
        std::fs::create_dir_all(checkpoints.join("other")).unwrap();

        let removed = rotate_checkpoints(&checkpoints, 2).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!checkpoint_dir(out.path(), 100).exists());
        assert!(!checkpoint_dir(out.path(), 200).exists());
        assert!(checkpoint_dir(out.path(), 300).exists());
        assert!(checkpoint_dir(out.path(), 1000).exists());
        assert!(checkpoints.join("other").exists());

        assert!(rotate_checkpoints(&checkpoints, 2).unwrap().is_empty());
        assert!(rotate_checkpoints(&out.path().join("missing"), 1).unwrap().is_empty());
    }

    #[test]
    fn test_training_summary_json() {
        let out = TempDir::new().unwrap();
        let summary = TrainingSummary {
            model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            dataset: "stanfordnlp/snli:train".to_string(),
            num_pairs: 183416,
            batch_size: 16,
            epochs: 1,
            steps_per_epoch: 11464,
            global_step: 11464,
            warmup_steps: 1146,
            learning_rate: 2e-5,
            final_loss: Some(0.31),
            elapsed_secs: 12.5,
            interrupted: false,
        };
        let path = summary.save(out.path()).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["warmup_steps"], 1146);
        assert_eq!(json["interrupted"], false);
    }
}

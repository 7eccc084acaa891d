//! Evaluation of fine-tuned models
//!
//! Held-out entailment pairs are treated as a retrieval task: each anchor
//! must find its own positive among all positives of the evaluation set.

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use super::dataset::PairExample;
use super::models::{cosine_similarity, EmbeddingModel};

pub const RESULTS_FILE: &str = "pair_retrieval_results.csv";
const CSV_HEADER: [&str; 5] = ["epoch", "steps", "accuracy@1", "accuracy@5", "mrr@10"];

/// Result of pair retrieval evaluation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalMetrics {
    /// Number of anchors evaluated
    pub total: usize,
    pub accuracy_at_1: f64,
    pub accuracy_at_5: f64,
    /// Mean reciprocal rank, counting only ranks up to 10
    pub mrr_at_10: f64,
}

impl std::fmt::Display for RetrievalMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Acc@1: {:.2}% | Acc@5: {:.2}% | MRR@10: {:.4} ({} pairs)",
            self.accuracy_at_1 * 100.0,
            self.accuracy_at_5 * 100.0,
            self.mrr_at_10,
            self.total
        )
    }
}

/// Ranks every positive for each anchor by cosine similarity
pub struct PairRetrievalEvaluator {
    anchors: Vec<String>,
    positives: Vec<String>,
    batch_size: usize,
}

impl PairRetrievalEvaluator {
    pub fn new(pairs: &[PairExample], batch_size: usize) -> Result<Self> {
        if pairs.is_empty() {
            bail!("Evaluation set has no pairs");
        }
        if batch_size == 0 {
            bail!("Evaluation batch size must be positive");
        }
        let (anchors, positives) = pairs
            .iter()
            .map(|p| (p.anchor.clone(), p.positive.clone()))
            .unzip();
        Ok(Self {
            anchors,
            positives,
            batch_size,
        })
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Embed texts in batches, detached from the autograd graph
    fn embed(&self, model: &dyn EmbeddingModel, texts: &[String]) -> Result<Tensor> {
        let mut parts = Vec::with_capacity(texts.len().div_ceil(self.batch_size));
        for chunk in texts.chunks(self.batch_size) {
            parts.push(model.encode(chunk)?.detach());
        }
        Ok(Tensor::cat(&parts, 0)?)
    }

    pub fn evaluate(&self, model: &dyn EmbeddingModel) -> Result<RetrievalMetrics> {
        let anchors = self.embed(model, &self.anchors)?;
        let positives = self.embed(model, &self.positives)?;
        let scores: Vec<Vec<f32>> = cosine_similarity(&anchors, &positives)?.to_vec2()?;
        Ok(metrics_from_scores(&scores))
    }

    /// Evaluate and append a row to `output_dir/eval/pair_retrieval_results.csv`
    pub fn evaluate_and_record(
        &self,
        model: &dyn EmbeddingModel,
        output_dir: &Path,
        epoch: usize,
        steps: usize,
    ) -> Result<RetrievalMetrics> {
        let metrics = self.evaluate(model)?;
        tracing::info!("Pair retrieval after epoch {}: {}", epoch, metrics);
        append_results(output_dir, epoch, steps, &metrics)?;
        Ok(metrics)
    }
}

/// 1-based rank of the correct column in each row
///
/// Ties are resolved in favour of the correct column.
fn metrics_from_scores(scores: &[Vec<f32>]) -> RetrievalMetrics {
    let total = scores.len();
    if total == 0 {
        return RetrievalMetrics::default();
    }

    let mut hits_1 = 0usize;
    let mut hits_5 = 0usize;
    let mut mrr = 0f64;
    for (i, row) in scores.iter().enumerate() {
        let target = row[i];
        let rank = 1 + row.iter().filter(|s| **s > target).count();
        if rank == 1 {
            hits_1 += 1;
        }
        if rank <= 5 {
            hits_5 += 1;
        }
        if rank <= 10 {
            mrr += 1.0 / rank as f64;
        }
    }

    RetrievalMetrics {
        total,
        accuracy_at_1: hits_1 as f64 / total as f64,
        accuracy_at_5: hits_5 as f64 / total as f64,
        mrr_at_10: mrr / total as f64,
    }
}

pub fn results_path(output_dir: &Path) -> PathBuf {
    output_dir.join("eval").join(RESULTS_FILE)
}

fn append_results(
    output_dir: &Path,
    epoch: usize,
    steps: usize,
    metrics: &RetrievalMetrics,
) -> Result<()> {
    let path = results_path(output_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let write_header = !path.exists();

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if write_header {
        writer.write_record(CSV_HEADER)?;
    }
    writer.write_record(&[
        epoch.to_string(),
        steps.to_string(),
        metrics.accuracy_at_1.to_string(),
        metrics.accuracy_at_5.to_string(),
        metrics.mrr_at_10.to_string(),
    ])?;
    writer.flush()?;
    Ok(())
}

//! Dataset loading, filtering and batching
//!
//! NLI records (premise / hypothesis / label) are read from parquet, JSONL or
//! CSV, filtered down to entailment pairs, and served in shuffled batches.

use anyhow::{anyhow, bail, Context, Result};
use arrow::array::{Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::hub::HubApi;

/// NLI gold label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NliLabel {
    Entailment,
    Neutral,
    Contradiction,
    /// No gold label (-1 in SNLI) or an unknown value
    Unlabeled,
}

impl From<i64> for NliLabel {
    fn from(value: i64) -> Self {
        match value {
            0 => Self::Entailment,
            1 => Self::Neutral,
            2 => Self::Contradiction,
            _ => Self::Unlabeled,
        }
    }
}

/// A single premise/hypothesis record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NliRecord {
    pub premise: String,
    pub hypothesis: String,
    pub label: i64,
}

impl NliRecord {
    pub fn label(&self) -> NliLabel {
        NliLabel::from(self.label)
    }
}

/// A positive sentence pair for contrastive training
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairExample {
    pub anchor: String,
    pub positive: String,
}

/// Keep entailment records only, in input order
pub fn entailment_pairs(records: &[NliRecord]) -> Vec<PairExample> {
    records
        .iter()
        .filter(|r| r.label() == NliLabel::Entailment)
        .map(|r| PairExample {
            anchor: r.premise.clone(),
            positive: r.hypothesis.clone(),
        })
        .collect()
}

/// Label distribution of a record set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetStats {
    pub total_records: usize,
    pub entailment: usize,
    pub neutral: usize,
    pub contradiction: usize,
    pub unlabeled: usize,
}

impl DatasetStats {
    pub fn from_records(records: &[NliRecord]) -> Self {
        let mut stats = Self {
            total_records: records.len(),
            ..Default::default()
        };
        for record in records {
            match record.label() {
                NliLabel::Entailment => stats.entailment += 1,
                NliLabel::Neutral => stats.neutral += 1,
                NliLabel::Contradiction => stats.contradiction += 1,
                NliLabel::Unlabeled => stats.unlabeled += 1,
            }
        }
        stats
    }
}

impl std::fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} records: {} entailment, {} neutral, {} contradiction, {} unlabeled",
            self.total_records, self.entailment, self.neutral, self.contradiction, self.unlabeled
        )
    }
}

/// Raw NLI records
#[derive(Debug, Default)]
pub struct NliDataset {
    records: Vec<NliRecord>,
}

impl NliDataset {
    pub fn new(records: Vec<NliRecord>) -> Self {
        Self { records }
    }

    /// Load records from a file, choosing the format by extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let dataset = match extension.as_str() {
            "parquet" => Self::from_parquet(path)?,
            "csv" => Self::from_csv(path)?,
            "jsonl" | "json" => Self::from_jsonl(path)?,
            other => bail!(
                "Unsupported dataset format '{}' for {:?} (expected parquet, jsonl or csv)",
                other,
                path
            ),
        };

        tracing::info!("Loaded {} NLI records from {:?}", dataset.len(), path);
        Ok(dataset)
    }

    /// Load records from a parquet file in the HF NLI layout
    pub fn from_parquet(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open parquet file: {:?}", path))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("Failed to read parquet metadata: {:?}", path))?
            .build()?;

        let mut records = Vec::new();
        for batch in reader {
            let batch = batch?;
            records.extend(records_from_batch(&batch)?);
        }

        Ok(Self { records })
    }

    /// Load records from JSONL (`{"premise", "hypothesis", "label"}` per line)
    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open dataset file: {:?}", path))?;

        let mut records = Vec::new();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: NliRecord = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse JSON at line {}", line_num + 1))?;
            records.push(record);
        }

        Ok(Self { records })
    }

    /// Load records from CSV with `premise`, `hypothesis` and `label` columns
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("Failed to open CSV file: {:?}", path))?;

        let mut records = Vec::new();
        for (row_num, result) in reader.deserialize().enumerate() {
            let record: NliRecord =
                result.with_context(|| format!("Failed to read CSV row {}", row_num + 1))?;
            records.push(record);
        }

        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[NliRecord] {
        &self.records
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats::from_records(&self.records)
    }

    pub fn entailment_pairs(&self) -> Vec<PairExample> {
        entailment_pairs(&self.records)
    }
}

fn string_column(batch: &RecordBatch, name: &str) -> Result<StringArray> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("Parquet file has no '{}' column", name))?;
    let column = cast(column.as_ref(), &DataType::Utf8)
        .with_context(|| format!("Column '{}' is not a string column", name))?;
    column
        .as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| anyhow!("Column '{}' is not a string column", name))
}

fn label_column(batch: &RecordBatch) -> Result<Int64Array> {
    let column = batch
        .column_by_name("label")
        .ok_or_else(|| anyhow!("Parquet file has no 'label' column"))?;
    let column =
        cast(column.as_ref(), &DataType::Int64).context("Column 'label' is not an integer column")?;
    column
        .as_any()
        .downcast_ref::<Int64Array>()
        .cloned()
        .ok_or_else(|| anyhow!("Column 'label' is not an integer column"))
}

fn records_from_batch(batch: &RecordBatch) -> Result<Vec<NliRecord>> {
    let premises = string_column(batch, "premise")?;
    let hypotheses = string_column(batch, "hypothesis")?;
    let labels = label_column(batch)?;

    let mut records = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let label = if labels.is_null(i) { -1 } else { labels.value(i) };
        records.push(NliRecord {
            premise: premises.value(i).to_string(),
            hypothesis: hypotheses.value(i).to_string(),
            label,
        });
    }
    Ok(records)
}

/// Read prepared pairs (`{"anchor", "positive"}` per line)
pub fn read_pairs_jsonl(path: impl AsRef<Path>) -> Result<Vec<PairExample>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open pairs file: {:?}", path))?;

    let mut pairs = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let pair: PairExample = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse pair at line {}", line_num + 1))?;
        pairs.push(pair);
    }
    Ok(pairs)
}

/// Write pairs as JSONL
pub fn write_pairs_jsonl(path: impl AsRef<Path>, pairs: &[PairExample]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file =
        File::create(path).with_context(|| format!("Failed to create pairs file: {:?}", path))?;
    let mut writer = BufWriter::new(file);
    for pair in pairs {
        serde_json::to_writer(&mut writer, pair)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Whether a JSONL file holds prepared pairs rather than NLI records
fn is_pairs_jsonl(path: &Path) -> Result<bool> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        return Ok(serde_json::from_str::<PairExample>(&line).is_ok());
    }
    Ok(false)
}

/// Where training records come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// A split of a Hub dataset repository
    Hub { repo: String, split: String },
    /// A local parquet / JSONL / CSV file
    Local(PathBuf),
}

impl DataSource {
    /// Load entailment pairs from this source
    ///
    /// Prepared pair files are used as is. NLI record files are filtered to
    /// entailment pairs; their label statistics are returned alongside.
    pub fn load_pairs(&self, hub: Option<&HubApi>) -> Result<(Vec<PairExample>, Option<DatasetStats>)> {
        let path = match self {
            Self::Local(path) => {
                let is_jsonl = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("jsonl"));
                if is_jsonl && is_pairs_jsonl(path)? {
                    let pairs = read_pairs_jsonl(path)?;
                    tracing::info!("Loaded {} prepared pairs from {:?}", pairs.len(), path);
                    return Ok((pairs, None));
                }
                path.clone()
            }
            Self::Hub { repo, split } => {
                let hub = hub.ok_or_else(|| anyhow!("Hub access required for dataset {}", repo))?;
                hub.download_dataset_split(repo, split)?
            }
        };

        let dataset = NliDataset::load(&path)?;
        let stats = dataset.stats();
        let pairs = dataset.entailment_pairs();
        tracing::info!("{}", stats);
        tracing::info!("Kept {} entailment pairs", pairs.len());
        Ok((pairs, Some(stats)))
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hub { repo, split } => write!(f, "{}:{}", repo, split),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Batch loader configuration
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Reshuffle at the start of every epoch
    pub shuffle: bool,
    /// Seed for shuffling; entropy when unset
    pub seed: Option<u64>,
    /// Never place the same text twice in one batch
    pub no_duplicates: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            shuffle: true,
            seed: None,
            no_duplicates: false,
        }
    }
}

/// Batches pairs for training, reshuffling every epoch
pub struct PairDataLoader {
    pairs: Vec<PairExample>,
    config: LoaderConfig,
    rng: StdRng,
    /// Batch plans drawn ahead by `plan_epochs`, replayed by `epoch`
    planned: VecDeque<Vec<Vec<usize>>>,
}

impl PairDataLoader {
    pub fn new(pairs: Vec<PairExample>, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            pairs,
            config,
            rng,
            planned: VecDeque::new(),
        })
    }

    /// Number of batches per epoch
    ///
    /// Without `no_duplicates` the last batch may be partial. With it, only
    /// full batches are produced and this is an upper bound; use
    /// [`plan_epochs`](Self::plan_epochs) for exact counts.
    pub fn len(&self) -> usize {
        if self.config.no_duplicates {
            self.pairs.len() / self.config.batch_size
        } else {
            self.pairs.len().div_ceil(self.config.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Draw the batches of the next `epochs` epochs and return their lengths
    ///
    /// Following calls to [`epoch`](Self::epoch) replay these plans in order,
    /// so the counts are exact. Shuffling consumes the RNG the same way as
    /// unplanned epochs.
    pub fn plan_epochs(&mut self, epochs: usize) -> Vec<usize> {
        while self.planned.len() < epochs {
            let plan = self.draw_epoch();
            self.planned.push_back(plan);
        }
        self.planned.iter().take(epochs).map(Vec::len).collect()
    }

    /// Batches for one epoch
    pub fn epoch(&mut self) -> EpochBatches<'_> {
        let batches = match self.planned.pop_front() {
            Some(plan) => plan,
            None => self.draw_epoch(),
        };

        EpochBatches {
            pairs: &self.pairs,
            batches: batches.into_iter(),
        }
    }

    fn draw_epoch(&mut self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.pairs.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut self.rng);
        }

        if self.config.no_duplicates {
            self.unique_batches(order)
        } else {
            order
                .chunks(self.config.batch_size)
                .map(|c| c.to_vec())
                .collect()
        }
    }

    fn unique_batches(&self, order: Vec<usize>) -> Vec<Vec<usize>> {
        let batch_size = self.config.batch_size;
        let mut queue: VecDeque<usize> = order.into();
        let mut batches = Vec::new();

        loop {
            let mut batch = Vec::with_capacity(batch_size);
            let mut texts: HashSet<&str> = HashSet::new();
            let mut deferred = VecDeque::new();

            while batch.len() < batch_size {
                let Some(idx) = queue.pop_front() else { break };
                let pair = &self.pairs[idx];
                if texts.contains(pair.anchor.as_str()) || texts.contains(pair.positive.as_str()) {
                    deferred.push_back(idx);
                    continue;
                }
                texts.insert(&pair.anchor);
                texts.insert(&pair.positive);
                batch.push(idx);
            }

            // deferred pairs go back in front, in their original order
            while let Some(idx) = deferred.pop_back() {
                queue.push_front(idx);
            }

            if batch.len() < batch_size {
                break;
            }
            batches.push(batch);
        }

        batches
    }
}

/// Iterator over one epoch of batches
pub struct EpochBatches<'a> {
    pairs: &'a [PairExample],
    batches: std::vec::IntoIter<Vec<usize>>,
}

impl<'a> Iterator for EpochBatches<'a> {
    type Item = Vec<&'a PairExample>;

    fn next(&mut self) -> Option<Self::Item> {
        self.batches
            .next()
            .map(|idx| idx.into_iter().map(|i| &self.pairs[i]).collect())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.batches.size_hint()
    }
}

impl ExactSizeIterator for EpochBatches<'_> {}

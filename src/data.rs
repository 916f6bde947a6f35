//! Dataset preparation: from raw text to fixed-length token records
//!
//! The preparer resolves a named dataset split, tokenizes every example with
//! truncation and fixed-length padding, and drops everything but token ids
//! and attention masks. Tokenization runs over fixed-size groups purely for
//! throughput; the result is identical to per-example tokenization and
//! preserves example order.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::Deserialize;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::info;

use crate::config::JobConfig;
use crate::error::{Error, Result};

/// Examples tokenized per `encode_batch` call
const TOKENIZE_GROUP: usize = 64;

/// One fixed-length tokenized training record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// Token ids, exactly `max_length` long
    pub input_ids: Vec<u32>,
    /// Attention mask, exactly `max_length` long; 1 for real tokens, 0 for padding
    pub attention_mask: Vec<u32>,
}

/// Ordered sequence of fixed-length token records
///
/// Built once per job run and discarded after training completes.
#[derive(Debug)]
pub struct PreparedDataset {
    records: Vec<TokenRecord>,
    max_length: usize,
}

/// JSONL row shape; any additional fields are dropped here
#[derive(Deserialize)]
struct TextRow {
    text: String,
}

impl PreparedDataset {
    /// Wrap pre-tokenized records, asserting the fixed-length invariant
    pub fn from_records(records: Vec<TokenRecord>, max_length: usize) -> Self {
        debug_assert!(records
            .iter()
            .all(|r| r.input_ids.len() == max_length && r.attention_mask.len() == max_length));
        Self {
            records,
            max_length,
        }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the dataset holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fixed record length
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// The prepared records, in source order
    pub fn records(&self) -> &[TokenRecord] {
        &self.records
    }

    /// Batches per epoch at the given batch size (last batch may be partial)
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.records.len().div_ceil(batch_size)
    }

    /// Iterate `(input_ids, attention_mask)` tensor pairs of shape `(B, T)`
    pub fn batches<'a>(&'a self, batch_size: usize, device: &'a Device) -> Batches<'a> {
        Batches {
            records: &self.records,
            max_length: self.max_length,
            batch_size,
            device,
            cursor: 0,
        }
    }
}

/// Iterator over batch tensors of a [`PreparedDataset`]
pub struct Batches<'a> {
    records: &'a [TokenRecord],
    max_length: usize,
    batch_size: usize,
    device: &'a Device,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.records.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.records.len());
        let chunk = &self.records[self.cursor..end];
        self.cursor = end;

        let rows = chunk.len();
        let mut ids = Vec::with_capacity(rows * self.max_length);
        let mut mask = Vec::with_capacity(rows * self.max_length);
        for record in chunk {
            ids.extend_from_slice(&record.input_ids);
            mask.extend_from_slice(&record.attention_mask);
        }

        let shape = (rows, self.max_length);
        let ids = Tensor::from_vec(ids, shape, self.device);
        let mask = Tensor::from_vec(mask, shape, self.device);
        Some(match (ids, mask) {
            (Ok(ids), Ok(mask)) => Ok((ids, mask)),
            (Err(e), _) | (_, Err(e)) => Err(e.into()),
        })
    }
}

/// Load and tokenize the configured dataset split
pub fn prepare(config: &JobConfig, tokenizer: &Tokenizer) -> Result<PreparedDataset> {
    let max_length = config.data.max_length;
    let split_path = resolve_split(&config.data.name, &config.data.split)?;
    info!(
        "Preparing dataset {} (split {} at {})",
        config.data.name,
        config.data.split,
        split_path.display()
    );

    let texts = read_examples(&split_path)?;
    if texts.is_empty() {
        return Err(Error::data(format!(
            "split {} of {} contains no examples",
            config.data.split, config.data.name
        )));
    }

    let tokenizer = fixed_length_tokenizer(tokenizer, max_length)?;

    let mut records = Vec::with_capacity(texts.len());
    for group in texts.chunks(TOKENIZE_GROUP) {
        let inputs: Vec<&str> = group.iter().map(String::as_str).collect();
        let encodings = tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| Error::data(format!("tokenization failed: {e}")))?;
        for encoding in encodings {
            let record = TokenRecord {
                input_ids: encoding.get_ids().to_vec(),
                attention_mask: encoding.get_attention_mask().to_vec(),
            };
            // Truncation plus fixed padding guarantees this; a violation is
            // an invariant breach, not a normal data condition.
            if record.input_ids.len() != max_length || record.attention_mask.len() != max_length {
                return Err(Error::data(format!(
                    "tokenized record of length {} cannot be reconciled with max_length {}",
                    record.input_ids.len(),
                    max_length
                )));
            }
            records.push(record);
        }
    }

    info!("Prepared {} records of length {}", records.len(), max_length);
    Ok(PreparedDataset {
        records,
        max_length,
    })
}

/// Resolve a dataset reference plus split name to a concrete file
///
/// A directory reference resolves to `<dir>/<split>.jsonl`, falling back to
/// `<dir>/<split>.txt`; a file reference is used directly.
fn resolve_split(name: &str, split: &str) -> Result<PathBuf> {
    let base = Path::new(name);
    if base.is_file() {
        return Ok(base.to_path_buf());
    }
    if base.is_dir() {
        for ext in ["jsonl", "txt"] {
            let candidate = base.join(format!("{split}.{ext}"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        return Err(Error::data(format!(
            "dataset {name} has no file for split {split}"
        )));
    }
    Err(Error::data(format!("dataset reference {name} not found")))
}

/// Read raw text examples from a split file
///
/// JSONL rows must carry a `text` field; plain-text files contribute one
/// example per non-empty line.
fn read_examples(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::data(format!("cannot read {}: {}", path.display(), e)))?;

    let is_jsonl = path.extension().is_some_and(|ext| ext == "jsonl" || ext == "json");
    let mut texts = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if is_jsonl {
            let row: TextRow = serde_json::from_str(line).map_err(|e| {
                Error::data(format!(
                    "malformed record at {}:{}: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            texts.push(row.text);
        } else {
            texts.push(line.to_string());
        }
    }
    Ok(texts)
}

/// Clone the tokenizer with truncation and fixed-length padding attached
fn fixed_length_tokenizer(tokenizer: &Tokenizer, max_length: usize) -> Result<Tokenizer> {
    let mut tokenizer = tokenizer.clone();

    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(|e| Error::data(format!("invalid truncation parameters: {e}")))?;

    let pad_id = tokenizer.token_to_id("[PAD]").unwrap_or(0);
    let pad_token = tokenizer
        .id_to_token(pad_id)
        .unwrap_or_else(|| "[PAD]".to_string());
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::Fixed(max_length),
        pad_id,
        pad_token,
        ..Default::default()
    }));

    Ok(tokenizer)
}

//! Shared test fixtures: a tiny word-level tokenizer, synthetic datasets,
//! and a job configuration builder.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor, Var};

use crate::config::{DataConfig, JobConfig, MlflowConfig, ModelRef, TrainingParams};
use crate::data::{PreparedDataset, TokenRecord};
use crate::error::{Error, Result};
use crate::model::{CausalLm, ModelDims, TinyCausalLm};

/// Minimal word-level tokenizer with an 8-token vocabulary
///
/// `[UNK]`=0 and `[PAD]`=1; the remaining ids cover a handful of words used
/// by the synthetic corpora below.
pub const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": { "type": "Whitespace" },
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {
      "[UNK]": 0,
      "[PAD]": 1,
      "the": 2,
      "cat": 3,
      "sat": 4,
      "on": 5,
      "mat": 6,
      "dog": 7
    },
    "unk_token": "[UNK]"
  }
}"#;

/// Vocabulary size of [`TOKENIZER_JSON`]
pub const TOKENIZER_VOCAB: usize = 8;

/// Write the fixture tokenizer into `dir` and return its path
pub fn write_tokenizer(dir: &Path) -> PathBuf {
    let path = dir.join("tokenizer.json");
    std::fs::write(&path, TOKENIZER_JSON).unwrap();
    path
}

/// Write a JSONL dataset split of `n` lines into `dir/<split>.jsonl`
pub fn write_jsonl_split(dir: &Path, split: &str, n: usize) -> PathBuf {
    let lines: Vec<&str> = (0..n)
        .map(|i| {
            if i % 2 == 0 {
                r#"{"text": "the cat sat on the mat"}"#
            } else {
                r#"{"text": "the dog sat on the mat"}"#
            }
        })
        .collect();
    let path = dir.join(format!("{split}.jsonl"));
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

/// Synthetic prepared dataset of `n` fixed-length records
pub fn synthetic_dataset(n: usize, max_length: usize) -> PreparedDataset {
    let records = (0..n)
        .map(|i| {
            let ids: Vec<u32> = (0..max_length)
                .map(|j| ((i + j) % (TOKENIZER_VOCAB - 2) + 2) as u32)
                .collect();
            TokenRecord {
                attention_mask: vec![1; ids.len()],
                input_ids: ids,
            }
        })
        .collect();
    PreparedDataset::from_records(records, max_length)
}

/// Freshly initialized CPU model matching the fixture tokenizer
pub fn tiny_model() -> TinyCausalLm {
    TinyCausalLm::new(
        ModelDims {
            vocab_size: TOKENIZER_VOCAB,
            hidden_size: 8,
        },
        &Device::Cpu,
    )
    .unwrap()
}

/// Causal LM whose forward pass fails after a fixed number of calls
pub struct FailingModel {
    inner: TinyCausalLm,
    fail_after: usize,
    calls: Cell<usize>,
}

impl FailingModel {
    /// Fail every forward from call number `fail_after` (zero-based) onwards
    pub fn new(inner: TinyCausalLm, fail_after: usize) -> Self {
        Self {
            inner,
            fail_after,
            calls: Cell::new(0),
        }
    }
}

impl CausalLm for FailingModel {
    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        if call >= self.fail_after {
            return Err(Error::data("synthetic forward failure"));
        }
        self.inner.forward(input_ids)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.inner.trainable_vars()
    }

    fn save(&self, dir: &Path) -> Result<()> {
        self.inner.save(dir)
    }
}

/// Job configuration rooted at temporary directories
pub fn job_config(model_name: &str, data_name: &str, output_dir: &Path) -> JobConfig {
    JobConfig {
        model: ModelRef {
            name: model_name.to_string(),
        },
        data: DataConfig {
            name: data_name.to_string(),
            split: "train".to_string(),
            max_length: 8,
        },
        training: TrainingParams {
            output_dir: output_dir.to_path_buf(),
            num_epochs: 2,
            batch_size: 4,
            warmup_steps: 2,
            weight_decay: 0.01,
            learning_rate: 1e-3,
            logging_dir: output_dir.join("logs"),
            logging_steps: 1,
        },
        mlflow: MlflowConfig {
            tracking_uri: "http://localhost:5000".to_string(),
            experiment_name: "fixture".to_string(),
        },
    }
}

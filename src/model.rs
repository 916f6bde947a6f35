//! Causal language model abstraction and the built-in candle implementation
//!
//! The training loop and orchestrator treat the model as an opaque capability
//! provider behind the [`CausalLm`] trait: it maps token ids to next-token
//! logits, exposes its trainable variables to the optimizer, and knows how to
//! persist itself into an artifact directory.

use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// File name of the serialized weights inside an artifact directory
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// File name of the model dimensions inside an artifact directory
pub const MODEL_CONFIG_FILE: &str = "config.json";

/// Trainable causal language model
pub trait CausalLm: Send {
    /// Size of the vocabulary the model produces logits over
    fn vocab_size(&self) -> usize;

    /// Map token ids `(batch, seq)` to logits `(batch, seq, vocab)`
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Variables the optimizer updates
    fn trainable_vars(&self) -> Vec<Var>;

    /// Persist weights and model configuration into `dir`
    fn save(&self, dir: &Path) -> Result<()>;
}

/// Model dimensions persisted alongside the weights
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDims {
    /// Vocabulary size; must match the paired tokenizer
    pub vocab_size: usize,
    /// Width of the embedding and hidden layers
    pub hidden_size: usize,
}

impl ModelDims {
    /// Default dimensions for a given vocabulary
    pub fn for_vocab(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: 64,
        }
    }
}

/// Small candle-nn causal language model
///
/// Token embedding followed by a position-wise feed-forward head; every
/// position attends only to itself, so the architecture is causal by
/// construction. Weights live in a [`VarMap`] so the optimizer and the
/// safetensors serializer share one view of the parameters.
pub struct TinyCausalLm {
    dims: ModelDims,
    var_map: VarMap,
    embed: Embedding,
    hidden: Linear,
    lm_head: Linear,
}

impl std::fmt::Debug for TinyCausalLm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TinyCausalLm")
            .field("dims", &self.dims)
            .finish_non_exhaustive()
    }
}

impl TinyCausalLm {
    /// Build a freshly initialized model on the given device
    pub fn new(dims: ModelDims, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let embed = embedding(dims.vocab_size, dims.hidden_size, vb.pp("embed"))?;
        let hidden = linear(dims.hidden_size, dims.hidden_size, vb.pp("hidden"))?;
        let lm_head = linear(dims.hidden_size, dims.vocab_size, vb.pp("lm_head"))?;

        Ok(Self {
            dims,
            var_map,
            embed,
            hidden,
            lm_head,
        })
    }

    /// Load a model from an artifact directory produced by [`CausalLm::save`]
    ///
    /// Reads the dimensions from `config.json` and, when present, the weights
    /// from `model.safetensors`. A missing weights file yields a
    /// fresh-initialized model so a directory holding only a tokenizer still
    /// provisions.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let config_path = dir.join(MODEL_CONFIG_FILE);
        let content = fs::read_to_string(&config_path).map_err(|e| {
            Error::resource(format!("cannot read {}: {}", config_path.display(), e))
        })?;
        let dims: ModelDims = serde_json::from_str(&content).map_err(|e| {
            Error::resource(format!("malformed {}: {}", config_path.display(), e))
        })?;

        let mut model = Self::new(dims, device)?;
        let weights_path = dir.join(WEIGHTS_FILE);
        if weights_path.exists() {
            model.var_map.load(&weights_path)?;
            info!("Loaded model weights from {}", weights_path.display());
        } else {
            warn!(
                "No weights at {}; starting from fresh initialization",
                weights_path.display()
            );
        }
        Ok(model)
    }

    /// Model dimensions
    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }
}

impl CausalLm for TinyCausalLm {
    fn vocab_size(&self) -> usize {
        self.dims.vocab_size
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let embedded = self.embed.forward(input_ids)?;
        let activated = self.hidden.forward(&embedded)?.relu()?;
        let logits = self.lm_head.forward(&activated)?;
        Ok(logits)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.var_map.all_vars()
    }

    fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        self.var_map.save(dir.join(WEIGHTS_FILE))?;
        fs::write(
            dir.join(MODEL_CONFIG_FILE),
            serde_json::to_string_pretty(&self.dims)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn forward_produces_vocab_logits() {
        let model = TinyCausalLm::new(ModelDims::for_vocab(16), &Device::Cpu).unwrap();
        let ids = Tensor::from_vec(vec![1u32, 2, 3, 4, 5, 6], (2, 3), &Device::Cpu).unwrap();
        let logits = model.forward(&ids).unwrap();
        assert_eq!(logits.dims3().unwrap(), (2, 3, 16));
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let model = TinyCausalLm::new(
            ModelDims {
                vocab_size: 12,
                hidden_size: 8,
            },
            &Device::Cpu,
        )
        .unwrap();
        model.save(dir.path()).unwrap();
        assert!(dir.path().join(WEIGHTS_FILE).exists());
        assert!(dir.path().join(MODEL_CONFIG_FILE).exists());

        let reloaded = TinyCausalLm::from_dir(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(reloaded.dims().vocab_size, 12);
        assert_eq!(reloaded.dims().hidden_size, 8);
    }

    #[test]
    fn missing_config_is_resource_error() {
        let dir = TempDir::new().unwrap();
        let err = TinyCausalLm::from_dir(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn config_only_directory_initializes_fresh_weights() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(MODEL_CONFIG_FILE),
            serde_json::to_string(&ModelDims::for_vocab(8)).unwrap(),
        )
        .unwrap();
        let model = TinyCausalLm::from_dir(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(model.vocab_size(), 8);
        assert!(!model.trainable_vars().is_empty());
    }
}

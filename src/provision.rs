//! Resource provisioning: device placement plus model/tokenizer instantiation
//!
//! A model reference is resolved as a local artifact directory first, then as
//! a HuggingFace Hub id. Provisioning ends with a tokenize-encode sanity
//! round trip so a tokenizer/model vocabulary mismatch fails the job before
//! any training happens. Device memory held by a partially-provisioned model
//! is released on drop.

use std::path::Path;

use async_trait::async_trait;
use candle_core::Device;
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{CausalLm, ModelDims, TinyCausalLm, MODEL_CONFIG_FILE};

/// Text encoded during the vocabulary sanity round trip
const PROBE_TEXT: &str = "the quick brown fox jumps over the lazy dog";

/// Resolved compute placement and the instantiated model/tokenizer pair
///
/// Owned exclusively by one job for its duration.
pub struct ComputeContext {
    /// Device the model weights live on
    pub device: Device,
    /// The model under training
    pub model: Box<dyn CausalLm>,
    /// Tokenizer sharing the model's vocabulary
    pub tokenizer: Tokenizer,
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Source of provisioned compute contexts
///
/// The orchestrator provisions through this seam so tests can substitute
/// their own model and tokenizer; [`HubProvisioner`] is the production
/// implementation.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Resolve `model_ref` into a ready compute context on `device`
    async fn provision(&self, model_ref: &str, device: &Device) -> Result<ComputeContext>;
}

/// Provisioner backed by local artifact directories and the HuggingFace Hub
pub struct HubProvisioner;

#[async_trait]
impl Provisioner for HubProvisioner {
    async fn provision(&self, model_ref: &str, device: &Device) -> Result<ComputeContext> {
        provision(model_ref, device).await
    }
}

/// Instantiate the model and tokenizer named by `model_ref` on `device`
pub async fn provision(model_ref: &str, device: &Device) -> Result<ComputeContext> {
    info!("Provisioning model and tokenizer: {model_ref}");

    let local = Path::new(model_ref);
    let (tokenizer, model) = if local.is_dir() {
        provision_local(local, device)?
    } else {
        provision_from_hub(model_ref, device).await?
    };

    check_vocabulary(&tokenizer, model.as_ref())?;
    info!(
        "Provisioned {} (vocab size {}) on {:?}",
        model_ref,
        model.vocab_size(),
        device
    );

    Ok(ComputeContext {
        device: device.clone(),
        model,
        tokenizer,
    })
}

/// Load tokenizer and model from a local artifact directory
fn provision_local(dir: &Path, device: &Device) -> Result<(Tokenizer, Box<dyn CausalLm>)> {
    debug!("Resolving {} as a local artifact directory", dir.display());

    let tokenizer_path = dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
        Error::resource(format!(
            "cannot load tokenizer from {}: {}",
            tokenizer_path.display(),
            e
        ))
    })?;

    let model: Box<dyn CausalLm> = if dir.join(MODEL_CONFIG_FILE).exists() {
        Box::new(TinyCausalLm::from_dir(dir, device)?)
    } else {
        warn!(
            "{} has no {MODEL_CONFIG_FILE}; initializing fresh weights sized to the tokenizer",
            dir.display()
        );
        let dims = ModelDims::for_vocab(tokenizer.get_vocab_size(true));
        Box::new(TinyCausalLm::new(dims, device)?)
    };

    Ok((tokenizer, model))
}

/// Fetch the tokenizer for a Hub model id and pair it with fresh weights
async fn provision_from_hub(model_ref: &str, device: &Device) -> Result<(Tokenizer, Box<dyn CausalLm>)> {
    debug!("Resolving {model_ref} via the HuggingFace Hub");

    let api = Api::new().map_err(|e| Error::resource(format!("hub client: {e}")))?;
    let repo = api.model(model_ref.to_string());
    let tokenizer_path = repo.get("tokenizer.json").await.map_err(|e| {
        Error::resource(format!("cannot resolve {model_ref} on the hub: {e}"))
    })?;

    let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
        Error::resource(format!("cannot load hub tokenizer for {model_ref}: {e}"))
    })?;

    warn!("Hub reference {model_ref} provides no compatible weights; initializing fresh");
    let dims = ModelDims::for_vocab(tokenizer.get_vocab_size(true));
    let model: Box<dyn CausalLm> = Box::new(TinyCausalLm::new(dims, device)?);

    Ok((tokenizer, model))
}

/// Verify the tokenizer and model agree on one vocabulary
///
/// Declared sizes must match, and a probe encoding must only produce ids the
/// model can embed.
fn check_vocabulary(tokenizer: &Tokenizer, model: &dyn CausalLm) -> Result<()> {
    let tokenizer_vocab = tokenizer.get_vocab_size(true);
    let model_vocab = model.vocab_size();
    if tokenizer_vocab != model_vocab {
        return Err(Error::resource(format!(
            "tokenizer vocabulary ({tokenizer_vocab}) does not match model vocabulary ({model_vocab})"
        )));
    }

    let encoding = tokenizer
        .encode(PROBE_TEXT, true)
        .map_err(|e| Error::resource(format!("probe tokenization failed: {e}")))?;
    if let Some(&id) = encoding.get_ids().iter().find(|&&id| id as usize >= model_vocab) {
        return Err(Error::resource(format!(
            "probe produced token id {id} outside the model vocabulary ({model_vocab})"
        )));
    }

    debug!("Vocabulary sanity check passed ({model_vocab} tokens)");
    Ok(())
}

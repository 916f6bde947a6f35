//! Job configuration for the tuneforge orchestrator
//!
//! A job is described by a single declarative file (YAML, with JSON accepted
//! by extension) naming the model, the dataset split, the training
//! hyperparameters, and the MLflow tracking destination. The configuration is
//! parsed and validated eagerly so no other component ever observes a
//! partially-valid job description.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Complete configuration for one training job
///
/// Immutable once loaded. Unknown keys in the source document are ignored;
/// missing required keys are a [`Error::Config`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Model reference
    pub model: ModelRef,
    /// Dataset reference and tokenization limits
    pub data: DataConfig,
    /// Training hyperparameters and output locations
    pub training: TrainingParams,
    /// Experiment-tracking destination
    pub mlflow: MlflowConfig,
}

/// Named model reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    /// Model name: a local artifact directory or a HuggingFace Hub id
    pub name: String,
}

/// Dataset reference and tokenization limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset name: a local file or a directory containing per-split files
    pub name: String,
    /// Split to train on, e.g. `train`
    pub split: String,
    /// Fixed sequence length every record is truncated/padded to
    pub max_length: usize,
}

/// Training hyperparameters and output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    /// Directory receiving per-epoch checkpoints and the final artifact
    pub output_dir: PathBuf,
    /// Number of passes over the training split
    pub num_epochs: usize,
    /// Records per optimization step
    pub batch_size: usize,
    /// Steps of linear learning-rate warmup before steady-state decay
    pub warmup_steps: usize,
    /// AdamW weight decay
    pub weight_decay: f64,
    /// Peak learning rate
    pub learning_rate: f64,
    /// Directory for training logs
    pub logging_dir: PathBuf,
    /// Emit a step metric every this many steps
    pub logging_steps: usize,
}

/// Experiment-tracking destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlflowConfig {
    /// Base URI of the MLflow tracking server
    pub tracking_uri: String,
    /// Experiment the run is recorded under
    pub experiment_name: String,
}

impl JobConfig {
    /// Load and validate a job configuration from a file
    ///
    /// YAML is the primary format; a `.json` extension switches to JSON.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .map_err(|e| Error::config(format!("malformed JSON in {}: {}", path.display(), e)))?
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::config(format!("malformed YAML in {}: {}", path.display(), e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// All numeric hyperparameters must be positive, and the sequence length
    /// at least 2 so every record carries a next-token target.
    pub fn validate(&self) -> Result<()> {
        if self.model.name.is_empty() {
            return Err(Error::config("model.name must not be empty"));
        }
        if self.data.name.is_empty() {
            return Err(Error::config("data.name must not be empty"));
        }
        if self.data.split.is_empty() {
            return Err(Error::config("data.split must not be empty"));
        }
        if self.data.max_length < 2 {
            return Err(Error::config(
                "data.max_length must be at least 2 to leave room for a next-token target",
            ));
        }
        if self.training.num_epochs == 0 {
            return Err(Error::config("training.num_epochs must be positive"));
        }
        if self.training.batch_size == 0 {
            return Err(Error::config("training.batch_size must be positive"));
        }
        if self.training.warmup_steps == 0 {
            return Err(Error::config("training.warmup_steps must be positive"));
        }
        if self.training.logging_steps == 0 {
            return Err(Error::config("training.logging_steps must be positive"));
        }
        if self.training.learning_rate <= 0.0 {
            return Err(Error::config("training.learning_rate must be positive"));
        }
        if self.training.weight_decay <= 0.0 {
            return Err(Error::config("training.weight_decay must be positive"));
        }
        if self.mlflow.tracking_uri.is_empty() {
            return Err(Error::config("mlflow.tracking_uri must not be empty"));
        }
        if self.mlflow.experiment_name.is_empty() {
            return Err(Error::config("mlflow.experiment_name must not be empty"));
        }
        Ok(())
    }

    /// Flatten the configuration into the parameter map logged to the run
    pub fn as_params(&self) -> Vec<(String, String)> {
        vec![
            ("model_name".into(), self.model.name.clone()),
            ("dataset_name".into(), self.data.name.clone()),
            ("dataset_split".into(), self.data.split.clone()),
            ("max_length".into(), self.data.max_length.to_string()),
            (
                "output_dir".into(),
                self.training.output_dir.display().to_string(),
            ),
            ("num_epochs".into(), self.training.num_epochs.to_string()),
            ("batch_size".into(), self.training.batch_size.to_string()),
            (
                "warmup_steps".into(),
                self.training.warmup_steps.to_string(),
            ),
            (
                "weight_decay".into(),
                self.training.weight_decay.to_string(),
            ),
            (
                "learning_rate".into(),
                self.training.learning_rate.to_string(),
            ),
            (
                "logging_steps".into(),
                self.training.logging_steps.to_string(),
            ),
            (
                "experiment_name".into(),
                self.mlflow.experiment_name.clone(),
            ),
        ]
    }
}

//! tuneforge: configuration-driven fine-tuning jobs for causal language models
//!
//! A job is described entirely by a YAML (or JSON) config file naming the
//! model, dataset, hyperparameters, and tracking server. [`JobOrchestrator`]
//! runs the whole pipeline: provision compute and model, tokenize the
//! dataset into fixed-length records, train with warmup and per-epoch
//! checkpoints, export the final model, and record the run to MLflow.
//!
//! Tracking is deliberately non-fatal: a job whose MLflow server is down
//! still trains and exports, accumulating warnings instead of errors.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod job;
pub mod model;
pub mod provision;
pub mod tracking;
pub mod trainer;

#[cfg(test)]
pub(crate) mod fixtures;

pub use config::JobConfig;
pub use data::PreparedDataset;
pub use error::{Error, Result};
pub use job::{JobOrchestrator, JobOutcome};
pub use model::{CausalLm, TinyCausalLm};
pub use provision::{ComputeContext, HubProvisioner, Provisioner};
pub use tracking::{ExperimentRecorder, MlflowClient, OfflineBackend, TrackingBackend};
pub use trainer::{TrainResult, Trainer, TrainingEvent, TrainingState, TrainingStatus};

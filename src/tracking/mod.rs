//! Experiment tracking
//!
//! The [`TrackingBackend`] trait is the seam between the job pipeline and
//! whatever server records runs; [`MlflowClient`] is the MLflow REST
//! implementation and [`ExperimentRecorder`] wraps a backend with the
//! degradation policy that keeps tracking failures from killing a job.

use std::path::Path;

use async_trait::async_trait;

use crate::error::{Error, Result};

mod mlflow;
mod recorder;

pub use mlflow::MlflowClient;
pub use recorder::ExperimentRecorder;

/// Terminal status of a tracked run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The job produced its artifact
    Finished,
    /// The job aborted
    Failed,
}

impl RunStatus {
    /// Status string understood by the MLflow REST API
    pub fn as_mlflow(&self) -> &'static str {
        match self {
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// A single metric observation
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    /// Metric name
    pub key: String,
    /// Observed value
    pub value: f64,
    /// Training step the value belongs to
    pub step: usize,
}

impl MetricPoint {
    /// Convenience constructor
    pub fn new(key: impl Into<String>, value: f64, step: usize) -> Self {
        Self {
            key: key.into(),
            value,
            step,
        }
    }
}

/// Server-side operations needed to record one training run
#[async_trait]
pub trait TrackingBackend: Send + Sync {
    /// Create a run under the named experiment, returning its id
    async fn create_run(&self, experiment_name: &str) -> Result<String>;

    /// Log immutable run parameters
    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()>;

    /// Log a batch of metric observations
    async fn log_metrics(&self, run_id: &str, metrics: &[MetricPoint]) -> Result<()>;

    /// Set a tag on the run
    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()>;

    /// Upload a local artifact directory
    async fn log_artifact(&self, run_id: &str, local_path: &Path) -> Result<()>;

    /// Close the run with its terminal status
    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()>;
}

/// Stand-in backend used when no tracking client could be constructed
///
/// Every call returns the construction failure as a non-fatal
/// [`Error::Tracking`], so the recorder's degradation policy applies and the
/// job proceeds without a run.
pub struct OfflineBackend {
    reason: String,
}

impl OfflineBackend {
    /// Wrap the reason tracking is unavailable
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable(&self) -> Error {
        Error::tracking(format!("tracking unavailable: {}", self.reason))
    }
}

#[async_trait]
impl TrackingBackend for OfflineBackend {
    async fn create_run(&self, _experiment_name: &str) -> Result<String> {
        Err(self.unavailable())
    }

    async fn log_params(&self, _run_id: &str, _params: &[(String, String)]) -> Result<()> {
        Err(self.unavailable())
    }

    async fn log_metrics(&self, _run_id: &str, _metrics: &[MetricPoint]) -> Result<()> {
        Err(self.unavailable())
    }

    async fn set_tag(&self, _run_id: &str, _key: &str, _value: &str) -> Result<()> {
        Err(self.unavailable())
    }

    async fn log_artifact(&self, _run_id: &str, _local_path: &Path) -> Result<()> {
        Err(self.unavailable())
    }

    async fn end_run(&self, _run_id: &str, _status: RunStatus) -> Result<()> {
        Err(self.unavailable())
    }
}

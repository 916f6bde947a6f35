//! Degradation-tolerant recording of a single run
//!
//! Every backend failure is downgraded to a warning and accumulated; the
//! training job itself never fails because the tracking server is down.
//! Once a run has been finalized, further lifecycle calls are no-ops.

use std::path::Path;

use tracing::warn;

use super::{MetricPoint, RunStatus, TrackingBackend};

/// Records one training run against a [`TrackingBackend`]
pub struct ExperimentRecorder {
    backend: Box<dyn TrackingBackend>,
    experiment_name: String,
    run_id: Option<String>,
    finalized: bool,
    warnings: Vec<String>,
}

impl ExperimentRecorder {
    /// Wrap a backend for the named experiment
    pub fn new(backend: Box<dyn TrackingBackend>, experiment_name: impl Into<String>) -> Self {
        Self {
            backend,
            experiment_name: experiment_name.into(),
            run_id: None,
            finalized: false,
            warnings: Vec::new(),
        }
    }

    /// Id of the active run, if one was created
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Warnings accumulated from degraded tracking calls
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn degrade(&mut self, what: &str, err: crate::error::Error) {
        let message = format!("{what}: {err}");
        warn!("Tracking degraded - {message}");
        self.warnings.push(message);
    }

    /// Start a run; on failure the recorder continues without one
    pub async fn begin_run(&mut self) {
        if self.run_id.is_some() || self.finalized {
            return;
        }
        match self.backend.create_run(&self.experiment_name).await {
            Ok(run_id) => self.run_id = Some(run_id),
            Err(e) => self.degrade("failed to create run", e),
        }
    }

    /// Log run parameters
    pub async fn log_params(&mut self, params: &[(String, String)]) {
        let Some(run_id) = self.run_id.clone() else {
            return;
        };
        if let Err(e) = self.backend.log_params(&run_id, params).await {
            self.degrade("failed to log params", e);
        }
    }

    /// Log a batch of metric observations
    pub async fn log_metrics(&mut self, metrics: &[MetricPoint]) {
        if metrics.is_empty() {
            return;
        }
        let Some(run_id) = self.run_id.clone() else {
            return;
        };
        if let Err(e) = self.backend.log_metrics(&run_id, metrics).await {
            self.degrade("failed to log metrics", e);
        }
    }

    /// Set a tag on the run
    pub async fn set_tag(&mut self, key: &str, value: &str) {
        let Some(run_id) = self.run_id.clone() else {
            return;
        };
        if let Err(e) = self.backend.set_tag(&run_id, key, value).await {
            self.degrade("failed to set tag", e);
        }
    }

    /// Upload an artifact directory
    pub async fn log_artifact(&mut self, local_path: &Path) {
        let Some(run_id) = self.run_id.clone() else {
            return;
        };
        if let Err(e) = self.backend.log_artifact(&run_id, local_path).await {
            self.degrade("failed to upload artifact", e);
        }
    }

    /// Close the run; only the first call reaches the backend
    pub async fn end_run(&mut self, status: RunStatus) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        let Some(run_id) = self.run_id.clone() else {
            return;
        };
        if let Err(e) = self.backend.end_run(&run_id, status).await {
            self.degrade("failed to end run", e);
        }
    }
}

//! Error types for the tuneforge job orchestrator

use thiserror::Error;

/// Main error type for tuneforge operations
///
/// The first five variants mirror the failure taxonomy of a training job:
/// configuration, resource provisioning, dataset preparation, the training
/// loop itself, and the experiment-tracking backend. Only tracking failures
/// are non-fatal; everything else aborts the job.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing configuration; the job never starts
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model/tokenizer reference unresolvable or incompatible
    #[error("Resource error: {0}")]
    Resource(String),

    /// Dataset or split unresolvable, or a record violates the tokenized-length invariant
    #[error("Data error: {0}")]
    Data(String),

    /// Failure inside the step loop; carries the loop position for diagnostics
    #[error("Training error at epoch {epoch}, step {step}: {reason}")]
    Training {
        /// Epoch the loop had reached when the failure occurred
        epoch: usize,
        /// Global step the loop had reached when the failure occurred
        step: usize,
        /// Underlying failure description
        reason: String,
    },

    /// Tracking backend unreachable; degraded to local-artifact-only mode
    #[error("Tracking error: {0}")]
    Tracking(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for tuneforge operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a resource provisioning error
    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    /// Create a dataset preparation error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a training-loop error positioned at the given epoch and step
    pub fn training(epoch: usize, step: usize, reason: impl Into<String>) -> Self {
        Self::Training {
            epoch,
            step,
            reason: reason.into(),
        }
    }

    /// Create a tracking backend error
    pub fn tracking(msg: impl Into<String>) -> Self {
        Self::Tracking(msg.into())
    }

    /// Whether this error aborts the job
    ///
    /// Tracking failures are recorded as warnings; the on-disk artifact
    /// remains the source of truth.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Tracking(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Tracking(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_errors_are_non_fatal() {
        assert!(!Error::tracking("server unreachable").is_fatal());
        assert!(Error::config("missing field").is_fatal());
        assert!(Error::training(1, 42, "nan loss").is_fatal());
    }

    #[test]
    fn training_error_reports_loop_position() {
        let msg = Error::training(2, 17, "loss diverged").to_string();
        assert!(msg.contains("epoch 2"));
        assert!(msg.contains("step 17"));
    }
}

//! End-to-end training job pipeline
//!
//! The orchestrator runs the fixed sequence load config → provision →
//! prepare data → train → save artifact, recording the run against the
//! tracking server along the way. Tracking degradation never fails the job;
//! every other stage error finalizes the run as failed and propagates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::JobConfig;
use crate::data::prepare;
use crate::device::select_device;
use crate::error::{Error, Result};
use crate::provision::{HubProvisioner, Provisioner};
use crate::tracking::{
    ExperimentRecorder, MetricPoint, MlflowClient, OfflineBackend, RunStatus, TrackingBackend,
};
use crate::trainer::{Trainer, TrainingEvent};

/// Directory name of the exported model under the output directory
pub const FINAL_MODEL_DIR: &str = "final_model";

/// Summary of a successfully completed job
#[derive(Debug)]
pub struct JobOutcome {
    /// Tracking run id, when a run could be created
    pub run_id: Option<String>,
    /// Directory holding the exported model and tokenizer
    pub artifact_path: PathBuf,
    /// Loss of the final training step
    pub final_loss: f64,
    /// Total optimization steps taken
    pub total_steps: usize,
    /// Wall-clock training time
    pub runtime: Duration,
    /// Warnings from degraded tracking calls
    pub tracking_warnings: Vec<String>,
}

/// Output of the train-and-export stage, before tracking finalization
struct StageOutput {
    artifact_path: PathBuf,
    final_loss: f64,
    total_steps: usize,
    runtime: Duration,
}

/// Drives one training job from config file to exported artifact
#[derive(Default)]
pub struct JobOrchestrator {
    backend: Option<Box<dyn TrackingBackend>>,
    provisioner: Option<Box<dyn Provisioner>>,
}

impl JobOrchestrator {
    /// Orchestrator that reports to the MLflow server named in the config
    pub fn new() -> Self {
        Self::default()
    }

    /// Orchestrator with an explicit tracking backend
    pub fn with_backend(backend: Box<dyn TrackingBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::default()
        }
    }

    /// Replace the default model/tokenizer provisioner
    pub fn with_provisioner(mut self, provisioner: Box<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Run the job described by the config file
    pub async fn run_job(mut self, config_path: &Path) -> Result<JobOutcome> {
        let config = JobConfig::from_file(config_path)?;
        info!(
            "Loaded job config: model '{}', dataset '{}' ({})",
            config.model.name, config.data.name, config.data.split
        );

        let backend: Box<dyn TrackingBackend> = match self.backend.take() {
            Some(backend) => backend,
            None => match MlflowClient::new(&config.mlflow.tracking_uri) {
                Ok(client) => Box::new(client),
                // Tracking is never fatal; a client that cannot even be
                // constructed degrades the same way an unreachable server does.
                Err(e) => {
                    warn!("Tracking client unavailable: {e}");
                    Box::new(OfflineBackend::new(e.to_string()))
                }
            },
        };
        let provisioner = self
            .provisioner
            .take()
            .unwrap_or_else(|| Box::new(HubProvisioner));

        let mut recorder = ExperimentRecorder::new(backend, config.mlflow.experiment_name.clone());
        recorder.begin_run().await;
        recorder.log_params(&config.as_params()).await;

        match Self::train_and_export(&config, provisioner.as_ref(), &mut recorder).await {
            Ok(stage) => {
                recorder.log_artifact(&stage.artifact_path).await;
                recorder.end_run(RunStatus::Finished).await;
                info!(
                    "Job finished: {} steps, final loss {:.4}, artifact at {}",
                    stage.total_steps,
                    stage.final_loss,
                    stage.artifact_path.display()
                );
                Ok(JobOutcome {
                    run_id: recorder.run_id().map(str::to_string),
                    artifact_path: stage.artifact_path,
                    final_loss: stage.final_loss,
                    total_steps: stage.total_steps,
                    runtime: stage.runtime,
                    tracking_warnings: recorder.warnings().to_vec(),
                })
            }
            Err(e) => {
                recorder.set_tag("failure_reason", &e.to_string()).await;
                recorder.end_run(RunStatus::Failed).await;
                Err(e)
            }
        }
    }

    /// Provision, prepare, train, and export; metrics reach the recorder
    /// even when training aborts mid-run
    async fn train_and_export(
        config: &JobConfig,
        provisioner: &dyn Provisioner,
        recorder: &mut ExperimentRecorder,
    ) -> Result<StageOutput> {
        let device = select_device();
        let context = provisioner.provision(&config.model.name, &device).await?;
        let dataset = prepare(config, &context.tokenizer)?;
        info!(
            "Prepared {} records of length {}",
            dataset.len(),
            dataset.max_length()
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut trainer =
            Trainer::new(context.model.as_ref(), &device, &dataset, config).with_event_sink(tx);
        let train_result = trainer.run();
        drop(trainer);

        let mut metrics = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                TrainingEvent::StepCompleted { step, loss, lr } => {
                    metrics.push(MetricPoint::new("loss", loss, step));
                    metrics.push(MetricPoint::new("learning_rate", lr, step));
                }
                TrainingEvent::EpochCompleted {
                    step, mean_loss, ..
                } => {
                    metrics.push(MetricPoint::new("epoch_loss", mean_loss, step));
                }
                TrainingEvent::EpochStarted { .. } | TrainingEvent::CheckpointSaved { .. } => {}
            }
        }
        recorder.log_metrics(&metrics).await;
        let result = train_result?;

        let artifact_path = config.training.output_dir.join(FINAL_MODEL_DIR);
        context.model.save(&artifact_path)?;
        context
            .tokenizer
            .save(artifact_path.join("tokenizer.json"), false)
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;

        recorder
            .log_metrics(&[
                MetricPoint::new("train_loss", result.final_loss, result.total_steps),
                MetricPoint::new(
                    "train_runtime",
                    result.runtime.as_secs_f64(),
                    result.total_steps,
                ),
            ])
            .await;

        Ok(StageOutput {
            artifact_path,
            final_loss: result.final_loss,
            total_steps: result.total_steps,
            runtime: result.runtime,
        })
    }
}

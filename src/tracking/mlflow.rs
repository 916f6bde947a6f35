//! MLflow REST API 2.0 backend
//!
//! Speaks the `/api/2.0/mlflow/*` endpoints: experiment lookup/creation, run
//! creation, batched param/metric logging, tags, and run termination.
//! Artifact upload goes through the `mlflow-artifacts` proxy and is
//! best-effort per file. Every failure surfaces as [`Error::Tracking`] so the
//! caller's degradation policy applies uniformly.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{MetricPoint, RunStatus, TrackingBackend};
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for an MLflow tracking server
pub struct MlflowClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ExperimentResponse {
    experiment: Experiment,
}

#[derive(Deserialize)]
struct Experiment {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Deserialize)]
struct CreateRunResponse {
    run: Run,
}

#[derive(Deserialize)]
struct Run {
    info: RunInfo,
}

#[derive(Deserialize)]
struct RunInfo {
    run_id: String,
}

#[derive(Serialize)]
struct ParamEntry<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct MetricEntry<'a> {
    key: &'a str,
    value: f64,
    timestamp: i64,
    step: i64,
}

impl MlflowClient {
    /// Build a client against the given tracking URI
    pub fn new(tracking_uri: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::tracking(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: tracking_uri.trim_end_matches('/').to_string(),
        })
    }

    fn api(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/mlflow/{endpoint}", self.base_url)
    }

    async fn post(&self, endpoint: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self.http.post(self.api(endpoint)).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::tracking(format!(
                "{endpoint} returned {status}: {detail}"
            )));
        }
        Ok(response)
    }

    /// Resolve the experiment id, creating the experiment when absent
    async fn experiment_id(&self, name: &str) -> Result<String> {
        let response = self
            .http
            .get(self.api("experiments/get-by-name"))
            .query(&[("experiment_name", name)])
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let body: ExperimentResponse = response.json().await?;
                Ok(body.experiment.experiment_id)
            }
            StatusCode::NOT_FOUND => {
                debug!("Experiment '{name}' not found, creating it");
                let response = self
                    .post("experiments/create", &json!({ "name": name }))
                    .await?;
                let body: CreateExperimentResponse = response.json().await?;
                Ok(body.experiment_id)
            }
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(Error::tracking(format!(
                    "experiments/get-by-name returned {status}: {detail}"
                )))
            }
        }
    }
}

#[async_trait]
impl TrackingBackend for MlflowClient {
    async fn create_run(&self, experiment_name: &str) -> Result<String> {
        let experiment_id = self.experiment_id(experiment_name).await?;
        let response = self
            .post(
                "runs/create",
                &json!({
                    "experiment_id": experiment_id,
                    "start_time": Utc::now().timestamp_millis(),
                }),
            )
            .await?;
        let body: CreateRunResponse = response.json().await?;
        debug!("Created run {}", body.run.info.run_id);
        Ok(body.run.info.run_id)
    }

    async fn log_params(&self, run_id: &str, params: &[(String, String)]) -> Result<()> {
        let entries: Vec<ParamEntry> = params
            .iter()
            .map(|(key, value)| ParamEntry { key, value })
            .collect();
        self.post(
            "runs/log-batch",
            &json!({ "run_id": run_id, "params": entries }),
        )
        .await?;
        Ok(())
    }

    async fn log_metrics(&self, run_id: &str, metrics: &[MetricPoint]) -> Result<()> {
        let timestamp = Utc::now().timestamp_millis();
        let entries: Vec<MetricEntry> = metrics
            .iter()
            .map(|m| MetricEntry {
                key: &m.key,
                value: m.value,
                timestamp,
                step: m.step as i64,
            })
            .collect();
        self.post(
            "runs/log-batch",
            &json!({ "run_id": run_id, "metrics": entries }),
        )
        .await?;
        Ok(())
    }

    async fn set_tag(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.post(
            "runs/set-tag",
            &json!({ "run_id": run_id, "key": key, "value": value }),
        )
        .await?;
        Ok(())
    }

    async fn log_artifact(&self, run_id: &str, local_path: &Path) -> Result<()> {
        let dir_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::tracking("artifact path has no directory name"))?;

        for entry in std::fs::read_dir(local_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let url = format!(
                "{}/api/2.0/mlflow-artifacts/artifacts/{run_id}/{dir_name}/{file_name}",
                self.base_url
            );
            let bytes = std::fs::read(entry.path())?;
            let response = self.http.put(url).body(bytes).send().await?;
            if !response.status().is_success() {
                return Err(Error::tracking(format!(
                    "artifact upload of {file_name} returned {}",
                    response.status()
                )));
            }
        }
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.post(
            "runs/update",
            &json!({
                "run_id": run_id,
                "status": status.as_mlflow(),
                "end_time": Utc::now().timestamp_millis(),
            }),
        )
        .await?;
        Ok(())
    }
}

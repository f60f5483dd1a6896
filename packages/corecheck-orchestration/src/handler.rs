//! Result handlers
//!
//! A handler runs once per successful job with the original execution params
//! and the job's result, persists whatever it derives, and returns the
//! execution's success payload.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use corecheck_storage::{CoverageResult, ExecutionId, JobStatus, PipelineStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::backend::JobOutcome;
use crate::error::{OrchestratorError, Result};

/// Job result as the handler sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub output_ref: Option<String>,
    /// Inline output, for jobs that return their artifact directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl From<&JobOutcome> for JobResult {
    fn from(outcome: &JobOutcome) -> Self {
        Self {
            status: outcome.status,
            output_ref: outcome.output_ref.clone(),
            output: outcome.output.clone(),
        }
    }
}

/// `{ original_params, job_result: { status, output_ref } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerPayload {
    pub original_params: Value,
    pub job_result: JobResult,
}

#[async_trait]
pub trait ResultHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Interpret and persist a job result; `Err` fails the execution
    ///
    /// Must be idempotent per `execution_id`: a resumed execution may call
    /// it again for the same job.
    async fn handle(&self, execution_id: ExecutionId, payload: &HandlerPayload) -> Result<Value>;
}

/// Reads the coverage artifact and persists a `CoverageResult`
pub struct CoverageHandler {
    store: Arc<dyn PipelineStore>,
}

impl CoverageHandler {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    async fn load_artifact(&self, job_result: &JobResult) -> Result<Value> {
        let path = match job_result.output_ref.as_deref() {
            None | Some("inline") => {
                return job_result.output.clone().ok_or_else(|| {
                    OrchestratorError::Handler("job produced neither output_ref nor output".into())
                })
            }
            Some(reference) => artifact_path(reference)?,
        };

        debug!("Reading coverage artifact {}", path.display());
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            OrchestratorError::Handler(format!("cannot read artifact {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            OrchestratorError::Handler(format!("artifact {} is not JSON: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl ResultHandler for CoverageHandler {
    fn name(&self) -> &'static str {
        "coverage"
    }

    async fn handle(&self, execution_id: ExecutionId, payload: &HandlerPayload) -> Result<Value> {
        if payload.job_result.status != JobStatus::Succeeded {
            return Err(OrchestratorError::Handler(format!(
                "handler invoked for a {} job",
                payload.job_result.status
            )));
        }

        let target = payload
            .original_params
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| OrchestratorError::Handler("params carry no 'target'".to_string()))?;

        let artifact = self.load_artifact(&payload.job_result).await?;
        let (reported, percent) = extract_coverage(&artifact)?;

        let result = CoverageResult {
            execution_id,
            target: target.to_string(),
            coverage_percent: percent,
            output_ref: payload.job_result.output_ref.clone(),
            recorded_at: Utc::now(),
        };
        self.store
            .save_coverage_result(&result)
            .await
            .map_err(|e| OrchestratorError::Handler(format!("persisting coverage failed: {}", e)))?;

        info!(
            "Recorded coverage {:.2}% for {} (execution {})",
            percent, target, execution_id
        );
        Ok(json!({ "coverage": reported }))
    }
}

/// `file://` URI or plain local path
fn artifact_path(reference: &str) -> Result<PathBuf> {
    if let Some(path) = reference.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if reference.contains("://") {
        return Err(OrchestratorError::Handler(format!(
            "unsupported output_ref scheme: {}",
            reference
        )));
    }
    Ok(PathBuf::from(reference))
}

/// Coverage as reported (for the result payload) and as a percentage
///
/// Accepts `coverage`, `coverage_percent`, `totals.percent_covered`
/// (coverage.py JSON) or a 0..1 `line_rate` (Cobertura).
fn extract_coverage(artifact: &Value) -> Result<(Value, f64)> {
    let direct = ["coverage", "coverage_percent"]
        .iter()
        .find_map(|key| artifact.get(*key))
        .or_else(|| artifact.pointer("/totals/percent_covered"));

    let (reported, percent) = match direct {
        Some(value) => (value.clone(), value.as_f64()),
        None => match artifact.get("line_rate").and_then(Value::as_f64) {
            Some(rate) => (json!(rate * 100.0), Some(rate * 100.0)),
            None => (Value::Null, None),
        },
    };

    match percent {
        Some(p) if (0.0..=100.0).contains(&p) => Ok((reported, p)),
        Some(p) => Err(OrchestratorError::Handler(format!(
            "coverage {} outside 0..=100",
            p
        ))),
        None => Err(OrchestratorError::Handler(
            "artifact has no coverage figure".to_string(),
        )),
    }
}

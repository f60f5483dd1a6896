//! Job Submission Adapter
//!
//! Wraps a [`ComputeBackend`] with the job bookkeeping the coordinator needs:
//! the `JobSubmission` row, the job timeout, and the split between a job that
//! ran too long (`Timeout`) and one that reported failure (`JobFailed`).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use corecheck_storage::{ExecutionId, JobStatus, JobSubmission, PipelineStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::backend::{ComputeBackend, JobOutcome, JobRequest};
use crate::error::{OrchestratorError, Result};

/// The coverage step's job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub definition_ref: String,
    pub queue_ref: String,
    /// Dotted path in execution data that receives the job result
    pub result_path: String,
    /// Default job parameters; execution params override them key by key
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl JobDefinition {
    pub fn new(definition_ref: impl Into<String>, queue_ref: impl Into<String>) -> Self {
        Self {
            definition_ref: definition_ref.into(),
            queue_ref: queue_ref.into(),
            result_path: "job".to_string(),
            parameters: Map::new(),
        }
    }

    pub fn with_result_path(mut self, result_path: impl Into<String>) -> Self {
        self.result_path = result_path.into();
        self
    }

    /// Defaults, then execution params, then the owning execution id
    pub fn job_params(&self, execution_id: ExecutionId, params: &Value) -> Value {
        let mut merged = self.parameters.clone();
        if let Value::Object(overrides) = params {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged.insert(
            "execution_id".to_string(),
            Value::String(execution_id.to_string()),
        );
        Value::Object(merged)
    }
}

pub struct JobSubmissionAdapter {
    backend: Arc<dyn ComputeBackend>,
    store: Arc<dyn PipelineStore>,
}

impl JobSubmissionAdapter {
    pub fn new(backend: Arc<dyn ComputeBackend>, store: Arc<dyn PipelineStore>) -> Self {
        Self { backend, store }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Submit the job for `execution_id` and persist its submission record
    pub async fn submit(
        &self,
        execution_id: ExecutionId,
        definition: &JobDefinition,
        params: &Value,
    ) -> Result<JobSubmission> {
        let request = JobRequest {
            execution_id,
            definition_ref: definition.definition_ref.clone(),
            queue_ref: definition.queue_ref.clone(),
            params: definition.job_params(execution_id, params),
        };

        let job_id = self.backend.submit(request).await?;
        let submission = JobSubmission::new(
            execution_id,
            job_id,
            &definition.queue_ref,
            &definition.definition_ref,
            &definition.result_path,
        );
        if let Err(e) = self.store.save_job_submission(&submission).await {
            // Unrecorded, the job would be resubmitted on resume and never reaped
            warn!(
                "Could not record job {} for execution {}, discarding it: {}",
                submission.job_id, execution_id, e
            );
            self.backend.discard(&submission.job_id).await;
            return Err(e.into());
        }

        info!(
            "Submitted job {} for execution {} on {} backend",
            submission.job_id,
            execution_id,
            self.backend.name()
        );
        Ok(submission)
    }

    /// Suspend until the job is terminal or `timeout` elapses
    ///
    /// Updates `submission.status` and persists it. A timed-out job is
    /// discarded: stopped where the backend can, and forgotten either way.
    pub async fn await_terminal(
        &self,
        submission: &mut JobSubmission,
        timeout: Duration,
    ) -> Result<JobOutcome> {
        if submission.status == JobStatus::Submitted {
            self.record_status(submission, JobStatus::Running).await?;
        }

        let waited = tokio::time::timeout(timeout, self.backend.wait(&submission.job_id)).await;
        let outcome = match waited {
            Ok(outcome) => outcome?,
            Err(_) => {
                warn!(
                    "Job {} exceeded {:?}, marking timed out",
                    submission.job_id, timeout
                );
                self.backend.discard(&submission.job_id).await;
                self.record_status(submission, JobStatus::TimedOut).await?;
                return Err(OrchestratorError::Timeout(format!(
                    "job {} did not finish within {}s",
                    submission.job_id,
                    timeout.as_secs_f64()
                )));
            }
        };

        self.record_status(submission, outcome.status).await?;
        match outcome.status {
            JobStatus::Succeeded => Ok(outcome),
            JobStatus::TimedOut => Err(OrchestratorError::Timeout(
                outcome
                    .message
                    .unwrap_or_else(|| format!("backend timed out job {}", outcome.job_id)),
            )),
            _ => Err(OrchestratorError::JobFailed {
                job_id: outcome.job_id,
                message: outcome
                    .message
                    .unwrap_or_else(|| "job reported failure".to_string()),
                diagnostics: outcome.diagnostics,
            }),
        }
    }

    /// Ask the backend to stop a submitted job
    pub async fn terminate(&self, submission: &JobSubmission) -> Result<()> {
        if !self.backend.supports_terminate() {
            return Err(OrchestratorError::Submission(format!(
                "{} backend does not support terminate (job {})",
                self.backend.name(),
                submission.job_id
            )));
        }
        self.backend.terminate(&submission.job_id).await
    }

    async fn record_status(&self, submission: &mut JobSubmission, status: JobStatus) -> Result<()> {
        submission.status = status;
        submission.updated_at = Utc::now();
        self.store.save_job_submission(submission).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FunctionBackend;
    use crate::test_support::FlakyStore;
    use corecheck_storage::{Execution, SqliteStore};
    use futures::FutureExt;
    use serde_json::json;

    async fn store_with_execution() -> (Arc<SqliteStore>, Execution) {
        let store = crate::test_support::migrated_store().await;
        let execution = Execution::new(json!({"target": "repo-42"}));
        store.insert_execution(&execution).await.unwrap();
        (store, execution)
    }

    fn adapter<F>(store: Arc<SqliteStore>, f: F) -> JobSubmissionAdapter
    where
        F: Fn(JobRequest) -> futures::future::BoxFuture<'static, Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        JobSubmissionAdapter::new(Arc::new(FunctionBackend::new(4, f)), store)
    }

    #[test]
    fn test_job_params_merge() {
        let mut definition = JobDefinition::new("coverage:v1", "default");
        definition
            .parameters
            .insert("format".to_string(), json!("lcov"));
        definition
            .parameters
            .insert("target".to_string(), json!("placeholder"));
        let id = uuid::Uuid::new_v4();

        let params = definition.job_params(id, &json!({"target": "repo-42"}));
        assert_eq!(params["format"], "lcov");
        assert_eq!(params["target"], "repo-42");
        assert_eq!(params["execution_id"], id.to_string());
    }

    #[tokio::test]
    async fn test_submission_persisted_and_succeeds() {
        let (store, execution) = store_with_execution().await;
        let adapter = adapter(store.clone(), |req| {
            async move { Ok(json!({"echo": req.params["target"]})) }.boxed()
        });
        let definition = JobDefinition::new("coverage:v1", "default");

        let mut submission = adapter
            .submit(execution.execution_id, &definition, &execution.input_params)
            .await
            .unwrap();
        let outcome = adapter
            .await_terminal(&mut submission, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.output, Some(json!({"echo": "repo-42"})));
        let stored = store
            .get_job_submission(execution.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.job_id, submission.job_id);
    }

    #[tokio::test]
    async fn test_timeout_distinguished_from_failure() {
        let (store, execution) = store_with_execution().await;
        let adapter = adapter(store.clone(), |_| {
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!({}))
            }
            .boxed()
        });
        let definition = JobDefinition::new("coverage:v1", "default");

        let mut submission = adapter
            .submit(execution.execution_id, &definition, &json!({}))
            .await
            .unwrap();
        let err = adapter
            .await_terminal(&mut submission, Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Timeout(_)));
        assert_eq!(submission.status, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_timed_out_job_is_discarded() {
        let (store, execution) = store_with_execution().await;
        let backend = Arc::new(FunctionBackend::new(1, |_| {
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!({}))
            }
            .boxed()
        }));
        let adapter = JobSubmissionAdapter::new(backend.clone(), store);
        let definition = JobDefinition::new("coverage:v1", "default");

        let mut submission = adapter
            .submit(execution.execution_id, &definition, &json!({}))
            .await
            .unwrap();
        adapter
            .await_terminal(&mut submission, Duration::from_millis(20))
            .await
            .unwrap_err();

        assert_eq!(backend.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn test_unrecorded_submission_discards_job() {
        let (store, execution) = store_with_execution().await;
        let backend = Arc::new(FunctionBackend::new(1, |_| {
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!({}))
            }
            .boxed()
        }));
        let adapter = JobSubmissionAdapter::new(
            backend.clone(),
            Arc::new(FlakyStore::new(store.clone()).failing_job_submissions()),
        );
        let definition = JobDefinition::new("coverage:v1", "default");

        let err = adapter
            .submit(execution.execution_id, &definition, &json!({}))
            .await
            .unwrap_err();

        assert_eq!(err.category(), crate::error::ErrorCategory::Infrastructure);
        assert_eq!(backend.tracked_jobs(), 0);
        assert!(store
            .get_job_submission(execution.execution_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_job_failure_maps_to_job_failed() {
        let (store, execution) = store_with_execution().await;
        let adapter = adapter(store, |_| {
            async { Err(OrchestratorError::Handler("exit status 2".to_string())) }.boxed()
        });
        let definition = JobDefinition::new("coverage:v1", "default");

        let mut submission = adapter
            .submit(execution.execution_id, &definition, &json!({}))
            .await
            .unwrap();
        let err = adapter
            .await_terminal(&mut submission, Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            OrchestratorError::JobFailed { job_id, message, .. } => {
                assert_eq!(job_id, submission.job_id);
                assert!(message.contains("exit status 2"));
            }
            other => panic!("Expected JobFailed, got {other:?}"),
        }
        assert_eq!(submission.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_terminate_without_support_is_submission_error() {
        let (store, execution) = store_with_execution().await;
        let adapter = adapter(store, |_| async { Ok(json!({})) }.boxed());
        let submission = JobSubmission::new(
            execution.execution_id,
            "fn-1",
            "default",
            "coverage:v1",
            "job",
        );

        let err = adapter.terminate(&submission).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Submission(_)));
    }
}

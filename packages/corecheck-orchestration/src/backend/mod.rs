//! Compute backends
//!
//! One trait, two variants:
//! - [`ProcessBackend`]: long-running batch job as a child process (terminable)
//! - [`FunctionBackend`]: short in-process async call (not terminable)

mod function;
mod process;

pub use function::{FunctionBackend, JobFn};
pub use process::ProcessBackend;

use async_trait::async_trait;
use corecheck_storage::{ExecutionId, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Job handed to a backend, tagged with its owning execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub execution_id: ExecutionId,
    pub definition_ref: String,
    pub queue_ref: String,
    /// Execution params merged with job parameters
    pub params: Value,
}

/// Terminal report of a job as seen by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Value>,
}

impl JobOutcome {
    /// Successful outcome; `output_ref` is lifted from `output.output_ref` if present
    pub fn succeeded(job_id: impl Into<String>, output: Value) -> Self {
        let output_ref = output
            .get("output_ref")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            job_id: job_id.into(),
            status: JobStatus::Succeeded,
            output: Some(output),
            output_ref,
            message: None,
            diagnostics: None,
        }
    }

    pub fn failed(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Failed,
            output: None,
            output_ref: None,
            message: Some(message.into()),
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Value) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }
}

/// Compute backend port
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a job and return its backend id
    ///
    /// Rejections (capacity, unknown definition, spawn failure) are
    /// `OrchestratorError::Submission`.
    async fn submit(&self, request: JobRequest) -> Result<String>;

    /// Suspend until the job is terminal
    ///
    /// Cancel-safe: dropping the future (e.g. on timeout) leaves the job as is.
    /// A job id the backend does not know resolves to a failed outcome.
    async fn wait(&self, job_id: &str) -> Result<JobOutcome>;

    fn supports_terminate(&self) -> bool;

    /// Stop a running job; a job that already finished is not an error
    ///
    /// Must work from any process holding the job id, not only the one that
    /// submitted it. A job the backend cannot reach is an error.
    async fn terminate(&self, job_id: &str) -> Result<()>;

    /// Forget a job nobody will wait for any more (timed out, or its
    /// submission could not be recorded)
    ///
    /// Best effort and idempotent: the job is stopped where the backend can
    /// stop it, and its bookkeeping is dropped.
    async fn discard(&self, job_id: &str);
}

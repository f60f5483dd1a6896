//! In-process function backend
//!
//! Runs a short async function per job on the tokio runtime. The job has no
//! identity outside this process, so terminate is unsupported; a discarded
//! job is aborted and gives its capacity back.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ComputeBackend, JobOutcome, JobRequest};
use crate::error::{OrchestratorError, Result};

/// Job body: params in, output JSON out
pub type JobFn = Arc<dyn Fn(JobRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct FunctionJob {
    outcome: watch::Receiver<Option<JobOutcome>>,
    task: AbortHandle,
}

pub struct FunctionBackend {
    function: JobFn,
    capacity: Arc<Semaphore>,
    jobs: DashMap<String, FunctionJob>,
}

impl FunctionBackend {
    /// `max_in_flight` bounds concurrent jobs; submissions beyond it are rejected
    pub fn new<F>(max_in_flight: usize, function: F) -> Self
    where
        F: Fn(JobRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        Self {
            function: Arc::new(function),
            capacity: Arc::new(Semaphore::new(max_in_flight.max(1))),
            jobs: DashMap::new(),
        }
    }

    /// Jobs submitted and not yet awaited or discarded
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }

    fn reserve(&self) -> Result<OwnedSemaphorePermit> {
        self.capacity
            .clone()
            .try_acquire_owned()
            .map_err(|_| OrchestratorError::Submission("function backend at capacity".to_string()))
    }
}

#[async_trait]
impl ComputeBackend for FunctionBackend {
    fn name(&self) -> &'static str {
        "function"
    }

    async fn submit(&self, request: JobRequest) -> Result<String> {
        let permit = self.reserve()?;
        let job_id = format!("fn-{}", Uuid::new_v4());
        let future = (self.function)(request);

        let (tx, rx) = watch::channel(None);
        let task_id = job_id.clone();
        let task = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(output)) => JobOutcome::succeeded(&task_id, output),
                Ok(Err(e)) => JobOutcome::failed(&task_id, e.to_string()),
                Err(_) => {
                    warn!("Function job {} panicked", task_id);
                    JobOutcome::failed(&task_id, "job panicked")
                }
            };
            drop(permit);
            let _ = tx.send(Some(outcome));
        });
        self.jobs.insert(
            job_id.clone(),
            FunctionJob {
                outcome: rx,
                task: task.abort_handle(),
            },
        );

        debug!("Submitted function job {}", job_id);
        Ok(job_id)
    }

    async fn wait(&self, job_id: &str) -> Result<JobOutcome> {
        let mut rx = match self.jobs.get(job_id) {
            Some(job) => job.outcome.clone(),
            None => {
                return Ok(JobOutcome::failed(
                    job_id,
                    "job is not tracked by this backend (lost on restart?)",
                ))
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| OrchestratorError::Submission(format!("job {} vanished", job_id)))?
            .clone()
            .ok_or_else(|| OrchestratorError::Submission(format!("no outcome for {}", job_id)))?;

        self.jobs.remove(job_id);
        Ok(outcome)
    }

    fn supports_terminate(&self) -> bool {
        false
    }

    async fn terminate(&self, job_id: &str) -> Result<()> {
        Err(OrchestratorError::Submission(format!(
            "function backend cannot terminate job {}",
            job_id
        )))
    }

    async fn discard(&self, job_id: &str) {
        if let Some((_, job)) = self.jobs.remove(job_id) {
            // Dropping the aborted future releases its permit
            job.task.abort();
            debug!("Discarded function job {}", job_id);
        }
    }
}

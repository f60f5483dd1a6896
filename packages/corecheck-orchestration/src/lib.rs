/*
 * Corecheck Orchestration - Coverage Pipeline Core
 *
 * Runs one coverage job per repository and records its result.
 *
 * Architecture:
 * - Execution State Machine (durable, compare-and-set writes)
 * - Compute Backends (child process, in-process function)
 * - Work Queue (visibility leases, dead letters)
 * - Sync Worker (code host -> repository records -> corecheck tasks)
 * - Migration Runner (ordered, one step at a time)
 * - Observability (tracing, optional prometheus metrics)
 */

// Public modules
pub mod backend;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod execution;
pub mod handler;
pub mod metrics;
pub mod migration;
pub mod policy;
pub mod queue;
pub mod submission;
pub mod sync;

// Re-exports
pub use backend::{ComputeBackend, FunctionBackend, JobOutcome, JobRequest, ProcessBackend};
pub use config::{ConfigError, DatabaseTarget, Settings, Unit};
pub use consumer::{ConsumerConfig, ConsumerReport, CorecheckConsumer, CorecheckTask, TaskOutcome};
pub use coordinator::{CoordinatorConfig, PipelineCoordinator};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use execution::ExecutionStateMachine;
pub use handler::{CoverageHandler, HandlerPayload, JobResult, ResultHandler};
pub use metrics::PipelineMetrics;
pub use migration::{MigrationOutcome, MigrationRequest, MigrationRunner};
pub use policy::{RetryPolicy, RetryStrategy, TimeoutPolicy};
pub use queue::{
    DeadLetter, LeaseToken, MemoryQueue, QueueDepth, QueueMessage, QueueOptions, SqliteQueue,
    WorkQueue,
};
pub use submission::{JobDefinition, JobSubmissionAdapter};
pub use sync::{GithubSource, RepositoryRef, RepositorySource, SyncReport, SyncWorker};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use corecheck_storage::{
        CoverageResult, Direction, Execution, ExecutionId, JobSubmission, PipelineStore,
        RepositoryRecord, SchemaStore, SqliteStore, StorageError, TaskClaim, UpsertOutcome,
        MIGRATIONS,
    };
    use futures::future::BoxFuture;
    use serde_json::Value;

    use crate::backend::{FunctionBackend, JobRequest};
    use crate::coordinator::{CoordinatorConfig, PipelineCoordinator};
    use crate::handler::CoverageHandler;
    use crate::policy::TimeoutPolicy;
    use crate::submission::JobDefinition;
    use crate::Result;

    pub async fn migrated_store() -> Arc<SqliteStore> {
        let store = SqliteStore::in_memory().unwrap();
        for migration in MIGRATIONS {
            store.apply_migration(migration, Direction::Up).await.unwrap();
        }
        Arc::new(store)
    }

    /// Coordinator over a function backend and the coverage handler
    pub fn coordinator_with<F>(store: Arc<dyn PipelineStore>, job: F) -> Arc<PipelineCoordinator>
    where
        F: Fn(JobRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        let config = CoordinatorConfig::new(
            JobDefinition::new("coverage:v1", "default"),
            TimeoutPolicy::default(),
        );
        Arc::new(PipelineCoordinator::new(
            store.clone(),
            Arc::new(FunctionBackend::new(8, job)),
            Arc::new(CoverageHandler::new(store)),
            config,
        ))
    }

    /// SQLite store with injectable write failures
    pub struct FlakyStore {
        inner: Arc<SqliteStore>,
        job_submission_failures: AtomicUsize,
        complete_failures: AtomicUsize,
    }

    impl FlakyStore {
        pub fn new(inner: Arc<SqliteStore>) -> Self {
            Self {
                inner,
                job_submission_failures: AtomicUsize::new(0),
                complete_failures: AtomicUsize::new(0),
            }
        }

        /// Every `save_job_submission` fails
        pub fn failing_job_submissions(self) -> Self {
            self.job_submission_failures.store(usize::MAX, Ordering::SeqCst);
            self
        }

        /// The next `n` calls to `complete_task` fail
        pub fn failing_completions(self, n: usize) -> Self {
            self.complete_failures.store(n, Ordering::SeqCst);
            self
        }

        fn trip(counter: &AtomicUsize, what: &str) -> corecheck_storage::Result<()> {
            let tripped = counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if tripped {
                Err(StorageError::database(format!("injected {} failure", what)))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl PipelineStore for FlakyStore {
        async fn upsert_repository(
            &self,
            repo: &RepositoryRecord,
        ) -> corecheck_storage::Result<UpsertOutcome> {
            self.inner.upsert_repository(repo).await
        }

        async fn get_repository(
            &self,
            external_id: &str,
        ) -> corecheck_storage::Result<Option<RepositoryRecord>> {
            self.inner.get_repository(external_id).await
        }

        async fn list_repositories(&self) -> corecheck_storage::Result<Vec<RepositoryRecord>> {
            self.inner.list_repositories().await
        }

        async fn insert_execution(&self, execution: &Execution) -> corecheck_storage::Result<()> {
            self.inner.insert_execution(execution).await
        }

        async fn update_execution(&self, execution: &Execution) -> corecheck_storage::Result<i64> {
            self.inner.update_execution(execution).await
        }

        async fn get_execution(
            &self,
            execution_id: ExecutionId,
        ) -> corecheck_storage::Result<Option<Execution>> {
            self.inner.get_execution(execution_id).await
        }

        async fn list_unfinished_executions(&self) -> corecheck_storage::Result<Vec<Execution>> {
            self.inner.list_unfinished_executions().await
        }

        async fn save_job_submission(
            &self,
            submission: &JobSubmission,
        ) -> corecheck_storage::Result<()> {
            Self::trip(&self.job_submission_failures, "job submission")?;
            self.inner.save_job_submission(submission).await
        }

        async fn get_job_submission(
            &self,
            execution_id: ExecutionId,
        ) -> corecheck_storage::Result<Option<JobSubmission>> {
            self.inner.get_job_submission(execution_id).await
        }

        async fn save_coverage_result(&self, result: &CoverageResult) -> corecheck_storage::Result<()> {
            self.inner.save_coverage_result(result).await
        }

        async fn get_coverage_result(
            &self,
            execution_id: ExecutionId,
        ) -> corecheck_storage::Result<Option<CoverageResult>> {
            self.inner.get_coverage_result(execution_id).await
        }

        async fn claim_task(&self, idempotency_key: &str) -> corecheck_storage::Result<Option<TaskClaim>> {
            self.inner.claim_task(idempotency_key).await
        }

        async fn take_over_task(
            &self,
            stale: &TaskClaim,
        ) -> corecheck_storage::Result<Option<TaskClaim>> {
            self.inner.take_over_task(stale).await
        }

        async fn complete_task(
            &self,
            claim: &TaskClaim,
            execution_id: ExecutionId,
        ) -> corecheck_storage::Result<bool> {
            Self::trip(&self.complete_failures, "task completion")?;
            self.inner.complete_task(claim, execution_id).await
        }

        async fn release_task(&self, claim: &TaskClaim) -> corecheck_storage::Result<bool> {
            self.inner.release_task(claim).await
        }

        async fn get_task_claim(
            &self,
            idempotency_key: &str,
        ) -> corecheck_storage::Result<Option<TaskClaim>> {
            self.inner.get_task_claim(idempotency_key).await
        }
    }
}

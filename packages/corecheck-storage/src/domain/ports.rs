//! Storage Ports (Trait Interfaces)
//!
//! Port/Adapter pattern for backend flexibility:
//! - Deployed: PostgreSQL
//! - Local runs and tests: SQLite

use async_trait::async_trait;

use super::models::{
    CoverageResult, Execution, ExecutionId, JobSubmission, RepositoryRecord, TaskClaim,
    UpsertOutcome,
};
use crate::migrations::{Direction, Migration};
use crate::Result;

/// Pipeline Store Port (Primary Interface)
///
/// All relational backends implement this trait. Rows are keyed so that every
/// write is an upsert or a compare-and-set; no caller needs a lock.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Repository metadata (sync worker)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Insert or update a repository keyed by `external_id`
    ///
    /// Returns `Unchanged` without writing when the stored fingerprint matches.
    async fn upsert_repository(&self, repo: &RepositoryRecord) -> Result<UpsertOutcome>;

    async fn get_repository(&self, external_id: &str) -> Result<Option<RepositoryRecord>>;

    async fn list_repositories(&self) -> Result<Vec<RepositoryRecord>>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Executions (coordinator)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Persist a freshly created execution (version 0)
    async fn insert_execution(&self, execution: &Execution) -> Result<()>;

    /// Compare-and-set write of an execution
    ///
    /// Succeeds only if the stored version equals `execution.version`; returns
    /// the new version. A stale version yields `ErrorKind::Conflict`.
    async fn update_execution(&self, execution: &Execution) -> Result<i64>;

    async fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<Execution>>;

    /// Executions not yet in a terminal state (for resume after restart)
    async fn list_unfinished_executions(&self) -> Result<Vec<Execution>>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Job submissions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Upsert keyed by `execution_id` (one active submission per execution)
    async fn save_job_submission(&self, submission: &JobSubmission) -> Result<()>;

    async fn get_job_submission(&self, execution_id: ExecutionId) -> Result<Option<JobSubmission>>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Coverage results (handler)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Upsert keyed by `execution_id`, so handler replays are harmless
    async fn save_coverage_result(&self, result: &CoverageResult) -> Result<()>;

    async fn get_coverage_result(&self, execution_id: ExecutionId)
        -> Result<Option<CoverageResult>>;

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Task idempotency (corecheck consumer)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Claim an idempotency key; `None` if it was already claimed
    async fn claim_task(&self, idempotency_key: &str) -> Result<Option<TaskClaim>>;

    /// Re-claim an unfinished claim still as observed in `stale`
    ///
    /// Compare-and-set on `claimed_at`: of several consumers taking over the
    /// same claim, only one gets `Some`.
    async fn take_over_task(&self, stale: &TaskClaim) -> Result<Option<TaskClaim>>;

    /// Mark `claim` done and link the execution it started
    ///
    /// `false` if the claim was taken over or released in the meantime.
    async fn complete_task(&self, claim: &TaskClaim, execution_id: ExecutionId) -> Result<bool>;

    /// Drop `claim` so a redelivery can process the task again
    ///
    /// `false` if the claim no longer matches (completed, taken over or gone).
    async fn release_task(&self, claim: &TaskClaim) -> Result<bool>;

    async fn get_task_claim(&self, idempotency_key: &str) -> Result<Option<TaskClaim>>;
}

/// Schema version port used by the migration runner
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Version recorded in the global version row (0 on an empty database)
    async fn current_version(&self) -> Result<u32>;

    /// Apply one migration step atomically and record the resulting version
    ///
    /// `Up` records `migration.version`, `Down` records `migration.version - 1`.
    /// The recorded version is re-read inside the step's transaction; if it is
    /// not `migration.starting_version(direction)` nothing is applied and the
    /// error is `ErrorKind::Conflict`.
    async fn apply_migration(&self, migration: &Migration, direction: Direction) -> Result<u32>;
}

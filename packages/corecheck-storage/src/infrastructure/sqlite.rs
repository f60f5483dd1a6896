//! SQLite Pipeline Store
//!
//! File-based persistent storage using SQLite.
//! Suitable for local runs and tests; the schema comes from `migrations`.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::models::{dt_to_ms, ms_to_dt};
use crate::domain::{
    CoverageResult, Execution, ExecutionId, JobStatus, JobSubmission, PipelineStore,
    RepositoryRecord, SchemaStore, TaskClaim, UpsertOutcome,
};
use crate::error::{Result, StorageError};
use crate::migrations::{Direction, Migration, VERSION_TABLE_DDL};

const REPOSITORY_COLUMNS: &str =
    "external_id, full_name, default_branch, html_url, description, archived, pushed_at, synced_at";

const JOB_SUBMISSION_COLUMNS: &str =
    "execution_id, job_id, queue_ref, definition_ref, status, result_path, submitted_at, updated_at";

/// SQLite-based PipelineStore implementation
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn row_to_repository(row: &Row<'_>) -> rusqlite::Result<RepositoryRecord> {
        Ok(RepositoryRecord {
            external_id: row.get(0)?,
            full_name: row.get(1)?,
            default_branch: row.get(2)?,
            html_url: row.get(3)?,
            description: row.get(4)?,
            archived: row.get(5)?,
            pushed_at: row.get::<_, Option<i64>>(6)?.map(ms_to_dt),
            synced_at: ms_to_dt(row.get(7)?),
        })
    }

    fn row_to_job_submission(row: &Row<'_>) -> rusqlite::Result<JobSubmission> {
        let status: String = row.get(4)?;
        Ok(JobSubmission {
            execution_id: parse_uuid(0, row.get(0)?)?,
            job_id: row.get(1)?,
            queue_ref: row.get(2)?,
            definition_ref: row.get(3)?,
            status: JobStatus::from_str(&status)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
            result_path: row.get(5)?,
            submitted_at: ms_to_dt(row.get(6)?),
            updated_at: ms_to_dt(row.get(7)?),
        })
    }

    fn decode_execution(record: String, version: i64) -> Result<Execution> {
        let mut execution: Execution = serde_json::from_str(&record)?;
        execution.version = version;
        Ok(execution)
    }
}

fn parse_uuid(idx: usize, value: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn upsert_repository(&self, repo: &RepositoryRecord) -> Result<UpsertOutcome> {
        let conn = self.conn.lock();
        let fingerprint = repo.fingerprint();

        let existing: Option<String> = conn
            .query_row(
                "SELECT fingerprint FROM repositories WHERE external_id = ?1",
                params![&repo.external_id],
                |row| row.get(0),
            )
            .optional()?;

        if existing.as_deref() == Some(fingerprint.as_str()) {
            return Ok(UpsertOutcome::Unchanged);
        }

        conn.execute(
            "INSERT INTO repositories (external_id, full_name, default_branch, html_url, description, archived, pushed_at, fingerprint, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(external_id) DO UPDATE SET
                full_name = excluded.full_name,
                default_branch = excluded.default_branch,
                html_url = excluded.html_url,
                description = excluded.description,
                archived = excluded.archived,
                pushed_at = excluded.pushed_at,
                fingerprint = excluded.fingerprint,
                synced_at = excluded.synced_at",
            params![
                &repo.external_id,
                &repo.full_name,
                &repo.default_branch,
                &repo.html_url,
                &repo.description,
                repo.archived,
                repo.pushed_at.map(dt_to_ms),
                fingerprint,
                dt_to_ms(repo.synced_at),
            ],
        )?;

        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn get_repository(&self, external_id: &str) -> Result<Option<RepositoryRecord>> {
        let conn = self.conn.lock();
        let repo = conn
            .query_row(
                &format!(
                    "SELECT {} FROM repositories WHERE external_id = ?1",
                    REPOSITORY_COLUMNS
                ),
                params![external_id],
                Self::row_to_repository,
            )
            .optional()?;
        Ok(repo)
    }

    async fn list_repositories(&self) -> Result<Vec<RepositoryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repositories ORDER BY full_name",
            REPOSITORY_COLUMNS
        ))?;
        let repos = stmt
            .query_map([], Self::row_to_repository)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(repos)
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        let record = serde_json::to_string(execution)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO executions (execution_id, state, version, record, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                execution.execution_id.to_string(),
                execution.current_state.as_str(),
                execution.version,
                record,
                dt_to_ms(execution.start_time),
                execution.end_time.map(dt_to_ms),
            ],
        )?;
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<i64> {
        let record = serde_json::to_string(execution)?;
        let next_version = execution.version + 1;
        let conn = self.conn.lock();

        let changed = conn.execute(
            "UPDATE executions SET state = ?1, version = ?2, record = ?3, end_time = ?4
             WHERE execution_id = ?5 AND version = ?6",
            params![
                execution.current_state.as_str(),
                next_version,
                record,
                execution.end_time.map(dt_to_ms),
                execution.execution_id.to_string(),
                execution.version,
            ],
        )?;

        if changed == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT version FROM executions WHERE execution_id = ?1",
                    params![execution.execution_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            return Err(match exists {
                Some(_) => StorageError::version_conflict(execution.execution_id, execution.version),
                None => StorageError::execution_not_found(execution.execution_id),
            });
        }

        Ok(next_version)
    }

    async fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<Execution>> {
        let row: Option<(String, i64)> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT record, version FROM executions WHERE execution_id = ?1",
                params![execution_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        row.map(|(record, version)| Self::decode_execution(record, version))
            .transpose()
    }

    async fn list_unfinished_executions(&self) -> Result<Vec<Execution>> {
        let rows: Vec<(String, i64)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT record, version FROM executions
                 WHERE state NOT IN ('succeeded', 'failed')
                 ORDER BY start_time",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter()
            .map(|(record, version)| Self::decode_execution(record, version))
            .collect()
    }

    async fn save_job_submission(&self, submission: &JobSubmission) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO job_submissions (execution_id, job_id, queue_ref, definition_ref, status, result_path, submitted_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(execution_id) DO UPDATE SET
                job_id = excluded.job_id,
                queue_ref = excluded.queue_ref,
                definition_ref = excluded.definition_ref,
                status = excluded.status,
                result_path = excluded.result_path,
                submitted_at = excluded.submitted_at,
                updated_at = excluded.updated_at",
            params![
                submission.execution_id.to_string(),
                &submission.job_id,
                &submission.queue_ref,
                &submission.definition_ref,
                submission.status.as_str(),
                &submission.result_path,
                dt_to_ms(submission.submitted_at),
                dt_to_ms(submission.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get_job_submission(&self, execution_id: ExecutionId) -> Result<Option<JobSubmission>> {
        let conn = self.conn.lock();
        let submission = conn
            .query_row(
                &format!(
                    "SELECT {} FROM job_submissions WHERE execution_id = ?1",
                    JOB_SUBMISSION_COLUMNS
                ),
                params![execution_id.to_string()],
                Self::row_to_job_submission,
            )
            .optional()?;
        Ok(submission)
    }

    async fn save_coverage_result(&self, result: &CoverageResult) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO coverage_results (execution_id, target, coverage_percent, output_ref, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(execution_id) DO UPDATE SET
                target = excluded.target,
                coverage_percent = excluded.coverage_percent,
                output_ref = excluded.output_ref,
                recorded_at = excluded.recorded_at",
            params![
                result.execution_id.to_string(),
                &result.target,
                result.coverage_percent,
                &result.output_ref,
                dt_to_ms(result.recorded_at),
            ],
        )?;
        Ok(())
    }

    async fn get_coverage_result(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<CoverageResult>> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT execution_id, target, coverage_percent, output_ref, recorded_at
                 FROM coverage_results WHERE execution_id = ?1",
                params![execution_id.to_string()],
                |row| {
                    Ok(CoverageResult {
                        execution_id: parse_uuid(0, row.get(0)?)?,
                        target: row.get(1)?,
                        coverage_percent: row.get(2)?,
                        output_ref: row.get(3)?,
                        recorded_at: ms_to_dt(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    async fn claim_task(&self, idempotency_key: &str) -> Result<Option<TaskClaim>> {
        let claimed_at = dt_to_ms(Utc::now());
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO processed_tasks (idempotency_key, claimed_at) VALUES (?1, ?2)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![idempotency_key, claimed_at],
        )?;
        Ok((inserted == 1).then(|| TaskClaim::new(idempotency_key, ms_to_dt(claimed_at))))
    }

    async fn take_over_task(&self, stale: &TaskClaim) -> Result<Option<TaskClaim>> {
        let observed = dt_to_ms(stale.claimed_at);
        // Strictly newer, so a second takeover of the same observation never matches
        let claimed_at = dt_to_ms(Utc::now()).max(observed + 1);
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE processed_tasks SET claimed_at = ?3
             WHERE idempotency_key = ?1 AND claimed_at = ?2 AND completed_at IS NULL",
            params![stale.idempotency_key, observed, claimed_at],
        )?;
        Ok((updated == 1).then(|| TaskClaim::new(&stale.idempotency_key, ms_to_dt(claimed_at))))
    }

    async fn complete_task(&self, claim: &TaskClaim, execution_id: ExecutionId) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE processed_tasks SET execution_id = ?3, completed_at = ?4
             WHERE idempotency_key = ?1 AND claimed_at = ?2 AND completed_at IS NULL",
            params![
                claim.idempotency_key,
                dt_to_ms(claim.claimed_at),
                execution_id.to_string(),
                dt_to_ms(Utc::now())
            ],
        )?;
        Ok(updated == 1)
    }

    async fn release_task(&self, claim: &TaskClaim) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM processed_tasks
             WHERE idempotency_key = ?1 AND claimed_at = ?2 AND completed_at IS NULL",
            params![claim.idempotency_key, dt_to_ms(claim.claimed_at)],
        )?;
        Ok(deleted == 1)
    }

    async fn get_task_claim(&self, idempotency_key: &str) -> Result<Option<TaskClaim>> {
        let conn = self.conn.lock();
        let claim = conn
            .query_row(
                "SELECT idempotency_key, execution_id, claimed_at, completed_at
                 FROM processed_tasks WHERE idempotency_key = ?1",
                params![idempotency_key],
                |row| {
                    let execution_id: Option<String> = row.get(1)?;
                    let completed_at: Option<i64> = row.get(3)?;
                    Ok(TaskClaim {
                        idempotency_key: row.get(0)?,
                        execution_id: execution_id.map(|id| parse_uuid(1, id)).transpose()?,
                        claimed_at: ms_to_dt(row.get(2)?),
                        completed_at: completed_at.map(ms_to_dt),
                    })
                },
            )
            .optional()?;
        Ok(claim)
    }
}

#[async_trait]
impl SchemaStore for SqliteStore {
    async fn current_version(&self) -> Result<u32> {
        let conn = self.conn.lock();
        conn.execute_batch(VERSION_TABLE_DDL)?;
        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(version.unwrap_or(0) as u32)
    }

    async fn apply_migration(&self, migration: &Migration, direction: Direction) -> Result<u32> {
        let version = migration.resulting_version(direction);
        let expected = migration.starting_version(direction);
        let mut conn = self.conn.lock();
        // IMMEDIATE takes the write lock before the version read, so a second
        // process migrating the same file waits here and then sees our version
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute_batch(VERSION_TABLE_DDL)?;
        let found: Option<i64> = tx
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        let found = found.unwrap_or(0) as u32;
        if found != expected {
            return Err(StorageError::schema_version_conflict(expected, found));
        }

        tx.execute_batch(migration.script(direction)).map_err(|e| {
            StorageError::migration(format!(
                "Migration {} ({}) {} failed: {}",
                migration.version, migration.name, direction, e
            ))
            .with_source(e)
        })?;
        tx.execute(
            "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version, updated_at = excluded.updated_at",
            params![version as i64, dt_to_ms(Utc::now())],
        )?;
        tx.commit()?;

        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionState, StateTransition};
    use crate::migrations::{latest_version, MIGRATIONS};
    use serde_json::json;

    async fn migrated_store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        for migration in MIGRATIONS {
            store.apply_migration(migration, Direction::Up).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_empty_database_is_version_zero() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.current_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apply_up_and_down_records_version() {
        let store = migrated_store().await;
        assert_eq!(store.current_version().await.unwrap(), latest_version());

        let last = MIGRATIONS.last().unwrap();
        let version = store.apply_migration(last, Direction::Down).await.unwrap();
        assert_eq!(version, last.version - 1);
        assert_eq!(store.current_version().await.unwrap(), last.version - 1);
    }

    #[tokio::test]
    async fn test_repository_upsert_outcomes() {
        let store = migrated_store().await;
        let mut repo = RepositoryRecord::new("42", "acme/widgets", "main");

        assert_eq!(
            store.upsert_repository(&repo).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_repository(&repo).await.unwrap(),
            UpsertOutcome::Unchanged
        );

        repo.default_branch = "trunk".to_string();
        assert_eq!(
            store.upsert_repository(&repo).await.unwrap(),
            UpsertOutcome::Updated
        );

        let loaded = store.get_repository("42").await.unwrap().unwrap();
        assert_eq!(loaded.default_branch, "trunk");
        assert_eq!(store.list_repositories().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_execution_compare_and_set() {
        let store = migrated_store().await;
        let mut execution = Execution::new(json!({"target": "repo-42"}));
        store.insert_execution(&execution).await.unwrap();

        execution.current_state = ExecutionState::SubmittingJob;
        execution.history.push(StateTransition {
            state: ExecutionState::SubmittingJob,
            entered_at: Utc::now(),
        });
        let stale = execution.clone();

        execution.version = store.update_execution(&execution).await.unwrap();
        assert_eq!(execution.version, 1);

        // A writer holding the old version loses
        let err = store.update_execution(&stale).await.unwrap_err();
        assert!(err.is_conflict());

        let loaded = store
            .get_execution(execution.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.current_state, ExecutionState::SubmittingJob);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.history.len(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_execution() {
        let store = migrated_store().await;
        let execution = Execution::new(json!({}));
        let err = store.update_execution(&execution).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_unfinished_executions() {
        let store = migrated_store().await;
        let running = Execution::new(json!({"target": "a"}));
        let mut done = Execution::new(json!({"target": "b"}));
        done.current_state = ExecutionState::Succeeded;
        done.end_time = Some(Utc::now());

        store.insert_execution(&running).await.unwrap();
        store.insert_execution(&done).await.unwrap();

        let unfinished = store.list_unfinished_executions().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].execution_id, running.execution_id);
    }

    #[tokio::test]
    async fn test_job_submission_upsert() {
        let store = migrated_store().await;
        let execution = Execution::new(json!({}));
        store.insert_execution(&execution).await.unwrap();

        let mut submission = JobSubmission::new(
            execution.execution_id,
            "job-1",
            "coverage-queue",
            "coverage-job",
            "job_result",
        );
        store.save_job_submission(&submission).await.unwrap();

        submission.status = JobStatus::Succeeded;
        store.save_job_submission(&submission).await.unwrap();

        let loaded = store
            .get_job_submission(execution.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, JobStatus::Succeeded);
        assert_eq!(loaded.job_id, "job-1");
    }

    #[tokio::test]
    async fn test_task_claims() {
        let store = migrated_store().await;

        let claim = store.claim_task("repo-42@abc").await.unwrap().unwrap();
        assert!(store.claim_task("repo-42@abc").await.unwrap().is_none());

        // Unfinished claims can be released for redelivery
        assert!(store.release_task(&claim).await.unwrap());
        let claim = store.claim_task("repo-42@abc").await.unwrap().unwrap();

        // Completed claims survive release
        assert!(store.complete_task(&claim, Uuid::new_v4()).await.unwrap());
        assert!(!store.release_task(&claim).await.unwrap());
        assert!(store.claim_task("repo-42@abc").await.unwrap().is_none());

        let stored = store.get_task_claim("repo-42@abc").await.unwrap().unwrap();
        assert!(stored.is_complete());
        assert!(stored.execution_id.is_some());
        assert_eq!(stored.claimed_at, claim.claimed_at);
        assert!(store.get_task_claim("repo-7@abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_takeover_has_one_winner() {
        let store = migrated_store().await;
        let original = store.claim_task("repo-42@abc").await.unwrap().unwrap();

        // Two consumers observed the same stale claim
        let observed = store.get_task_claim("repo-42@abc").await.unwrap().unwrap();
        let first = store.take_over_task(&observed).await.unwrap();
        let second = store.take_over_task(&observed).await.unwrap();

        let winner = first.expect("first takeover wins");
        assert!(second.is_none());
        assert!(winner.claimed_at > original.claimed_at);

        // The original holder lost its claim
        assert!(!store.release_task(&original).await.unwrap());
        assert!(!store.complete_task(&original, Uuid::new_v4()).await.unwrap());
        assert!(store.complete_task(&winner, Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_migration_rechecks_version() {
        let store = migrated_store().await;

        // A second runner that planned from version 0 replays step 1
        let err = store
            .apply_migration(&MIGRATIONS[0], Direction::Up)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.current_version().await.unwrap(), latest_version());
    }

    #[tokio::test]
    async fn test_coverage_result_roundtrip() {
        let store = migrated_store().await;
        let result = CoverageResult {
            execution_id: Uuid::new_v4(),
            target: "repo-42".to_string(),
            coverage_percent: 87.0,
            output_ref: Some("s3://bucket/out.json".to_string()),
            recorded_at: ms_to_dt(dt_to_ms(Utc::now())),
        };
        store.save_coverage_result(&result).await.unwrap();
        store.save_coverage_result(&result).await.unwrap();

        let loaded = store
            .get_coverage_result(result.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, result);
    }
}

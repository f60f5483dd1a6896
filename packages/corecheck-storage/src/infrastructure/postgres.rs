//! PostgreSQL Pipeline Store
//!
//! Deployed backend:
//! - Connection pooling: PgPool shared by every deployable unit
//! - Row-level upsert keys and compare-and-set versions, no advisory locks
//! - Schema managed by the migration runner (`SchemaStore`)

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::models::{dt_to_ms, ms_to_dt};
use crate::domain::{
    CoverageResult, Execution, ExecutionId, JobStatus, JobSubmission, PipelineStore,
    RepositoryRecord, SchemaStore, TaskClaim, UpsertOutcome,
};
use crate::error::{Result, StorageError};
use crate::migrations::{Direction, Migration, VERSION_TABLE_DDL};

/// PostgreSQL-backed PipelineStore
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with explicit options (host, port, user, password, database)
    pub async fn connect_with(options: PgConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(options)
            .await
            .map_err(|e| {
                StorageError::database(format!("Failed to connect to PostgreSQL: {}", e))
                    .with_source(e)
            })?;

        Ok(Self { pool })
    }

    /// Get connection pool reference
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close connection pool gracefully
    pub async fn close(self) {
        self.pool.close().await;
    }

    fn row_to_repository(row: &PgRow) -> Result<RepositoryRecord> {
        Ok(RepositoryRecord {
            external_id: row.try_get("external_id")?,
            full_name: row.try_get("full_name")?,
            default_branch: row.try_get("default_branch")?,
            html_url: row.try_get("html_url")?,
            description: row.try_get("description")?,
            archived: row.try_get("archived")?,
            pushed_at: row.try_get::<Option<i64>, _>("pushed_at")?.map(ms_to_dt),
            synced_at: ms_to_dt(row.try_get("synced_at")?),
        })
    }

    fn row_to_execution(row: &PgRow) -> Result<Execution> {
        let record: String = row.try_get("record")?;
        let mut execution: Execution = serde_json::from_str(&record)?;
        execution.version = row.try_get("version")?;
        Ok(execution)
    }

    fn row_to_job_submission(row: &PgRow) -> Result<JobSubmission> {
        let execution_id: String = row.try_get("execution_id")?;
        let status: String = row.try_get("status")?;
        Ok(JobSubmission {
            execution_id: parse_uuid(&execution_id)?,
            job_id: row.try_get("job_id")?,
            queue_ref: row.try_get("queue_ref")?,
            definition_ref: row.try_get("definition_ref")?,
            status: JobStatus::from_str(&status)?,
            result_path: row.try_get("result_path")?,
            submitted_at: ms_to_dt(row.try_get("submitted_at")?),
            updated_at: ms_to_dt(row.try_get("updated_at")?),
        })
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| StorageError::serialization(format!("Invalid UUID '{}': {}", value, e)))
}

#[async_trait]
impl PipelineStore for PostgresStore {
    async fn upsert_repository(&self, repo: &RepositoryRecord) -> Result<UpsertOutcome> {
        let fingerprint = repo.fingerprint();

        let existing: Option<String> =
            sqlx::query_scalar("SELECT fingerprint FROM repositories WHERE external_id = $1")
                .bind(&repo.external_id)
                .fetch_optional(&self.pool)
                .await?;

        if existing.as_deref() == Some(fingerprint.as_str()) {
            return Ok(UpsertOutcome::Unchanged);
        }

        sqlx::query(
            r#"
            INSERT INTO repositories (external_id, full_name, default_branch, html_url, description, archived, pushed_at, fingerprint, synced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (external_id) DO UPDATE SET
                full_name = EXCLUDED.full_name,
                default_branch = EXCLUDED.default_branch,
                html_url = EXCLUDED.html_url,
                description = EXCLUDED.description,
                archived = EXCLUDED.archived,
                pushed_at = EXCLUDED.pushed_at,
                fingerprint = EXCLUDED.fingerprint,
                synced_at = EXCLUDED.synced_at
            "#,
        )
        .bind(&repo.external_id)
        .bind(&repo.full_name)
        .bind(&repo.default_branch)
        .bind(&repo.html_url)
        .bind(&repo.description)
        .bind(repo.archived)
        .bind(repo.pushed_at.map(dt_to_ms))
        .bind(&fingerprint)
        .bind(dt_to_ms(repo.synced_at))
        .execute(&self.pool)
        .await?;

        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn get_repository(&self, external_id: &str) -> Result<Option<RepositoryRecord>> {
        let row = sqlx::query("SELECT * FROM repositories WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_repository).transpose()
    }

    async fn list_repositories(&self) -> Result<Vec<RepositoryRecord>> {
        let rows = sqlx::query("SELECT * FROM repositories ORDER BY full_name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_repository).collect()
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        let record = serde_json::to_string(execution)?;
        sqlx::query(
            r#"
            INSERT INTO executions (execution_id, state, version, record, start_time, end_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(execution.execution_id.to_string())
        .bind(execution.current_state.as_str())
        .bind(execution.version)
        .bind(record)
        .bind(dt_to_ms(execution.start_time))
        .bind(execution.end_time.map(dt_to_ms))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<i64> {
        let record = serde_json::to_string(execution)?;
        let next_version = execution.version + 1;

        let result = sqlx::query(
            r#"
            UPDATE executions SET state = $1, version = $2, record = $3, end_time = $4
            WHERE execution_id = $5 AND version = $6
            "#,
        )
        .bind(execution.current_state.as_str())
        .bind(next_version)
        .bind(record)
        .bind(execution.end_time.map(dt_to_ms))
        .bind(execution.execution_id.to_string())
        .bind(execution.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT version FROM executions WHERE execution_id = $1")
                    .bind(execution.execution_id.to_string())
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(match exists {
                Some(_) => StorageError::version_conflict(execution.execution_id, execution.version),
                None => StorageError::execution_not_found(execution.execution_id),
            });
        }

        Ok(next_version)
    }

    async fn get_execution(&self, execution_id: ExecutionId) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT record, version FROM executions WHERE execution_id = $1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn list_unfinished_executions(&self) -> Result<Vec<Execution>> {
        let rows = sqlx::query(
            r#"
            SELECT record, version FROM executions
            WHERE state NOT IN ('succeeded', 'failed')
            ORDER BY start_time
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn save_job_submission(&self, submission: &JobSubmission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_submissions (execution_id, job_id, queue_ref, definition_ref, status, result_path, submitted_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (execution_id) DO UPDATE SET
                job_id = EXCLUDED.job_id,
                queue_ref = EXCLUDED.queue_ref,
                definition_ref = EXCLUDED.definition_ref,
                status = EXCLUDED.status,
                result_path = EXCLUDED.result_path,
                submitted_at = EXCLUDED.submitted_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(submission.execution_id.to_string())
        .bind(&submission.job_id)
        .bind(&submission.queue_ref)
        .bind(&submission.definition_ref)
        .bind(submission.status.as_str())
        .bind(&submission.result_path)
        .bind(dt_to_ms(submission.submitted_at))
        .bind(dt_to_ms(submission.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job_submission(&self, execution_id: ExecutionId) -> Result<Option<JobSubmission>> {
        let row = sqlx::query("SELECT * FROM job_submissions WHERE execution_id = $1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_job_submission).transpose()
    }

    async fn save_coverage_result(&self, result: &CoverageResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO coverage_results (execution_id, target, coverage_percent, output_ref, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (execution_id) DO UPDATE SET
                target = EXCLUDED.target,
                coverage_percent = EXCLUDED.coverage_percent,
                output_ref = EXCLUDED.output_ref,
                recorded_at = EXCLUDED.recorded_at
            "#,
        )
        .bind(result.execution_id.to_string())
        .bind(&result.target)
        .bind(result.coverage_percent)
        .bind(&result.output_ref)
        .bind(dt_to_ms(result.recorded_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_coverage_result(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<CoverageResult>> {
        let row = sqlx::query("SELECT * FROM coverage_results WHERE execution_id = $1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<CoverageResult> {
            let execution_id: String = row.try_get("execution_id")?;
            Ok(CoverageResult {
                execution_id: parse_uuid(&execution_id)?,
                target: row.try_get("target")?,
                coverage_percent: row.try_get("coverage_percent")?,
                output_ref: row.try_get("output_ref")?,
                recorded_at: ms_to_dt(row.try_get("recorded_at")?),
            })
        })
        .transpose()
    }

    async fn claim_task(&self, idempotency_key: &str) -> Result<Option<TaskClaim>> {
        let claimed_at = dt_to_ms(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO processed_tasks (idempotency_key, claimed_at) VALUES ($1, $2)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(idempotency_key)
        .bind(claimed_at)
        .execute(&self.pool)
        .await?;
        Ok((result.rows_affected() == 1)
            .then(|| TaskClaim::new(idempotency_key, ms_to_dt(claimed_at))))
    }

    async fn take_over_task(&self, stale: &TaskClaim) -> Result<Option<TaskClaim>> {
        let observed = dt_to_ms(stale.claimed_at);
        let claimed_at = dt_to_ms(Utc::now()).max(observed + 1);
        let result = sqlx::query(
            r#"
            UPDATE processed_tasks SET claimed_at = $3
            WHERE idempotency_key = $1 AND claimed_at = $2 AND completed_at IS NULL
            "#,
        )
        .bind(&stale.idempotency_key)
        .bind(observed)
        .bind(claimed_at)
        .execute(&self.pool)
        .await?;
        Ok((result.rows_affected() == 1)
            .then(|| TaskClaim::new(&stale.idempotency_key, ms_to_dt(claimed_at))))
    }

    async fn complete_task(&self, claim: &TaskClaim, execution_id: ExecutionId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE processed_tasks SET execution_id = $3, completed_at = $4
            WHERE idempotency_key = $1 AND claimed_at = $2 AND completed_at IS NULL
            "#,
        )
        .bind(&claim.idempotency_key)
        .bind(dt_to_ms(claim.claimed_at))
        .bind(execution_id.to_string())
        .bind(dt_to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_task(&self, claim: &TaskClaim) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM processed_tasks
            WHERE idempotency_key = $1 AND claimed_at = $2 AND completed_at IS NULL
            "#,
        )
        .bind(&claim.idempotency_key)
        .bind(dt_to_ms(claim.claimed_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_task_claim(&self, idempotency_key: &str) -> Result<Option<TaskClaim>> {
        let row = sqlx::query(
            "SELECT idempotency_key, execution_id, claimed_at, completed_at
             FROM processed_tasks WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<TaskClaim> {
            let execution_id: Option<String> = row.try_get("execution_id")?;
            let completed_at: Option<i64> = row.try_get("completed_at")?;
            Ok(TaskClaim {
                idempotency_key: row.try_get("idempotency_key")?,
                execution_id: execution_id.as_deref().map(parse_uuid).transpose()?,
                claimed_at: ms_to_dt(row.try_get("claimed_at")?),
                completed_at: completed_at.map(ms_to_dt),
            })
        })
        .transpose()
    }
}

#[async_trait]
impl SchemaStore for PostgresStore {
    async fn current_version(&self) -> Result<u32> {
        sqlx::query(VERSION_TABLE_DDL).execute(&self.pool).await?;
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.unwrap_or(0) as u32)
    }

    async fn apply_migration(&self, migration: &Migration, direction: Direction) -> Result<u32> {
        let version = migration.resulting_version(direction);
        let expected = migration.starting_version(direction);
        let mut tx = self.pool.begin().await?;
        let conn: &mut PgConnection = &mut tx;

        sqlx::query(VERSION_TABLE_DDL).execute(&mut *conn).await?;
        // Serializes concurrent migrators until commit; the loser then reads our version
        sqlx::query("LOCK TABLE schema_version IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *conn)
            .await?;
        let found: Option<i64> =
            sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
                .fetch_optional(&mut *conn)
                .await?;
        let found = found.unwrap_or(0) as u32;
        if found != expected {
            return Err(StorageError::schema_version_conflict(expected, found));
        }

        for statement in migration.statements(direction) {
            sqlx::query(statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    StorageError::migration(format!(
                        "Migration {} ({}) {} failed: {}",
                        migration.version, migration.name, direction, e
                    ))
                    .with_source(e)
                })?;
        }
        sqlx::query(
            r#"
            INSERT INTO schema_version (id, version, updated_at) VALUES (1, $1, $2)
            ON CONFLICT (id) DO UPDATE SET version = EXCLUDED.version, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(version as i64)
        .bind(dt_to_ms(Utc::now()))
        .execute(&mut *conn)
        .await?;
        tx.commit().await?;

        Ok(version)
    }
}

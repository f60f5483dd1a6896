//! Ordered schema migrations
//!
//! Scripts stick to DDL both SQLite and PostgreSQL accept (TEXT, BIGINT,
//! BOOLEAN, DOUBLE PRECISION), so one script serves both adapters.
//! Timestamps are epoch milliseconds.

use serde::{Deserialize, Serialize};

/// Migration direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One schema step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

impl Migration {
    pub fn script(&self, direction: Direction) -> &'static str {
        match direction {
            Direction::Up => self.up,
            Direction::Down => self.down,
        }
    }

    /// Version the database must be at for this step to apply in `direction`
    pub fn starting_version(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Up => self.version - 1,
            Direction::Down => self.version,
        }
    }

    /// Individual statements of the script, for drivers that run one at a time
    pub fn statements(&self, direction: Direction) -> impl Iterator<Item = &'static str> {
        self.script(direction)
            .split(';')
            .map(str::trim)
            .filter(|stmt| !stmt.is_empty())
    }

    /// Version recorded after applying this step in `direction`
    pub fn resulting_version(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Up => self.version,
            Direction::Down => self.version - 1,
        }
    }
}

/// Global version row, created by adapters before reading the version
pub const VERSION_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY,
    version BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
)";

/// All migrations, ordered by version starting at 1 with no gaps
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_repositories",
        up: "CREATE TABLE IF NOT EXISTS repositories (
                external_id TEXT PRIMARY KEY,
                full_name TEXT NOT NULL,
                default_branch TEXT NOT NULL,
                html_url TEXT,
                description TEXT,
                archived BOOLEAN NOT NULL DEFAULT FALSE,
                pushed_at BIGINT,
                fingerprint TEXT NOT NULL,
                synced_at BIGINT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_repositories_full_name ON repositories(full_name);",
        down: "DROP INDEX IF EXISTS idx_repositories_full_name;
            DROP TABLE IF EXISTS repositories;",
    },
    Migration {
        version: 2,
        name: "create_executions",
        up: "CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                version BIGINT NOT NULL,
                record TEXT NOT NULL,
                start_time BIGINT NOT NULL,
                end_time BIGINT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_state ON executions(state);
            CREATE TABLE IF NOT EXISTS job_submissions (
                execution_id TEXT PRIMARY KEY REFERENCES executions(execution_id),
                job_id TEXT NOT NULL,
                queue_ref TEXT NOT NULL,
                definition_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                result_path TEXT NOT NULL,
                submitted_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            );",
        down: "DROP TABLE IF EXISTS job_submissions;
            DROP INDEX IF EXISTS idx_executions_state;
            DROP TABLE IF EXISTS executions;",
    },
    Migration {
        version: 3,
        name: "create_coverage_results_and_tasks",
        up: "CREATE TABLE IF NOT EXISTS coverage_results (
                execution_id TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                coverage_percent DOUBLE PRECISION NOT NULL,
                output_ref TEXT,
                recorded_at BIGINT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS processed_tasks (
                idempotency_key TEXT PRIMARY KEY,
                execution_id TEXT,
                claimed_at BIGINT NOT NULL,
                completed_at BIGINT
            );",
        down: "DROP TABLE IF EXISTS processed_tasks;
            DROP TABLE IF EXISTS coverage_results;",
    },
];

/// Highest known schema version
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Migration that brings the schema to `version`
pub fn migration(version: u32) -> Option<&'static Migration> {
    MIGRATIONS.iter().find(|m| m.version == version)
}

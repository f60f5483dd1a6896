//! Migration Runner
//!
//! Moves the schema between versions one step at a time. Each step is applied
//! atomically by the store together with the version row, so an interrupted
//! run leaves the database at the last completed step. The store re-checks the
//! starting version inside each step, so two concurrent runners cannot both
//! apply the same step.

use std::sync::Arc;
use std::time::Duration;

use corecheck_storage::{Direction, Migration, SchemaStore, MIGRATIONS};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OrchestratorError, Result};

/// `{ "action": "up" | "down", "target_version"?: n }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub action: Direction,
    #[serde(default)]
    pub target_version: Option<u32>,
}

impl MigrationRequest {
    pub fn up(target_version: Option<u32>) -> Self {
        Self {
            action: Direction::Up,
            target_version,
        }
    }

    pub fn down(target_version: Option<u32>) -> Self {
        Self {
            action: Direction::Down,
            target_version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub from_version: u32,
    pub to_version: u32,
    /// Migration versions applied, in order
    pub applied: Vec<u32>,
}

impl MigrationOutcome {
    pub fn is_noop(&self) -> bool {
        self.from_version == self.to_version
    }
}

pub struct MigrationRunner {
    store: Arc<dyn SchemaStore>,
    migrations: &'static [Migration],
    timeout: Option<Duration>,
}

impl MigrationRunner {
    pub fn new(store: Arc<dyn SchemaStore>) -> Self {
        Self {
            store,
            migrations: MIGRATIONS,
            timeout: None,
        }
    }

    pub fn with_migrations(mut self, migrations: &'static [Migration]) -> Self {
        self.migrations = migrations;
        self
    }

    /// Bound the whole run; completed steps stay applied on timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.iter().map(|m| m.version).max().unwrap_or(0)
    }

    pub async fn current_version(&self) -> Result<u32> {
        Ok(self.store.current_version().await?)
    }

    pub async fn apply(&self, request: MigrationRequest) -> Result<MigrationOutcome> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(request))
                .await
                .map_err(|_| {
                    OrchestratorError::Timeout(format!("migration exceeded {:?}", limit))
                })?,
            None => self.run(request).await,
        }
    }

    async fn run(&self, request: MigrationRequest) -> Result<MigrationOutcome> {
        let from = self.store.current_version().await?;
        let target = self.plan_target(from, request)?;

        if target == from {
            info!("Schema already at version {}; nothing to {}", from, request.action);
            return Ok(MigrationOutcome {
                from_version: from,
                to_version: from,
                applied: Vec::new(),
            });
        }

        let steps: Vec<u32> = match request.action {
            Direction::Up => (from + 1..=target).collect(),
            Direction::Down => (target + 1..=from).rev().collect(),
        };

        let mut expected = from;
        let mut applied = Vec::with_capacity(steps.len());
        for version in steps {
            let migration = self.step(version)?;

            let recorded = self.store.current_version().await?;
            if recorded != expected {
                return Err(OrchestratorError::MigrationConflict(format!(
                    "version moved from {} to {} during the run; another migrator is active",
                    expected, recorded
                )));
            }

            info!(
                "Applying migration {} ({}) {}",
                migration.version, migration.name, request.action
            );
            expected = self
                .store
                .apply_migration(migration, request.action)
                .await
                .map_err(|e| {
                    if e.is_conflict() {
                        OrchestratorError::MigrationConflict(format!(
                            "migration {} lost a race: {}; another migrator is active",
                            migration.version, e
                        ))
                    } else {
                        e.into()
                    }
                })?;
            applied.push(version);
        }

        info!("Schema migrated from version {} to {}", from, expected);
        Ok(MigrationOutcome {
            from_version: from,
            to_version: expected,
            applied,
        })
    }

    fn plan_target(&self, current: u32, request: MigrationRequest) -> Result<u32> {
        let latest = self.latest_version();
        if current > latest {
            return Err(OrchestratorError::MigrationConflict(format!(
                "database is at version {} but the latest known migration is {}",
                current, latest
            )));
        }

        let target = match (request.action, request.target_version) {
            (_, Some(target)) => target,
            (Direction::Up, None) => latest,
            (Direction::Down, None) => current.saturating_sub(1),
        };

        if target > latest {
            return Err(OrchestratorError::MigrationConflict(format!(
                "target version {} is beyond the latest known migration {}",
                target, latest
            )));
        }
        match request.action {
            Direction::Up if target < current => Err(OrchestratorError::MigrationConflict(
                format!("cannot migrate up to {} from version {}", target, current),
            )),
            Direction::Down if target > current => Err(OrchestratorError::MigrationConflict(
                format!("cannot migrate down to {} from version {}", target, current),
            )),
            _ => Ok(target),
        }
    }

    fn step(&self, version: u32) -> Result<&'static Migration> {
        self.migrations
            .iter()
            .find(|m| m.version == version)
            .ok_or_else(|| {
                OrchestratorError::MigrationConflict(format!("no migration for version {}", version))
            })
    }
}

//! Deployment configuration
//!
//! Settings come from an optional YAML file (`version: 1`, unknown fields
//! rejected) overlaid with `CORECHECK_*` environment variables. Each
//! deployable unit checks its own required values once at startup via
//! [`Settings::require`]; nothing downstream re-validates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::OrchestratorError;
use crate::policy::{RetryPolicy, TimeoutPolicy};

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting '{field}' for {unit} (set {env} or '{field}' in the config file)")]
    Missing {
        unit: Unit,
        field: &'static str,
        env: &'static str,
    },

    #[error("Invalid value for '{field}': {value}. {hint}")]
    Invalid {
        field: &'static str,
        value: String,
        hint: String,
    },

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for OrchestratorError {
    fn from(e: ConfigError) -> Self {
        OrchestratorError::Config(e.to_string())
    }
}

/// Deployable unit; each declares the settings it cannot start without
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Coordinator,
    SyncWorker,
    Migrator,
    Consumer,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Coordinator => "coordinator",
            Unit::SyncWorker => "sync-worker",
            Unit::Migrator => "migrator",
            Unit::Consumer => "consumer",
        }
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    /// Local SQLite file; takes precedence over the PostgreSQL endpoint
    pub sqlite_path: Option<PathBuf>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSettings {
    pub token: Option<String>,
    pub org: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSettings {
    /// Executable run once per coverage job
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub definition_ref: Option<String>,
    pub queue_ref: Option<String>,
    pub result_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSettings {
    pub path: Option<PathBuf>,
    pub lease_secs: Option<u64>,
    pub max_deliveries: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerSettings {
    pub concurrency: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
}

/// YAML schema v1 and merged runtime settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub version: u32,
    /// Per-unit timeout: job wall time for the coordinator, request timeout
    /// for the sync worker, overall run time for the migrator
    pub timeout_secs: Option<u64>,
    pub handler_timeout_secs: Option<u64>,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub job: JobSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Where the pipeline store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    Sqlite(PathBuf),
    Postgres {
        host: String,
        port: u16,
        user: String,
        password: String,
        name: String,
        max_connections: u32,
    },
}

impl Settings {
    /// File settings (if any) overlaid with the process environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut settings = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self {
                version: 1,
                ..Self::default()
            },
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_yaml_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let settings: Settings = serde_yaml::from_str(content)?;
        if !SUPPORTED_VERSIONS.contains(&settings.version) {
            return Err(ConfigError::UnsupportedVersion {
                found: settings.version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }
        Ok(settings)
    }

    /// Overlay `CORECHECK_*` variables; `lookup` abstracts the environment
    pub fn apply_env<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, slot: &mut Option<String>| {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *slot = Some(value);
            }
        };
        text("CORECHECK_DB_HOST", &mut self.database.host);
        text("CORECHECK_DB_USER", &mut self.database.user);
        text("CORECHECK_DB_PASSWORD", &mut self.database.password);
        text("CORECHECK_DB_NAME", &mut self.database.name);
        text("CORECHECK_UPSTREAM_TOKEN", &mut self.upstream.token);
        text("CORECHECK_UPSTREAM_ORG", &mut self.upstream.org);
        text("CORECHECK_UPSTREAM_URL", &mut self.upstream.base_url);
        text("CORECHECK_JOB_PROGRAM", &mut self.job.program);
        text("CORECHECK_JOB_DEFINITION", &mut self.job.definition_ref);
        text("CORECHECK_JOB_QUEUE", &mut self.job.queue_ref);

        if let Some(path) = lookup("CORECHECK_DB_SQLITE_PATH").filter(|v| !v.is_empty()) {
            self.database.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("CORECHECK_QUEUE_PATH").filter(|v| !v.is_empty()) {
            self.queue.path = Some(PathBuf::from(path));
        }

        if let Some(port) = parse_env(&lookup, "CORECHECK_DB_PORT", "database.port")? {
            self.database.port = Some(port);
        }
        if let Some(secs) = parse_env(&lookup, "CORECHECK_TIMEOUT_SECS", "timeout_secs")? {
            self.timeout_secs = Some(secs);
        }
        if let Some(secs) =
            parse_env(&lookup, "CORECHECK_HANDLER_TIMEOUT_SECS", "handler_timeout_secs")?
        {
            self.handler_timeout_secs = Some(secs);
        }
        if let Some(n) = parse_env(&lookup, "CORECHECK_CONSUMER_CONCURRENCY", "consumer.concurrency")? {
            self.consumer.concurrency = Some(n);
        }
        Ok(())
    }

    /// Fail fast if `unit` is missing anything it needs
    pub fn require(&self, unit: Unit) -> ConfigResult<()> {
        match unit {
            Unit::Migrator => {
                self.database_target(unit)?;
                self.unit_timeout(unit)?;
            }
            Unit::SyncWorker => {
                self.database_target(unit)?;
                self.unit_timeout(unit)?;
                present(unit, &self.upstream.token, "upstream.token", "CORECHECK_UPSTREAM_TOKEN")?;
                present(unit, &self.upstream.org, "upstream.org", "CORECHECK_UPSTREAM_ORG")?;
            }
            Unit::Coordinator => {
                self.database_target(unit)?;
                self.timeout_policy(unit)?;
                present(unit, &self.job.program, "job.program", "CORECHECK_JOB_PROGRAM")?;
                present(
                    unit,
                    &self.job.definition_ref,
                    "job.definition_ref",
                    "CORECHECK_JOB_DEFINITION",
                )?;
            }
            Unit::Consumer => {
                self.require(Unit::Coordinator)
                    .map_err(|e| relabel(e, Unit::Consumer))?;
                self.queue_path(unit)?;
            }
        }
        if let Some(retry) = &self.retry {
            if retry.multiplier.is_some_and(|m| m < 1.0) {
                return Err(ConfigError::Invalid {
                    field: "retry.multiplier",
                    value: format!("{:?}", retry.multiplier),
                    hint: "Multiplier must be >= 1.0".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn database_target(&self, unit: Unit) -> ConfigResult<DatabaseTarget> {
        if let Some(path) = &self.database.sqlite_path {
            return Ok(DatabaseTarget::Sqlite(path.clone()));
        }
        let db = &self.database;
        Ok(DatabaseTarget::Postgres {
            host: present(unit, &db.host, "database.host", "CORECHECK_DB_HOST")?.clone(),
            port: present(unit, &db.port, "database.port", "CORECHECK_DB_PORT").copied()?,
            user: present(unit, &db.user, "database.user", "CORECHECK_DB_USER")?.clone(),
            password: present(unit, &db.password, "database.password", "CORECHECK_DB_PASSWORD")?
                .clone(),
            name: present(unit, &db.name, "database.name", "CORECHECK_DB_NAME")?.clone(),
            max_connections: db.max_connections.unwrap_or(20),
        })
    }

    pub fn unit_timeout(&self, unit: Unit) -> ConfigResult<Duration> {
        let secs = *present(unit, &self.timeout_secs, "timeout_secs", "CORECHECK_TIMEOUT_SECS")?;
        positive(secs, "timeout_secs").map(Duration::from_secs)
    }

    pub fn timeout_policy(&self, unit: Unit) -> ConfigResult<TimeoutPolicy> {
        let job = self.unit_timeout(unit)?;
        let handler = *present(
            unit,
            &self.handler_timeout_secs,
            "handler_timeout_secs",
            "CORECHECK_HANDLER_TIMEOUT_SECS",
        )?;
        Ok(TimeoutPolicy {
            job,
            handler: Duration::from_secs(positive(handler, "handler_timeout_secs")?),
        })
    }

    pub fn queue_path(&self, unit: Unit) -> ConfigResult<PathBuf> {
        present(unit, &self.queue.path, "queue.path", "CORECHECK_QUEUE_PATH").cloned()
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.queue.lease_secs.unwrap_or(300))
    }

    pub fn consumer_concurrency(&self) -> usize {
        self.consumer.concurrency.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_default()
    }
}

fn present<'a, T>(
    unit: Unit,
    value: &'a Option<T>,
    field: &'static str,
    env: &'static str,
) -> ConfigResult<&'a T> {
    value.as_ref().ok_or(ConfigError::Missing { unit, field, env })
}

fn positive(value: u64, field: &'static str) -> ConfigResult<u64> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            value: value.to_string(),
            hint: "Timeouts must be at least one second".to_string(),
        });
    }
    Ok(value)
}

fn relabel(e: ConfigError, unit: Unit) -> ConfigError {
    match e {
        ConfigError::Missing { field, env, .. } => ConfigError::Missing { unit, field, env },
        other => other,
    }
}

fn parse_env<T, F>(lookup: &F, key: &'static str, field: &'static str) -> ConfigResult<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::Invalid {
            field,
            value: raw,
            hint: format!("{} must be a non-negative integer", key),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn db_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("CORECHECK_DB_HOST", "db.internal"),
            ("CORECHECK_DB_PORT", "5432"),
            ("CORECHECK_DB_USER", "corecheck"),
            ("CORECHECK_DB_PASSWORD", "secret"),
            ("CORECHECK_DB_NAME", "corecheck"),
        ]
    }

    #[test]
    fn test_migrator_from_env() {
        let mut pairs = db_env();
        pairs.push(("CORECHECK_TIMEOUT_SECS", "60"));
        let mut settings = Settings::default();
        settings.apply_env(env(&pairs)).unwrap();

        settings.require(Unit::Migrator).unwrap();
        match settings.database_target(Unit::Migrator).unwrap() {
            DatabaseTarget::Postgres { host, port, .. } => {
                assert_eq!(host, "db.internal");
                assert_eq!(port, 5432);
            }
            other => panic!("Expected Postgres target, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_password_is_fatal() {
        let pairs: Vec<_> = db_env()
            .into_iter()
            .filter(|(k, _)| *k != "CORECHECK_DB_PASSWORD")
            .chain([("CORECHECK_TIMEOUT_SECS", "60")])
            .collect();
        let mut settings = Settings::default();
        settings.apply_env(env(&pairs)).unwrap();

        let err = settings.require(Unit::Migrator).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("database.password"));
        assert!(msg.contains("CORECHECK_DB_PASSWORD"));
        assert!(msg.contains("migrator"));
    }

    #[test]
    fn test_sync_worker_requires_upstream_token() {
        let mut settings = Settings {
            timeout_secs: Some(30),
            ..Settings::default()
        };
        settings.database.sqlite_path = Some(PathBuf::from("corecheck.db"));
        settings.upstream.org = Some("acme".to_string());

        match settings.require(Unit::SyncWorker).unwrap_err() {
            ConfigError::Missing { unit, field, .. } => {
                assert_eq!(unit, Unit::SyncWorker);
                assert_eq!(field, "upstream.token");
            }
            other => panic!("Expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn test_consumer_needs_queue_and_reports_consumer_unit() {
        let mut settings = Settings {
            timeout_secs: Some(600),
            handler_timeout_secs: Some(30),
            ..Settings::default()
        };
        settings.database.sqlite_path = Some(PathBuf::from("corecheck.db"));
        settings.job.program = Some("coverage-runner".to_string());
        settings.job.definition_ref = Some("coverage:v1".to_string());
        settings.require(Unit::Coordinator).unwrap();

        match settings.require(Unit::Consumer).unwrap_err() {
            ConfigError::Missing { unit, field, .. } => {
                assert_eq!(unit, Unit::Consumer);
                assert_eq!(field, "queue.path");
            }
            other => panic!("Expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_port_rejected() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(env(&[("CORECHECK_DB_PORT", "postgres")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "database.port", .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut settings = Settings {
            timeout_secs: Some(0),
            ..Settings::default()
        };
        settings.database.sqlite_path = Some(PathBuf::from("x.db"));
        assert!(matches!(
            settings.require(Unit::Migrator),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_yaml_file_overlaid_by_env() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
version: 1
timeout_secs: 900
handler_timeout_secs: 60
database:
  sqlite_path: /var/lib/corecheck/state.db
job:
  program: coverage-runner
  args: ["--format", "json"]
  definition_ref: coverage:v1
queue:
  path: /var/lib/corecheck/queue.db
  lease_secs: 120
"#
        )
        .unwrap();

        let mut settings = Settings::from_yaml_file(file.path()).unwrap();
        settings
            .apply_env(env(&[("CORECHECK_TIMEOUT_SECS", "1200")]))
            .unwrap();

        settings.require(Unit::Consumer).unwrap();
        let timeouts = settings.timeout_policy(Unit::Consumer).unwrap();
        assert_eq!(timeouts.job, Duration::from_secs(1200));
        assert_eq!(timeouts.handler, Duration::from_secs(60));
        assert_eq!(settings.lease_duration(), Duration::from_secs(120));
        assert_eq!(settings.job.args, vec!["--format", "json"]);
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let yaml = "version: 1\ndatabase:\n  hostname: db\n";
        assert!(matches!(
            Settings::from_yaml_str(yaml),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let err = Settings::from_yaml_str("version: 2\n").unwrap_err();
        assert!(err.to_string().contains("Supported versions: 1"));
    }
}

//! Storage Domain Models
//!
//! - `Execution`: one coordinator run, persisted as a serialized record plus
//!   an indexed state column
//! - `JobSubmission`: the coverage job dispatched for an execution
//! - `RepositoryRecord`: repository metadata reconciled by the sync worker
//! - `CoverageResult`: the outcome persisted by the coverage handler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Execution identifier
pub type ExecutionId = Uuid;

// ═══════════════════════════════════════════════════════════════════════════
// Execution
// ═══════════════════════════════════════════════════════════════════════════

/// Coordinator state for a single execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    SubmittingJob,
    AwaitingJob,
    HandlingResult,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::SubmittingJob => "submitting_job",
            ExecutionState::AwaitingJob => "awaiting_job",
            ExecutionState::HandlingResult => "handling_result",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExecutionState::Pending),
            "submitting_job" => Ok(ExecutionState::SubmittingJob),
            "awaiting_job" => Ok(ExecutionState::AwaitingJob),
            "handling_result" => Ok(ExecutionState::HandlingResult),
            "succeeded" => Ok(ExecutionState::Succeeded),
            "failed" => Ok(ExecutionState::Failed),
            _ => Err(StorageError::serialization(format!(
                "Invalid execution state: {}",
                s
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Succeeded | ExecutionState::Failed)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of an execution's state history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: ExecutionState,
    pub entered_at: DateTime<Utc>,
}

/// Structured error recorded on a failed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error taxonomy name (e.g. `timeout`, `job_failed`, `handler`)
    pub kind: String,
    pub message: String,
    /// Whether re-invoking `start` with the same params may succeed
    pub retryable: bool,
    /// Diagnostic payload preserved from the failing step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Value>,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable,
            diagnostics: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Value) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }
}

/// Terminal outcome of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success { output: Value },
    Error { error: ErrorDetail },
}

/// Execution record (one end-to-end pipeline run)
///
/// `input_params` is the caller's payload and never changes. `data` starts
/// as a copy of it and receives step outputs at their result paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub input_params: Value,
    pub current_state: ExecutionState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<ExecutionResult>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub history: Vec<StateTransition>,
    /// Optimistic concurrency version, stored in its own column
    #[serde(skip)]
    pub version: i64,
}

impl Execution {
    /// Create a new execution in `Pending`
    pub fn new(input_params: Value) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::new_v4(),
            data: input_params.clone(),
            input_params,
            current_state: ExecutionState::Pending,
            start_time: now,
            end_time: None,
            result: None,
            history: vec![StateTransition {
                state: ExecutionState::Pending,
                entered_at: now,
            }],
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    /// Value attached at a dotted path inside `data`
    pub fn data_at(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(&self.data, |node, segment| node.get(segment))
    }

    /// Attach `value` at a dotted path inside `data`, creating objects on the way
    pub fn attach(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        attach_at(&mut self.data, &segments, value);
    }
}

fn attach_at(node: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(head.to_string()).or_insert(Value::Null);
        attach_at(child, rest, value);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Job Submission
// ═══════════════════════════════════════════════════════════════════════════

/// Compute-backend job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "submitted" => Ok(JobStatus::Submitted),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "timed_out" => Ok(JobStatus::TimedOut),
            _ => Err(StorageError::serialization(format!(
                "Invalid job status: {}",
                s
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One dispatch of the coverage job (keyed by owning execution)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmission {
    pub execution_id: ExecutionId,
    pub job_id: String,
    pub queue_ref: String,
    pub definition_ref: String,
    pub status: JobStatus,
    /// Dotted path in the execution's data where job output is attached
    pub result_path: String,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSubmission {
    pub fn new(
        execution_id: ExecutionId,
        job_id: impl Into<String>,
        queue_ref: impl Into<String>,
        definition_ref: impl Into<String>,
        result_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            job_id: job_id.into(),
            queue_ref: queue_ref.into(),
            definition_ref: definition_ref.into(),
            status: JobStatus::Submitted,
            result_path: result_path.into(),
            submitted_at: now,
            updated_at: now,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Repository metadata
// ═══════════════════════════════════════════════════════════════════════════

/// Repository metadata keyed by the code host's stable identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// Stable upstream identifier (e.g. GitHub numeric id)
    pub external_id: String,
    /// `owner/name`
    pub full_name: String,
    pub default_branch: String,
    pub html_url: Option<String>,
    pub description: Option<String>,
    pub archived: bool,
    pub pushed_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}

impl RepositoryRecord {
    pub fn new(
        external_id: impl Into<String>,
        full_name: impl Into<String>,
        default_branch: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            full_name: full_name.into(),
            default_branch: default_branch.into(),
            html_url: None,
            description: None,
            archived: false,
            pushed_at: None,
            synced_at: Utc::now(),
        }
    }

    /// Content fingerprint over upstream-owned fields (`synced_at` excluded)
    ///
    /// Two records with the same fingerprint are the same upstream state, so an
    /// upsert between them is a no-op.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.external_id.as_bytes());
        hasher.update([0]);
        hasher.update(self.full_name.as_bytes());
        hasher.update([0]);
        hasher.update(self.default_branch.as_bytes());
        hasher.update([0]);
        hasher.update(self.html_url.as_deref().unwrap_or("").as_bytes());
        hasher.update([0]);
        hasher.update(self.description.as_deref().unwrap_or("").as_bytes());
        hasher.update([0]);
        hasher.update([self.archived as u8]);
        hasher.update(
            self.pushed_at
                .map(|t| t.timestamp_millis())
                .unwrap_or_default()
                .to_le_bytes(),
        );
        format!("{:x}", hasher.finalize())
    }
}

/// Result of an idempotent upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_change(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Coverage results
// ═══════════════════════════════════════════════════════════════════════════

/// Coverage outcome persisted by the coverage handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageResult {
    pub execution_id: ExecutionId,
    pub target: String,
    pub coverage_percent: f64,
    pub output_ref: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Task claims
// ═══════════════════════════════════════════════════════════════════════════

/// Idempotency record for one queued task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskClaim {
    pub idempotency_key: String,
    /// Set once the task has started its execution
    pub execution_id: Option<ExecutionId>,
    pub claimed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskClaim {
    /// Fresh, unfinished claim
    pub fn new(idempotency_key: impl Into<String>, claimed_at: DateTime<Utc>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            execution_id: None,
            claimed_at,
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Timestamp helpers (all tables store epoch milliseconds)
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

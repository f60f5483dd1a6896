use corecheck_storage::{ErrorDetail, StorageError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Caller fault; not retryable without fixing the input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backend rejected the job (capacity, malformed definition, no terminate support)
    #[error("Submission rejected: {0}")]
    Submission(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Job ran to completion but signalled failure
    #[error("Job {job_id} failed: {message}")]
    JobFailed {
        job_id: String,
        message: String,
        diagnostics: Option<serde_json::Value>,
    },

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream answered but refused the request (auth, not found, bad payload)
    #[error("Upstream rejected request: {0}")]
    UpstreamRejected(String),

    #[error("Migration conflict: {0}")]
    MigrationConflict(String),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Lease expired for message {0}")]
    LeaseExpired(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn queue<E: std::fmt::Display>(e: E) -> Self {
        Self::Queue(e.to_string())
    }

    /// Taxonomy name recorded on failed executions
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Submission(_) => "submission",
            Self::Timeout(_) => "timeout",
            Self::JobFailed { .. } => "job_failed",
            Self::Handler(_) => "handler",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamRejected(_) => "upstream_rejected",
            Self::MigrationConflict(_) => "migration_conflict",
            Self::Cancelled(_) => "cancelled",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::ExecutionNotFound(_) => "execution_not_found",
            Self::Queue(_) => "queue",
            Self::LeaseExpired(_) => "lease_expired",
            Self::Storage(_) => "storage",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
            Self::Other(_) => "internal",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_)
            | Self::Handler(_)
            | Self::UpstreamUnavailable(_)
            | Self::Queue(_)
            | Self::LeaseExpired(_) => ErrorCategory::Transient,
            Self::Storage(_) | Self::Io(_) | Self::Other(_) => ErrorCategory::Infrastructure,
            Self::InvalidInput(_)
            | Self::Submission(_)
            | Self::JobFailed { .. }
            | Self::UpstreamRejected(_)
            | Self::MigrationConflict(_)
            | Self::Cancelled(_)
            | Self::InvalidStateTransition { .. }
            | Self::ExecutionNotFound(_)
            | Self::Serialization(_)
            | Self::Config(_) => ErrorCategory::Permanent,
        }
    }

    /// Structured detail stored on a `Failed` execution
    pub fn to_detail(&self) -> ErrorDetail {
        let detail = ErrorDetail::new(
            self.kind(),
            self.to_string(),
            self.category() != ErrorCategory::Permanent,
        );
        match self {
            Self::JobFailed {
                diagnostics: Some(diagnostics),
                ..
            } => detail.with_diagnostics(diagnostics.clone()),
            _ => detail,
        }
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retrying later may succeed (e.g., timeout, connection)
    Transient,
    /// Permanent error - don't retry (e.g., invalid input, job failure)
    Permanent,
    /// Infrastructure error - alert ops (e.g., database down, disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

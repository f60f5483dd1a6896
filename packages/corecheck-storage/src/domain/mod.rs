//! Domain layer: records and storage ports

pub mod models;
pub mod ports;

pub use models::{
    CoverageResult, ErrorDetail, Execution, ExecutionId, ExecutionResult, ExecutionState,
    JobStatus, JobSubmission, RepositoryRecord, StateTransition, TaskClaim, UpsertOutcome,
};
pub use ports::{PipelineStore, SchemaStore};

//! Execution state machine
//!
//! `Pending → SubmittingJob → AwaitingJob → HandlingResult → Succeeded | Failed`
//!
//! Every non-terminal state may fail. Terminal states accept no transition,
//! so a recorded result never changes once written.

use chrono::Utc;
use corecheck_storage::{
    ErrorDetail, Execution, ExecutionResult, ExecutionState, StateTransition,
};
use serde_json::Value;

use crate::error::{OrchestratorError, Result};

/// Wraps an `Execution` and applies only legal transitions to it
pub struct ExecutionStateMachine {
    execution: Execution,
}

impl ExecutionStateMachine {
    pub fn new(execution: Execution) -> Self {
        Self { execution }
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub fn execution_mut(&mut self) -> &mut Execution {
        &mut self.execution
    }

    pub fn into_execution(self) -> Execution {
        self.execution
    }

    pub fn state(&self) -> ExecutionState {
        self.execution.current_state
    }

    /// Transition: PENDING → SUBMITTING_JOB
    pub fn begin_submission(&mut self) -> Result<()> {
        self.expect(ExecutionState::Pending, ExecutionState::SubmittingJob)?;
        self.enter(ExecutionState::SubmittingJob);
        Ok(())
    }

    /// Transition: SUBMITTING_JOB → AWAITING_JOB
    pub fn job_submitted(&mut self) -> Result<()> {
        self.expect(ExecutionState::SubmittingJob, ExecutionState::AwaitingJob)?;
        self.enter(ExecutionState::AwaitingJob);
        Ok(())
    }

    /// Transition: AWAITING_JOB → HANDLING_RESULT, attaching job output
    pub fn job_succeeded(&mut self, result_path: &str, job_result: Value) -> Result<()> {
        self.expect(ExecutionState::AwaitingJob, ExecutionState::HandlingResult)?;
        self.execution.attach(result_path, job_result);
        self.enter(ExecutionState::HandlingResult);
        Ok(())
    }

    /// Transition: HANDLING_RESULT → SUCCEEDED
    pub fn succeed(&mut self, output: Value) -> Result<()> {
        self.expect(ExecutionState::HandlingResult, ExecutionState::Succeeded)?;
        self.execution.result = Some(ExecutionResult::Success { output });
        self.finish(ExecutionState::Succeeded);
        Ok(())
    }

    /// Transition: * (non-terminal) → FAILED
    pub fn fail(&mut self, error: ErrorDetail) -> Result<()> {
        if self.execution.is_terminal() {
            return Err(self.invalid(ExecutionState::Failed));
        }
        self.execution.result = Some(ExecutionResult::Error { error });
        self.finish(ExecutionState::Failed);
        Ok(())
    }

    fn expect(&self, from: ExecutionState, to: ExecutionState) -> Result<()> {
        if self.execution.current_state == from {
            Ok(())
        } else {
            Err(self.invalid(to))
        }
    }

    fn invalid(&self, to: ExecutionState) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.execution.current_state.to_string(),
            to: to.to_string(),
        }
    }

    fn enter(&mut self, state: ExecutionState) {
        self.execution.current_state = state;
        self.execution.history.push(StateTransition {
            state,
            entered_at: Utc::now(),
        });
    }

    fn finish(&mut self, state: ExecutionState) {
        self.enter(state);
        self.execution.end_time = Some(Utc::now());
    }
}

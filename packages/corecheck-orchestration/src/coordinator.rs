//! Pipeline Coordinator
//!
//! Sequences the coverage job and the result handler for each execution.
//! Every transition is persisted with a compare-and-set write, so a driver
//! that loses a race (to `cancel`, or to another process resuming the same
//! execution) stops instead of overwriting a terminal state.
//!
//! ```text
//! Pending → SubmittingJob → AwaitingJob → HandlingResult → Succeeded
//!    └──────────┴──────────────┴──────────────┴──────────→ Failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use corecheck_storage::{Execution, ExecutionId, ExecutionState, PipelineStore};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backend::ComputeBackend;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::execution::ExecutionStateMachine;
use crate::handler::{HandlerPayload, JobResult, ResultHandler};
use crate::metrics::PipelineMetrics;
use crate::policy::TimeoutPolicy;
use crate::submission::{JobDefinition, JobSubmissionAdapter};

/// Cancel re-reads the execution this many times when it races a driver
const CANCEL_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub job: JobDefinition,
    pub timeouts: TimeoutPolicy,
    /// Store polling interval for `wait_terminal` on executions driven elsewhere
    pub poll_interval: Duration,
}

impl CoordinatorConfig {
    pub fn new(job: JobDefinition, timeouts: TimeoutPolicy) -> Self {
        Self {
            job,
            timeouts,
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct PipelineCoordinator {
    store: Arc<dyn PipelineStore>,
    submitter: JobSubmissionAdapter,
    handler: Arc<dyn ResultHandler>,
    config: CoordinatorConfig,
    /// In-process drivers; the flag flips to `true` when the driver exits
    drivers: DashMap<ExecutionId, watch::Receiver<bool>>,
    metrics: Option<PipelineMetrics>,
}

impl PipelineCoordinator {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        backend: Arc<dyn ComputeBackend>,
        handler: Arc<dyn ResultHandler>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            submitter: JobSubmissionAdapter::new(backend, store.clone()),
            store,
            handler,
            config,
            drivers: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of executions currently driven by this process
    pub fn active_drivers(&self) -> usize {
        self.drivers.len()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Public operations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Validate params, persist a `Pending` execution and start driving it
    pub async fn start(self: &Arc<Self>, params: Value) -> Result<ExecutionId> {
        let execution = self.persist_new(params).await?;
        let execution_id = execution.execution_id;
        self.spawn_driver(execution);
        Ok(execution_id)
    }

    /// Persist a `Pending` execution without driving it; `resume_incomplete`
    /// picks it up
    pub async fn create(&self, params: Value) -> Result<ExecutionId> {
        Ok(self.persist_new(params).await?.execution_id)
    }

    /// Start driving a stored execution in this process
    ///
    /// `false` when it is already terminal or already driven here.
    pub async fn launch(self: &Arc<Self>, execution_id: ExecutionId) -> Result<bool> {
        if self.drivers.contains_key(&execution_id) {
            return Ok(false);
        }
        let execution = self.get(execution_id).await?;
        if execution.is_terminal() {
            return Ok(false);
        }
        self.spawn_driver(execution);
        Ok(true)
    }

    async fn persist_new(&self, params: Value) -> Result<Execution> {
        if !params.is_object() {
            return Err(OrchestratorError::InvalidInput(format!(
                "params must be a JSON object, got {}",
                json_type(&params)
            )));
        }

        let execution = Execution::new(params);
        self.store.insert_execution(&execution).await?;
        info!("Created execution {}", execution.execution_id);
        Ok(execution)
    }

    pub async fn get(&self, execution_id: ExecutionId) -> Result<Execution> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Wait until the execution is terminal and return it
    ///
    /// Follows the local driver when there is one, otherwise polls the store.
    /// If the local driver stopped on an infrastructure error the execution is
    /// returned as stored, still non-terminal.
    pub async fn wait_terminal(&self, execution_id: ExecutionId) -> Result<Execution> {
        let driver = self.drivers.get(&execution_id).map(|rx| rx.clone());
        if let Some(mut done) = driver {
            // A dropped sender also means the driver is gone
            let _ = done.wait_for(|finished| *finished).await;
            return self.get(execution_id).await;
        }

        loop {
            let execution = self.get(execution_id).await?;
            if execution.is_terminal() {
                return Ok(execution);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Cancel an execution
    ///
    /// `Pending`/`SubmittingJob` fail immediately. `AwaitingJob` first asks the
    /// backend to terminate the job; a backend that cannot terminate fails the
    /// execution with a `Submission` error, which is also returned.
    pub async fn cancel(&self, execution_id: ExecutionId, reason: &str) -> Result<Execution> {
        for _ in 0..CANCEL_ATTEMPTS {
            let execution = self.get(execution_id).await?;
            let state = execution.current_state;

            let cause = match state {
                ExecutionState::Pending | ExecutionState::SubmittingJob => {
                    OrchestratorError::Cancelled(reason.to_string())
                }
                ExecutionState::AwaitingJob => {
                    match self.store.get_job_submission(execution_id).await? {
                        Some(submission) => match self.submitter.terminate(&submission).await {
                            Ok(()) => OrchestratorError::Cancelled(reason.to_string()),
                            Err(e) => e,
                        },
                        None => OrchestratorError::Cancelled(reason.to_string()),
                    }
                }
                ExecutionState::HandlingResult
                | ExecutionState::Succeeded
                | ExecutionState::Failed => {
                    return Err(OrchestratorError::InvalidStateTransition {
                        from: state.to_string(),
                        to: "cancelled".to_string(),
                    })
                }
            };

            let mut sm = ExecutionStateMachine::new(execution);
            sm.fail(cause.to_detail())?;
            if self.persist(&mut sm).await?.is_some() {
                debug!("Cancel of {} raced a driver, re-reading", execution_id);
                continue;
            }

            info!("Cancelled execution {} in {}: {}", execution_id, state, reason);
            self.record_outcome(sm.execution());
            return match cause {
                OrchestratorError::Cancelled(_) => Ok(sm.into_execution()),
                fatal => Err(fatal),
            };
        }

        Err(OrchestratorError::Other(anyhow::anyhow!(
            "cancel of {} kept conflicting with concurrent updates",
            execution_id
        )))
    }

    /// Re-attach drivers to every non-terminal execution in the store
    pub async fn resume_incomplete(self: &Arc<Self>) -> Result<Vec<ExecutionId>> {
        let unfinished = self.store.list_unfinished_executions().await?;
        let mut resumed = Vec::with_capacity(unfinished.len());

        for execution in unfinished {
            if self.drivers.contains_key(&execution.execution_id) {
                continue;
            }
            info!(
                "Resuming execution {} in {}",
                execution.execution_id, execution.current_state
            );
            resumed.push(execution.execution_id);
            self.spawn_driver(execution);
        }
        Ok(resumed)
    }

    /// Drive an execution to a terminal state on the current task
    pub async fn drive(&self, execution: Execution) -> Result<Execution> {
        let execution_id = execution.execution_id;
        let mut sm = ExecutionStateMachine::new(execution);

        loop {
            let before = sm.state();
            match before {
                ExecutionState::Pending => sm.begin_submission()?,
                ExecutionState::SubmittingJob => self.submit_job(&mut sm).await?,
                ExecutionState::AwaitingJob => self.await_job(&mut sm).await?,
                ExecutionState::HandlingResult => self.handle_result(&mut sm).await?,
                ExecutionState::Succeeded | ExecutionState::Failed => {
                    return Ok(sm.into_execution())
                }
            }

            if let Some(stored) = self.persist(&mut sm).await? {
                warn!(
                    "Execution {} changed concurrently (now {}), driver stopping",
                    execution_id, stored.current_state
                );
                if before == ExecutionState::SubmittingJob {
                    self.abandon_job(execution_id).await;
                }
                return Ok(stored);
            }

            debug!("Execution {}: {} -> {}", execution_id, before, sm.state());
            if sm.execution().is_terminal() {
                self.record_outcome(sm.execution());
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Steps
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn submit_job(&self, sm: &mut ExecutionStateMachine) -> Result<()> {
        let execution_id = sm.execution().execution_id;

        // A resumed execution may have submitted before its state write landed
        if let Some(existing) = self.store.get_job_submission(execution_id).await? {
            info!(
                "Execution {} already has job {}, not resubmitting",
                execution_id, existing.job_id
            );
            return sm.job_submitted();
        }

        let submitted = self
            .submitter
            .submit(execution_id, &self.config.job, &sm.execution().input_params)
            .await;
        match submitted {
            Ok(_) => sm.job_submitted(),
            Err(e) => self.fail(sm, e),
        }
    }

    async fn await_job(&self, sm: &mut ExecutionStateMachine) -> Result<()> {
        let execution_id = sm.execution().execution_id;
        let Some(mut submission) = self.store.get_job_submission(execution_id).await? else {
            return self.fail(
                sm,
                OrchestratorError::Submission("no job submission recorded".to_string()),
            );
        };

        let elapsed = (Utc::now() - submission.submitted_at)
            .to_std()
            .unwrap_or_default();
        let remaining = self.config.timeouts.job.saturating_sub(elapsed);

        match self.submitter.await_terminal(&mut submission, remaining).await {
            Ok(outcome) => {
                let job_result = serde_json::to_value(JobResult::from(&outcome))
                    .map_err(OrchestratorError::serialization)?;
                sm.job_succeeded(&submission.result_path, job_result)
            }
            Err(e) => self.fail(sm, e),
        }
    }

    async fn handle_result(&self, sm: &mut ExecutionStateMachine) -> Result<()> {
        let execution_id = sm.execution().execution_id;
        let result_path = match self.store.get_job_submission(execution_id).await? {
            Some(submission) => submission.result_path,
            None => self.config.job.result_path.clone(),
        };

        let job_result = match sm.execution().data_at(&result_path).cloned() {
            Some(value) => serde_json::from_value::<JobResult>(value),
            None => {
                return self.fail(
                    sm,
                    OrchestratorError::Handler(format!("no job result at '{}'", result_path)),
                )
            }
        };
        let job_result = match job_result {
            Ok(job_result) => job_result,
            Err(e) => return self.fail(sm, OrchestratorError::serialization(e)),
        };

        let payload = HandlerPayload {
            original_params: sm.execution().input_params.clone(),
            job_result,
        };
        let timeout = self.config.timeouts.handler;

        match tokio::time::timeout(timeout, self.handler.handle(execution_id, &payload)).await {
            Ok(Ok(output)) => sm.succeed(output),
            Ok(Err(e)) => self.fail(sm, as_handler_error(e)),
            Err(_) => self.fail(
                sm,
                OrchestratorError::Timeout(format!(
                    "{} handler did not finish within {}s",
                    self.handler.name(),
                    timeout.as_secs_f64()
                )),
            ),
        }
    }

    /// Record `e` as the terminal failure
    ///
    /// Infrastructure errors are returned instead: the store is the thing
    /// failing, so the execution stays where it is for `resume_incomplete`.
    fn fail(&self, sm: &mut ExecutionStateMachine, e: OrchestratorError) -> Result<()> {
        if e.category() == ErrorCategory::Infrastructure {
            return Err(e);
        }
        error!(
            "Execution {} failed in {}: {}",
            sm.execution().execution_id,
            sm.state(),
            e
        );
        sm.fail(e.to_detail())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Plumbing
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Compare-and-set write; `Some(stored)` if another writer got there first
    async fn persist(&self, sm: &mut ExecutionStateMachine) -> Result<Option<Execution>> {
        match self.store.update_execution(sm.execution()).await {
            Ok(version) => {
                sm.execution_mut().version = version;
                Ok(None)
            }
            Err(e) if e.is_conflict() => {
                let execution_id = sm.execution().execution_id;
                let stored = self.get(execution_id).await?;
                Ok(Some(stored))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Terminate a job whose execution was taken over after submission
    async fn abandon_job(&self, execution_id: ExecutionId) {
        let submission = match self.store.get_job_submission(execution_id).await {
            Ok(Some(submission)) => submission,
            Ok(None) => return,
            Err(e) => {
                warn!("Cannot load job for abandoned execution {}: {}", execution_id, e);
                return;
            }
        };
        if let Err(e) = self.submitter.terminate(&submission).await {
            warn!(
                "Job {} of execution {} left running: {}",
                submission.job_id, execution_id, e
            );
        }
    }

    fn spawn_driver(self: &Arc<Self>, execution: Execution) {
        let execution_id = execution.execution_id;
        let (done_tx, done_rx) = watch::channel(false);
        self.drivers.insert(execution_id, done_rx);

        let this = Arc::clone(self);
        let span = info_span!("execution", id = %execution_id);
        tokio::spawn(
            async move {
                match this.drive(execution).await {
                    Ok(finished) => {
                        info!("Execution {} ended in {}", execution_id, finished.current_state)
                    }
                    // Left non-terminal in the store; `resume_incomplete` picks it up
                    Err(e) => error!("Driver for execution {} stopped: {}", execution_id, e),
                }
                let _ = done_tx.send(true);
                this.drivers.remove(&execution_id);
            }
            .instrument(span),
        );
    }

    fn record_outcome(&self, execution: &Execution) {
        if let Some(metrics) = &self.metrics {
            metrics.execution_finished(execution.current_state.as_str());
        }
    }
}

fn as_handler_error(e: OrchestratorError) -> OrchestratorError {
    match e {
        OrchestratorError::Handler(_) | OrchestratorError::Timeout(_) => e,
        other => OrchestratorError::Handler(other.to_string()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

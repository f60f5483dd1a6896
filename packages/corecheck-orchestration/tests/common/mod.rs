//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corecheck_orchestration::{
    ComputeBackend, CoordinatorConfig, CoverageHandler, FunctionBackend, HandlerPayload,
    JobDefinition, JobOutcome, JobRequest, PipelineCoordinator, Result, ResultHandler,
    TimeoutPolicy,
};
use corecheck_storage::{
    Direction, Execution, ExecutionId, ExecutionResult, ExecutionState, PipelineStore,
    SchemaStore, SqliteStore, MIGRATIONS,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

pub async fn migrated_store() -> Arc<SqliteStore> {
    let store = SqliteStore::in_memory().unwrap();
    for migration in MIGRATIONS {
        store.apply_migration(migration, Direction::Up).await.unwrap();
    }
    Arc::new(store)
}

pub fn function_backend<F>(job: F) -> Arc<dyn ComputeBackend>
where
    F: Fn(JobRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
{
    Arc::new(FunctionBackend::new(8, job))
}

pub fn coordinator(
    store: Arc<SqliteStore>,
    backend: Arc<dyn ComputeBackend>,
    handler: Arc<dyn ResultHandler>,
    timeouts: TimeoutPolicy,
) -> Arc<PipelineCoordinator> {
    let config = CoordinatorConfig {
        poll_interval: Duration::from_millis(20),
        ..CoordinatorConfig::new(JobDefinition::new("coverage:v1", "default"), timeouts)
    };
    Arc::new(PipelineCoordinator::new(store, backend, handler, config))
}

pub fn coverage_coordinator(
    store: Arc<SqliteStore>,
    backend: Arc<dyn ComputeBackend>,
) -> Arc<PipelineCoordinator> {
    let handler = Arc::new(CoverageHandler::new(store.clone()));
    coordinator(store, backend, handler, TimeoutPolicy::default())
}

/// Poll the store until the execution reaches `state`
pub async fn wait_for_state(
    coordinator: &PipelineCoordinator,
    execution_id: ExecutionId,
    state: ExecutionState,
) -> Execution {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let execution = coordinator.get(execution_id).await.unwrap();
            if execution.current_state == state {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("execution {execution_id} never reached {state}"))
}

pub fn error_kind(execution: &Execution) -> &str {
    match &execution.result {
        Some(ExecutionResult::Error { error }) => &error.kind,
        other => panic!("expected an error result, got {other:?}"),
    }
}

/// Handler that only counts its invocations
#[derive(Default)]
pub struct CountingHandler {
    pub calls: AtomicUsize,
}

impl CountingHandler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultHandler for CountingHandler {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn handle(&self, _execution_id: ExecutionId, _payload: &HandlerPayload) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

pub async fn stored(store: &SqliteStore, execution_id: ExecutionId) -> Execution {
    store.get_execution(execution_id).await.unwrap().unwrap()
}

/// Handler that outlives any reasonable handler timeout
pub struct SlowHandler(pub Duration);

#[async_trait]
impl ResultHandler for SlowHandler {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn handle(&self, _execution_id: ExecutionId, _payload: &HandlerPayload) -> Result<Value> {
        tokio::time::sleep(self.0).await;
        Ok(Value::Null)
    }
}

/// Backend whose `submit` blocks until `open` is called and whose jobs never
/// finish; records every job it is asked to stop
#[derive(Default)]
pub struct GatedBackend {
    gate: Notify,
    pub submitted: AtomicUsize,
    pub terminated: Mutex<Vec<String>>,
    pub discarded: Mutex<Vec<String>>,
}

impl GatedBackend {
    pub fn open(&self) {
        self.gate.notify_one();
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().clone()
    }
}

#[async_trait]
impl ComputeBackend for GatedBackend {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn submit(&self, request: JobRequest) -> Result<String> {
        self.gate.notified().await;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(format!("gated-{}", request.execution_id))
    }

    async fn wait(&self, _job_id: &str) -> Result<JobOutcome> {
        futures::future::pending().await
    }

    fn supports_terminate(&self) -> bool {
        true
    }

    async fn terminate(&self, job_id: &str) -> Result<()> {
        self.terminated.lock().push(job_id.to_string());
        Ok(())
    }

    async fn discard(&self, job_id: &str) {
        self.discarded.lock().push(job_id.to_string());
    }
}

//! Corecheck Consumer
//!
//! Turns queued corecheck tasks into coordinator executions.
//!
//! Delivery is at-least-once, so every task carries an idempotency key that is
//! claimed in the store before an execution starts:
//!
//! - claim acquired: create the execution, mark the claim complete, start
//!   driving it, acknowledge
//! - claim already complete: acknowledge the duplicate without starting anything
//! - claim held by someone else: leave the message leased; it comes back later
//!
//! Claim writes are compare-and-set on the claim's timestamp, so a consumer
//! whose claim was taken over can tell and backs off. The execution is only
//! driven once its claim is marked complete; an execution whose claim cannot
//! be completed is cancelled while still `Pending`.
//!
//! A failed task is never released back to the queue. Its lease runs out and
//! the queue redelivers it, which spaces retries by the lease duration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use corecheck_storage::{ExecutionId, PipelineStore, TaskClaim};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::PipelineCoordinator;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::metrics::PipelineMetrics;
use crate::policy::RetryPolicy;
use crate::queue::{QueueMessage, WorkQueue};

/// Queue payload published by the sync worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorecheckTask {
    pub idempotency_key: String,
    pub external_id: String,
    pub full_name: String,
    pub default_branch: String,
    #[serde(default)]
    pub html_url: Option<String>,
}

impl CorecheckTask {
    /// Input params of the execution this task starts
    pub fn execution_params(&self) -> Value {
        json!({
            "target": self.full_name,
            "repository_id": self.external_id,
            "default_branch": self.default_branch,
            "html_url": self.html_url,
            "idempotency_key": self.idempotency_key,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    /// An unfinished claim older than this is assumed abandoned and taken over
    pub stale_claim_after: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            concurrency: num_cpus::get(),
            lease_duration: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            stale_claim_after: Duration::from_secs(300),
        }
    }
}

/// What happened to one delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Started(ExecutionId),
    /// Already processed; acknowledged without a new execution
    Duplicate,
    /// Claimed by another consumer; left for redelivery
    Deferred,
    /// Left for redelivery after an error
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub started: usize,
    pub duplicates: usize,
    pub deferred: usize,
    pub failed: usize,
}

impl ConsumerReport {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Started(_) => self.started += 1,
            TaskOutcome::Duplicate => self.duplicates += 1,
            TaskOutcome::Deferred => self.deferred += 1,
            TaskOutcome::Failed => self.failed += 1,
        }
    }

    fn merge(&mut self, other: &ConsumerReport) {
        self.started += other.started;
        self.duplicates += other.duplicates;
        self.deferred += other.deferred;
        self.failed += other.failed;
    }

    pub fn delivered(&self) -> usize {
        self.started + self.duplicates + self.deferred + self.failed
    }
}

enum Claim {
    Acquired(TaskClaim),
    Completed(Option<ExecutionId>),
    Held,
}

pub struct CorecheckConsumer {
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn PipelineStore>,
    coordinator: Arc<PipelineCoordinator>,
    config: ConsumerConfig,
    retry: RetryPolicy,
    metrics: Option<PipelineMetrics>,
    dead_seen: AtomicUsize,
}

impl CorecheckConsumer {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn PipelineStore>,
        coordinator: Arc<PipelineCoordinator>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            coordinator,
            config,
            retry: RetryPolicy::default(),
            metrics: None,
            dead_seen: AtomicUsize::new(0),
        }
    }

    /// Backoff for completing a claim after its execution was created
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll until `shutdown` fires; in-flight tasks finish before returning
    pub async fn run(&self, shutdown: CancellationToken) -> ConsumerReport {
        info!(
            "Consumer started (concurrency {}, lease {:?})",
            self.config.concurrency, self.config.lease_duration
        );
        let mut total = ConsumerReport::default();

        while !shutdown.is_cancelled() {
            let report = self.poll(&shutdown).await;
            if report.delivered() > 0 {
                info!(
                    "Poll: {} started, {} duplicates, {} deferred, {} failed",
                    report.started, report.duplicates, report.deferred, report.failed
                );
            }
            total.merge(&report);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Consumer stopped after {} deliveries", total.delivered());
        total
    }

    /// Drain every currently visible message once
    pub async fn poll_once(&self) -> ConsumerReport {
        self.poll(&CancellationToken::new()).await
    }

    async fn poll(&self, shutdown: &CancellationToken) -> ConsumerReport {
        let report = self
            .queue
            .consume(self.config.batch_size, self.config.lease_duration)
            .take_until(shutdown.cancelled())
            .map(|item| async move {
                match item {
                    Ok(message) => self.handle(message).await,
                    Err(e) => {
                        error!("Queue receive failed: {}", e);
                        TaskOutcome::Failed
                    }
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .fold(ConsumerReport::default(), |mut report, outcome| async move {
                report.record(outcome);
                report
            })
            .await;

        self.observe_dead_letters().await;
        report
    }

    /// Process one delivered message
    pub async fn handle(&self, message: QueueMessage) -> TaskOutcome {
        if let Some(metrics) = &self.metrics {
            metrics.delivered(1);
        }

        let task: CorecheckTask = match serde_json::from_value(message.payload.clone()) {
            Ok(task) => task,
            Err(e) => {
                warn!(
                    "Message {} is not a corecheck task (delivery {}): {}",
                    message.message_id, message.delivery_count, e
                );
                return TaskOutcome::Failed;
            }
        };

        match self.process(&task, &message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "Task {} failed on delivery {}: {}",
                    task.idempotency_key, message.delivery_count, e
                );
                TaskOutcome::Failed
            }
        }
    }

    async fn process(&self, task: &CorecheckTask, message: &QueueMessage) -> Result<TaskOutcome> {
        let key = task.idempotency_key.as_str();

        let claim = match self.claim(key).await? {
            Claim::Acquired(claim) => claim,
            Claim::Completed(execution_id) => {
                debug!(
                    "Task {} already started execution {:?}",
                    key, execution_id
                );
                self.acknowledge(message).await;
                return Ok(TaskOutcome::Duplicate);
            }
            Claim::Held => {
                debug!("Task {} is claimed elsewhere; deferring", key);
                return Ok(TaskOutcome::Deferred);
            }
        };

        let execution_id = match self.coordinator.create(task.execution_params()).await {
            Ok(execution_id) => execution_id,
            Err(e) => {
                self.release(&claim).await;
                return Err(e);
            }
        };

        let store = &self.store;
        let pending = &claim;
        let completed = self
            .retry
            .retry_when(
                "complete task claim",
                |e| e.category() == ErrorCategory::Infrastructure,
                || async move {
                    store
                        .complete_task(pending, execution_id)
                        .await
                        .map_err(OrchestratorError::from)
                },
            )
            .await;
        match completed {
            Ok(true) => {}
            Ok(false) => {
                warn!("Claim {} was taken over; dropping execution {}", key, execution_id);
                self.discard_execution(execution_id).await;
                return Ok(TaskOutcome::Deferred);
            }
            Err(e) => {
                self.discard_execution(execution_id).await;
                self.release(&claim).await;
                return Err(e);
            }
        }

        // The claim now points at the execution; `resume` drives it if this fails
        if let Err(e) = self.coordinator.launch(execution_id).await {
            warn!(
                "Execution {} for task {} left pending: {}",
                execution_id, key, e
            );
        }
        info!(
            "Task {} started execution {} for {}",
            key, execution_id, task.full_name
        );

        self.acknowledge(message).await;
        Ok(TaskOutcome::Started(execution_id))
    }

    async fn claim(&self, key: &str) -> Result<Claim> {
        if let Some(claim) = self.store.claim_task(key).await? {
            return Ok(Claim::Acquired(claim));
        }

        let Some(existing) = self.store.get_task_claim(key).await? else {
            // Released between the two calls
            return Ok(match self.store.claim_task(key).await? {
                Some(claim) => Claim::Acquired(claim),
                None => Claim::Held,
            });
        };
        if existing.is_complete() {
            return Ok(Claim::Completed(existing.execution_id));
        }

        let age = (Utc::now() - existing.claimed_at)
            .to_std()
            .unwrap_or_default();
        if age < self.config.stale_claim_after {
            return Ok(Claim::Held);
        }

        Ok(match self.store.take_over_task(&existing).await? {
            Some(claim) => {
                warn!("Took over claim {} abandoned {:?} ago", key, age);
                Claim::Acquired(claim)
            }
            None => Claim::Held,
        })
    }

    async fn release(&self, claim: &TaskClaim) {
        match self.store.release_task(claim).await {
            Ok(true) => {}
            Ok(false) => debug!("Claim {} changed hands before release", claim.idempotency_key),
            Err(e) => warn!("Failed to release claim {}: {}", claim.idempotency_key, e),
        }
    }

    /// Cancel a still-`Pending` execution that lost its claim
    async fn discard_execution(&self, execution_id: ExecutionId) {
        if let Err(e) = self
            .coordinator
            .cancel(execution_id, "task claim could not be completed")
            .await
        {
            warn!("Orphaned execution {} not cancelled: {}", execution_id, e);
        }
    }

    /// Acknowledge failures are logged only: a redelivery finds the completed
    /// claim and is acknowledged as a duplicate
    async fn acknowledge(&self, message: &QueueMessage) {
        match self.queue.acknowledge(&message.lease).await {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.acknowledged();
                }
            }
            Err(OrchestratorError::LeaseExpired(_)) => warn!(
                "Lease on message {} expired before acknowledgement",
                message.message_id
            ),
            Err(e) => warn!("Failed to acknowledge message {}: {}", message.message_id, e),
        }
    }

    async fn observe_dead_letters(&self) {
        let dead = match self.queue.depth().await {
            Ok(depth) => depth.dead,
            Err(e) => {
                debug!("Queue depth unavailable: {}", e);
                return;
            }
        };
        let seen = self.dead_seen.swap(dead, Ordering::Relaxed);
        if dead > seen {
            warn!("{} message(s) moved to the dead-letter set", dead - seen);
            if let Some(metrics) = &self.metrics {
                metrics.dead_lettered(dead - seen);
            }
        }
    }
}

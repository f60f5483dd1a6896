//! Sync Worker
//!
//! Reconciles repository metadata from the code host into the store and
//! publishes a corecheck task for every new or changed active repository.
//!
//! Writes are idempotent upserts keyed by the upstream id; records the worker
//! does not see upstream are left alone. A task is published before its record
//! is upserted, so a crash in between republishes on the next run and the
//! consumer drops the duplicate by idempotency key.

mod github;

pub use github::GithubSource;

use std::sync::Arc;

use async_trait::async_trait;
use corecheck_storage::{PipelineStore, RepositoryRecord, UpsertOutcome};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::consumer::CorecheckTask;
use crate::error::{OrchestratorError, Result};
use crate::policy::RetryPolicy;
use crate::queue::WorkQueue;

/// Listing entry; enough to fetch the full record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub external_id: String,
    pub full_name: String,
}

/// Upstream repository listing (code host API)
#[async_trait]
pub trait RepositorySource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every repository visible upstream
    ///
    /// An error here means the upstream is unreachable for this run.
    async fn list_repositories(&self) -> Result<Vec<RepositoryRef>>;

    async fn fetch_repository(&self, repository: &RepositoryRef) -> Result<RepositoryRecord>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub listed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub messages_published: usize,
}

impl SyncReport {
    pub fn records_upserted(&self) -> usize {
        self.inserted + self.updated
    }
}

enum RecordOutcome {
    Synced { outcome: UpsertOutcome, published: bool },
    Failed,
}

pub struct SyncWorker {
    source: Arc<dyn RepositorySource>,
    store: Arc<dyn PipelineStore>,
    queue: Option<Arc<dyn WorkQueue>>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl SyncWorker {
    pub fn new(source: Arc<dyn RepositorySource>, store: Arc<dyn PipelineStore>) -> Self {
        Self {
            source,
            store,
            queue: None,
            retry: RetryPolicy::default(),
            concurrency: 4,
        }
    }

    /// Publish corecheck tasks for changed repositories
    pub fn with_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn run(&self) -> Result<SyncReport> {
        let source = self.source.name();
        let listing = self
            .retry
            .retry("list repositories", || self.source.list_repositories())
            .await
            .map_err(|e| match e {
                OrchestratorError::UpstreamUnavailable(_) => e,
                other => OrchestratorError::UpstreamUnavailable(format!(
                    "{} listing failed: {}",
                    source, other
                )),
            })?;
        info!("Listed {} repositories from {}", listing.len(), source);

        let mut report = SyncReport {
            listed: listing.len(),
            ..SyncReport::default()
        };
        let mut outcomes = stream::iter(listing.iter())
            .map(|repository| self.sync_one(repository))
            .buffer_unordered(self.concurrency);

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                RecordOutcome::Synced { outcome, published } => {
                    match outcome {
                        UpsertOutcome::Inserted => report.inserted += 1,
                        UpsertOutcome::Updated => report.updated += 1,
                        UpsertOutcome::Unchanged => report.unchanged += 1,
                    }
                    if published {
                        report.messages_published += 1;
                    }
                }
                RecordOutcome::Failed => report.failed += 1,
            }
        }

        info!(
            "Sync finished: {} inserted, {} updated, {} unchanged, {} failed, {} published",
            report.inserted,
            report.updated,
            report.unchanged,
            report.failed,
            report.messages_published
        );
        Ok(report)
    }

    async fn sync_one(&self, repository: &RepositoryRef) -> RecordOutcome {
        match self.try_sync_one(repository).await {
            Ok((outcome, published)) => RecordOutcome::Synced { outcome, published },
            Err(e) => {
                warn!(
                    "Failed to sync {} ({}): {}",
                    repository.full_name, repository.external_id, e
                );
                RecordOutcome::Failed
            }
        }
    }

    async fn try_sync_one(&self, repository: &RepositoryRef) -> Result<(UpsertOutcome, bool)> {
        let record = self
            .retry
            .retry("fetch repository", || self.source.fetch_repository(repository))
            .await?;

        let fingerprint = record.fingerprint();
        let changed = match self.store.get_repository(&record.external_id).await? {
            Some(stored) => stored.fingerprint() != fingerprint,
            None => true,
        };

        let mut published = false;
        if changed && !record.archived {
            if let Some(queue) = &self.queue {
                let task = task_for(&record, &fingerprint);
                let payload = serde_json::to_value(&task).map_err(OrchestratorError::serialization)?;
                let message_id = queue.publish(payload).await?;
                debug!(
                    "Published task {} as message {}",
                    task.idempotency_key, message_id
                );
                published = true;
            }
        }

        let outcome = self.store.upsert_repository(&record).await?;
        Ok((outcome, published))
    }
}

/// Task for one upstream state of a repository
///
/// The key changes only when the upstream fingerprint does.
pub fn task_for(record: &RepositoryRecord, fingerprint: &str) -> CorecheckTask {
    let short = fingerprint.get(..16).unwrap_or(fingerprint);
    CorecheckTask {
        idempotency_key: format!("{}@{}", record.external_id, short),
        external_id: record.external_id.clone(),
        full_name: record.full_name.clone(),
        default_branch: record.default_branch.clone(),
        html_url: record.html_url.clone(),
    }
}

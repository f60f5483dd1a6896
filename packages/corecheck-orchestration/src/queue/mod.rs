//! Work Queue
//!
//! At-least-once delivery through visibility leases:
//! - `receive` leases visible messages and rotates their lease id
//! - `acknowledge` deletes a message, but only for the current lease holder
//! - an unacknowledged message becomes visible again when its lease runs out
//!
//! No ordering guarantee. Messages that exceed `max_deliveries` are moved to a
//! retained dead-letter set instead of being dropped.

mod memory;
mod sqlite;

pub use memory::MemoryQueue;
pub use sqlite::SqliteQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Proof of a current lease on one message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken {
    pub message_id: String,
    pub lease_id: String,
}

/// A leased message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    /// Deliveries so far, this one included
    pub delivery_count: u32,
    pub lease: LeaseToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub visible: usize,
    pub leased: usize,
    pub dead: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Deliveries allowed before a message is dead-lettered (`None` = unlimited)
    pub max_deliveries: Option<u32>,
}

/// Work Queue port
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, payload: Value) -> Result<String>;

    /// Lease up to `max` visible messages for `lease_duration`
    async fn receive(&self, max: usize, lease_duration: Duration) -> Result<Vec<QueueMessage>>;

    /// Delete the message; `LeaseExpired` if `lease` is no longer current
    async fn acknowledge(&self, lease: &LeaseToken) -> Result<()>;

    /// Push the lease deadline out to now + `lease_duration`
    async fn extend_lease(&self, lease: &LeaseToken, lease_duration: Duration) -> Result<()>;

    /// Give the message back for immediate redelivery
    async fn release(&self, lease: &LeaseToken) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Move a dead letter back into the queue with a fresh delivery count
    async fn redrive(&self, message_id: &str) -> Result<()>;

    async fn depth(&self) -> Result<QueueDepth>;

    /// Lazily lease messages in batches of `batch_size` until none are visible
    ///
    /// The stream is finite; call again to poll again. A receive error is
    /// yielded once and ends the stream.
    fn consume(
        &self,
        batch_size: usize,
        lease_duration: Duration,
    ) -> BoxStream<'_, Result<QueueMessage>> {
        let batch_size = batch_size.max(1);
        stream::unfold(false, move |finished| async move {
            if finished {
                return None;
            }
            match self.receive(batch_size, lease_duration).await {
                Ok(batch) if batch.is_empty() => None,
                Ok(batch) => {
                    let items: Vec<Result<QueueMessage>> = batch.into_iter().map(Ok).collect();
                    Some((stream::iter(items), false))
                }
                Err(e) => Some((stream::iter(vec![Err(e)]), true)),
            }
        })
        .flatten()
        .boxed()
    }
}

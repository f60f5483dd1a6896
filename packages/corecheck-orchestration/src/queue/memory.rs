//! In-memory work queue (single process, tests and local runs)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use super::{DeadLetter, LeaseToken, QueueDepth, QueueMessage, QueueOptions, WorkQueue};
use crate::error::{OrchestratorError, Result};

struct Entry {
    seq: u64,
    payload: Value,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
    visible_at: Instant,
    lease_id: Option<String>,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    messages: HashMap<String, Entry>,
    dead: Vec<DeadLetter>,
}

#[derive(Default)]
pub struct MemoryQueue {
    options: QueueOptions,
    state: Mutex<State>,
}

impl MemoryQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            state: Mutex::new(State::default()),
        }
    }

    fn current<'a>(state: &'a mut State, lease: &LeaseToken) -> Result<&'a mut Entry> {
        match state.messages.get_mut(&lease.message_id) {
            Some(entry) if entry.lease_id.as_deref() == Some(lease.lease_id.as_str()) => Ok(entry),
            _ => Err(OrchestratorError::LeaseExpired(lease.message_id.clone())),
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn publish(&self, payload: Value) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.messages.insert(
            message_id.clone(),
            Entry {
                seq,
                payload,
                enqueued_at: Utc::now(),
                delivery_count: 0,
                visible_at: Instant::now(),
                lease_id: None,
            },
        );
        Ok(message_id)
    }

    async fn receive(&self, max: usize, lease_duration: Duration) -> Result<Vec<QueueMessage>> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let mut visible: Vec<(u64, String)> = state
            .messages
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(id, entry)| (entry.seq, id.clone()))
            .collect();
        visible.sort_unstable();

        let mut leased = Vec::new();
        for (_, message_id) in visible {
            if leased.len() >= max {
                break;
            }
            let exhausted = match (state.messages.get(&message_id), self.options.max_deliveries) {
                (Some(entry), Some(limit)) => entry.delivery_count >= limit,
                _ => false,
            };
            if exhausted {
                if let Some(entry) = state.messages.remove(&message_id) {
                    warn!(
                        "Message {} dead-lettered after {} deliveries",
                        message_id, entry.delivery_count
                    );
                    state.dead.push(DeadLetter {
                        message_id,
                        payload: entry.payload,
                        enqueued_at: entry.enqueued_at,
                        delivery_count: entry.delivery_count,
                        dead_lettered_at: Utc::now(),
                    });
                }
                continue;
            }

            if let Some(entry) = state.messages.get_mut(&message_id) {
                let lease_id = Uuid::new_v4().to_string();
                entry.delivery_count += 1;
                entry.visible_at = now + lease_duration;
                entry.lease_id = Some(lease_id.clone());
                leased.push(QueueMessage {
                    message_id: message_id.clone(),
                    payload: entry.payload.clone(),
                    enqueued_at: entry.enqueued_at,
                    delivery_count: entry.delivery_count,
                    lease: LeaseToken {
                        message_id,
                        lease_id,
                    },
                });
            }
        }
        Ok(leased)
    }

    async fn acknowledge(&self, lease: &LeaseToken) -> Result<()> {
        let mut state = self.state.lock();
        Self::current(&mut state, lease)?;
        state.messages.remove(&lease.message_id);
        Ok(())
    }

    async fn extend_lease(&self, lease: &LeaseToken, lease_duration: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let entry = Self::current(&mut state, lease)?;
        entry.visible_at = Instant::now() + lease_duration;
        Ok(())
    }

    async fn release(&self, lease: &LeaseToken) -> Result<()> {
        let mut state = self.state.lock();
        let entry = Self::current(&mut state, lease)?;
        entry.visible_at = Instant::now();
        entry.lease_id = None;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.lock().dead.clone())
    }

    async fn redrive(&self, message_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let position = state
            .dead
            .iter()
            .position(|d| d.message_id == message_id)
            .ok_or_else(|| OrchestratorError::queue(format!("no dead letter {}", message_id)))?;
        let dead = state.dead.remove(position);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.messages.insert(
            dead.message_id,
            Entry {
                seq,
                payload: dead.payload,
                enqueued_at: dead.enqueued_at,
                delivery_count: 0,
                visible_at: Instant::now(),
                lease_id: None,
            },
        );
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = Instant::now();
        let state = self.state.lock();
        let visible = state
            .messages
            .values()
            .filter(|entry| entry.visible_at <= now)
            .count();
        Ok(QueueDepth {
            visible,
            leased: state.messages.len() - visible,
            dead: state.dead.len(),
        })
    }
}

//! Durable SQLite work queue
//!
//! One row per message. A lease is `(lease_id, visible_at)`: receiving sets a
//! fresh lease id and pushes `visible_at` into the future, so an expired lease
//! needs no sweeper, the row simply becomes selectable again.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DeadLetter, LeaseToken, QueueDepth, QueueMessage, QueueOptions, WorkQueue};
use crate::error::{OrchestratorError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_messages (
    message_id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    delivery_count INTEGER NOT NULL DEFAULT 0,
    visible_at INTEGER NOT NULL,
    lease_id TEXT,
    dead_lettered_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_queue_messages_visible
    ON queue_messages(dead_lettered_at, visible_at);
";

#[derive(Clone)]
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
    options: QueueOptions,
}

impl SqliteQueue {
    pub fn open(path: impl AsRef<Path>, options: QueueOptions) -> Result<Self> {
        let conn = Connection::open(path).map_err(OrchestratorError::queue)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(OrchestratorError::queue)?;
        // WAL lets a publisher and a consumer process share the file
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(OrchestratorError::queue)?;
        Self::init(conn, options)
    }

    pub fn in_memory(options: QueueOptions) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(OrchestratorError::queue)?;
        Self::init(conn, options)
    }

    fn init(conn: Connection, options: QueueOptions) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(OrchestratorError::queue)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            options,
        })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn lease_ms(lease_duration: Duration) -> i64 {
    i64::try_from(lease_duration.as_millis()).unwrap_or(i64::MAX / 2)
}

fn parse_payload(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(OrchestratorError::serialization)
}

fn dead_letter(tx: &rusqlite::Transaction<'_>, message_id: &str, now: i64) -> Result<()> {
    tx.execute(
        "UPDATE queue_messages SET dead_lettered_at = ?2, lease_id = NULL
         WHERE message_id = ?1",
        params![message_id, now],
    )
    .map_err(OrchestratorError::queue)?;
    Ok(())
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn publish(&self, payload: Value) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let raw = serde_json::to_string(&payload).map_err(OrchestratorError::serialization)?;
        let now = now_ms();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO queue_messages (message_id, payload, enqueued_at, delivery_count, visible_at)
             VALUES (?1, ?2, ?3, 0, ?3)",
            params![message_id, raw, now],
        )
        .map_err(OrchestratorError::queue)?;
        Ok(message_id)
    }

    async fn receive(&self, max: usize, lease_duration: Duration) -> Result<Vec<QueueMessage>> {
        let now = now_ms();
        let expires = now.saturating_add(lease_ms(lease_duration));

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(OrchestratorError::queue)?;

        // Every row handled below drops out of the selection (leased into the
        // future or dead-lettered), so each page only holds fresh candidates
        let mut leased = Vec::with_capacity(max);
        while leased.len() < max {
            let candidates: Vec<(String, String, i64, u32)> = {
                let mut stmt = tx
                    .prepare_cached(
                        "SELECT message_id, payload, enqueued_at, delivery_count FROM queue_messages
                         WHERE dead_lettered_at IS NULL AND visible_at <= ?1
                         ORDER BY enqueued_at
                         LIMIT ?2",
                    )
                    .map_err(OrchestratorError::queue)?;
                let rows = stmt
                    .query_map(params![now, (max - leased.len()) as i64], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map_err(OrchestratorError::queue)?;
                rows.collect::<rusqlite::Result<_>>()
                    .map_err(OrchestratorError::queue)?
            };
            if candidates.is_empty() {
                break;
            }

            for (message_id, raw, enqueued_at, delivery_count) in candidates {
                if self
                    .options
                    .max_deliveries
                    .is_some_and(|limit| delivery_count >= limit)
                {
                    warn!(
                        "Message {} dead-lettered after {} deliveries",
                        message_id, delivery_count
                    );
                    dead_letter(&tx, &message_id, now)?;
                    continue;
                }

                let payload = match parse_payload(&raw) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Message {} dead-lettered, payload unreadable: {}", message_id, e);
                        dead_letter(&tx, &message_id, now)?;
                        continue;
                    }
                };

                let lease_id = Uuid::new_v4().to_string();
                tx.execute(
                    "UPDATE queue_messages
                     SET delivery_count = delivery_count + 1, visible_at = ?2, lease_id = ?3
                     WHERE message_id = ?1",
                    params![message_id, expires, lease_id],
                )
                .map_err(OrchestratorError::queue)?;

                leased.push(QueueMessage {
                    payload,
                    enqueued_at: ms_to_dt(enqueued_at),
                    delivery_count: delivery_count + 1,
                    lease: LeaseToken {
                        message_id: message_id.clone(),
                        lease_id,
                    },
                    message_id,
                });
            }
        }

        tx.commit().map_err(OrchestratorError::queue)?;
        if !leased.is_empty() {
            debug!("Leased {} message(s)", leased.len());
        }
        Ok(leased)
    }

    async fn acknowledge(&self, lease: &LeaseToken) -> Result<()> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM queue_messages
                 WHERE message_id = ?1 AND lease_id = ?2 AND dead_lettered_at IS NULL",
                params![lease.message_id, lease.lease_id],
            )
            .map_err(OrchestratorError::queue)?;
        if deleted == 0 {
            return Err(OrchestratorError::LeaseExpired(lease.message_id.clone()));
        }
        Ok(())
    }

    async fn extend_lease(&self, lease: &LeaseToken, lease_duration: Duration) -> Result<()> {
        let expires = now_ms().saturating_add(lease_ms(lease_duration));
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE queue_messages SET visible_at = ?3
                 WHERE message_id = ?1 AND lease_id = ?2 AND dead_lettered_at IS NULL",
                params![lease.message_id, lease.lease_id, expires],
            )
            .map_err(OrchestratorError::queue)?;
        if updated == 0 {
            return Err(OrchestratorError::LeaseExpired(lease.message_id.clone()));
        }
        Ok(())
    }

    async fn release(&self, lease: &LeaseToken) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE queue_messages SET visible_at = ?3, lease_id = NULL
                 WHERE message_id = ?1 AND lease_id = ?2 AND dead_lettered_at IS NULL",
                params![lease.message_id, lease.lease_id, now_ms()],
            )
            .map_err(OrchestratorError::queue)?;
        if updated == 0 {
            return Err(OrchestratorError::LeaseExpired(lease.message_id.clone()));
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT message_id, payload, enqueued_at, delivery_count, dead_lettered_at
                 FROM queue_messages WHERE dead_lettered_at IS NOT NULL
                 ORDER BY dead_lettered_at",
            )
            .map_err(OrchestratorError::queue)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(OrchestratorError::queue)?;

        let mut dead = Vec::new();
        for row in rows {
            let (message_id, raw, enqueued_at, delivery_count, dead_at) =
                row.map_err(OrchestratorError::queue)?;
            // Unreadable payloads are kept verbatim for inspection
            let payload = parse_payload(&raw).unwrap_or(Value::String(raw));
            dead.push(DeadLetter {
                message_id,
                payload,
                enqueued_at: ms_to_dt(enqueued_at),
                delivery_count,
                dead_lettered_at: ms_to_dt(dead_at),
            });
        }
        Ok(dead)
    }

    async fn redrive(&self, message_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE queue_messages
                 SET dead_lettered_at = NULL, delivery_count = 0, visible_at = ?2, lease_id = NULL
                 WHERE message_id = ?1 AND dead_lettered_at IS NOT NULL",
                params![message_id, now_ms()],
            )
            .map_err(OrchestratorError::queue)?;
        if updated == 0 {
            return Err(OrchestratorError::queue(format!("no dead letter {}", message_id)));
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = now_ms();
        let conn = self.conn.lock();
        let count = |sql: &str, with_now: bool| -> Result<usize> {
            let n: i64 = if with_now {
                conn.query_row(sql, params![now], |row| row.get(0))
            } else {
                conn.query_row(sql, [], |row| row.get(0))
            }
            .optional()
            .map_err(OrchestratorError::queue)?
            .unwrap_or(0);
            Ok(n as usize)
        };

        Ok(QueueDepth {
            visible: count(
                "SELECT COUNT(*) FROM queue_messages WHERE dead_lettered_at IS NULL AND visible_at <= ?1",
                true,
            )?,
            leased: count(
                "SELECT COUNT(*) FROM queue_messages WHERE dead_lettered_at IS NULL AND visible_at > ?1",
                true,
            )?,
            dead: count(
                "SELECT COUNT(*) FROM queue_messages WHERE dead_lettered_at IS NOT NULL",
                false,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const SHORT_LEASE: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_publish_receive_acknowledge() {
        let queue = SqliteQueue::in_memory(QueueOptions::default()).unwrap();
        let id = queue
            .publish(json!({"idempotency_key": "repo-42@abc"}))
            .await
            .unwrap();

        let messages = queue.receive(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, id);
        assert_eq!(messages[0].payload["idempotency_key"], "repo-42@abc");
        assert_eq!(messages[0].delivery_count, 1);

        queue.acknowledge(&messages[0].lease).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_redelivery_after_lease_expiry() {
        let queue = SqliteQueue::in_memory(QueueOptions::default()).unwrap();
        queue.publish(json!({"n": 1})).await.unwrap();

        let first = queue.receive(1, SHORT_LEASE).await.unwrap().remove(0);
        assert!(queue.receive(1, SHORT_LEASE).await.unwrap().is_empty());

        tokio::time::sleep(SHORT_LEASE * 3).await;

        let second = queue.receive(1, SHORT_LEASE).await.unwrap().remove(0);
        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.delivery_count, 2);
        assert!(matches!(
            queue.acknowledge(&first.lease).await,
            Err(OrchestratorError::LeaseExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");

        {
            let queue = SqliteQueue::open(&path, QueueOptions::default()).unwrap();
            queue.publish(json!({"durable": true})).await.unwrap();
            // leased but never acknowledged before the "crash"
            queue.receive(1, SHORT_LEASE).await.unwrap();
        }

        tokio::time::sleep(SHORT_LEASE * 3).await;
        let queue = SqliteQueue::open(&path, QueueOptions::default()).unwrap();
        let messages = queue.receive(1, SHORT_LEASE).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, json!({"durable": true}));
        assert_eq!(messages[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_and_redrive() {
        let queue = SqliteQueue::in_memory(QueueOptions {
            max_deliveries: Some(1),
        })
        .unwrap();
        let id = queue.publish(json!({"poison": true})).await.unwrap();

        assert_eq!(queue.receive(1, SHORT_LEASE).await.unwrap().len(), 1);
        tokio::time::sleep(SHORT_LEASE * 3).await;
        assert!(queue.receive(1, SHORT_LEASE).await.unwrap().is_empty());

        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.dead, 1);
        assert_eq!(queue.dead_letters().await.unwrap()[0].message_id, id);

        queue.redrive(&id).await.unwrap();
        assert_eq!(queue.receive(1, SHORT_LEASE).await.unwrap()[0].delivery_count, 1);
        assert!(queue.redrive(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_dead_lettered_rows_do_not_shrink_batch() {
        let queue = SqliteQueue::in_memory(QueueOptions {
            max_deliveries: Some(1),
        })
        .unwrap();
        for n in 0..3 {
            queue.publish(json!({"poison": n})).await.unwrap();
        }
        assert_eq!(queue.receive(3, SHORT_LEASE).await.unwrap().len(), 3);
        tokio::time::sleep(SHORT_LEASE * 3).await;
        let fresh = queue.publish(json!({"fresh": true})).await.unwrap();

        // The three exhausted messages sort first but must not use up the batch
        let messages = queue.receive(1, SHORT_LEASE).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, fresh);
        assert_eq!(queue.depth().await.unwrap().dead, 3);
    }

    #[tokio::test]
    async fn test_unreadable_payload_is_dead_lettered() {
        let queue = SqliteQueue::in_memory(QueueOptions::default()).unwrap();
        queue
            .conn
            .lock()
            .execute(
                "INSERT INTO queue_messages (message_id, payload, enqueued_at, delivery_count, visible_at)
                 VALUES ('corrupt', '{not json', 0, 0, 0)",
                [],
            )
            .unwrap();
        let good = queue.publish(json!({"ok": true})).await.unwrap();

        let messages = queue.receive(10, SHORT_LEASE).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, good);

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, "corrupt");
        assert_eq!(dead[0].payload, json!("{not json"));
    }

    #[tokio::test]
    async fn test_release_makes_visible_immediately() {
        let queue = SqliteQueue::in_memory(QueueOptions::default()).unwrap();
        queue.publish(json!({})).await.unwrap();
        let message = queue.receive(1, Duration::from_secs(60)).await.unwrap().remove(0);

        queue.release(&message.lease).await.unwrap();
        let again = queue.receive(1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert!(queue.release(&message.lease).await.is_err());
    }
}

//! # PostgreSQL Message Queue (pgmq)
//!
//! Thin queue adapter over the `pgmq` extension SQL API, sharing the
//! orchestrator's sqlx pool. Messages are JSON documents; a read hides a
//! message for the visibility timeout and it is redelivered unless deleted.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument};

use super::{MessagingError, Publisher};

/// A message read from a queue, still hidden from other readers.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: i64,
    pub read_count: i32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PgmqQueue {
    pool: PgPool,
    queue_name: String,
}

impl PgmqQueue {
    pub fn new(pool: PgPool, queue_name: impl Into<String>) -> Result<Self, MessagingError> {
        let queue_name = queue_name.into();
        let valid = !queue_name.is_empty()
            && queue_name.len() <= 47
            && queue_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(MessagingError::invalid_queue_name(
                queue_name,
                "expected 1 to 47 ascii letters, digits or underscores",
            ));
        }
        Ok(Self { pool, queue_name })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Creates the queue if it does not exist yet.
    #[instrument(skip(self), fields(queue = %self.queue_name))]
    pub async fn ensure_queue(&self) -> Result<(), MessagingError> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(&self.queue_name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                MessagingError::queue_operation(&self.queue_name, "create", e.to_string())
            })?;
        info!(queue = %self.queue_name, "✅ Queue ready");
        Ok(())
    }

    pub async fn send(&self, payload: &[u8]) -> Result<i64, MessagingError> {
        let message: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| MessagingError::payload(e.to_string()))?;
        let row = sqlx::query("SELECT pgmq.send($1, $2) AS msg_id")
            .bind(&self.queue_name)
            .bind(message)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MessagingError::queue_operation(&self.queue_name, "send", e.to_string()))?;
        let msg_id: i64 = row.try_get("msg_id")?;
        debug!(queue = %self.queue_name, msg_id, "📤 Message sent");
        Ok(msg_id)
    }

    /// Reads up to `batch_size` messages, hiding them for `visibility_timeout` seconds.
    pub async fn read(
        &self,
        visibility_timeout: i32,
        batch_size: i32,
    ) -> Result<Vec<QueueMessage>, MessagingError> {
        let rows = sqlx::query("SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, $3)")
            .bind(&self.queue_name)
            .bind(visibility_timeout)
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MessagingError::queue_operation(&self.queue_name, "read", e.to_string()))?;

        rows.into_iter()
            .map(|row| -> Result<QueueMessage, MessagingError> {
                let message: serde_json::Value = row.try_get("message")?;
                Ok(QueueMessage {
                    msg_id: row.try_get("msg_id")?,
                    read_count: row.try_get("read_ct")?,
                    payload: serde_json::to_vec(&message)?,
                })
            })
            .collect()
    }

    /// Acknowledges a message.
    pub async fn delete(&self, msg_id: i64) -> Result<bool, MessagingError> {
        let row = sqlx::query("SELECT pgmq.delete($1, $2) AS deleted")
            .bind(&self.queue_name)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                MessagingError::queue_operation(&self.queue_name, "delete", e.to_string())
            })?;
        Ok(row.try_get("deleted")?)
    }
}

#[async_trait]
impl Publisher for PgmqQueue {
    async fn publish(&self, payloads: &[Vec<u8>]) -> Result<(), MessagingError> {
        for payload in payloads {
            self.send(payload).await?;
        }
        Ok(())
    }
}

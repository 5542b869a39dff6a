//! # Messaging Error Types
//!
//! Failures of the order and event publishers. Every one of them means the
//! message may not have been delivered; the dispatcher never swallows them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Invalid queue name {queue_name:?}: {reason}")]
    InvalidQueueName { queue_name: String, reason: String },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    /// A payload that is not a JSON document, or a row that does not decode.
    #[error("Invalid message payload: {message}")]
    Payload { message: String },

    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

impl MessagingError {
    pub fn invalid_queue_name(queue_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueueName {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    pub fn queue_operation(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload {
            message: message.into(),
        }
    }

    pub fn channel_closed(channel: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel: channel.into(),
        }
    }
}

impl From<sqlx::Error> for MessagingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnNotFound(_) | sqlx::Error::ColumnDecode { .. } => {
                MessagingError::payload(err.to_string())
            }
            _ => MessagingError::queue_operation("pgmq", "query", err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::payload(err.to_string())
    }
}

//! # Event Consumer
//!
//! Polls the events queue and feeds every message to the dispatcher.
//!
//! A message is acknowledged once handled, including when handling failed
//! for good (the failure is then recorded on the job or logged here).
//! Messages whose handling hit a temporary or publishing error are left
//! alone: the queue redelivers them after the visibility timeout.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use super::dispatcher::EventDispatcher;
use crate::config::MessagingConfig;
use crate::error::{CatalogError, Result};
use crate::messaging::{PgmqQueue, QueueMessage};
use crate::state_machine::unmarshal_event;

/// Pause after a failed poll.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Redeliver,
}

/// What to do with a message given the outcome of its handling.
pub fn disposition(result: &Result<()>) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(error) if error.is_temporary() || error.is_publishing() => Disposition::Redeliver,
        Err(_) => Disposition::Ack,
    }
}

/// Decodes and dispatches one payload. Undecodable payloads are dropped.
pub async fn process_payload(dispatcher: &EventDispatcher, payload: &[u8]) -> Disposition {
    let event = match unmarshal_event(payload) {
        Ok(event) => event,
        Err(error) => {
            error!(error = %error, "❌ Undecodable event dropped");
            return Disposition::Ack;
        }
    };
    let job_id = event.job_id();
    let result = dispatcher.handle_event(event).await;
    let outcome = disposition(&result);
    if let Err(error) = &result {
        match outcome {
            Disposition::Redeliver => {
                warn!(job_id = %job_id, error = %error, "🔄 Event left for redelivery")
            }
            Disposition::Ack => {
                error!(job_id = %job_id, error = %error, "❌ Event handling failed")
            }
        }
    }
    outcome
}

#[derive(Debug, Clone)]
pub struct EventConsumer {
    queue: PgmqQueue,
    dispatcher: Arc<EventDispatcher>,
    config: MessagingConfig,
}

impl EventConsumer {
    pub fn new(
        queue: PgmqQueue,
        dispatcher: Arc<EventDispatcher>,
        config: MessagingConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            config,
        }
    }

    /// Polls until `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) -> Result<()> {
        info!(queue = %self.queue.queue_name(), "🚀 Event consumer started");
        loop {
            let wait = match self.poll_once().await {
                Ok(0) => self.config.poll_interval(),
                Ok(handled) => {
                    debug!(handled, "batch handled");
                    Duration::ZERO
                }
                Err(error) => {
                    error!(error = %error, "❌ Polling the events queue failed");
                    ERROR_BACKOFF
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.notified() => {
                    debug!("Shutdown notification received");
                    break;
                }
            }
        }
        info!("Event consumer stopped");
        Ok(())
    }

    /// Reads and handles one batch. Returns how many messages were read.
    #[instrument(skip(self), fields(queue = %self.queue.queue_name()))]
    pub async fn poll_once(&self) -> Result<usize> {
        let messages = self
            .queue
            .read(self.config.visibility_timeout_seconds, self.config.batch_size)
            .await
            .map_err(CatalogError::from)?;
        let count = messages.len();
        for message in messages {
            self.handle(message).await?;
        }
        Ok(count)
    }

    async fn handle(&self, message: QueueMessage) -> Result<()> {
        if message.read_count > 1 {
            debug!(msg_id = message.msg_id, read_count = message.read_count, "redelivered event");
        }
        match process_payload(&self.dispatcher, &message.payload).await {
            Disposition::Ack => {
                self.queue.delete(message.msg_id).await?;
            }
            Disposition::Redeliver => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessagingError;

    #[test]
    fn test_disposition() {
        assert_eq!(disposition(&Ok(())), Disposition::Ack);
        assert_eq!(
            disposition(&Err(CatalogError::not_found("job", "x"))),
            Disposition::Ack
        );
        assert_eq!(
            disposition(&Err(CatalogError::not_found("job", "x").temporary())),
            Disposition::Redeliver
        );
        let publishing = CatalogError::from(MessagingError::channel_closed("events"));
        assert_eq!(disposition(&Err(publishing)), Disposition::Redeliver);
    }
}

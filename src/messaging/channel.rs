//! In-process publisher.
//!
//! Keeps a copy of every published payload and optionally forwards it to a
//! tokio channel, so an embedded dispatcher loop (or a test) can consume it.
//!
//! ```rust
//! use catalog_orchestrator::messaging::{ChannelPublisher, Publisher};
//! # tokio_test::block_on(async {
//! let publisher = ChannelPublisher::new("orders");
//! publisher.publish(&[b"order".to_vec()]).await.unwrap();
//! assert_eq!(publisher.drain(), vec![b"order".to_vec()]);
//! assert!(publisher.is_empty());
//! # });
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{MessagingError, Publisher};

#[derive(Debug, Default)]
pub struct ChannelPublisher {
    name: String,
    published: Mutex<Vec<Vec<u8>>>,
    forward: Option<mpsc::UnboundedSender<Vec<u8>>>,
    fail_next: Mutex<usize>,
}

impl ChannelPublisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Publisher forwarding every payload to the returned receiver.
    pub fn with_receiver(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = Self {
            name: name.into(),
            forward: Some(tx),
            ..Self::default()
        };
        (publisher, rx)
    }

    /// Payloads published so far.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.published.lock().clone()
    }

    /// Removes and returns the payloads published so far.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.published.lock())
    }

    pub fn len(&self) -> usize {
        self.published.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes the next `count` publish calls fail, as a lost connection would.
    pub fn fail_next(&self, count: usize) {
        *self.fail_next.lock() = count;
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, payloads: &[Vec<u8>]) -> Result<(), MessagingError> {
        {
            let mut fail_next = self.fail_next.lock();
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(MessagingError::queue_operation(
                    &self.name,
                    "publish",
                    "simulated failure",
                ));
            }
        }
        self.published.lock().extend(payloads.iter().cloned());
        if let Some(forward) = &self.forward {
            for payload in payloads {
                forward
                    .send(payload.clone())
                    .map_err(|_| MessagingError::channel_closed(&self.name))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_records_and_forwards() {
        let (publisher, mut rx) = ChannelPublisher::with_receiver("events");
        publisher
            .publish(&[b"{}".to_vec(), b"[]".to_vec()])
            .await
            .unwrap();
        assert_eq!(publisher.len(), 2);
        assert_eq!(rx.recv().await.unwrap(), b"{}".to_vec());
        assert_eq!(publisher.drain().len(), 2);
        assert!(publisher.is_empty());
    }

    #[tokio::test]
    async fn test_simulated_failure() {
        let publisher = ChannelPublisher::new("orders");
        publisher.fail_next(1);
        assert!(publisher.publish(&[b"{}".to_vec()]).await.is_err());
        assert!(publisher.publish(&[b"{}".to_vec()]).await.is_ok());
        assert_eq!(publisher.len(), 1);
    }
}

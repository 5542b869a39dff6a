//! # Messaging
//!
//! Two channels connect the orchestrator to the outside world:
//!
//! - **orders**: consolidation task payloads for the external executor
//! - **events**: [`Event`](crate::state_machine::Event)s re-entering the
//!   dispatcher (task outcomes, user commands and asynchronous job steps)
//!
//! Both are written through the [`Publisher`] trait. Production uses
//! [`PgmqQueue`]; tests and embedded setups use [`ChannelPublisher`].

use async_trait::async_trait;

pub mod channel;
pub mod errors;
pub mod pgmq;

pub use channel::ChannelPublisher;
pub use errors::MessagingError;
pub use pgmq::{PgmqQueue, QueueMessage};

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes every payload, in order. Payloads are JSON documents.
    async fn publish(&self, payloads: &[Vec<u8>]) -> Result<(), MessagingError>;
}

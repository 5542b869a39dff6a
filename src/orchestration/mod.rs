//! # Orchestration Engine
//!
//! Drives consolidation and deletion jobs through their state machines.
//!
//! ## Core Components
//!
//! - **EventDispatcher**: applies job and task events and runs the entry
//!   action of every state a job reaches
//! - **Persister**: writes aggregates atomically, guarded by the job OCC
//!   timestamp
//! - **JobService**: creates jobs and forwards operator commands
//! - **EventConsumer**: feeds the events queue into the dispatcher
//! - **CancellationChannel**: cooperative cancellation markers read by
//!   external executors
//!
//! Entry actions live next to the job kind they serve: `consolidation`,
//! `order_preparation` and `deletion`.

pub mod cancellation;
mod consolidation;
mod deletion;
pub mod dispatcher;
pub mod event_consumer;
pub mod job_service;
pub mod order_preparation;
pub mod persister;

pub use cancellation::{marker_uri, CancellationChannel};
pub use dispatcher::EventDispatcher;
pub use event_consumer::{disposition, process_payload, Disposition, EventConsumer};
pub use job_service::{ConsolidationRequest, DeletionRequest, JobService, MAX_LOG_PAGE};
pub use order_preparation::{
    container_base_name, need_consolidation, needs_reconsolidation, pack_records,
    CandidateContainer, ConsolidationNeed,
};
pub use persister::Persister;

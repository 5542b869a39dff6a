#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Catalog Orchestrator
//!
//! Orchestration core of a raster data catalog: the job engine that turns
//! indexed raster datasets into consolidated, tiled containers and removes
//! the datasets they supersede.
//!
//! ## Overview
//!
//! A catalog indexes raster **datasets** (one file or subdataset per record
//! and variable instance) grouped in **containers**. A **consolidation job**
//! rewrites the datasets of one instance into cloud-optimized containers laid
//! out on a regular grid; a **deletion job** removes datasets from the
//! catalog and their files from storage. Jobs advance through static
//! per-kind state machines; every multi-row change of a step is atomic and
//! concurrent workers are serialized per job by optimistic concurrency.
//!
//! ## Module Organization
//!
//! - [`models`] - Catalog entities, jobs, tasks and the consolidation order payload
//! - [`state_machine`] - Job states, events and transition tables
//! - [`orchestration`] - Dispatcher, entry actions, persister and job service
//! - [`database`] - Storage backend contract with PostgreSQL and in-memory backends
//! - [`messaging`] - Order and event publishers (pgmq, in-process channels)
//! - [`storage`] - Container file removal and cancellation markers
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use catalog_orchestrator::database::InMemoryBackend;
//! use catalog_orchestrator::messaging::ChannelPublisher;
//! use catalog_orchestrator::orchestration::{EventDispatcher, JobService};
//! use catalog_orchestrator::storage::InMemoryStorage;
//!
//! let dispatcher = EventDispatcher::new(
//!     Arc::new(InMemoryBackend::new()),
//!     Arc::new(ChannelPublisher::new("events")),
//!     Arc::new(ChannelPublisher::new("orders")),
//!     Arc::new(InMemoryStorage::new()),
//!     "mem://cancellation",
//! );
//! let service = JobService::new(Arc::new(dispatcher));
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests (in-memory backend)
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod storage;

pub use config::{ConfigManager, ExecutionConfig, MessagingConfig, OrchestratorConfig};
pub use database::{Backend, DatasetFilter, JobFilter, TransactionalBackend};
pub use error::{CatalogError, Result};
pub use models::{Container, Dataset, Job, LockFlag};
pub use orchestration::{EventConsumer, EventDispatcher, JobService, Persister};
pub use state_machine::{
    Event, ExecutionLevel, JobEvent, JobState, JobStatus, TaskEvent, TaskStatus,
};

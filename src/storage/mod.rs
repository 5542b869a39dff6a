//! # Container Storage
//!
//! Access to the physical containers and to the cancellation side-channel.
//! Object-store adapters live outside this crate; it ships a local
//! filesystem adapter (`file://` uris) and an in-memory one.

use async_trait::async_trait;
use thiserror::Error;

pub mod local;
pub mod memory;

pub use local::LocalStorage;
pub use memory::InMemoryStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Unsupported uri: {uri}")]
    UnsupportedUri { uri: String },

    #[error("Storage I/O error on {uri}: {message}")]
    Io { uri: String, message: String },
}

impl StorageError {
    pub fn unsupported_uri(uri: impl Into<String>) -> Self {
        Self::UnsupportedUri { uri: uri.into() }
    }

    pub fn io(uri: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Io {
            uri: uri.into(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
pub trait ContainerStorage: Send + Sync {
    /// Removes the object at `uri`. Removing a missing object succeeds.
    async fn delete(&self, uri: &str) -> Result<(), StorageError>;

    async fn exists(&self, uri: &str) -> Result<bool, StorageError>;

    /// Creates or replaces the object at `uri`.
    async fn write(&self, uri: &str, contents: &[u8]) -> Result<(), StorageError>;
}

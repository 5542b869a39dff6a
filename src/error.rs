//! Error types for the catalog orchestrator.
//!
//! `CatalogError` carries the semantic taxonomy surfaced to callers. The
//! `Temporary` variant is orthogonal to it: any error can be wrapped to mark it
//! as retryable (lost OCC race, connection failure, pool exhaustion).

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// Malformed input; never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    EntityNotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    EntityAlreadyExists { entity: &'static str, id: String },

    #[error("{entity} {id} still has dependencies: {reason}")]
    DependencyStillExists {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// The current state cannot process the event.
    #[error("Unhandled event {event} for {entity} {id} in state {state}")]
    UnhandledEvent {
        entity: &'static str,
        id: String,
        state: String,
        event: String,
    },

    #[error("Should never happen: {0}")]
    ShouldNeverHappen(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Temporary error: {0}")]
    Temporary(Box<CatalogError>),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

impl CatalogError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::EntityNotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn already_exists(entity: &'static str, id: impl ToString) -> Self {
        Self::EntityAlreadyExists {
            entity,
            id: id.to_string(),
        }
    }

    pub fn dependency_still_exists(
        entity: &'static str,
        id: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::DependencyStillExists {
            entity,
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn should_never_happen(message: impl Into<String>) -> Self {
        Self::ShouldNeverHappen(message.into())
    }

    /// Wraps the error as retryable. Already-temporary errors are not wrapped twice.
    pub fn temporary(self) -> Self {
        match self {
            Self::Temporary(_) => self,
            other => Self::Temporary(Box::new(other)),
        }
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// The error with any temporary marker removed.
    pub fn root_cause(&self) -> &CatalogError {
        match self {
            Self::Temporary(inner) => inner.root_cause(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Self::EntityNotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root_cause(), Self::EntityAlreadyExists { .. })
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self.root_cause(), Self::UnhandledEvent { .. })
    }

    /// Errors raised by the message bus. They escape state-entry actions
    /// because the published side effect may not have happened.
    pub fn is_publishing(&self) -> bool {
        matches!(self.root_cause(), Self::Messaging(_))
    }
}

impl From<sqlx::Error> for CatalogError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => Self::EntityNotFound {
                entity: "row",
                id: String::from("unknown"),
            },
            sqlx::Error::Database(db_error) => {
                let message = db_error.message().to_string();
                if db_error.is_unique_violation() {
                    Self::EntityAlreadyExists {
                        entity: "row",
                        id: db_error.constraint().unwrap_or(&message).to_string(),
                    }
                } else if db_error.is_foreign_key_violation() {
                    Self::DependencyStillExists {
                        entity: "row",
                        id: db_error.constraint().unwrap_or("unknown").to_string(),
                        reason: message,
                    }
                } else if db_error.is_check_violation() {
                    Self::Validation(message)
                } else {
                    Self::Database(error.to_string())
                }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => Self::Database(error.to_string()).temporary(),
            _ => Self::Database(error.to_string()),
        }
    }
}

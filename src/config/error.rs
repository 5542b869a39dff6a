//! Errors raised while loading or validating the orchestrator configuration.

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{field} must be set in the {section}")]
    MissingRequiredField { field: String, section: String },

    #[error("{field} = {value:?} rejected: {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Configuration directory not found: {path}")]
    DirectoryNotFound { path: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigurationError {
    pub fn missing_required_field(field: impl Into<String>, section: impl Into<String>) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            section: section.into(),
        }
    }

    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

use crate::registry::Provider;
use thiserror::Error;

/// Errors produced by backup queries, exports and uploads.
///
/// "No backup found yet" is not an error: it is reported through
/// [`QueryOutcome::NotFound`](crate::retry::QueryOutcome::NotFound).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    #[error("invalid environment: {environment} is not configured for {provider}")]
    UnknownEnvironment {
        provider: Provider,
        environment: String,
    },

    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("{operation} failed: {message}")]
    Upstream {
        operation: &'static str,
        message: String,
    },

    #[error("upload failed: {0}")]
    Upload(String),
}

impl BackupError {
    pub fn upstream(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Upstream {
            operation,
            message: message.into(),
        }
    }

    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload(message.into())
    }

    /// Configuration errors are rejected before any cloud call and never retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BackupError::UnknownEnvironment { .. } | BackupError::MissingConfig(_)
        )
    }
}

//! Error types for Tidemark operations

use crate::QueryKey;
use thiserror::Error;

/// Failures reported by the Remote Data Client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request failed{}: {message}", status_suffix(.status))]
    Request { status: Option<u16>, message: String },

    #[error("Failed to decode response: {reason}")]
    Decode { reason: String },
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {}", s))
        .unwrap_or_default()
}

impl TransportError {
    /// HTTP-like status carried by the failure, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request { status, .. } => *status,
            Self::Decode { .. } => None,
        }
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Query key has no segments")]
    EmptyKey,

    #[error("Query key segment {index} is empty")]
    EmptySegment { index: usize },

    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Cache storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Cache store lock poisoned")]
    LockPoisoned,

    #[error("Cached value for {key} has a different type than requested")]
    TypeMismatch { key: QueryKey },

    #[error("Execution for {key} ended without a result")]
    ExecutionAborted { key: QueryKey },

    #[error("Subscription to {key} was closed by the store")]
    SubscriptionClosed { key: QueryKey },

    #[error("No async runtime available to execute {key}")]
    RuntimeUnavailable { key: QueryKey },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Tidemark errors.
///
/// `Clone` because one execution's outcome is shared by every request
/// attached to it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Build a transport failure from a status and message.
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport(TransportError::Request {
            status,
            message: message.into(),
        })
    }

    /// Only failed requests are worth a silent retry; a body that did not
    /// decode will not decode on the next attempt either.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Request { .. }))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Result type alias for Tidemark operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================

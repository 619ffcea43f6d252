//! Error types for kyrokv.
//!
//! Every layer has its own strongly typed error enum so callers can match on
//! the exact condition. Transient connection failures are retried inside the
//! connection manager; what reaches the caller is final.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while establishing or holding the physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Opening the store timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Upgrade to version {requested} is blocked by {open_handles} open connection(s)")]
    Blocked {
        requested: u32,
        open_handles: usize,
    },

    #[error("Requested version {requested} is older than stored version {stored}")]
    VersionConflict {
        requested: u32,
        stored: u32,
    },

    #[error("Access to the store was denied: {reason}")]
    Denied {
        reason: String,
    },
}

impl ConnectionError {
    pub(crate) fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns true if the manager may retry after this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Blocked { .. })
    }
}

/// Problems found while sanitizing a value for storage.
///
/// `CyclicReference` and `UnsupportedType` never fail a write; they are
/// recorded in the sanitize report for the node that was omitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializationError {
    #[error("Cyclic reference omitted at {path}")]
    CyclicReference {
        path: String,
    },

    #[error("Unsupported {type_name} omitted at {path}")]
    UnsupportedType {
        path: String,
        type_name: String,
    },

    #[error("Encoded value is {size} bytes, ceiling is {limit} bytes")]
    SizeExceeded {
        size: usize,
        limit: usize,
    },
}

/// Errors returned by the partitioned key-value API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Partition not found: {partition}")]
    NotFound {
        partition: String,
    },

    #[error("Storage quota exceeded: need {required} bytes, {available} available")]
    QuotaExceeded {
        required: u64,
        available: u64,
    },

    #[error("Transaction aborted: {reason}")]
    TransactionAborted {
        reason: String,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(#[from] ConnectionError),

    #[error("Value rejected: {0}")]
    Serialization(#[from] SerializationError),
}

impl StoreError {
    pub(crate) fn aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(partition: &str) -> Self {
        Self::NotFound {
            partition: partition.to_string(),
        }
    }

    /// Returns true when local storage is exhausted and the caller should tell
    /// the user rather than retry.
    #[must_use]
    pub const fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// Errors scoped to a single legacy record during migration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    #[error("Migrating legacy key '{legacy_key}' failed: {reason}")]
    PartialFailure {
        legacy_key: String,
        reason: String,
    },
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level error type for kyrokv.
#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl KvError {
    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_transient(),
            Self::Store(StoreError::Unavailable(e)) => e.is_transient(),
            Self::Store(StoreError::TransactionAborted { .. }) => true,
            Self::Store(_) | Self::Serialization(_) | Self::Migration(_) | Self::Config(_) => false,
        }
    }
}

/// Result type alias for kyrokv operations.
pub type KvResult<T> = Result<T, KvError>;

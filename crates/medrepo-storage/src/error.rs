//! Storage error types for the resource repository.
//!
//! This module defines all error types that can occur during storage operations.

use std::fmt;

use medrepo_core::{CoreError, ShardId};
use medrepo_search::SearchError;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested resource (or version) was not found.
    #[error("Resource not found: {resource_type}/{id}")]
    NotFound {
        /// The type of resource that was not found.
        resource_type: String,
        /// The ID (or `id/_history/version`) that was not found.
        id: String,
    },

    /// The lineage's current version is a tombstone.
    #[error("Resource deleted: {resource_type}/{id}")]
    Gone {
        resource_type: String,
        id: String,
    },

    /// A version conflict occurred during an update operation.
    #[error("Version conflict on {resource_type}/{id}: expected {expected}, found {actual}")]
    VersionConflict {
        resource_type: String,
        id: String,
        /// The expected version ID.
        expected: u64,
        /// The actual version ID found.
        actual: u64,
    },

    /// The resource content or request is malformed.
    #[error("Validation error: {message}")]
    ValidationError {
        /// Description of why the resource is invalid.
        message: String,
    },

    /// No usable shard for the request.
    #[error("Shard unavailable{}: {message}", shard.as_ref().map(|s| format!(" ({s})")).unwrap_or_default())]
    ShardUnavailable {
        shard: Option<ShardId>,
        message: String,
    },

    /// The shard's schema migration failed; traffic is blocked until cleared.
    #[error("Migration failed on shard {shard} at version {version}: {reason}")]
    MigrationFailed {
        shard: ShardId,
        version: u32,
        reason: String,
    },

    /// An error occurred during a transaction.
    #[error("Transaction error: {message}")]
    TransactionError {
        /// Description of the transaction error.
        message: String,
    },

    /// Failed to connect to the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Creates a new `Gone` error.
    #[must_use]
    pub fn gone(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Gone {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Creates a new `VersionConflict` error.
    #[must_use]
    pub fn version_conflict(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        expected: u64,
        actual: u64,
    ) -> Self {
        Self::VersionConflict {
            resource_type: resource_type.into(),
            id: id.into(),
            expected,
            actual,
        }
    }

    /// Creates a new `ValidationError` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    /// Creates a new `ShardUnavailable` error.
    #[must_use]
    pub fn shard_unavailable(shard: Option<ShardId>, message: impl Into<String>) -> Self {
        Self::ShardUnavailable {
            shard,
            message: message.into(),
        }
    }

    /// Creates a new `MigrationFailed` error.
    #[must_use]
    pub fn migration_failed(shard: ShardId, version: u32, reason: impl Into<String>) -> Self {
        Self::MigrationFailed {
            shard,
            version,
            reason: reason.into(),
        }
    }

    /// Creates a new `TransactionError` error.
    #[must_use]
    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone { .. })
    }

    /// Returns `true` if this is a version conflict error.
    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    #[must_use]
    pub fn is_shard_unavailable(&self) -> bool {
        matches!(self, Self::ShardUnavailable { .. })
    }

    #[must_use]
    pub fn is_migration_failed(&self) -> bool {
        matches!(self, Self::MigrationFailed { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Gone { .. } => ErrorCategory::Gone,
            Self::VersionConflict { .. } => ErrorCategory::Conflict,
            Self::ValidationError { .. } => ErrorCategory::Validation,
            Self::ShardUnavailable { .. } | Self::MigrationFailed { .. } => {
                ErrorCategory::Unavailable
            }
            Self::TransactionError { .. } => ErrorCategory::Transaction,
            Self::ConnectionError { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

impl From<CoreError> for StorageError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::JsonError(e) => StorageError::internal(format!("JSON error: {e}")),
            other => StorageError::validation(other.to_string()),
        }
    }
}

impl From<SearchError> for StorageError {
    fn from(err: SearchError) -> Self {
        StorageError::validation(err.to_string())
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Resource not found.
    NotFound,
    /// Resource tombstoned.
    Gone,
    /// Version conflict.
    Conflict,
    /// Validation error.
    Validation,
    /// Shard not routable or blocked by migration state.
    Unavailable,
    /// Transaction-related error.
    Transaction,
    /// Infrastructure/connection error.
    Infrastructure,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Gone => write!(f, "gone"),
            Self::Conflict => write!(f, "conflict"),
            Self::Validation => write!(f, "validation"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Transaction => write!(f, "transaction"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found("Patient", "123");
        assert_eq!(err.to_string(), "Resource not found: Patient/123");

        let err = StorageError::version_conflict("Patient", "123", 1, 2);
        assert_eq!(
            err.to_string(),
            "Version conflict on Patient/123: expected 1, found 2"
        );

        let err = StorageError::gone("Patient", "456");
        assert_eq!(err.to_string(), "Resource deleted: Patient/456");
    }

    #[test]
    fn test_shard_unavailable_display() {
        let err = StorageError::shard_unavailable(Some(ShardId::global()), "not provisioned");
        assert_eq!(err.to_string(), "Shard unavailable (global): not provisioned");

        let err = StorageError::shard_unavailable(None, "unknown tenant acme");
        assert_eq!(err.to_string(), "Shard unavailable: unknown tenant acme");
    }

    #[test]
    fn test_error_predicates() {
        let err = StorageError::not_found("Patient", "123");
        assert!(err.is_not_found());
        assert!(!err.is_version_conflict());
        assert!(!err.is_gone());

        let err = StorageError::version_conflict("Patient", "1", 1, 2);
        assert!(!err.is_not_found());
        assert!(err.is_version_conflict());

        let err = StorageError::migration_failed(ShardId::global(), 3, "boom");
        assert!(err.is_migration_failed());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            StorageError::not_found("Patient", "123").category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            StorageError::version_conflict("Patient", "1", 1, 2).category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            StorageError::validation("bad data").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            StorageError::shard_unavailable(None, "x").category().to_string(),
            "unavailable"
        );
    }

    #[test]
    fn test_core_error_maps_to_validation() {
        let err: StorageError = CoreError::invalid_resource("status is required").into();
        assert!(matches!(err, StorageError::ValidationError { .. }));
    }
}

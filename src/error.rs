//! Error types for identity reconciliation.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! the specific failure (bad input, storage failure, overloaded runtime).

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors raised before any store access.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("At least one of email or phoneNumber is required")]
    MissingContactField,

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: &'static str,
        max_length: usize,
    },

    #[error("Invalid email address: {value}")]
    InvalidEmail {
        value: String,
    },

    #[error("Invalid phone number: {value}")]
    InvalidPhoneNumber {
        value: String,
    },
}

/// Execution errors raised by the resolver runtime.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Resolver queue is full (capacity: {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Resolver workers are disconnected")]
    Disconnected,

    #[error("Resolution timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Top-level error type for identity reconciliation.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl IdentityError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the caller may retry the same request.
    ///
    /// The resolver never retries on its own.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Storage(e) => matches!(e, StorageError::ConnectionError(_)),
            Self::Execution(e) => matches!(
                e,
                ExecutionError::QueueFull { .. } | ExecutionError::Timeout { .. }
            ),
        }
    }
}

/// Result type alias for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::ContactId;

    #[test]
    fn test_validation_error_missing_field() {
        let err = ValidationError::MissingContactField;
        let msg = format!("{err}");
        assert!(msg.contains("email"));
        assert!(msg.contains("phoneNumber"));
    }

    #[test]
    fn test_validation_error_too_long() {
        let err = ValidationError::FieldTooLong {
            field: "email",
            max_length: 320,
        };
        let msg = format!("{err}");
        assert!(msg.contains("email"));
        assert!(msg.contains("320"));
    }

    #[test]
    fn test_execution_error_timeout() {
        let err = ExecutionError::Timeout { duration_ms: 5000 };
        assert!(format!("{err}").contains("5000ms"));
    }

    #[test]
    fn test_identity_error_from_validation() {
        let err: IdentityError = ValidationError::MissingContactField.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_identity_error_from_storage() {
        let err: IdentityError = StorageError::ContactNotFound(ContactId::new(3)).into();
        assert!(err.is_storage());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Contact not found: 3"));

        let err: IdentityError = StorageError::ConnectionError("refused".to_string()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_identity_error_retryable() {
        let err: IdentityError = ExecutionError::QueueFull { capacity: 8 }.into();
        assert!(err.is_execution());
        assert!(err.is_retryable());

        let err: IdentityError = ExecutionError::Disconnected.into();
        assert!(!err.is_retryable());

        let err = IdentityError::internal("unexpected state");
        assert!(err.is_internal());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("unexpected state"));
    }
}

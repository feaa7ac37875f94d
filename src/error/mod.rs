//! Error types for cloudq.

use thiserror::Error;

/// Result type for cloudq operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cloudq.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage backend error.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Queue already exists.
    #[error("Queue already exists: {0}")]
    QueueAlreadyExists(String),

    /// Queue not found.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Queue still holds messages and deletion was not forced.
    #[error("Queue {queue} is not empty ({messages} messages)")]
    QueueNotEmpty {
        /// Queue name.
        queue: String,
        /// Messages still stored in the queue.
        messages: u64,
    },

    /// Queue is the dead-letter target of another queue.
    #[error("Queue {queue} is the dead-letter queue of {referenced_by}")]
    DeadLetterQueueInUse {
        /// Queue that was about to be deleted.
        queue: String,
        /// Queue that routes dead letters into it.
        referenced_by: String,
    },

    /// Queue or backend is at its configured message limit.
    #[error("Capacity exceeded for queue {queue} (limit: {limit} messages)")]
    CapacityExceeded {
        /// Queue name.
        queue: String,
        /// Limit that was hit.
        limit: usize,
    },

    /// Message not found.
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Another actor won the lease race for this message.
    #[error("Lease conflict on message {0}")]
    Conflict(String),

    /// The lease is no longer held by the presented consumer token.
    #[error("Consumer token does not hold the lease on message {0}")]
    TokenMismatch(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// How callers are expected to react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lease races and stale acks. Retry or ignore, never a hard failure.
    Transient,
    /// Capacity and configuration problems the caller can act on.
    Actionable,
    /// Backend or internal failures.
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Conflict(_) | Error::TokenMismatch(_) => ErrorClass::Transient,
            Error::Config(_)
            | Error::Validation(_)
            | Error::QueueAlreadyExists(_)
            | Error::QueueNotFound(_)
            | Error::QueueNotEmpty { .. }
            | Error::DeadLetterQueueInUse { .. }
            | Error::CapacityExceeded { .. }
            | Error::MessageNotFound(_) => ErrorClass::Actionable,
            Error::StorageError(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether the error is a lease race or a late ack.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Stable machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::StorageError(_) => "storage",
            Error::QueueAlreadyExists(_) => "queue_already_exists",
            Error::QueueNotFound(_) => "queue_not_found",
            Error::QueueNotEmpty { .. } => "queue_not_empty",
            Error::DeadLetterQueueInUse { .. } => "dead_letter_queue_in_use",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::MessageNotFound(_) => "message_not_found",
            Error::Conflict(_) => "conflict",
            Error::TokenMismatch(_) => "token_mismatch",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}

/// Validation error types.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid queue name.
    #[error("Invalid queue name: {0}")]
    InvalidQueueName(String),

    /// Message too large.
    #[error("Message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Invalid consumer token.
    #[error("Invalid consumer token: {0}")]
    InvalidConsumerToken(String),

    /// Invalid parameter.
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Reason for invalidity.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_errors_are_transient() {
        assert!(Error::Conflict("m1".to_string()).is_transient());
        assert!(Error::TokenMismatch("m1".to_string()).is_transient());
        assert!(!Error::QueueNotFound("q".to_string()).is_transient());
    }

    #[test]
    fn test_error_classes() {
        let capacity = Error::CapacityExceeded {
            queue: "orders".to_string(),
            limit: 10,
        };
        assert_eq!(capacity.class(), ErrorClass::Actionable);
        assert_eq!(capacity.code(), "capacity_exceeded");

        let storage = Error::StorageError("disk on fire".to_string());
        assert_eq!(storage.class(), ErrorClass::Internal);
    }

    #[test]
    fn test_validation_converts_into_error() {
        let err: Error = ValidationError::MessageTooLarge { size: 20, max: 10 }.into();
        assert_eq!(err.class(), ErrorClass::Actionable);
        assert!(err.to_string().contains("20 bytes"));
    }
}

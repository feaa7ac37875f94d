//! Validation functions for queue names, tokens and queue settings.

use crate::error::ValidationError;
use crate::Result;

/// Hard upper bound on any queue's message size (1 MB).
pub const MAX_MESSAGE_SIZE_LIMIT: usize = 1_048_576;

/// Longest visibility timeout a queue or lease extension may ask for (12 hours).
pub const MAX_VISIBILITY_TIMEOUT: u32 = 43_200;

/// Longest consumer token accepted.
pub const MAX_CONSUMER_TOKEN_LEN: usize = 256;

/// Queue name validation (1-80 chars, alphanumeric + - and _).
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 80 {
        return Err(ValidationError::InvalidQueueName(format!(
            "Queue name must be 1-80 characters, got {}",
            name.len()
        ))
        .into());
    }

    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '-' && ch != '_' {
            return Err(ValidationError::InvalidQueueName(format!(
                "Queue name contains invalid character: '{}'",
                ch
            ))
            .into());
        }
    }

    Ok(())
}

/// Consumer tokens are opaque but must be non-empty, printable and bounded.
pub fn validate_consumer_token(token: &str) -> Result<()> {
    if token.is_empty() || token.len() > MAX_CONSUMER_TOKEN_LEN {
        return Err(ValidationError::InvalidConsumerToken(format!(
            "Consumer token must be 1-{} characters, got {}",
            MAX_CONSUMER_TOKEN_LEN,
            token.len()
        ))
        .into());
    }

    if token.chars().any(|ch| ch.is_control()) {
        return Err(ValidationError::InvalidConsumerToken(
            "Consumer token contains control characters".to_string(),
        )
        .into());
    }

    Ok(())
}

/// Validate message size against the queue limit.
pub fn validate_message_size(size: usize, max_size: usize) -> Result<()> {
    if size > max_size {
        return Err(ValidationError::MessageTooLarge { size, max: max_size }.into());
    }
    Ok(())
}

/// A queue must allow at least one receive before dead-lettering.
pub fn validate_max_receives(max_receives: u32) -> Result<()> {
    if max_receives == 0 {
        return Err(invalid("max_receives", "must be at least 1"));
    }
    Ok(())
}

/// Visibility timeouts are 1 second to 12 hours.
pub fn validate_visibility_timeout(seconds: u32) -> Result<()> {
    if seconds == 0 || seconds > MAX_VISIBILITY_TIMEOUT {
        return Err(invalid(
            "visibility_timeout",
            &format!("must be 1-{} seconds, got {}", MAX_VISIBILITY_TIMEOUT, seconds),
        ));
    }
    Ok(())
}

/// Retention must be positive.
pub fn validate_retention_period(seconds: u32) -> Result<()> {
    if seconds == 0 {
        return Err(invalid("message_retention_period", "must be at least 1 second"));
    }
    Ok(())
}

/// Per-queue size limits must stay under the hard limit.
pub fn validate_max_message_size(size: usize) -> Result<()> {
    if size == 0 || size > MAX_MESSAGE_SIZE_LIMIT {
        return Err(invalid(
            "max_message_size",
            &format!("must be 1-{} bytes, got {}", MAX_MESSAGE_SIZE_LIMIT, size),
        ));
    }
    Ok(())
}

fn invalid(name: &str, reason: &str) -> crate::Error {
    ValidationError::InvalidParameter {
        name: name.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

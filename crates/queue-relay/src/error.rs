//! Error types for broker operations.
//!
//! Every broker call returns a [`BrokerError`] whose [`ErrorKind`] is decided
//! once, at the broker boundary. Callers route on the kind (retry, surface, or
//! stop) instead of inspecting individual variants.

use crate::message::Timestamp;
use std::time::Duration;
use thiserror::Error;

/// Classification of a broker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeouts, throttling, transient network or service failures. Retry with backoff.
    Transient,
    /// Auth failures, bad requests, missing entities, lost locks. Never retried.
    Permanent,
    /// The operation was cancelled before it could complete.
    Cancelled,
}

/// Comprehensive error type for all broker operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Messaging entity not found: {path}")]
    EntityNotFound { path: String },

    #[error("Lock token {lock_token} is invalid or the message lock has expired")]
    MessageLockLost { lock_token: String },

    #[error("No message with sequence number {sequence_number} is available")]
    MessageNotFound { sequence_number: u64 },

    /// The message exists but is active, not set aside with a defer
    #[error("Message with sequence number {sequence_number} is not deferred")]
    MessageNotDeferred { sequence_number: u64 },

    /// The deferred message is currently locked by another receive
    #[error("Deferred message with sequence number {sequence_number} is locked")]
    MessageLocked { sequence_number: u64 },

    #[error("Session '{session_id}' cannot be locked")]
    SessionCannotBeLocked { session_id: String },

    #[error("Session lock for '{session_id}' was lost at {lost_at}")]
    SessionLockLost {
        session_id: String,
        lost_at: Timestamp,
    },

    #[error("Entity {path} requires sessions; accept a session to receive from it")]
    SessionRequired { path: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Server busy: {message}")]
    ServerBusy { message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Service unavailable ({code}): {message}")]
    ServiceUnavailable { code: String, message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Permission denied for operation: {operation}")]
    PermissionDenied { operation: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Invalid argument '{argument}': {message}")]
    InvalidArgument { argument: String, message: String },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl BrokerError {
    /// Classify this error for routing decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EntityNotFound { .. } => ErrorKind::Permanent,
            Self::MessageLockLost { .. } => ErrorKind::Permanent,
            Self::MessageNotFound { .. } => ErrorKind::Permanent,
            Self::MessageNotDeferred { .. } => ErrorKind::Permanent,
            Self::MessageLocked { .. } => ErrorKind::Transient,
            Self::SessionCannotBeLocked { .. } => ErrorKind::Transient,
            Self::SessionLockLost { .. } => ErrorKind::Permanent,
            Self::SessionRequired { .. } => ErrorKind::Permanent,
            Self::Timeout { .. } => ErrorKind::Transient,
            Self::ServerBusy { .. } => ErrorKind::Transient,
            Self::ConnectionFailed { .. } => ErrorKind::Transient,
            Self::ServiceUnavailable { .. } => ErrorKind::Transient,
            Self::AuthenticationFailed { .. } => ErrorKind::Permanent,
            Self::PermissionDenied { .. } => ErrorKind::Permanent,
            Self::MessageTooLarge { .. } => ErrorKind::Permanent,
            Self::InvalidArgument { .. } => ErrorKind::Permanent,
            Self::Serialization { .. } => ErrorKind::Permanent,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Validation(_) => ErrorKind::Permanent,
        }
    }

    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ServerBusy { .. } => Some(Duration::from_secs(10)),
            Self::SessionCannotBeLocked { .. } => Some(Duration::from_secs(5)),
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(5)),
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::MessageLocked { .. } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

/// Validation errors for identifiers and message fields
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

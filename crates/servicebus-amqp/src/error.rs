//! Error types for link, claim and management operations.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Comprehensive error type for all link layer operations
#[derive(Debug, Error)]
pub enum ServiceBusError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Operation deadline exceeded")]
    DeadlineExceeded,

    #[error("Retryable failure: {message}")]
    Retryable { message: String },

    #[error("Claim negotiation for '{audience}' failed: {status_code} - {description}")]
    ClaimRejected {
        audience: String,
        status_code: i32,
        description: String,
    },

    #[error("Malformed claims response: {message}")]
    MalformedClaimsResponse { message: String },

    #[error("Management operation failed: {code} - {description}")]
    Rpc { code: i32, description: String },

    #[error("Missing field '{field}' in response")]
    MissingField { field: String },

    #[error("Field '{field}' has incorrect type: expected {expected}, found {actual}")]
    IncorrectType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    #[error("No messages available")]
    NoMessages,

    #[error("Unsupported bulk disposition status '{status}'")]
    UnsupportedDispositionStatus { status: String },

    #[error("Lock token on the message is not set")]
    LockTokenMissing,

    #[error("Link to '{entity_path}' is closed")]
    LinkClosed { entity_path: String },

    #[error("Link to '{entity_path}' failed and must be recovered: {reason}")]
    LinkFailed { entity_path: String, reason: String },

    #[error("Receiver for '{entity_path}' is already listening")]
    AlreadyListening { entity_path: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl ServiceBusError {
    /// Check if the retry helper should attempt the operation again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Retryable { .. } => true,
            Self::ClaimRejected { status_code, .. } => *status_code >= 500,
            Self::Rpc { code, .. } => *code >= 500,
            _ => false,
        }
    }

    /// Mark a failure as transient
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    pub(crate) fn incorrect_type(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::IncorrectType {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub(crate) fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}

/// Failures reported by the underlying AMQP transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection closed: {message}")]
    ConnectionClosed { message: String },

    #[error("Session closed: {message}")]
    SessionClosed { message: String },

    #[error("Link detached: {message}")]
    LinkDetached { message: String },

    #[error("AMQP error {condition}: {description}")]
    Amqp {
        condition: String,
        description: String,
    },

    #[error("I/O error: {message}")]
    Io { message: String },
}

/// Errors while marshaling or unmarshaling messages
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message encoding failed: {message}")]
    Encode { message: String },

    #[error("Message decoding failed: {message}")]
    Decode { message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Per lock token failures from a bulk disposition pass
#[derive(Debug, Default)]
pub struct BatchDispositionErrors {
    errors: HashMap<Uuid, ServiceBusError>,
}

impl BatchDispositionErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, lock_token: Uuid, error: ServiceBusError) {
        self.errors.insert(lock_token, error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Get the failure recorded for a lock token
    pub fn get(&self, lock_token: &Uuid) -> Option<&ServiceBusError> {
        self.errors.get(lock_token)
    }

    pub fn lock_tokens(&self) -> impl Iterator<Item = &Uuid> {
        self.errors.keys()
    }

    pub fn into_inner(self) -> HashMap<Uuid, ServiceBusError> {
        self.errors
    }
}

impl fmt::Display for BatchDispositionErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lock token(s) failed disposition", self.errors.len())?;
        for (token, error) in &self.errors {
            write!(f, "; {}: {}", token, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchDispositionErrors {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

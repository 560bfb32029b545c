//! Error types for transport operations.

use std::time::Duration;
use thiserror::Error;

/// How the runtime reacts to a [`TransportError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Infrastructure hiccup; retried by the owning loop under backoff.
    Transient,
    /// A single row could not be decoded; it is replaced, never retried.
    Deserialization,
    /// Reported by the dispatch pipeline; routed through the dead-letter policy.
    Handler,
    /// Configuration or schema problem; must stop startup.
    Fatal,
    /// Lease or visibility timeout lost on a lease-style broker.
    Lease,
}

/// Comprehensive error type for all transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Lock contention on {resource}: {message}")]
    LockContention { resource: String, message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Queue storage for '{table}' does not exist and auto-provisioning is disabled")]
    SchemaMissing { table: String },

    #[error("Invalid endpoint URI '{uri}': {message}")]
    InvalidUri { uri: String, message: String },

    #[error("Incompatible storage: {message}")]
    IncompatibleStorage { message: String },

    #[error("No physical store is registered for tenant '{tenant_id}'")]
    UnknownTenant { tenant_id: String },

    #[error("Handler for '{message_type}' failed: {message}")]
    HandlerFailed {
        message_type: String,
        message: String,
    },

    #[error("Lease lost for message {message_id}: {message}")]
    LeaseLost { message_id: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl TransportError {
    /// Classify the error for the propagation policy
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ConnectionFailed { .. } => ErrorClass::Transient,
            Self::LockContention { .. } => ErrorClass::Transient,
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::ProviderError { .. } => ErrorClass::Transient, // Provider-specific errors are usually transient
            Self::Cancelled => ErrorClass::Transient,
            Self::SchemaMissing { .. } => ErrorClass::Fatal,
            Self::InvalidUri { .. } => ErrorClass::Fatal,
            Self::IncompatibleStorage { .. } => ErrorClass::Fatal,
            Self::UnknownTenant { .. } => ErrorClass::Fatal,
            Self::ConfigurationError(_) => ErrorClass::Fatal,
            Self::ValidationError(_) => ErrorClass::Fatal,
            Self::HandlerFailed { .. } => ErrorClass::Handler,
            Self::LeaseLost { .. } => ErrorClass::Lease,
            Self::SerializationError(_) => ErrorClass::Deserialization,
        }
    }

    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if error must prevent startup
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::LockContention { .. } => Some(Duration::from_millis(100)),
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }

    /// Convenience constructor for invalid URI errors
    pub fn invalid_uri(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            message: message.into(),
        }
    }
}

/// Errors during envelope serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Envelope body is empty")]
    EmptyBody,

    #[error("Envelope header '{key}' has invalid value")]
    InvalidHeader { key: String },
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

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

//! Error types for the remote execution engine.
//!
//! The variants follow the fault taxonomy of the protocol: protocol errors drop
//! a message, dispatch faults (resolution, construction, invocation, coercion)
//! empty the response, and channel faults end a single connection.

use std::time::Duration;
use thiserror::Error;

use crate::handle::ObjectHandle;

/// Main error type for remex.
#[derive(Debug, Error)]
pub enum RemexError {
    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Dispatch faults
    #[error("Type could not be resolved: {descriptor}")]
    TypeResolution { descriptor: String },

    #[error("Member {member}({signature}) not found on {type_name}")]
    MemberNotFound {
        type_name: String,
        member: String,
        signature: String,
    },

    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectHandle),

    #[error("Failed to construct {type_name}: {message}")]
    Construction { type_name: String, message: String },

    #[error("Invocation of {member} failed: {message}")]
    Invocation { member: String, message: String },

    #[error("Cannot coerce value to {descriptor}: {message}")]
    Coercion { descriptor: String, message: String },

    // Channel faults
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection to {endpoint} lost")]
    ConnectionLost { endpoint: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Remote call produced no value")]
    EmptyResponse,
}

/// Result type alias for remex operations.
pub type Result<T> = std::result::Result<T, RemexError>;

impl From<std::io::Error> for RemexError {
    fn from(err: std::io::Error) -> Self {
        RemexError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RemexError {
    fn from(err: serde_json::Error) -> Self {
        RemexError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RemexError {
    /// Create a coercion error for a target descriptor.
    pub fn coercion(descriptor: impl std::fmt::Display, message: impl Into<String>) -> Self {
        RemexError::Coercion {
            descriptor: descriptor.to_string(),
            message: message.into(),
        }
    }

    /// Create an invocation fault for a member.
    pub fn invocation(member: impl Into<String>, message: impl Into<String>) -> Self {
        RemexError::Invocation {
            member: member.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the channel itself is unusable.
    ///
    /// Channel faults terminate the connection's processing loop; every other
    /// error is confined to the command that raised it.
    pub fn is_channel_fault(&self) -> bool {
        matches!(
            self,
            RemexError::Io { .. }
                | RemexError::ConnectionLost { .. }
                | RemexError::Timeout(_)
                | RemexError::Cancelled
                | RemexError::Validation { .. }
        )
    }

    /// Whether this error was raised while dispatching a well-formed command.
    pub fn is_dispatch_fault(&self) -> bool {
        matches!(
            self,
            RemexError::TypeResolution { .. }
                | RemexError::MemberNotFound { .. }
                | RemexError::ObjectNotFound(_)
                | RemexError::Construction { .. }
                | RemexError::Invocation { .. }
                | RemexError::Coercion { .. }
        )
    }
}

//! Error types for hubshare.
//!
//! Transport and RPC failures always travel back to the caller through a
//! `Result`; stale shared records are never errors (they read as "no data").
//! The only hard invariant violation is an owner-only operation invoked by a
//! process that does not own the connection.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for hubshare.
#[derive(Debug, Error)]
pub enum HubShareError {
    // Ownership errors
    #[error("Operation {operation} is only available on the connection owner")]
    NotOwner { operation: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Connection start failed: {message}")]
    StartFailed { message: String },

    /// A failure relayed by the owner process; displays the owner's message verbatim.
    #[error("{message}")]
    Remote { message: String },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Unknown channel: {channel}")]
    UnknownChannel { channel: String },

    #[error("Unknown method {method} on channel {channel}")]
    UnknownMethod { channel: String, method: String },

    #[error("Invocation {correlation_id} was dropped before a response arrived")]
    InvocationDropped { correlation_id: String },

    // Shared store errors
    #[error("Store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Gave up updating {key} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { key: String, attempts: u32 },

    // Lock errors
    #[error("Lock {name} failed: {message}")]
    Lock { name: String, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

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

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for hubshare operations.
pub type Result<T> = std::result::Result<T, HubShareError>;

impl From<std::io::Error> for HubShareError {
    fn from(err: std::io::Error) -> Self {
        HubShareError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for HubShareError {
    fn from(err: serde_json::Error) -> Self {
        HubShareError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for HubShareError {
    fn from(err: rusqlite::Error) -> Self {
        HubShareError::Store {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl HubShareError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        HubShareError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Error for a poisoned in-process mutex guarding `name`.
    pub(crate) fn poisoned(name: &str) -> Self {
        HubShareError::Lock {
            name: name.to_string(),
            message: "in-process mutex poisoned".to_string(),
        }
    }

    /// Message carried by a failure response so followers surface the same error.
    ///
    /// Relayed errors are re-published unchanged, so a chain of relays never
    /// accumulates prefixes.
    pub fn relay_message(&self) -> String {
        match self {
            HubShareError::Remote { message } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Check if this error is worth retrying once the connection recovers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HubShareError::Transport { .. }
                | HubShareError::NotConnected
                | HubShareError::StartFailed { .. }
                | HubShareError::ConflictRetriesExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HubShareError::NotOwner {
            operation: "update_state".into(),
        };
        assert_eq!(
            err.to_string(),
            "Operation update_state is only available on the connection owner"
        );
    }

    #[test]
    fn test_remote_error_displays_owner_message() {
        let owner_side = HubShareError::Transport {
            message: "socket closed".into(),
        };
        let relayed = HubShareError::Remote {
            message: owner_side.relay_message(),
        };
        assert_eq!(relayed.to_string(), owner_side.to_string());
        assert_eq!(relayed.relay_message(), owner_side.to_string());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(HubShareError::NotConnected.is_retryable());
        assert!(!HubShareError::UnknownChannel {
            channel: "echo".into()
        }
        .is_retryable());
    }
}

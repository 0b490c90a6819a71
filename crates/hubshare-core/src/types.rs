//! Shared value types: process identity, connection state and lifecycle events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Positional arguments of a remote call or pushed notification, forwarded verbatim.
pub type Args = Vec<serde_json::Value>;

/// Stable identifier of one participating process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of the real duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Starting,
    Received,
    ConnectionSlow,
    Reconnecting,
    Reconnected,
    Disconnected,
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
}

/// Lifecycle events observable in every process, owner or follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        new: ConnectionState,
        old: ConnectionState,
    },
    Connected,
    Starting,
    Received,
    ConnectionSlow,
    Reconnecting,
    Reconnected,
    Disconnected,
}

//! Starting, stopping and observing the shared connection.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::ConnectionEvent;
use crate::SharedConnection;

impl SharedConnection {
    /// Join the shared connection.
    ///
    /// The first call decides whether this process owns the real transport.
    /// The owner connects and resolves with its own start outcome; a follower
    /// resolves with the outcome the owner replicates. Calling again on the
    /// owner restarts the connection; concurrent calls share one attempt.
    pub async fn start(&self, options: Option<Value>) -> Result<()> {
        self.inner.start(options).await
    }

    /// Lifecycle events of the real connection, observable in every process.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.subscribe()
    }

    /// Release the connection as if this process terminated.
    ///
    /// Clears the replicated start result, stops the real connection and
    /// releases the election lock. Does nothing on followers.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

//! Transport interface.

use crate::error::Result;
use crate::types::{Args, ConnectionState, TransportEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Handler bound on the real connection for one pushed client method.
pub type ClientHandlerFn = Arc<dyn Fn(Args) + Send + Sync>;

/// A real duplex connection exposing named channels.
///
/// Each channel declares server methods callable through [`Transport::invoke`]
/// and accepts client handlers that the remote side pushes notifications to.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Connect. Resolves once connected or failed.
    async fn start(&self, options: Option<serde_json::Value>) -> Result<()>;

    /// Disconnect. Resolves once disconnected.
    async fn stop(&self);

    /// Invoke a server method on a channel.
    async fn invoke(&self, channel: &str, method: &str, args: Args) -> Result<serde_json::Value>;

    fn state(&self) -> ConnectionState;

    /// Identity assigned by the remote side while connected.
    fn connection_id(&self) -> Option<String>;

    /// Server methods declared for `channel`, or `None` if the channel is unknown.
    fn server_methods(&self, channel: &str) -> Option<Vec<String>>;

    /// Bind a client handler. Replaces any handler already bound for the method.
    fn bind_client(&self, channel: &str, method: &str, handler: ClientHandlerFn);

    /// Subscribe to lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

//! Publish/subscribe over the shared store.
//!
//! Every published event is dispatched to local handlers immediately and
//! written as an envelope to a single bus record. Other processes observe the
//! write through the store's change feed, which preserves publish order, and
//! dispatch it to their own handlers. A process ignores envelopes it wrote.

use crate::error::{HubShareError, Result};
use crate::store::{ChangeFeed, SharedStore};
use crate::types::{Args, ProcessId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Event names used for coordination.
pub struct BusEvents;

impl BusEvents {
    pub const CONNECTION_STARTED: &'static str = "connection.started";
    pub const STATE_CHANGED: &'static str = "connection.state_changed";
    pub const STARTING: &'static str = "connection.starting";
    pub const RECEIVED: &'static str = "connection.received";
    pub const CONNECTION_SLOW: &'static str = "connection.slow";
    pub const RECONNECTING: &'static str = "connection.reconnecting";
    pub const RECONNECTED: &'static str = "connection.reconnected";
    pub const DISCONNECTED: &'static str = "connection.disconnected";
    pub const RPC_INVOKE: &'static str = "rpc.invoke";
    pub const RPC_RESPONSE: &'static str = "rpc.response";
    pub const CLIENT_INVOKE: &'static str = "client.invoke";
}

/// Handler for one bus event; receives the published arguments.
pub type BusHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: String,
    origin: ProcessId,
    event: String,
    args: Args,
}

pub struct EventBus {
    store: Arc<dyn SharedStore>,
    key: String,
    origin: ProcessId,
    handlers: Mutex<HashMap<String, Vec<BusHandler>>>,
    seq: AtomicU64,
}

impl EventBus {
    /// Create a bus on `key` and start listening for other processes' events.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn SharedStore>, key: impl Into<String>, origin: ProcessId) -> Arc<Self> {
        let changes = store.watch();
        let bus = Arc::new(Self {
            store,
            key: key.into(),
            origin,
            handlers: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        });
        tokio::spawn(Self::listen(Arc::downgrade(&bus), changes));
        bus
    }

    async fn listen(bus: Weak<Self>, mut changes: ChangeFeed) {
        while let Some(change) = changes.recv().await {
            let Some(bus) = bus.upgrade() else {
                break;
            };
            if change.key != bus.key {
                continue;
            }
            let Some(raw) = change.value else {
                continue;
            };
            match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) if envelope.origin == bus.origin => {}
                Ok(envelope) => bus.dispatch(&envelope.event, &envelope.args),
                Err(e) => warn!("Discarding malformed bus envelope: {}", e),
            }
        }
        debug!("Event bus listener stopped");
    }

    /// Register a handler for `event`.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers
                .entry(event.to_string())
                .or_default()
                .push(Arc::new(handler));
        }
    }

    /// Publish to every process, this one included.
    pub fn publish(&self, event: &str, args: Args) -> Result<()> {
        self.dispatch(event, &args);

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            id: format!("{}#{}", self.origin, seq),
            origin: self.origin.clone(),
            event: event.to_string(),
            args,
        };
        let raw = serde_json::to_string(&envelope)?;
        self.store.set(&self.key, &raw).map_err(|e| {
            warn!("Failed to publish {} on the event bus: {}", event, e);
            e
        })
    }

    pub fn origin(&self) -> &ProcessId {
        &self.origin
    }

    // Handlers run without the map lock so they may register or publish.
    fn dispatch(&self, event: &str, args: &[Value]) {
        let handlers: Vec<BusHandler> = match self.handlers.lock() {
            Ok(handlers) => handlers.get(event).cloned().unwrap_or_default(),
            Err(_) => {
                warn!("{}", HubShareError::poisoned("event bus"));
                return;
            }
        };
        for handler in handlers {
            handler(args);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn recorder(bus: &EventBus, event: &str) -> mpsc::UnboundedReceiver<Vec<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.on(event, move |args| {
            let _ = tx.send(args.to_vec());
        });
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Vec<Value>>) -> Vec<Value> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_dispatches_locally_and_remotely_once() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let a = EventBus::new(store.clone(), "bus", ProcessId::new("a"));
        let b = EventBus::new(store.clone(), "bus", ProcessId::new("b"));
        let mut at_a = recorder(&a, "ping");
        let mut at_b = recorder(&b, "ping");

        a.publish("ping", vec![json!(1)]).unwrap();

        assert_eq!(next(&mut at_a).await, vec![json!(1)]);
        assert_eq!(next(&mut at_b).await, vec![json!(1)]);

        // The publisher must not see its own envelope a second time.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(at_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_events_arrive_in_publish_order() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let a = EventBus::new(store.clone(), "bus", ProcessId::new("a"));
        let b = EventBus::new(store.clone(), "bus", ProcessId::new("b"));
        let mut at_b = recorder(&b, "seq");

        for n in 0..20 {
            a.publish("seq", vec![json!(n)]).unwrap();
        }
        for n in 0..20 {
            assert_eq!(next(&mut at_b).await, vec![json!(n)]);
        }
    }

    #[tokio::test]
    async fn test_unrelated_keys_and_events_are_ignored() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let b = EventBus::new(store.clone(), "bus", ProcessId::new("b"));
        let a = EventBus::new(store.clone(), "bus", ProcessId::new("a"));
        let mut at_b = recorder(&b, "wanted");

        store.set("other", "not an envelope").unwrap();
        store.set("bus", "not an envelope").unwrap();
        a.publish("unwanted", vec![]).unwrap();
        a.publish("wanted", vec![json!("ok")]).unwrap();

        assert_eq!(next(&mut at_b).await, vec![json!("ok")]);
    }
}

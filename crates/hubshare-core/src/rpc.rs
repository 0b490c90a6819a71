//! Remote method calls routed through the connection owner.
//!
//! The owner calls the real connection directly. A follower publishes an
//! invocation carrying a fresh correlation id and waits for the owner's
//! matching response. Invocation payload: `[channel, method, id, args...]`.
//! Response payload: `[id, true, result]` or `[id, false, message]`.

use crate::bus::{BusEvents, EventBus};
use crate::error::{HubShareError, Result};
use crate::resilience::ResilientConnection;
use crate::role::{Role, RoleCell};
use crate::types::Args;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type PendingMap = HashMap<String, oneshot::Sender<Result<Value>>>;

struct PendingEntry<'a> {
    pending: &'a Mutex<PendingMap>,
    id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

pub struct RpcMultiplexer {
    bus: Arc<EventBus>,
    role: Arc<RoleCell>,
    connection: Arc<ResilientConnection>,
    pending: Mutex<PendingMap>,
}

impl RpcMultiplexer {
    pub fn new(
        bus: Arc<EventBus>,
        role: Arc<RoleCell>,
        connection: Arc<ResilientConnection>,
    ) -> Arc<Self> {
        let rpc = Arc::new(Self {
            bus,
            role,
            connection,
            pending: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&rpc);
        rpc.bus.on(BusEvents::RPC_INVOKE, move |args| {
            if let Some(rpc) = weak.upgrade() {
                rpc.on_invoke(args);
            }
        });
        let weak: Weak<Self> = Arc::downgrade(&rpc);
        rpc.bus.on(BusEvents::RPC_RESPONSE, move |args| {
            if let Some(rpc) = weak.upgrade() {
                rpc.on_response(args);
            }
        });
        rpc
    }

    /// Invoke a server method, waiting for the election outcome if necessary.
    pub async fn invoke(&self, channel: &str, method: &str, args: Args) -> Result<Value> {
        match self.role.decided().await {
            Role::Owner => self.connection.call(channel, method, args).await,
            Role::Follower => self.invoke_remote(channel, method, args).await,
            Role::Undecided => Err(HubShareError::Other(
                "process role was never decided".to_string(),
            )),
        }
    }

    /// Number of invocations awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    async fn invoke_remote(&self, channel: &str, method: &str, args: Args) -> Result<Value> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| HubShareError::poisoned("pending invocations"))?
            .insert(id.clone(), tx);
        // Removes the entry however this call ends, the caller dropping it included.
        let _pending = PendingEntry {
            pending: &self.pending,
            id: id.clone(),
        };

        let mut payload = Vec::with_capacity(args.len() + 3);
        payload.push(Value::String(channel.to_string()));
        payload.push(Value::String(method.to_string()));
        payload.push(Value::String(id.clone()));
        payload.extend(args);

        self.bus.publish(BusEvents::RPC_INVOKE, payload)?;
        debug!("Forwarded {}.{} to the owner as {}", channel, method, id);

        rx.await
            .map_err(|_| HubShareError::InvocationDropped { correlation_id: id })?
    }

    // Any channel the real connection declares is served, registered here or not.
    fn on_invoke(self: &Arc<Self>, payload: &[Value]) {
        // Only the owner answers. A request can race the owner's own decision
        // by an instant, so one that lands mid-election waits for the outcome.
        let owner_now = self.role.is_owner();
        if !owner_now && !self.role.is_electing() {
            return;
        }
        let (Some(channel), Some(method), Some(id)) = (
            payload.first().and_then(Value::as_str),
            payload.get(1).and_then(Value::as_str),
            payload.get(2).and_then(Value::as_str),
        ) else {
            warn!("Discarding malformed invocation event");
            return;
        };
        let channel = channel.to_string();
        let method = method.to_string();
        let id = id.to_string();
        let args: Args = payload[3..].to_vec();

        let this = self.clone();
        tokio::spawn(async move {
            if !owner_now && this.role.decided().await != Role::Owner {
                return;
            }
            let response = match this.connection.call(&channel, &method, args).await {
                Ok(result) => vec![Value::String(id.clone()), Value::Bool(true), result],
                Err(e) => {
                    debug!("Invocation {} of {}.{} failed: {}", id, channel, method, e);
                    vec![
                        Value::String(id.clone()),
                        Value::Bool(false),
                        Value::String(e.relay_message()),
                    ]
                }
            };
            if let Err(e) = this.bus.publish(BusEvents::RPC_RESPONSE, response) {
                warn!("Failed to publish response for {}: {}", id, e);
            }
        });
    }

    fn on_response(&self, payload: &[Value]) {
        if self.role.get() == Role::Owner {
            return;
        }
        let (Some(id), Some(success)) = (
            payload.first().and_then(Value::as_str),
            payload.get(1).and_then(Value::as_bool),
        ) else {
            warn!("Discarding malformed response event");
            return;
        };
        let waiter = match self.pending.lock() {
            Ok(mut pending) => pending.remove(id),
            Err(_) => None,
        };
        let Some(waiter) = waiter else {
            debug!("Ignoring response for unknown invocation {}", id);
            return;
        };

        let value = payload.get(2).cloned().unwrap_or(Value::Null);
        let outcome = if success {
            Ok(value)
        } else {
            Err(HubShareError::Remote {
                message: value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string()),
            })
        };
        let _ = waiter.send(outcome);
    }
}

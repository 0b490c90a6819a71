//! Delivery of pushed notifications to every interested process.
//!
//! The owner's bound client methods run the local handler, then republish
//! `[channel, method, args...]` to all processes. Other processes invoke a
//! handler only when they hold a proxy for that channel with a real handler
//! for that method.

use crate::bus::{BusEvents, EventBus};
use crate::proxy::ProxyRegistry;
use crate::role::{Role, RoleCell};
use crate::transport::ClientHandlerFn;
use crate::types::Args;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub struct NotificationFanout {
    bus: Arc<EventBus>,
    role: Arc<RoleCell>,
    proxies: Arc<ProxyRegistry>,
}

impl NotificationFanout {
    pub fn new(bus: Arc<EventBus>, role: Arc<RoleCell>, proxies: Arc<ProxyRegistry>) -> Arc<Self> {
        let fanout = Arc::new(Self {
            bus,
            role,
            proxies,
        });
        let weak: Weak<Self> = Arc::downgrade(&fanout);
        fanout.bus.on(BusEvents::CLIENT_INVOKE, move |payload| {
            if let Some(fanout) = weak.upgrade() {
                fanout.on_republished(payload);
            }
        });
        fanout
    }

    /// Handler to bind on the real connection for `channel.method`.
    pub fn owner_wrapper(self: &Arc<Self>, channel: &str, method: &str) -> ClientHandlerFn {
        let fanout = Arc::downgrade(self);
        let channel = channel.to_string();
        let method = method.to_string();
        Arc::new(move |args: Args| {
            let Some(fanout) = fanout.upgrade() else {
                return;
            };
            fanout.dispatch_local(&channel, &method, &args);

            let mut payload = Vec::with_capacity(args.len() + 2);
            payload.push(Value::String(channel.clone()));
            payload.push(Value::String(method.clone()));
            payload.extend(args);
            if let Err(e) = fanout.bus.publish(BusEvents::CLIENT_INVOKE, payload) {
                warn!("Failed to republish {}.{}: {}", channel, method, e);
            }
        })
    }

    /// Run the local real handler for `channel.method`. Returns whether one ran.
    pub fn dispatch_local(&self, channel: &str, method: &str, args: &[Value]) -> bool {
        let handler = self
            .proxies
            .get(channel)
            .and_then(|proxy| proxy.client_handler(method));
        match handler {
            Some(handler) => {
                handler(args);
                true
            }
            None => false,
        }
    }

    // The owner already dispatched before republishing.
    fn on_republished(&self, payload: &[Value]) {
        if self.role.get() == Role::Owner {
            return;
        }
        let (Some(channel), Some(method)) = (
            payload.first().and_then(Value::as_str),
            payload.get(1).and_then(Value::as_str),
        ) else {
            warn!("Discarding malformed notification event");
            return;
        };
        if !self.dispatch_local(channel, method, &payload[2..]) {
            debug!("No local handler for {}.{}, dropping", channel, method);
        }
    }
}

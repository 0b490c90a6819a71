//! Per-channel proxies: callable server stubs and client handler slots.
//!
//! A process holds at most one [`ChannelProxy`] per channel name. Registering
//! the same name again merges the new handlers into the existing proxy.

use crate::error::{HubShareError, Result};
use crate::rpc::RpcMultiplexer;
use crate::types::Args;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Handler for a pushed client notification.
pub type ClientHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// A client method's handler, or a placeholder for a method needed elsewhere.
#[derive(Clone)]
pub enum HandlerSlot {
    Placeholder,
    Handler(ClientHandler),
}

impl HandlerSlot {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, HandlerSlot::Placeholder)
    }
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerSlot::Placeholder => f.write_str("Placeholder"),
            HandlerSlot::Handler(_) => f.write_str("Handler"),
        }
    }
}

/// Client handlers supplied when registering a channel.
///
/// ```rust,ignore
/// let config = ChannelConfig::new().on("displayMsg", |args| println!("{:?}", args));
/// let echo = connection.channel_proxy("echo", config)?;
/// ```
#[derive(Clone, Default)]
pub struct ChannelConfig {
    handlers: BTreeMap<String, ClientHandler>,
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle pushes of `method`.
    pub fn on<F>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.handlers.insert(method.to_string(), Arc::new(handler));
        self
    }

    pub fn methods(&self) -> impl Iterator<Item = &String> {
        self.handlers.keys()
    }

    pub(crate) fn handlers(&self) -> &BTreeMap<String, ClientHandler> {
        &self.handlers
    }
}

/// Merge supplied handlers into an existing handler map.
///
/// An existing real handler always wins. Otherwise a supplied handler fills
/// the slot. Methods declared only by other processes get a placeholder.
pub fn merge_handlers(
    existing: &BTreeMap<String, HandlerSlot>,
    supplied: &BTreeMap<String, ClientHandler>,
    declared_elsewhere: &BTreeSet<String>,
) -> BTreeMap<String, HandlerSlot> {
    let mut merged = existing.clone();
    for (method, handler) in supplied {
        let keep_existing = matches!(merged.get(method), Some(HandlerSlot::Handler(_)));
        if !keep_existing {
            merged.insert(method.clone(), HandlerSlot::Handler(handler.clone()));
        }
    }
    for method in declared_elsewhere {
        merged
            .entry(method.clone())
            .or_insert(HandlerSlot::Placeholder);
    }
    merged
}

/// Callable server methods of one channel.
pub struct ServerStub {
    channel: String,
    methods: BTreeSet<String>,
    rpc: Arc<RpcMultiplexer>,
}

impl ServerStub {
    /// Invoke a declared server method.
    pub async fn invoke(&self, method: &str, args: Args) -> Result<Value> {
        if !self.methods.contains(method) {
            return Err(HubShareError::UnknownMethod {
                channel: self.channel.clone(),
                method: method.to_string(),
            });
        }
        self.rpc.invoke(&self.channel, method, args).await
    }

    pub fn methods(&self) -> &BTreeSet<String> {
        &self.methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains(method)
    }
}

pub struct ChannelProxy {
    name: String,
    server: ServerStub,
    client: Mutex<BTreeMap<String, HandlerSlot>>,
    bound: Mutex<BTreeSet<String>>,
}

impl ChannelProxy {
    fn new(name: &str, server_methods: Vec<String>, rpc: Arc<RpcMultiplexer>) -> Self {
        Self {
            name: name.to_string(),
            server: ServerStub {
                channel: name.to_string(),
                methods: server_methods.into_iter().collect(),
                rpc,
            },
            client: Mutex::new(BTreeMap::new()),
            bound: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> &ServerStub {
        &self.server
    }

    /// Every client method with a slot, placeholders included.
    pub fn client_methods(&self) -> Vec<String> {
        self.client
            .lock()
            .map(|client| client.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The real handler for `method`, if one was supplied.
    pub fn client_handler(&self, method: &str) -> Option<ClientHandler> {
        match self.client.lock().ok()?.get(method)? {
            HandlerSlot::Handler(handler) => Some(handler.clone()),
            HandlerSlot::Placeholder => None,
        }
    }

    pub fn slot(&self, method: &str) -> Option<HandlerSlot> {
        self.client.lock().ok()?.get(method).cloned()
    }

    pub(crate) fn merge(
        &self,
        supplied: &BTreeMap<String, ClientHandler>,
        declared_elsewhere: &BTreeSet<String>,
    ) -> Result<()> {
        let mut client = self
            .client
            .lock()
            .map_err(|_| HubShareError::poisoned("channel proxy"))?;
        *client = merge_handlers(&client, supplied, declared_elsewhere);
        Ok(())
    }

    /// Install a placeholder if `method` has no slot. Returns whether one was added.
    pub(crate) fn install_placeholder(&self, method: &str) -> bool {
        match self.client.lock() {
            Ok(mut client) if !client.contains_key(method) => {
                client.insert(method.to_string(), HandlerSlot::Placeholder);
                true
            }
            _ => false,
        }
    }

    /// Tag `method` as bound on the real connection. Returns whether it was untagged.
    pub(crate) fn tag_bound(&self, method: &str) -> bool {
        self.bound
            .lock()
            .map(|mut bound| bound.insert(method.to_string()))
            .unwrap_or(false)
    }

    pub(crate) fn has_bindings(&self) -> bool {
        self.bound.lock().map(|b| !b.is_empty()).unwrap_or(false)
    }
}

/// The process's channel proxies by name.
pub struct ProxyRegistry {
    rpc: Arc<RpcMultiplexer>,
    proxies: Mutex<HashMap<String, Arc<ChannelProxy>>>,
}

impl ProxyRegistry {
    pub fn new(rpc: Arc<RpcMultiplexer>) -> Self {
        Self {
            rpc,
            proxies: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ChannelProxy>> {
        self.proxies.lock().ok()?.get(name).cloned()
    }

    /// Existing proxy for `name`, or a new one with no client slots.
    pub fn ensure(&self, name: &str, server_methods: Vec<String>) -> Result<Arc<ChannelProxy>> {
        let mut proxies = self
            .proxies
            .lock()
            .map_err(|_| HubShareError::poisoned("proxy registry"))?;
        let proxy = proxies
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ChannelProxy::new(name, server_methods, self.rpc.clone())));
        Ok(proxy.clone())
    }

    /// Create or extend the proxy for `name` with `config`'s handlers.
    pub fn register(
        &self,
        name: &str,
        server_methods: Vec<String>,
        config: &ChannelConfig,
        declared_elsewhere: &BTreeSet<String>,
    ) -> Result<Arc<ChannelProxy>> {
        let proxy = self.ensure(name, server_methods)?;
        proxy.merge(config.handlers(), declared_elsewhere)?;
        Ok(proxy)
    }
}

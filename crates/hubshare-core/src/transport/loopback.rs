//! In-process transport with programmable server methods.
//!
//! A channel's client handlers are subscribed when the connection starts.
//! Handlers bound while connected receive nothing until the next start, which
//! is the behavior reconciliation must cope with on a real service.

use super::traits::{ClientHandlerFn, Transport};
use crate::config::BusConfig;
use crate::error::{HubShareError, Result};
use crate::types::{Args, ConnectionState, TransportEvent};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Server method implementation. May push notifications through the handle.
pub type ServerMethodFn = Arc<dyn Fn(&LoopbackPush, Args) -> Result<Value> + Send + Sync>;

#[derive(Default)]
struct Link {
    state: ConnectionState,
    connection_id: Option<String>,
    subscribed: HashSet<String>,
}

struct LoopbackInner {
    server: Mutex<HashMap<String, HashMap<String, ServerMethodFn>>>,
    clients: Mutex<HashMap<String, HashMap<String, ClientHandlerFn>>>,
    link: Mutex<Link>,
    events: broadcast::Sender<TransportEvent>,
    connect_delay: Mutex<Duration>,
    fail_next_start: Mutex<Option<String>>,
    attempt: AtomicU64,
    start_count: AtomicUsize,
    invocations: Mutex<Vec<(String, String, Args)>>,
}

/// Programmable in-process duplex service.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

/// Handle given to server methods for pushing client notifications.
#[derive(Clone)]
pub struct LoopbackPush {
    inner: Arc<LoopbackInner>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| HubShareError::poisoned("loopback transport"))
}

impl LoopbackInner {
    fn set_state(&self, link: &mut Link, new: ConnectionState) {
        let old = link.state;
        if old == new {
            return;
        }
        link.state = new;
        let _ = self.events.send(TransportEvent::StateChanged { old, new });
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn push(&self, channel: &str, method: &str, args: Args) -> Result<bool> {
        {
            let link = lock(&self.link)?;
            if link.state != ConnectionState::Connected || !link.subscribed.contains(channel) {
                debug!("Loopback push {}.{} not delivered: channel not subscribed", channel, method);
                return Ok(false);
            }
        }
        let handler = lock(&self.clients)?
            .get(channel)
            .and_then(|methods| methods.get(method))
            .cloned();
        let Some(handler) = handler else {
            return Ok(false);
        };
        self.emit(TransportEvent::Received);
        handler(args);
        Ok(true)
    }
}

impl LoopbackPush {
    /// Push a notification to the bound client handler.
    ///
    /// Returns whether a subscribed handler received it.
    pub fn push(&self, channel: &str, method: &str, args: Args) -> Result<bool> {
        self.inner.push(channel, method, args)
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BusConfig::CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(LoopbackInner {
                server: Mutex::new(HashMap::new()),
                clients: Mutex::new(HashMap::new()),
                link: Mutex::new(Link::default()),
                events,
                connect_delay: Mutex::new(Duration::ZERO),
                fail_next_start: Mutex::new(None),
                attempt: AtomicU64::new(0),
                start_count: AtomicUsize::new(0),
                invocations: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Echo service: `echo.join()` returns `"joined"`, `echo.send(msg)` pushes
    /// `displayMsg(msg)` and returns `msg`.
    pub fn echo() -> Self {
        Self::new()
            .with_method("echo", "join", |_, _| Ok(Value::String("joined".into())))
            .with_method("echo", "send", |push, args| {
                let message = args.first().cloned().unwrap_or(Value::Null);
                push.push("echo", "displayMsg", vec![message.clone()])?;
                Ok(message)
            })
    }

    /// Declare a server method.
    pub fn with_method<F>(self, channel: &str, method: &str, f: F) -> Self
    where
        F: Fn(&LoopbackPush, Args) -> Result<Value> + Send + Sync + 'static,
    {
        if let Ok(mut server) = self.inner.server.lock() {
            server
                .entry(channel.to_string())
                .or_default()
                .insert(method.to_string(), Arc::new(f));
        }
        self
    }

    /// Delay between `starting` and `connected`.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.set_connect_delay(delay);
        self
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.inner.connect_delay.lock() {
            *current = delay;
        }
    }

    /// Make the next start attempt fail with `message`.
    pub fn fail_next_start(&self, message: impl Into<String>) {
        if let Ok(mut fail) = self.inner.fail_next_start.lock() {
            *fail = Some(message.into());
        }
    }

    /// Number of real connect attempts so far.
    pub fn start_count(&self) -> usize {
        self.inner.start_count.load(Ordering::SeqCst)
    }

    /// Server invocations received so far, in order.
    pub fn invocations(&self) -> Vec<(String, String, Args)> {
        self.inner
            .invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Channels whose client handlers were subscribed at the last start.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .inner
            .link
            .lock()
            .map(|link| link.subscribed.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Push a notification from the remote side.
    pub fn push(&self, channel: &str, method: &str, args: Args) -> Result<bool> {
        self.inner.push(channel, method, args)
    }

    /// Simulate a network interruption: connected becomes reconnecting.
    pub fn drop_connection(&self) -> Result<()> {
        let mut link = lock(&self.inner.link)?;
        if link.state == ConnectionState::Connected {
            self.inner.emit(TransportEvent::Reconnecting);
            self.inner.set_state(&mut link, ConnectionState::Reconnecting);
        }
        Ok(())
    }

    /// Recover from [`LoopbackTransport::drop_connection`].
    pub fn restore_connection(&self) -> Result<()> {
        let mut link = lock(&self.inner.link)?;
        if link.state == ConnectionState::Reconnecting {
            self.inner.emit(TransportEvent::Reconnected);
            self.inner.set_state(&mut link, ConnectionState::Connected);
        }
        Ok(())
    }

    /// Report a slow connection.
    pub fn signal_slow(&self) {
        self.inner.emit(TransportEvent::ConnectionSlow);
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn start(&self, _options: Option<Value>) -> Result<()> {
        let inner = &self.inner;
        inner.start_count.fetch_add(1, Ordering::SeqCst);
        let attempt = inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut link = lock(&inner.link)?;
            inner.emit(TransportEvent::Starting);
            inner.set_state(&mut link, ConnectionState::Connecting);
        }

        let delay = *lock(&inner.connect_delay)?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = lock(&inner.fail_next_start)?.take();
        let subscribed: HashSet<String> = lock(&inner.clients)?
            .iter()
            .filter(|(_, methods)| !methods.is_empty())
            .map(|(channel, _)| channel.clone())
            .collect();

        let mut link = lock(&inner.link)?;
        if inner.attempt.load(Ordering::SeqCst) != attempt {
            return Err(HubShareError::Transport {
                message: "connection stopped while starting".into(),
            });
        }
        if let Some(message) = failure {
            inner.set_state(&mut link, ConnectionState::Disconnected);
            inner.emit(TransportEvent::Disconnected);
            return Err(HubShareError::Transport { message });
        }
        link.subscribed = subscribed;
        link.connection_id = Some(uuid::Uuid::new_v4().to_string());
        inner.set_state(&mut link, ConnectionState::Connected);
        debug!(
            "Loopback connected as {:?} with channels {:?}",
            link.connection_id, link.subscribed
        );
        Ok(())
    }

    async fn stop(&self) {
        let inner = &self.inner;
        inner.attempt.fetch_add(1, Ordering::SeqCst);
        let Ok(mut link) = lock(&inner.link) else {
            return;
        };
        if link.state == ConnectionState::Disconnected {
            return;
        }
        link.connection_id = None;
        link.subscribed.clear();
        inner.set_state(&mut link, ConnectionState::Disconnected);
        inner.emit(TransportEvent::Disconnected);
    }

    async fn invoke(&self, channel: &str, method: &str, args: Args) -> Result<Value> {
        if self.state() != ConnectionState::Connected {
            return Err(HubShareError::NotConnected);
        }
        let f = {
            let server = lock(&self.inner.server)?;
            let methods = server
                .get(channel)
                .ok_or_else(|| HubShareError::UnknownChannel {
                    channel: channel.to_string(),
                })?;
            methods
                .get(method)
                .cloned()
                .ok_or_else(|| HubShareError::UnknownMethod {
                    channel: channel.to_string(),
                    method: method.to_string(),
                })?
        };
        lock(&self.inner.invocations)?.push((channel.to_string(), method.to_string(), args.clone()));
        let push = LoopbackPush {
            inner: self.inner.clone(),
        };
        f(&push, args)
    }

    fn state(&self) -> ConnectionState {
        self.inner
            .link
            .lock()
            .map(|link| link.state)
            .unwrap_or_default()
    }

    fn connection_id(&self) -> Option<String> {
        self.inner.link.lock().ok()?.connection_id.clone()
    }

    fn server_methods(&self, channel: &str) -> Option<Vec<String>> {
        let server = self.inner.server.lock().ok()?;
        let mut methods: Vec<String> = server.get(channel)?.keys().cloned().collect();
        methods.sort();
        Some(methods)
    }

    fn bind_client(&self, channel: &str, method: &str, handler: ClientHandlerFn) {
        if let Ok(mut clients) = self.inner.clients.lock() {
            clients
                .entry(channel.to_string())
                .or_default()
                .insert(method.to_string(), handler);
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}

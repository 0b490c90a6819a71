//! Restart-safe connection lifecycle with call buffering.
//!
//! Concurrent starts collapse onto one in-flight attempt. Starting a connection
//! that is already up first drives a clean stop. Calls made while not connected
//! are queued and replayed in submission order on the next transition to
//! connected.

use crate::error::{HubShareError, Result};
use crate::transport::Transport;
use crate::types::{Args, ConnectionState, TransportEvent};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Shared handle to a start attempt; every clone settles identically.
pub type StartFuture = Shared<BoxFuture<'static, std::result::Result<(), String>>>;

/// Drive `fut` on its own task and share its outcome.
pub(crate) fn spawn_shared<F>(fut: F) -> StartFuture
where
    F: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tx.send(fut.await);
    });
    async move {
        rx.await
            .unwrap_or_else(|_| Err("start attempt abandoned".to_string()))
    }
    .boxed()
    .shared()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Started,
}

struct BufferedCall {
    channel: String,
    method: String,
    args: Args,
    reply: oneshot::Sender<Result<Value>>,
}

struct Lifecycle {
    phase: Phase,
    in_flight: Option<StartFuture>,
    queue: VecDeque<BufferedCall>,
}

type ConnectedObserver = Arc<dyn Fn() + Send + Sync>;

pub struct ResilientConnection {
    transport: Arc<dyn Transport>,
    lifecycle: Mutex<Lifecycle>,
    connected_observers: Mutex<Vec<ConnectedObserver>>,
}

impl ResilientConnection {
    /// Wrap `transport`. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let events = transport.events();
        let connection = Arc::new(Self {
            transport,
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Idle,
                in_flight: None,
                queue: VecDeque::new(),
            }),
            connected_observers: Mutex::new(Vec::new()),
        });
        tokio::spawn(Self::watch(Arc::downgrade(&connection), events));
        connection
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.lock_lifecycle()
            .map(|lifecycle| lifecycle.phase)
            .unwrap_or(Phase::Idle)
    }

    /// Number of calls waiting for the connection.
    pub fn buffered_len(&self) -> usize {
        self.lock_lifecycle()
            .map(|lifecycle| lifecycle.queue.len())
            .unwrap_or(0)
    }

    /// Run `observer` on every transition to connected, before buffered calls flush.
    pub fn on_connected<F>(&self, observer: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut observers) = self.connected_observers.lock() {
            observers.push(Arc::new(observer));
        }
    }

    fn lock_lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
        self.lifecycle
            .lock()
            .map_err(|_| HubShareError::poisoned("connection lifecycle"))
    }

    /// Begin a start attempt, or join the one already in flight.
    pub fn begin_start(self: &Arc<Self>, options: Option<Value>) -> StartFuture {
        let mut lifecycle = match self.lock_lifecycle() {
            Ok(lifecycle) => lifecycle,
            Err(e) => {
                let message = e.to_string();
                return async move { Err(message) }.boxed().shared();
            }
        };
        if let Some(in_flight) = &lifecycle.in_flight {
            debug!("Start already in flight, joining it");
            return in_flight.clone();
        }

        let this = self.clone();
        let attempt = spawn_shared(async move {
            // Let the caller's stack unwind before touching the transport.
            tokio::task::yield_now().await;
            if this.transport.state() != ConnectionState::Disconnected {
                this.stop_cleanly().await;
            }
            let result = this
                .transport
                .start(options)
                .await
                .map_err(|e| e.relay_message());

            if let Ok(mut lifecycle) = this.lifecycle.lock() {
                lifecycle.in_flight = None;
                lifecycle.phase = if result.is_ok() {
                    Phase::Started
                } else {
                    Phase::Idle
                };
            }
            match &result {
                Ok(()) => info!("Connection started"),
                Err(message) => warn!("Connection failed to start: {}", message),
            }
            result
        });

        lifecycle.phase = Phase::Starting;
        lifecycle.in_flight = Some(attempt.clone());
        attempt
    }

    /// Start (or restart) the connection.
    pub async fn start(self: &Arc<Self>, options: Option<Value>) -> Result<()> {
        self.begin_start(options)
            .await
            .map_err(|message| HubShareError::StartFailed { message })
    }

    pub async fn stop(&self) {
        self.transport.stop().await;
        if let Ok(mut lifecycle) = self.lifecycle.lock() {
            if lifecycle.in_flight.is_none() {
                lifecycle.phase = Phase::Idle;
            }
        }
    }

    /// Call a server method now if connected, otherwise once connected.
    pub async fn call(&self, channel: &str, method: &str, args: Args) -> Result<Value> {
        let reply = {
            let mut lifecycle = self.lock_lifecycle()?;
            if self.transport.state() == ConnectionState::Connected && lifecycle.queue.is_empty() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                lifecycle.queue.push_back(BufferedCall {
                    channel: channel.to_string(),
                    method: method.to_string(),
                    args: args.clone(),
                    reply: tx,
                });
                debug!(
                    "Buffered {}.{} until connected ({} queued)",
                    channel,
                    method,
                    lifecycle.queue.len()
                );
                Some(rx)
            }
        };

        match reply {
            None => self.transport.invoke(channel, method, args).await,
            Some(rx) => rx.await.map_err(|_| HubShareError::InvocationDropped {
                correlation_id: format!("{}.{}", channel, method),
            })?,
        }
    }

    async fn watch(connection: Weak<Self>, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            let connected = match events.recv().await {
                Ok(TransportEvent::StateChanged { old, new }) => {
                    new == ConnectionState::Connected && old != ConnectionState::Connected
                }
                Ok(_) => false,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Connection watcher lagged, {} events skipped", skipped);
                    true
                }
                Err(RecvError::Closed) => break,
            };
            if !connected {
                continue;
            }
            let Some(connection) = connection.upgrade() else {
                break;
            };
            if connection.transport.state() != ConnectionState::Connected {
                continue;
            }
            connection.notify_connected();
            connection.flush().await;
        }
    }

    fn notify_connected(&self) {
        let observers: Vec<ConnectedObserver> = self
            .connected_observers
            .lock()
            .map(|observers| observers.clone())
            .unwrap_or_default();
        for observer in observers {
            observer();
        }
    }

    // Calls left over when the connection drops wait for the next transition.
    async fn flush(&self) {
        let mut flushed = 0usize;
        loop {
            if self.transport.state() != ConnectionState::Connected {
                debug!("Connection left connected state, pausing flush");
                break;
            }
            let next = match self.lifecycle.lock() {
                Ok(mut lifecycle) => lifecycle.queue.pop_front(),
                Err(_) => None,
            };
            let Some(call) = next else {
                break;
            };
            let result = self
                .transport
                .invoke(&call.channel, &call.method, call.args)
                .await;
            let _ = call.reply.send(result);
            flushed += 1;
        }
        if flushed > 0 {
            info!("Flushed {} buffered calls", flushed);
        }
    }

    // Never interrupts a connect in progress.
    async fn stop_cleanly(&self) {
        let mut events = self.transport.events();
        if self.transport.state() == ConnectionState::Connecting {
            debug!("Waiting for the in-progress connect before restarting");
            self.wait_for(&mut events, |state| state != ConnectionState::Connecting)
                .await;
        }
        if self.transport.state() == ConnectionState::Disconnected {
            return;
        }
        self.transport.stop().await;
        self.wait_for(&mut events, |state| state == ConnectionState::Disconnected)
            .await;
        debug!("Connection stopped for restart");
    }

    async fn wait_for<P>(&self, events: &mut broadcast::Receiver<TransportEvent>, done: P)
    where
        P: Fn(ConnectionState) -> bool,
    {
        loop {
            if done(self.transport.state()) {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn wrap(transport: &LoopbackTransport) -> Arc<ResilientConnection> {
        ResilientConnection::new(Arc::new(transport.clone()))
    }

    #[tokio::test]
    async fn test_concurrent_starts_collapse() {
        let transport = LoopbackTransport::echo().with_connect_delay(Duration::from_millis(30));
        let connection = wrap(&transport);

        let first = connection.begin_start(None);
        let second = connection.begin_start(None);
        assert_eq!(connection.phase(), Phase::Starting);

        let (a, b) = tokio::time::timeout(WAIT, futures::future::join(first, second))
            .await
            .unwrap();
        assert_eq!(a, Ok(()));
        assert_eq!(b, Ok(()));
        assert_eq!(transport.start_count(), 1);
        assert_eq!(connection.phase(), Phase::Started);
    }

    #[tokio::test]
    async fn test_start_while_connected_restarts() {
        let transport = LoopbackTransport::echo();
        let connection = wrap(&transport);

        connection.start(None).await.unwrap();
        let first_id = transport.connection_id();
        connection.start(None).await.unwrap();

        assert_eq!(transport.start_count(), 2);
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert_ne!(transport.connection_id(), first_id);
    }

    #[tokio::test]
    async fn test_restart_waits_for_in_progress_connect() {
        let transport = LoopbackTransport::echo().with_connect_delay(Duration::from_millis(30));
        let connection = wrap(&transport);

        let external = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.start(None).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(transport.state(), ConnectionState::Connecting);

        tokio::time::timeout(WAIT, connection.start(None))
            .await
            .unwrap()
            .unwrap();
        assert!(external.await.unwrap().is_ok());
        assert_eq!(transport.start_count(), 2);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let transport = LoopbackTransport::echo();
        transport.fail_next_start("handshake rejected");
        let connection = wrap(&transport);

        let err = connection.start(None).await.unwrap_err();
        match err {
            HubShareError::StartFailed { message } => {
                assert_eq!(message, "Transport error: handshake rejected")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(connection.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_calls_buffer_until_connected() {
        let transport = LoopbackTransport::echo().with_connect_delay(Duration::from_millis(20));
        let connection = wrap(&transport);

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.call("echo", "send", vec![json!("x")]).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(connection.buffered_len(), 1);
        assert!(transport.invocations().is_empty());

        connection.start(None).await.unwrap();
        let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), json!("x"));
        assert_eq!(transport.invocations().len(), 1);
        assert_eq!(connection.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_buffered_calls_flush_in_order() {
        let transport = LoopbackTransport::echo();
        let connection = wrap(&transport);

        let mut pending = Vec::new();
        for n in 0..5usize {
            let caller = connection.clone();
            pending.push(tokio::spawn(async move {
                caller.call("echo", "send", vec![json!(n)]).await
            }));
            // Enqueue in a known order.
            while connection.buffered_len() < n + 1 {
                tokio::task::yield_now().await;
            }
        }

        connection.start(None).await.unwrap();
        for handle in pending {
            tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        }
        let sent: Vec<Value> = transport
            .invocations()
            .into_iter()
            .map(|(_, _, args)| args[0].clone())
            .collect();
        assert_eq!(sent, (0..5usize).map(|n| json!(n)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_flush_pauses_when_connection_drops() {
        let base = LoopbackTransport::echo();
        let handle = base.clone();
        let transport = base.with_method("echo", "flaky", move |_, _| {
            handle.drop_connection()?;
            Ok(json!("dropped"))
        });
        let connection = wrap(&transport);

        let flaky = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.call("echo", "flaky", vec![]).await })
        };
        while connection.buffered_len() < 1 {
            tokio::task::yield_now().await;
        }
        let after = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.call("echo", "send", vec![json!("after")]).await })
        };
        while connection.buffered_len() < 2 {
            tokio::task::yield_now().await;
        }

        connection.start(None).await.unwrap();
        let first = tokio::time::timeout(WAIT, flaky).await.unwrap().unwrap();
        assert_eq!(first.unwrap(), json!("dropped"));
        assert_eq!(transport.state(), ConnectionState::Reconnecting);
        assert_eq!(connection.buffered_len(), 1);

        transport.restore_connection().unwrap();
        let second = tokio::time::timeout(WAIT, after).await.unwrap().unwrap();
        assert_eq!(second.unwrap(), json!("after"));
    }

    #[tokio::test]
    async fn test_connected_observer_fires_on_each_connect() {
        let transport = LoopbackTransport::echo();
        let connection = wrap(&transport);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        connection.on_connected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        connection.start(None).await.unwrap();
        wait_for_count(&count, 1).await;
        transport.drop_connection().unwrap();
        transport.restore_connection().unwrap();
        wait_for_count(&count, 2).await;
    }

    async fn wait_for_count(count: &AtomicUsize, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while count.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

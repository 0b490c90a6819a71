//! Election and role-dependent wiring.
//!
//! The first `start()` decides this process's role by trying the election
//! lock once. The winner owns the real connection: it forwards transport
//! events to the bus, replicates state, keeps the connection's client
//! bindings in line with the shared subscription records and publishes every
//! start outcome. Everyone else follows the replicated start result.
//!
//! There is no re-election. If the owner dies after starting, later processes
//! find no live start result and wait indefinitely.

use crate::bus::{BusEvents, EventBus};
use crate::config::{LockConfig, SharedConnectionConfig};
use crate::error::{HubShareError, Result};
use crate::fanout::NotificationFanout;
use crate::lock::{LockGuard, LockService};
use crate::process::{LivenessOracle, ProcessLifecycle};
use crate::proxy::{ChannelConfig, ChannelProxy, ProxyRegistry};
use crate::replicator::StateReplicator;
use crate::resilience::{spawn_shared, ResilientConnection, StartFuture};
use crate::role::{Role, RoleCell};
use crate::rpc::RpcMultiplexer;
use crate::store::SharedStore;
use crate::subscription::{ReconcileReport, SubscriptionRegistry};
use crate::transport::Transport;
use crate::types::{ConnectionEvent, ConnectionState, ProcessId, TransportEvent};
use futures::FutureExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Start outcome as observed by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Pending,
    Started,
    Failed(String),
}

/// Collaborators a coordinator is built from.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn SharedStore>,
    pub locks: Arc<dyn LockService>,
    pub liveness: Arc<dyn LivenessOracle>,
    pub lifecycle: Arc<dyn ProcessLifecycle>,
}

pub struct OwnershipCoordinator {
    config: SharedConnectionConfig,
    process_id: ProcessId,
    store: Arc<dyn SharedStore>,
    locks: Arc<dyn LockService>,
    liveness: Arc<dyn LivenessOracle>,
    lifecycle: Arc<dyn ProcessLifecycle>,
    transport: Arc<dyn Transport>,
    bus: Arc<EventBus>,
    role: Arc<RoleCell>,
    replicator: StateReplicator,
    subscriptions: SubscriptionRegistry,
    proxies: Arc<ProxyRegistry>,
    fanout: Arc<NotificationFanout>,
    connection: Arc<ResilientConnection>,
    outcome: watch::Sender<StartOutcome>,
    events: broadcast::Sender<ConnectionEvent>,
    election: tokio::sync::Mutex<()>,
    election_guard: Mutex<Option<LockGuard>>,
    launch: Mutex<Option<(u64, StartFuture)>>,
    launch_seq: AtomicU64,
    last_options: Mutex<Option<Value>>,
    hooks_registered: AtomicBool,
}

impl OwnershipCoordinator {
    /// Wire every component. Must be called inside a tokio runtime.
    pub fn new(config: SharedConnectionConfig, parts: Collaborators) -> Arc<Self> {
        let Collaborators {
            transport,
            store,
            locks,
            liveness,
            lifecycle,
        } = parts;
        let process_id = lifecycle.process_id();
        let role = Arc::new(RoleCell::new());
        let bus = EventBus::new(
            store.clone(),
            config.key(crate::config::BusConfig::BUS_KEY),
            process_id.clone(),
        );
        let connection = ResilientConnection::new(transport.clone());
        let rpc = RpcMultiplexer::new(bus.clone(), role.clone(), connection.clone());
        let proxies = Arc::new(ProxyRegistry::new(rpc));
        let fanout = NotificationFanout::new(bus.clone(), role.clone(), proxies.clone());
        let replicator = StateReplicator::new(
            &config,
            store.clone(),
            locks.clone(),
            liveness.clone(),
            role.clone(),
            process_id.clone(),
        );
        let subscriptions =
            SubscriptionRegistry::new(&config, store.clone(), liveness.clone(), process_id.clone());
        let (outcome, _) = watch::channel(StartOutcome::Pending);
        let (events, _) = broadcast::channel(crate::config::BusConfig::CHANNEL_CAPACITY);

        let coordinator = Arc::new(Self {
            config,
            process_id,
            store,
            locks,
            liveness,
            lifecycle,
            transport,
            bus,
            role,
            replicator,
            subscriptions,
            proxies,
            fanout,
            connection,
            outcome,
            events,
            election: tokio::sync::Mutex::new(()),
            election_guard: Mutex::new(None),
            launch: Mutex::new(None),
            launch_seq: AtomicU64::new(0),
            last_options: Mutex::new(None),
            hooks_registered: AtomicBool::new(false),
        });
        coordinator.listen_for_lifecycle_events();
        coordinator
    }

    pub fn process_id(&self) -> &ProcessId {
        &self.process_id
    }

    pub fn role(&self) -> Role {
        self.role.get()
    }

    pub fn replicator(&self) -> &StateReplicator {
        &self.replicator
    }

    pub fn outcome(&self) -> StartOutcome {
        self.outcome.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Join the shared connection, becoming its owner if nobody else is.
    pub async fn start(self: &Arc<Self>, options: Option<Value>) -> Result<()> {
        self.register_terminate_hook();
        self.liveness.ready().await;
        self.refresh_outcome();

        let role = {
            let _election = self.election.lock().await;
            match self.role.get() {
                Role::Undecided => self.elect()?,
                decided => decided,
            }
        };

        match role {
            Role::Owner => self
                .launch(options)
                .await
                .map_err(|message| HubShareError::StartFailed { message }),
            Role::Follower => self.wait_outcome().await,
            Role::Undecided => Err(HubShareError::Other(
                "election finished without a role".to_string(),
            )),
        }
    }

    /// Register (or extend) a channel proxy and publish its client methods.
    pub fn channel_proxy(&self, name: &str, config: ChannelConfig) -> Result<Arc<ChannelProxy>> {
        let server_methods =
            self.transport
                .server_methods(name)
                .ok_or_else(|| HubShareError::UnknownChannel {
                    channel: name.to_string(),
                })?;
        let declared = self
            .subscriptions
            .record(name)?
            .map(|record| record.methods)
            .unwrap_or_default();
        let proxy = self
            .proxies
            .register(name, server_methods, &config, &declared)?;
        self.subscriptions.register(name, config.methods())?;
        Ok(proxy)
    }

    /// Give up the connection if this process owns it.
    pub async fn shutdown(&self) {
        self.release_ownership().await;
    }

    fn register_terminate_hook(self: &Arc<Self>) {
        if self.hooks_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        self.lifecycle.on_terminate(Box::new(move || {
            async move {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.release_ownership().await;
                }
            }
            .boxed()
        }));
    }

    async fn release_ownership(&self) {
        if !self.role.is_owner() {
            return;
        }
        info!("{} releasing the shared connection", self.process_id);
        if let Err(e) = self.replicator.clear_start_result().await {
            warn!("Failed to clear start result: {}", e);
        }
        self.connection.stop().await;
        let guard = self
            .election_guard
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        drop(guard);
    }

    fn elect(self: &Arc<Self>) -> Result<Role> {
        self.role.begin_election();
        let elected = self.try_elect();
        self.role.end_election();
        elected
    }

    fn try_elect(self: &Arc<Self>) -> Result<Role> {
        let lock_name = self.config.lock_name(LockConfig::ELECTION_LOCK);
        match self.locks.try_acquire(&lock_name)? {
            Some(guard) => {
                self.become_owner(guard);
                Ok(Role::Owner)
            }
            None => {
                self.role.decide(Role::Follower);
                info!("{} follows the shared connection", self.process_id);
                Ok(Role::Follower)
            }
        }
    }

    fn become_owner(self: &Arc<Self>, guard: LockGuard) {
        if let Ok(mut held) = self.election_guard.lock() {
            *held = Some(guard);
        }
        self.role.decide(Role::Owner);
        info!("{} owns the shared connection", self.process_id);

        self.forward_transport_events();
        self.watch_subscriptions();
        let process_id = self.process_id.clone();
        let transport = Arc::downgrade(&self.transport);
        self.connection.on_connected(move || {
            let connection_id = transport.upgrade().and_then(|t| t.connection_id());
            info!("{} connected as {:?}", process_id, connection_id);
        });

        if let Err(e) = self.reconcile() {
            warn!("Initial subscription reconcile failed: {}", e);
        }
    }

    // One start attempt at a time; a finished attempt clears its slot.
    fn launch(self: &Arc<Self>, options: Option<Value>) -> StartFuture {
        let mut launch = match self.launch.lock() {
            Ok(launch) => launch,
            Err(_) => {
                let message = HubShareError::poisoned("launch").to_string();
                return async move { Err(message) }.boxed().shared();
            }
        };
        if let Some((_, in_flight)) = launch.as_ref() {
            return in_flight.clone();
        }
        if let Ok(mut last) = self.last_options.lock() {
            *last = options.clone();
        }

        let seq = self.launch_seq.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let attempt = spawn_shared(async move {
            let result = this.connection.begin_start(options).await;
            this.publish_start_result(&result).await;
            if let Ok(mut launch) = this.launch.lock() {
                if matches!(launch.as_ref(), Some((current, _)) if *current == seq) {
                    *launch = None;
                }
            }
            result
        });
        *launch = Some((seq, attempt.clone()));
        attempt
    }

    fn current_launch(&self) -> Option<StartFuture> {
        self.launch
            .lock()
            .ok()?
            .as_ref()
            .map(|(_, in_flight)| in_flight.clone())
    }

    async fn publish_start_result(&self, result: &std::result::Result<(), String>) {
        if let Err(e) = self.replicator.write_start_result(result).await {
            warn!("Failed to record start result: {}", e);
        }
        let error = match result {
            Ok(()) => Value::Null,
            Err(message) => Value::String(message.clone()),
        };
        if let Err(e) = self.bus.publish(
            BusEvents::CONNECTION_STARTED,
            vec![Value::Bool(result.is_ok()), error],
        ) {
            warn!("Failed to announce start result: {}", e);
        }
    }

    // An absent record means nothing is known, so a settled outcome resets.
    fn refresh_outcome(&self) {
        let observed = match self.replicator.start_result() {
            Some(record) if record.success => StartOutcome::Started,
            Some(record) => StartOutcome::Failed(
                record
                    .error_message
                    .unwrap_or_else(|| "connection failed to start".to_string()),
            ),
            None => StartOutcome::Pending,
        };
        self.outcome.send_if_modified(|current| {
            if *current == observed {
                false
            } else {
                debug!("Start outcome {:?} -> {:?}", current, observed);
                *current = observed;
                true
            }
        });
    }

    async fn wait_outcome(&self) -> Result<()> {
        let mut rx = self.outcome.subscribe();
        let outcome = rx
            .wait_for(|outcome| *outcome != StartOutcome::Pending)
            .await
            .map(|outcome| (*outcome).clone())
            .map_err(|_| HubShareError::Other("coordinator dropped".to_string()))?;
        match outcome {
            StartOutcome::Failed(message) => Err(HubShareError::StartFailed { message }),
            _ => Ok(()),
        }
    }

    fn reconcile(&self) -> Result<ReconcileReport> {
        let mut records = self.subscriptions.load()?;
        self.subscriptions.prune_stale(&mut records)?;
        self.subscriptions.apply_config(
            &records,
            &self.proxies,
            self.transport.as_ref(),
            &self.fanout,
        )
    }

    fn on_subscriptions_changed(self: &Arc<Self>) {
        let report = match self.reconcile() {
            Ok(report) => report,
            Err(e) => {
                warn!("Subscription reconcile failed: {}", e);
                return;
            }
        };
        if report.new_channels.is_empty()
            || !self.config.owner_restart_on_new_channels
            || self.transport.state() != ConnectionState::Connected
        {
            return;
        }

        info!("Restarting connection to subscribe {:?}", report.new_channels);
        let options = self.last_options.lock().ok().and_then(|o| o.clone());
        let in_flight = self.current_launch();
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(in_flight) = in_flight {
                let _ = in_flight.await;
            }
            if let Err(message) = this.launch(options).await {
                warn!("Restart for new channels failed: {}", message);
            }
        });
    }

    fn watch_subscriptions(self: &Arc<Self>) {
        let mut changes = self.store.watch();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                if coordinator.subscriptions.is_subscription_key(&change.key) {
                    coordinator.on_subscriptions_changed();
                }
            }
        });
    }

    fn forward_transport_events(self: &Arc<Self>) {
        let mut events = self.transport.events();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Transport event forwarder lagged, {} events skipped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                coordinator.forward(event).await;
            }
        });
    }

    async fn forward(&self, event: TransportEvent) {
        let (name, args) = match event {
            TransportEvent::StateChanged { old, new } => {
                if let Err(e) = self
                    .replicator
                    .update_state(new, self.transport.connection_id())
                    .await
                {
                    warn!("Failed to replicate connection state: {}", e);
                }
                (
                    BusEvents::STATE_CHANGED,
                    vec![
                        Value::String(new.as_str().to_string()),
                        Value::String(old.as_str().to_string()),
                    ],
                )
            }
            TransportEvent::Starting => (BusEvents::STARTING, vec![]),
            TransportEvent::Received => (BusEvents::RECEIVED, vec![]),
            TransportEvent::ConnectionSlow => (BusEvents::CONNECTION_SLOW, vec![]),
            TransportEvent::Reconnecting => (BusEvents::RECONNECTING, vec![]),
            TransportEvent::Reconnected => (BusEvents::RECONNECTED, vec![]),
            TransportEvent::Disconnected => (BusEvents::DISCONNECTED, vec![]),
        };
        if let Err(e) = self.bus.publish(name, args) {
            warn!("Failed to forward {}: {}", name, e);
        }
    }

    // Every process, owner included, observes lifecycle events through the bus.
    fn listen_for_lifecycle_events(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.bus.on(BusEvents::CONNECTION_STARTED, move |args| {
            let Some(coordinator) = weak.upgrade() else {
                return;
            };
            let success = args.first().and_then(Value::as_bool).unwrap_or(false);
            let observed = if success {
                StartOutcome::Started
            } else {
                StartOutcome::Failed(
                    args.get(1)
                        .and_then(Value::as_str)
                        .unwrap_or("connection failed to start")
                        .to_string(),
                )
            };
            coordinator.outcome.send_replace(observed);
        });

        let events = self.events.clone();
        self.bus.on(BusEvents::STATE_CHANGED, move |args| {
            let parse = |index: usize| {
                args.get(index)
                    .cloned()
                    .and_then(|v| serde_json::from_value::<ConnectionState>(v).ok())
            };
            let (Some(new), Some(old)) = (parse(0), parse(1)) else {
                warn!("Discarding malformed state change event");
                return;
            };
            let _ = events.send(ConnectionEvent::StateChanged { new, old });
            if new == ConnectionState::Connected && new != old {
                let _ = events.send(ConnectionEvent::Connected);
            }
        });

        let simple = [
            (BusEvents::STARTING, ConnectionEvent::Starting),
            (BusEvents::RECEIVED, ConnectionEvent::Received),
            (BusEvents::CONNECTION_SLOW, ConnectionEvent::ConnectionSlow),
            (BusEvents::RECONNECTING, ConnectionEvent::Reconnecting),
            (BusEvents::RECONNECTED, ConnectionEvent::Reconnected),
            (BusEvents::DISCONNECTED, ConnectionEvent::Disconnected),
        ];
        for (name, event) in simple {
            let events = self.events.clone();
            self.bus.on(name, move |_| {
                let _ = events.send(event.clone());
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockTable;
    use crate::process::{ProcessTable, SimProcess};
    use crate::store::MemoryStore;
    use crate::transport::LoopbackTransport;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct World {
        store: MemoryStore,
        processes: Arc<ProcessTable>,
        locks: Arc<MemoryLockTable>,
    }

    impl World {
        fn new() -> Self {
            let processes = ProcessTable::new();
            Self {
                store: MemoryStore::new(),
                locks: MemoryLockTable::new(processes.clone()),
                processes,
            }
        }

        fn join(&self, transport: &LoopbackTransport) -> (SimProcess, Arc<OwnershipCoordinator>) {
            let process = self.processes.spawn();
            let coordinator = OwnershipCoordinator::new(
                SharedConnectionConfig::default(),
                Collaborators {
                    transport: Arc::new(transport.clone()),
                    store: Arc::new(self.store.clone()),
                    locks: Arc::new(self.locks.for_process(process.id().clone())),
                    liveness: self.processes.clone(),
                    lifecycle: Arc::new(process.clone()),
                },
            );
            (process, coordinator)
        }
    }

    #[tokio::test]
    async fn test_first_starter_owns_and_second_follows() {
        let world = World::new();
        let (_a, owner) = world.join(&LoopbackTransport::echo());
        let (_b, follower) = world.join(&LoopbackTransport::echo());

        tokio::time::timeout(WAIT, owner.start(None)).await.unwrap().unwrap();
        tokio::time::timeout(WAIT, follower.start(None)).await.unwrap().unwrap();

        assert_eq!(owner.role(), Role::Owner);
        assert_eq!(follower.role(), Role::Follower);
        assert_eq!(follower.outcome(), StartOutcome::Started);
    }

    #[tokio::test]
    async fn test_follower_adopts_failed_start() {
        let world = World::new();
        let transport = LoopbackTransport::echo();
        transport.fail_next_start("no route to host");
        let (_a, owner) = world.join(&transport);
        let (_b, follower) = world.join(&LoopbackTransport::echo());

        let err = tokio::time::timeout(WAIT, owner.start(None)).await.unwrap().unwrap_err();
        assert!(matches!(err, HubShareError::StartFailed { .. }));

        let err = tokio::time::timeout(WAIT, follower.start(None))
            .await
            .unwrap()
            .unwrap_err();
        match err {
            HubShareError::StartFailed { message } => {
                assert_eq!(message, "Transport error: no route to host")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_terminate_clears_start_result_and_stops() {
        let world = World::new();
        let transport = LoopbackTransport::echo();
        let (a, owner) = world.join(&transport);
        let (_b, follower) = world.join(&LoopbackTransport::echo());

        owner.start(None).await.unwrap();
        assert!(follower.replicator().start_result().is_some());

        a.terminate().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(follower.replicator().start_result().is_none());
        let election = SharedConnectionConfig::default().lock_name(LockConfig::ELECTION_LOCK);
        assert!(world.locks.holder(&election).is_none());
    }

    #[tokio::test]
    async fn test_channel_proxy_rejects_unknown_channel() {
        let world = World::new();
        let (_a, coordinator) = world.join(&LoopbackTransport::echo());

        let err = coordinator
            .channel_proxy("chat", ChannelConfig::new())
            .err()
            .unwrap();
        assert!(matches!(err, HubShareError::UnknownChannel { .. }));
    }

    #[tokio::test]
    async fn test_lifecycle_events_reach_followers() {
        let world = World::new();
        let (_a, owner) = world.join(&LoopbackTransport::echo());
        let (_b, follower) = world.join(&LoopbackTransport::echo());
        let mut events = follower.subscribe();

        owner.start(None).await.unwrap();

        let saw_connected = tokio::time::timeout(WAIT, async {
            loop {
                if events.recv().await.unwrap() == ConnectionEvent::Connected {
                    return true;
                }
            }
        })
        .await
        .unwrap();
        assert!(saw_connected);
    }
}

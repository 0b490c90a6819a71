//! Which client methods each channel needs, and by whom.
//!
//! Every process that registers a channel proxy adds itself and its client
//! methods to that channel's shared record. The owner reconciles its real
//! connection against the union of all records, so pushes for a method needed
//! by any live process reach the bus even when the owner has no handler.

use crate::config::SharedConnectionConfig;
use crate::error::Result;
use crate::fanout::NotificationFanout;
use crate::process::LivenessOracle;
use crate::proxy::ProxyRegistry;
use crate::store::{update_with_retry, SharedStore};
use crate::transport::Transport;
use crate::types::ProcessId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared record of one channel's subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub members: BTreeSet<ProcessId>,
    pub methods: BTreeSet<String>,
}

impl SubscriptionRecord {
    fn parse(key: &str, raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!("Replacing malformed subscription record {}: {}", key, e);
            Self::default()
        })
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Channels that had at least one method newly bound.
    pub rebound_channels: BTreeSet<String>,
    /// Channels bound on the real connection for the first time.
    pub new_channels: BTreeSet<String>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.rebound_channels.is_empty()
    }
}

pub struct SubscriptionRegistry {
    store: Arc<dyn SharedStore>,
    liveness: Arc<dyn LivenessOracle>,
    process_id: ProcessId,
    config: SharedConnectionConfig,
}

impl SubscriptionRegistry {
    pub fn new(
        config: &SharedConnectionConfig,
        store: Arc<dyn SharedStore>,
        liveness: Arc<dyn LivenessOracle>,
        process_id: ProcessId,
    ) -> Self {
        Self {
            store,
            liveness,
            process_id,
            config: config.clone(),
        }
    }

    pub fn is_subscription_key(&self, key: &str) -> bool {
        key.starts_with(&self.config.subscription_prefix())
    }

    /// Add this process and `methods` to `channel`'s record.
    pub fn register<'a>(
        &self,
        channel: &str,
        methods: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        let methods: BTreeSet<String> = methods.into_iter().cloned().collect();
        let key = self.config.subscription_key(channel);
        update_with_retry(
            self.store.as_ref(),
            &key,
            self.config.cas_max_attempts,
            |current| {
                let mut record = SubscriptionRecord::parse(&key, current);
                record.members.retain(|member| self.liveness.is_alive(member));
                record.members.insert(self.process_id.clone());
                record.methods.extend(methods.iter().cloned());
                Ok(Some(serde_json::to_string(&record)?))
            },
        )?;
        debug!("Registered {} for {:?} on {}", self.process_id, methods, channel);
        Ok(())
    }

    /// Read one channel's record.
    pub fn record(&self, channel: &str) -> Result<Option<SubscriptionRecord>> {
        let key = self.config.subscription_key(channel);
        Ok(self
            .store
            .get(&key)?
            .map(|raw| SubscriptionRecord::parse(&key, Some(&raw))))
    }

    /// Read every channel's record.
    pub fn load(&self) -> Result<BTreeMap<String, SubscriptionRecord>> {
        let prefix = self.config.subscription_prefix();
        let mut records = BTreeMap::new();
        for key in self.store.keys_with_prefix(&prefix)? {
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };
            let channel = key[prefix.len()..].to_string();
            records.insert(channel, SubscriptionRecord::parse(&key, Some(&raw)));
        }
        Ok(records)
    }

    /// Drop dead members, removing records left without members.
    ///
    /// Returns the number of members removed.
    pub fn prune_stale(&self, records: &mut BTreeMap<String, SubscriptionRecord>) -> Result<usize> {
        let mut pruned = 0;
        let channels: Vec<String> = records.keys().cloned().collect();
        for channel in channels {
            let stale = records
                .get(&channel)
                .map(|r| r.members.iter().filter(|m| !self.liveness.is_alive(m)).count())
                .unwrap_or(0);
            if stale == 0 {
                continue;
            }

            let key = self.config.subscription_key(&channel);
            let written = update_with_retry(
                self.store.as_ref(),
                &key,
                self.config.cas_max_attempts,
                |current| {
                    if current.is_none() {
                        return Ok(None);
                    }
                    let mut record = SubscriptionRecord::parse(&key, current);
                    record.members.retain(|member| self.liveness.is_alive(member));
                    if record.members.is_empty() {
                        Ok(None)
                    } else {
                        Ok(Some(serde_json::to_string(&record)?))
                    }
                },
            )?;

            match written {
                Some(raw) => {
                    records.insert(channel.clone(), SubscriptionRecord::parse(&key, Some(&raw)));
                }
                None => {
                    info!("Removed subscription record for {} (no live members)", channel);
                    records.remove(&channel);
                }
            }
            pruned += stale;
        }
        if pruned > 0 {
            debug!("Pruned {} stale subscription members", pruned);
        }
        Ok(pruned)
    }

    /// Make the real connection expose every method the records ask for.
    ///
    /// Methods without a local slot get a placeholder. Every method not yet
    /// bound is bound once through the fanout wrapper.
    pub fn apply_config(
        &self,
        records: &BTreeMap<String, SubscriptionRecord>,
        proxies: &ProxyRegistry,
        transport: &dyn Transport,
        fanout: &Arc<NotificationFanout>,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for (channel, record) in records {
            let proxy = match proxies.get(channel) {
                Some(proxy) => proxy,
                None => proxies.ensure(channel, transport.server_methods(channel).unwrap_or_default())?,
            };
            for method in &record.methods {
                if proxy.install_placeholder(method) {
                    debug!("Placeholder installed for {}.{}", channel, method);
                }
            }

            let first_binding = !proxy.has_bindings();
            let mut bound_any = false;
            for method in proxy.client_methods() {
                if proxy.tag_bound(&method) {
                    transport.bind_client(channel, &method, fanout.owner_wrapper(channel, &method));
                    bound_any = true;
                }
            }
            if bound_any {
                report.rebound_channels.insert(channel.clone());
                if first_binding {
                    report.new_channels.insert(channel.clone());
                }
            }
        }
        if report.changed() {
            info!("Bound client methods on {:?}", report.rebound_channels);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::process::ProcessTable;
    use crate::proxy::ChannelConfig;
    use crate::resilience::ResilientConnection;
    use crate::role::{Role, RoleCell};
    use crate::rpc::RpcMultiplexer;
    use crate::store::MemoryStore;
    use crate::transport::LoopbackTransport;

    fn registry(
        store: &Arc<dyn SharedStore>,
        processes: &Arc<ProcessTable>,
        id: &ProcessId,
    ) -> SubscriptionRegistry {
        SubscriptionRegistry::new(
            &SharedConnectionConfig::default(),
            store.clone(),
            processes.clone(),
            id.clone(),
        )
    }

    fn names(methods: &[&str]) -> Vec<String> {
        methods.iter().map(|m| m.to_string()).collect()
    }

    #[test]
    fn test_register_unions_members_and_methods() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let processes = ProcessTable::new();
        let a = processes.spawn();
        let b = processes.spawn();

        registry(&store, &processes, a.id())
            .register("echo", &names(&["displayMsg"]))
            .unwrap();
        registry(&store, &processes, b.id())
            .register("echo", &names(&["userJoined"]))
            .unwrap();

        let record = registry(&store, &processes, a.id()).record("echo").unwrap().unwrap();
        assert_eq!(record.members, BTreeSet::from([a.id().clone(), b.id().clone()]));
        assert_eq!(
            record.methods,
            names(&["displayMsg", "userJoined"]).into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_register_retries_against_latest_value() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let processes = ProcessTable::new();
        let a = processes.spawn();
        let reg = registry(&store, &processes, a.id());
        let key = SharedConnectionConfig::default().subscription_key("echo");

        // A concurrent writer lands between our read and our swap.
        let mut raced = false;
        update_with_retry(store.as_ref(), &key, 4, |current| {
            if !raced {
                raced = true;
                store.set(&key, r#"{"members":[],"methods":["other"]}"#).unwrap();
            }
            let mut record = SubscriptionRecord::parse(&key, current);
            record.methods.insert("mine".into());
            Ok(Some(serde_json::to_string(&record)?))
        })
        .unwrap();

        let record = reg.record("echo").unwrap().unwrap();
        assert!(record.methods.contains("other"));
        assert!(record.methods.contains("mine"));
    }

    #[tokio::test]
    async fn test_prune_removes_dead_members_and_empty_records() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let processes = ProcessTable::new();
        let a = processes.spawn();
        let b = processes.spawn();
        registry(&store, &processes, a.id()).register("echo", &names(&["displayMsg"])).unwrap();
        registry(&store, &processes, b.id()).register("echo", &names(&["displayMsg"])).unwrap();
        registry(&store, &processes, b.id()).register("chat", &names(&["message"])).unwrap();

        b.terminate().await;
        let reg = registry(&store, &processes, a.id());
        let mut records = reg.load().unwrap();
        let pruned = reg.prune_stale(&mut records).unwrap();

        assert_eq!(pruned, 2);
        assert!(!records.contains_key("chat"));
        assert_eq!(records["echo"].members, BTreeSet::from([a.id().clone()]));
        assert!(reg.record("chat").unwrap().is_none());
        assert_eq!(reg.load().unwrap(), records);
    }

    #[tokio::test]
    async fn test_apply_config_binds_each_method_once() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let processes = ProcessTable::new();
        let owner = processes.spawn();
        let other = processes.spawn();

        let transport = LoopbackTransport::echo();
        let bus = EventBus::new(store.clone(), "bus", owner.id().clone());
        let role = Arc::new(RoleCell::new());
        role.decide(Role::Owner);
        let connection = ResilientConnection::new(Arc::new(transport.clone()));
        let rpc = RpcMultiplexer::new(bus.clone(), role.clone(), connection);
        let proxies = Arc::new(ProxyRegistry::new(rpc));
        let fanout = NotificationFanout::new(bus, role, proxies.clone());

        let config = ChannelConfig::new().on("joined", |_| {});
        proxies
            .register("echo", transport.server_methods("echo").unwrap(), &config, &BTreeSet::new())
            .unwrap();
        let reg = registry(&store, &processes, owner.id());
        reg.register("echo", config.methods()).unwrap();
        registry(&store, &processes, other.id())
            .register("echo", &names(&["displayMsg"]))
            .unwrap();

        let records = reg.load().unwrap();
        let report = reg.apply_config(&records, &proxies, &transport, &fanout).unwrap();
        assert!(report.changed());
        assert_eq!(report.new_channels, BTreeSet::from(["echo".to_string()]));

        let proxy = proxies.get("echo").unwrap();
        assert!(proxy.slot("displayMsg").unwrap().is_placeholder());
        assert!(!proxy.slot("joined").unwrap().is_placeholder());

        let again = reg.apply_config(&records, &proxies, &transport, &fanout).unwrap();
        assert!(!again.changed());
    }
}

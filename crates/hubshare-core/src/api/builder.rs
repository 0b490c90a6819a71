//! Builder for configuring SharedConnection initialization.

use std::sync::Arc;

use crate::config::SharedConnectionConfig;
use crate::coordinator::{Collaborators, OwnershipCoordinator};
use crate::error::{HubShareError, Result};
use crate::lock::LockService;
use crate::process::{LivenessOracle, ProcessLifecycle};
use crate::store::SharedStore;
use crate::transport::Transport;
use crate::SharedConnection;

/// Builder for configuring SharedConnection initialization.
///
/// # Example
///
/// ```rust,ignore
/// use hubshare_core::SharedConnection;
///
/// let connection = SharedConnection::builder(Arc::new(LoopbackTransport::echo()))
///     .store(Arc::new(store))
///     .locks(Arc::new(table.for_process(process.id().clone())))
///     .process(Arc::new(process))
///     .namespace("demo_v1_")
///     .build()
///     .await?;
/// ```
pub struct SharedConnectionBuilder {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn SharedStore>>,
    locks: Option<Arc<dyn LockService>>,
    liveness: Option<Arc<dyn LivenessOracle>>,
    lifecycle: Option<Arc<dyn ProcessLifecycle>>,
    config: SharedConnectionConfig,
}

impl SharedConnectionBuilder {
    /// Create a new builder around the real transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            store: None,
            locks: None,
            liveness: None,
            lifecycle: None,
            config: SharedConnectionConfig::default(),
        }
    }

    /// Shared record store visible to every participating process. Required.
    pub fn store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Cross-process named locks. Required.
    pub fn locks(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Liveness oracle for gating shared reads. Required unless set by `process`.
    pub fn liveness(mut self, liveness: Arc<dyn LivenessOracle>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Identity and termination hooks of this process. Required unless set by `process`.
    pub fn lifecycle(mut self, lifecycle: Arc<dyn ProcessLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Use one handle as both liveness oracle and lifecycle.
    pub fn process<P>(mut self, process: Arc<P>) -> Self
    where
        P: LivenessOracle + ProcessLifecycle + 'static,
    {
        self.liveness = Some(process.clone());
        self.lifecycle = Some(process);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SharedConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Prefix for every shared record and lock name.
    ///
    /// Default: `hubshare_v1_`
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Restart the owner's connection when a channel appears while connected.
    ///
    /// Default: `true`
    pub fn restart_on_new_channels(mut self, enable: bool) -> Self {
        self.config.owner_restart_on_new_channels = enable;
        self
    }

    fn missing(what: &str) -> HubShareError {
        HubShareError::Config {
            message: format!("SharedConnection requires a {}", what),
        }
    }

    /// Build the SharedConnection instance.
    pub async fn build(self) -> Result<SharedConnection> {
        let store = self.store.ok_or_else(|| Self::missing("shared store"))?;
        let locks = self.locks.ok_or_else(|| Self::missing("lock service"))?;
        let liveness = self.liveness.ok_or_else(|| Self::missing("liveness oracle"))?;
        let lifecycle = self.lifecycle.ok_or_else(|| Self::missing("process lifecycle"))?;

        tracing::debug!(
            "Building shared connection for {} in namespace {}",
            lifecycle.process_id(),
            self.config.namespace
        );
        let inner = OwnershipCoordinator::new(
            self.config,
            Collaborators {
                transport: self.transport,
                store,
                locks,
                liveness,
                lifecycle,
            },
        );
        Ok(SharedConnection { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLockTable;
    use crate::process::ProcessTable;
    use crate::store::MemoryStore;
    use crate::transport::LoopbackTransport;

    #[tokio::test]
    async fn test_build_requires_store() {
        let result = SharedConnection::builder(Arc::new(LoopbackTransport::echo()))
            .build()
            .await;
        match result {
            Err(HubShareError::Config { message }) => assert!(message.contains("shared store")),
            _ => panic!("expected a configuration error"),
        }
    }

    #[tokio::test]
    async fn test_build_with_process_handle() {
        let processes = ProcessTable::new();
        let process = processes.spawn();
        let locks = MemoryLockTable::new(processes.clone());

        let connection = SharedConnection::builder(Arc::new(LoopbackTransport::echo()))
            .store(Arc::new(MemoryStore::new()))
            .locks(Arc::new(locks.for_process(process.id().clone())))
            .process(Arc::new(process.clone()))
            .namespace("test_v1_")
            .build()
            .await
            .unwrap();
        assert_eq!(connection.process_id(), process.id());
    }
}

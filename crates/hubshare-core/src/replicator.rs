//! Replicated connection state and start result.
//!
//! Both records are written only by the owner, each under its own named lock.
//! Every read is gated on the writer still being alive: a record left behind by
//! a dead owner reads as absent.

use crate::config::{LockConfig, SharedConnectionConfig, StoreConfig};
use crate::error::{HubShareError, Result};
use crate::lock::LockService;
use crate::process::LivenessOracle;
use crate::role::RoleCell;
use crate::store::SharedStore;
use crate::types::{ConnectionState, ProcessId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// The owner's connection state as seen by every process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStateRecord {
    pub state: ConnectionState,
    pub connection_id: Option<String>,
    pub owner_process_id: ProcessId,
}

/// Outcome of the owner's most recent start attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResultRecord {
    pub success: bool,
    pub error_message: Option<String>,
    pub owner_process_id: ProcessId,
}

/// Records that carry the id of the process that wrote them.
trait OwnedRecord {
    fn owner(&self) -> &ProcessId;
}

impl OwnedRecord for ConnectionStateRecord {
    fn owner(&self) -> &ProcessId {
        &self.owner_process_id
    }
}

impl OwnedRecord for StartResultRecord {
    fn owner(&self) -> &ProcessId {
        &self.owner_process_id
    }
}

pub struct StateReplicator {
    store: Arc<dyn SharedStore>,
    locks: Arc<dyn LockService>,
    liveness: Arc<dyn LivenessOracle>,
    role: Arc<RoleCell>,
    process_id: ProcessId,
    state_key: String,
    start_result_key: String,
    state_lock: String,
    start_result_lock: String,
}

impl StateReplicator {
    pub fn new(
        config: &SharedConnectionConfig,
        store: Arc<dyn SharedStore>,
        locks: Arc<dyn LockService>,
        liveness: Arc<dyn LivenessOracle>,
        role: Arc<RoleCell>,
        process_id: ProcessId,
    ) -> Self {
        Self {
            store,
            locks,
            liveness,
            role,
            process_id,
            state_key: config.key(StoreConfig::STATE_KEY),
            start_result_key: config.key(StoreConfig::START_RESULT_KEY),
            state_lock: config.lock_name(LockConfig::STATE_LOCK),
            start_result_lock: config.lock_name(LockConfig::START_RESULT_LOCK),
        }
    }

    fn require_owner(&self, operation: &str) -> Result<()> {
        if self.role.is_owner() {
            Ok(())
        } else {
            Err(HubShareError::NotOwner {
                operation: operation.to_string(),
            })
        }
    }

    /// Publish the owner's connection state. Owner only.
    pub async fn update_state(
        &self,
        state: ConnectionState,
        connection_id: Option<String>,
    ) -> Result<()> {
        self.require_owner("update_state")?;
        let record = ConnectionStateRecord {
            state,
            connection_id,
            owner_process_id: self.process_id.clone(),
        };
        let raw = serde_json::to_string(&record)?;

        let _guard = self.locks.acquire(&self.state_lock).await?;
        self.store.set(&self.state_key, &raw)?;
        debug!("Replicated connection state {}", state);
        Ok(())
    }

    /// Record the outcome of a start attempt. Owner only.
    pub async fn write_start_result(&self, outcome: &std::result::Result<(), String>) -> Result<()> {
        self.require_owner("write_start_result")?;
        let record = StartResultRecord {
            success: outcome.is_ok(),
            error_message: outcome.as_ref().err().cloned(),
            owner_process_id: self.process_id.clone(),
        };
        let raw = serde_json::to_string(&record)?;

        let _guard = self.locks.acquire(&self.start_result_lock).await?;
        self.store.set(&self.start_result_key, &raw)
    }

    /// Remove the start result so later processes do not adopt it. Owner only.
    pub async fn clear_start_result(&self) -> Result<()> {
        self.require_owner("clear_start_result")?;
        let _guard = self.locks.acquire(&self.start_result_lock).await?;
        self.store.remove(&self.start_result_key)?;
        Ok(())
    }

    pub fn state_record(&self) -> Option<ConnectionStateRecord> {
        self.read_live(&self.state_key)
    }

    pub fn start_result(&self) -> Option<StartResultRecord> {
        self.read_live(&self.start_result_key)
    }

    /// Owner's connection state; `Disconnected` when absent or stale.
    pub fn state(&self) -> ConnectionState {
        self.state_record().map(|r| r.state).unwrap_or_default()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.state_record().and_then(|r| r.connection_id)
    }

    pub fn owner_process_id(&self) -> Option<ProcessId> {
        self.state_record().map(|r| r.owner_process_id)
    }

    // Unreadable or stale records read as absent.
    fn read_live<T: DeserializeOwned + OwnedRecord>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                return None;
            }
        };
        let record: T = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring malformed record {}: {}", key, e);
                return None;
            }
        };
        if self.liveness.is_alive(record.owner()) {
            Some(record)
        } else {
            debug!("Ignoring {} written by dead process {}", key, record.owner());
            None
        }
    }
}

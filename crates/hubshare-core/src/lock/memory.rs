//! In-process lock table shared by simulated processes.

use super::traits::{LockGuard, LockService};
use crate::error::{HubShareError, Result};
use crate::process::LivenessOracle;
use crate::types::ProcessId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Holder {
    process: ProcessId,
    token: u64,
}

/// Lock table shared by every simulated process of one test world.
///
/// A lock whose holder is no longer alive counts as free, which mirrors the
/// operating system releasing a dead process's locks.
pub struct MemoryLockTable {
    holders: Mutex<HashMap<String, Holder>>,
    next_token: Mutex<u64>,
    released: Notify,
    liveness: Arc<dyn LivenessOracle>,
    poll_interval: Duration,
}

impl MemoryLockTable {
    pub fn new(liveness: Arc<dyn LivenessOracle>) -> Arc<Self> {
        Arc::new(Self {
            holders: Mutex::new(HashMap::new()),
            next_token: Mutex::new(0),
            released: Notify::new(),
            liveness,
            poll_interval: Duration::from_millis(10),
        })
    }

    /// Lock service acting on behalf of `process`.
    pub fn for_process(self: &Arc<Self>, process: ProcessId) -> MemoryLockService {
        MemoryLockService {
            table: self.clone(),
            process,
        }
    }

    /// Current live holder of `name`, if any.
    pub fn holder(&self, name: &str) -> Option<ProcessId> {
        let holders = self.holders.lock().ok()?;
        holders
            .get(name)
            .filter(|h| self.liveness.is_alive(&h.process))
            .map(|h| h.process.clone())
    }

    fn try_take(self: &Arc<Self>, name: &str, process: &ProcessId) -> Result<Option<LockGuard>> {
        let mut holders = self
            .holders
            .lock()
            .map_err(|_| HubShareError::poisoned("memory lock table"))?;

        if let Some(holder) = holders.get(name) {
            if self.liveness.is_alive(&holder.process) {
                return Ok(None);
            }
        }

        let token = {
            let mut next = self
                .next_token
                .lock()
                .map_err(|_| HubShareError::poisoned("memory lock table"))?;
            *next += 1;
            *next
        };
        holders.insert(
            name.to_string(),
            Holder {
                process: process.clone(),
                token,
            },
        );

        Ok(Some(LockGuard::new(
            name,
            TableEntry {
                table: self.clone(),
                name: name.to_string(),
                token,
            },
        )))
    }

    fn release(&self, name: &str, token: u64) {
        if let Ok(mut holders) = self.holders.lock() {
            if holders.get(name).map(|h| h.token) == Some(token) {
                holders.remove(name);
            }
        }
        self.released.notify_waiters();
    }
}

struct TableEntry {
    table: Arc<MemoryLockTable>,
    name: String,
    token: u64,
}

impl Drop for TableEntry {
    fn drop(&mut self) {
        self.table.release(&self.name, self.token);
    }
}

/// One process's view of a [`MemoryLockTable`].
#[derive(Clone)]
pub struct MemoryLockService {
    table: Arc<MemoryLockTable>,
    process: ProcessId,
}

#[async_trait::async_trait]
impl LockService for MemoryLockService {
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        self.table.try_take(name, &self.process)
    }

    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        loop {
            let released = self.table.released.notified();
            if let Some(guard) = self.table.try_take(name, &self.process)? {
                return Ok(guard);
            }
            // Dead holders never notify, so recheck periodically as well.
            let _ = tokio::time::timeout(self.table.poll_interval, released).await;
        }
    }
}

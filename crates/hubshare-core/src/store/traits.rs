//! Shared store trait and read-modify-write helper.

use crate::error::{HubShareError, Result};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// One successful write observed by a store watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    /// New value, `None` when the key was removed.
    pub value: Option<String>,
}

/// One watcher's queue of changes. Unbounded, so a slow watcher falls behind
/// but never misses a change.
pub type ChangeFeed = mpsc::UnboundedReceiver<StoreChange>;

/// Every live watcher of one store.
#[derive(Default)]
pub struct Watchers {
    senders: Mutex<Vec<mpsc::UnboundedSender<StoreChange>>>,
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> ChangeFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Queue `change` for every watcher, forgetting dropped ones.
    pub fn notify(&self, change: StoreChange) {
        let mut senders = self
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        senders.retain(|tx| tx.send(change.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders
            .lock()
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Store shared by all processes.
///
/// Every successful write produces exactly one [`StoreChange`], delivered to all
/// watchers (the writer's own included) in write order. All operations are
/// synchronous to match rusqlite's API.
pub trait SharedStore: Send + Sync {
    /// Read a value. Returns `None` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, overwriting any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool>;

    /// Atomically replace `expected` with `new`; `None` means "absent" on either side.
    ///
    /// Returns `false` without writing when the stored value differs from `expected`.
    fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: Option<&str>)
        -> Result<bool>;

    /// List keys starting with `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Subscribe to change notifications from now on.
    fn watch(&self) -> ChangeFeed;
}

/// Apply `update` to the latest value of `key` until the swap lands.
///
/// `update` receives the current raw value and returns the value to store
/// (`None` deletes the key). It is re-run against a fresh read after every
/// conflicting write, never against a cached value. Returns what was written.
pub fn update_with_retry<F>(
    store: &dyn SharedStore,
    key: &str,
    max_attempts: u32,
    mut update: F,
) -> Result<Option<String>>
where
    F: FnMut(Option<&str>) -> Result<Option<String>>,
{
    for attempt in 0..max_attempts {
        let current = store.get(key)?;
        let next = update(current.as_deref())?;
        if next == current {
            return Ok(next);
        }
        if store.compare_and_swap(key, current.as_deref(), next.as_deref())? {
            if attempt > 0 {
                debug!("Update of {} landed after {} attempts", key, attempt + 1);
            }
            return Ok(next);
        }
        debug!("Concurrent write to {}, retrying update", key);
    }

    Err(HubShareError::ConflictRetriesExhausted {
        key: key.to_string(),
        attempts: max_attempts,
    })
}

//! In-process shared store for tests and single-process setups.

use super::traits::{ChangeFeed, SharedStore, StoreChange, Watchers};
use crate::error::{HubShareError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Map-backed store; clones share the same data and change feed.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

struct MemoryStoreInner {
    records: Mutex<BTreeMap<String, String>>,
    watchers: Watchers,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                records: Mutex::new(BTreeMap::new()),
                watchers: Watchers::new(),
            }),
        }
    }

    fn lock_records(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.inner
            .records
            .lock()
            .map_err(|_| HubShareError::poisoned("memory store"))
    }

    // Sent while the records lock is held so notifications follow write order.
    fn notify(&self, key: &str, value: Option<&str>) {
        self.inner.watchers.notify(StoreChange {
            key: key.to_string(),
            value: value.map(str::to_string),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock_records()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut records = self.lock_records()?;
        records.insert(key.to_string(), value.to_string());
        self.notify(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut records = self.lock_records()?;
        let existed = records.remove(key).is_some();
        if existed {
            self.notify(key, None);
        }
        Ok(existed)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        let mut records = self.lock_records()?;
        if records.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                records.insert(key.to_string(), value.to_string());
            }
            None => {
                if records.remove(key).is_none() {
                    return Ok(true);
                }
            }
        }
        self.notify(key, new);
        Ok(true)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let records = self.lock_records()?;
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn watch(&self) -> ChangeFeed {
        self.inner.watchers.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let store = MemoryStore::new();
        assert!(store.get("a").unwrap().is_none());

        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));

        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_clones_share_data() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("shared", "yes").unwrap();
        assert_eq!(other.get("shared").unwrap().as_deref(), Some("yes"));
    }

    #[test]
    fn test_compare_and_swap() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("k", None, Some("v1")).unwrap());
        assert!(!store.compare_and_swap("k", None, Some("v2")).unwrap());
        assert!(store.compare_and_swap("k", Some("v1"), Some("v2")).unwrap());
        assert!(store.compare_and_swap("k", Some("v2"), None).unwrap());
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn test_keys_with_prefix_sorted() {
        let store = MemoryStore::new();
        store.set("sub/b", "x").unwrap();
        store.set("sub/a", "x").unwrap();
        store.set("state", "x").unwrap();
        store.set("suc", "x").unwrap();

        assert_eq!(
            store.keys_with_prefix("sub/").unwrap(),
            vec!["sub/a".to_string(), "sub/b".to_string()]
        );
    }

    #[test]
    fn test_watch_sees_writes_in_order() {
        let store = MemoryStore::new();
        let mut rx = store.watch();

        store.set("a", "1").unwrap();
        store.set("a", "2").unwrap();
        store.remove("a").unwrap();

        assert_eq!(rx.try_recv().unwrap().value.as_deref(), Some("1"));
        assert_eq!(rx.try_recv().unwrap().value.as_deref(), Some("2"));
        assert_eq!(rx.try_recv().unwrap().value, None);
    }

    #[test]
    fn test_slow_watcher_keeps_every_change() {
        let store = MemoryStore::new();
        let mut rx = store.watch();

        for n in 0..5000 {
            store.set("bus", &n.to_string()).unwrap();
        }

        for n in 0..5000 {
            assert_eq!(rx.try_recv().unwrap().value, Some(n.to_string()));
        }
        assert!(rx.try_recv().is_err());
    }
}

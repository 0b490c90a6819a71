//! SQLite-backed shared store for processes on one machine.
//!
//! Values live in a `records` table. Every write also appends to a `changes`
//! log which a poller thread tails to produce change notifications, so readers
//! in other processes see each write exactly once and in order. WAL mode keeps
//! the poller's reads from blocking writers.

use super::traits::{ChangeFeed, SharedStore, StoreChange, Watchers};
use crate::config::SqliteConfig;
use crate::error::{HubShareError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Shared store persisted in a SQLite database file.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    watchers: Arc<Watchers>,
    shutdown: Arc<AtomicBool>,
}

impl SqliteStore {
    /// Open the store at `db_path`, polling for changes at the default interval.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        Self::open_with_interval(db_path, SqliteConfig::POLL_INTERVAL)
    }

    /// Open the store at `db_path`, creating the database and parent directories.
    pub fn open_with_interval(db_path: &Path, poll_interval: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| HubShareError::io_with_path(e, parent))?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        let last_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM changes",
            [],
            |row| row.get(0),
        )?;

        let watchers = Arc::new(Watchers::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let poller_conn = Connection::open(db_path)?;
        Self::configure_connection(&poller_conn)?;
        let poller = ChangePoller {
            conn: poller_conn,
            path: db_path.to_path_buf(),
            last_seq,
            watchers: watchers.clone(),
            shutdown: shutdown.clone(),
            interval: poll_interval,
        };
        std::thread::Builder::new()
            .name("hubshare-store-poller".to_string())
            .spawn(move || poller.run())
            .map_err(|e| HubShareError::io_with_path(e, db_path))?;

        debug!("Opened shared store at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            watchers,
            shutdown,
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;",
            SqliteConfig::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                value TEXT,
                written_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| HubShareError::Store {
            message: "Failed to acquire store connection lock".to_string(),
            source: None,
        })
    }

    fn write_row(tx: &rusqlite::Transaction<'_>, key: &str, value: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        match value {
            Some(value) => {
                tx.execute(
                    "INSERT INTO records (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                         value=excluded.value,
                         updated_at=excluded.updated_at",
                    params![key, value, now],
                )?;
            }
            None => {
                tx.execute("DELETE FROM records WHERE key = ?1", params![key])?;
            }
        }
        tx.execute(
            "INSERT INTO changes (key, value, written_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;
        Ok(())
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

impl SharedStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::write_row(&tx, key, Some(value))?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row("SELECT 1 FROM records WHERE key = ?1", params![key], |_| Ok(()))
            .optional()?
            .is_some();
        if exists {
            Self::write_row(&tx, key, None)?;
        }
        tx.commit()?;
        Ok(exists)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        // IMMEDIATE takes the write lock up front so no other process can write
        // between the comparison and the swap.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        if current.as_deref() != expected {
            return Ok(false);
        }
        if current.is_some() || new.is_some() {
            Self::write_row(&tx, key, new)?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT key FROM records WHERE substr(key, 1, ?1) = ?2 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix.chars().count() as i64, prefix], |row| {
            row.get(0)
        })?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn watch(&self) -> ChangeFeed {
        self.watchers.subscribe()
    }
}

/// Tails the `changes` log on a dedicated thread.
struct ChangePoller {
    conn: Connection,
    path: PathBuf,
    last_seq: i64,
    watchers: Arc<Watchers>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
}

impl ChangePoller {
    fn run(mut self) {
        let mut polls: u32 = 0;
        while !self.shutdown.load(Ordering::SeqCst) {
            std::thread::sleep(self.interval);

            if let Err(e) = self.poll_once() {
                warn!("Change poll failed for {}: {}", self.path.display(), e);
            }

            polls = polls.wrapping_add(1);
            if polls % SqliteConfig::PRUNE_EVERY_POLLS == 0 {
                if let Err(e) = self.prune() {
                    warn!("Change log prune failed for {}: {}", self.path.display(), e);
                }
            }
        }
        debug!("Change poller for {} stopped", self.path.display());
    }

    fn poll_once(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT seq, key, value FROM changes WHERE seq > ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![self.last_seq], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        for row in rows {
            let (seq, key, value) = row?;
            self.last_seq = seq;
            self.watchers.notify(StoreChange { key, value });
        }
        Ok(())
    }

    fn prune(&self) -> Result<usize> {
        let retention = chrono::Duration::from_std(SqliteConfig::CHANGE_RETENTION)
            .map_err(|e| HubShareError::Other(e.to_string()))?;
        let cutoff = (Utc::now() - retention).to_rfc3339();
        let removed = self
            .conn
            .execute("DELETE FROM changes WHERE written_at < ?1", params![cutoff])?;
        if removed > 0 {
            debug!("Pruned {} change log rows", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test-store.db");
        let store = SqliteStore::open_with_interval(&db_path, Duration::from_millis(5)).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_set_get_remove() {
        let (store, _temp_dir) = create_test_store();

        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));

        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));

        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_compare_and_swap() {
        let (store, _temp_dir) = create_test_store();

        assert!(store.compare_and_swap("k", None, Some("v1")).unwrap());
        assert!(!store.compare_and_swap("k", Some("other"), Some("v2")).unwrap());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v1"));
        assert!(store.compare_and_swap("k", Some("v1"), None).unwrap());
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn test_keys_with_prefix() {
        let (store, _temp_dir) = create_test_store();
        store.set("sub/echo", "x").unwrap();
        store.set("sub/chat", "x").unwrap();
        store.set("state", "x").unwrap();

        assert_eq!(
            store.keys_with_prefix("sub/").unwrap(),
            vec!["sub/chat".to_string(), "sub/echo".to_string()]
        );
    }

    #[tokio::test]
    async fn test_two_stores_same_db_see_each_others_changes() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("shared.db");

        let writer = SqliteStore::open_with_interval(&db_path, Duration::from_millis(5)).unwrap();
        let reader = SqliteStore::open_with_interval(&db_path, Duration::from_millis(5)).unwrap();
        let mut rx = reader.watch();

        writer.set("bus", "first").unwrap();
        writer.set("bus", "second").unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.value.as_deref(), Some("first"));
        assert_eq!(second.value.as_deref(), Some("second"));
        assert_eq!(reader.get("bus").unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_reopen_does_not_replay_old_changes() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("shared.db");

        let first = SqliteStore::open_with_interval(&db_path, Duration::from_millis(5)).unwrap();
        first.set("old", "value").unwrap();

        let second = SqliteStore::open_with_interval(&db_path, Duration::from_millis(5)).unwrap();
        let mut rx = second.watch();
        first.set("new", "value").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.key, "new");
    }

    #[tokio::test]
    async fn test_watcher_receives_burst_larger_than_one_poll() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("shared.db");

        let writer = SqliteStore::open_with_interval(&db_path, Duration::from_millis(5)).unwrap();
        let reader = SqliteStore::open_with_interval(&db_path, Duration::from_millis(5)).unwrap();
        let mut rx = reader.watch();

        for n in 0..2000 {
            writer.set("bus", &n.to_string()).unwrap();
        }

        for n in 0..2000 {
            let change = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(change.value, Some(n.to_string()));
        }
    }
}

//! Simulated processes sharing one in-memory world.

use super::traits::{LivenessOracle, ProcessLifecycle, TerminateHook};
use crate::types::ProcessId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// Registry of simulated processes; doubles as their liveness oracle.
pub struct ProcessTable {
    alive: Mutex<HashSet<ProcessId>>,
    next_id: AtomicU64,
    ready: watch::Sender<bool>,
}

impl ProcessTable {
    /// Create a table whose liveness answers are immediately ready.
    pub fn new() -> Arc<Self> {
        let table = Self::new_unready();
        table.mark_ready();
        table
    }

    /// Create a table whose `ready()` blocks until [`ProcessTable::mark_ready`].
    pub fn new_unready() -> Arc<Self> {
        let (ready, _) = watch::channel(false);
        Arc::new(Self {
            alive: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            ready,
        })
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    /// Start a new simulated process.
    pub fn spawn(self: &Arc<Self>) -> SimProcess {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = ProcessId::new(format!("sim-{}", n));
        if let Ok(mut alive) = self.alive.lock() {
            alive.insert(id.clone());
        }
        SimProcess {
            inner: Arc::new(SimProcessInner {
                id,
                table: self.clone(),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Mark a process dead without running its hooks (a crash).
    pub fn kill(&self, process: &ProcessId) {
        if let Ok(mut alive) = self.alive.lock() {
            alive.remove(process);
        }
    }
}

#[async_trait::async_trait]
impl LivenessOracle for ProcessTable {
    async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn is_alive(&self, process: &ProcessId) -> bool {
        self.alive
            .lock()
            .map(|alive| alive.contains(process))
            .unwrap_or(false)
    }
}

/// Handle to one simulated process.
#[derive(Clone)]
pub struct SimProcess {
    inner: Arc<SimProcessInner>,
}

struct SimProcessInner {
    id: ProcessId,
    table: Arc<ProcessTable>,
    hooks: Mutex<Vec<TerminateHook>>,
}

impl SimProcess {
    pub fn id(&self) -> &ProcessId {
        &self.inner.id
    }

    pub fn table(&self) -> &Arc<ProcessTable> {
        &self.inner.table
    }

    /// Run the termination hooks, then mark the process dead.
    pub async fn terminate(&self) {
        let hooks: Vec<TerminateHook> = match self.inner.hooks.lock() {
            Ok(mut hooks) => hooks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        debug!("Terminating {} ({} hooks)", self.inner.id, hooks.len());
        for hook in hooks {
            hook().await;
        }
        self.inner.table.kill(&self.inner.id);
    }

    /// Mark the process dead without running hooks.
    pub fn crash(&self) {
        self.inner.table.kill(&self.inner.id);
    }
}

#[async_trait::async_trait]
impl LivenessOracle for SimProcess {
    async fn ready(&self) {
        self.inner.table.ready().await;
    }

    fn is_alive(&self, process: &ProcessId) -> bool {
        self.inner.table.is_alive(process)
    }
}

impl ProcessLifecycle for SimProcess {
    fn process_id(&self) -> ProcessId {
        self.inner.id.clone()
    }

    fn on_terminate(&self, hook: TerminateHook) {
        if let Ok(mut hooks) = self.inner.hooks.lock() {
            hooks.push(hook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_spawned_processes_are_alive_until_terminated() {
        let table = ProcessTable::new();
        let a = table.spawn();
        let b = table.spawn();
        assert_ne!(a.id(), b.id());
        assert!(table.is_alive(a.id()));

        a.terminate().await;
        assert!(!table.is_alive(a.id()));
        assert!(table.is_alive(b.id()));
    }

    #[tokio::test]
    async fn test_terminate_runs_hooks_once() {
        let table = ProcessTable::new();
        let process = table.spawn();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        process.on_terminate(Box::new(move || {
            async move {
                flag.store(true, Ordering::SeqCst);
            }
            .boxed()
        }));

        process.terminate().await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_crash_skips_hooks() {
        let table = ProcessTable::new();
        let process = table.spawn();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        process.on_terminate(Box::new(move || {
            async move {
                flag.store(true, Ordering::SeqCst);
            }
            .boxed()
        }));

        process.crash();
        assert!(!process.is_alive(process.id()));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_ready_waits_for_mark_ready() {
        let table = ProcessTable::new_unready();
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.ready().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        table.mark_ready();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Lock service trait and guard type.

use crate::error::Result;

/// Proof of holding a named lock; dropping it releases the lock.
pub struct LockGuard {
    name: String,
    _held: Box<dyn Send + Sync>,
}

impl LockGuard {
    /// Wrap whatever keeps the lock held (a file handle, a table entry guard).
    pub fn new(name: impl Into<String>, held: impl Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            _held: Box::new(held),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

/// Named mutual exclusion visible to every participating process.
#[async_trait::async_trait]
pub trait LockService: Send + Sync {
    /// Take the lock if nobody holds it. Returns `None` when it is held elsewhere.
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>>;

    /// Wait until the lock can be taken.
    async fn acquire(&self, name: &str) -> Result<LockGuard>;
}

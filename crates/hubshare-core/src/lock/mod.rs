//! Cross-process mutual exclusion.
//!
//! A lock is held for as long as its [`LockGuard`] lives and is released
//! automatically when the holding process terminates.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileLockService;
pub use memory::{MemoryLockService, MemoryLockTable};
pub use traits::{LockGuard, LockService};

//! Shared key-value store visible to every participating process.
//!
//! Records written here are last-writer-wins; writers that race on an
//! election-sensitive record serialize through a named lock, and additive
//! updates go through `update_with_retry`.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{update_with_retry, ChangeFeed, SharedStore, StoreChange, Watchers};

//! HubShare Core - share one duplex realtime connection between processes.
//!
//! Many cooperating processes (tabs, workers, CLI instances) join a single
//! logical connection. One of them wins an election and owns the real
//! transport; every other process invokes server methods and receives pushed
//! notifications through the owner, coordinated over a shared record store.
//!
//! # Example
//!
//! ```rust,ignore
//! use hubshare_core::{ChannelConfig, SharedConnection};
//!
//! let connection = SharedConnection::builder(transport)
//!     .store(store)
//!     .locks(locks)
//!     .process(process)
//!     .build()
//!     .await?;
//!
//! connection.start(None).await?;
//! let echo = connection.channel_proxy(
//!     "echo",
//!     ChannelConfig::new().on("displayMsg", |args| println!("{:?}", args)),
//! )?;
//! echo.server().invoke("send", vec!["hi".into()]).await?;
//! ```

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod lock;
pub mod process;
pub mod proxy;
pub mod replicator;
pub mod resilience;
pub mod role;
pub mod rpc;
pub mod store;
pub mod subscription;
pub mod transport;
pub mod types;

mod api;

// Re-export commonly used types
pub use config::SharedConnectionConfig;
pub use coordinator::StartOutcome;
pub use error::{HubShareError, Result};
pub use lock::{FileLockService, LockGuard, LockService, MemoryLockService, MemoryLockTable};
pub use process::{LivenessOracle, OsProcess, ProcessLifecycle, ProcessTable, SimProcess};
pub use proxy::{ChannelConfig, ChannelProxy, HandlerSlot, ServerStub};
pub use role::Role;
pub use store::{MemoryStore, SharedStore, SqliteStore};
pub use transport::{LoopbackTransport, Transport};
pub use types::{Args, ConnectionEvent, ConnectionState, ProcessId};

// Re-export builder from api module
pub use api::SharedConnectionBuilder;

use coordinator::OwnershipCoordinator;
use std::sync::Arc;

/// One process's handle on the shared connection.
///
/// Whether this process owns the real transport or follows the owner is
/// decided by the first [`SharedConnection::start`] and never changes. The
/// public API is identical in both roles.
pub struct SharedConnection {
    inner: Arc<OwnershipCoordinator>,
}

impl SharedConnection {
    /// Create a builder around the real transport.
    pub fn builder(transport: Arc<dyn Transport>) -> SharedConnectionBuilder {
        SharedConnectionBuilder::new(transport)
    }
}

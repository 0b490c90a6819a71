//! Process identity, liveness and termination hooks.
//!
//! - `traits` - the oracle and lifecycle interfaces consumed by the coordinator
//! - `memory` - simulated processes for tests
//! - `os` - the current operating-system process, liveness by PID

pub mod memory;
pub mod os;
pub mod traits;

pub use memory::{ProcessTable, SimProcess};
pub use os::{is_process_alive, OsProcess};
pub use traits::{LivenessOracle, ProcessLifecycle, TerminateHook};

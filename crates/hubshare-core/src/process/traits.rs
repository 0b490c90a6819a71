//! Liveness and lifecycle traits.

use crate::types::ProcessId;
use futures::future::BoxFuture;

/// Callback run once when the current process terminates.
pub type TerminateHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Answers whether a process id still refers to a running process.
#[async_trait::async_trait]
pub trait LivenessOracle: Send + Sync {
    /// Resolves once liveness answers are trustworthy.
    async fn ready(&self);

    fn is_alive(&self, process: &ProcessId) -> bool;
}

/// Identity of the current process and its termination hooks.
pub trait ProcessLifecycle: Send + Sync {
    /// Stable id assigned once for the lifetime of this process.
    fn process_id(&self) -> ProcessId;

    /// Register a hook to run when this process terminates.
    fn on_terminate(&self, hook: TerminateHook);
}

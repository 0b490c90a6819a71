//! Replicated state and role introspection.

use crate::coordinator::StartOutcome;
use crate::role::Role;
use crate::types::{ConnectionState, ProcessId};
use crate::SharedConnection;

impl SharedConnection {
    /// The owner's connection state; `Disconnected` when no live owner has published one.
    pub fn state(&self) -> ConnectionState {
        self.inner.replicator().state()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.inner.replicator().connection_id()
    }

    pub fn owner_process_id(&self) -> Option<ProcessId> {
        self.inner.replicator().owner_process_id()
    }

    pub fn process_id(&self) -> &ProcessId {
        self.inner.process_id()
    }

    pub fn role(&self) -> Role {
        self.inner.role()
    }

    /// Returns true if this process owns the real connection.
    pub fn is_owner(&self) -> bool {
        self.inner.role() == Role::Owner
    }

    /// Last start outcome observed by this process.
    pub fn start_outcome(&self) -> StartOutcome {
        self.inner.outcome()
    }
}

//! Process role, decided once per lifetime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Role of this process with respect to the real connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Undecided,
    Owner,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Undecided => "undecided",
            Role::Owner => "owner",
            Role::Follower => "follower",
        };
        f.write_str(name)
    }
}

/// Write-once role cell.
pub struct RoleCell {
    tx: watch::Sender<Role>,
    electing: AtomicBool,
}

impl RoleCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Role::Undecided);
        Self {
            tx,
            electing: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> Role {
        *self.tx.borrow()
    }

    pub fn is_owner(&self) -> bool {
        self.get() == Role::Owner
    }

    /// Set the role. Only the first decision sticks; returns whether this one did.
    pub fn decide(&self, role: Role) -> bool {
        if role == Role::Undecided {
            return false;
        }
        self.tx.send_if_modified(|current| {
            if *current == Role::Undecided {
                *current = role;
                true
            } else {
                false
            }
        })
    }

    /// Wait until a role has been decided.
    pub async fn decided(&self) -> Role {
        let mut rx = self.tx.subscribe();
        let decided = rx
            .wait_for(|role| *role != Role::Undecided)
            .await
            .map(|role| *role);
        decided.unwrap_or_else(|_| self.get())
    }

    /// Mark that this process is trying the election lock right now.
    pub fn begin_election(&self) {
        self.electing.store(true, Ordering::SeqCst);
    }

    pub fn end_election(&self) {
        self.electing.store(false, Ordering::SeqCst);
    }

    /// Whether a decision may be imminent: undecided and inside the election.
    pub fn is_electing(&self) -> bool {
        self.electing.load(Ordering::SeqCst) && self.get() == Role::Undecided
    }
}

impl Default for RoleCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_role_is_decided_once() {
        let cell = RoleCell::new();
        assert_eq!(cell.get(), Role::Undecided);
        assert!(cell.decide(Role::Follower));
        assert!(!cell.decide(Role::Owner));
        assert_eq!(cell.get(), Role::Follower);
        assert!(!cell.is_owner());
    }

    #[tokio::test]
    async fn test_decided_waits_for_decision() {
        let cell = Arc::new(RoleCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.decided().await })
        };
        tokio::task::yield_now().await;
        cell.decide(Role::Owner);

        let role = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(role, Role::Owner);
    }

    #[tokio::test]
    async fn test_decided_returns_immediately_once_decided() {
        let cell = RoleCell::new();
        cell.decide(Role::Follower);
        let role = tokio::time::timeout(Duration::from_millis(50), cell.decided())
            .await
            .unwrap();
        assert_eq!(role, Role::Follower);
    }

    #[test]
    fn test_electing_only_while_undecided() {
        let cell = RoleCell::new();
        assert!(!cell.is_electing());
        cell.begin_election();
        assert!(cell.is_electing());
        cell.decide(Role::Owner);
        assert!(!cell.is_electing());
        cell.end_election();
        assert!(!cell.is_electing());
    }
}

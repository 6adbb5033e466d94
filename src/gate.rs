//! Authorization gate
//!
//! Answers "what role does this address hold" from the ledger, and keeps a
//! local mirror of role assignments for listing and statistics.
//!
//! ## Mirror updates
//!
//! The mirror is written from three places:
//! - `bootstrap()` seeds the ledger owner as Admin
//! - `assign_role()` writes after the ledger transaction succeeds
//! - the role listener applies `RoleAssigned` notifications
//!
//! Every write is stamped with a sequence number. Notifications arrive in
//! ledger order and always win. A direct write from `bootstrap()` or
//! `assign_role()` records the sequence observed before its ledger call and
//! is dropped if a notification has landed on the same address since then,
//! because that notification may describe a later ledger transaction.
//!
//! ## Failing closed
//!
//! If the ledger cannot answer a role lookup the address is treated as
//! `User`. Permission checks therefore never grant more than the least
//! privileged role on error.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::ledger::{bounded, Ledger, RoleAssigned};
use crate::model::{Address, Role};

/// Role assignment as held in the mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRole {
    pub address: Address,
    pub role: Role,
}

/// Role counts from the mirror snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleCounts {
    pub admins: u64,
    pub managers: u64,
    pub users: u64,
}

/// Which path produced a mirror entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MirrorSource {
    Direct,
    Notification,
}

#[derive(Debug, Clone, Copy)]
struct MirrorEntry {
    role: Role,
    seq: u64,
    source: MirrorSource,
}

pub struct AuthorizationGate {
    ledger: Arc<dyn Ledger>,
    mirror: DashMap<Address, MirrorEntry>,
    seq: AtomicU64,
    ledger_timeout: Duration,
}

impl AuthorizationGate {
    pub fn new(ledger: Arc<dyn Ledger>, ledger_timeout: Duration) -> Self {
        Self {
            ledger,
            mirror: DashMap::new(),
            seq: AtomicU64::new(0),
            ledger_timeout,
        }
    }

    /// Seed the mirror with the ledger owner as Admin.
    pub async fn bootstrap(&self) -> Result<Address, RegistryError> {
        let since = self.current_seq();
        let owner = bounded(self.ledger_timeout, "ownerOf", None, self.ledger.owner_of()).await?;
        self.apply_direct(&owner, Role::Admin, since);
        info!(owner = %owner, "Role mirror bootstrapped");
        Ok(owner)
    }

    /// Role of `address` according to the ledger; `User` if the ledger
    /// cannot be reached.
    pub async fn role_of(&self, address: &Address) -> Role {
        match tokio::time::timeout(self.ledger_timeout, self.ledger.role_of(address)).await {
            Ok(Ok(role)) => role,
            Ok(Err(e)) => {
                warn!(address = %address, error = %e, "Role lookup failed, treating as User");
                Role::User
            }
            Err(_) => {
                warn!(address = %address, "Role lookup timed out, treating as User");
                Role::User
            }
        }
    }

    pub async fn can_register(&self, address: &Address) -> bool {
        self.role_of(address).await.can_register()
    }

    pub async fn is_admin(&self, address: &Address) -> bool {
        self.role_of(address).await == Role::Admin
    }

    /// Assign `role` to `target`. Only Admins may call this.
    pub async fn assign_role(
        &self,
        admin: &Address,
        target: &Address,
        role: Role,
    ) -> Result<(), RegistryError> {
        if !self.is_admin(admin).await {
            return Err(RegistryError::Unauthorized(format!(
                "{} is not an Admin",
                admin
            )));
        }

        let since = self.current_seq();
        bounded(
            self.ledger_timeout,
            "assignRole",
            None,
            self.ledger.assign_role(admin, target, role),
        )
        .await?;

        // Mirror the assignment even if the notification is never seen.
        self.apply_direct(target, role, since);
        info!(admin = %admin, address = %target, role = %role, "Role assigned");
        Ok(())
    }

    fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply a ledger role notification to the mirror.
    pub fn apply(&self, address: &Address, role: Role) {
        let entry = MirrorEntry {
            role,
            seq: self.next_seq(),
            source: MirrorSource::Notification,
        };
        let previous = self.mirror.insert(address.clone(), entry).map(|e| e.role);
        if previous != Some(role) {
            debug!(address = %address, role = %role, ?previous, "Mirror updated");
        }
    }

    /// Write an assignment made through this gate.
    ///
    /// `since` is the sequence observed before the ledger call. Returns
    /// `false` if a notification applied after that point already owns the
    /// entry.
    fn apply_direct(&self, address: &Address, role: Role, since: u64) -> bool {
        let mut slot = self.mirror.entry(address.clone()).or_insert(MirrorEntry {
            role,
            seq: 0,
            source: MirrorSource::Direct,
        });
        if slot.source == MirrorSource::Notification && slot.seq > since {
            debug!(
                address = %address,
                role = %role,
                mirrored = %slot.role,
                "Newer notification already mirrored, skipping direct write"
            );
            return false;
        }
        *slot = MirrorEntry {
            role,
            seq: self.next_seq(),
            source: MirrorSource::Direct,
        };
        true
    }

    /// Mirrored role, if any assignment has been seen for `address`.
    pub fn mirrored_role(&self, address: &Address) -> Option<Role> {
        self.mirror.get(address).map(|e| e.role)
    }

    /// Snapshot of the mirror, sorted by address
    pub fn users(&self) -> Vec<UserRole> {
        let mut users: Vec<UserRole> = self
            .mirror
            .iter()
            .map(|entry| UserRole {
                address: entry.key().clone(),
                role: entry.value().role,
            })
            .collect();
        users.sort_by(|a, b| a.address.cmp(&b.address));
        users
    }

    /// Present-state tally of mirrored roles
    pub fn role_counts(&self) -> RoleCounts {
        let mut counts = RoleCounts::default();
        for entry in self.mirror.iter() {
            match entry.value().role {
                Role::Admin => counts.admins += 1,
                Role::Manager => counts.managers += 1,
                Role::User => counts.users += 1,
            }
        }
        counts
    }
}

/// Spawn a task applying ledger role notifications to the gate's mirror.
///
/// Runs until the notification channel closes.
pub fn spawn_role_listener(
    gate: Arc<AuthorizationGate>,
    mut receiver: broadcast::Receiver<RoleAssigned>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => gate.apply(&event.address, event.role),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Role listener lagged, mirror may be stale");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Role notification channel closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn gate() -> (Arc<MemoryLedger>, AuthorizationGate) {
        let ledger = Arc::new(MemoryLedger::new(addr("0xowner")));
        let gate = AuthorizationGate::new(ledger.clone(), Duration::from_secs(5));
        (ledger, gate)
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_owner_as_admin() {
        let (_, gate) = gate();
        let owner = gate.bootstrap().await.unwrap();
        assert_eq!(owner, addr("0xowner"));
        assert_eq!(gate.mirrored_role(&owner), Some(Role::Admin));
        assert_eq!(gate.role_of(&owner).await, Role::Admin);
    }

    #[tokio::test]
    async fn test_unassigned_address_is_user() {
        let (_, gate) = gate();
        let stranger = addr("0xstranger");
        assert_eq!(gate.role_of(&stranger).await, Role::User);
        assert!(!gate.can_register(&stranger).await);
        assert!(!gate.is_admin(&stranger).await);
    }

    #[tokio::test]
    async fn test_only_admin_assigns_roles() {
        let (_, gate) = gate();
        let err = gate
            .assign_role(&addr("0xstranger"), &addr("0xm"), Role::Manager)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized(_)));
        assert_eq!(gate.mirrored_role(&addr("0xm")), None);

        gate.assign_role(&addr("0xowner"), &addr("0xm"), Role::Manager)
            .await
            .unwrap();
        assert_eq!(gate.mirrored_role(&addr("0xm")), Some(Role::Manager));
        assert!(gate.can_register(&addr("0xm")).await);
    }

    #[tokio::test]
    async fn test_listener_applies_notifications() {
        let (ledger, gate) = gate();
        let gate = Arc::new(gate);
        let handle = spawn_role_listener(gate.clone(), ledger.subscribe_roles());

        // Assign directly on the ledger, bypassing the gate's write path.
        ledger
            .assign_role(&addr("0xowner"), &addr("0xu"), Role::Manager)
            .await
            .unwrap();

        for _ in 0..50 {
            if gate.mirrored_role(&addr("0xu")) == Some(Role::Manager) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gate.mirrored_role(&addr("0xu")), Some(Role::Manager));
        handle.abort();
    }

    #[test]
    fn test_direct_write_yields_to_newer_notification() {
        let (_, gate) = gate();
        let target = addr("0xa");

        let since = gate.current_seq();
        // Ledger notification for a later transaction lands first.
        gate.apply(&target, Role::User);
        assert!(!gate.apply_direct(&target, Role::Manager, since));
        assert_eq!(gate.mirrored_role(&target), Some(Role::User));

        // A notification older than the direct write does not block it.
        let since = gate.current_seq();
        assert!(gate.apply_direct(&target, Role::Manager, since));
        assert_eq!(gate.mirrored_role(&target), Some(Role::Manager));

        // Later notifications always win.
        gate.apply(&target, Role::User);
        assert_eq!(gate.mirrored_role(&target), Some(Role::User));
    }

    #[test]
    fn test_duplicate_apply_is_idempotent() {
        let (_, gate) = gate();
        gate.apply(&addr("0xa"), Role::Manager);
        gate.apply(&addr("0xa"), Role::Manager);
        gate.apply(&addr("0xb"), Role::User);
        assert_eq!(
            gate.role_counts(),
            RoleCounts {
                admins: 0,
                managers: 1,
                users: 1
            }
        );
        assert_eq!(gate.users().len(), 2);
    }
}

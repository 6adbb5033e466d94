//! In-process ledger
//!
//! Holds the full authoritative state in memory and applies the same access
//! rules a deployed registry contract would. Used by `--dev-ledger` and by
//! tests. Unlike most deployed ledgers it keeps typed lifecycle events, so
//! history reconstruction over it is exact.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{Ledger, LedgerError, LedgerEvent, LedgerResult, RoleAssigned};
use crate::fingerprint::Fingerprint;
use crate::model::{Address, Role};

/// Notification buffer per subscriber
const ROLE_CHANNEL_CAPACITY: usize = 256;

struct ProductState {
    owner: Address,
    added_at: u64,
    valid: bool,
    events: Vec<LedgerEvent>,
}

struct State {
    roles: HashMap<Address, Role>,
    products: HashMap<Fingerprint, ProductState>,
    last_timestamp: u64,
}

impl State {
    /// Wall clock, clamped so event timestamps never go backwards
    fn tick(&mut self) -> u64 {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_timestamp = self.last_timestamp.max(now);
        self.last_timestamp
    }

    fn role(&self, owner: &Address, address: &Address) -> Role {
        if address == owner {
            return Role::Admin;
        }
        self.roles.get(address).copied().unwrap_or_default()
    }
}

/// Ledger kept entirely in process memory.
pub struct MemoryLedger {
    owner: Address,
    state: RwLock<State>,
    roles_tx: broadcast::Sender<RoleAssigned>,
}

impl MemoryLedger {
    /// Create a ledger owned (and administered) by `owner`.
    pub fn new(owner: Address) -> Self {
        let (roles_tx, _) = broadcast::channel(ROLE_CHANNEL_CAPACITY);
        let mut roles = HashMap::new();
        roles.insert(owner.clone(), Role::Admin);
        Self {
            owner,
            state: RwLock::new(State {
                roles,
                products: HashMap::new(),
                last_timestamp: 0,
            }),
            roles_tx,
        }
    }

    fn require_role(state: &State, owner: &Address, caller: &Address, allowed: &[Role]) -> LedgerResult<()> {
        let role = state.role(owner, caller);
        if allowed.contains(&role) {
            Ok(())
        } else {
            Err(LedgerError::Rejected(format!(
                "{} has role {}, requires one of {:?}",
                caller, role, allowed
            )))
        }
    }

    fn unknown(hash: &Fingerprint) -> LedgerError {
        LedgerError::Rejected(format!("product {} does not exist", hash))
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn owner_of(&self) -> LedgerResult<Address> {
        Ok(self.owner.clone())
    }

    async fn role_of(&self, address: &Address) -> LedgerResult<Role> {
        Ok(self.state.read().await.role(&self.owner, address))
    }

    async fn assign_role(
        &self,
        caller: &Address,
        address: &Address,
        role: Role,
    ) -> LedgerResult<()> {
        {
            let mut state = self.state.write().await;
            Self::require_role(&state, &self.owner, caller, &[Role::Admin])?;
            if address == &self.owner && role != Role::Admin {
                return Err(LedgerError::Rejected("cannot demote the ledger owner".into()));
            }
            state.roles.insert(address.clone(), role);
        }
        debug!(address = %address, role = %role, "Role assigned");
        // No subscribers is fine.
        let _ = self.roles_tx.send(RoleAssigned {
            address: address.clone(),
            role,
        });
        Ok(())
    }

    async fn add_hash(&self, caller: &Address, hash: &Fingerprint) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        Self::require_role(&state, &self.owner, caller, &[Role::Admin, Role::Manager])?;
        if state.products.contains_key(hash) {
            return Err(LedgerError::Rejected(format!("product {} already exists", hash)));
        }
        let now = state.tick();
        state.products.insert(
            hash.clone(),
            ProductState {
                owner: caller.clone(),
                added_at: now,
                valid: true,
                events: vec![LedgerEvent::Registered {
                    timestamp: now,
                    by: caller.clone(),
                }],
            },
        );
        Ok(())
    }

    async fn bulk_add_hashes(
        &self,
        caller: &Address,
        hashes: &[Fingerprint],
    ) -> LedgerResult<Vec<Fingerprint>> {
        let mut state = self.state.write().await;
        Self::require_role(&state, &self.owner, caller, &[Role::Admin, Role::Manager])?;
        let now = state.tick();
        let mut added = Vec::new();
        for hash in hashes {
            if state.products.contains_key(hash) {
                continue;
            }
            state.products.insert(
                hash.clone(),
                ProductState {
                    owner: caller.clone(),
                    added_at: now,
                    valid: true,
                    events: vec![LedgerEvent::Registered {
                        timestamp: now,
                        by: caller.clone(),
                    }],
                },
            );
            added.push(hash.clone());
        }
        Ok(added)
    }

    async fn verify(&self, hash: &Fingerprint) -> LedgerResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .products
            .get(hash)
            .map(|p| p.valid)
            .unwrap_or(false))
    }

    async fn owner_of_product(&self, hash: &Fingerprint) -> LedgerResult<Option<Address>> {
        Ok(self
            .state
            .read()
            .await
            .products
            .get(hash)
            .map(|p| p.owner.clone()))
    }

    async fn addition_time_of(&self, hash: &Fingerprint) -> LedgerResult<Option<u64>> {
        Ok(self.state.read().await.products.get(hash).map(|p| p.added_at))
    }

    async fn history_of(&self, hash: &Fingerprint) -> LedgerResult<Vec<u64>> {
        Ok(self
            .state
            .read()
            .await
            .products
            .get(hash)
            .map(|p| p.events.iter().map(LedgerEvent::timestamp).collect())
            .unwrap_or_default())
    }

    async fn typed_history_of(&self, hash: &Fingerprint) -> LedgerResult<Vec<LedgerEvent>> {
        Ok(self
            .state
            .read()
            .await
            .products
            .get(hash)
            .map(|p| p.events.clone())
            .unwrap_or_default())
    }

    async fn transfer_ownership(
        &self,
        caller: &Address,
        hash: &Fingerprint,
        new_owner: &Address,
    ) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        let now = state.tick();
        let product = state.products.get_mut(hash).ok_or_else(|| Self::unknown(hash))?;
        if &product.owner != caller {
            return Err(LedgerError::Rejected(format!(
                "{} is not the owner of {}",
                caller, hash
            )));
        }
        product.events.push(LedgerEvent::OwnershipTransferred {
            timestamp: now,
            from: product.owner.clone(),
            to: new_owner.clone(),
        });
        product.owner = new_owner.clone();
        Ok(())
    }

    async fn set_validity(
        &self,
        caller: &Address,
        hash: &Fingerprint,
        valid: bool,
    ) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        Self::require_role(&state, &self.owner, caller, &[Role::Admin])?;
        let now = state.tick();
        let product = state.products.get_mut(hash).ok_or_else(|| Self::unknown(hash))?;
        product.valid = valid;
        product.events.push(LedgerEvent::ValidityChanged {
            timestamp: now,
            valid,
        });
        Ok(())
    }

    async fn remove_product(&self, caller: &Address, hash: &Fingerprint) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        Self::require_role(&state, &self.owner, caller, &[Role::Admin])?;
        state
            .products
            .remove(hash)
            .map(|_| ())
            .ok_or_else(|| Self::unknown(hash))
    }

    async fn products_of(&self, address: &Address) -> LedgerResult<Vec<Fingerprint>> {
        let state = self.state.read().await;
        let mut owned: Vec<Fingerprint> = state
            .products
            .iter()
            .filter(|(_, p)| &p.owner == address)
            .map(|(hash, _)| hash.clone())
            .collect();
        owned.sort();
        Ok(owned)
    }

    async fn total_product_count(&self) -> LedgerResult<u64> {
        Ok(self.state.read().await.products.len() as u64)
    }

    fn subscribe_roles(&self) -> broadcast::Receiver<RoleAssigned> {
        self.roles_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::model::ProductMetadata;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn hash(name: &str) -> Fingerprint {
        fingerprint(&ProductMetadata::new(name, "B1"))
    }

    #[tokio::test]
    async fn test_owner_is_admin_others_default_to_user() {
        let ledger = MemoryLedger::new(addr("0xowner"));
        assert_eq!(ledger.role_of(&addr("0xowner")).await.unwrap(), Role::Admin);
        assert_eq!(ledger.role_of(&addr("0xnobody")).await.unwrap(), Role::User);
    }

    #[tokio::test]
    async fn test_add_hash_requires_registrar_role() {
        let ledger = MemoryLedger::new(addr("0xowner"));
        let err = ledger.add_hash(&addr("0xuser"), &hash("Widget")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
        assert_eq!(ledger.total_product_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_add_is_rejected_bulk_skips() {
        let ledger = MemoryLedger::new(addr("0xowner"));
        let owner = addr("0xowner");
        ledger.add_hash(&owner, &hash("Widget")).await.unwrap();
        assert!(ledger.add_hash(&owner, &hash("Widget")).await.is_err());

        let added = ledger
            .bulk_add_hashes(&owner, &[hash("Widget"), hash("Gadget")])
            .await
            .unwrap();
        assert_eq!(added, vec![hash("Gadget")]);
    }

    #[tokio::test]
    async fn test_events_are_recorded_in_order() {
        let ledger = MemoryLedger::new(addr("0xowner"));
        let owner = addr("0xowner");
        let h = hash("Widget");
        ledger.add_hash(&owner, &h).await.unwrap();
        ledger.set_validity(&owner, &h, false).await.unwrap();
        ledger.transfer_ownership(&owner, &h, &addr("0xbuyer")).await.unwrap();

        let events = ledger.typed_history_of(&h).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], LedgerEvent::Registered { .. }));
        assert!(matches!(events[1], LedgerEvent::ValidityChanged { valid: false, .. }));
        assert!(matches!(events[2], LedgerEvent::OwnershipTransferred { .. }));

        let stamps = ledger.history_of(&h).await.unwrap();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(ledger.products_of(&addr("0xbuyer")).await.unwrap(), vec![h]);
    }

    #[tokio::test]
    async fn test_assign_role_broadcasts() {
        let ledger = MemoryLedger::new(addr("0xowner"));
        let mut rx = ledger.subscribe_roles();
        ledger
            .assign_role(&addr("0xowner"), &addr("0xm"), Role::Manager)
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.address, addr("0xm"));
        assert_eq!(event.role, Role::Manager);
    }
}

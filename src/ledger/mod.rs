//! Ledger Connection Module
//!
//! The ledger is the authoritative record of product existence, ownership,
//! validity and role assignments. This crate never looks inside it; it only
//! talks to the small surface defined by [`Ledger`].
//!
//! | Module   | Responsibility                                        |
//! |----------|-------------------------------------------------------|
//! | `rpc`    | JSON-RPC over HTTP to a remote ledger node            |
//! | `stream` | WebSocket subscription for `RoleAssigned` notifications |
//! | `memory` | In-process ledger for development and tests           |
//!
//! Transactions take the submitting principal as `caller`; the ledger enforces
//! its own access rules in addition to the gate in front of it.

mod memory;
mod rpc;
mod stream;

pub use memory::MemoryLedger;
pub use rpc::{RpcLedger, RpcLedgerConfig};
pub use stream::EventStreamConfig;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::error::RegistryError;
use crate::fingerprint::Fingerprint;
use crate::model::{Address, Role};

/// Errors reported by a ledger implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Transport-level failure; the request may not have been processed
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The ledger processed the request and refused it
    #[error("rejected: {0}")]
    Rejected(String),

    /// The ledger does not implement the requested call
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Role change notification emitted by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssigned {
    pub address: Address,
    pub role: Role,
}

/// Typed lifecycle event, for ledgers that retain per-event detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LedgerEvent {
    Registered {
        timestamp: u64,
        by: Address,
    },
    #[serde(rename_all = "camelCase")]
    OwnershipTransferred {
        timestamp: u64,
        from: Address,
        to: Address,
    },
    ValidityChanged {
        timestamp: u64,
        valid: bool,
    },
}

impl LedgerEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            LedgerEvent::Registered { timestamp, .. }
            | LedgerEvent::OwnershipTransferred { timestamp, .. }
            | LedgerEvent::ValidityChanged { timestamp, .. } => *timestamp,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Run a ledger call under `timeout`, mapping failures to [`RegistryError`]
/// with the operation and fingerprint attached.
///
/// A timeout drops the call future and surfaces as retryable
/// `LedgerUnavailable`.
pub(crate) async fn bounded<T, F>(
    timeout: Duration,
    operation: &'static str,
    fingerprint: Option<&Fingerprint>,
    call: F,
) -> Result<T, RegistryError>
where
    F: Future<Output = LedgerResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RegistryError::from_ledger(operation, fingerprint, e)),
        Err(_) => Err(RegistryError::LedgerUnavailable {
            operation,
            fingerprint: fingerprint.cloned(),
            reason: format!("timed out after {:?}", timeout),
        }),
    }
}

/// Authoritative ledger surface.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Identity that deployed / owns the registry; always Admin.
    async fn owner_of(&self) -> LedgerResult<Address>;

    /// Role of `address`; unassigned addresses are `User`.
    async fn role_of(&self, address: &Address) -> LedgerResult<Role>;

    async fn assign_role(&self, caller: &Address, address: &Address, role: Role)
        -> LedgerResult<()>;

    /// Record a product hash. Rejected if it already exists.
    async fn add_hash(&self, caller: &Address, hash: &Fingerprint) -> LedgerResult<()>;

    /// Record many hashes in one transaction. Returns the hashes actually
    /// added; hashes already present are skipped.
    async fn bulk_add_hashes(
        &self,
        caller: &Address,
        hashes: &[Fingerprint],
    ) -> LedgerResult<Vec<Fingerprint>>;

    /// True iff the hash exists and is marked valid.
    async fn verify(&self, hash: &Fingerprint) -> LedgerResult<bool>;

    /// Current owner, `None` if the hash is unknown.
    async fn owner_of_product(&self, hash: &Fingerprint) -> LedgerResult<Option<Address>>;

    /// Addition timestamp, `None` if the hash is unknown.
    async fn addition_time_of(&self, hash: &Fingerprint) -> LedgerResult<Option<u64>>;

    /// Raw lifecycle timestamps, earliest first.
    async fn history_of(&self, hash: &Fingerprint) -> LedgerResult<Vec<u64>>;

    /// Typed lifecycle events, earliest first.
    ///
    /// Ledgers that only keep timestamps report `Unsupported`.
    async fn typed_history_of(&self, hash: &Fingerprint) -> LedgerResult<Vec<LedgerEvent>> {
        Err(LedgerError::Unsupported(format!(
            "typed history for {}",
            hash
        )))
    }

    async fn transfer_ownership(
        &self,
        caller: &Address,
        hash: &Fingerprint,
        new_owner: &Address,
    ) -> LedgerResult<()>;

    async fn set_validity(&self, caller: &Address, hash: &Fingerprint, valid: bool)
        -> LedgerResult<()>;

    async fn remove_product(&self, caller: &Address, hash: &Fingerprint) -> LedgerResult<()>;

    /// Hashes currently owned by `address`.
    async fn products_of(&self, address: &Address) -> LedgerResult<Vec<Fingerprint>>;

    async fn total_product_count(&self) -> LedgerResult<u64>;

    /// Subscribe to `RoleAssigned` notifications.
    fn subscribe_roles(&self) -> broadcast::Receiver<RoleAssigned>;
}

//! Registry reconciler
//!
//! Orchestrates every product operation across the ledger (authoritative for
//! existence, ownership and validity) and the local metadata cache
//! (authoritative for descriptive metadata).
//!
//! ## Write ordering
//!
//! There is no transaction spanning cache and ledger. Writes are ordered so
//! that the only possible inconsistency is the harmless one:
//!
//! | Operation      | First            | Then                | On failure of second step          |
//! |----------------|------------------|---------------------|------------------------------------|
//! | register       | cache upsert     | ledger `addHash`    | cached but not on ledger; retry is safe |
//! | bulk register  | ledger bulk add  | cache (accepted only) | reported in `cacheFailed`        |
//! | remove         | ledger remove    | cache remove        | `DanglingCacheEntry` surfaced      |
//! | transfer / set validity | ledger only |                  |                                    |
//!
//! A crash between the two steps of `register` leaves a cache entry whose
//! fingerprint the ledger does not know. Retrying the registration derives
//! the same fingerprint, overwrites that entry with the retrying caller's
//! provenance and completes it. Once the ledger knows a fingerprint its
//! cache entry is never overwritten. `remove` deletes such a leftover entry
//! even though the ledger has nothing to remove.
//!
//! ## Concurrency
//!
//! Mutations of one fingerprint are serialized through [`FingerprintLocks`].
//! Every ledger call is bounded by the configured timeout; the lock guard is
//! released when the operation returns, whether it succeeded, failed or
//! timed out.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, MetadataCache};
use crate::error::{RegistryError, Result};
use crate::events::{EventBus, RegistryEvent};
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::gate::{AuthorizationGate, UserRole};
use crate::history::{self, HistoryEvent};
use crate::ledger::{bounded, Ledger, LedgerError};
use crate::locks::FingerprintLocks;
use crate::model::{Address, ProductMetadata, ProductRecord, Role};
use crate::stats::{self, RegistryStats};

/// Outcome of a single registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Registry key; also the payload to encode in the product's QR code
    pub fingerprint: Fingerprint,
    /// The ledger already knew this fingerprint; nothing was written to it
    pub already_registered: bool,
}

/// Outcome of a bulk registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRegistration {
    /// Distinct fingerprints submitted
    pub submitted: usize,
    pub accepted_count: usize,
    /// Fingerprints newly recorded on the ledger and cached
    pub accepted: Vec<Fingerprint>,
    /// Fingerprints the ledger did not accept (typically already present)
    pub skipped: Vec<Fingerprint>,
    /// Accepted by the ledger but the metadata could not be cached
    pub cache_failed: Vec<Fingerprint>,
}

impl BulkRegistration {
    /// Every accepted fingerprint also reached the cache.
    pub fn is_complete(&self) -> bool {
        self.cache_failed.is_empty()
    }
}

/// Ledger-held lifecycle fields of a product
struct LedgerView {
    added_at: u64,
    valid: bool,
    owner: Address,
}

pub struct Registry {
    ledger: Arc<dyn Ledger>,
    cache: Arc<MetadataCache>,
    gate: Arc<AuthorizationGate>,
    events: Arc<EventBus>,
    locks: FingerprintLocks,
    ledger_timeout: Duration,
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl Registry {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        cache: Arc<MetadataCache>,
        gate: Arc<AuthorizationGate>,
        events: Arc<EventBus>,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            cache,
            gate,
            events,
            locks: FingerprintLocks::new(),
            ledger_timeout,
        }
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a product. Re-registering identical metadata is a no-op.
    pub async fn register(
        &self,
        metadata: ProductMetadata,
        by: &Address,
    ) -> Result<Registration> {
        let metadata = metadata.normalized();
        metadata.validate()?;
        self.require_registrar(by).await?;

        let fp = fingerprint(&metadata);
        let _guard = self.locks.acquire(&fp).await;

        let entry = CacheEntry {
            fingerprint: fp.clone(),
            metadata,
            registered_by: by.clone(),
            registration_time: unix_now(),
        };

        let known = bounded(
            self.ledger_timeout,
            "additionTimeOf",
            Some(&fp),
            self.ledger.addition_time_of(&fp),
        )
        .await?
        .is_some();
        if known {
            // Backfill a missing entry; an existing one keeps its provenance.
            if self.cache.insert_if_absent(&entry)? {
                debug!(fingerprint = %fp, "Backfilled metadata for ledger-known product");
            }
            info!(fingerprint = %fp, by = %by, "Product already registered");
            return Ok(Registration {
                fingerprint: fp,
                already_registered: true,
            });
        }

        self.cache.upsert(&entry)?;
        debug!(fingerprint = %fp, "Staged metadata in cache");

        bounded(
            self.ledger_timeout,
            "addHash",
            Some(&fp),
            self.ledger.add_hash(by, &fp),
        )
        .await?;

        info!(fingerprint = %fp, by = %by, "Product registered");
        self.events.emit(RegistryEvent::ProductRegistered {
            fingerprint: fp.clone(),
            by: by.clone(),
        });

        Ok(Registration {
            fingerprint: fp,
            already_registered: false,
        })
    }

    /// Register many products with one ledger transaction.
    ///
    /// Cache entries are staged and only committed for fingerprints the
    /// ledger accepted. If the ledger call fails nothing is committed. A
    /// cache write that fails after the ledger accepted its fingerprint is
    /// listed in `cache_failed`; the product stays registered.
    pub async fn bulk_register(
        &self,
        items: Vec<ProductMetadata>,
        by: &Address,
    ) -> Result<BulkRegistration> {
        if items.is_empty() {
            return Err(RegistryError::Validation("no products submitted".into()));
        }

        let items: Vec<ProductMetadata> = items.into_iter().map(|m| m.normalized()).collect();
        for (i, item) in items.iter().enumerate() {
            item.validate().map_err(|e| match e {
                RegistryError::Validation(msg) => {
                    RegistryError::Validation(format!("item[{}]: {}", i, msg))
                }
                other => other,
            })?;
        }
        self.require_registrar(by).await?;

        let now = unix_now();
        let mut seen = HashSet::new();
        let mut staged: Vec<CacheEntry> = Vec::with_capacity(items.len());
        for metadata in items {
            let fp = fingerprint(&metadata);
            if seen.insert(fp.clone()) {
                staged.push(CacheEntry {
                    fingerprint: fp,
                    metadata,
                    registered_by: by.clone(),
                    registration_time: now,
                });
            }
        }
        let fingerprints: Vec<Fingerprint> = staged.iter().map(|e| e.fingerprint.clone()).collect();

        let _guards = self.locks.acquire_many(&fingerprints).await;

        let accepted = bounded(
            self.ledger_timeout,
            "bulkAddHashes",
            None,
            self.ledger.bulk_add_hashes(by, &fingerprints),
        )
        .await?;
        let accepted: HashSet<Fingerprint> = accepted.into_iter().collect();

        let mut committed = Vec::with_capacity(accepted.len());
        let mut skipped = Vec::new();
        let mut cache_failed = Vec::new();
        for entry in &staged {
            if !accepted.contains(&entry.fingerprint) {
                skipped.push(entry.fingerprint.clone());
                continue;
            }
            // The ledger write is final; a cache failure only loses metadata.
            if let Err(e) = self.cache.upsert(entry) {
                error!(
                    fingerprint = %entry.fingerprint,
                    error = %e,
                    "Cache write failed after bulk ledger commit"
                );
                cache_failed.push(entry.fingerprint.clone());
            }
            committed.push(entry.fingerprint.clone());
        }

        info!(
            by = %by,
            submitted = fingerprints.len(),
            accepted = committed.len(),
            skipped = skipped.len(),
            cache_failed = cache_failed.len(),
            "Bulk registration committed"
        );
        self.events.emit(RegistryEvent::ProductsBulkRegistered {
            by: by.clone(),
            accepted: committed.clone(),
        });

        Ok(BulkRegistration {
            submitted: fingerprints.len(),
            accepted_count: committed.len(),
            accepted: committed,
            skipped,
            cache_failed,
        })
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Authenticity check. Reads the ledger only; the cache is never consulted.
    pub async fn verify(&self, fp: &Fingerprint) -> Result<bool> {
        bounded(self.ledger_timeout, "verify", Some(fp), self.ledger.verify(fp)).await
    }

    /// Merged record for a product the ledger knows.
    pub async fn get_details(&self, fp: &Fingerprint) -> Result<ProductRecord> {
        let view = self
            .ledger_view(fp)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("product {}", fp)))?;
        let cached = self.cached(fp);
        Ok(Self::merge(fp.clone(), view, cached))
    }

    /// Products currently owned by `address`.
    pub async fn list_for_user(&self, address: &Address) -> Result<Vec<ProductRecord>> {
        let owned = bounded(
            self.ledger_timeout,
            "productsOf",
            None,
            self.ledger.products_of(address),
        )
        .await?;

        let mut records = Vec::with_capacity(owned.len());
        for fp in owned {
            match self.get_details(&fp).await {
                Ok(record) => records.push(record),
                // Removed between the two reads.
                Err(RegistryError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Every cached product the ledger still knows.
    pub async fn list_all(&self) -> Result<Vec<ProductRecord>> {
        let entries = self.cache.list()?;
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.ledger_view(&entry.fingerprint).await? {
                Some(view) => records.push(Self::merge(entry.fingerprint.clone(), view, Some(entry))),
                None => {
                    warn!(fingerprint = %entry.fingerprint, "Cached product unknown to ledger, skipping");
                }
            }
        }
        Ok(records)
    }

    /// Ordered lifecycle timeline for a product.
    pub async fn history(&self, fp: &Fingerprint) -> Result<Vec<HistoryEvent>> {
        self.require_known(fp).await?;

        let ledger = &self.ledger;
        let typed = bounded(self.ledger_timeout, "typedHistoryOf", Some(fp), async move {
            match ledger.typed_history_of(fp).await {
                Ok(events) => Ok(Some(events)),
                Err(LedgerError::Unsupported(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await?;

        if let Some(events) = typed {
            return Ok(history::from_typed(events));
        }

        debug!(fingerprint = %fp, "Typed history unsupported, inferring from timestamps");
        let timestamps = bounded(
            self.ledger_timeout,
            "historyOf",
            Some(fp),
            self.ledger.history_of(fp),
        )
        .await?;
        let registrant = self.cached(fp).map(|e| e.registered_by);
        Ok(history::from_timestamps(&timestamps, registrant))
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        stats::collect(self.ledger.as_ref(), &self.gate, self.ledger_timeout).await
    }

    // =========================================================================
    // Lifecycle Mutations
    // =========================================================================

    /// Move ownership from `from` to `to`. `from` must be the current owner.
    pub async fn transfer_ownership(
        &self,
        fp: &Fingerprint,
        from: &Address,
        to: &Address,
    ) -> Result<()> {
        let _guard = self.locks.acquire(fp).await;

        let owner = bounded(
            self.ledger_timeout,
            "ownerOfProduct",
            Some(fp),
            self.ledger.owner_of_product(fp),
        )
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("product {}", fp)))?;

        if &owner != from {
            return Err(RegistryError::NotOwner {
                fingerprint: fp.clone(),
                caller: from.to_string(),
            });
        }

        bounded(
            self.ledger_timeout,
            "transferOwnership",
            Some(fp),
            self.ledger.transfer_ownership(from, fp, to),
        )
        .await?;

        info!(fingerprint = %fp, from = %from, to = %to, "Ownership transferred");
        self.events.emit(RegistryEvent::OwnershipTransferred {
            fingerprint: fp.clone(),
            from: from.clone(),
            to: to.clone(),
        });
        Ok(())
    }

    /// Mark a product verified or unverified. Admin only.
    pub async fn set_validity(
        &self,
        fp: &Fingerprint,
        valid: bool,
        by: &Address,
    ) -> Result<()> {
        self.require_admin(by).await?;
        let _guard = self.locks.acquire(fp).await;
        self.require_known(fp).await?;

        bounded(
            self.ledger_timeout,
            "setValidity",
            Some(fp),
            self.ledger.set_validity(by, fp, valid),
        )
        .await?;

        info!(fingerprint = %fp, valid, by = %by, "Validity updated");
        self.events.emit(RegistryEvent::ValidityChanged {
            fingerprint: fp.clone(),
            valid,
            by: by.clone(),
        });
        Ok(())
    }

    /// Delete a product from ledger and cache. Admin only.
    ///
    /// A cache entry whose fingerprint the ledger never recorded is deleted
    /// on its own.
    pub async fn remove(&self, fp: &Fingerprint, by: &Address) -> Result<()> {
        self.require_admin(by).await?;
        let _guard = self.locks.acquire(fp).await;

        let on_ledger = bounded(
            self.ledger_timeout,
            "additionTimeOf",
            Some(fp),
            self.ledger.addition_time_of(fp),
        )
        .await?
        .is_some();
        if !on_ledger {
            if !self.cache.remove(fp)? {
                return Err(RegistryError::NotFound(format!("product {}", fp)));
            }
            warn!(fingerprint = %fp, by = %by, "Removed cache entry unknown to ledger");
            self.events.emit(RegistryEvent::ProductRemoved {
                fingerprint: fp.clone(),
                by: by.clone(),
            });
            return Ok(());
        }

        bounded(
            self.ledger_timeout,
            "removeProduct",
            Some(fp),
            self.ledger.remove_product(by, fp),
        )
        .await?;

        if let Err(e) = self.cache.remove(fp) {
            error!(fingerprint = %fp, error = %e, "Product removed from ledger but cache removal failed");
            return Err(RegistryError::DanglingCacheEntry {
                fingerprint: fp.clone(),
                reason: e.to_string(),
            });
        }

        info!(fingerprint = %fp, by = %by, "Product removed");
        self.events.emit(RegistryEvent::ProductRemoved {
            fingerprint: fp.clone(),
            by: by.clone(),
        });
        Ok(())
    }

    // =========================================================================
    // Roles
    // =========================================================================

    pub async fn role_of(&self, address: &Address) -> Role {
        self.gate.role_of(address).await
    }

    pub async fn assign_role(
        &self,
        admin: &Address,
        target: &Address,
        role: Role,
    ) -> Result<()> {
        self.gate.assign_role(admin, target, role).await?;
        self.events.emit(RegistryEvent::RoleAssigned {
            address: target.clone(),
            role,
            by: admin.clone(),
        });
        Ok(())
    }

    pub fn users(&self) -> Vec<UserRole> {
        self.gate.users()
    }

    /// Flush the cache; call before process exit.
    pub fn shutdown(&self) -> Result<()> {
        self.cache.flush()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn require_registrar(&self, by: &Address) -> Result<()> {
        if self.gate.can_register(by).await {
            Ok(())
        } else {
            Err(RegistryError::Unauthorized(format!(
                "{} may not register products",
                by
            )))
        }
    }

    async fn require_admin(&self, by: &Address) -> Result<()> {
        if self.gate.is_admin(by).await {
            Ok(())
        } else {
            Err(RegistryError::Unauthorized(format!("{} is not an Admin", by)))
        }
    }

    async fn require_known(&self, fp: &Fingerprint) -> Result<u64> {
        bounded(
            self.ledger_timeout,
            "additionTimeOf",
            Some(fp),
            self.ledger.addition_time_of(fp),
        )
        .await?
        .ok_or_else(|| RegistryError::NotFound(format!("product {}", fp)))
    }

    /// Ledger lifecycle fields, `None` if the ledger does not know `fp`.
    async fn ledger_view(&self, fp: &Fingerprint) -> Result<Option<LedgerView>> {
        let added_at = bounded(
            self.ledger_timeout,
            "additionTimeOf",
            Some(fp),
            self.ledger.addition_time_of(fp),
        )
        .await?;
        let Some(added_at) = added_at else {
            return Ok(None);
        };

        let (valid, owner) = tokio::try_join!(
            bounded(self.ledger_timeout, "verify", Some(fp), self.ledger.verify(fp)),
            bounded(
                self.ledger_timeout,
                "ownerOfProduct",
                Some(fp),
                self.ledger.owner_of_product(fp),
            ),
        )?;

        Ok(owner.map(|owner| LedgerView {
            added_at,
            valid,
            owner,
        }))
    }

    /// Cache lookup that never fails; read errors count as a miss.
    fn cached(&self, fp: &Fingerprint) -> Option<CacheEntry> {
        match self.cache.get(fp) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(fingerprint = %fp, error = %e, "Cache read failed, using placeholder");
                None
            }
        }
    }

    fn merge(fp: Fingerprint, view: LedgerView, cached: Option<CacheEntry>) -> ProductRecord {
        match cached {
            Some(entry) => ProductRecord {
                fingerprint: fp,
                metadata: entry.metadata,
                placeholder: false,
                registered_by: Some(entry.registered_by),
                registration_time: view.added_at,
                owner: view.owner,
                valid: view.valid,
            },
            None => ProductRecord {
                fingerprint: fp,
                metadata: ProductMetadata::placeholder(),
                placeholder: true,
                registered_by: None,
                registration_time: view.added_at,
                owner: view.owner,
                valid: view.valid,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;

    const OWNER: &str = "0xowner";

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    async fn setup() -> (Arc<MemoryLedger>, Registry) {
        let ledger = Arc::new(MemoryLedger::new(addr(OWNER)));
        let timeout = Duration::from_secs(5);
        let gate = Arc::new(AuthorizationGate::new(ledger.clone(), timeout));
        gate.bootstrap().await.unwrap();
        let registry = Registry::new(
            ledger.clone(),
            Arc::new(MetadataCache::temporary().unwrap()),
            gate,
            Arc::new(EventBus::new()),
            timeout,
        );
        (ledger, registry)
    }

    #[tokio::test]
    async fn test_register_verify_details() {
        let (_, registry) = setup().await;
        let reg = registry
            .register(ProductMetadata::new("Widget", "B1"), &addr(OWNER))
            .await
            .unwrap();
        assert!(!reg.already_registered);
        assert!(registry.verify(&reg.fingerprint).await.unwrap());

        let record = registry.get_details(&reg.fingerprint).await.unwrap();
        assert_eq!(record.metadata, ProductMetadata::new("Widget", "B1"));
        assert!(record.valid);
        assert!(!record.placeholder);
        assert_eq!(record.owner, addr(OWNER));
        assert_eq!(record.registered_by, Some(addr(OWNER)));
    }

    #[tokio::test]
    async fn test_user_cannot_register() {
        let (ledger, registry) = setup().await;
        let err = registry
            .register(ProductMetadata::new("Widget", "B1"), &addr("0xuser"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized(_)));
        assert!(registry.cache().is_empty());
        assert_eq!(ledger.total_product_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_fields_rejected_before_ledger() {
        let (ledger, registry) = setup().await;
        let err = registry
            .register(ProductMetadata::new("Widget", ""), &addr(OWNER))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
        assert_eq!(ledger.total_product_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (ledger, registry) = setup().await;
        let first = registry
            .register(ProductMetadata::new("Widget", "B1"), &addr(OWNER))
            .await
            .unwrap();
        let second = registry
            .register(ProductMetadata::new("Widget", "B1"), &addr(OWNER))
            .await
            .unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(second.already_registered);
        assert_eq!(ledger.total_product_count().await.unwrap(), 1);
        assert_eq!(registry.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_placeholder_when_cache_missing() {
        let (ledger, registry) = setup().await;
        let fp = fingerprint(&ProductMetadata::new("Ghost", "B0"));
        ledger.add_hash(&addr(OWNER), &fp).await.unwrap();

        let record = registry.get_details(&fp).await.unwrap();
        assert!(record.placeholder);
        assert!(record.valid);
        assert_eq!(record.registered_by, None);
    }

    #[tokio::test]
    async fn test_unknown_fingerprint() {
        let (_, registry) = setup().await;
        let fp = fingerprint(&ProductMetadata::new("Nothing", "B0"));
        assert!(!registry.verify(&fp).await.unwrap());
        assert!(matches!(
            registry.get_details(&fp).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.history(&fp).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bulk_register_reports_accepted_count() {
        let (_, registry) = setup().await;
        registry
            .register(ProductMetadata::new("Widget", "B1"), &addr(OWNER))
            .await
            .unwrap();

        let result = registry
            .bulk_register(
                vec![
                    ProductMetadata::new("Widget", "B1"),
                    ProductMetadata::new("Gadget", "B1"),
                    ProductMetadata::new("Gizmo", "B1"),
                    ProductMetadata::new("Gizmo", "B1"),
                ],
                &addr(OWNER),
            )
            .await
            .unwrap();
        assert_eq!(result.submitted, 3);
        assert_eq!(result.accepted_count, 2);
        assert_eq!(result.skipped, vec![fingerprint(&ProductMetadata::new("Widget", "B1"))]);
        assert_eq!(registry.cache().len(), 3);
    }

    #[tokio::test]
    async fn test_bulk_validation_names_item() {
        let (_, registry) = setup().await;
        let err = registry
            .bulk_register(
                vec![ProductMetadata::new("Widget", "B1"), ProductMetadata::new("", "B2")],
                &addr(OWNER),
            )
            .await
            .unwrap_err();
        match err {
            RegistryError::Validation(msg) => assert!(msg.starts_with("item[1]")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.cache().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_requires_owner() {
        let (_, registry) = setup().await;
        let fp = registry
            .register(ProductMetadata::new("Widget", "B1"), &addr(OWNER))
            .await
            .unwrap()
            .fingerprint;

        let err = registry
            .transfer_ownership(&fp, &addr("0xthief"), &addr("0xthief"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotOwner { .. }));

        registry
            .transfer_ownership(&fp, &addr(OWNER), &addr("0xbuyer"))
            .await
            .unwrap();
        assert_eq!(registry.get_details(&fp).await.unwrap().owner, addr("0xbuyer"));
        assert_eq!(registry.list_for_user(&addr("0xbuyer")).await.unwrap().len(), 1);
        assert!(registry.list_for_user(&addr(OWNER)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_requires_admin_and_clears_cache() {
        let (_, registry) = setup().await;
        let fp = registry
            .register(ProductMetadata::new("Widget", "B1"), &addr(OWNER))
            .await
            .unwrap()
            .fingerprint;

        let err = registry.remove(&fp, &addr("0xuser")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized(_)));

        registry.remove(&fp, &addr(OWNER)).await.unwrap();
        assert!(!registry.verify(&fp).await.unwrap());
        assert!(!registry.cache().contains(&fp).unwrap());
        assert!(matches!(
            registry.get_details(&fp).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_uses_typed_events() {
        let (_, registry) = setup().await;
        let fp = registry
            .register(ProductMetadata::new("Widget", "B1"), &addr(OWNER))
            .await
            .unwrap()
            .fingerprint;
        registry.set_validity(&fp, false, &addr(OWNER)).await.unwrap();

        let timeline = registry.history(&fp).await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].label(), "Registration");
        assert_eq!(
            timeline[1].kind,
            history::HistoryEventKind::StatusUpdate { status: Some(false) }
        );
        assert!(timeline.iter().all(|e| !e.inferred));
    }

    #[tokio::test]
    async fn test_list_all_merges_ledger_state() {
        let (_, registry) = setup().await;
        let fp = registry
            .register(ProductMetadata::new("Widget", "B1"), &addr(OWNER))
            .await
            .unwrap()
            .fingerprint;
        registry.set_validity(&fp, false, &addr(OWNER)).await.unwrap();

        let all = registry.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].valid);
        assert_eq!(all[0].metadata.name, "Widget");
    }

    #[tokio::test]
    async fn test_register_replaces_leftover_from_unfinished_attempt() {
        let (_, registry) = setup().await;
        let metadata = ProductMetadata::new("Widget", "B1");
        let fp = fingerprint(&metadata);
        registry
            .cache()
            .insert_if_absent(&CacheEntry {
                fingerprint: fp.clone(),
                metadata: metadata.clone(),
                registered_by: addr("0xabandoned"),
                registration_time: 1,
            })
            .unwrap();

        registry.register(metadata, &addr(OWNER)).await.unwrap();

        let record = registry.get_details(&fp).await.unwrap();
        assert_eq!(record.registered_by, Some(addr(OWNER)));
        assert_ne!(record.registration_time, 1);
    }

    #[tokio::test]
    async fn test_bulk_cache_failure_keeps_ledger_result() {
        let (ledger, registry) = setup().await;
        let broken = fingerprint(&ProductMetadata::new("Gadget", "B1"));
        registry.cache().refuse_writes_for(&broken);

        let result = registry
            .bulk_register(
                vec![
                    ProductMetadata::new("Widget", "B1"),
                    ProductMetadata::new("Gadget", "B1"),
                ],
                &addr(OWNER),
            )
            .await
            .unwrap();
        assert_eq!(result.accepted_count, 2);
        assert!(result.accepted.contains(&broken));
        assert_eq!(result.cache_failed, vec![broken.clone()]);
        assert!(!result.is_complete());

        assert_eq!(ledger.total_product_count().await.unwrap(), 2);
        assert_eq!(registry.cache().len(), 1);
        assert!(registry.get_details(&broken).await.unwrap().placeholder);
    }

    #[tokio::test]
    async fn test_remove_reports_dangling_cache_entry() {
        let (ledger, registry) = setup().await;
        let fp = registry
            .register(ProductMetadata::new("Widget", "B1"), &addr(OWNER))
            .await
            .unwrap()
            .fingerprint;
        registry.cache().refuse_writes_for(&fp);

        let err = registry.remove(&fp, &addr(OWNER)).await.unwrap_err();
        match &err {
            RegistryError::DanglingCacheEntry { fingerprint, .. } => assert_eq!(fingerprint, &fp),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.kind(), "dangling_cache_entry");
        assert_eq!(ledger.addition_time_of(&fp).await.unwrap(), None);
        assert!(registry.cache().contains(&fp).unwrap());
    }

    #[tokio::test]
    async fn test_remove_clears_entry_unknown_to_ledger() {
        let (ledger, registry) = setup().await;
        let metadata = ProductMetadata::new("Widget", "B1");
        let fp = fingerprint(&metadata);
        registry
            .cache()
            .insert_if_absent(&CacheEntry {
                fingerprint: fp.clone(),
                metadata,
                registered_by: addr(OWNER),
                registration_time: 1,
            })
            .unwrap();
        assert_eq!(ledger.addition_time_of(&fp).await.unwrap(), None);

        registry.remove(&fp, &addr(OWNER)).await.unwrap();
        assert!(!registry.cache().contains(&fp).unwrap());

        // Nothing left anywhere.
        assert!(matches!(
            registry.remove(&fp, &addr(OWNER)).await,
            Err(RegistryError::NotFound(_))
        ));
    }
}

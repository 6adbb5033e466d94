//! Per-fingerprint mutual exclusion
//!
//! Mutations of one product (register, transfer, set validity, remove) must
//! not interleave their cache and ledger writes. Each fingerprint gets an
//! async mutex on first use; the entry is dropped again once no guard or
//! waiter holds it.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::fingerprint::Fingerprint;

#[derive(Default)]
pub struct FingerprintLocks {
    locks: Arc<DashMap<Fingerprint, Arc<Mutex<()>>>>,
}

/// Held while a fingerprint is being mutated. Released on drop, including
/// when the owning future is cancelled by a timeout.
pub struct FingerprintGuard {
    fingerprint: Fingerprint,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl FingerprintLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `fingerprint`.
    pub async fn acquire(&self, fingerprint: &Fingerprint) -> FingerprintGuard {
        let mutex = self
            .locks
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        FingerprintGuard {
            fingerprint: fingerprint.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Lock several fingerprints in sorted order, skipping duplicates.
    ///
    /// Sorting gives every caller the same acquisition order, so batches
    /// cannot deadlock against each other.
    pub async fn acquire_many(&self, fingerprints: &[Fingerprint]) -> Vec<FingerprintGuard> {
        let mut sorted: Vec<&Fingerprint> = fingerprints.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for fingerprint in sorted {
            guards.push(self.acquire(fingerprint).await);
        }
        guards
    }

    /// Fingerprints with a live lock entry
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for FingerprintGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody holds or waits.
        self.locks
            .remove_if(&self.fingerprint, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::model::ProductMetadata;
    use std::time::Duration;

    fn fp(name: &str) -> Fingerprint {
        fingerprint(&ProductMetadata::new(name, "B1"))
    }

    #[tokio::test]
    async fn test_same_fingerprint_is_exclusive() {
        let locks = FingerprintLocks::new();
        let guard = locks.acquire(&fp("Widget")).await;

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire(&fp("Widget"))).await;
        assert!(blocked.is_err());

        drop(guard);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(50), locks.acquire(&fp("Widget"))).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_different_fingerprints_do_not_block() {
        let locks = FingerprintLocks::new();
        let _a = locks.acquire(&fp("Widget")).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&fp("Gadget"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_entries_are_reclaimed() {
        let locks = FingerprintLocks::new();
        {
            let _guards = locks.acquire_many(&[fp("A"), fp("B"), fp("A")]).await;
            assert_eq!(locks.active(), 2);
        }
        assert_eq!(locks.active(), 0);
    }
}

//! Local metadata cache
//!
//! Durable fingerprint → metadata store backed by sled. The ledger only keeps
//! existence, ownership and validity; everything descriptive lives here.
//!
//! Tracks:
//! - Product metadata as submitted
//! - Who registered it and when
//!
//! Every mutating write is flushed before returning. An unreadable database
//! is moved aside and replaced with an empty one; undecodable entries are
//! treated as misses.

use crate::error::{RegistryError, Result};
use crate::fingerprint::Fingerprint;
use crate::model::{Address, ProductMetadata};
use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Cached product entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub metadata: ProductMetadata,
    /// Principal that submitted the registration
    pub registered_by: Address,
    /// Unix seconds when the entry was first written
    pub registration_time: u64,
}

/// Metadata cache
pub struct MetadataCache {
    db: Db,
    path: Option<PathBuf>,
    #[cfg(test)]
    refused: std::sync::Mutex<std::collections::HashSet<Fingerprint>>,
}

impl MetadataCache {
    /// Open or create the cache database.
    ///
    /// Never fails on a corrupt store: the damaged directory is renamed to
    /// `<path>.corrupt-<unix>` and a fresh store opened in its place.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match sled::open(path) {
            Ok(db) => {
                info!(path = %path.display(), entries = db.len(), "Opened metadata cache");
                Ok(Self {
                    db,
                    path: Some(path.to_path_buf()),
                    #[cfg(test)]
                    refused: Default::default(),
                })
            }
            Err(e) => {
                let corrupt = RegistryError::CacheCorrupt(e.to_string());
                error!(path = %path.display(), error = %corrupt, "Metadata cache unreadable, starting empty");
                Self::recover(path)
            }
        }
    }

    fn recover(path: &Path) -> Result<Self> {
        let aside = path.with_extension(format!("corrupt-{}", chrono::Utc::now().timestamp()));
        if path.exists() {
            std::fs::rename(path, &aside)?;
            warn!(from = %path.display(), to = %aside.display(), "Moved corrupt cache aside");
        }
        match sled::open(path) {
            Ok(db) => Ok(Self {
                db,
                path: Some(path.to_path_buf()),
                #[cfg(test)]
                refused: Default::default(),
            }),
            Err(e) => {
                error!(error = %e, "Could not reopen cache, falling back to in-memory store");
                Self::temporary()
            }
        }
    }

    /// In-memory cache that is discarded on drop (tests, degraded mode)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            db,
            path: None,
            #[cfg(test)]
            refused: Default::default(),
        })
    }

    /// On-disk location, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn encode(entry: &CacheEntry) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(entry)
            .map_err(|e| RegistryError::Serialization(format!("cache entry: {}", e)))
    }

    fn decode(key: &[u8], value: &[u8]) -> Option<CacheEntry> {
        match rmp_serde::from_slice::<CacheEntry>(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                let corrupt = RegistryError::CacheCorrupt(format!(
                    "{}: {}",
                    String::from_utf8_lossy(key),
                    e
                ));
                warn!(error = %corrupt, "Skipping undecodable cache entry");
                None
            }
        }
    }

    /// Insert an entry unless one already exists for its fingerprint.
    ///
    /// Returns `true` if this call wrote the entry. Existing entries are
    /// never overwritten.
    pub fn insert_if_absent(&self, entry: &CacheEntry) -> Result<bool> {
        self.check_writable(&entry.fingerprint)?;
        let key = entry.fingerprint.as_str().as_bytes();
        let value = Self::encode(entry)?;
        let inserted = self
            .db
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?
            .is_ok();
        if inserted {
            self.db.flush()?;
            debug!(fingerprint = %entry.fingerprint, "Cached product metadata");
        }
        Ok(inserted)
    }

    /// Write an entry, replacing whatever was cached for its fingerprint.
    ///
    /// Used when the ledger does not know the fingerprint, so any existing
    /// entry is left over from a registration that never completed.
    pub fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        self.check_writable(&entry.fingerprint)?;
        let value = Self::encode(entry)?;
        self.db.insert(entry.fingerprint.as_str().as_bytes(), value)?;
        self.db.flush()?;
        debug!(fingerprint = %entry.fingerprint, "Wrote product metadata");
        Ok(())
    }

    /// Get a cached entry. Undecodable entries read as `None`.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let key = fingerprint.as_str().as_bytes();
        Ok(self
            .db
            .get(key)?
            .and_then(|value| Self::decode(key, &value)))
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.db.contains_key(fingerprint.as_str().as_bytes())?)
    }

    /// Delete an entry. Returns whether one existed.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.check_writable(fingerprint)?;
        let existed = self.db.remove(fingerprint.as_str().as_bytes())?.is_some();
        self.db.flush()?;
        Ok(existed)
    }

    /// All decodable entries, ordered by fingerprint
    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item?;
            if let Some(entry) = Self::decode(&key, &value) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Number of stored keys (including undecodable ones)
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    #[cfg(not(test))]
    fn check_writable(&self, _fingerprint: &Fingerprint) -> Result<()> {
        Ok(())
    }

    #[cfg(test)]
    fn check_writable(&self, fingerprint: &Fingerprint) -> Result<()> {
        if self.refused.lock().unwrap().contains(fingerprint) {
            return Err(RegistryError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("write refused for {}", fingerprint),
            )));
        }
        Ok(())
    }

    /// Make every later write touching `fingerprint` fail
    #[cfg(test)]
    pub(crate) fn refuse_writes_for(&self, fingerprint: &Fingerprint) {
        self.refused.lock().unwrap().insert(fingerprint.clone());
    }

    #[cfg(test)]
    fn put_raw(&self, key: &str, value: &[u8]) {
        self.db.insert(key.as_bytes(), value).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use tempfile::TempDir;

    fn entry(name: &str) -> CacheEntry {
        let metadata = ProductMetadata::new(name, "B1");
        CacheEntry {
            fingerprint: fingerprint(&metadata),
            metadata,
            registered_by: "0xmaker".parse().unwrap(),
            registration_time: 1_700_000_000,
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let cache = MetadataCache::temporary().unwrap();
        let e = entry("Widget");

        assert!(cache.insert_if_absent(&e).unwrap());
        assert_eq!(cache.get(&e.fingerprint).unwrap(), Some(e.clone()));
        assert!(cache.remove(&e.fingerprint).unwrap());
        assert_eq!(cache.get(&e.fingerprint).unwrap(), None);
        assert!(!cache.remove(&e.fingerprint).unwrap());
    }

    #[test]
    fn test_insert_never_overwrites() {
        let cache = MetadataCache::temporary().unwrap();
        let first = entry("Widget");
        let mut second = first.clone();
        second.registered_by = "0xother".parse().unwrap();
        second.registration_time = 1;

        assert!(cache.insert_if_absent(&first).unwrap());
        assert!(!cache.insert_if_absent(&second).unwrap());
        assert_eq!(cache.get(&first.fingerprint).unwrap(), Some(first));
    }

    #[test]
    fn test_upsert_replaces_stale_entry() {
        let cache = MetadataCache::temporary().unwrap();
        let stale = entry("Widget");
        let mut fresh = stale.clone();
        fresh.registered_by = "0xother".parse().unwrap();

        cache.insert_if_absent(&stale).unwrap();
        cache.upsert(&fresh).unwrap();
        assert_eq!(cache.get(&stale.fingerprint).unwrap(), Some(fresh));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_refused_write_leaves_entry_in_place() {
        let cache = MetadataCache::temporary().unwrap();
        let e = entry("Widget");
        cache.insert_if_absent(&e).unwrap();
        cache.refuse_writes_for(&e.fingerprint);

        assert!(matches!(
            cache.remove(&e.fingerprint),
            Err(RegistryError::Io(_))
        ));
        assert_eq!(cache.get(&e.fingerprint).unwrap(), Some(e));
    }

    #[test]
    fn test_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("products.sled");
        let e = entry("Widget");
        {
            let cache = MetadataCache::open(&path).unwrap();
            cache.insert_if_absent(&e).unwrap();
        }
        let cache = MetadataCache::open(&path).unwrap();
        assert_eq!(cache.get(&e.fingerprint).unwrap(), Some(e));
    }

    #[test]
    fn test_undecodable_entry_reads_as_miss() {
        let cache = MetadataCache::temporary().unwrap();
        let good = entry("Widget");
        cache.insert_if_absent(&good).unwrap();
        let bad = entry("Gadget");
        cache.put_raw(bad.fingerprint.as_str(), b"\xc1not msgpack");

        assert_eq!(cache.get(&bad.fingerprint).unwrap(), None);
        assert_eq!(cache.list().unwrap(), vec![good]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_corrupt_directory_is_replaced() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("products.sled");
        // A regular file where sled expects a directory cannot be opened.
        std::fs::write(&path, b"garbage").unwrap();

        let cache = MetadataCache::open(&path).unwrap();
        assert!(cache.is_empty());
        assert!(cache.insert_if_absent(&entry("Widget")).unwrap());
    }
}

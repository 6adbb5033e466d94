//! Content fingerprints for product metadata
//!
//! A fingerprint is the SHA-256 digest of a canonical JSON encoding of
//! [`ProductMetadata`], rendered as `0x` + 64 lowercase hex chars so it fits
//! a 32-byte ledger key.
//!
//! Canonical encoding: keys in the fixed order
//! `name, batch, manufactureDate, expiryDate, details`, absent optional
//! fields omitted, empty optional fields treated as absent.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::RegistryError;
use crate::model::ProductMetadata;

/// Digest length in bytes
pub const FINGERPRINT_LEN: usize = 32;

/// Registry primary key derived from product metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_digest(digest: [u8; FINGERPRINT_LEN]) -> Self {
        Self(format!("0x{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Fingerprint {
    type Err = RegistryError;

    /// Accepts hex with or without `0x`, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if hex_part.len() != FINGERPRINT_LEN * 2 {
            return Err(RegistryError::Validation(format!(
                "fingerprint must be {} hex chars, got {}",
                FINGERPRINT_LEN * 2,
                hex_part.len()
            )));
        }

        let mut digest = [0u8; FINGERPRINT_LEN];
        hex::decode_to_slice(hex_part, &mut digest)
            .map_err(|e| RegistryError::Validation(format!("invalid fingerprint: {}", e)))?;

        Ok(Self::from_digest(digest))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed-order view serialized for hashing. Field order here is the
/// canonical key order; do not reorder.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Canonical<'a> {
    name: &'a str,
    batch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    manufacture_date: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expiry_date: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

/// Canonical byte encoding of metadata.
pub fn canonical_bytes(metadata: &ProductMetadata) -> Vec<u8> {
    let canonical = Canonical {
        name: &metadata.name,
        batch: &metadata.batch,
        manufacture_date: non_empty(&metadata.manufacture_date),
        expiry_date: non_empty(&metadata.expiry_date),
        details: non_empty(&metadata.details),
    };
    // Serializing a struct of strings cannot fail.
    serde_json::to_vec(&canonical).unwrap_or_default()
}

/// Compute the fingerprint of product metadata.
pub fn fingerprint(metadata: &ProductMetadata) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(metadata));
    Fingerprint::from_digest(hasher.finalize().into())
}

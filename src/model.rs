//! Shared domain types
//!
//! - `Address` - a normalized principal identity
//! - `Role` - Admin / Manager / User, serialized as the ledger ordinal
//! - `ProductMetadata` - descriptive fields a manufacturer submits
//! - `ProductRecord` - merged ledger + cache view of one product

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RegistryError;
use crate::fingerprint::Fingerprint;

/// Principal identity (wallet address).
///
/// Stored lowercased so that comparisons are case-insensitive, matching how
/// checksummed and plain hex addresses are treated as the same account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::Validation("address is required".into()));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(RegistryError::Validation(format!(
                "address contains whitespace: {:?}",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_lowercase()))
    }
}

impl TryFrom<String> for Address {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Permission level. Ordinals match the ledger encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Role {
    Admin = 0,
    Manager = 1,
    User = 2,
}

impl Role {
    /// Admins and Managers may register products.
    pub fn can_register(self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Manager => "Manager",
            Role::User => "User",
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

impl TryFrom<u8> for Role {
    type Error = RegistryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Admin),
            1 => Ok(Role::Manager),
            2 => Ok(Role::User),
            other => Err(RegistryError::Validation(format!(
                "unknown role ordinal {}",
                other
            ))),
        }
    }
}

impl From<Role> for u8 {
    fn from(role: Role) -> Self {
        role as u8
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive product metadata as submitted by a manufacturer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductMetadata {
    pub name: String,
    pub batch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacture_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ProductMetadata {
    pub fn new(name: impl Into<String>, batch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch: batch.into(),
            ..Default::default()
        }
    }

    /// Drop optional fields that were submitted empty.
    ///
    /// Web forms post `""` for untouched inputs; those must hash the same as
    /// a missing field.
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.manufacture_date,
            &mut self.expiry_date,
            &mut self.details,
        ] {
            if field.as_deref().map(str::is_empty).unwrap_or(false) {
                *field = None;
            }
        }
        self
    }

    /// Reject metadata missing a required field.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Validation("name is required".into()));
        }
        if self.batch.trim().is_empty() {
            return Err(RegistryError::Validation("batch is required".into()));
        }
        Ok(())
    }

    /// Stand-in metadata for a ledger-known product with no cache entry.
    pub fn placeholder() -> Self {
        Self {
            name: "Unknown product".to_string(),
            batch: "unknown".to_string(),
            details: Some("Metadata unavailable in local cache".to_string()),
            ..Default::default()
        }
    }
}

/// Merged view of a product: ledger-authoritative lifecycle fields plus
/// cache-authoritative metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub fingerprint: Fingerprint,
    pub metadata: ProductMetadata,
    /// True when `metadata` was synthesized because the cache had no entry
    pub placeholder: bool,
    pub registered_by: Option<Address>,
    pub registration_time: u64,
    pub owner: Address,
    pub valid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_case_insensitive() {
        let a: Address = "0xABCdef".parse().unwrap();
        let b: Address = " 0xabcDEF ".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "0xabcdef");
    }

    #[test]
    fn test_address_rejects_blank() {
        assert!("   ".parse::<Address>().is_err());
        assert!("0x12 34".parse::<Address>().is_err());
    }

    #[test]
    fn test_role_ordinals() {
        assert_eq!(u8::from(Role::Admin), 0);
        assert_eq!(u8::from(Role::Manager), 1);
        assert_eq!(u8::from(Role::User), 2);
        assert_eq!(Role::try_from(1).unwrap(), Role::Manager);
        assert!(Role::try_from(3).is_err());
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "2");
    }

    #[test]
    fn test_metadata_validation() {
        assert!(ProductMetadata::new("Widget", "B1").validate().is_ok());
        assert!(ProductMetadata::new("", "B1").validate().is_err());
        assert!(ProductMetadata::new("Widget", "  ").validate().is_err());
    }

    #[test]
    fn test_normalized_drops_empty_optionals() {
        let json = r#"{"name":"Widget","batch":"B1","manufactureDate":"","expiryDate":"2030-01-01"}"#;
        let metadata: ProductMetadata = serde_json::from_str(json).unwrap();
        let metadata = metadata.normalized();
        assert_eq!(metadata.manufacture_date, None);
        assert_eq!(metadata.expiry_date.as_deref(), Some("2030-01-01"));
    }
}

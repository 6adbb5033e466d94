//! Error types for product-registry

use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::ledger::LedgerError;

/// Failures surfaced by the registry, the authorization gate and the cache.
///
/// Authorization and validation failures are raised before any ledger call.
/// Ledger failures carry the operation name and fingerprint so callers can
/// act on them.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not owner: {caller} does not own {fingerprint}")]
    NotOwner {
        fingerprint: Fingerprint,
        caller: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ledger unavailable during {operation}{}: {reason}", fmt_fingerprint(.fingerprint))]
    LedgerUnavailable {
        operation: &'static str,
        fingerprint: Option<Fingerprint>,
        reason: String,
    },

    #[error("Ledger rejected {operation}{}: {reason}", fmt_fingerprint(.fingerprint))]
    LedgerRejected {
        operation: &'static str,
        fingerprint: Option<Fingerprint>,
        reason: String,
    },

    #[error("Cache corrupt: {0}")]
    CacheCorrupt(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Removed {fingerprint} from ledger but cache entry remains: {reason}")]
    DanglingCacheEntry {
        fingerprint: Fingerprint,
        reason: String,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn fmt_fingerprint(fingerprint: &Option<Fingerprint>) -> String {
    match fingerprint {
        Some(fp) => format!(" of {}", fp),
        None => String::new(),
    }
}

impl RegistryError {
    /// Wrap a ledger failure with the operation and fingerprint it concerns.
    pub fn from_ledger(
        operation: &'static str,
        fingerprint: Option<&Fingerprint>,
        error: LedgerError,
    ) -> Self {
        let fingerprint = fingerprint.cloned();
        match error {
            LedgerError::Unavailable(reason) => RegistryError::LedgerUnavailable {
                operation,
                fingerprint,
                reason,
            },
            LedgerError::Rejected(reason) | LedgerError::Unsupported(reason) => {
                RegistryError::LedgerRejected {
                    operation,
                    fingerprint,
                    reason,
                }
            }
        }
    }

    /// Stable tag for the failure class, used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Unauthorized(_) => "unauthorized",
            RegistryError::NotOwner { .. } => "not_owner",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::LedgerUnavailable { .. } => "ledger_unavailable",
            RegistryError::LedgerRejected { .. } => "ledger_rejected",
            RegistryError::CacheCorrupt(_) => "cache_corrupt",
            RegistryError::Validation(_) => "validation",
            RegistryError::DanglingCacheEntry { .. } => "dangling_cache_entry",
            RegistryError::Cache(_) => "cache",
            RegistryError::Serialization(_) => "serialization",
            RegistryError::Io(_) => "io",
            RegistryError::Json(_) => "json",
            RegistryError::Config(_) => "config",
        }
    }

    /// Whether the caller may retry the same request with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::LedgerUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_unavailable_is_retryable() {
        let err = RegistryError::LedgerUnavailable {
            operation: "verify",
            fingerprint: None,
            reason: "connection refused".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "ledger_unavailable");
        assert_eq!(
            err.to_string(),
            "Ledger unavailable during verify: connection refused"
        );
    }

    #[test]
    fn test_authorization_errors_are_not_retryable() {
        assert!(!RegistryError::Unauthorized("nope".into()).is_retryable());
        assert!(!RegistryError::Validation("name is required".into()).is_retryable());
    }
}

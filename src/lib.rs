//! Product Registry - Authenticity records for physical products
//!
//! Manufacturers register products against a shared ledger; anyone can then
//! verify a product by the fingerprint printed in its QR code.
//!
//! ## Architecture
//!
//! - **Ledger**: Authoritative record of existence, ownership, validity and roles
//! - **Metadata cache**: Local sled store of descriptive metadata, keyed by fingerprint
//! - **Registry**: Reconciles the two, ordering writes so a crash can only leave
//!   a cached entry the ledger does not know (which a retry completes)
//!
//! ## Data Flow
//!
//! ```text
//! metadata ──► fingerprint ──► gate (role) ──► cache insert ──► ledger addHash
//!
//! fingerprint ──► ledger (verify / owner / time) ──┐
//!                 cache (metadata | placeholder) ──┴──► ProductRecord
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/product-registry/
//! ├── metadata.sled/         # Metadata cache
//! └── config.toml            # Configuration
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod gate;
pub mod history;
pub mod http;
pub mod ledger;
pub mod locks;
pub mod model;
pub mod registry;
pub mod response;
pub mod stats;

// Re-exports
pub use cache::{CacheEntry, MetadataCache};
pub use config::Config;
pub use error::RegistryError;
pub use events::{EventBus, RegistryEvent};
pub use fingerprint::{fingerprint, Fingerprint};
pub use gate::AuthorizationGate;
pub use history::{HistoryEvent, HistoryEventKind};
pub use http::HttpServer;
pub use ledger::{Ledger, LedgerError, MemoryLedger, RpcLedger, RpcLedgerConfig};
pub use model::{Address, ProductMetadata, ProductRecord, Role};
pub use registry::{BulkRegistration, Registration, Registry};
pub use stats::RegistryStats;

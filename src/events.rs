//! Event system for registry operations
//!
//! Provides an event bus for notifying listeners about committed mutations.
//! Useful for:
//! - Audit logging
//! - Real-time notifications

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::fingerprint::Fingerprint;
use crate::model::{Address, Role};

/// Events emitted after a mutation has been committed to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ProductRegistered {
        fingerprint: Fingerprint,
        by: Address,
    },
    ProductsBulkRegistered {
        by: Address,
        accepted: Vec<Fingerprint>,
    },
    OwnershipTransferred {
        fingerprint: Fingerprint,
        from: Address,
        to: Address,
    },
    ValidityChanged {
        fingerprint: Fingerprint,
        valid: bool,
        by: Address,
    },
    ProductRemoved {
        fingerprint: Fingerprint,
        by: Address,
    },
    RoleAssigned {
        address: Address,
        role: Role,
        by: Address,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &RegistryEvent);
}

/// Event bus for broadcasting registry events
pub struct EventBus {
    sender: broadcast::Sender<RegistryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: RegistryEvent) {
        trace!(event = ?event, "Emitting registry event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes an audit line per committed mutation
pub struct AuditLogListener;

impl EventListener for AuditLogListener {
    fn on_event(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::ProductRegistered { fingerprint, by } => {
                info!(target: "audit", fingerprint = %fingerprint, by = %by, "Product registered");
            }
            RegistryEvent::ProductsBulkRegistered { by, accepted } => {
                info!(target: "audit", by = %by, count = accepted.len(), "Products bulk registered");
            }
            RegistryEvent::OwnershipTransferred {
                fingerprint,
                from,
                to,
            } => {
                info!(target: "audit", fingerprint = %fingerprint, from = %from, to = %to, "Ownership transferred");
            }
            RegistryEvent::ValidityChanged {
                fingerprint,
                valid,
                by,
            } => {
                info!(target: "audit", fingerprint = %fingerprint, valid, by = %by, "Validity changed");
            }
            RegistryEvent::ProductRemoved { fingerprint, by } => {
                info!(target: "audit", fingerprint = %fingerprint, by = %by, "Product removed");
            }
            RegistryEvent::RoleAssigned { address, role, by } => {
                info!(target: "audit", address = %address, role = %role, by = %by, "Role assigned");
            }
        }
    }
}

/// Spawn a background task that audit-logs all events
pub fn spawn_audit_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = AuditLogListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Audit listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping audit listener");
                    break;
                }
            }
        }
    })
}

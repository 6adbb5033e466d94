//! Product history reconstruction
//!
//! Turns what the ledger remembers about a product into an ordered timeline.
//!
//! Two sources, in order of preference:
//!
//! 1. **Typed events** (`typedHistoryOf`): each event carries its kind and
//!    payload, so the timeline is exact.
//! 2. **Timestamps only** (`historyOf`): the ledger kept one timestamp per
//!    lifecycle event but not its kind. Kinds are then inferred by position:
//!    index 0 is the registration, odd indices are status updates, even
//!    indices are ownership transfers. Payloads are unknown except for the
//!    registrant, which the cache may supply. Inferred events are flagged.
//!
//! Either way the output is stably sorted by timestamp.

use serde::Serialize;

use crate::ledger::LedgerEvent;
use crate::model::Address;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryEventKind {
    Registration {
        registrant: Option<Address>,
    },
    OwnershipTransfer {
        from: Option<Address>,
        to: Option<Address>,
    },
    StatusUpdate {
        status: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEvent {
    pub timestamp: u64,
    #[serde(flatten)]
    pub kind: HistoryEventKind,
    /// Kind was guessed from position rather than reported by the ledger
    pub inferred: bool,
}

impl HistoryEvent {
    /// Display label for the event kind
    pub fn label(&self) -> &'static str {
        match self.kind {
            HistoryEventKind::Registration { .. } => "Registration",
            HistoryEventKind::OwnershipTransfer { .. } => "Ownership Transfer",
            HistoryEventKind::StatusUpdate { .. } => "Status Update",
        }
    }
}

/// Build a timeline from typed ledger events.
pub fn from_typed(events: Vec<LedgerEvent>) -> Vec<HistoryEvent> {
    let mut timeline: Vec<HistoryEvent> = events
        .into_iter()
        .map(|event| {
            let (timestamp, kind) = match event {
                LedgerEvent::Registered { timestamp, by } => (
                    timestamp,
                    HistoryEventKind::Registration {
                        registrant: Some(by),
                    },
                ),
                LedgerEvent::OwnershipTransferred {
                    timestamp,
                    from,
                    to,
                } => (
                    timestamp,
                    HistoryEventKind::OwnershipTransfer {
                        from: Some(from),
                        to: Some(to),
                    },
                ),
                LedgerEvent::ValidityChanged { timestamp, valid } => (
                    timestamp,
                    HistoryEventKind::StatusUpdate {
                        status: Some(valid),
                    },
                ),
            };
            HistoryEvent {
                timestamp,
                kind,
                inferred: false,
            }
        })
        .collect();
    timeline.sort_by_key(|e| e.timestamp);
    timeline
}

/// Build a timeline from bare timestamps using the positional heuristic.
pub fn from_timestamps(timestamps: &[u64], registrant: Option<Address>) -> Vec<HistoryEvent> {
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();

    let mut registrant = registrant;
    sorted
        .into_iter()
        .enumerate()
        .map(|(index, timestamp)| {
            let kind = if index == 0 {
                HistoryEventKind::Registration {
                    registrant: registrant.take(),
                }
            } else if index % 2 == 1 {
                HistoryEventKind::StatusUpdate { status: None }
            } else {
                HistoryEventKind::OwnershipTransfer {
                    from: None,
                    to: None,
                }
            };
            HistoryEvent {
                timestamp,
                kind,
                inferred: index != 0,
            }
        })
        .collect()
}

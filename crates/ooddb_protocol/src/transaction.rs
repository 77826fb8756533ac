//! Transactions as they travel between peers.

use crate::event::{EventTypes, TableEvent};
use crate::ids::{HookId, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A logged transaction shipped to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTransaction {
    /// Id in the sender's log.
    pub id: TransactionId,
    /// Hook that originally produced the transaction.
    pub origin: HookId,
    /// Id in the origin's log.
    pub origin_id: TransactionId,
    /// Commit time on the origin, milliseconds since the Unix epoch.
    pub timestamp_utc: u64,
    /// The origin's accepted transaction id per other origin at commit time.
    pub known: BTreeMap<HookId, u64>,
    /// Set for full-package snapshots sent when a peer starts supporting a package.
    pub resynchronization: bool,
    /// Ordered row mutations.
    pub events: Vec<TableEvent>,
}

impl WireTransaction {
    /// Returns the union of event kinds.
    #[must_use]
    pub fn event_types(&self) -> EventTypes {
        self.events.iter().map(|e| e.kind).collect()
    }

    /// Returns the last id of `origin` this transaction's producer had seen.
    #[must_use]
    pub fn knows(&self, origin: HookId) -> u64 {
        self.known.get(&origin).copied().unwrap_or(0)
    }
}

/// A slice of the sender's log for one destination.
///
/// `last_transaction_id` may exceed the id of the last carried transaction
/// when trailing log entries were irrelevant to the destination; the
/// destination confirms up to this id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionBatch {
    /// Transactions in log order.
    pub transactions: Vec<WireTransaction>,
    /// Highest sender id covered by the batch.
    pub last_transaction_id: TransactionId,
}

impl TransactionBatch {
    /// Total number of events in the batch.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.transactions.iter().map(|t| t.events.len()).sum()
    }
}

//! Logged transaction headers.

use crate::hooks::Hook;
use ooddb_protocol::{EventTypes, HookId, TableEvent, TransactionId, WireTransaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Header of a logged transaction. Events are stored separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedTransaction {
    /// Id in this database's log.
    pub id: TransactionId,
    /// Commit time on the origin, milliseconds since the Unix epoch.
    pub timestamp_utc: u64,
    /// Hook that produced the transaction.
    pub origin: HookId,
    /// Id in the origin's log; equals `id` for local transactions.
    pub origin_id: TransactionId,
    /// The origin's accepted id per other origin when it committed.
    pub known: BTreeMap<HookId, u64>,
    /// Union of event kinds.
    pub event_types: EventTypes,
    /// Hooks the transaction must reach; `None` means every hook.
    pub concerned: Option<BTreeSet<HookId>>,
    /// Full-package snapshot for a newly paired peer.
    pub resynchronization: bool,
    /// Number of events.
    pub event_count: u32,
}

impl LoggedTransaction {
    /// Returns true if the transaction must reach `hook`.
    #[must_use]
    pub fn concerns(&self, hook: HookId) -> bool {
        self.concerned.as_ref().map_or(true, |c| c.contains(&hook))
    }

    /// Returns true if any hook in `hooks` is concerned.
    pub fn concerns_any<'a>(&self, hooks: impl IntoIterator<Item = &'a Hook>) -> bool {
        hooks.into_iter().any(|h| self.concerns(h.id))
    }

    pub(crate) fn to_wire(&self, events: Vec<TableEvent>) -> WireTransaction {
        WireTransaction {
            id: self.id,
            origin: self.origin,
            origin_id: self.origin_id,
            timestamp_utc: self.timestamp_utc,
            known: self.known.clone(),
            resynchronization: self.resynchronization,
            events,
        }
    }
}

/// Provenance of a transaction about to be logged.
#[derive(Debug, Clone)]
pub(crate) struct PendingTransaction {
    /// `(origin, origin id)` of a relayed transaction; `None` for local ones.
    pub(crate) relayed_from: Option<(HookId, TransactionId)>,
    pub(crate) timestamp_utc: u64,
    pub(crate) known: BTreeMap<HookId, u64>,
    pub(crate) concerned: Option<BTreeSet<HookId>>,
    pub(crate) resynchronization: bool,
    /// Whether touched rows get this transaction's version stamp.
    pub(crate) restamp: bool,
}

impl PendingTransaction {
    /// A transaction produced here, aimed at `concerned`.
    pub(crate) fn local(
        timestamp_utc: u64,
        known: BTreeMap<HookId, u64>,
        concerned: BTreeSet<HookId>,
    ) -> Self {
        Self {
            relayed_from: None,
            timestamp_utc,
            known,
            concerned: Some(concerned),
            resynchronization: false,
            restamp: true,
        }
    }

    /// A peer's transaction passed on to `concerned`.
    pub(crate) fn relay(remote: &WireTransaction, concerned: BTreeSet<HookId>) -> Self {
        Self {
            relayed_from: Some((remote.origin, remote.origin_id)),
            timestamp_utc: remote.timestamp_utc,
            known: remote.known.clone(),
            concerned: Some(concerned),
            resynchronization: remote.resynchronization,
            restamp: true,
        }
    }

    /// Marks a snapshot: rows keep the stamps of their last real write.
    #[must_use]
    pub(crate) fn resynchronization(mut self) -> Self {
        self.resynchronization = true;
        self.restamp = false;
        self
    }
}

//! Peers ("hooks") this database replicates with.
//!
//! Every database has exactly one local hook once initialized; each
//! distant hook carries the two link cursors, the packages replicated
//! with that peer and an outbound queue of authenticated messages.

pub(crate) mod cursor;
pub(crate) mod gossip;
pub(crate) mod messages;
mod registry;

pub use messages::QueuedMessage;
pub use registry::{AddHooksOutcome, PeerRegistry};

use ooddb_protocol::{HookId, TransactionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Pairing progress of a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairingState {
    /// Being paired through a central server.
    CentralPairingInProgress,
    /// Registered locally, waiting for the first handshake.
    P2PPairingInProgress,
    /// Replicating.
    Paired,
    /// Forgotten; kept so a later pairing reuses the id.
    Removed,
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CentralPairingInProgress => "central-pairing",
            Self::P2PPairingInProgress => "p2p-pairing",
            Self::Paired => "paired",
            Self::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// A registered peer, or the local host itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    /// Identifier.
    pub id: HookId,
    /// True for the local host's own hook.
    pub concerns_local_host: bool,
    /// Pairing progress.
    pub pairing_state: PairingState,
    /// Highest local id the peer has confirmed, directly or by gossip.
    pub last_validated_local_transaction_id: TransactionId,
    /// Highest id of the peer's log accepted here. Never decreases.
    pub last_validated_distant_transaction_id: TransactionId,
    /// Commit time of that transaction on the peer.
    pub last_validated_distant_transaction_utc: u64,
    /// Packages replicated with the peer; empty means every package.
    pub packages: BTreeSet<String>,
    /// Whether the peer's snapshot rows replace conflicting local rows.
    pub replace_conflicts_on_resynchronization: bool,
    /// Id the next queued authenticated message gets.
    pub next_message_id: u64,
    /// Snapshot transaction logged when the peer started supporting a package.
    pub package_seeds: BTreeMap<String, TransactionId>,
}

impl Hook {
    pub(crate) fn new(id: HookId, local: bool, pairing_state: PairingState) -> Self {
        Self {
            id,
            concerns_local_host: local,
            pairing_state,
            last_validated_local_transaction_id: TransactionId::ZERO,
            last_validated_distant_transaction_id: TransactionId::ZERO,
            last_validated_distant_transaction_utc: 0,
            packages: BTreeSet::new(),
            replace_conflicts_on_resynchronization: false,
            next_message_id: 1,
            package_seeds: BTreeMap::new(),
        }
    }

    /// Returns true if the hook replicates `package`.
    #[must_use]
    pub fn supports(&self, package: &str) -> bool {
        self.packages.is_empty() || self.packages.contains(package)
    }

    /// A distant hook that is not removed.
    #[must_use]
    pub fn is_active_distant(&self) -> bool {
        !self.concerns_local_host && self.pairing_state != PairingState::Removed
    }

    /// Packages replicated with the peer, resolved against `declared`.
    #[must_use]
    pub fn effective_packages(&self, declared: &BTreeSet<String>) -> BTreeSet<String> {
        if self.packages.is_empty() {
            declared.clone()
        } else {
            self.packages.clone()
        }
    }

    fn reset(&mut self) {
        self.pairing_state = PairingState::Removed;
        self.last_validated_local_transaction_id = TransactionId::ZERO;
        self.last_validated_distant_transaction_id = TransactionId::ZERO;
        self.last_validated_distant_transaction_utc = 0;
        self.packages.clear();
        self.package_seeds.clear();
        self.next_message_id = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_package_set_supports_everything() {
        let mut hook = Hook::new(HookId::generate(), false, PairingState::Paired);
        assert!(hook.supports("anything"));
        hook.packages.insert("crm".into());
        assert!(hook.supports("crm"));
        assert!(!hook.supports("billing"));
    }

    #[test]
    fn reset_clears_counters() {
        let mut hook = Hook::new(HookId::generate(), false, PairingState::Paired);
        hook.last_validated_distant_transaction_id = TransactionId::new(9);
        hook.next_message_id = 4;
        hook.reset();
        assert_eq!(hook.pairing_state, PairingState::Removed);
        assert_eq!(hook.last_validated_distant_transaction_id, TransactionId::ZERO);
        assert_eq!(hook.next_message_id, 1);
        assert!(!hook.is_active_distant());
    }
}

//! Runtime state of the links to peers, keyed by hook id.

use ooddb_protocol::HookId;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Runtime state of one link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerLink {
    /// A transport link is open.
    pub connected: bool,
    /// Start of the unconfirmed transfer, if one is in flight.
    pub transfer_started: Option<Instant>,
    /// The peer's handshake was received on the current link.
    pub handshake_received: bool,
}

impl PeerLink {
    /// Returns true while a batch awaits confirmation.
    #[must_use]
    pub fn transfer_in_progress(&self) -> bool {
        self.transfer_started.is_some()
    }
}

/// Links by peer.
#[derive(Debug, Default)]
pub(crate) struct PeerArena {
    links: BTreeMap<HookId, PeerLink>,
}

impl PeerArena {
    pub(crate) fn get(&self, peer: HookId) -> Option<&PeerLink> {
        self.links.get(&peer)
    }

    pub(crate) fn connect(&mut self, peer: HookId) {
        let link = self.links.entry(peer).or_default();
        link.connected = true;
        link.handshake_received = false;
    }

    /// Marks the link down; an unconfirmed transfer is abandoned.
    pub(crate) fn disconnect(&mut self, peer: HookId) -> bool {
        match self.links.get_mut(&peer) {
            Some(link) if link.connected => {
                link.connected = false;
                link.transfer_started = None;
                link.handshake_received = false;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn forget(&mut self, peer: HookId) -> Option<PeerLink> {
        self.links.remove(&peer)
    }

    pub(crate) fn is_connected(&self, peer: HookId) -> bool {
        self.links.get(&peer).is_some_and(|l| l.connected)
    }

    pub(crate) fn connected(&self) -> BTreeSet<HookId> {
        self.links
            .iter()
            .filter(|(_, l)| l.connected)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn handshake_received(&mut self, peer: HookId) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.handshake_received = true;
        }
    }

    /// Starts a transfer unless one is in flight. A transfer older than
    /// `stale_after` is dropped first; returns `(started, cleared_stale)`.
    pub(crate) fn begin_transfer(
        &mut self,
        peer: HookId,
        now: Instant,
        stale_after: Duration,
    ) -> (bool, bool) {
        let Some(link) = self.links.get_mut(&peer).filter(|l| l.connected) else {
            return (false, false);
        };
        let mut cleared = false;
        if let Some(started) = link.transfer_started {
            if now.saturating_duration_since(started) < stale_after {
                return (false, false);
            }
            cleared = true;
        }
        link.transfer_started = Some(now);
        (true, cleared)
    }

    pub(crate) fn end_transfer(&mut self, peer: HookId) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.transfer_started = None;
        }
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<HookId, PeerLink> {
        self.links.clone()
    }
}

//! Transport layer abstraction for peer links.

use crate::error::{SyncError, SyncResult};
use ooddb_protocol::{Envelope, HookId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

/// Carries envelopes to peers.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (TCP, a message broker, the in-process loopback used in
/// tests, etc.). Delivery is fire-and-forget: acknowledgement happens at
/// the protocol level.
pub trait SyncTransport: Send + Sync {
    /// Sends `envelope` to its destination.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotConnected`] when no link to the destination is up.
    fn send(&self, envelope: &Envelope) -> SyncResult<()>;

    /// Checks if a link to `peer` is up.
    fn is_connected(&self, peer: HookId) -> bool;
}

#[derive(Default)]
struct Network {
    mailboxes: BTreeMap<HookId, VecDeque<(HookId, Vec<u8>)>>,
    links: BTreeSet<(HookId, HookId)>,
    frames_sent: u64,
}

fn link_key(a: HookId, b: HookId) -> (HookId, HookId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// In-process network of hooks.
///
/// Frames are encoded on send and decoded on receive, so everything that
/// crosses the loopback goes through the wire format. Taking a link down
/// loses the frames still in flight on it.
#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<Network>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport sending as `local`.
    pub fn transport(self: &Arc<Self>, local: HookId) -> LoopbackTransport {
        LoopbackTransport {
            network: Arc::clone(self),
            local,
        }
    }

    /// Brings the link between `a` and `b` up.
    pub fn link(&self, a: HookId, b: HookId) {
        self.state.lock().links.insert(link_key(a, b));
    }

    /// Takes the link between `a` and `b` down. Returns the number of
    /// in-flight frames lost.
    pub fn unlink(&self, a: HookId, b: HookId) -> usize {
        let mut state = self.state.lock();
        state.links.remove(&link_key(a, b));
        let mut lost = 0;
        for (owner, other) in [(a, b), (b, a)] {
            if let Some(mailbox) = state.mailboxes.get_mut(&owner) {
                let before = mailbox.len();
                mailbox.retain(|(source, _)| *source != other);
                lost += before - mailbox.len();
            }
        }
        lost
    }

    /// Returns true if the link between `a` and `b` is up.
    pub fn is_linked(&self, a: HookId, b: HookId) -> bool {
        self.state.lock().links.contains(&link_key(a, b))
    }

    /// Takes the oldest frame addressed to `hook`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the frame does not decode.
    pub fn receive(&self, hook: HookId) -> SyncResult<Option<Envelope>> {
        let frame = self
            .state
            .lock()
            .mailboxes
            .get_mut(&hook)
            .and_then(VecDeque::pop_front);
        match frame {
            Some((_, bytes)) => Ok(Some(Envelope::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Frames waiting for `hook`.
    pub fn in_flight(&self, hook: HookId) -> usize {
        self.state.lock().mailboxes.get(&hook).map_or(0, VecDeque::len)
    }

    /// Frames accepted since creation.
    pub fn frames_sent(&self) -> u64 {
        self.state.lock().frames_sent
    }
}

/// A hook's end of the [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    local: HookId,
}

impl LoopbackTransport {
    /// Hook sending through this transport.
    pub fn local(&self) -> HookId {
        self.local
    }
}

impl SyncTransport for LoopbackTransport {
    fn send(&self, envelope: &Envelope) -> SyncResult<()> {
        let destination = envelope.destination;
        let frame = envelope.encode()?;
        let mut state = self.network.state.lock();
        if !state.links.contains(&link_key(self.local, destination)) {
            return Err(SyncError::NotConnected(destination));
        }
        state
            .mailboxes
            .entry(destination)
            .or_default()
            .push_back((self.local, frame));
        state.frames_sent += 1;
        Ok(())
    }

    fn is_connected(&self, peer: HookId) -> bool {
        self.network.is_linked(self.local, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ooddb_protocol::{ConfirmationOfReceipt, Payload, TransactionId};

    fn confirmation(source: HookId, destination: HookId, id: u64) -> Envelope {
        Envelope::new(
            source,
            destination,
            Payload::ConfirmationOfReceipt(ConfirmationOfReceipt {
                last_validated: TransactionId::new(id),
            }),
        )
    }

    #[test]
    fn frames_travel_only_over_links() {
        let network = LoopbackNetwork::new();
        let (a, b) = (HookId::generate(), HookId::generate());
        let transport = network.transport(a);

        let refused = transport.send(&confirmation(a, b, 1));
        assert!(matches!(refused, Err(SyncError::NotConnected(peer)) if peer == b));

        network.link(b, a);
        assert!(transport.is_connected(b));
        transport.send(&confirmation(a, b, 1)).unwrap();
        transport.send(&confirmation(a, b, 2)).unwrap();
        assert_eq!(network.in_flight(b), 2);
        assert_eq!(network.frames_sent(), 2);

        let first = network.receive(b).unwrap().unwrap();
        assert_eq!(first, confirmation(a, b, 1));
        assert_eq!(network.receive(a).unwrap(), None);
    }

    #[test]
    fn unlinking_loses_frames_in_flight() {
        let network = LoopbackNetwork::new();
        let (a, b, c) = (HookId::generate(), HookId::generate(), HookId::generate());
        network.link(a, b);
        network.link(c, b);
        network.transport(a).send(&confirmation(a, b, 1)).unwrap();
        network.transport(c).send(&confirmation(c, b, 1)).unwrap();

        assert_eq!(network.unlink(a, b), 1);
        assert!(!network.is_linked(a, b));
        assert_eq!(network.in_flight(b), 1);
        assert_eq!(network.receive(b).unwrap().unwrap().source, c);
    }
}

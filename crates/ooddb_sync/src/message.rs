//! Outbound work items queued by the dispatcher.

use ooddb_core::QueuedMessage;
use ooddb_protocol::{HookId, TransactionId, TransactionIdCorrection};

/// One item of the outbound queue.
///
/// Items are small: a batch of transactions is only read from the log when
/// its [`SyncMessage::EventsToSynchronize`] is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Open the link: send our view of the peer's log.
    Handshake {
        /// Receiving peer.
        peer: HookId,
    },
    /// Ship logged transactions.
    EventsToSynchronize {
        /// Receiving peer.
        peer: HookId,
        /// Last log id when the item was queued.
        watermark: TransactionId,
        /// Event budget of the batch.
        max_events: usize,
    },
    /// Gossip what a third peer holds.
    TransactionIdCorrection {
        /// Receiving peer.
        peer: HookId,
        /// The knowledge passed on.
        correction: TransactionIdCorrection,
    },
    /// Acknowledge a received batch.
    ConfirmationOfReceipt {
        /// Receiving peer.
        peer: HookId,
        /// Position of the peer's log applied here.
        last_validated: TransactionId,
    },
    /// Deliver a persisted peer-management message.
    Authenticated(QueuedMessage),
}

impl SyncMessage {
    /// Receiving peer.
    #[must_use]
    pub fn peer(&self) -> HookId {
        match self {
            Self::Handshake { peer }
            | Self::EventsToSynchronize { peer, .. }
            | Self::TransactionIdCorrection { peer, .. }
            | Self::ConfirmationOfReceipt { peer, .. } => *peer,
            Self::Authenticated(message) => message.destination,
        }
    }

    /// Merges `other` into `self` when both ask for a transfer to the same
    /// peer. Returns false, leaving `self` untouched, otherwise.
    pub fn fuse(&mut self, other: &SyncMessage) -> bool {
        match (self, other) {
            (
                Self::EventsToSynchronize {
                    peer,
                    watermark,
                    max_events,
                },
                Self::EventsToSynchronize {
                    peer: other_peer,
                    watermark: other_watermark,
                    max_events: other_max,
                },
            ) if *peer == *other_peer => {
                *watermark = (*watermark).max(*other_watermark);
                *max_events = (*max_events).max(*other_max);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ooddb_protocol::AuthenticatedBody;

    fn events(peer: HookId, watermark: u64) -> SyncMessage {
        SyncMessage::EventsToSynchronize {
            peer,
            watermark: TransactionId::new(watermark),
            max_events: 10,
        }
    }

    #[test]
    fn transfers_to_one_peer_fuse_by_max_watermark() {
        let peer = HookId::generate();
        let mut queued = events(peer, 7);
        assert!(queued.fuse(&events(peer, 3)));
        assert!(queued.fuse(&events(peer, 9)));
        assert_eq!(queued, events(peer, 9));
    }

    #[test]
    fn other_messages_never_fuse() {
        let peer = HookId::generate();
        let mut queued = events(peer, 1);
        assert!(!queued.fuse(&events(HookId::generate(), 5)));
        assert!(!queued.fuse(&SyncMessage::Handshake { peer }));

        let notice = SyncMessage::Authenticated(QueuedMessage {
            message_id: 1,
            destination: peer,
            body: AuthenticatedBody::HookRemoveRequest { removed: peer },
        });
        let mut copy = notice.clone();
        assert!(!copy.fuse(&notice));
        assert_eq!(notice.peer(), peer);
    }
}

//! Envelope framing.
//!
//! Every message on a link is framed as:
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | source (16) | destination (16) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is CBOR. The CRC covers every byte before it.

use crate::cbor::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::HookId;
use crate::messages::Payload;

/// Magic bytes opening every envelope.
pub const ENVELOPE_MAGIC: [u8; 4] = *b"OODM";

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + 1 + 16 + 16 + 4;
const CRC_SIZE: usize = 4;

/// Discriminant of a [`Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// [`Payload::Handshake`].
    Handshake = 1,
    /// [`Payload::Transactions`].
    Transactions = 2,
    /// [`Payload::ConfirmationOfReceipt`].
    ConfirmationOfReceipt = 3,
    /// [`Payload::TransactionIdCorrection`].
    TransactionIdCorrection = 4,
    /// [`Payload::Authenticated`].
    Authenticated = 5,
}

impl MessageKind {
    /// Converts from byte representation.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Handshake),
            2 => Some(Self::Transactions),
            3 => Some(Self::ConfirmationOfReceipt),
            4 => Some(Self::TransactionIdCorrection),
            5 => Some(Self::Authenticated),
            _ => None,
        }
    }

    /// Converts to byte representation.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns the kind of a payload.
    #[must_use]
    pub fn of(payload: &Payload) -> Self {
        match payload {
            Payload::Handshake(_) => Self::Handshake,
            Payload::Transactions(_) => Self::Transactions,
            Payload::ConfirmationOfReceipt(_) => Self::ConfirmationOfReceipt,
            Payload::TransactionIdCorrection(_) => Self::TransactionIdCorrection,
            Payload::Authenticated(_) => Self::Authenticated,
        }
    }
}

/// A routed message between two hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Sending hook.
    pub source: HookId,
    /// Receiving hook.
    pub destination: HookId,
    /// Message content.
    pub payload: Payload,
}

impl Envelope {
    /// Creates an envelope.
    #[must_use]
    pub fn new(source: HookId, destination: HookId, payload: Payload) -> Self {
        Self {
            source,
            destination,
            payload,
        }
    }

    /// Returns the payload kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        MessageKind::of(&self.payload)
    }

    /// Encodes the envelope into a frame.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let payload = to_cbor(&self.payload)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| ProtocolError::Encode("payload exceeds 4 GiB".into()))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&ENVELOPE_MAGIC);
        buf.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        buf.push(self.kind().as_byte());
        buf.extend_from_slice(self.source.as_bytes());
        buf.extend_from_slice(self.destination.as_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a frame produced by [`Envelope::encode`].
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        if frame.len() < HEADER_SIZE + CRC_SIZE {
            return Err(ProtocolError::Truncated {
                expected: HEADER_SIZE + CRC_SIZE,
                actual: frame.len(),
            });
        }
        if frame[0..4] != ENVELOPE_MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }
        let version = u16::from_le_bytes([frame[4], frame[5]]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: version,
            });
        }
        let kind_byte = frame[6];
        let kind = MessageKind::from_byte(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;
        let source = HookId::from_bytes(fixed16(&frame[7..23]));
        let destination = HookId::from_bytes(fixed16(&frame[23..39]));
        let len = u32::from_le_bytes([frame[39], frame[40], frame[41], frame[42]]) as usize;

        let total = HEADER_SIZE + len + CRC_SIZE;
        if frame.len() < total {
            return Err(ProtocolError::Truncated {
                expected: total,
                actual: frame.len(),
            });
        }
        let body_end = HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            frame[body_end],
            frame[body_end + 1],
            frame[body_end + 2],
            frame[body_end + 3],
        ]);
        let computed = crc32fast::hash(&frame[..body_end]);
        if stored != computed {
            return Err(ProtocolError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let payload: Payload = from_cbor(&frame[HEADER_SIZE..body_end])?;
        let payload_kind = MessageKind::of(&payload);
        if payload_kind != kind {
            return Err(ProtocolError::KindMismatch {
                header: kind.as_byte(),
                payload: payload_kind.as_byte(),
            });
        }
        Ok(Self {
            source,
            destination,
            payload,
        })
    }
}

fn fixed16(bytes: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TableEvent;
    use crate::ids::TransactionId;
    use crate::messages::{ConfirmationOfReceipt, TransactionIdCorrection};
    use crate::transaction::{TransactionBatch, WireTransaction};
    use std::collections::BTreeMap;

    fn batch_envelope() -> Envelope {
        let origin = HookId::generate();
        let transaction = WireTransaction {
            id: TransactionId::new(3),
            origin,
            origin_id: TransactionId::new(3),
            timestamp_utc: 1_700_000_000_000,
            known: BTreeMap::new(),
            resynchronization: false,
            events: vec![
                TableEvent::insert("person", vec![0x01], vec![0xa1, 0x01]),
                TableEvent::delete("person", vec![0x02]),
            ],
        };
        Envelope::new(
            origin,
            HookId::generate(),
            Payload::Transactions(TransactionBatch {
                transactions: vec![transaction],
                last_transaction_id: TransactionId::new(4),
            }),
        )
    }

    #[test]
    fn frame_preserves_routing_and_payload() {
        let envelope = batch_envelope();
        let frame = envelope.encode().unwrap();
        assert_eq!(&frame[0..4], b"OODM");

        let decoded = Envelope::decode(&frame).unwrap();
        assert_eq!(decoded.source, envelope.source);
        assert_eq!(decoded.destination, envelope.destination);
        assert_eq!(decoded.kind(), MessageKind::Transactions);
        let Payload::Transactions(batch) = decoded.payload else {
            panic!("expected transactions");
        };
        assert_eq!(batch.event_count(), 2);
        assert_eq!(batch.transactions[0].events[0].row, Some(vec![0xa1, 0x01]));
    }

    #[test]
    fn corrupted_frame_is_rejected() {
        let mut frame = batch_envelope().encode().unwrap();
        let mid = frame.len() / 2;
        frame[mid] ^= 0xff;
        assert!(matches!(
            Envelope::decode(&frame),
            Err(ProtocolError::ChecksumMismatch { .. }) | Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = batch_envelope().encode().unwrap();
        assert!(matches!(
            Envelope::decode(&frame[..frame.len() - 1]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(
            Envelope::decode(&frame[..10]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let envelope = Envelope::new(
            HookId::generate(),
            HookId::generate(),
            Payload::ConfirmationOfReceipt(ConfirmationOfReceipt {
                last_validated: TransactionId::new(9),
            }),
        );
        let mut frame = envelope.encode().unwrap();
        frame[0] = b'X';
        assert!(matches!(
            Envelope::decode(&frame),
            Err(ProtocolError::InvalidMagic)
        ));

        let mut frame = envelope.encode().unwrap();
        frame[4] = 9;
        assert!(matches!(
            Envelope::decode(&frame),
            Err(ProtocolError::VersionMismatch { remote: 9, .. })
        ));
    }

    #[test]
    fn header_kind_must_match_payload() {
        let envelope = Envelope::new(
            HookId::generate(),
            HookId::generate(),
            Payload::TransactionIdCorrection(TransactionIdCorrection {
                origin: HookId::generate(),
                validated: BTreeMap::new(),
            }),
        );
        let mut frame = envelope.encode().unwrap();
        frame[6] = MessageKind::Handshake.as_byte();
        let body_end = frame.len() - CRC_SIZE;
        let crc = crc32fast::hash(&frame[..body_end]);
        frame[body_end..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            Envelope::decode(&frame),
            Err(ProtocolError::KindMismatch { header: 1, payload: 4 })
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
                let _ = Envelope::decode(&bytes);
            }

            #[test]
            fn confirmations_survive_framing(id in any::<u64>()) {
                let envelope = Envelope::new(
                    HookId::generate(),
                    HookId::generate(),
                    Payload::ConfirmationOfReceipt(ConfirmationOfReceipt {
                        last_validated: TransactionId::new(id),
                    }),
                );
                let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
                prop_assert_eq!(decoded, envelope);
            }
        }
    }
}

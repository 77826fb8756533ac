//! Control payloads exchanged between peers.

use crate::cbor::to_cbor;
use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{HookId, TransactionId};
use crate::signing::MessageSigner;
use crate::transaction::TransactionBatch;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// First message on a new link, sent by both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Highest of the receiver's transaction ids the sender has accepted.
    pub last_validated_distant: TransactionId,
    /// Packages the sender replicates with the receiver. Empty means all.
    pub packages: BTreeSet<String>,
}

/// Acknowledges a batch: the sender has durably applied the receiver's
/// log up to `last_validated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationOfReceipt {
    /// Highest validated id of the receiver's log.
    pub last_validated: TransactionId,
}

/// Gossiped delivery knowledge.
///
/// `validated[target]` names one of `origin`'s transactions that `target`
/// holds. It says nothing of the transactions before it, which may have
/// travelled another way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionIdCorrection {
    /// Hook whose log the ids refer to.
    pub origin: HookId,
    /// Validated id per target hook.
    pub validated: BTreeMap<HookId, u64>,
}

/// Body of an authenticated peer-management message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticatedBody {
    /// Ask the destination to forget `removed`.
    HookRemoveRequest {
        /// Hook being removed.
        removed: HookId,
    },
    /// Announce package support of a set of hooks.
    HookSynchronizeRequest {
        /// Supported packages per hook. An empty set means every package.
        packages: BTreeMap<HookId, BTreeSet<String>>,
        /// Whether the destination should let incoming snapshot rows
        /// replace its conflicting local rows.
        replace_conflicts: bool,
    },
}

/// A signed, individually acknowledged message.
///
/// Message ids are strictly increasing per (source, destination) pair and
/// are assigned when the message is queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedMessage {
    /// Per-destination sequence number.
    pub message_id: u64,
    /// Sending hook.
    pub source: HookId,
    /// Receiving hook.
    pub destination: HookId,
    /// Message content.
    pub body: AuthenticatedBody,
    /// Identifier of the signing key.
    pub key_id: String,
    /// Signature over [`AuthenticatedMessage::signed_bytes`].
    pub signature: Vec<u8>,
}

impl AuthenticatedMessage {
    /// Creates and signs a message.
    pub fn signed(
        message_id: u64,
        source: HookId,
        destination: HookId,
        body: AuthenticatedBody,
        signer: &dyn MessageSigner,
    ) -> ProtocolResult<Self> {
        let mut message = Self {
            message_id,
            source,
            destination,
            body,
            key_id: signer.key_id().to_string(),
            signature: Vec::new(),
        };
        message.signature = signer.sign(&message.signed_bytes()?);
        Ok(message)
    }

    /// Bytes covered by the signature.
    pub fn signed_bytes(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(&(self.message_id, self.source, self.destination, &self.body))
    }

    /// Verifies the signature.
    pub fn verify(&self, signer: &dyn MessageSigner) -> ProtocolResult<()> {
        let data = self.signed_bytes()?;
        if signer.verify(&self.key_id, &data, &self.signature) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidSignature {
                message_id: self.message_id,
                source_hook: self.source.to_string(),
            })
        }
    }
}

/// Everything that can travel inside an [`Envelope`](crate::Envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Link opening.
    Handshake(Handshake),
    /// Log shipping.
    Transactions(TransactionBatch),
    /// Batch acknowledgement.
    ConfirmationOfReceipt(ConfirmationOfReceipt),
    /// Cursor gossip.
    TransactionIdCorrection(TransactionIdCorrection),
    /// Peer management.
    Authenticated(AuthenticatedMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::HmacSha256Signer;

    fn remove_request(signer: &HmacSha256Signer) -> AuthenticatedMessage {
        AuthenticatedMessage::signed(
            7,
            HookId::generate(),
            HookId::generate(),
            AuthenticatedBody::HookRemoveRequest {
                removed: HookId::generate(),
            },
            signer,
        )
        .unwrap()
    }

    #[test]
    fn signed_message_verifies() {
        let signer = HmacSha256Signer::new("k1", b"shared secret".to_vec());
        let message = remove_request(&signer);
        assert_eq!(message.key_id, "k1");
        message.verify(&signer).unwrap();
    }

    #[test]
    fn tampered_message_is_rejected() {
        let signer = HmacSha256Signer::new("k1", b"shared secret".to_vec());
        let mut message = remove_request(&signer);
        message.message_id += 1;
        assert!(matches!(
            message.verify(&signer),
            Err(ProtocolError::InvalidSignature { message_id: 8, .. })
        ));
    }

    #[test]
    fn foreign_key_is_rejected() {
        let signer = HmacSha256Signer::new("k1", b"shared secret".to_vec());
        let other = HmacSha256Signer::new("k1", b"another secret".to_vec());
        let message = remove_request(&signer);
        assert!(message.verify(&other).is_err());
    }
}

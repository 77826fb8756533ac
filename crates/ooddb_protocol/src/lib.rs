//! # ooddb protocol
//!
//! Types exchanged between ooddb peers.
//!
//! This crate provides:
//! - Identifiers (`HookId`, `TransactionId`)
//! - `TableEvent`, the unit of replicated change
//! - `WireTransaction` and `TransactionBatch` for log shipping
//! - Control payloads (handshake, confirmations, cursor corrections)
//! - Authenticated peer-management messages and the `MessageSigner` contract
//! - `Envelope` framing with integrity checks
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod envelope;
mod error;
mod event;
mod ids;
mod messages;
mod signing;
mod transaction;

pub use cbor::{from_cbor, to_cbor};
pub use envelope::{Envelope, MessageKind, ENVELOPE_MAGIC, PROTOCOL_VERSION};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{EventKind, EventTypes, RowVersion, TableEvent};
pub use ids::{HookId, TransactionId};
pub use messages::{
    AuthenticatedBody, AuthenticatedMessage, ConfirmationOfReceipt, Handshake, Payload,
    TransactionIdCorrection,
};
pub use signing::{HmacSha256Signer, MessageSigner};
pub use transaction::{TransactionBatch, WireTransaction};

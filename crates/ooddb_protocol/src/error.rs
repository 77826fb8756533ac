//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or authenticating messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR serialization failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR deserialization failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// Frame does not start with the envelope magic.
    #[error("invalid envelope magic")]
    InvalidMagic,

    /// Frame was produced by an incompatible protocol version.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Local protocol version.
        local: u16,
        /// Remote protocol version.
        remote: u16,
    },

    /// Unknown message kind tag.
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    /// Header kind disagrees with the decoded payload.
    #[error("message kind mismatch: header={header}, payload={payload}")]
    KindMismatch {
        /// Kind announced in the header.
        header: u8,
        /// Kind of the decoded payload.
        payload: u8,
    },

    /// Frame ended before the announced length.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// CRC mismatch.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Signature of an authenticated message did not verify.
    #[error("invalid signature on message {message_id} from {source_hook}")]
    InvalidSignature {
        /// Message id.
        message_id: u64,
        /// Hook that claims to have sent it.
        source_hook: String,
    },
}

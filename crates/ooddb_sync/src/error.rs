//! Error types for peer synchronization.

use ooddb_core::CoreError;
use ooddb_protocol::{HookId, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Malformed or unauthenticated message.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Database error while applying or exporting.
    #[error("database error: {0}")]
    Database(#[from] CoreError),

    /// A message reached the wrong hook.
    #[error("message for {actual} delivered to {expected}")]
    Misaddressed {
        /// This host.
        expected: HookId,
        /// Destination written in the message.
        actual: HookId,
    },

    /// The dispatcher was closed.
    #[error("sync cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// No link to the peer.
    #[error("not connected to {0}")]
    NotConnected(HookId),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NotConnected(_) => true,
            SyncError::Database(e) => matches!(e, CoreError::Io(_) | CoreError::DatabaseLocked { .. }),
            _ => false,
        }
    }

    /// Returns true when the peer broke the protocol and its link should
    /// be dropped.
    pub fn is_peer_fatal(&self) -> bool {
        match self {
            SyncError::Database(e) => e.is_peer_fatal(),
            SyncError::Protocol(_) | SyncError::Misaddressed { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("bad certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::NotConnected(HookId::generate()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Database(CoreError::DatabaseClosed).is_retryable());
    }

    #[test]
    fn peer_fatal_errors() {
        let hook = HookId::generate();
        assert!(SyncError::Database(CoreError::UnknownPeer(hook)).is_peer_fatal());
        assert!(SyncError::Protocol(ProtocolError::InvalidMagic).is_peer_fatal());
        assert!(!SyncError::Timeout.is_peer_fatal());
    }

    #[test]
    fn error_display() {
        let hook = HookId::generate();
        let err = SyncError::NotConnected(hook);
        assert_eq!(err.to_string(), format!("not connected to {hook}"));
        assert_eq!(SyncError::Cancelled.to_string(), "sync cancelled");
    }
}

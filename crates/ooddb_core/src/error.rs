//! Error types for the core crate.

use ooddb_protocol::{HookId, ProtocolError};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core database operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error from the file system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-level error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Applying a record would violate a database invariant.
    ///
    /// Fatal to the enclosing transaction, which is rolled back.
    #[error("integrity error on table '{table}': {message}")]
    Integrity {
        /// Table being modified.
        table: String,
        /// Description of the violation.
        message: String,
    },

    /// Stored schema differs from the declared one.
    #[error("schema version mismatch for table '{table}': stored {stored:#018x}, declared {declared:#018x}")]
    VersionMismatch {
        /// Table name.
        table: String,
        /// Fingerprint found in the database.
        stored: u64,
        /// Fingerprint of the declaration.
        declared: u64,
    },

    /// A field value does not fit its declared type.
    #[error("field error on '{table}.{field}': {message}")]
    Field {
        /// Table name.
        table: String,
        /// Field name.
        field: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A peer's validated transaction id would move backwards.
    #[error("cursor regression for hook {hook}: current {current}, attempted {attempted}")]
    CursorRegression {
        /// Peer concerned.
        hook: HookId,
        /// Recorded value.
        current: u64,
        /// Rejected value.
        attempted: u64,
    },

    /// Message from or about a hook that is not registered.
    #[error("unknown peer: {0}")]
    UnknownPeer(HookId),

    /// `init_local_hook` called twice.
    #[error("local hook already exists: {0}")]
    LocalHookAlreadyExists(HookId),

    /// An operation needs the local hook before it was initialized.
    #[error("local hook is not initialized")]
    LocalHookMissing,

    /// Table was never registered.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Invalid operation.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Error message.
        message: String,
    },

    /// Database has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Database directory is locked by another process.
    #[error("database is locked: {path}")]
    DatabaseLocked {
        /// Locked path.
        path: String,
    },

    /// Failure reported by the storage engine.
    #[error("storage engine error: {message}")]
    Engine {
        /// Error message.
        message: String,
    },

    /// Framed file is damaged.
    #[error("corrupted file at offset {offset}: {reason}")]
    Corruption {
        /// Offset of the damaged frame.
        offset: u64,
        /// Reason.
        reason: String,
    },

    /// Checksum mismatch.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Backup file handling failed.
    #[error("backup error: {message}")]
    Backup {
        /// Error message.
        message: String,
    },

    /// The data transaction committed but its backup increment was not written.
    ///
    /// A new backup reference is owed and will be produced on the next commit.
    #[error("backup write failed after commit: {source}")]
    BackupWriteFailed {
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// No backup covers the requested instant.
    #[error("no restore point at or before {utc}")]
    NoRestorePoint {
        /// Requested instant, milliseconds since the Unix epoch.
        utc: u64,
    },
}

impl CoreError {
    /// Creates an integrity error.
    pub fn integrity(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Integrity {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates a field error.
    pub fn field(
        table: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Field {
            table: table.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a storage engine error.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Creates a backup error.
    pub fn backup(message: impl Into<String>) -> Self {
        Self::Backup {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corruption {
            offset,
            reason: reason.into(),
        }
    }

    /// Returns true for errors that indicate a protocol violation by a peer
    /// and must not be retried.
    #[must_use]
    pub fn is_peer_fatal(&self) -> bool {
        matches!(self, Self::CursorRegression { .. } | Self::UnknownPeer(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_build_expected_variants() {
        let err = CoreError::integrity("person", "duplicate key");
        assert_eq!(
            err.to_string(),
            "integrity error on table 'person': duplicate key"
        );

        let err = CoreError::field("person", "age", "expected integer");
        assert!(matches!(err, CoreError::Field { ref field, .. } if field == "age"));
    }

    #[test]
    fn peer_fatal_classification() {
        let hook = HookId::generate();
        assert!(CoreError::UnknownPeer(hook).is_peer_fatal());
        assert!(CoreError::CursorRegression {
            hook,
            current: 5,
            attempted: 3
        }
        .is_peer_fatal());
        assert!(!CoreError::DatabaseClosed.is_peer_fatal());
    }
}

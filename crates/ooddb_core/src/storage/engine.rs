//! Contract of the underlying storage engine.
//!
//! The wrapper never speaks SQL; it needs ordered key/value tables, native
//! transactions with optional savepoints, and a few capability flags. A
//! driver for a real engine implements these two traits.

use crate::error::CoreResult;
use crate::types::IsolationLevel;

/// A rows-as-bytes storage engine.
pub trait StorageEngine: Send + Sync {
    /// Engine name, for diagnostics.
    fn name(&self) -> &str;

    /// Isolation levels the engine can honor.
    fn supported_isolation_levels(&self) -> Vec<IsolationLevel>;

    /// Whether nested savepoints are available.
    fn supports_savepoints(&self) -> bool;

    /// Whether connections may be used concurrently from several threads.
    fn is_thread_safe(&self) -> bool;

    /// Opens a new connection.
    fn connect(&self) -> CoreResult<Box<dyn Connection>>;

    /// Returns true if `table` exists.
    fn table_exists(&self, table: &str) -> CoreResult<bool>;

    /// Creates `table`; a no-op when it exists.
    fn create_table(&self, table: &str) -> CoreResult<()>;
}

/// One engine connection.
///
/// With auto-commit disabled every mutation belongs to an implicit native
/// transaction ended by [`Connection::commit`] or [`Connection::rollback`].
pub trait Connection: Send {
    /// Enables or disables auto-commit.
    fn set_auto_commit(&mut self, enabled: bool) -> CoreResult<()>;

    /// Sets the isolation of the next native transaction.
    fn set_isolation(&mut self, level: IsolationLevel) -> CoreResult<()>;

    /// Commits the native transaction.
    fn commit(&mut self) -> CoreResult<()>;

    /// Rolls back the native transaction.
    fn rollback(&mut self) -> CoreResult<()>;

    /// Creates a named savepoint.
    fn savepoint(&mut self, name: &str) -> CoreResult<()>;

    /// Undoes everything after the named savepoint, keeping it.
    fn rollback_to_savepoint(&mut self, name: &str) -> CoreResult<()>;

    /// Forgets the named savepoint, keeping its changes.
    fn release_savepoint(&mut self, name: &str) -> CoreResult<()>;

    /// Reads one row.
    fn get(&mut self, table: &str, key: &[u8]) -> CoreResult<Option<Vec<u8>>>;

    /// Inserts or replaces one row.
    fn put(&mut self, table: &str, key: &[u8], row: &[u8]) -> CoreResult<()>;

    /// Deletes one row; returns whether it existed.
    fn delete(&mut self, table: &str, key: &[u8]) -> CoreResult<bool>;

    /// Up to `limit` rows with key `>= start`, ascending.
    fn scan_from(
        &mut self,
        table: &str,
        start: &[u8],
        limit: usize,
    ) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Every row of `table`, ascending.
    fn scan(&mut self, table: &str) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_from(table, &[], usize::MAX)
    }

    /// Closes the connection, discarding uncommitted work.
    fn close(&mut self) -> CoreResult<()>;

    /// Returns true once closed.
    fn is_closed(&self) -> bool;
}

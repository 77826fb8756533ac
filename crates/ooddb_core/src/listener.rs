//! Notifications raised by a [`Database`](crate::Database).

use crate::hooks::Hook;
use ooddb_protocol::TransactionId;

/// Receives database notifications.
///
/// Callbacks run on the thread that caused them, after the change is
/// durable. They must not block for long.
pub trait DatabaseListener: Send + Sync {
    /// A transaction reached the log and may now be shipped to peers.
    fn transaction_logged(&self, _id: TransactionId) {}

    /// A peer was removed.
    fn hook_removed(&self, _hook: &Hook) {}

    /// Changes received from a peer were applied.
    fn new_database_event_detected(&self) {}
}

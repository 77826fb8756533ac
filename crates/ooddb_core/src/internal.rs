//! Tables the wrapper keeps next to the user's data.
//!
//! They live in the same engine so that logging, cursor moves and data
//! changes commit or roll back together.

/// Single row holding the last assigned transaction id.
pub(crate) const TRANSACTION_COUNTER: &str = "__ood_transaction_counter";
/// Logged transaction headers by id.
pub(crate) const TRANSACTIONS: &str = "__ood_transactions";
/// Logged events by (transaction id, sequence).
pub(crate) const TRANSACTION_EVENTS: &str = "__ood_transaction_events";
/// Origin stamp of the last write per row.
pub(crate) const VERSIONS: &str = "__ood_versions";
/// Registered hooks.
pub(crate) const HOOKS: &str = "__ood_hooks";
/// Outbound authenticated messages by (destination, message id).
pub(crate) const HOOK_MESSAGES: &str = "__ood_hook_messages";
/// Indirect delivery knowledge by (server, target).
pub(crate) const CURSORS: &str = "__ood_cursors";
/// Delivery facts waiting to be gossiped, by (destination, origin, target, id).
pub(crate) const PENDING_CORRECTIONS: &str = "__ood_pending_corrections";
/// Fingerprints of registered table declarations.
pub(crate) const SCHEMAS: &str = "__ood_schemas";

pub(crate) const ALL: [&str; 9] = [
    TRANSACTION_COUNTER,
    TRANSACTIONS,
    TRANSACTION_EVENTS,
    VERSIONS,
    HOOKS,
    HOOK_MESSAGES,
    CURSORS,
    PENDING_CORRECTIONS,
    SCHEMAS,
];

/// Concatenates key parts.
pub(crate) fn key(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

/// Reads a hook id from a 16-byte key segment.
pub(crate) fn hook_from_slice(bytes: &[u8]) -> Option<ooddb_protocol::HookId> {
    <[u8; 16]>::try_from(bytes)
        .ok()
        .map(ooddb_protocol::HookId::from_bytes)
}

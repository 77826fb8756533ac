//! Outbound authenticated messages, persisted until sent.

use crate::codec::{decode, encode};
use crate::error::CoreResult;
use crate::internal::{key, HOOK_MESSAGES};
use crate::storage::Connection;
use ooddb_protocol::{AuthenticatedBody, HookId};
use serde::{Deserialize, Serialize};

/// A message waiting for delivery.
///
/// Signing happens at send time; the queue only keeps the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Per-destination sequence number.
    pub message_id: u64,
    /// Receiving hook.
    pub destination: HookId,
    /// Content.
    pub body: AuthenticatedBody,
}

fn message_key(destination: HookId, message_id: u64) -> Vec<u8> {
    key(&[destination.as_bytes(), &message_id.to_be_bytes()])
}

pub(crate) fn put(conn: &mut dyn Connection, message: &QueuedMessage) -> CoreResult<()> {
    conn.put(
        HOOK_MESSAGES,
        &message_key(message.destination, message.message_id),
        &encode(message)?,
    )
}

/// Messages for `destination`, oldest first.
pub(crate) fn pending(
    conn: &mut dyn Connection,
    destination: HookId,
) -> CoreResult<Vec<QueuedMessage>> {
    let prefix = destination.as_bytes();
    let mut out = Vec::new();
    for (k, v) in conn.scan_from(HOOK_MESSAGES, prefix, usize::MAX)? {
        if !k.starts_with(prefix) {
            break;
        }
        out.push(decode(&v)?);
    }
    Ok(out)
}

pub(crate) fn take(
    conn: &mut dyn Connection,
    destination: HookId,
    message_id: u64,
) -> CoreResult<Option<QueuedMessage>> {
    let k = message_key(destination, message_id);
    let Some(bytes) = conn.get(HOOK_MESSAGES, &k)? else {
        return Ok(None);
    };
    conn.delete(HOOK_MESSAGES, &k)?;
    decode(&bytes).map(Some)
}

pub(crate) fn clear(conn: &mut dyn Connection, destination: HookId) -> CoreResult<usize> {
    let queued = pending(conn, destination)?;
    for message in &queued {
        conn.delete(HOOK_MESSAGES, &message_key(destination, message.message_id))?;
    }
    Ok(queued.len())
}

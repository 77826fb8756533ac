//! Indirect delivery knowledge.
//!
//! `(server, target) -> n` records the highest of `server`'s transactions
//! `target` is known to hold, learned from relays and gossiped
//! corrections. Relays travel per package, so `target` may still miss
//! lower ids: the value only ever spares a relay-only route, never a
//! delivery to a hook the transaction concerns.

use crate::error::CoreResult;
use crate::internal::{hook_from_slice, key, CURSORS};
use crate::storage::Connection;
use ooddb_protocol::HookId;
use std::collections::BTreeMap;

fn cursor_key(server: HookId, target: HookId) -> Vec<u8> {
    key(&[server.as_bytes(), target.as_bytes()])
}

fn decode_value(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    if bytes.len() == 8 {
        buf.copy_from_slice(bytes);
    }
    u64::from_be_bytes(buf)
}

/// Recorded value, 0 when unknown.
pub(crate) fn get(conn: &mut dyn Connection, server: HookId, target: HookId) -> CoreResult<u64> {
    Ok(conn
        .get(CURSORS, &cursor_key(server, target))?
        .map_or(0, |v| decode_value(&v)))
}

/// Raises the cursor to `value`; returns whether it moved.
pub(crate) fn advance(
    conn: &mut dyn Connection,
    server: HookId,
    target: HookId,
    value: u64,
) -> CoreResult<bool> {
    if get(conn, server, target)? >= value {
        return Ok(false);
    }
    conn.put(CURSORS, &cursor_key(server, target), &value.to_be_bytes())?;
    Ok(true)
}

/// Every target known for `server`.
pub(crate) fn for_server(
    conn: &mut dyn Connection,
    server: HookId,
) -> CoreResult<BTreeMap<HookId, u64>> {
    let prefix = server.as_bytes();
    let mut out = BTreeMap::new();
    for (k, v) in conn.scan_from(CURSORS, prefix, usize::MAX)? {
        if !k.starts_with(prefix) {
            break;
        }
        if let Some(target) = k.get(16..32).and_then(hook_from_slice) {
            out.insert(target, decode_value(&v));
        }
    }
    Ok(out)
}

/// Deletes every cursor naming `hook` as server or target.
pub(crate) fn forget(conn: &mut dyn Connection, hook: HookId) -> CoreResult<usize> {
    let mut removed = 0;
    for (k, _) in conn.scan(CURSORS)? {
        if k.get(..16) == Some(&hook.as_bytes()[..]) || k.get(16..32) == Some(&hook.as_bytes()[..])
        {
            conn.delete(CURSORS, &k)?;
            removed += 1;
        }
    }
    Ok(removed)
}

//! Origin stamps of the last write to each row.
//!
//! A stamp survives the row's deletion so that a late update from a peer
//! that never saw the delete is still recognized as concurrent.

use crate::codec::{decode, encode};
use crate::error::CoreResult;
use crate::internal::{key, VERSIONS};
use crate::storage::Connection;
use ooddb_protocol::{HookId, RowVersion, TransactionId};
use serde::{Deserialize, Serialize};

/// Who last wrote a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStamp {
    /// Producing hook.
    pub origin: HookId,
    /// Transaction id in the producer's log.
    pub origin_id: TransactionId,
}

impl From<VersionStamp> for RowVersion {
    fn from(stamp: VersionStamp) -> Self {
        RowVersion {
            origin: stamp.origin,
            origin_id: stamp.origin_id,
        }
    }
}

fn stamp_key(table: &str, primary_key: &[u8]) -> Vec<u8> {
    key(&[table.as_bytes(), &[0], primary_key])
}

pub(crate) fn get(
    conn: &mut dyn Connection,
    table: &str,
    primary_key: &[u8],
) -> CoreResult<Option<VersionStamp>> {
    conn.get(VERSIONS, &stamp_key(table, primary_key))?
        .map(|bytes| decode(&bytes))
        .transpose()
}

pub(crate) fn set(
    conn: &mut dyn Connection,
    table: &str,
    primary_key: &[u8],
    stamp: VersionStamp,
) -> CoreResult<()> {
    conn.put(VERSIONS, &stamp_key(table, primary_key), &encode(&stamp)?)
}

/// Forgets every stamp of `table`.
pub(crate) fn forget_table(conn: &mut dyn Connection, table: &str) -> CoreResult<usize> {
    let prefix = key(&[table.as_bytes(), &[0]]);
    let mut removed = 0;
    for (k, _) in conn.scan_from(VERSIONS, &prefix, usize::MAX)? {
        if !k.starts_with(&prefix) {
            break;
        }
        conn.delete(VERSIONS, &k)?;
        removed += 1;
    }
    Ok(removed)
}

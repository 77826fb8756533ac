//! Delivery facts owed to peers.
//!
//! Every fact learned about who holds which transaction is queued here
//! for each other peer, whether or not it is connected, and leaves the
//! queue once sent to it.

use crate::error::CoreResult;
use crate::internal::{hook_from_slice, key, PENDING_CORRECTIONS};
use crate::storage::Connection;
use ooddb_protocol::{HookId, TransactionIdCorrection};
use std::collections::BTreeMap;

fn fact_key(destination: HookId, origin: HookId, target: HookId, id: u64) -> Vec<u8> {
    key(&[
        destination.as_bytes(),
        origin.as_bytes(),
        target.as_bytes(),
        &id.to_be_bytes(),
    ])
}

fn split(k: &[u8]) -> Option<(HookId, HookId, HookId, u64)> {
    let destination = hook_from_slice(k.get(..16)?)?;
    let origin = hook_from_slice(k.get(16..32)?)?;
    let target = hook_from_slice(k.get(32..48)?)?;
    let id = u64::from_be_bytes(k.get(48..56)?.try_into().ok()?);
    Some((destination, origin, target, id))
}

/// Queues every entry of `correction` for `destination`.
pub(crate) fn record(
    conn: &mut dyn Connection,
    destination: HookId,
    correction: &TransactionIdCorrection,
) -> CoreResult<()> {
    for (&target, &id) in &correction.validated {
        conn.put(
            PENDING_CORRECTIONS,
            &fact_key(destination, correction.origin, target, id),
            &[],
        )?;
    }
    Ok(())
}

/// Facts owed to `destination`, one correction per fact, in key order.
pub(crate) fn pending(
    conn: &mut dyn Connection,
    destination: HookId,
) -> CoreResult<Vec<TransactionIdCorrection>> {
    let prefix = destination.as_bytes();
    let mut out = Vec::new();
    for (k, _) in conn.scan_from(PENDING_CORRECTIONS, prefix, usize::MAX)? {
        if !k.starts_with(prefix) {
            break;
        }
        if let Some((_, origin, target, id)) = split(&k) {
            out.push(TransactionIdCorrection {
                origin,
                validated: BTreeMap::from([(target, id)]),
            });
        }
    }
    Ok(out)
}

/// Drops the facts of `correction` from the queue of `destination`.
pub(crate) fn sent(
    conn: &mut dyn Connection,
    destination: HookId,
    correction: &TransactionIdCorrection,
) -> CoreResult<usize> {
    let mut removed = 0;
    for (&target, &id) in &correction.validated {
        let k = fact_key(destination, correction.origin, target, id);
        if conn.get(PENDING_CORRECTIONS, &k)?.is_some() {
            conn.delete(PENDING_CORRECTIONS, &k)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Deletes every fact naming `hook`, in any position.
pub(crate) fn forget(conn: &mut dyn Connection, hook: HookId) -> CoreResult<usize> {
    let mut removed = 0;
    for (k, _) in conn.scan(PENDING_CORRECTIONS)? {
        let Some((destination, origin, target, _)) = split(&k) else {
            continue;
        };
        if destination == hook || origin == hook || target == hook {
            conn.delete(PENDING_CORRECTIONS, &k)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal;
    use crate::storage::{MemoryEngine, StorageEngine};

    fn conn() -> Box<dyn Connection> {
        let engine = MemoryEngine::new("gossip");
        for table in internal::ALL {
            engine.create_table(table).unwrap();
        }
        engine.connect().unwrap()
    }

    fn fact(origin: HookId, target: HookId, id: u64) -> TransactionIdCorrection {
        TransactionIdCorrection {
            origin,
            validated: BTreeMap::from([(target, id)]),
        }
    }

    #[test]
    fn facts_wait_per_destination_until_sent() {
        let mut conn = conn();
        let (a, b, origin, target) = (
            HookId::generate(),
            HookId::generate(),
            HookId::generate(),
            HookId::generate(),
        );
        record(conn.as_mut(), a, &fact(origin, target, 4)).unwrap();
        record(conn.as_mut(), a, &fact(origin, target, 2)).unwrap();
        record(conn.as_mut(), b, &fact(origin, target, 4)).unwrap();

        let owed = pending(conn.as_mut(), a).unwrap();
        assert_eq!(owed, vec![fact(origin, target, 2), fact(origin, target, 4)]);

        assert_eq!(sent(conn.as_mut(), a, &owed[0]).unwrap(), 1);
        assert_eq!(sent(conn.as_mut(), a, &owed[0]).unwrap(), 0);
        assert_eq!(pending(conn.as_mut(), a).unwrap().len(), 1);
        assert_eq!(pending(conn.as_mut(), b).unwrap().len(), 1);
    }

    #[test]
    fn forgetting_a_hook_drops_every_fact_naming_it() {
        let mut conn = conn();
        let (a, b, c) = (HookId::generate(), HookId::generate(), HookId::generate());
        record(conn.as_mut(), a, &fact(b, c, 1)).unwrap();
        record(conn.as_mut(), b, &fact(a, c, 1)).unwrap();
        record(conn.as_mut(), c, &fact(b, a, 1)).unwrap();
        record(conn.as_mut(), c, &fact(b, b, 1)).unwrap();

        assert_eq!(forget(conn.as_mut(), a).unwrap(), 3);
        assert_eq!(pending(conn.as_mut(), c).unwrap(), vec![fact(b, b, 1)]);
    }
}

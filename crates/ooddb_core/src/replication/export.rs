//! Reading the log for one peer.

use crate::commit::Shared;
use crate::database::Database;
use crate::error::CoreResult;
use crate::hooks::{cursor, Hook};
use crate::log::LoggedTransaction;
use crate::storage::Connection;
use ooddb_protocol::{HookId, TableEvent, TransactionBatch};
use std::collections::BTreeSet;

/// Whether `header` goes to `peer`.
///
/// A transaction goes to the peer it concerns, and also to any connected
/// peer when it concerns a hook that is not connected, which the peer may
/// relay. A relay-only route is skipped when the peer is known to hold the
/// origin's transaction already.
fn routed_to(
    conn: &mut dyn Connection,
    local: HookId,
    peer: HookId,
    connected: &BTreeSet<HookId>,
    header: &LoggedTransaction,
) -> CoreResult<bool> {
    if header.origin == peer {
        return Ok(false);
    }
    let Some(hooks) = &header.concerned else {
        return Ok(true);
    };
    if hooks.contains(&peer) {
        return Ok(true);
    }
    if !hooks.iter().any(|h| *h != local && !connected.contains(h)) {
        return Ok(false);
    }
    Ok(cursor::get(conn, header.origin, peer)? < header.origin_id.as_u64())
}

fn events_for(
    shared: &Shared,
    conn: &mut dyn Connection,
    peer: &Hook,
    header: &LoggedTransaction,
) -> CoreResult<Vec<TableEvent>> {
    let mut out = Vec::new();
    for event in shared.log.events(conn, header)? {
        if peer.supports(shared.catalog.get(&event.table)?.package()) {
            out.push(event);
        }
    }
    Ok(out)
}

impl Database {
    /// Next batch of logged transactions for `peer`, after its confirmed
    /// position.
    ///
    /// Whole transactions are read until `max_events` is reached; the
    /// first one is always included. Events of packages the peer does not
    /// replicate are left out. `connected` lists the peers currently
    /// reachable. Returns `None` when the peer is up to date.
    ///
    /// # Errors
    ///
    /// `UnknownPeer` if `peer` is not an active peer.
    pub fn export_transactions(
        &self,
        peer: HookId,
        max_events: usize,
        connected: &BTreeSet<HookId>,
    ) -> CoreResult<Option<TransactionBatch>> {
        let shared = self.shared();
        self.with_read(|conn| {
            let local = shared.hooks.require_local(conn)?;
            let hook = shared.hooks.require_active(conn, peer)?;
            let start = hook.last_validated_local_transaction_id;
            let mut last = start;
            let mut transactions = Vec::new();
            let mut events = 0usize;
            shared.log.walk_after(conn, start, |conn, header| {
                if !transactions.is_empty() && events + header.event_count as usize > max_events {
                    return Ok(false);
                }
                last = header.id;
                if routed_to(conn, local.id, peer, connected, &header)? {
                    let selected = events_for(shared, conn, &hook, &header)?;
                    if !selected.is_empty() {
                        events += selected.len();
                        transactions.push(header.to_wire(selected));
                    }
                }
                Ok(events < max_events)
            })?;
            if last == start {
                return Ok(None);
            }
            Ok(Some(TransactionBatch {
                transactions,
                last_transaction_id: last,
            }))
        })
    }

    /// Returns true if the log holds something `peer` still needs.
    pub fn has_pending_for(&self, peer: HookId, connected: &BTreeSet<HookId>) -> CoreResult<bool> {
        let shared = self.shared();
        self.with_read(|conn| {
            let local = shared.hooks.require_local(conn)?;
            let hook = shared.hooks.require_active(conn, peer)?;
            let mut pending = false;
            shared
                .log
                .walk_after(conn, hook.last_validated_local_transaction_id, |conn, header| {
                    if routed_to(conn, local.id, peer, connected, &header)?
                        && !events_for(shared, conn, &hook, &header)?.is_empty()
                    {
                        pending = true;
                        return Ok(false);
                    }
                    Ok(true)
                })?;
            Ok(pending)
        })
    }
}

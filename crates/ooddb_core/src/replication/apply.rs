//! Applying transactions received from a peer.

use crate::collision::Collision;
use crate::commit::Shared;
use crate::database::Database;
use crate::error::CoreResult;
use crate::hooks::{cursor, Hook};
use crate::log::{version, PendingTransaction, VersionStamp};
use crate::schema::TableSchema;
use crate::storage::Connection;
use ooddb_protocol::{
    HookId, RowVersion, TableEvent, TransactionBatch, TransactionId, WireTransaction,
};
use std::collections::BTreeSet;
use tracing::{debug, info, trace};

/// Result of [`Database::apply_transactions`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Transactions applied, fully or partly.
    pub applied_transactions: usize,
    /// Transactions already applied before.
    pub skipped_transactions: usize,
    /// Row changes applied.
    pub applied_events: usize,
    /// Row changes refused by the collision policy.
    pub rejected_events: usize,
    /// Conflicts handed to the collision policy.
    pub collisions: usize,
    /// Relays logged for other peers.
    pub relayed: Vec<TransactionId>,
    /// Local transactions re-asserting refused rows.
    pub reasserted: Vec<TransactionId>,
    /// Sender position to confirm.
    pub last_validated: TransactionId,
}

enum Verdict {
    Apply,
    Skip,
    Reject,
}

#[derive(Default)]
struct Applied {
    skipped: bool,
    accepted: Vec<TableEvent>,
    rejected: usize,
    collisions: usize,
    relayed: Option<TransactionId>,
    reasserted: Option<TransactionId>,
}

/// Per-transaction context of the apply loop.
struct Incoming<'a> {
    shared: &'a Shared,
    local: HookId,
    source: &'a Hook,
    remote: &'a WireTransaction,
}

impl Incoming<'_> {
    fn decide(
        &self,
        conn: &mut dyn Connection,
        schema: &TableSchema,
        event: &TableEvent,
        applied: &mut Applied,
    ) -> CoreResult<Verdict> {
        let remote = self.remote;
        let stamp = version::get(conn, &event.table, &event.primary_key)?;
        let current = conn.get(&event.table, &event.primary_key)?;
        let Some(stamp) = stamp else {
            if remote.resynchronization
                && current.is_some()
                && current != event.row
                && !self.source.replace_conflicts_on_resynchronization
            {
                return Ok(Verdict::Reject);
            }
            return Ok(Verdict::Apply);
        };
        if stamp.origin == remote.origin {
            return Ok(if stamp.origin_id >= remote.origin_id {
                Verdict::Skip
            } else {
                Verdict::Apply
            });
        }
        let replaced = event
            .base
            .is_some_and(|base| base.covers(&RowVersion::from(stamp)));
        if replaced
            || remote.knows(stamp.origin) >= stamp.origin_id.as_u64()
            || current == event.row
        {
            return Ok(Verdict::Apply);
        }

        applied.collisions += 1;
        let incoming = event.row.as_deref().map(|r| schema.decode_row(r)).transpose()?;
        let existing = current.as_deref().map(|r| schema.decode_row(r)).transpose()?;
        let key = schema.key_values(&event.primary_key)?;
        let collision = Collision {
            local: self.local,
            peer: self.source.id,
            kind: event.kind,
            table: &event.table,
            primary_key: &key,
            incoming: incoming.as_ref(),
            current: existing.as_ref(),
            incoming_origin: remote.origin,
            current_origin: stamp.origin,
        };
        let resolver = self.shared.resolver();
        let direct = remote.origin == self.source.id && stamp.origin == self.local;
        let accept = if direct {
            resolver.direct_collision_detected(&collision)
        } else {
            let third_peer = if remote.origin == self.source.id {
                stamp.origin
            } else {
                remote.origin
            };
            resolver.indirect_collision_detected(&collision, third_peer)
        };
        info!(
            table = %event.table,
            peer = %self.source.id,
            direct,
            accept,
            "collision resolved"
        );
        Ok(if accept { Verdict::Apply } else { Verdict::Reject })
    }

    fn apply_event(
        &self,
        conn: &mut dyn Connection,
        schema: &TableSchema,
        event: &TableEvent,
    ) -> CoreResult<()> {
        match &event.row {
            Some(row) => {
                schema.decode_row(row)?;
                conn.put(&event.table, &event.primary_key, row)?;
            }
            None => {
                conn.delete(&event.table, &event.primary_key)?;
            }
        }
        if !self.remote.resynchronization {
            let stamp = VersionStamp {
                origin: self.remote.origin,
                origin_id: self.remote.origin_id,
            };
            version::set(conn, &event.table, &event.primary_key, stamp)?;
        }
        Ok(())
    }

    /// Logs the accepted changes again for peers that still need them.
    fn relay(&self, conn: &mut dyn Connection, accepted: &[TableEvent]) -> CoreResult<Option<TransactionId>> {
        let remote = self.remote;
        if accepted.is_empty() || remote.resynchronization {
            return Ok(None);
        }
        let packages = self.packages(accepted)?;
        let mut concerned = BTreeSet::new();
        for hook in self.shared.hooks.distant(conn)? {
            if hook.id == self.source.id || hook.id == remote.origin {
                continue;
            }
            if packages.iter().any(|p| hook.supports(p)) {
                concerned.insert(hook.id);
            }
        }
        if concerned.is_empty() {
            return Ok(None);
        }
        let logged = self.shared.log.append(
            conn,
            self.local,
            PendingTransaction::relay(remote, concerned),
            accepted.iter().cloned().map(Ok),
        )?;
        trace!(id = %logged.id, origin = %remote.origin, "transaction relayed");
        Ok(Some(logged.id))
    }

    /// Logs the kept rows as a new local transaction aimed at the sender
    /// and the origin, so they converge on the local value.
    fn reassert(
        &self,
        conn: &mut dyn Connection,
        rejected: &[&TableEvent],
    ) -> CoreResult<Option<TransactionId>> {
        let concerned: BTreeSet<HookId> = [self.source.id, self.remote.origin]
            .into_iter()
            .filter(|h| *h != self.local)
            .collect();
        if rejected.is_empty() || concerned.is_empty() {
            return Ok(None);
        }
        let mut events = Vec::with_capacity(rejected.len());
        for event in rejected {
            let kept = match conn.get(&event.table, &event.primary_key)? {
                Some(row) => TableEvent::update(event.table.clone(), event.primary_key.clone(), row),
                None => TableEvent::delete(event.table.clone(), event.primary_key.clone()),
            };
            events.push(Ok(kept));
        }
        let pending = PendingTransaction::local(
            self.shared.next_timestamp(),
            self.shared.hooks.known(conn)?,
            concerned,
        );
        let logged = self.shared.log.append(conn, self.local, pending, events)?;
        debug!(id = %logged.id, rows = rejected.len(), "kept rows re-asserted");
        Ok(Some(logged.id))
    }

    fn packages(&self, events: &[TableEvent]) -> CoreResult<BTreeSet<String>> {
        events
            .iter()
            .map(|e| {
                self.shared
                    .catalog
                    .get(&e.table)
                    .map(|t| t.package().to_string())
            })
            .collect()
    }
}

impl Database {
    /// Applies a batch received from `source`.
    ///
    /// Each transaction is applied in its own native transaction and is
    /// skipped when `source` already delivered it. A transaction that
    /// another peer produced is recorded as held by the sender, for that
    /// transaction alone; the producer's own position only moves through
    /// what the producer sends directly.
    ///
    /// # Errors
    ///
    /// `UnknownPeer` if the sender or a producer is not registered,
    /// `Field` or `Codec` errors for malformed rows.
    pub fn apply_transactions(
        &self,
        source: HookId,
        batch: &TransactionBatch,
    ) -> CoreResult<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        for remote in &batch.transactions {
            let applied = self.apply_one(source, remote)?;
            if applied.skipped {
                outcome.skipped_transactions += 1;
                continue;
            }
            outcome.applied_transactions += 1;
            outcome.applied_events += applied.accepted.len();
            outcome.rejected_events += applied.rejected;
            outcome.collisions += applied.collisions;
            outcome.relayed.extend(applied.relayed);
            outcome.reasserted.extend(applied.reasserted);
        }

        let shared = self.shared();
        outcome.last_validated = self.with_write(|conn| {
            let hook = shared.hooks.require_active(conn, source)?;
            let current = hook.last_validated_distant_transaction_id;
            if batch.last_transaction_id > current {
                shared.hooks.set_last_validated_distant(
                    conn,
                    source,
                    batch.last_transaction_id,
                    hook.last_validated_distant_transaction_utc,
                )?;
                return Ok(batch.last_transaction_id);
            }
            Ok(current)
        })?;

        for id in outcome.relayed.iter().chain(&outcome.reasserted) {
            shared.notify_logged(*id);
        }
        if outcome.applied_events > 0 {
            shared.notify_new_events();
        }
        debug!(
            %source,
            applied = outcome.applied_transactions,
            skipped = outcome.skipped_transactions,
            events = outcome.applied_events,
            rejected = outcome.rejected_events,
            last = %outcome.last_validated,
            "batch applied"
        );
        Ok(outcome)
    }

    fn apply_one(&self, source: HookId, remote: &WireTransaction) -> CoreResult<Applied> {
        let shared = self.shared();
        self.internal_write(|scope| {
            let applied = scope.write(|conn| {
                let hooks = &shared.hooks;
                let local = hooks.require_local(conn)?;
                let source_hook = hooks.require_active(conn, source)?;
                if remote.id <= source_hook.last_validated_distant_transaction_id {
                    return Ok(Applied {
                        skipped: true,
                        ..Applied::default()
                    });
                }
                if remote.origin == local.id {
                    hooks.set_last_validated_distant(conn, source, remote.id, remote.timestamp_utc)?;
                    return Ok(Applied {
                        skipped: true,
                        ..Applied::default()
                    });
                }
                if remote.origin != source {
                    hooks.require_active(conn, remote.origin)?;
                }

                let incoming = Incoming {
                    shared,
                    local: local.id,
                    source: &source_hook,
                    remote,
                };
                let mut applied = Applied::default();
                let mut rejected = Vec::new();
                for event in &remote.events {
                    let schema = shared.catalog.get(&event.table)?;
                    match incoming.decide(conn, &schema, event, &mut applied)? {
                        Verdict::Apply => {
                            incoming.apply_event(conn, &schema, event)?;
                            applied.accepted.push(event.clone());
                        }
                        Verdict::Skip => {}
                        Verdict::Reject => rejected.push(event),
                    }
                }
                applied.rejected = rejected.len();

                hooks.set_last_validated_distant(conn, source, remote.id, remote.timestamp_utc)?;
                if remote.origin != source {
                    // The sender holds this one transaction of the origin,
                    // not necessarily the ones before it.
                    let origin_id = remote.origin_id;
                    cursor::advance(conn, remote.origin, source, origin_id.as_u64())?;
                    cursor::advance(conn, remote.origin, local.id, origin_id.as_u64())?;
                    shared.log.mark_delivered(conn, local.id, remote.origin, origin_id, source)?;
                }

                applied.relayed = incoming.relay(conn, &applied.accepted)?;
                applied.reasserted = incoming.reassert(conn, &rejected)?;
                Ok(applied)
            })?;
            for event in &applied.accepted {
                scope.record_replicated(event.clone())?;
            }
            Ok(applied)
        })
    }
}

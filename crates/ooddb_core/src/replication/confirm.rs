//! Confirmations and cursor gossip.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::hooks::{cursor, gossip};
use crate::storage::Connection;
use ooddb_protocol::{HookId, TransactionId, TransactionIdCorrection};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Result of [`Database::validate_last_synchronization`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    /// Whether the peer's confirmed position moved.
    pub advanced: bool,
    /// Confirmed position after the call.
    pub last_validated: TransactionId,
    /// Delivery knowledge to pass on to the other peers.
    pub corrections: Vec<TransactionIdCorrection>,
    /// Log entries pruned.
    pub pruned: usize,
}

impl Database {
    /// Records that `peer` applied this log up to `up_to`.
    ///
    /// Each relayed transaction in the confirmed range tells that the peer
    /// now holds that one transaction of its producer; these facts are
    /// returned as corrections and queued for the other peers. The log is
    /// pruned up to the lowest position every peer provably reached.
    ///
    /// # Errors
    ///
    /// `CursorRegression` if `up_to` is below the recorded position.
    pub fn validate_last_synchronization(
        &self,
        peer: HookId,
        up_to: TransactionId,
    ) -> CoreResult<ValidationOutcome> {
        let shared = self.shared();
        let outcome = self.with_write(|conn| {
            let hooks = &shared.hooks;
            let local = hooks.require_local(conn)?;
            let hook = hooks.require_active(conn, peer)?;
            let current = hook.last_validated_local_transaction_id;
            if up_to < current {
                return Err(CoreError::CursorRegression {
                    hook: peer,
                    current: current.as_u64(),
                    attempted: up_to.as_u64(),
                });
            }

            let mut corrections = Vec::new();
            shared.log.walk_after(conn, current, |conn, header| {
                if header.id > up_to {
                    return Ok(false);
                }
                if header.origin != local.id && header.origin != peer && header.concerns(peer) {
                    cursor::advance(conn, header.origin, peer, header.origin_id.as_u64())?;
                    corrections.push(TransactionIdCorrection {
                        origin: header.origin,
                        validated: BTreeMap::from([(peer, header.origin_id.as_u64())]),
                    });
                }
                Ok(true)
            })?;

            let mut advanced = hooks.advance_last_validated_local(conn, peer, up_to)?;
            advanced |= self.actualize(conn, peer)?;
            let last_validated = hooks
                .require_active(conn, peer)?
                .last_validated_local_transaction_id;
            let all_hooks = hooks.all(conn)?;
            let pruned = shared.log.prune_validated(conn, &all_hooks)?;
            self.owe_corrections(conn, peer, &corrections)?;

            Ok(ValidationOutcome {
                advanced,
                last_validated,
                corrections,
                pruned,
            })
        })?;
        debug!(
            %peer,
            last = %outcome.last_validated,
            corrections = outcome.corrections.len(),
            pruned = outcome.pruned,
            "synchronization validated"
        );
        Ok(outcome)
    }

    /// Merges delivery knowledge gossiped by `from`.
    ///
    /// Each entry says that a hook holds one transaction of the origin.
    /// Log entries carrying that transaction stop waiting for the hook;
    /// when the origin is this host, the hook's confirmed position is then
    /// raised over everything else it does not need. The part that was new
    /// is returned and queued for the other peers.
    pub fn apply_correction(
        &self,
        from: HookId,
        correction: &TransactionIdCorrection,
    ) -> CoreResult<Option<TransactionIdCorrection>> {
        let shared = self.shared();
        self.with_write(|conn| {
            let hooks = &shared.hooks;
            let local = hooks.require_local(conn)?;
            let origin = correction.origin;
            let mut changed = BTreeMap::new();
            let mut delivered = 0;

            for (&target, &value) in &correction.validated {
                if target == local.id || target == origin {
                    continue;
                }
                if !hooks.get(conn, target)?.is_some_and(|h| h.is_active_distant()) {
                    continue;
                }
                let id = TransactionId::new(value);
                let marked = shared.log.mark_delivered(conn, local.id, origin, id, target)?;
                delivered += marked;
                let moved = cursor::advance(conn, origin, target, value)?;
                if origin == local.id {
                    self.actualize(conn, target)?;
                } else if moved || marked > 0 {
                    changed.insert(target, value);
                }
            }
            if delivered > 0 {
                let all_hooks = hooks.all(conn)?;
                shared.log.prune_validated(conn, &all_hooks)?;
            }
            if changed.is_empty() {
                if delivered > 0 {
                    trace!(%from, %origin, delivered, "own log confirmed indirectly");
                }
                return Ok(None);
            }
            trace!(%from, %origin, targets = changed.len(), "delivery knowledge merged");
            let forward = TransactionIdCorrection {
                origin,
                validated: changed,
            };
            self.owe_corrections(conn, from, std::slice::from_ref(&forward))?;
            Ok(Some(forward))
        })
    }

    /// Queues `corrections` for every active peer but `source` and the
    /// hooks they are about.
    fn owe_corrections(
        &self,
        conn: &mut dyn Connection,
        source: HookId,
        corrections: &[TransactionIdCorrection],
    ) -> CoreResult<()> {
        if corrections.is_empty() {
            return Ok(());
        }
        for hook in self.shared().hooks.distant(conn)? {
            if hook.id == source {
                continue;
            }
            for correction in corrections {
                let mut owed = correction.clone();
                owed.validated.remove(&hook.id);
                if !owed.validated.is_empty() {
                    gossip::record(conn, hook.id, &owed)?;
                }
            }
        }
        Ok(())
    }

    /// Facts still owed to `peer`.
    pub fn pending_corrections(&self, peer: HookId) -> CoreResult<Vec<TransactionIdCorrection>> {
        self.with_read(|conn| gossip::pending(conn, peer))
    }

    /// Records that `correction` reached `peer`. Returns the number of
    /// facts dropped from its queue.
    pub fn correction_sent(
        &self,
        peer: HookId,
        correction: &TransactionIdCorrection,
    ) -> CoreResult<usize> {
        self.with_write(|conn| gossip::sent(conn, peer, correction))
    }

    /// Raises the confirmed position of `peer` over log entries that do
    /// not concern it. Returns whether it moved.
    fn actualize(&self, conn: &mut dyn Connection, peer: HookId) -> CoreResult<bool> {
        let shared = self.shared();
        let hook = shared.hooks.require_active(conn, peer)?;
        let reached = shared.log.actualize_last_transaction_id(conn, &hook)?;
        shared.hooks.advance_last_validated_local(conn, peer, reached)
    }
}

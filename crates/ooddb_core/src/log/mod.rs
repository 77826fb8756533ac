//! The transaction log.
//!
//! Logged transactions are what peers receive. Local commits are logged
//! only when some distant hook replicates one of the touched packages;
//! transactions received from a peer are logged again as relays when
//! other hooks still need them. Entries are pruned once every concerned
//! hook has confirmed them.
//!
//! Layout, all inside the wrapped engine:
//!
//! ```text
//! __ood_transaction_counter  "last"            -> u64 BE
//! __ood_transactions         id BE             -> LoggedTransaction
//! __ood_transaction_events   id BE | seq BE    -> TableEvent
//! __ood_versions             table 0x00 key    -> VersionStamp
//! ```

mod entry;
pub(crate) mod version;

pub use entry::LoggedTransaction;
pub(crate) use entry::PendingTransaction;
pub use version::VersionStamp;

use crate::codec::{decode, encode};
use crate::error::{CoreError, CoreResult};
use crate::hooks::Hook;
use crate::internal::{key, TRANSACTIONS, TRANSACTION_COUNTER, TRANSACTION_EVENTS};
use crate::storage::Connection;
use ooddb_protocol::{EventTypes, HookId, TableEvent, TransactionId};
use tracing::{debug, trace};

const COUNTER_KEY: &[u8] = b"last";
const PAGE: usize = 256;

fn event_key(id: TransactionId, seq: u32) -> Vec<u8> {
    key(&[&id.to_key(), &seq.to_be_bytes()])
}

/// Reads and writes the log through a caller-provided connection, so log
/// changes share the caller's native transaction.
#[derive(Debug, Default)]
pub struct TransactionLog {
    _private: (),
}

impl TransactionLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Last assigned id; [`TransactionId::ZERO`] for an empty log.
    pub(crate) fn last_id(&self, conn: &mut dyn Connection) -> CoreResult<TransactionId> {
        Ok(match conn.get(TRANSACTION_COUNTER, COUNTER_KEY)? {
            Some(bytes) => TransactionId::from_key(&bytes)
                .ok_or_else(|| CoreError::Codec("bad transaction counter".into()))?,
            None => TransactionId::ZERO,
        })
    }

    /// Logs a transaction and stamps every touched row.
    ///
    /// Fails on an empty event stream; the caller's native transaction is
    /// expected to roll back in that case.
    pub(crate) fn append<I>(
        &self,
        conn: &mut dyn Connection,
        local: HookId,
        pending: PendingTransaction,
        events: I,
    ) -> CoreResult<LoggedTransaction>
    where
        I: IntoIterator<Item = CoreResult<TableEvent>>,
    {
        let id = self.last_id(conn)?.next();
        conn.put(TRANSACTION_COUNTER, COUNTER_KEY, &id.to_key())?;
        let (origin, origin_id) = pending.relayed_from.unwrap_or((local, id));
        let stamp = VersionStamp { origin, origin_id };

        let mut event_types = EventTypes::empty();
        let mut seq: u32 = 0;
        for event in events {
            let mut event = event?;
            event_types.insert(event.kind);
            if pending.restamp {
                if pending.relayed_from.is_none() {
                    let replaced = version::get(conn, &event.table, &event.primary_key)?;
                    event.base = replaced.map(Into::into);
                }
                version::set(conn, &event.table, &event.primary_key, stamp)?;
            }
            conn.put(TRANSACTION_EVENTS, &event_key(id, seq), &encode(&event)?)?;
            seq = seq
                .checked_add(1)
                .ok_or_else(|| CoreError::invalid_operation("too many events in one transaction"))?;
        }
        if seq == 0 {
            return Err(CoreError::invalid_operation("cannot log an empty transaction"));
        }

        let header = LoggedTransaction {
            id,
            timestamp_utc: pending.timestamp_utc,
            origin,
            origin_id,
            known: pending.known,
            event_types,
            concerned: pending.concerned,
            resynchronization: pending.resynchronization,
            event_count: seq,
        };
        conn.put(TRANSACTIONS, &id.to_key(), &encode(&header)?)?;
        trace!(%id, %origin, %origin_id, events = seq, "transaction logged");
        Ok(header)
    }

    /// Header of one transaction.
    pub(crate) fn header(
        &self,
        conn: &mut dyn Connection,
        id: TransactionId,
    ) -> CoreResult<Option<LoggedTransaction>> {
        conn.get(TRANSACTIONS, &id.to_key())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Up to `limit` headers with an id above `after`, in id order.
    pub(crate) fn headers_after(
        &self,
        conn: &mut dyn Connection,
        after: TransactionId,
        limit: usize,
    ) -> CoreResult<Vec<LoggedTransaction>> {
        conn.scan_from(TRANSACTIONS, &after.next().to_key(), limit)?
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect()
    }

    /// Every header above `after`, page by page, until `visit` returns false.
    pub(crate) fn walk_after(
        &self,
        conn: &mut dyn Connection,
        after: TransactionId,
        mut visit: impl FnMut(&mut dyn Connection, LoggedTransaction) -> CoreResult<bool>,
    ) -> CoreResult<()> {
        let mut cursor = after;
        loop {
            let page = self.headers_after(conn, cursor, PAGE)?;
            let full = page.len() == PAGE;
            for header in page {
                cursor = header.id;
                if !visit(conn, header)? {
                    return Ok(());
                }
            }
            if !full {
                return Ok(());
            }
        }
    }

    /// Events of a logged transaction, in order.
    pub(crate) fn events(
        &self,
        conn: &mut dyn Connection,
        header: &LoggedTransaction,
    ) -> CoreResult<Vec<TableEvent>> {
        conn.scan_from(
            TRANSACTION_EVENTS,
            &event_key(header.id, 0),
            header.event_count as usize,
        )?
        .into_iter()
        .map(|(_, v)| decode(&v))
        .collect()
    }

    /// Events of the transactions above `after`, whole transactions only,
    /// stopping before `max_events` would be exceeded. The first
    /// transaction is always included.
    pub(crate) fn read_from(
        &self,
        conn: &mut dyn Connection,
        after: TransactionId,
        max_events: usize,
    ) -> CoreResult<impl Iterator<Item = TableEvent>> {
        let mut out = Vec::new();
        self.walk_after(conn, after, |conn, header| {
            if !out.is_empty() && out.len() + header.event_count as usize > max_events {
                return Ok(false);
            }
            out.extend(self.events(conn, &header)?);
            Ok(out.len() < max_events)
        })?;
        Ok(out.into_iter())
    }

    /// Number of logged transactions.
    pub(crate) fn len(&self, conn: &mut dyn Connection) -> CoreResult<usize> {
        Ok(conn.scan(TRANSACTIONS)?.len())
    }

    fn delete(&self, conn: &mut dyn Connection, header: &LoggedTransaction) -> CoreResult<()> {
        for seq in 0..header.event_count {
            conn.delete(TRANSACTION_EVENTS, &event_key(header.id, seq))?;
        }
        conn.delete(TRANSACTIONS, &header.id.to_key())?;
        Ok(())
    }

    /// Deletes every transaction up to and including `up_to`.
    pub(crate) fn prune_up_to(
        &self,
        conn: &mut dyn Connection,
        up_to: TransactionId,
    ) -> CoreResult<usize> {
        let mut doomed = Vec::new();
        self.walk_after(conn, TransactionId::ZERO, |_, header| {
            if header.id > up_to {
                return Ok(false);
            }
            doomed.push(header);
            Ok(true)
        })?;
        for header in &doomed {
            self.delete(conn, header)?;
        }
        if !doomed.is_empty() {
            debug!(pruned = doomed.len(), %up_to, "transaction log pruned");
        }
        Ok(doomed.len())
    }

    /// Prunes up to the lowest position every active distant hook
    /// provably reached.
    pub(crate) fn prune_validated(
        &self,
        conn: &mut dyn Connection,
        hooks: &[Hook],
    ) -> CoreResult<usize> {
        let mut floor = None;
        for hook in hooks.iter().filter(|h| h.is_active_distant()) {
            let reached = self.actualize_last_transaction_id(conn, hook)?;
            floor = Some(floor.map_or(reached, |f: TransactionId| f.min(reached)));
        }
        let floor = match floor {
            Some(floor) => floor,
            None => self.last_id(conn)?,
        };
        self.prune_up_to(conn, floor)
    }

    /// Highest local id `hook` provably has.
    ///
    /// Starts from its direct confirmation, then skips every following
    /// transaction that does not concern it.
    pub(crate) fn actualize_last_transaction_id(
        &self,
        conn: &mut dyn Connection,
        hook: &Hook,
    ) -> CoreResult<TransactionId> {
        let start = hook.last_validated_local_transaction_id;

        let mut blocked_at = None;
        self.walk_after(conn, start, |_, header| {
            if header.concerns(hook.id) {
                blocked_at = Some(header.id);
                return Ok(false);
            }
            Ok(true)
        })?;
        let reached = match blocked_at {
            Some(id) => TransactionId::new(id.as_u64() - 1),
            None => self.last_id(conn)?,
        };
        Ok(reached.max(start))
    }

    /// Records that `target` holds `origin`'s transaction `origin_id`:
    /// `target` leaves the concerned set of the entries carrying it, and
    /// entries left with nobody to reach are deleted. Returns the number
    /// of entries changed.
    ///
    /// This is a fact about one transaction; it says nothing of the
    /// origin's earlier ones.
    pub(crate) fn mark_delivered(
        &self,
        conn: &mut dyn Connection,
        local: HookId,
        origin: HookId,
        origin_id: TransactionId,
        target: HookId,
    ) -> CoreResult<usize> {
        let mut carrying = Vec::new();
        if origin == local {
            carrying.extend(self.header(conn, origin_id)?);
        } else {
            self.walk_after(conn, TransactionId::ZERO, |_, header| {
                if header.origin == origin && header.origin_id == origin_id {
                    carrying.push(header);
                }
                Ok(true)
            })?;
        }
        let mut changed = 0;
        for mut header in carrying {
            let Some(concerned) = header.concerned.as_mut() else {
                continue;
            };
            if header.origin != origin || !concerned.remove(&target) {
                continue;
            }
            if concerned.is_empty() {
                self.delete(conn, &header)?;
            } else {
                conn.put(TRANSACTIONS, &header.id.to_key(), &encode(&header)?)?;
            }
            changed += 1;
        }
        if changed > 0 {
            trace!(%origin, %origin_id, %target, "delivery recorded");
        }
        Ok(changed)
    }

    /// Drops `hook` from every concerned set, deleting transactions that
    /// no longer concern anyone. Returns `(updated, deleted)`.
    pub(crate) fn remove_concerned(
        &self,
        conn: &mut dyn Connection,
        hook: HookId,
    ) -> CoreResult<(usize, usize)> {
        let mut touched = Vec::new();
        self.walk_after(conn, TransactionId::ZERO, |_, header| {
            if header.concerned.as_ref().is_some_and(|c| c.contains(&hook)) {
                touched.push(header);
            }
            Ok(true)
        })?;
        let (mut updated, mut deleted) = (0, 0);
        for mut header in touched {
            let remaining = header.concerned.as_mut().map(|c| {
                c.remove(&hook);
                c.len()
            });
            if remaining == Some(0) {
                self.delete(conn, &header)?;
                deleted += 1;
            } else {
                conn.put(TRANSACTIONS, &header.id.to_key(), &encode(&header)?)?;
                updated += 1;
            }
        }
        Ok((updated, deleted))
    }
}

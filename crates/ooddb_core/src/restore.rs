//! Restoring backed-up state.
//!
//! A restore never rewrites history: the difference between the current
//! rows and the backed-up ones is committed as an ordinary transaction,
//! so it is logged, shipped to peers and backed up like any other change.

use crate::backup::Snapshot;
use crate::context::Transaction;
use crate::database::Database;
use crate::error::CoreResult;
use crate::schema::{Catalog, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Changes made by [`Database::restore_to_utc`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Rows written back.
    pub written: usize,
    /// Rows deleted.
    pub deleted: usize,
}

type RowId = (String, Vec<u8>);

/// Row changes needed to restore one record and what it depends on.
struct RestorePlan<'a> {
    tx: &'a Transaction<'a>,
    catalog: &'a Catalog,
    snapshot: &'a Snapshot,
    cascade: bool,
    changes: BTreeMap<RowId, Option<Vec<u8>>>,
    visited: BTreeSet<RowId>,
}

impl<'a> RestorePlan<'a> {
    fn wanted(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.snapshot.get(table).and_then(|rows| rows.get(key)).cloned()
    }

    /// Row as it will be once the plan is applied.
    fn planned(&self, table: &str, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        match self.changes.get(&(table.to_string(), key.to_vec())) {
            Some(change) => Ok(change.clone()),
            None => self.tx.get_raw(table, key),
        }
    }

    /// Plans the restore of one row. Returns false when it cannot be done
    /// without breaking a reference.
    fn restore(&mut self, table: &str, key: &[u8]) -> CoreResult<bool> {
        if !self.visited.insert((table.to_string(), key.to_vec())) {
            return Ok(true);
        }
        let wanted = self.wanted(table, key);
        if self.tx.get_raw(table, key)? == wanted {
            return Ok(true);
        }
        let feasible = match &wanted {
            Some(row) => self.restore_targets(table, key, row)?,
            None => self.clear_dependents(table, key)?,
        };
        if feasible {
            self.changes
                .insert((table.to_string(), key.to_vec()), wanted);
        }
        Ok(feasible)
    }

    /// Every row referenced by `row` must exist.
    fn restore_targets(&mut self, table: &str, key: &[u8], row: &[u8]) -> CoreResult<bool> {
        let schema = self.catalog.get(table)?;
        let record = schema.decode_row(row)?;
        for fk in &schema.def().foreign_keys {
            let Some(target) = schema.referenced_key(&record, fk)? else {
                continue;
            };
            if fk.references == table && target == key {
                continue;
            }
            if self.planned(&fk.references, &target)?.is_some() {
                continue;
            }
            if !self.cascade || !self.restore(&fk.references, &target)? {
                return Ok(false);
            }
            if self.planned(&fk.references, &target)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// No row may keep referencing a deleted one.
    fn clear_dependents(&mut self, table: &str, key: &[u8]) -> CoreResult<bool> {
        for (referrer, fk) in self.catalog.referencing(table) {
            for (own_key, _) in self.tx.scan_raw(referrer.name())? {
                if referrer.name() == table && own_key == key {
                    continue;
                }
                let references = |row: &Option<Vec<u8>>| -> CoreResult<bool> {
                    match row {
                        Some(row) => {
                            let record = referrer.decode_row(row)?;
                            Ok(referrer.referenced_key(&record, &fk)?.as_deref() == Some(key))
                        }
                        None => Ok(false),
                    }
                };
                if !references(&self.planned(referrer.name(), &own_key)?)? {
                    continue;
                }
                if !self.cascade || !self.restore(referrer.name(), &own_key)? {
                    return Ok(false);
                }
                if references(&self.planned(referrer.name(), &own_key)?)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

impl Database {
    /// Brings every registered table back to its state at `utc`.
    ///
    /// # Errors
    ///
    /// `NoRestorePoint` when no reference precedes `utc`.
    pub fn restore_to_utc(&self, utc: u64) -> CoreResult<RestoreSummary> {
        let snapshot = self.require_backups()?.state_at(utc)?;
        let catalog = &self.shared().catalog;
        let summary = self.write(|tx| {
            let mut summary = RestoreSummary::default();
            for table in catalog.all() {
                let name = table.name();
                let empty = BTreeMap::new();
                let wanted = snapshot.get(name).unwrap_or(&empty);
                let current: BTreeMap<_, _> = tx.scan_raw(name)?.into_iter().collect();
                for key in current.keys().filter(|k| !wanted.contains_key(*k)) {
                    if tx.delete_raw(name, key)? {
                        summary.deleted += 1;
                    }
                }
                for (key, row) in wanted {
                    if current.get(key) != Some(row) {
                        tx.put_raw(name, key, row)?;
                        summary.written += 1;
                    }
                }
            }
            Ok(summary)
        })?;
        info!(utc, written = summary.written, deleted = summary.deleted, "database restored");
        Ok(summary)
    }

    /// Brings one record back to its state at `utc`.
    ///
    /// A record whose restore would break a reference is left alone and
    /// false is returned, unless `cascade` allows restoring the records
    /// it references (or that reference it) as well.
    ///
    /// # Errors
    ///
    /// `NoRestorePoint` when no reference precedes `utc`.
    pub fn restore_record(
        &self,
        table: &str,
        key_values: &[Value],
        utc: u64,
        cascade: bool,
    ) -> CoreResult<bool> {
        let key = self.table(table)?.key_from_values(key_values)?;
        let snapshot = self.require_backups()?.state_at(utc)?;
        let catalog = &self.shared().catalog;
        self.write(|tx| {
            let mut plan = RestorePlan {
                tx,
                catalog,
                snapshot: &snapshot,
                cascade,
                changes: BTreeMap::new(),
                visited: BTreeSet::new(),
            };
            if !plan.restore(table, &key)? {
                debug!(table, utc, cascade, "record restore refused");
                return Ok(false);
            }
            let changes = plan.changes;
            for ((name, key), row) in &changes {
                match row {
                    Some(row) => tx.put_raw(name, key, row)?,
                    None => {
                        tx.delete_raw(name, key)?;
                    }
                }
            }
            debug!(table, utc, rows = changes.len(), "record restored");
            Ok(true)
        })
    }
}

//! Typed record access inside a transaction.

use crate::error::{CoreError, CoreResult};
use crate::schema::{Catalog, Record, TableSchema, Value};
use crate::storage::Connection;
use crate::transaction::TransactionScope;
use ooddb_protocol::TableEvent;
use std::sync::Arc;

/// Record operations of a running transaction.
///
/// Every mutation is checked against the table declaration, recorded for
/// the transaction log and applied to the engine at once, so later reads
/// of the same transaction see it.
pub struct Transaction<'a> {
    scope: &'a TransactionScope<'a>,
    catalog: &'a Catalog,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(scope: &'a TransactionScope<'a>, catalog: &'a Catalog) -> Self {
        Self { scope, catalog }
    }

    /// The underlying scope.
    #[must_use]
    pub fn scope(&self) -> &TransactionScope<'a> {
        self.scope
    }

    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// `Integrity` if the key already exists or a referenced row is
    /// missing, `Field` if a value does not fit its declaration.
    pub fn insert(&self, table: &str, record: &Record) -> CoreResult<()> {
        let schema = self.catalog.get(table)?;
        let row = schema.encode_row(record)?;
        let key = schema.primary_key(record)?;
        self.scope.write(|conn| {
            if conn.get(table, &key)?.is_some() {
                return Err(CoreError::integrity(table, "duplicate primary key"));
            }
            check_references(conn, &schema, record)?;
            conn.put(table, &key, &row)
        })?;
        self.scope.record(TableEvent::insert(table, key, row))
    }

    /// Replaces an existing record.
    ///
    /// # Errors
    ///
    /// `Integrity` if the record does not exist or a referenced row is missing.
    pub fn update(&self, table: &str, record: &Record) -> CoreResult<()> {
        let schema = self.catalog.get(table)?;
        let row = schema.encode_row(record)?;
        let key = schema.primary_key(record)?;
        self.scope.write(|conn| {
            if conn.get(table, &key)?.is_none() {
                return Err(CoreError::integrity(table, "no record with this primary key"));
            }
            check_references(conn, &schema, record)?;
            conn.put(table, &key, &row)
        })?;
        self.scope.record(TableEvent::update(table, key, row))
    }

    /// Inserts or replaces a record.
    pub fn put(&self, table: &str, record: &Record) -> CoreResult<()> {
        let schema = self.catalog.get(table)?;
        let key = schema.primary_key(record)?;
        if self.scope.read(|conn| conn.get(table, &key))?.is_some() {
            self.update(table, record)
        } else {
            self.insert(table, record)
        }
    }

    /// Deletes the record with the given primary key values. Returns
    /// whether it existed.
    ///
    /// # Errors
    ///
    /// `Integrity` if another record still references it.
    pub fn delete(&self, table: &str, key_values: &[Value]) -> CoreResult<bool> {
        let schema = self.catalog.get(table)?;
        let key = schema.key_from_values(key_values)?;
        let existed = self.scope.write(|conn| {
            if conn.get(table, &key)?.is_none() {
                return Ok(false);
            }
            if let Some(referrer) = first_referrer(conn, self.catalog, table, &key)? {
                return Err(CoreError::integrity(
                    table,
                    format!("record is still referenced by '{referrer}'"),
                ));
            }
            conn.delete(table, &key)
        })?;
        if existed {
            self.scope.record(TableEvent::delete(table, key))?;
        }
        Ok(existed)
    }

    /// Reads one record.
    pub fn get(&self, table: &str, key_values: &[Value]) -> CoreResult<Option<Record>> {
        let schema = self.catalog.get(table)?;
        let key = schema.key_from_values(key_values)?;
        self.scope
            .read(|conn| conn.get(table, &key))?
            .map(|row| schema.decode_row(&row))
            .transpose()
    }

    /// Every record of a table, in primary key order.
    pub fn scan(&self, table: &str) -> CoreResult<Vec<Record>> {
        let schema = self.catalog.get(table)?;
        self.scope
            .read(|conn| conn.scan(table))?
            .iter()
            .map(|(_, row)| schema.decode_row(row))
            .collect()
    }

    /// Number of records in a table.
    pub fn count(&self, table: &str) -> CoreResult<usize> {
        self.catalog.get(table)?;
        Ok(self.scope.read(|conn| conn.scan(table))?.len())
    }

    /// Writes an encoded row as is, recording the change.
    pub(crate) fn put_raw(&self, table: &str, key: &[u8], row: &[u8]) -> CoreResult<()> {
        let existed = self.scope.write(|conn| {
            let existed = conn.get(table, key)?.is_some();
            conn.put(table, key, row)?;
            Ok(existed)
        })?;
        let event = if existed {
            TableEvent::update(table, key.to_vec(), row.to_vec())
        } else {
            TableEvent::insert(table, key.to_vec(), row.to_vec())
        };
        self.scope.record(event)
    }

    /// Deletes a row without reference checks, recording the change.
    pub(crate) fn delete_raw(&self, table: &str, key: &[u8]) -> CoreResult<bool> {
        let existed = self.scope.write(|conn| conn.delete(table, key))?;
        if existed {
            self.scope.record(TableEvent::delete(table, key.to_vec()))?;
        }
        Ok(existed)
    }

    pub(crate) fn get_raw(&self, table: &str, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.scope.read(|conn| conn.get(table, key))
    }

    pub(crate) fn scan_raw(&self, table: &str) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scope.read(|conn| conn.scan(table))
    }
}

fn check_references(
    conn: &mut dyn Connection,
    schema: &Arc<TableSchema>,
    record: &Record,
) -> CoreResult<()> {
    for fk in &schema.def().foreign_keys {
        let Some(target) = schema.referenced_key(record, fk)? else {
            continue;
        };
        if fk.references == schema.name() && schema.primary_key(record)? == target {
            continue;
        }
        if conn.get(&fk.references, &target)?.is_none() {
            return Err(CoreError::integrity(
                schema.name(),
                format!("referenced record missing in '{}'", fk.references),
            ));
        }
    }
    Ok(())
}

/// Name of a table holding a row that references `key` of `table`.
pub(crate) fn first_referrer(
    conn: &mut dyn Connection,
    catalog: &Catalog,
    table: &str,
    key: &[u8],
) -> CoreResult<Option<String>> {
    for (referrer, fk) in catalog.referencing(table) {
        for (own_key, row) in conn.scan(referrer.name())? {
            if referrer.name() == table && own_key == key {
                continue;
            }
            let record = referrer.decode_row(&row)?;
            if referrer.referenced_key(&record, &fk)?.as_deref() == Some(key) {
                return Ok(Some(referrer.name().to_string()));
            }
        }
    }
    Ok(None)
}

//! Registered tables.

use super::table::{ForeignKey, TableSchema};
use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Tables known to a database, by name.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<BTreeMap<String, Arc<TableSchema>>>,
}

impl Catalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table after checking its foreign keys.
    ///
    /// Re-registering an identical declaration returns the existing entry.
    pub fn register(&self, schema: TableSchema) -> CoreResult<Arc<TableSchema>> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(schema.name()) {
            if existing.fingerprint() == schema.fingerprint() {
                return Ok(Arc::clone(existing));
            }
            return Err(CoreError::invalid_operation(format!(
                "table '{}' is already registered with another declaration",
                schema.name()
            )));
        }
        for fk in &schema.def().foreign_keys {
            let arity = if fk.references == schema.name() {
                schema.primary_key_fields().count()
            } else {
                tables
                    .get(&fk.references)
                    .ok_or_else(|| CoreError::TableNotFound(fk.references.clone()))?
                    .primary_key_fields()
                    .count()
            };
            if arity != fk.fields.len() {
                return Err(CoreError::invalid_operation(format!(
                    "foreign key of '{}' has {} fields but '{}' has a {arity}-field key",
                    schema.name(),
                    fk.fields.len(),
                    fk.references
                )));
            }
        }
        let schema = Arc::new(schema);
        tables.insert(schema.name().to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Looks a table up.
    pub fn get(&self, name: &str) -> CoreResult<Arc<TableSchema>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::TableNotFound(name.to_string()))
    }

    /// Every table, by name.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<TableSchema>> {
        self.tables.read().values().cloned().collect()
    }

    /// Tables of one package.
    #[must_use]
    pub fn package_tables(&self, package: &str) -> Vec<Arc<TableSchema>> {
        self.tables
            .read()
            .values()
            .filter(|t| t.package() == package)
            .cloned()
            .collect()
    }

    /// Every declared package.
    #[must_use]
    pub fn packages(&self) -> BTreeSet<String> {
        self.tables
            .read()
            .values()
            .map(|t| t.package().to_string())
            .collect()
    }

    /// Foreign keys pointing at `table`, with their owning table.
    #[must_use]
    pub fn referencing(&self, table: &str) -> Vec<(Arc<TableSchema>, ForeignKey)> {
        self.tables
            .read()
            .values()
            .flat_map(|t| {
                t.def()
                    .foreign_keys
                    .iter()
                    .filter(|fk| fk.references == table)
                    .map(|fk| (Arc::clone(t), fk.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use ooddb_core::{
    Config, CoreResult, Database, DatabaseRegistry, FieldDef, FieldKind, ForeignKey, HookId,
    Record, TableDef, Transaction, Value,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;

/// Package of the `note` table.
pub const NOTES: &str = "notes";

/// Package of the `author` and `book` tables.
pub const LIBRARY: &str = "library";

/// `note(id PK, body)` in package [`NOTES`].
pub fn notes_table() -> TableDef {
    TableDef::new("note", NOTES)
        .field(FieldDef::new("id", FieldKind::Integer).primary_key())
        .field(FieldDef::new("body", FieldKind::Text))
}

/// `author(id PK, name)` and `book(id PK, title, author -> author)` in
/// package [`LIBRARY`].
pub fn library_tables() -> Vec<TableDef> {
    vec![
        TableDef::new("author", LIBRARY)
            .field(FieldDef::new("id", FieldKind::Integer).primary_key())
            .field(FieldDef::new("name", FieldKind::Text)),
        TableDef::new("book", LIBRARY)
            .field(FieldDef::new("id", FieldKind::Integer).primary_key())
            .field(FieldDef::new("title", FieldKind::Text))
            .field(FieldDef::new("author", FieldKind::Integer).nullable())
            .foreign_key(ForeignKey::new(["author"], "author")),
    ]
}

/// A `note` row.
pub fn note(id: i64, body: &str) -> Record {
    Record::new().with("id", id).with("body", body)
}

/// Every note of `db`, by id.
pub fn notes(db: &Database) -> BTreeMap<i64, String> {
    db.read(|tx| tx.scan("note"))
        .expect("Failed to scan notes")
        .into_iter()
        .filter_map(|r| match (r.value("id"), r.value("body")) {
            (Value::Integer(id), Value::Text(body)) => Some((id, body)),
            _ => None,
        })
        .collect()
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// Id of its local hook.
    pub hook: HookId,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates an in-memory database with the notes table and a local hook.
    pub fn memory() -> Self {
        Self::memory_with(Config::default())
    }

    /// Like [`TestDatabase::memory`] with a custom configuration.
    pub fn memory_with(config: Config) -> Self {
        let db = Database::open_in_memory("test", config, &DatabaseRegistry::new())
            .expect("Failed to open in-memory database");
        Self::prepare(db, None)
    }

    /// Creates a durable database in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(
            &temp_dir.path().join("db"),
            Config::default().sync_on_commit(false),
            &DatabaseRegistry::new(),
        )
        .expect("Failed to open file database");
        Self::prepare(db, Some(temp_dir))
    }

    fn prepare(db: Database, temp_dir: Option<TempDir>) -> Self {
        db.register_table(notes_table())
            .expect("Failed to declare notes");
        let hook = HookId::generate();
        db.init_local_hook(hook).expect("Failed to init local hook");
        Self {
            db,
            hook,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("db"))
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use ooddb_testkit::{note, with_temp_db};
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         db.write(|tx| tx.insert("note", &note(1, "x"))).unwrap();
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&TestDatabase) -> R,
{
    let db = TestDatabase::memory();
    f(&db)
}

/// Runs `f` in a write transaction and panics on failure.
pub fn write_or_panic<T>(
    db: &Database,
    f: impl FnOnce(&Transaction<'_>) -> CoreResult<T>,
) -> T {
    db.write(f).expect("write failed")
}

//! In-memory storage engine with an optional durable journal.

use super::engine::{Connection, StorageEngine};
use super::journal::{apply_changes, Journal, RowChange, Tables};
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::types::IsolationLevel;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Peekable;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Capabilities advertised by a [`MemoryEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Levels reported as supported.
    pub isolation_levels: Vec<IsolationLevel>,
    /// Whether savepoints are offered.
    pub savepoints: bool,
    /// Whether connections may be used from several threads at once.
    pub thread_safe: bool,
    /// Whether journal commits are synced to disk.
    pub sync_on_commit: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            isolation_levels: vec![IsolationLevel::ReadCommitted, IsolationLevel::Serializable],
            savepoints: true,
            thread_safe: true,
            sync_on_commit: true,
        }
    }
}

impl EngineOptions {
    /// Sets the supported isolation levels.
    #[must_use]
    pub fn isolation_levels(mut self, levels: Vec<IsolationLevel>) -> Self {
        self.isolation_levels = levels;
        self
    }

    /// Enables or disables savepoints.
    #[must_use]
    pub const fn savepoints(mut self, enabled: bool) -> Self {
        self.savepoints = enabled;
        self
    }

    /// Declares whether the engine is thread-safe.
    #[must_use]
    pub const fn thread_safe(mut self, value: bool) -> Self {
        self.thread_safe = value;
        self
    }

    /// Sets whether journal commits are synced.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}

struct Shared {
    name: String,
    options: EngineOptions,
    tables: RwLock<Tables>,
    journal: Mutex<Option<Journal>>,
    dir: Option<DatabaseDir>,
}

/// Ordered in-memory tables behind read-committed connections.
///
/// Each connection keeps its uncommitted writes in a private overlay, so
/// other connections only observe committed rows. When opened on a
/// directory every commit is journaled before it becomes visible.
///
/// Cloning yields another handle on the same tables.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    /// Creates a volatile engine.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, EngineOptions::default())
    }

    /// Creates a volatile engine with explicit capabilities.
    pub fn with_options(name: impl Into<String>, options: EngineOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                options,
                tables: RwLock::new(Tables::new()),
                journal: Mutex::new(None),
                dir: None,
            }),
        }
    }

    /// Opens a durable engine in `path`, replaying its journal.
    pub fn open(path: &Path, create_if_missing: bool, options: EngineOptions) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path, create_if_missing)?;
        let (journal, tables) = Journal::open(&dir.journal_path(), options.sync_on_commit)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                options,
                tables: RwLock::new(tables),
                journal: Mutex::new(Some(journal)),
                dir: Some(dir),
            }),
        })
    }

    /// Directory of a durable engine.
    #[must_use]
    pub fn directory(&self) -> Option<&DatabaseDir> {
        self.shared.dir.as_ref()
    }

    /// Rewrites the journal as one snapshot. No-op for volatile engines.
    pub fn compact(&self) -> CoreResult<()> {
        let mut journal = self.shared.journal.lock();
        if let Some(journal) = journal.as_mut() {
            let tables = self.shared.tables.read();
            journal.compact(&tables)?;
        }
        Ok(())
    }

    /// Number of committed rows in `table`.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.shared.tables.read().get(table).map_or(0, BTreeMap::len)
    }
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("name", &self.shared.name)
            .field("durable", &self.shared.dir.is_some())
            .finish_non_exhaustive()
    }
}

impl StorageEngine for MemoryEngine {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn supported_isolation_levels(&self) -> Vec<IsolationLevel> {
        self.shared.options.isolation_levels.clone()
    }

    fn supports_savepoints(&self) -> bool {
        self.shared.options.savepoints
    }

    fn is_thread_safe(&self) -> bool {
        self.shared.options.thread_safe
    }

    fn connect(&self) -> CoreResult<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            overlay: BTreeMap::new(),
            undo: Vec::new(),
            savepoints: Vec::new(),
            auto_commit: true,
            isolation: IsolationLevel::ReadCommitted,
            closed: false,
        }))
    }

    fn table_exists(&self, table: &str) -> CoreResult<bool> {
        Ok(self.shared.tables.read().contains_key(table))
    }

    fn create_table(&self, table: &str) -> CoreResult<()> {
        let mut journal = self.shared.journal.lock();
        if self.shared.tables.read().contains_key(table) {
            return Ok(());
        }
        if let Some(journal) = journal.as_mut() {
            journal.append_create_table(table)?;
        }
        self.shared.tables.write().entry(table.to_string()).or_default();
        debug!(engine = %self.shared.name, table, "table created");
        Ok(())
    }
}

type Overlay = BTreeMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>;

struct Undo {
    table: String,
    key: Vec<u8>,
    previous: Option<Option<Vec<u8>>>,
}

struct MemoryConnection {
    shared: Arc<Shared>,
    overlay: Overlay,
    undo: Vec<Undo>,
    savepoints: Vec<(String, usize)>,
    auto_commit: bool,
    isolation: IsolationLevel,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed {
            Err(CoreError::engine("connection is closed"))
        } else {
            Ok(())
        }
    }

    fn ensure_table(&self, table: &str) -> CoreResult<()> {
        if self.shared.tables.read().contains_key(table) {
            Ok(())
        } else {
            Err(CoreError::TableNotFound(table.to_string()))
        }
    }

    fn write(&mut self, table: &str, key: &[u8], row: Option<Vec<u8>>) -> CoreResult<()> {
        self.ensure_open()?;
        self.ensure_table(table)?;
        let previous = self
            .overlay
            .entry(table.to_string())
            .or_default()
            .insert(key.to_vec(), row);
        self.undo.push(Undo {
            table: table.to_string(),
            key: key.to_vec(),
            previous,
        });
        if self.auto_commit {
            self.commit()?;
        }
        Ok(())
    }

    fn savepoint_index(&self, name: &str) -> CoreResult<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| CoreError::engine(format!("unknown savepoint '{name}'")))
    }

    fn undo_to(&mut self, mark: usize) {
        while self.undo.len() > mark {
            let Some(entry) = self.undo.pop() else { break };
            let Some(table) = self.overlay.get_mut(&entry.table) else {
                continue;
            };
            match entry.previous {
                Some(previous) => {
                    table.insert(entry.key, previous);
                }
                None => {
                    table.remove(&entry.key);
                }
            }
        }
    }

    fn discard(&mut self) {
        self.overlay.clear();
        self.undo.clear();
        self.savepoints.clear();
    }
}

impl Connection for MemoryConnection {
    fn set_auto_commit(&mut self, enabled: bool) -> CoreResult<()> {
        self.ensure_open()?;
        if enabled && !self.auto_commit {
            self.commit()?;
        }
        self.auto_commit = enabled;
        Ok(())
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> CoreResult<()> {
        self.ensure_open()?;
        if !self.shared.options.isolation_levels.contains(&level) {
            return Err(CoreError::engine(format!(
                "isolation level {level:?} is not supported"
            )));
        }
        self.isolation = level;
        Ok(())
    }

    fn commit(&mut self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.undo.is_empty() {
            self.discard();
            return Ok(());
        }
        let changes: Vec<RowChange> = std::mem::take(&mut self.overlay)
            .into_iter()
            .flat_map(|(table, rows)| {
                rows.into_iter().map(move |(key, row)| RowChange {
                    table: table.clone(),
                    key,
                    row,
                })
            })
            .collect();

        let shared = Arc::clone(&self.shared);
        let mut journal = shared.journal.lock();
        if let Some(journal) = journal.as_mut() {
            if let Err(e) = journal.append_commit(&changes) {
                self.discard();
                return Err(e);
            }
        }
        apply_changes(&mut self.shared.tables.write(), changes);
        drop(journal);
        self.discard();
        Ok(())
    }

    fn rollback(&mut self) -> CoreResult<()> {
        self.ensure_open()?;
        self.discard();
        Ok(())
    }

    fn savepoint(&mut self, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        if !self.shared.options.savepoints {
            return Err(CoreError::engine("savepoints are not supported"));
        }
        self.savepoints.push((name.to_string(), self.undo.len()));
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let index = self.savepoint_index(name)?;
        let mark = self.savepoints[index].1;
        self.savepoints.truncate(index + 1);
        self.undo_to(mark);
        Ok(())
    }

    fn release_savepoint(&mut self, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let index = self.savepoint_index(name)?;
        self.savepoints.truncate(index);
        Ok(())
    }

    fn get(&mut self, table: &str, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        if let Some(pending) = self.overlay.get(table).and_then(|rows| rows.get(key)) {
            return Ok(pending.clone());
        }
        let tables = self.shared.tables.read();
        let rows = tables
            .get(table)
            .ok_or_else(|| CoreError::TableNotFound(table.to_string()))?;
        Ok(rows.get(key).cloned())
    }

    fn put(&mut self, table: &str, key: &[u8], row: &[u8]) -> CoreResult<()> {
        self.write(table, key, Some(row.to_vec()))
    }

    fn delete(&mut self, table: &str, key: &[u8]) -> CoreResult<bool> {
        let existed = self.get(table, key)?.is_some();
        if existed {
            self.write(table, key, None)?;
        }
        Ok(existed)
    }

    fn scan_from(
        &mut self,
        table: &str,
        start: &[u8],
        limit: usize,
    ) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.ensure_open()?;
        let tables = self.shared.tables.read();
        let committed = tables
            .get(table)
            .ok_or_else(|| CoreError::TableNotFound(table.to_string()))?;
        let empty = BTreeMap::new();
        let pending = self.overlay.get(table).unwrap_or(&empty);
        let from = start.to_vec();
        Ok(merge(
            committed.range(from.clone()..).peekable(),
            pending.range(from..).peekable(),
            limit,
        ))
    }

    fn close(&mut self) -> CoreResult<()> {
        self.discard();
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn merge<'a, C, P>(
    mut committed: Peekable<C>,
    mut pending: Peekable<P>,
    limit: usize,
) -> Vec<(Vec<u8>, Vec<u8>)>
where
    C: Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)>,
    P: Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<u8>>)>,
{
    let mut out = Vec::new();
    while out.len() < limit {
        let order = match (committed.peek(), pending.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((ck, _)), Some((pk, _))) => ck.cmp(pk),
        };
        if order == Ordering::Equal {
            committed.next();
        }
        if order == Ordering::Less {
            if let Some((key, row)) = committed.next() {
                out.push((key.clone(), row.clone()));
            }
        } else if let Some((key, Some(row))) = pending.next() {
            out.push((key.clone(), row.clone()));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine_with_table() -> MemoryEngine {
        let engine = MemoryEngine::new("test");
        engine.create_table("t").unwrap();
        engine
    }

    #[test]
    fn uncommitted_writes_are_private() {
        let engine = engine_with_table();
        let mut writer = engine.connect().unwrap();
        let mut reader = engine.connect().unwrap();
        writer.set_auto_commit(false).unwrap();

        writer.put("t", b"k", b"v").unwrap();
        assert_eq!(writer.get("t", b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(reader.get("t", b"k").unwrap(), None);

        writer.commit().unwrap();
        assert_eq!(reader.get("t", b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn rollback_discards_overlay() {
        let engine = engine_with_table();
        let mut conn = engine.connect().unwrap();
        conn.set_auto_commit(false).unwrap();
        conn.put("t", b"k", b"v").unwrap();
        conn.rollback().unwrap();
        assert_eq!(conn.get("t", b"k").unwrap(), None);
        assert_eq!(engine.row_count("t"), 0);
    }

    #[test]
    fn savepoints_undo_only_inner_work() {
        let engine = engine_with_table();
        let mut conn = engine.connect().unwrap();
        conn.set_auto_commit(false).unwrap();

        conn.put("t", b"a", b"1").unwrap();
        conn.savepoint("sp1").unwrap();
        conn.put("t", b"a", b"2").unwrap();
        conn.put("t", b"b", b"2").unwrap();
        conn.rollback_to_savepoint("sp1").unwrap();
        conn.release_savepoint("sp1").unwrap();
        conn.commit().unwrap();

        let mut reader = engine.connect().unwrap();
        assert_eq!(reader.get("t", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(reader.get("t", b"b").unwrap(), None);
    }

    #[test]
    fn savepoints_can_be_disabled() {
        let engine = MemoryEngine::with_options("x", EngineOptions::default().savepoints(false));
        let mut conn = engine.connect().unwrap();
        assert!(conn.savepoint("sp").is_err());
        assert!(!engine.supports_savepoints());
    }

    #[test]
    fn scan_merges_overlay_in_key_order() {
        let engine = engine_with_table();
        let mut setup = engine.connect().unwrap();
        for key in [b"a", b"c", b"e"] {
            setup.put("t", key, b"old").unwrap();
        }

        let mut conn = engine.connect().unwrap();
        conn.set_auto_commit(false).unwrap();
        conn.put("t", b"b", b"new").unwrap();
        conn.put("t", b"c", b"new").unwrap();
        assert!(conn.delete("t", b"e").unwrap());

        let rows = conn.scan("t").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c"]);
        assert_eq!(rows[2].1, b"new");

        let page = conn.scan_from("t", b"b", 1).unwrap();
        assert_eq!(page, vec![(b"b".to_vec(), b"new".to_vec())]);
    }

    #[test]
    fn unknown_table_and_closed_connection() {
        let engine = engine_with_table();
        let mut conn = engine.connect().unwrap();
        assert!(matches!(
            conn.get("missing", b"k"),
            Err(CoreError::TableNotFound(_))
        ));
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert!(conn.put("t", b"k", b"v").is_err());
    }

    #[test]
    fn unsupported_isolation_is_refused() {
        let engine = engine_with_table();
        let mut conn = engine.connect().unwrap();
        assert!(conn.set_isolation(IsolationLevel::Serializable).is_ok());
        assert!(conn.set_isolation(IsolationLevel::RepeatableRead).is_err());
    }

    #[test]
    fn durable_engine_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let engine = MemoryEngine::open(&path, true, EngineOptions::default()).unwrap();
            engine.create_table("t").unwrap();
            let mut conn = engine.connect().unwrap();
            conn.set_auto_commit(false).unwrap();
            conn.put("t", b"k", b"v1").unwrap();
            conn.commit().unwrap();
            conn.put("t", b"k", b"lost").unwrap();
            conn.rollback().unwrap();
            engine.compact().unwrap();
            conn.put("t", b"j", b"v2").unwrap();
            conn.commit().unwrap();
        }
        let engine = MemoryEngine::open(&path, false, EngineOptions::default()).unwrap();
        let mut conn = engine.connect().unwrap();
        assert_eq!(conn.get("t", b"k").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(conn.get("t", b"j").unwrap(), Some(b"v2".to_vec()));
        assert!(engine.directory().is_some());
    }
}

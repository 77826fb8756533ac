//! Commit journal of the memory engine.
//!
//! One frame per table creation or committed native transaction, plus
//! snapshot frames written by compaction. Replaying the frames in order
//! rebuilds the tables; a torn tail left by a crash is cut off on open.

use super::backend::{ByteStore, FileStore};
use super::frame::FrameFormat;
use crate::codec::{decode, encode};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub(crate) const JOURNAL_FORMAT: FrameFormat = FrameFormat::new(*b"OODJ", 1);

/// Tables as rebuilt from the journal.
pub(crate) type Tables = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordKind {
    CreateTable = 1,
    Commit = 2,
    Snapshot = 3,
}

impl RecordKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::CreateTable),
            2 => Some(Self::Commit),
            3 => Some(Self::Snapshot),
            _ => None,
        }
    }
}

/// One row change of a committed native transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RowChange {
    pub table: String,
    pub key: Vec<u8>,
    pub row: Option<Vec<u8>>,
}

pub(crate) struct Journal {
    path: PathBuf,
    store: FileStore,
    sync_on_commit: bool,
}

impl Journal {
    /// Opens the journal and replays it.
    pub(crate) fn open(path: &Path, sync_on_commit: bool) -> CoreResult<(Self, Tables)> {
        let mut store = FileStore::open(path)?;
        let mut tables = Tables::new();
        let mut frames = 0usize;

        let valid_len = {
            let mut iter = JOURNAL_FORMAT.frames(&store)?;
            for frame in iter.by_ref() {
                let frame = frame?;
                frames += 1;
                match RecordKind::from_byte(frame.kind) {
                    Some(RecordKind::CreateTable) => {
                        let name: String = decode(&frame.payload)?;
                        tables.entry(name).or_default();
                    }
                    Some(RecordKind::Commit) => {
                        let changes: Vec<RowChange> = decode(&frame.payload)?;
                        apply_changes(&mut tables, changes);
                    }
                    Some(RecordKind::Snapshot) => {
                        let snapshot: Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)> =
                            decode(&frame.payload)?;
                        tables = snapshot
                            .into_iter()
                            .map(|(name, rows)| (name, rows.into_iter().collect()))
                            .collect();
                    }
                    None => {
                        return Err(CoreError::corruption(
                            frame.offset,
                            format!("unknown journal record kind {}", frame.kind),
                        ))
                    }
                }
            }
            iter.valid_len()
        };

        let size = store.size()?;
        if valid_len < size {
            warn!(
                path = %path.display(),
                torn_bytes = size - valid_len,
                "truncating torn journal tail"
            );
            store.truncate(valid_len)?;
        }
        debug!(path = %path.display(), frames, tables = tables.len(), "journal replayed");

        Ok((
            Self {
                path: path.to_path_buf(),
                store,
                sync_on_commit,
            },
            tables,
        ))
    }

    pub(crate) fn append_create_table(&mut self, name: &str) -> CoreResult<()> {
        self.append(RecordKind::CreateTable, &encode(name)?)
    }

    pub(crate) fn append_commit(&mut self, changes: &[RowChange]) -> CoreResult<()> {
        self.append(RecordKind::Commit, &encode(changes)?)
    }

    fn append(&mut self, kind: RecordKind, payload: &[u8]) -> CoreResult<()> {
        JOURNAL_FORMAT.append(&mut self.store, kind as u8, payload)?;
        self.store.flush()?;
        if self.sync_on_commit {
            self.store.sync()?;
        }
        Ok(())
    }

    /// Current journal size in bytes.
    pub(crate) fn size(&self) -> CoreResult<u64> {
        self.store.size()
    }

    /// Replaces the journal by a single snapshot of `tables`.
    pub(crate) fn compact(&mut self, tables: &Tables) -> CoreResult<()> {
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = FileStore::open(&tmp_path)?;
            tmp.truncate(0)?;
            let snapshot: Vec<(&String, Vec<(&Vec<u8>, &Vec<u8>)>)> = tables
                .iter()
                .map(|(name, rows)| (name, rows.iter().collect()))
                .collect();
            JOURNAL_FORMAT.append(&mut tmp, RecordKind::Snapshot as u8, &encode(&snapshot)?)?;
            tmp.sync()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.store = FileStore::open(&self.path)?;
        debug!(path = %self.path.display(), size = self.store.size()?, "journal compacted");
        Ok(())
    }
}

pub(crate) fn apply_changes(tables: &mut Tables, changes: Vec<RowChange>) {
    for change in changes {
        let table = tables.entry(change.table).or_default();
        match change.row {
            Some(row) => {
                table.insert(change.key, row);
            }
            None => {
                table.remove(&change.key);
            }
        }
    }
}

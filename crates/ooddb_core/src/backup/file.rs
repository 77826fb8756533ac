//! Backup file naming and layout.
//!
//! Files are named `backup-ood-<unix ms>.dreference` (a full snapshot of
//! the user tables) or `backup-ood-<unix ms>.dincrement` (the committed
//! transactions that followed). Both are sequences of frames: a header,
//! then row chunks for references or one frame per transaction for
//! increments.

use crate::codec::{decode, encode};
use crate::error::{CoreError, CoreResult};
use crate::storage::{ByteStore, FileStore, FrameFormat};
use ooddb_protocol::TableEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub(crate) const BACKUP_FORMAT: FrameFormat = FrameFormat::new(*b"OODB", 1);

const HEADER: u8 = 1;
const ROWS: u8 = 2;
const TRANSACTION: u8 = 3;
const ROWS_PER_FRAME: usize = 512;

const PREFIX: &str = "backup-ood-";
const REFERENCE_EXT: &str = "dreference";
const INCREMENT_EXT: &str = "dincrement";

/// User tables by name, rows by serialized key.
pub type Snapshot = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// Kind of backup file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BackupKind {
    /// Full snapshot.
    Reference,
    /// Transactions following a snapshot.
    Increment,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reference => "reference",
            Self::Increment => "increment",
        })
    }
}

/// A backup file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    /// Full path.
    pub path: PathBuf,
    /// Creation instant encoded in the name.
    pub timestamp_utc: u64,
    /// Reference or increment.
    pub kind: BackupKind,
}

impl BackupFile {
    /// File name for a backup of `kind` created at `timestamp_utc`.
    #[must_use]
    pub fn file_name(kind: BackupKind, timestamp_utc: u64) -> String {
        let ext = match kind {
            BackupKind::Reference => REFERENCE_EXT,
            BackupKind::Increment => INCREMENT_EXT,
        };
        format!("{PREFIX}{timestamp_utc}.{ext}")
    }

    /// Recognizes a backup file by name.
    #[must_use]
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (stem, ext) = name.strip_prefix(PREFIX)?.rsplit_once('.')?;
        let kind = match ext {
            REFERENCE_EXT => BackupKind::Reference,
            INCREMENT_EXT => BackupKind::Increment,
            _ => return None,
        };
        Some(Self {
            path: path.to_path_buf(),
            timestamp_utc: stem.parse().ok()?,
            kind,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FileHeader {
    kind: BackupKind,
    created_utc: u64,
}

/// One committed transaction as kept in an increment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct BackupTransaction {
    pub(crate) timestamp_utc: u64,
    pub(crate) events: Vec<TableEvent>,
}

/// Backup files of `dir`, oldest first.
pub(crate) fn list(dir: &Path) -> CoreResult<Vec<BackupFile>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        if let Some(file) = BackupFile::parse(&entry?.path()) {
            files.push(file);
        }
    }
    files.sort_by_key(|f| (f.timestamp_utc, f.kind));
    Ok(files)
}

fn check_header(file: &BackupFile, payload: &[u8]) -> CoreResult<()> {
    let header: FileHeader = decode(payload)?;
    if header.kind != file.kind {
        return Err(CoreError::backup(format!(
            "{} holds a {} header",
            file.path.display(),
            header.kind
        )));
    }
    Ok(())
}

/// Writes a reference atomically: a temporary file renamed into place.
pub(crate) fn write_reference(
    dir: &Path,
    timestamp_utc: u64,
    snapshot: &Snapshot,
) -> CoreResult<BackupFile> {
    let name = BackupFile::file_name(BackupKind::Reference, timestamp_utc);
    let path = dir.join(&name);
    let tmp = dir.join(format!("{name}.tmp"));
    {
        let mut store = FileStore::open(&tmp)?;
        let header = FileHeader {
            kind: BackupKind::Reference,
            created_utc: timestamp_utc,
        };
        BACKUP_FORMAT.append(&mut store, HEADER, &encode(&header)?)?;
        let mut chunk: Vec<(&str, &[u8], &[u8])> = Vec::with_capacity(ROWS_PER_FRAME);
        for (table, rows) in snapshot {
            for (key, row) in rows {
                chunk.push((table, key, row));
                if chunk.len() == ROWS_PER_FRAME {
                    BACKUP_FORMAT.append(&mut store, ROWS, &encode(&chunk)?)?;
                    chunk.clear();
                }
            }
        }
        if !chunk.is_empty() {
            BACKUP_FORMAT.append(&mut store, ROWS, &encode(&chunk)?)?;
        }
        store.sync()?;
    }
    std::fs::rename(&tmp, &path)?;
    Ok(BackupFile {
        path,
        timestamp_utc,
        kind: BackupKind::Reference,
    })
}

/// Reads a reference back.
pub(crate) fn read_reference(file: &BackupFile) -> CoreResult<Snapshot> {
    let store = FileStore::open(&file.path)?;
    let mut frames = BACKUP_FORMAT.frames(&store)?;
    let header = frames
        .next()
        .transpose()?
        .ok_or_else(|| CoreError::backup(format!("{} is empty", file.path.display())))?;
    check_header(file, &header.payload)?;

    let mut snapshot = Snapshot::new();
    for frame in frames {
        let frame = frame?;
        if frame.kind != ROWS {
            return Err(CoreError::corruption(frame.offset, "unexpected frame in reference"));
        }
        let rows: Vec<(String, Vec<u8>, Vec<u8>)> = decode(&frame.payload)?;
        for (table, key, row) in rows {
            snapshot.entry(table).or_default().insert(key, row);
        }
    }
    Ok(snapshot)
}

/// The increment file currently receiving commits.
pub(crate) struct IncrementWriter {
    store: FileStore,
    file: BackupFile,
}

impl IncrementWriter {
    pub(crate) fn create(dir: &Path, timestamp_utc: u64) -> CoreResult<Self> {
        let path = dir.join(BackupFile::file_name(BackupKind::Increment, timestamp_utc));
        let mut store = FileStore::open(&path)?;
        let header = FileHeader {
            kind: BackupKind::Increment,
            created_utc: timestamp_utc,
        };
        BACKUP_FORMAT.append(&mut store, HEADER, &encode(&header)?)?;
        Ok(Self {
            store,
            file: BackupFile {
                path,
                timestamp_utc,
                kind: BackupKind::Increment,
            },
        })
    }

    pub(crate) fn file(&self) -> &BackupFile {
        &self.file
    }

    pub(crate) fn size(&self) -> CoreResult<u64> {
        self.store.size()
    }

    pub(crate) fn append(&mut self, transaction: &BackupTransaction) -> CoreResult<()> {
        BACKUP_FORMAT.append(&mut self.store, TRANSACTION, &encode(transaction)?)?;
        self.store.sync()
    }
}

/// Transactions of an increment. A torn final frame is ignored.
pub(crate) fn read_increment(file: &BackupFile) -> CoreResult<Vec<BackupTransaction>> {
    let store = FileStore::open(&file.path)?;
    let mut frames = BACKUP_FORMAT.frames(&store)?;
    let Some(header) = frames.next().transpose()? else {
        return Ok(Vec::new());
    };
    check_header(file, &header.payload)?;
    let mut out = Vec::new();
    for frame in frames {
        let frame = frame?;
        if frame.kind != TRANSACTION {
            return Err(CoreError::corruption(frame.offset, "unexpected frame in increment"));
        }
        out.push(decode(&frame.payload)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn names_round_trip() {
        let name = BackupFile::file_name(BackupKind::Increment, 1_700_000_000_123);
        assert_eq!(name, "backup-ood-1700000000123.dincrement");
        let parsed = BackupFile::parse(Path::new(&name)).unwrap();
        assert_eq!(parsed.kind, BackupKind::Increment);
        assert_eq!(parsed.timestamp_utc, 1_700_000_000_123);
        assert!(BackupFile::parse(Path::new("backup-ood-x.dreference")).is_none());
        assert!(BackupFile::parse(Path::new("journal.log")).is_none());
    }

    #[test]
    fn reference_keeps_every_row() {
        let dir = tempdir().unwrap();
        let mut snapshot = Snapshot::new();
        for n in 0..1200u32 {
            snapshot
                .entry(format!("t{}", n % 3))
                .or_default()
                .insert(n.to_be_bytes().to_vec(), vec![1; 3]);
        }
        let file = write_reference(dir.path(), 5, &snapshot).unwrap();
        assert_eq!(read_reference(&file).unwrap(), snapshot);
        assert_eq!(list(dir.path()).unwrap(), vec![file]);
    }

    #[test]
    fn increment_survives_torn_tail() {
        let dir = tempdir().unwrap();
        let mut writer = IncrementWriter::create(dir.path(), 7).unwrap();
        let tx = BackupTransaction {
            timestamp_utc: 8,
            events: vec![TableEvent::delete("t", vec![1])],
        };
        writer.append(&tx).unwrap();
        let path = writer.file().path.clone();
        drop(writer);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&BACKUP_FORMAT.encode(TRANSACTION, b"partial").unwrap()[..9]);
        std::fs::write(&path, bytes).unwrap();

        let file = BackupFile::parse(&path).unwrap();
        assert_eq!(read_increment(&file).unwrap(), vec![tx]);
    }
}

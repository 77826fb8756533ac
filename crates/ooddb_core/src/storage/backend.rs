//! Append-only byte stores.
//!
//! Stores know nothing about frames or records; they offer positional
//! reads, appends, durability barriers and truncation. The journal, the
//! spill files and the backup files are all built on them.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// An opaque append-only byte store.
pub trait ByteStore: Send + Sync {
    /// Reads exactly `len` bytes at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> CoreResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> CoreResult<()>;

    /// Forces written data to stable storage.
    fn sync(&mut self) -> CoreResult<()>;

    /// Current size in bytes.
    fn size(&self) -> CoreResult<u64>;

    /// Shrinks the store to `len` bytes.
    fn truncate(&mut self, len: u64) -> CoreResult<()>;
}

fn past_end(offset: u64, len: usize, size: u64) -> CoreError {
    CoreError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("read of {len} bytes at {offset} past end ({size})"),
    ))
}

/// Store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<Vec<u8>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `data`, e.g. to replay a damaged journal.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Copy of the content.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl ByteStore for MemoryStore {
    fn read_at(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        let data = self.data.read();
        let start = usize::try_from(offset).map_err(|_| past_end(offset, len, data.len() as u64))?;
        let end = start.saturating_add(len);
        if end > data.len() {
            return Err(past_end(offset, len, data.len() as u64));
        }
        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> CoreResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> CoreResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> CoreResult<()> {
        Ok(())
    }

    fn size(&self) -> CoreResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, len: u64) -> CoreResult<()> {
        let mut data = self.data.write();
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > data.len() {
            return Err(CoreError::invalid_operation(format!(
                "cannot grow store from {} to {len} by truncation",
                data.len()
            )));
        }
        data.truncate(len);
        Ok(())
    }
}

/// Store backed by a single file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl FileStore {
    /// Opens or creates the file at `path`, creating parent directories.
    pub fn open(path: &Path) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size,
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteStore for FileStore {
    fn read_at(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        if offset.saturating_add(len as u64) > self.size {
            return Err(past_end(offset, len, self.size));
        }
        let mut buffer = vec![0u8; len];
        if len > 0 {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> CoreResult<u64> {
        let offset = self.size;
        if !data.is_empty() {
            let file = self.file.get_mut();
            file.seek(SeekFrom::End(0))?;
            file.write_all(data)?;
            self.size += data.len() as u64;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> CoreResult<()> {
        self.file.get_mut().flush()?;
        Ok(())
    }

    fn sync(&mut self) -> CoreResult<()> {
        self.file.get_mut().sync_all()?;
        Ok(())
    }

    fn size(&self) -> CoreResult<u64> {
        Ok(self.size)
    }

    fn truncate(&mut self, len: u64) -> CoreResult<()> {
        if len > self.size {
            return Err(CoreError::invalid_operation(format!(
                "cannot grow {} from {} to {len} by truncation",
                self.path.display(),
                self.size
            )));
        }
        let file = self.file.get_mut();
        file.set_len(len)?;
        file.sync_all()?;
        self.size = len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(store: &mut dyn ByteStore) {
        assert_eq!(store.append(b"hello").unwrap(), 0);
        assert_eq!(store.append(b" world").unwrap(), 5);
        assert_eq!(store.size().unwrap(), 11);
        assert_eq!(store.read_at(6, 5).unwrap(), b"world");
        assert!(store.read_at(8, 10).is_err());

        store.truncate(5).unwrap();
        assert_eq!(store.size().unwrap(), 5);
        assert!(store.truncate(50).is_err());
        store.flush().unwrap();
        store.sync().unwrap();
    }

    #[test]
    fn memory_store_contract() {
        let mut store = MemoryStore::new();
        exercise(&mut store);
        assert_eq!(store.data(), b"hello");
    }

    #[test]
    fn file_store_contract_and_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("data.bin");
        {
            let mut store = FileStore::open(&path).unwrap();
            exercise(&mut store);
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.size().unwrap(), 5);
        assert_eq!(store.read_at(0, 5).unwrap(), b"hello");
        assert_eq!(store.path(), path.as_path());
    }
}

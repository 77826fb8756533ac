//! Events recorded by the open transaction of a session.
//!
//! The first `max_in_memory` events stay in a vector; past that threshold
//! everything moves to a framed spill file named after a random id, which
//! is removed when the buffer is cleared or dropped.

use crate::codec::{decode, encode};
use crate::error::CoreResult;
use crate::storage::{ByteStore, FileStore, FrameFormat};
use ooddb_protocol::TableEvent;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const SPILL_FORMAT: FrameFormat = FrameFormat::new(*b"OODS", 1);
const EVENT_FRAME: u8 = 1;

struct SpillFile {
    store: FileStore,
}

impl SpillFile {
    fn create(directory: &Path) -> CoreResult<Self> {
        let path = directory.join(format!("txn-{}.spill", Uuid::new_v4()));
        debug!(path = %path.display(), "spilling transaction events to disk");
        Ok(Self {
            store: FileStore::open(&path)?,
        })
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.store.path()) {
            warn!(path = %self.store.path().display(), error = %e, "failed to remove spill file");
        }
    }
}

/// Position in a buffer, for undoing a nested scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferMark {
    len: usize,
}

/// Ordered events of one transaction.
pub(crate) struct EventBuffer {
    memory: Vec<TableEvent>,
    spill: Option<SpillFile>,
    len: usize,
    max_in_memory: usize,
    spill_directory: PathBuf,
}

impl EventBuffer {
    pub(crate) fn new(max_in_memory: usize, spill_directory: PathBuf) -> Self {
        Self {
            memory: Vec::new(),
            spill: None,
            len: 0,
            max_in_memory,
            spill_directory,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub(crate) fn push(&mut self, event: TableEvent) -> CoreResult<()> {
        if self.spill.is_none() && self.memory.len() >= self.max_in_memory {
            let mut spill = SpillFile::create(&self.spill_directory)?;
            for buffered in self.memory.drain(..) {
                SPILL_FORMAT.append(&mut spill.store, EVENT_FRAME, &encode(&buffered)?)?;
            }
            self.spill = Some(spill);
        }
        match &mut self.spill {
            Some(spill) => {
                SPILL_FORMAT.append(&mut spill.store, EVENT_FRAME, &encode(&event)?)?;
            }
            None => self.memory.push(event),
        }
        self.len += 1;
        Ok(())
    }

    pub(crate) fn mark(&self) -> BufferMark {
        BufferMark { len: self.len }
    }

    /// Drops every event pushed after `mark`.
    pub(crate) fn rollback_to(&mut self, mark: BufferMark) -> CoreResult<()> {
        if mark.len >= self.len {
            return Ok(());
        }
        match &mut self.spill {
            Some(spill) => {
                let cut = {
                    let mut frames = SPILL_FORMAT.frames(&spill.store)?;
                    let mut cut = 0;
                    for _ in 0..mark.len {
                        frames.next().transpose()?;
                    }
                    if let Some(frame) = frames.next().transpose()? {
                        cut = frame.offset;
                    }
                    cut
                };
                spill.store.truncate(cut)?;
            }
            None => self.memory.truncate(mark.len),
        }
        self.len = mark.len;
        Ok(())
    }

    /// Events in push order.
    pub(crate) fn iter(&self) -> CoreResult<Box<dyn Iterator<Item = CoreResult<TableEvent>> + '_>> {
        match &self.spill {
            Some(spill) => {
                let frames = SPILL_FORMAT.frames(&spill.store)?;
                Ok(Box::new(
                    frames.map(|frame| frame.and_then(|f| decode::<TableEvent>(&f.payload))),
                ))
            }
            None => Ok(Box::new(self.memory.iter().cloned().map(Ok))),
        }
    }

    pub(crate) fn to_vec(&self) -> CoreResult<Vec<TableEvent>> {
        self.iter()?.collect()
    }

    /// Forgets every event and removes the spill file.
    pub(crate) fn clear(&mut self) {
        self.memory.clear();
        self.spill = None;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(n: u8) -> TableEvent {
        TableEvent::insert("t", vec![n], vec![n, n])
    }

    #[test]
    fn small_transactions_stay_in_memory() {
        let dir = tempdir().unwrap();
        let mut buffer = EventBuffer::new(10, dir.path().to_path_buf());
        for n in 0..5 {
            buffer.push(event(n)).unwrap();
        }
        assert!(!buffer.is_spilled());
        assert_eq!(buffer.to_vec().unwrap().len(), 5);
    }

    #[test]
    fn large_transactions_spill_and_keep_order() {
        let dir = tempdir().unwrap();
        let mut buffer = EventBuffer::new(3, dir.path().to_path_buf());
        for n in 0..8 {
            buffer.push(event(n)).unwrap();
        }
        assert!(buffer.is_spilled());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let keys: Vec<u8> = buffer
            .to_vec()
            .unwrap()
            .into_iter()
            .map(|e| e.primary_key[0])
            .collect();
        assert_eq!(keys, (0..8).collect::<Vec<_>>());

        buffer.clear();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn rollback_to_mark_in_memory_and_spilled() {
        let dir = tempdir().unwrap();
        let mut buffer = EventBuffer::new(4, dir.path().to_path_buf());
        buffer.push(event(0)).unwrap();
        buffer.push(event(1)).unwrap();
        let mark = buffer.mark();
        buffer.push(event(2)).unwrap();
        buffer.rollback_to(mark).unwrap();
        assert_eq!(buffer.len(), 2);

        let mark = buffer.mark();
        for n in 10..16 {
            buffer.push(event(n)).unwrap();
        }
        assert!(buffer.is_spilled());
        buffer.rollback_to(mark).unwrap();
        assert_eq!(buffer.len(), 2);
        buffer.push(event(3)).unwrap();

        let keys: Vec<u8> = buffer
            .to_vec()
            .unwrap()
            .into_iter()
            .map(|e| e.primary_key[0])
            .collect();
        assert_eq!(keys, vec![0, 1, 3]);
    }

    #[test]
    fn drop_removes_spill_file() {
        let dir = tempdir().unwrap();
        {
            let mut buffer = EventBuffer::new(1, dir.path().to_path_buf());
            buffer.push(event(0)).unwrap();
            buffer.push(event(1)).unwrap();
            assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

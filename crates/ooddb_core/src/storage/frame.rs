//! Self-checking frames over a [`ByteStore`].
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! Multi-byte integers are little-endian; the CRC covers header and
//! payload. A frame cut short at the end of the store is a torn write and
//! ends iteration cleanly. A bad magic or checksum is corruption.

use super::backend::ByteStore;
use crate::error::{CoreError, CoreResult};

const HEADER_SIZE: usize = 4 + 2 + 1 + 4;
const CRC_SIZE: usize = 4;

/// Magic and version identifying one family of framed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    /// Leading magic of every frame.
    pub magic: [u8; 4],
    /// Format version.
    pub version: u16,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the frame in its store.
    pub offset: u64,
    /// Caller-defined discriminant.
    pub kind: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl FrameFormat {
    /// Creates a format.
    #[must_use]
    pub const fn new(magic: [u8; 4], version: u16) -> Self {
        Self { magic, version }
    }

    /// Encodes one frame.
    pub fn encode(&self, kind: u8, payload: &[u8]) -> CoreResult<Vec<u8>> {
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("frame payload exceeds 4 GiB"))?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&self.magic);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(kind);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Appends one frame and returns its offset.
    pub fn append(&self, store: &mut dyn ByteStore, kind: u8, payload: &[u8]) -> CoreResult<u64> {
        let frame = self.encode(kind, payload)?;
        store.append(&frame)
    }

    /// Iterates the frames of `store` from the beginning.
    pub fn frames<'a>(&self, store: &'a dyn ByteStore) -> CoreResult<FrameIter<'a>> {
        Ok(FrameIter {
            store,
            format: *self,
            offset: 0,
            size: store.size()?,
            finished: false,
        })
    }
}

/// Streaming frame reader.
pub struct FrameIter<'a> {
    store: &'a dyn ByteStore,
    format: FrameFormat,
    offset: u64,
    size: u64,
    finished: bool,
}

impl FrameIter<'_> {
    /// Length of the intact prefix read so far.
    ///
    /// After exhaustion this is where a torn tail starts.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> CoreResult<Option<Frame>> {
        let remaining = self.size - self.offset;
        if remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }
        let header = self.store.read_at(self.offset, HEADER_SIZE)?;
        if header[0..4] != self.format.magic {
            return Err(CoreError::corruption(self.offset, "bad frame magic"));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != self.format.version {
            return Err(CoreError::corruption(
                self.offset,
                format!("unsupported frame version {version}"),
            ));
        }
        let kind = header[6];
        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total = HEADER_SIZE + len + CRC_SIZE;
        if remaining < total as u64 {
            return Ok(None);
        }

        let body = self
            .store
            .read_at(self.offset + HEADER_SIZE as u64, len + CRC_SIZE)?;
        let (payload, crc_bytes) = body.split_at(len);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(payload);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let frame = Frame {
            offset: self.offset,
            kind,
            payload: payload.to_vec(),
        };
        self.offset += total as u64;
        Ok(Some(frame))
    }
}

impl Iterator for FrameIter<'_> {
    type Item = CoreResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryStore;

    const FORMAT: FrameFormat = FrameFormat::new(*b"TEST", 1);

    #[test]
    fn frames_are_read_back_in_order() {
        let mut store = MemoryStore::new();
        FORMAT.append(&mut store, 1, b"first").unwrap();
        FORMAT.append(&mut store, 2, b"").unwrap();
        FORMAT.append(&mut store, 3, b"third").unwrap();

        let frames: Vec<_> = FORMAT
            .frames(&store)
            .unwrap()
            .collect::<CoreResult<_>>()
            .unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].kind, 1);
        assert_eq!(frames[0].payload, b"first");
        assert!(frames[1].payload.is_empty());
        assert_eq!(frames[2].payload, b"third");
    }

    #[test]
    fn torn_tail_ends_cleanly() {
        let mut store = MemoryStore::new();
        FORMAT.append(&mut store, 1, b"complete").unwrap();
        let intact = store.size().unwrap();
        let partial = FORMAT.encode(1, b"incomplete").unwrap();
        store.append(&partial[..partial.len() - 3]).unwrap();

        let mut iter = FORMAT.frames(&store).unwrap();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().is_none());
        assert_eq!(iter.valid_len(), intact);
    }

    #[test]
    fn flipped_byte_is_detected() {
        let mut bytes = FORMAT.encode(1, b"payload").unwrap();
        bytes[13] ^= 0x01;
        let store = MemoryStore::with_data(bytes);
        let result = FORMAT.frames(&store).unwrap().next().unwrap();
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn foreign_magic_is_corruption() {
        let other = FrameFormat::new(*b"OTHR", 1);
        let store = MemoryStore::with_data(other.encode(1, b"x").unwrap());
        let result = FORMAT.frames(&store).unwrap().next().unwrap();
        assert!(matches!(result, Err(CoreError::Corruption { offset: 0, .. })));
    }
}

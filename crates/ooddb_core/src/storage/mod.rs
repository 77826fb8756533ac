//! Storage layer: byte stores, frames, the engine contract and the
//! bundled memory engine.

mod backend;
mod engine;
mod frame;
pub(crate) mod journal;
mod memory;

pub use backend::{ByteStore, FileStore, MemoryStore};
pub use engine::{Connection, StorageEngine};
pub use frame::{Frame, FrameFormat, FrameIter};
pub use memory::{EngineOptions, MemoryEngine};

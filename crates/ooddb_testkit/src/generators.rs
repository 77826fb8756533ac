//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random workloads that keep the
//! invariants the tests rely on.

use crate::fixtures::note;
use ooddb_core::{CoreResult, Database, Value};
use proptest::prelude::*;

/// Keys each mesh node writes in its own range: node `n` owns
/// `n * KEY_SPACE .. (n + 1) * KEY_SPACE`.
pub const KEY_SPACE: i64 = 1_000;

/// A write to the `note` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteOp {
    /// Insert or replace a note.
    Put {
        /// Note id.
        id: i64,
        /// New body.
        body: String,
    },
    /// Delete a note, if present.
    Delete {
        /// Note id.
        id: i64,
    },
}

impl NoteOp {
    /// Note addressed.
    pub fn id(&self) -> i64 {
        match self {
            Self::Put { id, .. } | Self::Delete { id } => *id,
        }
    }

    /// Applies the operation in its own transaction.
    pub fn apply(&self, db: &Database) -> CoreResult<()> {
        db.write(|tx| match self {
            Self::Put { id, body } => tx.put("note", &note(*id, body)),
            Self::Delete { id } => tx.delete("note", &[Value::Integer(*id)]).map(|_| ()),
        })
    }
}

/// Strategy for note bodies.
pub fn note_body_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z ]{0,24}").expect("Invalid regex")
}

/// Strategy for operations on ids `base .. base + keys`.
pub fn note_op_strategy(base: i64, keys: i64) -> impl Strategy<Value = NoteOp> {
    let id = base..base + keys;
    prop_oneof![
        3 => (id.clone(), note_body_strategy()).prop_map(|(id, body)| NoteOp::Put { id, body }),
        1 => id.prop_map(|id| NoteOp::Delete { id }),
    ]
}

/// Strategy for a workload spread over `nodes` mesh nodes, each node
/// writing only its own key range so no two nodes ever conflict.
pub fn workload_strategy(
    nodes: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<(usize, NoteOp)>> {
    prop::collection::vec(
        (0..nodes).prop_flat_map(|node| {
            let base = node as i64 * KEY_SPACE;
            note_op_strategy(base, 16).prop_map(move |op| (node, op))
        }),
        1..max_len,
    )
}

/// Strategy for transfer requests as `(watermark, max_events)` pairs.
pub fn transfer_request_strategy() -> impl Strategy<Value = Vec<(u64, usize)>> {
    prop::collection::vec((0u64..10_000, 1usize..5_000), 1..12)
}

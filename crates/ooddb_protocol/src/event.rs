//! Row-level change events.

use crate::ids::{HookId, TransactionId};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// Kind of a row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    /// A new row.
    Insert = 1,
    /// A changed row.
    Update = 2,
    /// A removed row.
    Delete = 3,
}

impl EventKind {
    /// Converts from byte representation.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Insert),
            2 => Some(Self::Update),
            3 => Some(Self::Delete),
            _ => None,
        }
    }

    /// Converts to byte representation.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of event kinds carried by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventTypes(u8);

impl EventTypes {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Adds a kind to the set.
    pub fn insert(&mut self, kind: EventKind) {
        self.0 |= kind.bit();
    }

    /// Returns true if the set contains `kind`.
    #[must_use]
    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Returns true if no kind was recorded.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl FromIterator<EventKind> for EventTypes {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        let mut types = Self::empty();
        for kind in iter {
            types.insert(kind);
        }
        types
    }
}

/// A row version: the producer of a write and its id in the producer's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowVersion {
    /// Producing hook.
    pub origin: HookId,
    /// Transaction id in the producer's log.
    pub origin_id: TransactionId,
}

impl RowVersion {
    /// Returns true if this version is `other` or a later write of the
    /// same producer.
    #[must_use]
    pub fn covers(&self, other: &RowVersion) -> bool {
        self.origin == other.origin && self.origin_id >= other.origin_id
    }
}

/// A single row mutation.
///
/// Two events are equal when they address the same row, i.e. same table
/// and same serialized primary key; kind and row content are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEvent {
    /// Table name.
    pub table: String,
    /// Mutation kind.
    pub kind: EventKind,
    /// Canonically serialized primary key.
    pub primary_key: Vec<u8>,
    /// Encoded row after the mutation, absent for deletes.
    pub row: Option<Vec<u8>>,
    /// Version the writer replaced, if the row had one there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<RowVersion>,
}

impl TableEvent {
    /// Creates an insert event.
    pub fn insert(table: impl Into<String>, primary_key: Vec<u8>, row: Vec<u8>) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Insert,
            primary_key,
            row: Some(row),
            base: None,
        }
    }

    /// Creates an update event.
    pub fn update(table: impl Into<String>, primary_key: Vec<u8>, row: Vec<u8>) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Update,
            primary_key,
            row: Some(row),
            base: None,
        }
    }

    /// Creates a delete event.
    pub fn delete(table: impl Into<String>, primary_key: Vec<u8>) -> Self {
        Self {
            table: table.into(),
            kind: EventKind::Delete,
            primary_key,
            row: None,
            base: None,
        }
    }

    /// Sets the replaced version.
    #[must_use]
    pub fn with_base(mut self, base: Option<RowVersion>) -> Self {
        self.base = base;
        self
    }

    /// Returns `(table, primary key)`, the identity of the addressed row.
    #[must_use]
    pub fn identity(&self) -> (&str, &[u8]) {
        (&self.table, &self.primary_key)
    }
}

impl PartialEq for TableEvent {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for TableEvent {}

impl Hash for TableEvent {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

//! Identifiers shared across peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Decentralized identifier of a peer (a "hook").
///
/// Generated locally without coordination; ordering is the byte order of
/// the underlying UUID and is stable across peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookId(Uuid);

impl HookId {
    /// Generates a fresh random hook id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a hook id from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parses the hyphenated textual form.
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(Self)
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a logged transaction, strictly increasing per database.
///
/// Zero means "nothing yet"; the first committed transaction gets 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// The id preceding every logged transaction.
    pub const ZERO: Self = Self(0);

    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following id.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Big-endian key form, which sorts numerically.
    #[must_use]
    pub fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parses the big-endian key form.
    #[must_use]
    pub fn from_key(key: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = key.get(..8)?.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_ids_are_unique() {
        assert_ne!(HookId::generate(), HookId::generate());
    }

    #[test]
    fn hook_id_text_form_parses_back() {
        let id = HookId::generate();
        assert_eq!(HookId::parse(&id.to_string()), Some(id));
        assert_eq!(HookId::parse("not-a-hook"), None);
    }

    #[test]
    fn transaction_key_sorts_numerically() {
        let small = TransactionId::new(9).to_key();
        let large = TransactionId::new(256).to_key();
        assert!(small < large);
        assert_eq!(TransactionId::from_key(&large), Some(TransactionId::new(256)));
    }

    #[test]
    fn transaction_display() {
        assert_eq!(TransactionId::new(42).to_string(), "txn:42");
        assert_eq!(TransactionId::ZERO.next(), TransactionId::new(1));
    }
}

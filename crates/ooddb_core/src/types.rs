//! Core type definitions.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub use ooddb_protocol::{HookId, TransactionId};

/// Transaction isolation level, ordered from weakest to strictest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Only committed data is read.
    ReadCommitted,
    /// Rows read twice read the same.
    RepeatableRead,
    /// Equivalent to some serial order.
    Serializable,
}

impl IsolationLevel {
    /// Every level, weakest first.
    pub const ALL: [Self; 4] = [
        Self::ReadUncommitted,
        Self::ReadCommitted,
        Self::RepeatableRead,
        Self::Serializable,
    ];

    /// Picks the level to use when `requested` is asked of an engine that
    /// supports `supported`.
    ///
    /// The requested level wins when available; otherwise the nearest
    /// stricter level, and only when none is stricter, the nearest weaker
    /// one. Returns `None` if `supported` is empty.
    #[must_use]
    pub fn negotiate(requested: Self, supported: &[Self]) -> Option<Self> {
        if supported.contains(&requested) {
            return Some(requested);
        }
        let stricter = Self::ALL
            .iter()
            .copied()
            .filter(|l| *l > requested && supported.contains(l))
            .min();
        stricter.or_else(|| {
            Self::ALL
                .iter()
                .copied()
                .filter(|l| *l < requested && supported.contains(l))
                .max()
        })
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        Self::ReadCommitted
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_utc_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

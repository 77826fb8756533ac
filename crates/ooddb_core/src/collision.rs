//! Conflicting concurrent writes.
//!
//! An incoming row conflicts with the local one when the local value was
//! written by another origin that the incoming transaction's producer had
//! not yet seen, and the two values differ. The host decides which side
//! wins; whichever it picks, every peer that applies the same policy ends
//! on the same value.

use crate::schema::{Record, Value};
use ooddb_protocol::{EventKind, HookId};
use std::fmt;

/// Details of a detected conflict.
#[derive(Debug, Clone, Copy)]
pub struct Collision<'a> {
    /// This host.
    pub local: HookId,
    /// Peer that delivered the incoming value.
    pub peer: HookId,
    /// Kind of the incoming mutation.
    pub kind: EventKind,
    /// Table name.
    pub table: &'a str,
    /// Primary key values.
    pub primary_key: &'a [Value],
    /// Incoming row; `None` for a delete.
    pub incoming: Option<&'a Record>,
    /// Local row; `None` when deleted locally.
    pub current: Option<&'a Record>,
    /// Producer of the incoming value.
    pub incoming_origin: HookId,
    /// Producer of the local value.
    pub current_origin: HookId,
}

/// Host policy for conflicts. Returning true accepts the incoming value.
pub trait CollisionResolver: Send + Sync {
    /// The peer's own write conflicts with a write made here.
    fn direct_collision_detected(&self, collision: &Collision<'_>) -> bool;

    /// The conflict involves `third_peer`: either the incoming value was
    /// relayed from it, or the local value came from it.
    fn indirect_collision_detected(&self, collision: &Collision<'_>, third_peer: HookId) -> bool;
}

/// Always keeps the local value.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepLocal;

impl CollisionResolver for KeepLocal {
    fn direct_collision_detected(&self, _: &Collision<'_>) -> bool {
        false
    }

    fn indirect_collision_detected(&self, _: &Collision<'_>, _: HookId) -> bool {
        false
    }
}

/// Always takes the incoming value.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptIncoming;

impl CollisionResolver for AcceptIncoming {
    fn direct_collision_detected(&self, _: &Collision<'_>) -> bool {
        true
    }

    fn indirect_collision_detected(&self, _: &Collision<'_>, _: HookId) -> bool {
        true
    }
}

/// The value written by the greater hook id wins, on every peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerPriority;

impl CollisionResolver for PeerPriority {
    fn direct_collision_detected(&self, collision: &Collision<'_>) -> bool {
        collision.incoming_origin > collision.current_origin
    }

    fn indirect_collision_detected(&self, collision: &Collision<'_>, _: HookId) -> bool {
        collision.incoming_origin > collision.current_origin
    }
}

impl fmt::Debug for dyn CollisionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CollisionResolver")
    }
}

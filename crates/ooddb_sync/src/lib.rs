//! # ooddb sync
//!
//! Peer synchronization for ooddb.
//!
//! This crate provides:
//! - The outbound queue, with fusion of transfer requests and a wake-once
//!   observer latch
//! - Per-peer link state: one unconfirmed batch in flight, stale transfer
//!   recovery
//! - Routing of received envelopes into the database
//! - A transport abstraction and an in-process loopback network
//!
//! ## Architecture
//!
//! Every peer is symmetric. Committing a transaction that reaches the log
//! wakes the dispatcher, which queues a transfer for each ready peer with
//! something pending. Sending a transfer reads a batch from the log; the
//! receiver applies it and answers with a confirmation, which frees the
//! peer for the next batch and lets the log be pruned.
//!
//! ## Key Invariants
//!
//! - At most one unconfirmed batch per peer
//! - Confirmed positions never move backwards
//! - Re-delivered batches and notices are applied once
//! - Database notifications never touch the database

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dispatcher;
mod error;
mod message;
mod peers;
mod synchronizer;
mod transport;

pub use config::SyncConfig;
pub use dispatcher::SynchronizationDispatcher;
pub use error::{SyncError, SyncResult};
pub use message::SyncMessage;
pub use peers::PeerLink;
pub use synchronizer::Synchronizer;
pub use transport::{LoopbackNetwork, LoopbackTransport, SyncTransport};

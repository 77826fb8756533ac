//! # ooddb core
//!
//! Embedded database wrapper that turns a local storage engine into a
//! node of a multi-peer, eventually consistent replicated store.
//!
//! This crate provides:
//! - The storage engine contract and a memory engine with a durable journal
//! - Typed tables and records checked against their declaration
//! - Transaction management with per-thread sessions, nesting and spilling
//! - The transaction log shipped to peers, with per-row origin stamps
//! - Peer (hook) registration, package support and authenticated messages
//! - Collision detection and pluggable resolution
//! - Point-in-time backups and restore

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
mod codec;
mod collision;
mod commit;
mod config;
mod context;
mod database;
mod dir;
mod error;
pub mod hooks;
mod internal;
mod listener;
pub mod log;
mod registry;
mod replication;
mod restore;
pub mod schema;
pub mod storage;
pub mod transaction;
mod types;

pub use backup::{BackupFile, BackupKind, BackupPolicy, BackupRestoreManager, BackupStatus, RestorePoint};
pub use collision::{AcceptIncoming, Collision, CollisionResolver, KeepLocal, PeerPriority};
pub use config::{BackupConfig, Config};
pub use context::Transaction;
pub use database::Database;
pub use dir::DatabaseDir;
pub use error::{CoreError, CoreResult};
pub use hooks::{AddHooksOutcome, Hook, PairingState, QueuedMessage};
pub use listener::DatabaseListener;
pub use log::{LoggedTransaction, VersionStamp};
pub use registry::{DatabaseHandle, DatabaseRegistry};
pub use replication::{ApplyOutcome, ValidationOutcome};
pub use restore::RestoreSummary;
pub use schema::{FieldDef, FieldKind, ForeignKey, Record, TableDef, TableSchema, Value};
pub use types::{now_utc_millis, HookId, IsolationLevel, TransactionId};

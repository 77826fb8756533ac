//! Transactions: per-thread sessions, nesting and the commit pipeline hook.

pub(crate) mod buffer;
mod manager;
mod session;

pub(crate) use buffer::EventBuffer;
pub(crate) use manager::{CommitObserver, ManagerOptions, PreparedCommit};
pub use manager::{TransactionManager, TransactionScope};

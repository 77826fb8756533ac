//! Per-thread transaction state.

use super::buffer::{BufferMark, EventBuffer};
use crate::error::{CoreError, CoreResult};
use crate::storage::Connection;
use crate::types::IsolationLevel;
use ooddb_protocol::TableEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

thread_local! {
    static THREAD_TOKEN: Arc<()> = Arc::new(());
}

/// Weak reference that dies with the calling thread.
pub(crate) fn thread_token() -> Weak<()> {
    THREAD_TOKEN.with(Arc::downgrade)
}

/// A nested scope opened inside an outer transaction.
pub(crate) struct SavepointMark {
    pub(crate) name: Option<String>,
    pub(crate) events: BufferMark,
    pub(crate) replicated: usize,
}

/// Mutable part of a session; locked only for the duration of a single
/// operation, never across user work.
pub(crate) struct SessionState {
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) depth: usize,
    pub(crate) read_only: bool,
    pub(crate) isolation: IsolationLevel,
    /// Events to log and back up on commit.
    pub(crate) events: EventBuffer,
    /// Events applied on behalf of peers; already logged, backed up on commit.
    pub(crate) replicated: Vec<TableEvent>,
    pub(crate) next_savepoint: u64,
    /// Set when a nested scope failed without a savepoint to undo it.
    pub(crate) poisoned: bool,
}

impl SessionState {
    pub(crate) fn mark(&mut self, savepoints: bool) -> CoreResult<SavepointMark> {
        let name = if savepoints {
            self.next_savepoint += 1;
            let name = format!("ood_sp_{}", self.next_savepoint);
            self.conn.savepoint(&name)?;
            Some(name)
        } else {
            None
        };
        Ok(SavepointMark {
            name,
            events: self.events.mark(),
            replicated: self.replicated.len(),
        })
    }

    pub(crate) fn release(&mut self, mark: &SavepointMark) -> CoreResult<()> {
        if let Some(name) = &mark.name {
            self.conn.release_savepoint(name)?;
        }
        Ok(())
    }

    pub(crate) fn rollback_to(&mut self, mark: &SavepointMark) -> CoreResult<()> {
        let Some(name) = &mark.name else {
            self.poisoned = true;
            return Ok(());
        };
        self.conn.rollback_to_savepoint(name)?;
        self.conn.release_savepoint(name)?;
        self.events.rollback_to(mark.events)?;
        self.replicated.truncate(mark.replicated);
        Ok(())
    }

    pub(crate) fn discard(&mut self) {
        self.events.clear();
        self.replicated.clear();
        self.depth = 0;
        self.poisoned = false;
    }
}

/// The connection and open transaction of one thread.
pub(crate) struct Session {
    pub(crate) state: Mutex<SessionState>,
    owner: Weak<()>,
    closed: AtomicBool,
    synchronized: AtomicBool,
}

impl Session {
    pub(crate) fn new(conn: Box<dyn Connection>, events: EventBuffer) -> Self {
        Self {
            state: Mutex::new(SessionState {
                conn,
                depth: 0,
                read_only: true,
                isolation: IsolationLevel::default(),
                events,
                replicated: Vec::new(),
                next_savepoint: 0,
                poisoned: false,
            }),
            owner: thread_token(),
            closed: AtomicBool::new(false),
            synchronized: AtomicBool::new(false),
        }
    }

    /// True once the owning thread has exited.
    pub(crate) fn is_orphaned(&self) -> bool {
        self.owner.strong_count() == 0
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            Err(CoreError::DatabaseClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn holds_database_lock(&self) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }

    pub(crate) fn set_holds_database_lock(&self, value: bool) {
        self.synchronized.store(value, Ordering::Release);
    }

    /// Closes the connection; an in-flight transaction fails on its next step.
    pub(crate) fn force_close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.discard();
        if let Err(e) = state.conn.close() {
            tracing::warn!(error = %e, "failed to close session connection");
        }
    }
}

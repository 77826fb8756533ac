//! Transaction manager.

use super::buffer::EventBuffer;
use super::session::{SavepointMark, Session, SessionState};
use crate::error::{CoreError, CoreResult};
use crate::registry::DatabaseHandle;
use crate::storage::{Connection, StorageEngine};
use crate::types::{IsolationLevel, TransactionId};
use ooddb_protocol::TableEvent;
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, trace, warn};

/// What the commit pipeline decided before the native commit.
#[derive(Debug, Default)]
pub(crate) struct PreparedCommit {
    /// Log entry written for the transaction, if any.
    pub(crate) logged: Option<TransactionId>,
    /// Commit instant, milliseconds since the Unix epoch.
    pub(crate) timestamp_utc: u64,
    /// Changes to record in the backup increment.
    pub(crate) backup_events: Option<Vec<TableEvent>>,
}

/// Hooks run around the native commit of an outermost write transaction.
pub(crate) trait CommitObserver: Send + Sync {
    /// Whether commits must be fully ordered from `before_commit` to
    /// `after_commit`.
    fn serializes_commits(&self) -> bool;

    /// Runs inside the native transaction, just before it commits.
    fn before_commit(
        &self,
        conn: &mut dyn Connection,
        events: &EventBuffer,
        replicated: &[TableEvent],
    ) -> CoreResult<PreparedCommit>;

    /// Runs once the native transaction is durable.
    fn after_commit(&self, prepared: PreparedCommit) -> CoreResult<()>;

    /// Runs after any rollback, nested or not.
    fn after_rollback(&self);

    /// Runs last, once commits are no longer held back.
    fn committed(&self, _logged: Option<TransactionId>) {}
}

/// Settings of a [`TransactionManager`].
#[derive(Debug, Clone)]
pub(crate) struct ManagerOptions {
    pub(crate) default_isolation: IsolationLevel,
    pub(crate) max_events_in_memory: usize,
    pub(crate) spill_directory: PathBuf,
}

/// Runs work inside native transactions, one session per thread.
///
/// A thread's first call opens a connection that is reused by its later
/// transactions. Calls made from inside a running transaction nest: with
/// savepoint support a failing inner scope is undone alone, otherwise its
/// failure dooms the outer transaction. Sessions of threads that exited
/// are reaped when a new session is created.
pub struct TransactionManager {
    engine: Arc<dyn StorageEngine>,
    database: DatabaseHandle,
    observer: Arc<dyn CommitObserver>,
    options: ManagerOptions,
    sessions: Mutex<HashMap<ThreadId, Arc<Session>>>,
    commit_order: Mutex<()>,
    closed: AtomicBool,
}

impl TransactionManager {
    pub(crate) fn new(
        engine: Arc<dyn StorageEngine>,
        database: DatabaseHandle,
        observer: Arc<dyn CommitObserver>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            engine,
            database,
            observer,
            options,
            sessions: Mutex::new(HashMap::new()),
            commit_order: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns true once [`TransactionManager::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs `work` in a transaction of the calling thread.
    ///
    /// `isolation` defaults to the configured level and is negotiated
    /// against what the engine supports. Only the outermost scope commits;
    /// an error from `work` rolls its scope back and is returned as is.
    ///
    /// # Errors
    ///
    /// Returns the error of `work`, of the engine, or of the commit
    /// pipeline; [`CoreError::DatabaseClosed`] after close.
    pub fn run_transaction<T, F>(
        &self,
        isolation: Option<IsolationLevel>,
        write: bool,
        work: F,
    ) -> CoreResult<T>
    where
        F: FnOnce(&TransactionScope<'_>) -> CoreResult<T>,
    {
        let session = self.session()?;
        let nested = {
            let mut state = session.state.lock();
            if state.depth == 0 {
                self.begin(&mut state, isolation, write)?;
                None
            } else {
                if write && state.read_only {
                    return Err(CoreError::invalid_operation(
                        "write transaction requested inside a read-only transaction",
                    ));
                }
                let mark = state.mark(self.engine.supports_savepoints())?;
                state.depth += 1;
                Some(mark)
            }
        };

        let unwind = Unwind {
            manager: self,
            session: &session,
            mark: nested,
            armed: true,
        };
        let result = work(&TransactionScope {
            session: &session,
        });
        match unwind.disarm() {
            None => self.finish(&session, result),
            Some(mark) => self.finish_nested(&session, &mark, result),
        }
    }

    /// Like [`TransactionManager::run_transaction`], holding the database
    /// lock shared by every wrapper opened on the same name: exclusively
    /// for writes, shared for reads. Re-entrant on the holding thread.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::run_transaction`].
    pub fn run_synchronized_transaction<T, F>(
        &self,
        isolation: Option<IsolationLevel>,
        write: bool,
        work: F,
    ) -> CoreResult<T>
    where
        F: FnOnce(&TransactionScope<'_>) -> CoreResult<T>,
    {
        let session = self.session()?;
        if session.holds_database_lock() {
            return self.run_transaction(isolation, write, work);
        }
        let lock = if write {
            HeldLock::Write(self.database.write())
        } else {
            HeldLock::Read(self.database.read())
        };
        let _held = Synchronized {
            session: &session,
            _lock: lock,
        };
        session.set_holds_database_lock(true);
        self.run_transaction(isolation, write, work)
    }

    /// Closes every session and refuses new transactions.
    ///
    /// Transactions running on other threads fail on their next step.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let sessions: Vec<_> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        debug!(sessions = sessions.len(), "closing transaction sessions");
        for session in sessions {
            session.force_close();
        }
    }

    /// Runs `f` with commits held back, so that no transaction commits
    /// while it runs.
    pub(crate) fn between_commits<R>(&self, f: impl FnOnce() -> R) -> R {
        let _order = self.commit_order.lock();
        f()
    }

    fn session(&self) -> CoreResult<Arc<Session>> {
        if self.is_closed() {
            return Err(CoreError::DatabaseClosed);
        }
        let id = thread::current().id();
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&id) {
            session.ensure_open()?;
            return Ok(Arc::clone(session));
        }

        sessions.retain(|_, session| {
            if session.is_orphaned() {
                trace!("reaping session of exited thread");
                session.force_close();
                false
            } else {
                true
            }
        });

        let conn = self.engine.connect()?;
        let events = EventBuffer::new(
            self.options.max_events_in_memory,
            self.options.spill_directory.clone(),
        );
        let session = Arc::new(Session::new(conn, events));
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    fn begin(
        &self,
        state: &mut SessionState,
        isolation: Option<IsolationLevel>,
        write: bool,
    ) -> CoreResult<()> {
        let requested = isolation.unwrap_or(self.options.default_isolation);
        let level =
            IsolationLevel::negotiate(requested, &self.engine.supported_isolation_levels())
                .ok_or_else(|| {
                    CoreError::engine(format!(
                        "engine '{}' supports no isolation level",
                        self.engine.name()
                    ))
                })?;
        if level != requested {
            trace!(?requested, ?level, "isolation level negotiated");
        }
        state.conn.set_auto_commit(false)?;
        state.conn.set_isolation(level)?;
        state.discard();
        state.isolation = level;
        state.read_only = !write;
        state.depth = 1;
        Ok(())
    }

    fn finish<T>(&self, session: &Session, result: CoreResult<T>) -> CoreResult<T> {
        let read_only = session.state.lock().read_only;
        let order = (!read_only && self.observer.serializes_commits())
            .then(|| self.commit_order.lock());
        let mut state = session.state.lock();
        state.depth = 0;

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                self.rollback(&mut state);
                drop(state);
                self.observer.after_rollback();
                return Err(e);
            }
        };
        session.ensure_open()?;
        if state.poisoned {
            self.rollback(&mut state);
            drop(state);
            self.observer.after_rollback();
            return Err(CoreError::invalid_operation(
                "a nested transaction failed and could not be undone on its own",
            ));
        }

        let prepared = if read_only {
            PreparedCommit::default()
        } else {
            let SessionState {
                conn,
                events,
                replicated,
                ..
            } = &mut *state;
            match self
                .observer
                .before_commit(conn.as_mut(), events, replicated)
            {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.rollback(&mut state);
                    drop(state);
                    self.observer.after_rollback();
                    return Err(e);
                }
            }
        };
        if let Err(e) = state.conn.commit() {
            self.rollback(&mut state);
            drop(state);
            self.observer.after_rollback();
            return Err(e);
        }
        state.discard();
        drop(state);

        if !read_only {
            let logged = prepared.logged;
            let recorded = self.observer.after_commit(prepared);
            drop(order);
            self.observer.committed(logged);
            recorded?;
        }
        Ok(value)
    }

    fn finish_nested<T>(
        &self,
        session: &Session,
        mark: &SavepointMark,
        result: CoreResult<T>,
    ) -> CoreResult<T> {
        let mut state = session.state.lock();
        state.depth = state.depth.saturating_sub(1);
        match result {
            Ok(value) => {
                session.ensure_open()?;
                state.release(mark)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(undo) = state.rollback_to(mark) {
                    warn!(error = %undo, "failed to undo nested transaction");
                    state.poisoned = true;
                }
                drop(state);
                self.observer.after_rollback();
                Err(e)
            }
        }
    }

    fn rollback(&self, state: &mut SessionState) {
        if !state.conn.is_closed() {
            if let Err(e) = state.conn.rollback() {
                warn!(error = %e, "native rollback failed");
            }
        }
        state.discard();
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("engine", &self.engine.name())
            .field("database", &self.database.name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Rolls a scope back if `work` unwinds.
struct Unwind<'a> {
    manager: &'a TransactionManager,
    session: &'a Session,
    mark: Option<SavepointMark>,
    armed: bool,
}

impl Unwind<'_> {
    fn disarm(mut self) -> Option<SavepointMark> {
        self.armed = false;
        self.mark.take()
    }
}

impl Drop for Unwind<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.session.state.lock();
        match self.mark.take() {
            Some(mark) => {
                state.depth = state.depth.saturating_sub(1);
                if state.rollback_to(&mark).is_err() {
                    state.poisoned = true;
                }
            }
            None => {
                state.depth = 0;
                self.manager.rollback(&mut state);
            }
        }
        drop(state);
        self.manager.observer.after_rollback();
    }
}

enum HeldLock<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
}

struct Synchronized<'a> {
    session: &'a Session,
    _lock: HeldLock<'a>,
}

impl Drop for Synchronized<'_> {
    fn drop(&mut self) {
        self.session.set_holds_database_lock(false);
    }
}

/// Handle on the running transaction, passed to transaction work.
pub struct TransactionScope<'a> {
    session: &'a Session,
}

impl TransactionScope<'_> {
    /// Returns true for read-only transactions.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.session.state.lock().read_only
    }

    /// Isolation level actually in effect.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.session.state.lock().isolation
    }

    /// Nesting depth; 1 for the outermost scope.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.session.state.lock().depth
    }

    /// Number of events recorded so far.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.session.state.lock().events.len()
    }

    /// Runs `f` on the connection.
    pub(crate) fn read<R>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> CoreResult<R>,
    ) -> CoreResult<R> {
        self.session.ensure_open()?;
        let mut state = self.session.state.lock();
        f(state.conn.as_mut())
    }

    /// Runs `f` on the connection of a write transaction.
    pub(crate) fn write<R>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> CoreResult<R>,
    ) -> CoreResult<R> {
        self.session.ensure_open()?;
        let mut state = self.session.state.lock();
        if state.read_only {
            return Err(CoreError::invalid_operation(
                "write attempted in a read-only transaction",
            ));
        }
        f(state.conn.as_mut())
    }

    /// Records a change made by this transaction.
    pub(crate) fn record(&self, event: TableEvent) -> CoreResult<()> {
        self.session.ensure_open()?;
        let mut state = self.session.state.lock();
        if state.read_only {
            return Err(CoreError::invalid_operation(
                "write attempted in a read-only transaction",
            ));
        }
        state.events.push(event)
    }

    /// Records a change applied on behalf of a peer.
    pub(crate) fn record_replicated(&self, event: TableEvent) -> CoreResult<()> {
        self.session.ensure_open()?;
        self.session.state.lock().replicated.push(event);
        Ok(())
    }
}

impl fmt::Debug for TransactionScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DatabaseRegistry;
    use crate::storage::{EngineOptions, MemoryEngine};
    use std::sync::atomic::AtomicUsize;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct Recorder {
        committed: Mutex<Vec<Vec<TableEvent>>>,
        rollbacks: AtomicUsize,
    }

    impl CommitObserver for Recorder {
        fn serializes_commits(&self) -> bool {
            true
        }

        fn before_commit(
            &self,
            _conn: &mut dyn Connection,
            events: &EventBuffer,
            _replicated: &[TableEvent],
        ) -> CoreResult<PreparedCommit> {
            Ok(PreparedCommit {
                backup_events: Some(events.to_vec()?),
                ..PreparedCommit::default()
            })
        }

        fn after_commit(&self, prepared: PreparedCommit) -> CoreResult<()> {
            self.committed
                .lock()
                .push(prepared.backup_events.unwrap_or_default());
            Ok(())
        }

        fn after_rollback(&self) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        engine: MemoryEngine,
        recorder: Arc<Recorder>,
        manager: TransactionManager,
        spill: TempDir,
    }

    fn fixture_with(options: EngineOptions, max_events_in_memory: usize) -> Fixture {
        let engine = MemoryEngine::with_options("test", options);
        engine.create_table("t").unwrap();
        let recorder = Arc::new(Recorder::default());
        let spill = tempdir().unwrap();
        let registry = DatabaseRegistry::new();
        let manager = TransactionManager::new(
            Arc::new(engine.clone()),
            registry.acquire("test"),
            recorder.clone(),
            ManagerOptions {
                default_isolation: IsolationLevel::ReadCommitted,
                max_events_in_memory,
                spill_directory: spill.path().to_path_buf(),
            },
        );
        Fixture {
            engine,
            recorder,
            manager,
            spill,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(EngineOptions::default(), 100)
    }

    fn put(scope: &TransactionScope<'_>, key: u8) -> CoreResult<()> {
        scope.write(|conn| conn.put("t", &[key], &[key]))?;
        scope.record(TableEvent::insert("t", vec![key], vec![key]))
    }

    #[test]
    fn committed_work_is_visible_and_observed() {
        let fx = fixture();
        fx.manager
            .run_transaction(None, true, |scope| put(scope, 1))
            .unwrap();
        assert_eq!(fx.engine.row_count("t"), 1);
        assert_eq!(fx.recorder.committed.lock().len(), 1);
    }

    #[test]
    fn failing_work_rolls_back() {
        let fx = fixture();
        let result: CoreResult<()> = fx.manager.run_transaction(None, true, |scope| {
            put(scope, 1)?;
            Err(CoreError::invalid_operation("boom"))
        });
        assert!(result.is_err());
        assert_eq!(fx.engine.row_count("t"), 0);
        assert!(fx.recorder.committed.lock().is_empty());
        assert_eq!(fx.recorder.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_failure_is_undone_alone_with_savepoints() {
        let fx = fixture();
        fx.manager
            .run_transaction(None, true, |scope| {
                put(scope, 1)?;
                let inner: CoreResult<()> = fx.manager.run_transaction(None, true, |inner| {
                    assert_eq!(inner.depth(), 2);
                    put(inner, 2)?;
                    Err(CoreError::invalid_operation("inner"))
                });
                assert!(inner.is_err());
                put(scope, 3)
            })
            .unwrap();

        assert_eq!(fx.engine.row_count("t"), 2);
        let committed = fx.recorder.committed.lock();
        let keys: Vec<u8> = committed[0].iter().map(|e| e.primary_key[0]).collect();
        assert_eq!(keys, vec![1, 3]);
    }

    #[test]
    fn nested_failure_without_savepoints_dooms_outer() {
        let fx = fixture_with(EngineOptions::default().savepoints(false), 100);
        let result = fx.manager.run_transaction(None, true, |scope| {
            put(scope, 1)?;
            let _ = fx.manager.run_transaction(None, true, |inner| {
                put(inner, 2)?;
                Err::<(), _>(CoreError::invalid_operation("inner"))
            });
            Ok(())
        });
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
        assert_eq!(fx.engine.row_count("t"), 0);
    }

    #[test]
    fn read_only_rejects_writes() {
        let fx = fixture();
        let result = fx
            .manager
            .run_transaction(None, false, |scope| put(scope, 1));
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));

        let nested = fx.manager.run_transaction(None, false, |_| {
            fx.manager.run_transaction(None, true, |_| Ok(()))
        });
        assert!(nested.is_err());
    }

    #[test]
    fn isolation_is_negotiated() {
        let fx = fixture_with(
            EngineOptions::default().isolation_levels(vec![IsolationLevel::Serializable]),
            100,
        );
        let level = fx
            .manager
            .run_transaction(Some(IsolationLevel::ReadCommitted), false, |scope| {
                Ok(scope.isolation())
            })
            .unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
    }

    #[test]
    fn large_transactions_spill_and_clean_up() {
        let fx = fixture_with(EngineOptions::default(), 4);
        fx.manager
            .run_transaction(None, true, |scope| {
                for key in 0..10 {
                    put(scope, key)?;
                }
                assert_eq!(std::fs::read_dir(fx.spill.path()).unwrap().count(), 1);
                Ok(())
            })
            .unwrap();
        assert_eq!(std::fs::read_dir(fx.spill.path()).unwrap().count(), 0);
        assert_eq!(fx.recorder.committed.lock()[0].len(), 10);
    }

    #[test]
    fn panicking_work_rolls_back() {
        let fx = fixture();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = fx
                .manager
                .run_transaction(None, true, |scope| -> CoreResult<()> {
                    put(scope, 1)?;
                    panic!("work panicked")
                });
        }));
        assert!(outcome.is_err());
        assert_eq!(fx.engine.row_count("t"), 0);

        fx.manager
            .run_transaction(None, true, |scope| put(scope, 2))
            .unwrap();
        assert_eq!(fx.engine.row_count("t"), 1);
    }

    #[test]
    fn sessions_are_per_thread_and_reaped() {
        let fx = Arc::new(fixture());
        fx.manager
            .run_transaction(None, false, |_| Ok(()))
            .unwrap();
        let worker = {
            let fx = Arc::clone(&fx);
            thread::spawn(move || {
                fx.manager
                    .run_transaction(None, true, |scope| put(scope, 7))
                    .unwrap();
            })
        };
        worker.join().unwrap();
        assert_eq!(fx.manager.session_count(), 2);

        let other = {
            let fx = Arc::clone(&fx);
            thread::spawn(move || {
                fx.manager.run_transaction(None, false, |_| Ok(())).unwrap();
            })
        };
        other.join().unwrap();
        assert_eq!(fx.manager.session_count(), 2);
    }

    #[test]
    fn synchronized_transactions_are_reentrant() {
        let fx = fixture();
        fx.manager
            .run_synchronized_transaction(None, true, |scope| {
                put(scope, 1)?;
                fx.manager
                    .run_synchronized_transaction(None, true, |inner| put(inner, 2))
            })
            .unwrap();
        assert_eq!(fx.engine.row_count("t"), 2);
    }

    #[test]
    fn close_refuses_new_work() {
        let fx = fixture();
        fx.manager.run_transaction(None, false, |_| Ok(())).unwrap();
        fx.manager.close();
        assert_eq!(fx.manager.session_count(), 0);
        let result = fx.manager.run_transaction(None, false, |_| Ok(()));
        assert!(matches!(result, Err(CoreError::DatabaseClosed)));
    }
}

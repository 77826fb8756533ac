//! State shared by a database and its commit pipeline.

use crate::backup::{BackupRestoreManager, Snapshot};
use crate::collision::{CollisionResolver, PeerPriority};
use crate::error::{CoreError, CoreResult};
use crate::hooks::{Hook, PeerRegistry};
use crate::listener::DatabaseListener;
use crate::log::{PendingTransaction, TransactionLog};
use crate::schema::Catalog;
use crate::storage::{Connection, StorageEngine};
use crate::transaction::{CommitObserver, EventBuffer, PreparedCommit};
use crate::types::now_utc_millis;
use ooddb_protocol::{TableEvent, TransactionId};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct Shared {
    pub(crate) engine: Arc<dyn StorageEngine>,
    pub(crate) catalog: Catalog,
    pub(crate) log: TransactionLog,
    pub(crate) hooks: PeerRegistry,
    pub(crate) backups: Option<BackupRestoreManager>,
    listeners: RwLock<Vec<Arc<dyn DatabaseListener>>>,
    resolver: RwLock<Arc<dyn CollisionResolver>>,
}

impl Shared {
    pub(crate) fn new(engine: Arc<dyn StorageEngine>, backups: Option<BackupRestoreManager>) -> Self {
        Self {
            engine,
            catalog: Catalog::new(),
            log: TransactionLog::new(),
            hooks: PeerRegistry::new(),
            backups,
            listeners: RwLock::new(Vec::new()),
            resolver: RwLock::new(Arc::new(PeerPriority)),
        }
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn DatabaseListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn resolver(&self) -> Arc<dyn CollisionResolver> {
        Arc::clone(&self.resolver.read())
    }

    pub(crate) fn set_resolver(&self, resolver: Arc<dyn CollisionResolver>) {
        *self.resolver.write() = resolver;
    }

    fn listeners(&self) -> Vec<Arc<dyn DatabaseListener>> {
        self.listeners.read().clone()
    }

    pub(crate) fn notify_logged(&self, id: TransactionId) {
        for listener in self.listeners() {
            listener.transaction_logged(id);
        }
    }

    pub(crate) fn notify_hook_removed(&self, hook: &Hook) {
        for listener in self.listeners() {
            listener.hook_removed(hook);
        }
    }

    pub(crate) fn notify_new_events(&self) {
        for listener in self.listeners() {
            listener.new_database_event_detected();
        }
    }

    /// Commit instant, strictly increasing while backups are kept.
    pub(crate) fn next_timestamp(&self) -> u64 {
        self.backups
            .as_ref()
            .map_or_else(now_utc_millis, BackupRestoreManager::next_timestamp)
    }

    /// Committed rows of every registered table.
    pub(crate) fn snapshot(&self) -> CoreResult<Snapshot> {
        let mut conn = self.engine.connect()?;
        let mut snapshot = Snapshot::new();
        for table in self.catalog.all() {
            let rows = conn.scan(table.name())?.into_iter().collect();
            snapshot.insert(table.name().to_string(), rows);
        }
        conn.close()?;
        Ok(snapshot)
    }

    fn packages_of(&self, events: &EventBuffer) -> CoreResult<BTreeSet<String>> {
        let mut tables = BTreeSet::new();
        for event in events.iter()? {
            tables.insert(event?.table);
        }
        tables
            .iter()
            .map(|t| self.catalog.get(t).map(|s| s.package().to_string()))
            .collect()
    }
}

impl CommitObserver for Shared {
    fn serializes_commits(&self) -> bool {
        self.backups.is_some()
    }

    fn before_commit(
        &self,
        conn: &mut dyn Connection,
        events: &EventBuffer,
        replicated: &[TableEvent],
    ) -> CoreResult<PreparedCommit> {
        let mut prepared = PreparedCommit {
            timestamp_utc: self.next_timestamp(),
            ..PreparedCommit::default()
        };
        if !events.is_empty() {
            if let Some(local) = self.hooks.local(conn)? {
                let packages = self.packages_of(events)?;
                let concerned: BTreeSet<_> = self
                    .hooks
                    .distant(conn)?
                    .iter()
                    .filter(|h| packages.iter().any(|p| h.supports(p)))
                    .map(|h| h.id)
                    .collect();
                if !concerned.is_empty() {
                    let pending = PendingTransaction::local(
                        prepared.timestamp_utc,
                        self.hooks.known(conn)?,
                        concerned,
                    );
                    let logged = self.log.append(conn, local.id, pending, events.iter()?)?;
                    debug!(id = %logged.id, events = logged.event_count, "local transaction logged");
                    prepared.logged = Some(logged.id);
                }
            }
        }
        if self.backups.is_some() && (!events.is_empty() || !replicated.is_empty()) {
            let mut all = events.to_vec()?;
            all.extend_from_slice(replicated);
            prepared.backup_events = Some(all);
        }
        Ok(prepared)
    }

    fn after_commit(&self, prepared: PreparedCommit) -> CoreResult<()> {
        self.hooks.invalidate();
        if let (Some(backups), Some(events)) = (&self.backups, prepared.backup_events) {
            backups
                .record_commit(prepared.timestamp_utc, &events, || self.snapshot())
                .map_err(|e| {
                    warn!(error = %e, "transaction committed without its backup");
                    CoreError::BackupWriteFailed {
                        source: Box::new(e),
                    }
                })?;
        }
        Ok(())
    }

    fn after_rollback(&self) {
        self.hooks.invalidate();
    }

    fn committed(&self, logged: Option<TransactionId>) {
        if let Some(id) = logged {
            self.notify_logged(id);
        }
    }
}

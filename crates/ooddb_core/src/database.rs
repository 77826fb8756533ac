//! Database facade.

use crate::backup::{BackupFile, BackupRestoreManager};
use crate::collision::CollisionResolver;
use crate::commit::Shared;
use crate::config::Config;
use crate::context::Transaction;
use crate::error::{CoreError, CoreResult};
use crate::hooks::{cursor, AddHooksOutcome, Hook, PairingState, QueuedMessage};
use crate::internal::{self, SCHEMAS};
use crate::listener::DatabaseListener;
use crate::log::LoggedTransaction;
use crate::registry::DatabaseRegistry;
use crate::schema::{TableDef, TableSchema};
use crate::storage::{Connection, EngineOptions, MemoryEngine, StorageEngine};
use crate::transaction::{CommitObserver, ManagerOptions, TransactionManager, TransactionScope};
use crate::types::{now_utc_millis, HookId, IsolationLevel, TransactionId};
use ooddb_protocol::{AuthenticatedBody, TableEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A replicated database.
///
/// `Database` wraps a storage engine and turns it into a node of a
/// multi-peer replicated store. It provides:
/// - typed record transactions ([`Database::write`], [`Database::read`])
/// - the transaction log shipped to peers
/// - peer (hook) registration and package support
/// - replication entry points used by the synchronizer
/// - point-in-time backups when [`Config::backup`] is set
///
/// # Opening a Database
///
/// ```rust,ignore
/// use ooddb_core::{Config, Database, DatabaseRegistry};
///
/// let registry = DatabaseRegistry::new();
/// let db = Database::open(Path::new("my_database"), Config::default(), &registry)?;
/// db.register_table(TableDef::new("person", "people")
///     .field(FieldDef::new("id", FieldKind::Integer).primary_key())
///     .field(FieldDef::new("name", FieldKind::Text)))?;
///
/// db.write(|tx| tx.insert("person", &Record::new().with("id", 1).with("name", "Ada")))?;
/// ```
///
/// Wrappers opened on the same name through one [`DatabaseRegistry`] share
/// the lock taken by synchronized transactions.
pub struct Database {
    name: String,
    shared: Arc<Shared>,
    transactions: TransactionManager,
    journal: Option<MemoryEngine>,
}

impl Database {
    /// Opens a durable database in `path`, replaying its journal.
    ///
    /// Spill files go to the database's `tmp/` directory unless
    /// [`Config::spill_directory`] says otherwise.
    ///
    /// # Errors
    ///
    /// `DatabaseLocked` if another process holds the directory, I/O and
    /// corruption errors from the journal replay.
    pub fn open(path: &Path, config: Config, registry: &Arc<DatabaseRegistry>) -> CoreResult<Self> {
        let options = EngineOptions::default().sync_on_commit(config.sync_on_commit);
        let engine = MemoryEngine::open(path, config.create_if_missing, options)?;
        let dir = engine
            .directory()
            .ok_or_else(|| CoreError::engine("durable engine without a directory"))?;
        let spill = match &config.spill_directory {
            Some(spill) => spill.clone(),
            None => dir.tmp_dir()?,
        };
        let name = path.display().to_string();
        Self::assemble(
            name,
            Arc::new(engine.clone()),
            Some(engine),
            config,
            spill,
            registry,
        )
    }

    /// Opens a volatile database.
    pub fn open_in_memory(
        name: &str,
        config: Config,
        registry: &Arc<DatabaseRegistry>,
    ) -> CoreResult<Self> {
        let options = EngineOptions::default().sync_on_commit(config.sync_on_commit);
        let engine = Arc::new(MemoryEngine::with_options(name, options));
        Self::open_with_engine(name, engine, config, registry)
    }

    /// Wraps an arbitrary engine.
    pub fn open_with_engine(
        name: &str,
        engine: Arc<dyn StorageEngine>,
        config: Config,
        registry: &Arc<DatabaseRegistry>,
    ) -> CoreResult<Self> {
        let spill = config
            .spill_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        Self::assemble(name.to_string(), engine, None, config, spill, registry)
    }

    fn assemble(
        name: String,
        engine: Arc<dyn StorageEngine>,
        journal: Option<MemoryEngine>,
        config: Config,
        spill_directory: PathBuf,
        registry: &Arc<DatabaseRegistry>,
    ) -> CoreResult<Self> {
        for table in internal::ALL {
            engine.create_table(table)?;
        }
        let backups = config
            .backup
            .clone()
            .map(BackupRestoreManager::open)
            .transpose()?;
        let shared = Arc::new(Shared::new(Arc::clone(&engine), backups));
        let observer: Arc<dyn CommitObserver> = Arc::clone(&shared) as Arc<dyn CommitObserver>;
        let transactions = TransactionManager::new(
            engine,
            registry.acquire(&name),
            observer,
            ManagerOptions {
                default_isolation: config.default_isolation,
                max_events_in_memory: config.max_events_in_memory,
                spill_directory,
            },
        );
        info!(database = %name, backups = shared.backups.is_some(), "database opened");
        Ok(Self {
            name,
            shared,
            transactions,
            journal,
        })
    }

    /// Name the database was opened under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The transaction manager.
    #[must_use]
    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Declares a table.
    ///
    /// # Errors
    ///
    /// `VersionMismatch` if the database stores a different declaration
    /// under the same name, `TableNotFound` for a foreign key to an
    /// undeclared table.
    pub fn register_table(&self, def: TableDef) -> CoreResult<Arc<TableSchema>> {
        let schema = TableSchema::resolve(def)?;
        let name = schema.name().to_string();
        let declared = schema.fingerprint();
        let stored = self.with_read(|conn| conn.get(SCHEMAS, name.as_bytes()))?;
        if let Some(stored) = stored {
            let stored = <[u8; 8]>::try_from(stored.as_slice())
                .map(u64::from_be_bytes)
                .map_err(|_| CoreError::Codec(format!("bad fingerprint for '{name}'")))?;
            if stored != declared {
                return Err(CoreError::VersionMismatch {
                    table: name,
                    stored,
                    declared,
                });
            }
        }
        let schema = self.shared.catalog.register(schema)?;
        self.shared.engine.create_table(&name)?;
        self.with_write(|conn| conn.put(SCHEMAS, name.as_bytes(), &declared.to_be_bytes()))?;
        debug!(table = %name, package = schema.package(), "table registered");
        Ok(schema)
    }

    /// Declared table.
    pub fn table(&self, name: &str) -> CoreResult<Arc<TableSchema>> {
        self.shared.catalog.get(name)
    }

    /// Runs `work` in a transaction of the calling thread.
    ///
    /// Nested calls join the running transaction. See
    /// [`TransactionManager::run_transaction`].
    pub fn run_transaction<T, F>(
        &self,
        isolation: Option<IsolationLevel>,
        write: bool,
        work: F,
    ) -> CoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> CoreResult<T>,
    {
        self.transactions
            .run_transaction(isolation, write, |scope| {
                work(&Transaction::new(scope, &self.shared.catalog))
            })
    }

    /// Like [`Database::run_transaction`], under the lock shared by every
    /// wrapper of this database name.
    pub fn run_synchronized_transaction<T, F>(
        &self,
        isolation: Option<IsolationLevel>,
        write: bool,
        work: F,
    ) -> CoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> CoreResult<T>,
    {
        self.transactions
            .run_synchronized_transaction(isolation, write, |scope| {
                work(&Transaction::new(scope, &self.shared.catalog))
            })
    }

    /// Runs a write transaction with the default isolation.
    pub fn write<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> CoreResult<T>,
    {
        self.run_transaction(None, true, work)
    }

    /// Runs a read-only transaction with the default isolation.
    pub fn read<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> CoreResult<T>,
    {
        self.run_transaction(None, false, work)
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Internal write, serialized with the other wrappers of this name.
    pub(crate) fn internal_write<T>(
        &self,
        work: impl FnOnce(&TransactionScope<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.transactions
            .run_synchronized_transaction(None, true, work)
    }

    pub(crate) fn with_write<T>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.internal_write(|scope| scope.write(f))
    }

    pub(crate) fn with_read<T>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.transactions
            .run_synchronized_transaction(None, false, |scope| scope.read(f))
    }

    /// Creates the hook standing for this host.
    ///
    /// # Errors
    ///
    /// `LocalHookAlreadyExists` when called twice.
    pub fn init_local_hook(&self, id: HookId) -> CoreResult<Hook> {
        self.with_write(|conn| self.shared.hooks.init_local_hook(conn, id))
    }

    /// Id of this host, once initialized.
    pub fn local_hook_id(&self) -> CoreResult<Option<HookId>> {
        self.with_read(|conn| Ok(self.shared.hooks.local(conn)?.map(|h| h.id)))
    }

    /// Registers a peer, or revives a removed one, with pairing in progress.
    pub fn init_distant_hook(&self, id: HookId) -> CoreResult<Hook> {
        self.with_write(|conn| {
            self.shared
                .hooks
                .init_distant_hook(conn, id, PairingState::P2PPairingInProgress)
        })
    }

    /// Registers peers and their package support in one transaction.
    ///
    /// Newly supported packages are seeded with a snapshot for the peer,
    /// and a changed package set is announced to every active peer.
    /// `replace_conflicts` sets whether the peers' snapshot rows replace
    /// conflicting rows here; `None` keeps the current setting.
    pub fn add_hooks(
        &self,
        package_support: &BTreeMap<HookId, BTreeSet<String>>,
        replace_conflicts: Option<bool>,
    ) -> CoreResult<AddHooksOutcome> {
        let outcome = self.with_write(|conn| {
            self.shared.hooks.add_hooks(
                conn,
                &self.shared.log,
                &self.shared.catalog,
                package_support,
                replace_conflicts,
                false,
                now_utc_millis(),
            )
        })?;
        for (_, _, seed) in &outcome.seeds {
            self.shared.notify_logged(*seed);
        }
        Ok(outcome)
    }

    /// Registers one peer replicating `packages` (empty for every package).
    pub fn add_hook(&self, id: HookId, packages: BTreeSet<String>) -> CoreResult<AddHooksOutcome> {
        self.add_hooks(&BTreeMap::from([(id, packages)]), None)
    }

    /// Forgets a peer at once.
    ///
    /// # Errors
    ///
    /// `UnknownPeer` if the hook is not registered.
    pub fn remove_hook(&self, id: HookId) -> CoreResult<Hook> {
        let hook = self.with_write(|conn| {
            self.shared
                .hooks
                .remove_hook(conn, &self.shared.log, &self.shared.catalog, id)
        })?;
        self.shared.notify_hook_removed(&hook);
        Ok(hook)
    }

    /// Asks every active peer, `id` included, to forget `id`.
    ///
    /// The hook is removed here once the first notice is delivered.
    /// Returns the number of notices queued.
    pub fn remove_hook_with_notice(&self, id: HookId) -> CoreResult<usize> {
        let queued = self.with_write(|conn| {
            let hooks = &self.shared.hooks;
            hooks.require_active(conn, id)?;
            let peers = hooks.distant(conn)?;
            for peer in &peers {
                hooks.enqueue_message(
                    conn,
                    peer.id,
                    AuthenticatedBody::HookRemoveRequest { removed: id },
                )?;
            }
            Ok(peers.len())
        })?;
        info!(hook = %id, notices = queued, "hook removal requested");
        Ok(queued)
    }

    /// Every hook, the local one included.
    pub fn hooks(&self) -> CoreResult<Vec<Hook>> {
        self.with_read(|conn| Ok(self.shared.hooks.all(conn)?.as_ref().clone()))
    }

    /// One hook.
    pub fn hook(&self, id: HookId) -> CoreResult<Option<Hook>> {
        self.with_read(|conn| self.shared.hooks.get(conn, id))
    }

    /// Returns true if some active peer replicates `package`.
    pub fn support_package(&self, package: &str) -> CoreResult<bool> {
        self.with_read(|conn| self.shared.hooks.support_package(conn, package))
    }

    /// Marks a peer's pairing state.
    pub fn set_pairing_state(&self, id: HookId, state: PairingState) -> CoreResult<Hook> {
        self.with_write(|conn| self.shared.hooks.set_pairing_state(conn, id, state))
    }

    /// Authenticated messages waiting for `destination`, in id order.
    pub fn pending_messages(&self, destination: HookId) -> CoreResult<Vec<QueuedMessage>> {
        self.with_read(|conn| self.shared.hooks.pending_messages(conn, destination))
    }

    /// Acknowledges delivery of a queued message.
    ///
    /// Delivering a removal notice removes the hook it names.
    pub fn message_sent(
        &self,
        destination: HookId,
        message_id: u64,
    ) -> CoreResult<Option<QueuedMessage>> {
        let (message, removed) = self.with_write(|conn| {
            let hooks = &self.shared.hooks;
            let message = hooks.message_sent(
                conn,
                &self.shared.log,
                &self.shared.catalog,
                destination,
                message_id,
            )?;
            let removed = match &message {
                Some(QueuedMessage {
                    body: AuthenticatedBody::HookRemoveRequest { removed },
                    ..
                }) => hooks
                    .get(conn, *removed)?
                    .filter(|h| h.pairing_state == PairingState::Removed),
                _ => None,
            };
            Ok((message, removed))
        })?;
        if let Some(hook) = removed {
            self.shared.notify_hook_removed(&hook);
        }
        Ok(message)
    }

    /// Last id assigned in the log.
    pub fn last_transaction_id(&self) -> CoreResult<TransactionId> {
        self.with_read(|conn| self.shared.log.last_id(conn))
    }

    /// Headers of the transactions still in the log.
    pub fn logged_transactions(&self) -> CoreResult<Vec<LoggedTransaction>> {
        self.with_read(|conn| {
            let mut out = Vec::new();
            self.shared
                .log
                .walk_after(conn, TransactionId::ZERO, |_, header| {
                    out.push(header);
                    Ok(true)
                })?;
            Ok(out)
        })
    }

    /// Events of a logged transaction.
    pub fn logged_events(&self, id: TransactionId) -> CoreResult<Vec<TableEvent>> {
        self.with_read(|conn| match self.shared.log.header(conn, id)? {
            Some(header) => self.shared.log.events(conn, &header),
            None => Ok(Vec::new()),
        })
    }

    /// Highest of `server`'s transaction ids `target` is known to have applied.
    pub fn transaction_cursor(&self, server: HookId, target: HookId) -> CoreResult<u64> {
        self.with_read(|conn| cursor::get(conn, server, target))
    }

    /// Replaces the collision policy.
    pub fn set_collision_resolver(&self, resolver: Arc<dyn CollisionResolver>) {
        self.shared.set_resolver(resolver);
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn DatabaseListener>) {
        self.shared.add_listener(listener);
    }

    /// Backup manager, when backups are enabled.
    #[must_use]
    pub fn backups(&self) -> Option<&BackupRestoreManager> {
        self.shared.backups.as_ref()
    }

    pub(crate) fn require_backups(&self) -> CoreResult<&BackupRestoreManager> {
        self.backups()
            .ok_or_else(|| CoreError::backup("backups are not enabled"))
    }

    /// Writes a reference of the current state, between two commits.
    pub fn create_backup_reference(&self) -> CoreResult<BackupFile> {
        let backups = self.require_backups()?;
        self.transactions.between_commits(|| {
            let snapshot = self.shared.snapshot()?;
            backups.create_reference(&snapshot)
        })
    }

    /// Makes the next commit write a reference.
    pub fn activate_backup_reference_creation(&self) -> CoreResult<()> {
        self.require_backups()?.activate_backup_reference_creation();
        Ok(())
    }

    /// Rewrites the journal of a durable database as one snapshot.
    pub fn compact(&self) -> CoreResult<()> {
        match &self.journal {
            Some(engine) => engine.compact(),
            None => Ok(()),
        }
    }

    /// Closes every session. Later calls fail with `DatabaseClosed`.
    pub fn close(&self) {
        self.transactions.close();
        info!(database = %self.name, "database closed");
    }

    /// Returns true once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.transactions.is_closed()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.transactions.is_closed() {
            self.transactions.close();
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("transactions", &self.transactions)
            .finish_non_exhaustive()
    }
}

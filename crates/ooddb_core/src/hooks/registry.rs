//! Hook persistence and peer-management operations.

use super::{cursor, gossip, messages, Hook, PairingState, QueuedMessage};
use crate::codec::{decode, encode};
use crate::error::{CoreError, CoreResult};
use crate::internal::HOOKS;
use crate::log::{version, PendingTransaction, TransactionLog};
use crate::schema::Catalog;
use crate::storage::Connection;
use ooddb_protocol::{AuthenticatedBody, HookId, TableEvent, TransactionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

/// Result of [`PeerRegistry::add_hooks`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddHooksOutcome {
    /// Hooks created or revived.
    pub registered: Vec<HookId>,
    /// Snapshot transactions logged, per hook and package.
    pub seeds: Vec<(HookId, String, TransactionId)>,
    /// Announcements queued to peers.
    pub announcements: usize,
}

#[derive(Debug, Default)]
struct Cache {
    hooks: Option<Arc<Vec<Hook>>>,
    /// Bumped on every hook write and every conclusion.
    generation: u64,
    /// Threads whose open transaction wrote hooks.
    writers: HashSet<ThreadId>,
}

/// Registered hooks with a lazily loaded cache.
///
/// The cache only ever holds committed state: it is neither read nor
/// filled while some thread has uncommitted hook writes, and a fill that
/// raced with a write is discarded.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    cache: Mutex<Cache>,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Called when the current thread's transaction concludes.
    pub(crate) fn invalidate(&self) {
        let mut cache = self.cache.lock();
        cache.hooks = None;
        cache.generation += 1;
        cache.writers.remove(&thread::current().id());
    }

    fn written(&self) {
        let mut cache = self.cache.lock();
        cache.hooks = None;
        cache.generation += 1;
        cache.writers.insert(thread::current().id());
    }

    /// Every hook, local one included.
    pub(crate) fn all(&self, conn: &mut dyn Connection) -> CoreResult<Arc<Vec<Hook>>> {
        let generation = {
            let cache = self.cache.lock();
            if !cache.writers.is_empty() {
                None
            } else if let Some(hooks) = &cache.hooks {
                return Ok(Arc::clone(hooks));
            } else {
                Some(cache.generation)
            }
        };
        let hooks: Vec<Hook> = conn
            .scan(HOOKS)?
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect::<CoreResult<_>>()?;
        let hooks = Arc::new(hooks);
        if let Some(generation) = generation {
            let mut cache = self.cache.lock();
            if cache.generation == generation && cache.writers.is_empty() {
                cache.hooks = Some(Arc::clone(&hooks));
            }
        }
        Ok(hooks)
    }

    pub(crate) fn get(&self, conn: &mut dyn Connection, id: HookId) -> CoreResult<Option<Hook>> {
        conn.get(HOOKS, id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// A distant hook that is not removed.
    pub(crate) fn require_active(&self, conn: &mut dyn Connection, id: HookId) -> CoreResult<Hook> {
        match self.get(conn, id)? {
            Some(hook) if hook.is_active_distant() => Ok(hook),
            _ => Err(CoreError::UnknownPeer(id)),
        }
    }

    pub(crate) fn put(&self, conn: &mut dyn Connection, hook: &Hook) -> CoreResult<()> {
        conn.put(HOOKS, hook.id.as_bytes(), &encode(hook)?)?;
        self.written();
        Ok(())
    }

    pub(crate) fn local(&self, conn: &mut dyn Connection) -> CoreResult<Option<Hook>> {
        Ok(self
            .all(conn)?
            .iter()
            .find(|h| h.concerns_local_host)
            .cloned())
    }

    pub(crate) fn require_local(&self, conn: &mut dyn Connection) -> CoreResult<Hook> {
        self.local(conn)?.ok_or(CoreError::LocalHookMissing)
    }

    /// Active distant hooks.
    pub(crate) fn distant(&self, conn: &mut dyn Connection) -> CoreResult<Vec<Hook>> {
        Ok(self
            .all(conn)?
            .iter()
            .filter(|h| h.is_active_distant())
            .cloned()
            .collect())
    }

    /// Accepted distant ids per hook, the causal view stamped on local commits.
    pub(crate) fn known(&self, conn: &mut dyn Connection) -> CoreResult<BTreeMap<HookId, u64>> {
        Ok(self
            .all(conn)?
            .iter()
            .filter(|h| !h.concerns_local_host)
            .filter(|h| h.last_validated_distant_transaction_id > TransactionId::ZERO)
            .map(|h| (h.id, h.last_validated_distant_transaction_id.as_u64()))
            .collect())
    }

    /// Returns true if an active distant hook replicates `package`.
    pub(crate) fn support_package(&self, conn: &mut dyn Connection, package: &str) -> CoreResult<bool> {
        Ok(self
            .all(conn)?
            .iter()
            .any(|h| h.is_active_distant() && h.supports(package)))
    }

    pub(crate) fn init_local_hook(&self, conn: &mut dyn Connection, id: HookId) -> CoreResult<Hook> {
        if let Some(existing) = self.local(conn)? {
            return Err(CoreError::LocalHookAlreadyExists(existing.id));
        }
        let hook = Hook::new(id, true, PairingState::Paired);
        self.put(conn, &hook)?;
        info!(hook = %id, "local hook initialized");
        Ok(hook)
    }

    /// Registers `id` or revives it after removal.
    pub(crate) fn init_distant_hook(
        &self,
        conn: &mut dyn Connection,
        id: HookId,
        state: PairingState,
    ) -> CoreResult<Hook> {
        let local = self.require_local(conn)?;
        if id == local.id {
            return Err(CoreError::invalid_operation(
                "the local hook cannot be registered as a peer",
            ));
        }
        if let Some(existing) = self.get(conn, id)? {
            if existing.pairing_state != PairingState::Removed {
                return Ok(existing);
            }
        }
        let hook = Hook::new(id, false, state);
        self.put(conn, &hook)?;
        debug!(hook = %id, %state, "distant hook registered");
        Ok(hook)
    }

    /// Registers or updates package support for several peers at once.
    ///
    /// Every package a peer newly replicates is seeded with a snapshot of
    /// its current rows, concerned only by that peer. Unless the call
    /// answers a peer's announcement, a changed package set is announced
    /// to every active peer.
    pub(crate) fn add_hooks(
        &self,
        conn: &mut dyn Connection,
        log: &TransactionLog,
        catalog: &Catalog,
        package_support: &BTreeMap<HookId, BTreeSet<String>>,
        replace_conflicts: Option<bool>,
        from_remote: bool,
        now_utc: u64,
    ) -> CoreResult<AddHooksOutcome> {
        let local = self.require_local(conn)?;
        let declared = catalog.packages();
        let pairing = if from_remote {
            PairingState::Paired
        } else {
            PairingState::P2PPairingInProgress
        };
        let mut outcome = AddHooksOutcome::default();
        let mut changed = false;

        for (&id, packages) in package_support {
            if id == local.id {
                continue;
            }
            let (mut hook, created) = match self.get(conn, id)? {
                Some(hook) if hook.pairing_state != PairingState::Removed => (hook, false),
                _ => (self.init_distant_hook(conn, id, pairing)?, true),
            };
            let before = if created {
                BTreeSet::new()
            } else {
                hook.effective_packages(&declared)
            };
            if created || hook.packages != *packages {
                changed = true;
            }
            hook.packages = packages.clone();
            if let Some(replace) = replace_conflicts {
                hook.replace_conflicts_on_resynchronization = replace;
            }
            self.put(conn, &hook)?;

            let after = hook.effective_packages(&declared);
            for package in after.difference(&before) {
                if let Some(seed) = self.seed(conn, log, catalog, &local, &hook, package, now_utc)? {
                    hook.package_seeds.insert(package.clone(), seed);
                    outcome.seeds.push((id, package.clone(), seed));
                }
            }
            self.put(conn, &hook)?;
            if created {
                outcome.registered.push(id);
            }
        }

        if changed && !from_remote {
            let body = AuthenticatedBody::HookSynchronizeRequest {
                packages: package_support.clone(),
                replace_conflicts: replace_conflicts.is_some_and(|r| !r),
            };
            for peer in self.distant(conn)? {
                self.enqueue_message(conn, peer.id, body.clone())?;
                outcome.announcements += 1;
            }
        }
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn seed(
        &self,
        conn: &mut dyn Connection,
        log: &TransactionLog,
        catalog: &Catalog,
        local: &Hook,
        hook: &Hook,
        package: &str,
        now_utc: u64,
    ) -> CoreResult<Option<TransactionId>> {
        let mut events = Vec::new();
        for table in catalog.package_tables(package) {
            for (key, row) in conn.scan(table.name())? {
                events.push(Ok(TableEvent::insert(table.name(), key, row)));
            }
        }
        if events.is_empty() {
            return Ok(None);
        }
        let pending =
            PendingTransaction::local(now_utc, self.known(conn)?, BTreeSet::from([hook.id]))
                .resynchronization();
        let logged = log.append(conn, local.id, pending, events)?;
        debug!(hook = %hook.id, package, id = %logged.id, events = logged.event_count, "package seeded");
        Ok(Some(logged.id))
    }

    /// Forgets a peer.
    ///
    /// Its queues and cursors go away, it leaves every concerned set, and
    /// packages nobody replicates any more lose their version stamps.
    pub(crate) fn remove_hook(
        &self,
        conn: &mut dyn Connection,
        log: &TransactionLog,
        catalog: &Catalog,
        id: HookId,
    ) -> CoreResult<Hook> {
        let mut hook = self.get(conn, id)?.ok_or(CoreError::UnknownPeer(id))?;
        if hook.concerns_local_host {
            return Err(CoreError::invalid_operation("the local hook cannot be removed"));
        }
        hook.reset();
        self.put(conn, &hook)?;
        let dropped_messages = messages::clear(conn, id)?;
        cursor::forget(conn, id)?;
        gossip::forget(conn, id)?;
        let (updated, deleted) = log.remove_concerned(conn, id)?;

        let remaining = self.distant(conn)?;
        for package in catalog.packages() {
            if remaining.iter().any(|h| h.supports(&package)) {
                continue;
            }
            for table in catalog.package_tables(&package) {
                version::forget_table(conn, table.name())?;
            }
        }
        info!(
            hook = %id,
            dropped_messages,
            updated,
            deleted,
            "hook removed"
        );
        Ok(hook)
    }

    /// Records the peer's log position. Moving backwards is refused.
    pub(crate) fn set_last_validated_distant(
        &self,
        conn: &mut dyn Connection,
        id: HookId,
        value: TransactionId,
        utc: u64,
    ) -> CoreResult<Hook> {
        let mut hook = self.require_active(conn, id)?;
        let current = hook.last_validated_distant_transaction_id;
        if value < current {
            return Err(CoreError::CursorRegression {
                hook: id,
                current: current.as_u64(),
                attempted: value.as_u64(),
            });
        }
        if value > current {
            hook.last_validated_distant_transaction_id = value;
            hook.last_validated_distant_transaction_utc = utc;
            self.put(conn, &hook)?;
        }
        Ok(hook)
    }

    /// Raises the local confirmation of `id`; returns whether it moved.
    pub(crate) fn advance_last_validated_local(
        &self,
        conn: &mut dyn Connection,
        id: HookId,
        value: TransactionId,
    ) -> CoreResult<bool> {
        let mut hook = self.require_active(conn, id)?;
        if value <= hook.last_validated_local_transaction_id {
            return Ok(false);
        }
        hook.last_validated_local_transaction_id = value;
        self.put(conn, &hook)?;
        Ok(true)
    }

    /// Sets the local confirmation of `id` even when lower, as a peer that
    /// lost data reports during a handshake.
    pub(crate) fn reset_last_validated_local(
        &self,
        conn: &mut dyn Connection,
        id: HookId,
        value: TransactionId,
    ) -> CoreResult<Hook> {
        let mut hook = self.require_active(conn, id)?;
        if value < hook.last_validated_local_transaction_id {
            warn!(
                hook = %id,
                from = %hook.last_validated_local_transaction_id,
                to = %value,
                "peer reports an older position, resending"
            );
        }
        hook.last_validated_local_transaction_id = value;
        self.put(conn, &hook)?;
        Ok(hook)
    }

    pub(crate) fn set_pairing_state(
        &self,
        conn: &mut dyn Connection,
        id: HookId,
        state: PairingState,
    ) -> CoreResult<Hook> {
        let mut hook = self.require_active(conn, id)?;
        if hook.pairing_state != state {
            info!(hook = %id, from = %hook.pairing_state, to = %state, "pairing state changed");
            hook.pairing_state = state;
            self.put(conn, &hook)?;
        }
        Ok(hook)
    }

    /// Queues an authenticated message for `destination`.
    pub(crate) fn enqueue_message(
        &self,
        conn: &mut dyn Connection,
        destination: HookId,
        body: AuthenticatedBody,
    ) -> CoreResult<u64> {
        let mut hook = self.require_active(conn, destination)?;
        let message_id = hook.next_message_id;
        hook.next_message_id += 1;
        self.put(conn, &hook)?;
        messages::put(
            conn,
            &QueuedMessage {
                message_id,
                destination,
                body,
            },
        )?;
        Ok(message_id)
    }

    pub(crate) fn pending_messages(
        &self,
        conn: &mut dyn Connection,
        destination: HookId,
    ) -> CoreResult<Vec<QueuedMessage>> {
        messages::pending(conn, destination)
    }

    /// Acknowledges delivery. Delivering a removal request removes the
    /// hook it names.
    pub(crate) fn message_sent(
        &self,
        conn: &mut dyn Connection,
        log: &TransactionLog,
        catalog: &Catalog,
        destination: HookId,
        message_id: u64,
    ) -> CoreResult<Option<QueuedMessage>> {
        let Some(message) = messages::take(conn, destination, message_id)? else {
            return Ok(None);
        };
        if let AuthenticatedBody::HookRemoveRequest { removed } = &message.body {
            if self.get(conn, *removed)?.is_some_and(|h| h.is_active_distant()) {
                self.remove_hook(conn, log, catalog, *removed)?;
            }
        }
        Ok(Some(message))
    }
}

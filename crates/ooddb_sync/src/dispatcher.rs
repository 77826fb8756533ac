//! Outbound queue and per-peer transfer control.
//!
//! The dispatcher decides what must be sent to which peer. Work items are
//! kept in a FIFO queue; a transfer request for a peer that already has
//! one queued is fused into it. At most one batch per peer is in flight:
//! a peer gets its next batch only once the previous one is confirmed or
//! has gone stale.
//!
//! A registered observer (the networking side) is woken through a
//! one-slot channel: it receives a single token and is not woken again
//! until it has drained the queue.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::message::SyncMessage;
use crate::peers::{PeerArena, PeerLink};
use ooddb_core::{Database, DatabaseListener, Hook, PairingState, TransactionId, ValidationOutcome};
use ooddb_protocol::{HookId, TransactionIdCorrection};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Default)]
struct Queue {
    events: VecDeque<SyncMessage>,
    closed: bool,
    /// The observer may be woken.
    can_notify: bool,
    /// The log grew since the last scan for pending peers.
    log_changed: bool,
    observer: Option<SyncSender<()>>,
}

impl Queue {
    fn pop(&mut self) -> Option<SyncMessage> {
        let next = self.events.pop_front();
        if self.events.is_empty() {
            self.can_notify = true;
        }
        next
    }

    fn wake_observer(&mut self) {
        if !self.can_notify {
            return;
        }
        let Some(observer) = &self.observer else {
            return;
        };
        match observer.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => self.can_notify = false,
            Err(TrySendError::Disconnected(())) => self.observer = None,
        }
    }
}

/// Outbound queue of one database.
pub struct SynchronizationDispatcher {
    db: Arc<Database>,
    config: SyncConfig,
    queue: Mutex<Queue>,
    available: Condvar,
    peers: Mutex<PeerArena>,
}

impl SynchronizationDispatcher {
    /// Creates a dispatcher for `db` and subscribes it to the database's
    /// notifications.
    pub fn new(db: Arc<Database>, config: SyncConfig) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            db: Arc::clone(&db),
            config,
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
            peers: Mutex::new(PeerArena::default()),
        });
        db.add_listener(Arc::new(DispatcherListener(Arc::downgrade(&dispatcher))));
        dispatcher
    }

    /// The database served.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Settings in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Registers the observer woken when work is queued.
    ///
    /// Replaces any previous observer. A token is waiting at once if the
    /// queue already holds work.
    pub fn register_observer(&self) -> Receiver<()> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let mut queue = self.queue.lock();
        queue.observer = Some(sender);
        queue.can_notify = true;
        if !queue.events.is_empty() || queue.log_changed {
            queue.wake_observer();
        }
        receiver
    }

    /// Queues `message`, fusing it into a queued transfer for the same peer.
    pub fn enqueue(&self, message: SyncMessage) {
        let mut queue = self.queue.lock();
        if queue.closed {
            return;
        }
        if !queue.events.iter_mut().any(|queued| queued.fuse(&message)) {
            queue.events.push_back(message);
        }
        queue.wake_observer();
        self.available.notify_all();
    }

    /// Queues `message` unless an equal item is already queued. Returns
    /// whether it was queued.
    fn enqueue_once(&self, message: SyncMessage) -> bool {
        let mut queue = self.queue.lock();
        if queue.closed || queue.events.contains(&message) {
            return false;
        }
        queue.events.push_back(message);
        queue.wake_observer();
        self.available.notify_all();
        true
    }

    /// Queues an authenticated message unless the same one is queued.
    pub(crate) fn enqueue_authenticated(&self, message: ooddb_core::QueuedMessage) -> bool {
        self.enqueue_once(SyncMessage::Authenticated(message))
    }

    /// Queues the delivery facts still owed to `peer`. Returns the number
    /// of items queued.
    pub(crate) fn flush_corrections_for(&self, peer: HookId) -> SyncResult<usize> {
        let mut queued = 0;
        for correction in self.db.pending_corrections(peer)? {
            if self.enqueue_once(SyncMessage::TransactionIdCorrection { peer, correction }) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Queues the delivery facts owed to every connected peer. Facts for
    /// the others wait in the database until they connect.
    pub fn flush_corrections(&self) -> SyncResult<usize> {
        let mut queued = 0;
        for peer in self.connected_peers() {
            queued += self.flush_corrections_for(peer)?;
        }
        if queued > 0 {
            trace!(queued, "corrections queued");
        }
        Ok(queued)
    }

    /// Takes the next item without blocking.
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] once closed.
    pub fn next_event(&self) -> SyncResult<Option<SyncMessage>> {
        self.scan_if_log_changed()?;
        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(SyncError::Cancelled);
        }
        Ok(queue.pop())
    }

    /// Blocks until an item is available.
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] when the dispatcher is closed, including
    /// while waiting.
    pub fn wait_next_event(&self) -> SyncResult<SyncMessage> {
        loop {
            if let Some(message) = self.wait_until(None)? {
                return Ok(message);
            }
        }
    }

    /// Blocks until an item is available or `timeout` elapses.
    pub fn wait_next_event_timeout(&self, timeout: Duration) -> SyncResult<Option<SyncMessage>> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> SyncResult<Option<SyncMessage>> {
        loop {
            self.scan_if_log_changed()?;
            let mut queue = self.queue.lock();
            loop {
                if queue.closed {
                    return Err(SyncError::Cancelled);
                }
                if let Some(message) = queue.pop() {
                    return Ok(Some(message));
                }
                if queue.log_changed {
                    break;
                }
                match deadline {
                    None => self.available.wait(&mut queue),
                    Some(deadline) => {
                        if self.available.wait_until(&mut queue, deadline).timed_out() {
                            if queue.closed {
                                return Err(SyncError::Cancelled);
                            }
                            return Ok(queue.pop());
                        }
                    }
                }
            }
        }
    }

    /// Closes the queue and wakes every waiter with [`SyncError::Cancelled`].
    pub fn close(&self) {
        let mut queue = self.queue.lock();
        queue.closed = true;
        queue.events.clear();
        queue.observer = None;
        self.available.notify_all();
        debug!("dispatcher closed");
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.queue.lock().events.len()
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the queued items, oldest first.
    pub fn queued(&self) -> Vec<SyncMessage> {
        self.queue.lock().events.iter().cloned().collect()
    }

    /// Runtime state of the link to `peer`.
    pub fn peer_link(&self, peer: HookId) -> Option<PeerLink> {
        self.peers.lock().get(peer).cloned()
    }

    /// Runtime state of every known link.
    pub fn links(&self) -> BTreeMap<HookId, PeerLink> {
        self.peers.lock().snapshot()
    }

    /// Peers with an open link.
    pub fn connected_peers(&self) -> BTreeSet<HookId> {
        self.peers.lock().connected()
    }

    /// Returns true if the link to `peer` is open.
    pub fn is_connected(&self, peer: HookId) -> bool {
        self.peers.lock().is_connected(peer)
    }

    pub(crate) fn connect(&self, peer: HookId) {
        self.peers.lock().connect(peer);
    }

    pub(crate) fn handshake_received(&self, peer: HookId) {
        self.peers.lock().handshake_received(peer);
    }

    /// Marks the link down and drops what was queued for it.
    pub(crate) fn disconnect(&self, peer: HookId) -> usize {
        self.peers.lock().disconnect(peer);
        self.purge(peer)
    }

    /// Drops every trace of `peer`.
    pub(crate) fn forget_peer(&self, peer: HookId) {
        self.peers.lock().forget(peer);
        let dropped = self.purge(peer);
        debug!(%peer, dropped, "peer forgotten");
    }

    fn purge(&self, peer: HookId) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.events.len();
        queue.events.retain(|m| m.peer() != peer);
        if queue.events.is_empty() {
            queue.can_notify = true;
        }
        before - queue.events.len()
    }

    /// Ends the transfer to `peer` without a confirmation, when there was
    /// nothing to send after all.
    pub(crate) fn transfer_finished(&self, peer: HookId) {
        self.peers.lock().end_transfer(peer);
    }

    fn log_changed(&self) {
        let mut queue = self.queue.lock();
        if queue.closed {
            return;
        }
        queue.log_changed = true;
        queue.wake_observer();
        self.available.notify_all();
    }

    fn scan_if_log_changed(&self) -> SyncResult<()> {
        let changed = std::mem::take(&mut self.queue.lock().log_changed);
        if changed {
            self.notify_new_transactions_if_necessary()?;
        }
        Ok(())
    }

    /// Queues a transfer for every ready peer that has something pending.
    ///
    /// A peer is ready when it is paired, its link is open, its handshake
    /// was received and no transfer to it is in flight. A transfer left
    /// unconfirmed longer than the stale timeout no longer counts as in
    /// flight. Returns the number of transfers queued.
    pub fn notify_new_transactions_if_necessary(&self) -> SyncResult<usize> {
        let links = self.links();
        let connected: BTreeSet<HookId> = links
            .iter()
            .filter(|(_, l)| l.connected)
            .map(|(id, _)| *id)
            .collect();
        if connected.is_empty() {
            return Ok(0);
        }
        let stale_after = self.config.transfer_stale_timeout;
        let watermark = self.db.last_transaction_id()?;
        let mut queued = 0;
        for hook in self.db.hooks()? {
            if !hook.is_active_distant() || hook.pairing_state != PairingState::Paired {
                continue;
            }
            let Some(link) = links.get(&hook.id).filter(|l| l.connected && l.handshake_received)
            else {
                continue;
            };
            if let Some(started) = link.transfer_started {
                if started.elapsed() < stale_after {
                    continue;
                }
            }
            if !self.db.has_pending_for(hook.id, &connected)? {
                continue;
            }
            let (started, cleared) =
                self.peers
                    .lock()
                    .begin_transfer(hook.id, Instant::now(), stale_after);
            if cleared {
                warn!(peer = %hook.id, "transfer unconfirmed for too long, starting over");
            }
            if started {
                self.enqueue(SyncMessage::EventsToSynchronize {
                    peer: hook.id,
                    watermark,
                    max_events: self.config.max_events_to_synchronize_at_the_same_time,
                });
                queued += 1;
            }
        }
        if queued > 0 {
            trace!(queued, %watermark, "transfers queued");
        }
        Ok(queued)
    }

    /// Records the confirmation of `peer` up to `up_to`.
    ///
    /// Ends the transfer in flight, sends the delivery knowledge gained to
    /// the other connected peers and queues the next batch if more is
    /// pending.
    ///
    /// # Errors
    ///
    /// `CursorRegression` if `up_to` is below the recorded position.
    pub fn validate_last_synchronization(
        &self,
        peer: HookId,
        up_to: TransactionId,
    ) -> SyncResult<ValidationOutcome> {
        let outcome = self.db.validate_last_synchronization(peer, up_to)?;
        self.peers.lock().end_transfer(peer);
        if !outcome.corrections.is_empty() {
            self.flush_corrections()?;
        }
        self.notify_new_transactions_if_necessary()?;
        Ok(outcome)
    }

    /// Merges a correction received from `from` and sends what was new to
    /// the other connected peers. Returns whether anything was new.
    pub fn merge_correction(
        &self,
        from: HookId,
        correction: &TransactionIdCorrection,
    ) -> SyncResult<bool> {
        match self.db.apply_correction(from, correction)? {
            Some(_) => {
                self.flush_corrections()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl fmt::Debug for SynchronizationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("SynchronizationDispatcher")
            .field("database", &self.db.name())
            .field("queued", &queue.events.len())
            .field("closed", &queue.closed)
            .finish_non_exhaustive()
    }
}

/// Forwards database notifications to the dispatcher.
struct DispatcherListener(Weak<SynchronizationDispatcher>);

impl DatabaseListener for DispatcherListener {
    fn transaction_logged(&self, _id: TransactionId) {
        if let Some(dispatcher) = self.0.upgrade() {
            dispatcher.log_changed();
        }
    }

    fn hook_removed(&self, hook: &Hook) {
        if let Some(dispatcher) = self.0.upgrade() {
            dispatcher.forget_peer(hook.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ooddb_core::{Config, DatabaseRegistry, FieldDef, FieldKind, Record, TableDef};
    use std::thread;

    struct Fixture {
        db: Arc<Database>,
        dispatcher: Arc<SynchronizationDispatcher>,
        peer: HookId,
    }

    fn fixture_with(config: SyncConfig) -> Fixture {
        let db = Database::open_in_memory("dispatch", Config::default(), &DatabaseRegistry::new())
            .unwrap();
        db.register_table(
            TableDef::new("item", "stock")
                .field(FieldDef::new("id", FieldKind::Integer).primary_key()),
        )
        .unwrap();
        db.init_local_hook(HookId::generate()).unwrap();
        let peer = HookId::generate();
        db.add_hook(peer, BTreeSet::new()).unwrap();
        db.set_pairing_state(peer, PairingState::Paired).unwrap();
        let db = Arc::new(db);
        let dispatcher = SynchronizationDispatcher::new(Arc::clone(&db), config);
        Fixture {
            db,
            dispatcher,
            peer,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SyncConfig::default())
    }

    fn ready(fx: &Fixture) {
        fx.dispatcher.connect(fx.peer);
        fx.dispatcher.handshake_received(fx.peer);
    }

    fn write(fx: &Fixture, id: i64) {
        fx.db
            .write(|tx| tx.insert("item", &Record::new().with("id", id)))
            .unwrap();
    }

    #[test]
    fn one_transfer_per_ready_peer() {
        let fx = fixture();
        write(&fx, 1);
        assert_eq!(fx.dispatcher.notify_new_transactions_if_necessary().unwrap(), 0);

        ready(&fx);
        assert_eq!(fx.dispatcher.notify_new_transactions_if_necessary().unwrap(), 1);
        assert_eq!(fx.dispatcher.notify_new_transactions_if_necessary().unwrap(), 0);
        assert!(fx.dispatcher.peer_link(fx.peer).unwrap().transfer_in_progress());
        assert_eq!(
            fx.dispatcher.queued(),
            vec![SyncMessage::EventsToSynchronize {
                peer: fx.peer,
                watermark: TransactionId::new(1),
                max_events: 1_000,
            }]
        );
    }

    #[test]
    fn commits_are_picked_up_by_the_next_read() {
        let fx = fixture();
        ready(&fx);
        write(&fx, 1);
        let next = fx.dispatcher.next_event().unwrap();
        assert!(matches!(next, Some(SyncMessage::EventsToSynchronize { peer, .. }) if peer == fx.peer));
        assert_eq!(fx.dispatcher.next_event().unwrap(), None);
    }

    #[test]
    fn queued_transfers_fuse() {
        let fx = fixture();
        for watermark in [3, 9, 4] {
            fx.dispatcher.enqueue(SyncMessage::EventsToSynchronize {
                peer: fx.peer,
                watermark: TransactionId::new(watermark),
                max_events: 10,
            });
        }
        fx.dispatcher.enqueue(SyncMessage::Handshake { peer: fx.peer });
        assert_eq!(fx.dispatcher.len(), 2);
        assert!(matches!(
            fx.dispatcher.queued()[0],
            SyncMessage::EventsToSynchronize { watermark, .. } if watermark == TransactionId::new(9)
        ));
    }

    #[test]
    fn observer_is_woken_once_until_drained() {
        let fx = fixture();
        let wake = fx.dispatcher.register_observer();
        fx.dispatcher.enqueue(SyncMessage::Handshake { peer: fx.peer });
        fx.dispatcher.enqueue(SyncMessage::Handshake { peer: HookId::generate() });
        assert!(wake.try_recv().is_ok());
        assert!(wake.try_recv().is_err());

        assert!(fx.dispatcher.next_event().unwrap().is_some());
        fx.dispatcher.enqueue(SyncMessage::Handshake { peer: fx.peer });
        assert!(wake.try_recv().is_err());

        while fx.dispatcher.next_event().unwrap().is_some() {}
        fx.dispatcher.enqueue(SyncMessage::Handshake { peer: fx.peer });
        assert!(wake.try_recv().is_ok());
    }

    #[test]
    fn close_cancels_waiters() {
        let fx = fixture();
        let dispatcher = Arc::clone(&fx.dispatcher);
        let waiter = thread::spawn(move || dispatcher.wait_next_event());
        thread::sleep(Duration::from_millis(20));
        fx.dispatcher.close();
        assert!(matches!(waiter.join().unwrap(), Err(SyncError::Cancelled)));
        assert!(matches!(fx.dispatcher.next_event(), Err(SyncError::Cancelled)));
    }

    #[test]
    fn waiting_times_out_on_an_empty_queue() {
        let fx = fixture();
        let next = fx
            .dispatcher
            .wait_next_event_timeout(Duration::from_millis(10))
            .unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn waiter_receives_work_from_another_thread() {
        let fx = fixture();
        let dispatcher = Arc::clone(&fx.dispatcher);
        let waiter = thread::spawn(move || dispatcher.wait_next_event());
        thread::sleep(Duration::from_millis(20));
        fx.dispatcher.enqueue(SyncMessage::Handshake { peer: fx.peer });
        assert_eq!(
            waiter.join().unwrap().unwrap(),
            SyncMessage::Handshake { peer: fx.peer }
        );
    }

    #[test]
    fn stale_transfer_is_started_again() {
        let fx = fixture_with(SyncConfig::default().with_transfer_stale_timeout(Duration::ZERO));
        ready(&fx);
        write(&fx, 1);
        assert_eq!(fx.dispatcher.notify_new_transactions_if_necessary().unwrap(), 1);
        assert!(fx.dispatcher.next_event().unwrap().is_some());
        assert_eq!(fx.dispatcher.notify_new_transactions_if_necessary().unwrap(), 1);
    }

    #[test]
    fn confirmation_ends_transfer_and_rejects_regression() {
        let fx = fixture();
        ready(&fx);
        write(&fx, 1);
        fx.dispatcher.notify_new_transactions_if_necessary().unwrap();
        fx.dispatcher.next_event().unwrap();

        let outcome = fx
            .dispatcher
            .validate_last_synchronization(fx.peer, TransactionId::new(1))
            .unwrap();
        assert!(outcome.advanced);
        assert!(!fx.dispatcher.peer_link(fx.peer).unwrap().transfer_in_progress());
        assert!(fx.dispatcher.is_empty());

        let regression = fx
            .dispatcher
            .validate_last_synchronization(fx.peer, TransactionId::ZERO);
        assert!(matches!(regression, Err(SyncError::Database(_))));
    }

    #[test]
    fn disconnect_drops_queued_work() {
        let fx = fixture();
        ready(&fx);
        write(&fx, 1);
        fx.dispatcher.notify_new_transactions_if_necessary().unwrap();
        fx.dispatcher.enqueue(SyncMessage::Handshake { peer: fx.peer });
        assert_eq!(fx.dispatcher.disconnect(fx.peer), 2);
        assert!(fx.dispatcher.is_empty());
        assert!(!fx.dispatcher.is_connected(fx.peer));
    }

    #[test]
    fn removed_hook_is_forgotten() {
        let fx = fixture();
        ready(&fx);
        fx.dispatcher.enqueue(SyncMessage::Handshake { peer: fx.peer });
        fx.db.remove_hook(fx.peer).unwrap();
        assert!(fx.dispatcher.is_empty());
        assert_eq!(fx.dispatcher.peer_link(fx.peer), None);
    }

    #[test]
    fn authenticated_messages_are_queued_once_across_threads() {
        let fx = fixture();
        let message = ooddb_core::QueuedMessage {
            message_id: 1,
            destination: fx.peer,
            body: ooddb_protocol::AuthenticatedBody::HookRemoveRequest { removed: fx.peer },
        };
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = Arc::clone(&fx.dispatcher);
                let message = message.clone();
                thread::spawn(move || dispatcher.enqueue_authenticated(message))
            })
            .collect();
        let queued = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|queued| *queued)
            .count();
        assert_eq!(queued, 1);
        assert_eq!(fx.dispatcher.len(), 1);
    }
}

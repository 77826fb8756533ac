//! Routes envelopes between the dispatcher, the database and a transport.

use crate::config::SyncConfig;
use crate::dispatcher::SynchronizationDispatcher;
use crate::error::{SyncError, SyncResult};
use crate::message::SyncMessage;
use crate::transport::SyncTransport;
use ooddb_core::{AddHooksOutcome, CoreError, Database, Hook};
use ooddb_protocol::{
    AuthenticatedMessage, ConfirmationOfReceipt, Envelope, HookId, MessageSigner, Payload,
    ProtocolError,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Replication endpoint of one database.
///
/// The owner of the network calls [`Synchronizer::peer_connected`] and
/// [`Synchronizer::peer_disconnected`] as links come and go, hands every
/// received envelope to [`Synchronizer::receive`], and drains the outbound
/// queue with [`Synchronizer::pump`] or [`Synchronizer::serve`].
pub struct Synchronizer {
    db: Arc<Database>,
    local: HookId,
    dispatcher: Arc<SynchronizationDispatcher>,
    signer: Arc<dyn MessageSigner>,
}

impl Synchronizer {
    /// Creates the endpoint of `db`.
    ///
    /// # Errors
    ///
    /// `LocalHookMissing` if the database has no local hook yet.
    pub fn new(
        db: Arc<Database>,
        config: SyncConfig,
        signer: Arc<dyn MessageSigner>,
    ) -> SyncResult<Self> {
        let local = db.local_hook_id()?.ok_or(CoreError::LocalHookMissing)?;
        let dispatcher = SynchronizationDispatcher::new(Arc::clone(&db), config);
        Ok(Self {
            db,
            local,
            dispatcher,
            signer,
        })
    }

    /// Hook of this host.
    pub fn local_hook(&self) -> HookId {
        self.local
    }

    /// The database served.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// The outbound queue.
    pub fn dispatcher(&self) -> &Arc<SynchronizationDispatcher> {
        &self.dispatcher
    }

    /// A link to `peer` came up.
    ///
    /// Queues our handshake, then every authenticated message and every
    /// delivery fact still waiting for the peer.
    ///
    /// # Errors
    ///
    /// `UnknownPeer` if `peer` is not an active hook.
    pub fn peer_connected(&self, peer: HookId) -> SyncResult<()> {
        self.require_peer(peer)?;
        self.dispatcher.connect(peer);
        self.dispatcher.enqueue(SyncMessage::Handshake { peer });
        let pending = self.db.pending_messages(peer)?;
        let redelivered = pending.len();
        for message in pending {
            self.dispatcher.enqueue_authenticated(message);
        }
        let corrections = self.dispatcher.flush_corrections_for(peer)?;
        info!(%peer, redelivered, corrections, "peer connected");
        Ok(())
    }

    /// The link to `peer` went down. What was queued for it is dropped;
    /// the next handshake resumes from the confirmed positions.
    pub fn peer_disconnected(&self, peer: HookId) {
        let dropped = self.dispatcher.disconnect(peer);
        info!(%peer, dropped, "peer disconnected");
    }

    /// Registers `peer` replicating `packages` (empty for every package)
    /// and announces the change to the connected peers.
    pub fn pair(&self, peer: HookId, packages: BTreeSet<String>) -> SyncResult<AddHooksOutcome> {
        self.add_hooks(&BTreeMap::from([(peer, packages)]), None)
    }

    /// Registers several peers at once. See [`Database::add_hooks`].
    pub fn add_hooks(
        &self,
        package_support: &BTreeMap<HookId, BTreeSet<String>>,
        replace_conflicts: Option<bool>,
    ) -> SyncResult<AddHooksOutcome> {
        let outcome = self.db.add_hooks(package_support, replace_conflicts)?;
        self.flush_authenticated()?;
        Ok(outcome)
    }

    /// Forgets `peer` at once, dropping its queued work and cursors.
    pub fn remove_hook(&self, peer: HookId) -> SyncResult<Hook> {
        Ok(self.db.remove_hook(peer)?)
    }

    /// Asks every active peer to forget `peer`; the hook is removed here
    /// once the first notice is delivered.
    pub fn remove_hook_with_notice(&self, peer: HookId) -> SyncResult<usize> {
        let queued = self.db.remove_hook_with_notice(peer)?;
        self.flush_authenticated()?;
        Ok(queued)
    }

    /// Queues the authenticated messages waiting for connected peers.
    fn flush_authenticated(&self) -> SyncResult<()> {
        for peer in self.dispatcher.connected_peers() {
            for message in self.db.pending_messages(peer)? {
                self.dispatcher.enqueue_authenticated(message);
            }
        }
        Ok(())
    }

    fn active_peer(&self, peer: HookId) -> SyncResult<Option<Hook>> {
        Ok(self.db.hook(peer)?.filter(Hook::is_active_distant))
    }

    fn require_peer(&self, peer: HookId) -> SyncResult<Hook> {
        self.active_peer(peer)?
            .ok_or_else(|| CoreError::UnknownPeer(peer).into())
    }

    /// Handles an envelope received from the network.
    ///
    /// # Errors
    ///
    /// Errors for which [`SyncError::is_peer_fatal`] holds mean the sender
    /// broke the protocol; the caller should drop the link.
    pub fn receive(&self, envelope: &Envelope) -> SyncResult<()> {
        if envelope.destination != self.local {
            return Err(SyncError::Misaddressed {
                expected: self.local,
                actual: envelope.destination,
            });
        }
        let peer = envelope.source;
        trace!(%peer, kind = ?envelope.kind(), "envelope received");
        if let Payload::Authenticated(message) = &envelope.payload {
            return self.receive_authenticated(peer, message);
        }
        self.require_peer(peer)?;
        match &envelope.payload {
            Payload::Handshake(handshake) => {
                self.db.handle_handshake(peer, handshake)?;
                self.dispatcher.handshake_received(peer);
                self.dispatcher.notify_new_transactions_if_necessary()?;
            }
            Payload::Transactions(batch) => {
                let outcome = self.db.apply_transactions(peer, batch)?;
                self.dispatcher.enqueue(SyncMessage::ConfirmationOfReceipt {
                    peer,
                    last_validated: outcome.last_validated,
                });
            }
            Payload::ConfirmationOfReceipt(confirmation) => {
                self.dispatcher
                    .validate_last_synchronization(peer, confirmation.last_validated)?;
            }
            Payload::TransactionIdCorrection(correction) => {
                self.dispatcher.merge_correction(peer, correction)?;
            }
            Payload::Authenticated(_) => {}
        }
        Ok(())
    }

    fn receive_authenticated(&self, peer: HookId, message: &AuthenticatedMessage) -> SyncResult<()> {
        message.verify(self.signer.as_ref())?;
        if message.destination != self.local {
            return Err(SyncError::Misaddressed {
                expected: self.local,
                actual: message.destination,
            });
        }
        if message.source != peer {
            return Err(ProtocolError::InvalidSignature {
                message_id: message.message_id,
                source_hook: message.source.to_string(),
            }
            .into());
        }
        if self.active_peer(peer)?.is_none() {
            // A notice that outlived its sender; it was applied already.
            debug!(%peer, id = message.message_id, "message from an inactive hook ignored");
            return Ok(());
        }
        self.db.apply_authenticated(peer, &message.body)?;
        // An announcement may complete pairing.
        self.dispatcher.notify_new_transactions_if_necessary()?;
        Ok(())
    }

    /// Turns a queued item into an envelope, reading the log if needed.
    /// Returns `None` when there is nothing to send after all.
    fn materialize(&self, message: &SyncMessage) -> SyncResult<Option<Envelope>> {
        let peer = message.peer();
        if self.active_peer(peer)?.is_none() {
            self.dispatcher.transfer_finished(peer);
            return Ok(None);
        }
        let payload = match message {
            SyncMessage::Handshake { .. } => Payload::Handshake(self.db.handshake_for(peer)?),
            SyncMessage::EventsToSynchronize { max_events, .. } => {
                let connected = self.dispatcher.connected_peers();
                match self.db.export_transactions(peer, *max_events, &connected)? {
                    Some(batch) => Payload::Transactions(batch),
                    None => {
                        self.dispatcher.transfer_finished(peer);
                        return Ok(None);
                    }
                }
            }
            SyncMessage::TransactionIdCorrection { correction, .. } => {
                Payload::TransactionIdCorrection(correction.clone())
            }
            SyncMessage::ConfirmationOfReceipt { last_validated, .. } => {
                Payload::ConfirmationOfReceipt(ConfirmationOfReceipt {
                    last_validated: *last_validated,
                })
            }
            SyncMessage::Authenticated(queued) => {
                Payload::Authenticated(AuthenticatedMessage::signed(
                    queued.message_id,
                    self.local,
                    queued.destination,
                    queued.body.clone(),
                    self.signer.as_ref(),
                )?)
            }
        };
        Ok(Some(Envelope::new(self.local, peer, payload)))
    }

    /// Sends one queued item. Returns false if it was dropped instead.
    ///
    /// Authenticated messages and delivery facts are acknowledged in the
    /// database once the transport accepted them; on failure they stay
    /// queued there and go out again on the next connection.
    pub fn send(&self, message: SyncMessage, transport: &dyn SyncTransport) -> SyncResult<bool> {
        let peer = message.peer();
        if !self.dispatcher.is_connected(peer) {
            trace!(%peer, "peer gone, item dropped");
            return Ok(false);
        }
        let Some(envelope) = self.materialize(&message)? else {
            return Ok(false);
        };
        transport.send(&envelope)?;
        match &message {
            SyncMessage::Authenticated(queued) => {
                self.db.message_sent(peer, queued.message_id)?;
            }
            SyncMessage::TransactionIdCorrection { correction, .. } => {
                self.db.correction_sent(peer, correction)?;
            }
            _ => {}
        }
        trace!(%peer, kind = ?envelope.kind(), "envelope sent");
        Ok(true)
    }

    /// Sends everything queued, without blocking. Returns the number of
    /// envelopes sent.
    pub fn pump(&self, transport: &dyn SyncTransport) -> SyncResult<usize> {
        let mut sent = 0;
        while let Some(message) = self.dispatcher.next_event()? {
            if self.send(message, transport)? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Sends queued items as they come until the dispatcher is closed.
    ///
    /// Retryable failures are logged and the loop goes on; the stale
    /// transfer timeout brings lost batches back.
    pub fn serve(&self, transport: &dyn SyncTransport) -> SyncResult<()> {
        loop {
            let message = match self.dispatcher.wait_next_event() {
                Ok(message) => message,
                Err(SyncError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };
            match self.send(message, transport) {
                Ok(_) => {}
                Err(e) if e.is_retryable() => warn!(error = %e, "send failed"),
                Err(e) => return Err(e),
            }
        }
    }

    /// Stops [`Synchronizer::serve`] and drops queued work.
    pub fn close(&self) {
        self.dispatcher.close();
    }
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("local", &self.local)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

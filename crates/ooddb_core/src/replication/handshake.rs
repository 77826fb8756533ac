//! Link opening.

use crate::database::Database;
use crate::error::CoreResult;
use crate::hooks::{Hook, PairingState};
use ooddb_protocol::{Handshake, HookId};
use tracing::{debug, info};

impl Database {
    /// Handshake to send to `peer` when a link opens.
    pub fn handshake_for(&self, peer: HookId) -> CoreResult<Handshake> {
        let shared = self.shared();
        self.with_read(|conn| {
            let hook = shared.hooks.require_active(conn, peer)?;
            Ok(Handshake {
                last_validated_distant: hook.last_validated_distant_transaction_id,
                packages: hook.packages,
            })
        })
    }

    /// Reconciles positions with the handshake received from `peer`.
    ///
    /// The peer's view of what it applied from this log wins, even when
    /// lower, so that a peer restored from an older state is resent what
    /// it lost. A peer still pairing becomes paired.
    ///
    /// # Errors
    ///
    /// `UnknownPeer` if `peer` is not an active peer.
    pub fn handle_handshake(&self, peer: HookId, handshake: &Handshake) -> CoreResult<Hook> {
        let shared = self.shared();
        self.with_write(|conn| {
            let hooks = &shared.hooks;
            let hook = hooks.require_active(conn, peer)?;
            let reported = handshake.last_validated_distant;
            if reported > hook.last_validated_local_transaction_id {
                hooks.advance_last_validated_local(conn, peer, reported)?;
            } else if reported < hook.last_validated_local_transaction_id {
                hooks.reset_last_validated_local(conn, peer, reported)?;
            }
            if hook.packages != handshake.packages {
                debug!(%peer, "peer reports a different package set");
            }
            if matches!(
                hook.pairing_state,
                PairingState::P2PPairingInProgress | PairingState::CentralPairingInProgress
            ) {
                hooks.set_pairing_state(conn, peer, PairingState::Paired)?;
                info!(%peer, "pairing complete");
            }
            hooks.require_active(conn, peer)
        })
    }
}

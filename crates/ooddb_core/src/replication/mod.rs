//! Replication entry points used by the synchronizer.
//!
//! Received transactions are applied one native transaction each, with
//! per-row origin stamps deciding between applying, skipping a duplicate
//! and calling the collision policy. Export walks the log from a peer's
//! confirmed position, and confirmations move cursors and prune the log.

mod apply;
mod confirm;
mod export;
mod handshake;

pub use apply::ApplyOutcome;
pub use confirm::ValidationOutcome;

use crate::database::Database;
use crate::error::CoreResult;
use crate::hooks::PairingState;
use crate::types::now_utc_millis;
use ooddb_protocol::{AuthenticatedBody, HookId};
use tracing::{debug, info};

impl Database {
    /// Applies a verified peer-management message sent by `from`.
    ///
    /// # Errors
    ///
    /// `UnknownPeer` if `from` is not an active peer.
    pub fn apply_authenticated(&self, from: HookId, body: &AuthenticatedBody) -> CoreResult<()> {
        let shared = self.shared();
        match body {
            AuthenticatedBody::HookSynchronizeRequest {
                packages,
                replace_conflicts,
            } => {
                let outcome = self.with_write(|conn| {
                    shared.hooks.require_active(conn, from)?;
                    let outcome = shared.hooks.add_hooks(
                        conn,
                        &shared.log,
                        &shared.catalog,
                        packages,
                        None,
                        true,
                        now_utc_millis(),
                    )?;
                    let mut sender = shared.hooks.require_active(conn, from)?;
                    if sender.replace_conflicts_on_resynchronization != *replace_conflicts {
                        sender.replace_conflicts_on_resynchronization = *replace_conflicts;
                        shared.hooks.put(conn, &sender)?;
                    }
                    if sender.pairing_state == PairingState::P2PPairingInProgress {
                        shared
                            .hooks
                            .set_pairing_state(conn, from, PairingState::Paired)?;
                    }
                    Ok(outcome)
                })?;
                debug!(
                    %from,
                    registered = outcome.registered.len(),
                    seeds = outcome.seeds.len(),
                    "package support received"
                );
                for (_, _, seed) in &outcome.seeds {
                    shared.notify_logged(*seed);
                }
                Ok(())
            }
            AuthenticatedBody::HookRemoveRequest { removed } => {
                let removed = self.with_write(|conn| {
                    shared.hooks.require_active(conn, from)?;
                    let local = shared.hooks.require_local(conn)?;
                    let target = if *removed == local.id { from } else { *removed };
                    match shared.hooks.get(conn, target)? {
                        Some(hook) if hook.is_active_distant() => shared
                            .hooks
                            .remove_hook(conn, &shared.log, &shared.catalog, target)
                            .map(Some),
                        _ => Ok(None),
                    }
                })?;
                if let Some(hook) = removed {
                    info!(%from, hook = %hook.id, "hook removed on request");
                    shared.notify_hook_removed(&hook);
                }
                Ok(())
            }
        }
    }
}

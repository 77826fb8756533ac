//! Hooks command implementation.

use super::{print_json, Format};
use ooddb_core::Database;
use serde::Serialize;

/// One row of the hook listing.
#[derive(Debug, Serialize)]
pub struct HookRow {
    /// Hook id.
    pub id: String,
    /// Whether this is the local host.
    pub local: bool,
    /// Pairing progress.
    pub pairing_state: String,
    /// Highest local id the peer confirmed.
    pub last_validated_local: u64,
    /// Highest id of the peer's log accepted here.
    pub last_validated_distant: u64,
    /// Replicated packages; empty means every package.
    pub packages: Vec<String>,
    /// Authenticated messages waiting for the peer.
    pub pending_messages: usize,
}

/// Collects the hook listing.
pub fn collect(db: &Database) -> Result<Vec<HookRow>, Box<dyn std::error::Error>> {
    let mut rows = Vec::new();
    for hook in db.hooks()? {
        let pending_messages = if hook.is_active_distant() {
            db.pending_messages(hook.id)?.len()
        } else {
            0
        };
        rows.push(HookRow {
            id: hook.id.to_string(),
            local: hook.concerns_local_host,
            pairing_state: hook.pairing_state.to_string(),
            last_validated_local: hook.last_validated_local_transaction_id.as_u64(),
            last_validated_distant: hook.last_validated_distant_transaction_id.as_u64(),
            packages: hook.packages.into_iter().collect(),
            pending_messages,
        });
    }
    Ok(rows)
}

/// Runs the hooks command.
pub fn run(db: &Database, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let rows = collect(db)?;
    match format {
        Format::Json => print_json(&rows)?,
        Format::Text => {
            if rows.is_empty() {
                println!("No hooks (local hook not initialized)");
            }
            for row in &rows {
                if row.local {
                    println!("{}  local", row.id);
                    continue;
                }
                let packages = if row.packages.is_empty() {
                    "*".to_string()
                } else {
                    row.packages.join(",")
                };
                println!(
                    "{}  {:<15} local<={:<8} distant<={:<8} packages={} pending={}",
                    row.id,
                    row.pairing_state,
                    row.last_validated_local,
                    row.last_validated_distant,
                    packages,
                    row.pending_messages
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ooddb_core::{Config, DatabaseRegistry, HookId};
    use std::collections::BTreeSet;

    #[test]
    fn lists_local_hook_and_peers() {
        let db =
            Database::open_in_memory("cli", Config::default(), &DatabaseRegistry::new()).unwrap();
        let local = HookId::generate();
        let peer = HookId::generate();
        db.init_local_hook(local).unwrap();
        db.add_hook(peer, BTreeSet::from(["notes".to_string()])).unwrap();

        let rows = collect(&db).unwrap();
        assert_eq!(rows.len(), 2);
        let local_row = rows.iter().find(|r| r.local).unwrap();
        assert_eq!(local_row.id, local.to_string());
        let peer_row = rows.iter().find(|r| !r.local).unwrap();
        assert_eq!(peer_row.pairing_state, "p2p-pairing");
        assert_eq!(peer_row.packages, vec!["notes".to_string()]);
        // The package announcement waits for the peer.
        assert_eq!(peer_row.pending_messages, 1);
    }
}

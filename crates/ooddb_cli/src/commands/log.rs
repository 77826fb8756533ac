//! Log command implementation.

use super::{format_utc, print_json, Format};
use ooddb_core::{Database, LoggedTransaction};
use ooddb_protocol::TableEvent;
use serde::Serialize;

/// A logged transaction, with its events when requested.
#[derive(Debug, Serialize)]
pub struct LogEntry {
    /// Header.
    #[serde(flatten)]
    pub header: LoggedTransaction,
    /// Events, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<TableEvent>>,
}

/// Log dump result.
#[derive(Debug, Serialize)]
pub struct LogDump {
    /// Last id ever assigned.
    pub last_transaction_id: u64,
    /// Transactions still awaiting confirmation.
    pub entries: Vec<LogEntry>,
}

/// Collects up to `limit` log entries, oldest first.
pub fn collect(
    db: &Database,
    limit: Option<usize>,
    with_events: bool,
) -> Result<LogDump, Box<dyn std::error::Error>> {
    let headers = db.logged_transactions()?;
    let mut entries = Vec::new();
    for header in headers.into_iter().take(limit.unwrap_or(usize::MAX)) {
        let events = if with_events {
            Some(db.logged_events(header.id)?)
        } else {
            None
        };
        entries.push(LogEntry { header, events });
    }
    Ok(LogDump {
        last_transaction_id: db.last_transaction_id()?.as_u64(),
        entries,
    })
}

/// Runs the log command.
pub fn run(
    db: &Database,
    limit: Option<usize>,
    with_events: bool,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let dump = collect(db, limit, with_events)?;
    match format {
        Format::Json => print_json(&dump)?,
        Format::Text => {
            println!("Last transaction id: {}", dump.last_transaction_id);
            println!("Logged: {}", dump.entries.len());
            for entry in &dump.entries {
                let h = &entry.header;
                let concerned = match &h.concerned {
                    None => "all".to_string(),
                    Some(set) => set.len().to_string(),
                };
                println!(
                    "#{:<6} {}  origin={} #{} events={} concerned={}{}",
                    h.id.as_u64(),
                    format_utc(h.timestamp_utc),
                    h.origin,
                    h.origin_id.as_u64(),
                    h.event_count,
                    concerned,
                    if h.resynchronization { " resync" } else { "" }
                );
                for event in entry.events.iter().flatten() {
                    println!("        {:?}", event);
                }
            }
        }
    }
    Ok(())
}

//! Backup and restore commands.
//!
//! These work through the database API, so a restore goes through a normal
//! transaction: integrity is checked and the change is logged for peers
//! like any other commit.

use super::{format_utc, print_json, Format};
use ooddb_core::{now_utc_millis, BackupRestoreManager, Database, RestoreSummary};
use serde::Serialize;
use tracing::info;

/// A backup file.
#[derive(Debug, Serialize)]
pub struct FileRow {
    /// Full path.
    pub path: String,
    /// Reference or increment.
    pub kind: String,
    /// Creation instant.
    pub timestamp_utc: u64,
}

/// Backup listing.
#[derive(Debug, Serialize)]
pub struct BackupListing {
    /// Files, oldest first.
    pub files: Vec<FileRow>,
    /// Every restorable instant, oldest first.
    pub restore_points: Vec<u64>,
    /// Oldest instant a restore can reach.
    pub first_valid_reference_utc: Option<u64>,
    /// Instant of the last recorded commit.
    pub last_transaction_utc: Option<u64>,
}

fn manager(db: &Database) -> Result<&BackupRestoreManager, Box<dyn std::error::Error>> {
    db.backups()
        .ok_or_else(|| "Backup directory required (--backups)".into())
}

/// Collects the backup listing.
pub fn collect(db: &Database) -> Result<BackupListing, Box<dyn std::error::Error>> {
    let backups = manager(db)?;
    Ok(BackupListing {
        files: backups
            .files()
            .into_iter()
            .map(|f| FileRow {
                path: f.path.display().to_string(),
                kind: f.kind.to_string(),
                timestamp_utc: f.timestamp_utc,
            })
            .collect(),
        restore_points: backups.restore_points()?.into_iter().map(|p| p.utc).collect(),
        first_valid_reference_utc: backups.first_valid_reference_utc(),
        last_transaction_utc: backups.last_transaction_utc(),
    })
}

/// Lists backup files and restore points.
pub fn list(db: &Database, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let listing = collect(db)?;
    match format {
        Format::Json => print_json(&listing)?,
        Format::Text => {
            println!("Files: {}", listing.files.len());
            for file in &listing.files {
                println!(
                    "  {:<9} {}  {}",
                    file.kind,
                    format_utc(file.timestamp_utc),
                    file.path
                );
            }
            match listing.first_valid_reference_utc {
                Some(utc) => println!("Restorable from: {} ({utc})", format_utc(utc)),
                None => println!("Restorable from: nothing yet"),
            }
            if let Some(utc) = listing.last_transaction_utc {
                println!("Last commit:     {} ({utc})", format_utc(utc));
            }
            println!("Restore points:  {}", listing.restore_points.len());
        }
    }
    Ok(())
}

/// Writes a reference of the current state.
pub fn reference(db: &Database, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let file = db.create_backup_reference()?;
    info!(path = ?file.path, "backup reference written");
    match format {
        Format::Json => print_json(&FileRow {
            path: file.path.display().to_string(),
            kind: file.kind.to_string(),
            timestamp_utc: file.timestamp_utc,
        })?,
        Format::Text => {
            println!("✓ Reference written");
            println!("  Path: {:?}", file.path);
            println!("  Timestamp: {}", format_utc(file.timestamp_utc));
        }
    }
    Ok(())
}

/// Brings every declared table back to its state at `utc`.
pub fn restore(db: &Database, utc: u64, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let summary: RestoreSummary = db.restore_to_utc(utc)?;
    match format {
        Format::Json => print_json(&serde_json::json!({
            "utc": utc,
            "written": summary.written,
            "deleted": summary.deleted,
        }))?,
        Format::Text => {
            println!("✓ Restored to {}", format_utc(utc));
            println!("  Rows written: {}", summary.written);
            println!("  Rows deleted: {}", summary.deleted);
        }
    }
    Ok(())
}

/// Deletes backups older than the configured age.
pub fn clean(db: &Database, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let removed = manager(db)?.clean_old_backups(now_utc_millis())?;
    match format {
        Format::Json => print_json(&serde_json::json!({ "removed": removed }))?,
        Format::Text => println!("✓ {removed} backup file(s) removed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::open;
    use ooddb_core::{
        BackupConfig, Config, DatabaseRegistry, FieldDef, FieldKind, Record, TableDef, Value,
    };
    use std::fs;

    fn notes() -> TableDef {
        TableDef::new("note", "notes")
            .field(FieldDef::new("id", FieldKind::Integer).primary_key())
            .field(FieldDef::new("body", FieldKind::Text))
    }

    fn note(id: i64, body: &str) -> Record {
        Record::new().with("id", id).with("body", body)
    }

    #[test]
    fn listing_requires_backups() {
        let db =
            Database::open_in_memory("cli", Config::default(), &DatabaseRegistry::new()).unwrap();
        assert!(collect(&db).is_err());
    }

    #[test]
    fn restore_through_a_reopened_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let backups = dir.path().join("backups");
        let schema = dir.path().join("schema.json");
        fs::write(&schema, serde_json::to_vec(&vec![notes()]).unwrap()).unwrap();

        let first = {
            let config = Config::default().backup(BackupConfig::new(&backups));
            let db = Database::open(&path, config, &DatabaseRegistry::new()).unwrap();
            db.register_table(notes()).unwrap();
            db.write(|tx| tx.insert("note", &note(1, "kept"))).unwrap();
            let first = db.backups().unwrap().last_transaction_utc().unwrap();
            db.write(|tx| tx.insert("note", &note(2, "undone"))).unwrap();
            db.close();
            first
        };

        let db = open(&path, Some(&backups), Some(&schema)).unwrap();
        let listing = collect(&db).unwrap();
        assert_eq!(listing.first_valid_reference_utc, Some(first));
        assert!(listing.restore_points.contains(&first));

        let summary = db.restore_to_utc(first).unwrap();
        assert_eq!(summary.deleted, 1);
        let ids: Vec<Value> = db
            .read(|tx| tx.scan("note"))
            .unwrap()
            .into_iter()
            .map(|r| r.value("id"))
            .collect();
        assert_eq!(ids, vec![Value::Integer(1)]);
    }
}

//! CLI command implementations.

pub mod backups;
pub mod hooks;
pub mod log;

use clap::ValueEnum;
use ooddb_core::{BackupConfig, Config, Database, DatabaseRegistry, TableDef};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens an existing database, with backups if `backups` is given and
/// the tables declared in `schema`.
pub fn open(
    path: &Path,
    backups: Option<&Path>,
    schema: Option<&Path>,
) -> Result<Database, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    let mut config = Config::new().create_if_missing(false);
    if let Some(dir) = backups {
        config = config.backup(BackupConfig::new(dir));
    }
    let db = Database::open(path, config, &DatabaseRegistry::new())?;
    if let Some(schema) = schema {
        let tables: Vec<TableDef> = serde_json::from_slice(&fs::read(schema)?)?;
        for table in tables {
            db.register_table(table)?;
        }
    }
    Ok(db)
}

/// Prints `value` as JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Formats milliseconds since the Unix epoch as `YYYY-MM-DD HH:MM:SS.mmm UTC`.
pub fn format_utc(millis: u64) -> String {
    let secs = millis / 1000;
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}.{:03} UTC",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
        millis % 1000
    )
}

// Howard Hinnant's days-to-civil algorithm.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_instants() {
        assert_eq!(format_utc(0), "1970-01-01 00:00:00.000 UTC");
        assert_eq!(format_utc(951_782_400_123), "2000-02-29 00:00:00.123 UTC");
        assert_eq!(format_utc(1_700_000_000_000), "2023-11-14 22:13:20.000 UTC");
    }

    #[test]
    fn missing_database_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open(&dir.path().join("absent"), None, None).is_err());
    }
}

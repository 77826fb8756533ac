//! Database configuration.

use crate::types::IsolationLevel;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether the on-disk journal is synced on every commit.
    pub sync_on_commit: bool,

    /// Number of events a transaction buffers in memory before spilling
    /// the rest to a temporary file.
    pub max_events_in_memory: usize,

    /// Directory for spill files. Defaults to the database's `tmp/`
    /// directory, or the system temp directory for in-memory databases.
    pub spill_directory: Option<PathBuf>,

    /// Isolation requested when the caller does not specify one.
    pub default_isolation: IsolationLevel,

    /// Backup settings; `None` disables backups.
    pub backup: Option<BackupConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            max_events_in_memory: 5_000,
            spill_directory: None,
            default_isolation: IsolationLevel::ReadCommitted,
            backup: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the in-memory event threshold.
    #[must_use]
    pub const fn max_events_in_memory(mut self, count: usize) -> Self {
        self.max_events_in_memory = count;
        self
    }

    /// Sets the spill directory.
    #[must_use]
    pub fn spill_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_directory = Some(dir.into());
        self
    }

    /// Sets the default isolation level.
    #[must_use]
    pub const fn default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }

    /// Enables backups.
    #[must_use]
    pub fn backup(mut self, backup: BackupConfig) -> Self {
        self.backup = Some(backup);
        self
    }
}

/// Backup settings.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Directory holding reference and increment files.
    pub directory: PathBuf,

    /// Size after which the current increment file is closed.
    pub max_backup_file_size: u64,

    /// Age after which the current increment file is closed.
    pub max_backup_file_age: Duration,

    /// Increment files after which a new reference is built.
    pub max_increments_per_reference: usize,

    /// Oldest restore point worth keeping; `None` keeps everything.
    pub max_backup_age: Option<Duration>,
}

impl BackupConfig {
    /// Creates backup settings writing into `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_backup_file_size: 16 * 1024 * 1024,               // 16 MB
            max_backup_file_age: Duration::from_secs(60 * 60),    // 1 hour
            max_increments_per_reference: 100,
            max_backup_age: Some(Duration::from_secs(30 * 86_400)), // 30 days
        }
    }

    /// Sets the increment size limit.
    #[must_use]
    pub const fn max_backup_file_size(mut self, size: u64) -> Self {
        self.max_backup_file_size = size;
        self
    }

    /// Sets the increment age limit.
    #[must_use]
    pub const fn max_backup_file_age(mut self, age: Duration) -> Self {
        self.max_backup_file_age = age;
        self
    }

    /// Sets the number of increments per reference.
    #[must_use]
    pub const fn max_increments_per_reference(mut self, count: usize) -> Self {
        self.max_increments_per_reference = count;
        self
    }

    /// Sets the retention window.
    #[must_use]
    pub const fn max_backup_age(mut self, age: Option<Duration>) -> Self {
        self.max_backup_age = age;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert!(config.backup.is_none());
        assert_eq!(config.default_isolation, IsolationLevel::ReadCommitted);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .sync_on_commit(false)
            .max_events_in_memory(16)
            .backup(BackupConfig::new("/tmp/b").max_increments_per_reference(3));

        assert!(!config.sync_on_commit);
        assert_eq!(config.max_events_in_memory, 16);
        assert_eq!(
            config.backup.map(|b| b.max_increments_per_reference),
            Some(3)
        );
    }
}

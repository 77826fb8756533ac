//! Database directory management.
//!
//! ```text
//! <db_path>/
//! ├─ LOCK              # Advisory lock, one process per directory
//! ├─ journal.log       # Commit journal of the memory engine
//! ├─ backups/          # backup-ood-<ms>.dreference / .dincrement
//! └─ tmp/              # Spill files of large transactions
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.log";
const BACKUP_DIR: &str = "backups";
const TMP_DIR: &str = "tmp";

/// A locked database directory.
///
/// The lock is held for the lifetime of the value.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens (or creates) and locks a database directory.
    ///
    /// # Errors
    ///
    /// `DatabaseLocked` if another process holds the lock, `InvalidOperation`
    /// if the directory is missing and `create_if_missing` is false.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_operation(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked {
                path: path.display().to_string(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root of the directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Journal file.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_FILE)
    }

    /// Default backup directory.
    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.path.join(BACKUP_DIR)
    }

    /// Spill directory, created on demand.
    pub fn tmp_dir(&self) -> CoreResult<PathBuf> {
        let dir = self.path.join(TMP_DIR);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let first = DatabaseDir::open(&path, true).unwrap();
        assert!(matches!(
            DatabaseDir::open(&path, true),
            Err(CoreError::DatabaseLocked { .. })
        ));
        drop(first);
        DatabaseDir::open(&path, true).unwrap();
    }

    #[test]
    fn missing_directory_without_create() {
        let dir = tempdir().unwrap();
        let result = DatabaseDir::open(&dir.path().join("absent"), false);
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn layout_paths() {
        let dir = tempdir().unwrap();
        let db = DatabaseDir::open(dir.path(), true).unwrap();
        assert!(db.journal_path().ends_with("journal.log"));
        assert!(db.backup_dir().ends_with("backups"));
        assert!(db.tmp_dir().unwrap().is_dir());
    }
}

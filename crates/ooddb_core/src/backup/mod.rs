//! Point-in-time backups.
//!
//! A reference holds every user row; the increments after it hold each
//! committed transaction with its commit instant. Restoring to an instant
//! loads the newest reference at or before it and replays increments up
//! to it. The current increment is closed when it grows too large or too
//! old, and a [`BackupPolicy`] decides when a fresh reference is due.

mod file;

pub use file::{BackupFile, BackupKind, Snapshot};

use crate::config::BackupConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::now_utc_millis;
use file::{BackupTransaction, IncrementWriter};
use ooddb_protocol::TableEvent;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State a [`BackupPolicy`] decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupStatus {
    /// Increment files written since the last reference.
    pub increments_since_reference: usize,
    /// Instant of the last reference, if any.
    pub last_reference_utc: Option<u64>,
    /// Current instant.
    pub now_utc: u64,
}

/// Decides when a new reference must be built.
pub trait BackupPolicy: Send + Sync {
    /// Returns true when the next commit should produce a reference
    /// instead of extending the current increment.
    fn must_create_new_backup_reference(&self, status: &BackupStatus) -> bool;
}

/// Builds a reference every `max_increments` increment files.
#[derive(Debug, Clone, Copy)]
pub struct IncrementLimit {
    /// Increment files per reference.
    pub max_increments: usize,
}

impl BackupPolicy for IncrementLimit {
    fn must_create_new_backup_reference(&self, status: &BackupStatus) -> bool {
        status.increments_since_reference >= self.max_increments
    }
}

/// A restorable instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestorePoint {
    /// Milliseconds since the Unix epoch.
    pub utc: u64,
    /// Whether the instant is a reference or a transaction in an increment.
    pub kind: BackupKind,
}

struct State {
    files: Vec<BackupFile>,
    current: Option<IncrementWriter>,
    reference_owed: bool,
    last_timestamp: u64,
    last_transaction_utc: Option<u64>,
}

impl State {
    fn last_reference(&self) -> Option<&BackupFile> {
        self.files
            .iter()
            .rev()
            .find(|f| f.kind == BackupKind::Reference)
    }

    fn increments_since_reference(&self) -> usize {
        self.files
            .iter()
            .rev()
            .take_while(|f| f.kind == BackupKind::Increment)
            .count()
    }
}

/// Owns the backup directory of one database.
pub struct BackupRestoreManager {
    config: BackupConfig,
    policy: RwLock<Arc<dyn BackupPolicy>>,
    state: Mutex<State>,
}

impl BackupRestoreManager {
    /// Opens the backup directory, creating it if needed.
    ///
    /// A directory without any reference owes one on the next commit.
    pub fn open(config: BackupConfig) -> CoreResult<Self> {
        std::fs::create_dir_all(&config.directory)?;
        let files = file::list(&config.directory)?;
        let last_timestamp = files.last().map_or(0, |f| f.timestamp_utc);
        let last_transaction_utc = match files.last() {
            Some(last) if last.kind == BackupKind::Increment => file::read_increment(last)?
                .last()
                .map(|t| t.timestamp_utc)
                .or(Some(last.timestamp_utc)),
            Some(last) => Some(last.timestamp_utc),
            None => None,
        };
        let reference_owed = !files.iter().any(|f| f.kind == BackupKind::Reference);
        debug!(
            directory = %config.directory.display(),
            files = files.len(),
            reference_owed,
            "backup directory opened"
        );
        let policy = Arc::new(IncrementLimit {
            max_increments: config.max_increments_per_reference,
        });
        Ok(Self {
            config,
            policy: RwLock::new(policy),
            state: Mutex::new(State {
                files,
                current: None,
                reference_owed,
                last_timestamp,
                last_transaction_utc,
            }),
        })
    }

    /// Settings in use.
    #[must_use]
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Replaces the reference policy.
    pub fn set_policy(&self, policy: Arc<dyn BackupPolicy>) {
        *self.policy.write() = policy;
    }

    /// Next commit instant: now, bumped past every instant handed out so far.
    pub(crate) fn next_timestamp(&self) -> u64 {
        let mut state = self.state.lock();
        state.last_timestamp = now_utc_millis().max(state.last_timestamp + 1);
        state.last_timestamp
    }

    /// Makes the next commit build a reference.
    pub fn activate_backup_reference_creation(&self) {
        self.state.lock().reference_owed = true;
    }

    /// Returns true when the next commit will build a reference.
    #[must_use]
    pub fn is_reference_owed(&self) -> bool {
        self.state.lock().reference_owed
    }

    /// Backup files, oldest first.
    #[must_use]
    pub fn files(&self) -> Vec<BackupFile> {
        self.state.lock().files.clone()
    }

    /// Records one committed transaction.
    ///
    /// Builds a reference from `snapshot` instead when one is owed or the
    /// policy asks for it. On failure the next commit owes a reference.
    pub(crate) fn record_commit(
        &self,
        timestamp_utc: u64,
        events: &[TableEvent],
        snapshot: impl FnOnce() -> CoreResult<Snapshot>,
    ) -> CoreResult<()> {
        let mut state = self.state.lock();
        let status = BackupStatus {
            increments_since_reference: state.increments_since_reference(),
            last_reference_utc: state.last_reference().map(|f| f.timestamp_utc),
            now_utc: timestamp_utc,
        };
        let result = if state.reference_owed
            || self.policy.read().must_create_new_backup_reference(&status)
        {
            snapshot().and_then(|snapshot| self.write_reference(&mut state, timestamp_utc, &snapshot))
        } else {
            self.append_increment(&mut state, timestamp_utc, events)
        };
        match result {
            Ok(()) => {
                state.last_transaction_utc = Some(timestamp_utc);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "backup write failed, a new reference is owed");
                state.reference_owed = true;
                state.current = None;
                Err(e)
            }
        }
    }

    /// Writes a reference from `snapshot` now.
    pub(crate) fn create_reference(&self, snapshot: &Snapshot) -> CoreResult<BackupFile> {
        let timestamp = self.next_timestamp();
        let mut state = self.state.lock();
        self.write_reference(&mut state, timestamp, snapshot)?;
        state
            .last_reference()
            .cloned()
            .ok_or_else(|| CoreError::backup("reference vanished after creation"))
    }

    fn write_reference(
        &self,
        state: &mut State,
        timestamp_utc: u64,
        snapshot: &Snapshot,
    ) -> CoreResult<()> {
        let file = file::write_reference(&self.config.directory, timestamp_utc, snapshot)?;
        info!(path = %file.path.display(), tables = snapshot.len(), "backup reference written");
        state.files.push(file);
        state.current = None;
        state.reference_owed = false;
        if let Err(e) = Self::clean(&self.config, state, timestamp_utc) {
            warn!(error = %e, "failed to remove old backups");
        }
        Ok(())
    }

    fn append_increment(
        &self,
        state: &mut State,
        timestamp_utc: u64,
        events: &[TableEvent],
    ) -> CoreResult<()> {
        let rotate = match &state.current {
            None => true,
            Some(current) => {
                let age = timestamp_utc.saturating_sub(current.file().timestamp_utc);
                current.size()? >= self.config.max_backup_file_size
                    || u128::from(age) >= self.config.max_backup_file_age.as_millis()
            }
        };
        if rotate {
            let writer = IncrementWriter::create(&self.config.directory, timestamp_utc)?;
            debug!(path = %writer.file().path.display(), "backup increment opened");
            state.files.push(writer.file().clone());
            state.current = Some(writer);
        }
        let transaction = BackupTransaction {
            timestamp_utc,
            events: events.to_vec(),
        };
        match state.current.as_mut() {
            Some(writer) => writer.append(&transaction),
            None => Err(CoreError::backup("no increment file open")),
        }
    }

    /// State of the user tables at `utc`.
    pub fn state_at(&self, utc: u64) -> CoreResult<Snapshot> {
        let files = self.files();
        let reference = files
            .iter()
            .rev()
            .find(|f| f.kind == BackupKind::Reference && f.timestamp_utc <= utc)
            .ok_or(CoreError::NoRestorePoint { utc })?;
        let mut snapshot = file::read_reference(reference)?;
        let increments = files.iter().filter(|f| {
            f.kind == BackupKind::Increment
                && f.timestamp_utc > reference.timestamp_utc
                && f.timestamp_utc <= utc
        });
        'replay: for increment in increments {
            for transaction in file::read_increment(increment)? {
                if transaction.timestamp_utc > utc {
                    break 'replay;
                }
                for event in transaction.events {
                    let rows = snapshot.entry(event.table).or_default();
                    match event.row {
                        Some(row) => {
                            rows.insert(event.primary_key, row);
                        }
                        None => {
                            rows.remove(&event.primary_key);
                        }
                    }
                }
            }
        }
        Ok(snapshot)
    }

    /// Every restorable instant, oldest first.
    pub fn restore_points(&self) -> CoreResult<Vec<RestorePoint>> {
        let files = self.files();
        let Some(first) = files.iter().position(|f| f.kind == BackupKind::Reference) else {
            return Ok(Vec::new());
        };
        let mut points = Vec::new();
        for f in &files[first..] {
            match f.kind {
                BackupKind::Reference => points.push(RestorePoint {
                    utc: f.timestamp_utc,
                    kind: BackupKind::Reference,
                }),
                BackupKind::Increment => {
                    points.extend(file::read_increment(f)?.into_iter().map(|t| RestorePoint {
                        utc: t.timestamp_utc,
                        kind: BackupKind::Increment,
                    }));
                }
            }
        }
        Ok(points)
    }

    /// Oldest instant a restore can reach.
    #[must_use]
    pub fn first_valid_reference_utc(&self) -> Option<u64> {
        self.state
            .lock()
            .files
            .iter()
            .find(|f| f.kind == BackupKind::Reference)
            .map(|f| f.timestamp_utc)
    }

    /// Instant of the last recorded commit.
    #[must_use]
    pub fn last_transaction_utc(&self) -> Option<u64> {
        self.state.lock().last_transaction_utc
    }

    /// Deletes files older than the newest reference at or before
    /// `now_utc - max_backup_age`. Returns how many were removed.
    pub fn clean_old_backups(&self, now_utc: u64) -> CoreResult<usize> {
        let mut state = self.state.lock();
        Self::clean(&self.config, &mut state, now_utc)
    }

    fn clean(config: &BackupConfig, state: &mut State, now_utc: u64) -> CoreResult<usize> {
        let Some(max_age) = config.max_backup_age else {
            return Ok(0);
        };
        let max_age = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_utc.saturating_sub(max_age);
        let Some(keep_from) = state
            .files
            .iter()
            .rev()
            .find(|f| f.kind == BackupKind::Reference && f.timestamp_utc <= cutoff)
            .map(|f| f.timestamp_utc)
        else {
            return Ok(0);
        };
        let (old, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.files)
            .into_iter()
            .partition(|f| f.timestamp_utc < keep_from);
        state.files = kept;
        for f in &old {
            std::fs::remove_file(&f.path)?;
        }
        if !old.is_empty() {
            info!(removed = old.len(), "old backups removed");
        }
        Ok(old.len())
    }
}

impl fmt::Debug for BackupRestoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupRestoreManager")
            .field("directory", &self.config.directory)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn snapshot_of(rows: &[(u8, u8)]) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for &(k, v) in rows {
            snapshot.entry("t".into()).or_default().insert(vec![k], vec![v]);
        }
        snapshot
    }

    #[test]
    fn first_commit_builds_the_owed_reference() {
        let dir = tempdir().unwrap();
        let manager = BackupRestoreManager::open(BackupConfig::new(dir.path())).unwrap();
        assert!(manager.is_reference_owed());

        manager
            .record_commit(100, &[TableEvent::insert("t", vec![1], vec![1])], || {
                Ok(snapshot_of(&[(1, 1)]))
            })
            .unwrap();
        assert!(!manager.is_reference_owed());
        assert_eq!(manager.first_valid_reference_utc(), Some(100));

        manager
            .record_commit(200, &[TableEvent::update("t", vec![1], vec![2])], || {
                unreachable!("no reference due")
            })
            .unwrap();
        let kinds: Vec<_> = manager.files().iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![BackupKind::Reference, BackupKind::Increment]);
        assert_eq!(manager.last_transaction_utc(), Some(200));
    }

    #[test]
    fn state_at_replays_up_to_the_instant() {
        let dir = tempdir().unwrap();
        let manager = BackupRestoreManager::open(BackupConfig::new(dir.path())).unwrap();
        manager
            .record_commit(100, &[], || Ok(snapshot_of(&[(1, 1)])))
            .unwrap();
        manager
            .record_commit(200, &[TableEvent::update("t", vec![1], vec![2])], || {
                unreachable!()
            })
            .unwrap();
        manager
            .record_commit(300, &[TableEvent::delete("t", vec![1])], || unreachable!())
            .unwrap();

        assert_eq!(manager.state_at(150).unwrap(), snapshot_of(&[(1, 1)]));
        assert_eq!(manager.state_at(250).unwrap(), snapshot_of(&[(1, 2)]));
        assert!(manager.state_at(300).unwrap()["t"].is_empty());
        assert!(matches!(
            manager.state_at(50),
            Err(CoreError::NoRestorePoint { utc: 50 })
        ));
        let points: Vec<u64> = manager
            .restore_points()
            .unwrap()
            .iter()
            .map(|p| p.utc)
            .collect();
        assert_eq!(points, vec![100, 200, 300]);
    }

    #[test]
    fn increments_rotate_by_size_and_age() {
        let dir = tempdir().unwrap();
        let config = BackupConfig::new(dir.path())
            .max_backup_file_size(1)
            .max_backup_file_age(Duration::from_secs(3600));
        let manager = BackupRestoreManager::open(config).unwrap();
        manager.record_commit(1, &[], || Ok(Snapshot::new())).unwrap();
        for ts in 2..5 {
            manager
                .record_commit(ts, &[TableEvent::delete("t", vec![1])], || unreachable!())
                .unwrap();
        }
        let increments = manager
            .files()
            .iter()
            .filter(|f| f.kind == BackupKind::Increment)
            .count();
        assert_eq!(increments, 3);
    }

    #[test]
    fn policy_forces_new_reference() {
        let dir = tempdir().unwrap();
        let config = BackupConfig::new(dir.path()).max_backup_file_size(1);
        let manager = BackupRestoreManager::open(config).unwrap();
        manager.set_policy(Arc::new(IncrementLimit { max_increments: 2 }));
        for ts in 1..=4 {
            manager
                .record_commit(ts, &[TableEvent::delete("t", vec![1])], || Ok(Snapshot::new()))
                .unwrap();
        }
        let kinds: Vec<_> = manager.files().iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BackupKind::Reference,
                BackupKind::Increment,
                BackupKind::Increment,
                BackupKind::Reference,
            ]
        );
    }

    #[test]
    fn failed_snapshot_keeps_reference_owed() {
        let dir = tempdir().unwrap();
        let manager = BackupRestoreManager::open(BackupConfig::new(dir.path())).unwrap();
        let result = manager.record_commit(1, &[], || Err(CoreError::backup("disk full")));
        assert!(result.is_err());
        assert!(manager.is_reference_owed());
    }

    #[test]
    fn retention_keeps_the_reference_covering_the_cutoff() {
        let dir = tempdir().unwrap();
        let day = 86_400_000u64;
        let config = BackupConfig::new(dir.path()).max_backup_age(Some(Duration::from_millis(day)));
        let manager = BackupRestoreManager::open(config).unwrap();
        manager.record_commit(1, &[], || Ok(Snapshot::new())).unwrap();
        manager
            .record_commit(2, &[TableEvent::delete("t", vec![1])], || unreachable!())
            .unwrap();
        manager.activate_backup_reference_creation();
        manager
            .record_commit(10, &[], || Ok(Snapshot::new()))
            .unwrap();

        assert_eq!(manager.clean_old_backups(5 + day).unwrap(), 0);
        assert_eq!(manager.clean_old_backups(10 + day).unwrap(), 2);
        assert_eq!(manager.first_valid_reference_utc(), Some(10));
    }

    #[test]
    fn reopening_keeps_files_and_timestamps_increase() {
        let dir = tempdir().unwrap();
        {
            let manager = BackupRestoreManager::open(BackupConfig::new(dir.path())).unwrap();
            let ts = manager.next_timestamp();
            manager.record_commit(ts, &[], || Ok(Snapshot::new())).unwrap();
        }
        let manager = BackupRestoreManager::open(BackupConfig::new(dir.path())).unwrap();
        assert!(!manager.is_reference_owed());
        let before = manager.first_valid_reference_utc().unwrap();
        assert!(manager.next_timestamp() > before);
    }
}

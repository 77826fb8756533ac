//! Process-wide registry of per-database read/write locks.
//!
//! Wrappers opened on the same database name share one lock, handed out
//! as reference-counted handles; the entry disappears with its last
//! handle. The host owns the registry and passes it to every open.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Default)]
struct Entry {
    lock: RwLock<()>,
}

/// Hands out shared locks keyed by database name.
#[derive(Default)]
pub struct DatabaseRegistry {
    entries: Mutex<HashMap<String, (Arc<Entry>, usize)>>,
}

impl DatabaseRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a handle on the lock of `name`, creating it if needed.
    pub fn acquire(self: &Arc<Self>, name: &str) -> DatabaseHandle {
        let mut entries = self.entries.lock();
        let (entry, count) = entries
            .entry(name.to_string())
            .or_insert_with(|| (Arc::new(Entry::default()), 0));
        *count += 1;
        DatabaseHandle {
            registry: Arc::clone(self),
            name: name.to_string(),
            entry: Arc::clone(entry),
        }
    }

    /// Number of live handles on `name`.
    #[must_use]
    pub fn handle_count(&self, name: &str) -> usize {
        self.entries.lock().get(name).map_or(0, |(_, count)| *count)
    }

    fn release(&self, name: &str) {
        let mut entries = self.entries.lock();
        if let Some((_, count)) = entries.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                entries.remove(name);
            }
        }
    }
}

impl fmt::Debug for DatabaseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseRegistry")
            .field("databases", &self.entries.lock().len())
            .finish()
    }
}

/// A live reference to one database's lock.
pub struct DatabaseHandle {
    registry: Arc<DatabaseRegistry>,
    name: String,
    entry: Arc<Entry>,
}

impl DatabaseHandle {
    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared access, for readers.
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.entry.lock.read()
    }

    /// Exclusive access, for writers.
    pub fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.entry.lock.write()
    }
}

impl Drop for DatabaseHandle {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}

impl fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn handles_are_reference_counted() {
        let registry = DatabaseRegistry::new();
        let a = registry.acquire("db");
        let b = registry.acquire("db");
        assert_eq!(registry.handle_count("db"), 2);
        drop(a);
        assert_eq!(registry.handle_count("db"), 1);
        drop(b);
        assert_eq!(registry.handle_count("db"), 0);
    }

    #[test]
    fn same_name_shares_one_lock() {
        let registry = DatabaseRegistry::new();
        let a = registry.acquire("db");
        let b = registry.acquire("db");
        let other = registry.acquire("other");

        let _w = a.write();
        assert!(b.entry.lock.try_read().is_none());
        assert!(other.entry.lock.try_write().is_some());
    }

    #[test]
    fn writers_are_exclusive_across_threads() {
        let registry = DatabaseRegistry::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = registry.acquire("db");
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = handle.write();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(registry.handle_count("db"), 0);
    }
}

//! Per-file exclusive-access table
//!
//! A process-wide set of `(user, filename)` keys currently held by workers.
//! Acquisition is deliberately non-blocking: contention becomes an
//! application-level error the user can retry instead of a wait that could
//! deadlock. A key is held only for the span of one worker's critical
//! section, never across task boundaries; the RAII guard makes the release
//! unconditional.

use std::collections::HashSet;

use log::warn;
use parking_lot::Mutex;

/// Why [`FileLockTable::try_acquire`] refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRefused {
    /// Another operation holds this `(user, filename)` key right now.
    Busy,
    /// The table is at capacity.
    TableFull,
}

/// Process-wide table of locked `(user, filename)` keys.
#[derive(Debug)]
pub struct FileLockTable {
    capacity: usize,
    held: Mutex<HashSet<(String, String)>>,
}

impl FileLockTable {
    /// Create a table capped at `capacity` concurrently held keys.
    ///
    /// Size this to the maximum number of concurrent tasks (the worker
    /// pool), not the number of sessions; each worker holds at most one
    /// key at a time.
    pub fn new(capacity: usize) -> FileLockTable {
        FileLockTable {
            capacity,
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Attempt to take exclusive access to `(user, name)` without blocking.
    pub fn try_acquire(&self, user: &str, name: &str) -> Result<FileLockGuard<'_>, LockRefused> {
        let key = (user.to_string(), name.to_string());
        let mut held = self.held.lock();
        if held.contains(&key) {
            return Err(LockRefused::Busy);
        }
        if held.len() >= self.capacity {
            return Err(LockRefused::TableFull);
        }
        held.insert(key.clone());
        Ok(FileLockGuard { table: self, key })
    }

    fn release(&self, key: &(String, String)) {
        if !self.held.lock().remove(key) {
            // Not fatal, but it means a guard outlived a table reset or a
            // double release slipped through.
            warn!("released file lock {}/{} that was not held", key.0, key.1);
        }
    }

    /// Number of keys currently held.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// Exclusive access to one `(user, filename)` key; released on drop.
#[derive(Debug)]
pub struct FileLockGuard<'a> {
    table: &'a FileLockTable,
    key: (String, String),
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

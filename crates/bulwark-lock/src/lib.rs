//! Per-target mutual exclusion with acquisition timeout and cooperative
//! cancellation. A concurrent map of locks keyed by target id — not
//! one global lock — so applies against different targets proceed in
//! parallel while applies against the same target serialize.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use bulwark_retry::Cancellation;

/// How often the wait loop wakes up to re-check the cancellation token,
/// even while waiting on the condvar for another thread to unlock.
const POLL_SLICE: Duration = Duration::from_millis(20);

#[derive(Default)]
struct LockTable {
    held: HashMap<String, bool>,
}

/// The lock-of-locks. Cheap to clone (an `Arc` underneath); every caller
/// that needs per-target exclusion holds a clone of the same manager.
#[derive(Clone)]
pub struct LockManager {
    table: Arc<Mutex<LockTable>>,
    cv: Arc<Condvar>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(LockTable::default())),
            cv: Arc::new(Condvar::new()),
        }
    }

    /// Blocks until the per-`target_id` lock is acquired, `timeout`
    /// elapses, or `cancel` is observed cancelled — whichever comes first.
    /// `timeout = 0` succeeds iff the target is currently unlocked, else
    /// fails immediately.
    pub fn lock(&self, target_id: &str, timeout: Duration, cancel: &Cancellation) -> Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.table.lock().expect("lock table poisoned");
        loop {
            if cancel.is_cancelled() {
                bail!("lock acquisition for target {target_id} was cancelled");
            }
            let held = guard.held.get(target_id).copied().unwrap_or(false);
            if !held {
                guard.held.insert(target_id.to_string(), true);
                return Ok(LockGuard {
                    table: Arc::clone(&self.table),
                    cv: Arc::clone(&self.cv),
                    target_id: target_id.to_string(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                bail!("timed out acquiring lock for target {target_id} after {timeout:?}");
            }

            let wait_for = (deadline - now).min(POLL_SLICE);
            let (new_guard, _) = self
                .cv
                .wait_timeout(guard, wait_for)
                .expect("lock table poisoned during wait");
            guard = new_guard;
        }
    }

    /// True if the given target is currently locked by anyone.
    pub fn is_locked(&self, target_id: &str) -> bool {
        self.table
            .lock()
            .expect("lock table poisoned")
            .held
            .get(target_id)
            .copied()
            .unwrap_or(false)
    }
}

/// RAII handle released on drop; releasing is always safe even if called
/// redundantly, matching the "unlock is a no-op when not held" contract.
pub struct LockGuard {
    table: Arc<Mutex<LockTable>>,
    cv: Arc<Condvar>,
    target_id: String,
}

impl LockGuard {
    /// Releases the lock early. Also happens automatically on drop; this
    /// exists for callers (e.g. the executor) that want to unlock before
    /// the guard's scope ends without introducing an inner block.
    pub fn unlock(self) {
        drop(self)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut guard = self.table.lock().expect("lock table poisoned");
        guard.held.remove(&self.target_id);
        drop(guard);
        self.cv.notify_all();
    }
}

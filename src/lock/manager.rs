//! The lock manager and scoped lock guards.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::lock::error::LockError;
use crate::lock::target::{HolderId, LockMode, LockTarget};

const SHARD_COUNT: usize = 16;

/// Reentrancy counts of one holder on one target.
#[derive(Debug, Default, Clone, Copy)]
struct Hold {
    reads: u32,
    writes: u32,
}

impl Hold {
    fn is_empty(&self) -> bool {
        self.reads == 0 && self.writes == 0
    }
}

/// Current holders of one target.
#[derive(Debug, Default)]
struct LockEntry {
    holders: HashMap<HolderId, Hold>,
}

impl LockEntry {
    /// Checks if `mode` can be granted to `holder` right now.
    fn can_grant(&self, holder: HolderId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .filter(|(h, _)| **h != holder)
            .all(|(_, hold)| match mode {
                LockMode::Read => hold.writes == 0,
                LockMode::Write => false,
            })
    }

    /// Grants a lock; returns true if this upgraded a Read hold to Write.
    fn grant(&mut self, holder: HolderId, mode: LockMode) -> bool {
        let hold = self.holders.entry(holder).or_default();
        let upgrade = mode == LockMode::Write && hold.writes == 0 && hold.reads > 0;
        match mode {
            LockMode::Read => hold.reads += 1,
            LockMode::Write => hold.writes += 1,
        }
        upgrade
    }

    /// Releases one acquisition. Returns false if nothing was held.
    fn release(&mut self, holder: HolderId, mode: LockMode) -> bool {
        let Some(hold) = self.holders.get_mut(&holder) else {
            return false;
        };
        let count = match mode {
            LockMode::Read => &mut hold.reads,
            LockMode::Write => &mut hold.writes,
        };
        if *count == 0 {
            return false;
        }
        *count -= 1;
        if hold.is_empty() {
            self.holders.remove(&holder);
        }
        true
    }

    fn mode_of(&self, holder: HolderId) -> Option<LockMode> {
        self.holders.get(&holder).map(|hold| {
            if hold.writes > 0 {
                LockMode::Write
            } else {
                LockMode::Read
            }
        })
    }

    fn is_free(&self) -> bool {
        self.holders.is_empty()
    }
}

struct Shard {
    table: Mutex<HashMap<LockTarget, LockEntry>>,
    released: Condvar,
}

/// Statistics about the lock manager.
#[derive(Debug, Default)]
struct LockStats {
    acquisitions: AtomicU64,
    releases: AtomicU64,
    waits: AtomicU64,
    upgrades: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of the lock statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStatsSnapshot {
    pub acquisitions: u64,
    pub releases: u64,
    pub waits: u64,
    pub upgrades: u64,
    pub timeouts: u64,
}

struct LockManagerInner {
    shards: Vec<Shard>,
    next_holder: AtomicU64,
    stats: LockStats,
}

/// The lock manager.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
/// The lock table is split into shards, each with its own latch and wait
/// queue, so waiting on one target does not stall unrelated targets.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockManagerInner>,
}

impl LockManager {
    /// Creates a new, empty lock manager.
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard {
                table: Mutex::new(HashMap::new()),
                released: Condvar::new(),
            })
            .collect();

        Self {
            inner: Arc::new(LockManagerInner {
                shards,
                next_holder: AtomicU64::new(1),
                stats: LockStats::default(),
            }),
        }
    }

    /// Allocate a fresh holder identity.
    pub fn new_holder(&self) -> HolderId {
        HolderId(self.inner.next_holder.fetch_add(1, Ordering::Relaxed))
    }

    /// Acquires a lock, blocking until granted or `timeout` elapses.
    pub fn acquire(
        &self,
        target: LockTarget,
        mode: LockMode,
        holder: HolderId,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let shard = self.inner.shard_for(&target);
        let start = Instant::now();
        let deadline = start + timeout;
        let mut table = shard.table.lock();
        let mut waited = false;

        loop {
            let entry = table.entry(target.clone()).or_default();
            if entry.can_grant(holder, mode) {
                if entry.grant(holder, mode) {
                    self.inner.stats.upgrades.fetch_add(1, Ordering::Relaxed);
                    trace!(%target, %holder, "lock upgraded to WRITE");
                }
                self.inner.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
                break;
            }

            if !waited {
                waited = true;
                self.inner.stats.waits.fetch_add(1, Ordering::Relaxed);
                trace!(%target, %mode, %holder, "waiting for lock");
            }

            if shard.released.wait_until(&mut table, deadline).timed_out() {
                let entry = table.entry(target.clone()).or_default();
                if entry.can_grant(holder, mode) {
                    entry.grant(holder, mode);
                    self.inner.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                if entry.is_free() {
                    table.remove(&target);
                }
                self.inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(%target, %mode, %holder, "lock wait timed out");
                return Err(LockError::timeout(&target, mode, start.elapsed()));
            }
        }

        Ok(LockGuard {
            manager: Arc::clone(&self.inner),
            target,
            mode,
            holder,
            released: false,
        })
    }

    /// Acquire, then verify with `alive` that the target still exists.
    ///
    /// The lock is dropped again and `InvalidState` returned when the target
    /// vanished while the caller was waiting.
    pub fn acquire_checked(
        &self,
        target: LockTarget,
        mode: LockMode,
        holder: HolderId,
        timeout: Duration,
        alive: impl FnOnce(&LockTarget) -> bool,
    ) -> Result<LockGuard, LockError> {
        let guard = self.acquire(target, mode, holder, timeout)?;
        if !alive(guard.target()) {
            let msg = format!("{} no longer exists", guard.target());
            guard.release();
            return Err(LockError::InvalidState(msg));
        }
        Ok(guard)
    }

    /// Acquire several targets in the fixed total order.
    ///
    /// Duplicate targets are merged, keeping the stronger mode. On failure
    /// every lock taken so far is released.
    pub fn acquire_all(
        &self,
        targets: impl IntoIterator<Item = (LockTarget, LockMode)>,
        holder: HolderId,
        timeout: Duration,
    ) -> Result<Vec<LockGuard>, LockError> {
        let mut ordered: BTreeMap<LockTarget, LockMode> = BTreeMap::new();
        for (target, mode) in targets {
            ordered
                .entry(target)
                .and_modify(|m| *m = m.stronger(mode))
                .or_insert(mode);
        }

        let deadline = Instant::now() + timeout;
        let mut guards = Vec::with_capacity(ordered.len());
        for (target, mode) in ordered {
            let remaining = deadline.saturating_duration_since(Instant::now());
            guards.push(self.acquire(target, mode, holder, remaining)?);
        }
        Ok(guards)
    }

    /// Strongest mode `holder` currently has on `target`.
    pub fn held_mode(&self, target: &LockTarget, holder: HolderId) -> Option<LockMode> {
        let shard = self.inner.shard_for(target);
        let table = shard.table.lock();
        table.get(target).and_then(|entry| entry.mode_of(holder))
    }

    /// Number of targets with at least one holder.
    pub fn locked_targets(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.table.lock().values().filter(|e| !e.is_free()).count())
            .sum()
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        let stats = &self.inner.stats;
        LockStatsSnapshot {
            acquisitions: stats.acquisitions.load(Ordering::Relaxed),
            releases: stats.releases.load(Ordering::Relaxed),
            waits: stats.waits.load(Ordering::Relaxed),
            upgrades: stats.upgrades.load(Ordering::Relaxed),
            timeouts: stats.timeouts.load(Ordering::Relaxed),
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("locked_targets", &self.locked_targets())
            .finish()
    }
}

impl LockManagerInner {
    fn shard_for(&self, target: &LockTarget) -> &Shard {
        let mut hasher = DefaultHasher::new();
        target.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn release(&self, target: &LockTarget, mode: LockMode, holder: HolderId) {
        let shard = self.shard_for(target);
        let mut table = shard.table.lock();
        if let Some(entry) = table.get_mut(target) {
            if entry.release(holder, mode) {
                self.stats.releases.fetch_add(1, Ordering::Relaxed);
            }
            if entry.is_free() {
                table.remove(target);
            }
        }
        shard.released.notify_all();
    }
}

/// One granted acquisition. Released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    manager: Arc<LockManagerInner>,
    target: LockTarget,
    mode: LockMode,
    holder: HolderId,
    released: bool,
}

impl LockGuard {
    pub fn target(&self) -> &LockTarget {
        &self.target
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }

    /// Release now instead of at scope exit.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.release(&self.target, self.mode, self.holder);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("target", &self.target)
            .field("mode", &self.mode)
            .field("holder", &self.holder)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    use crate::storage::{CollectionPath, DocumentPath};

    fn col(p: &str) -> LockTarget {
        LockTarget::Collection(CollectionPath::new(p).unwrap())
    }

    const SHORT: Duration = Duration::from_millis(50);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn test_shared_readers() {
        let locks = LockManager::new();
        let (a, b) = (locks.new_holder(), locks.new_holder());

        let _g1 = locks.acquire(col("/db/a"), LockMode::Read, a, SHORT).unwrap();
        let _g2 = locks.acquire(col("/db/a"), LockMode::Read, b, SHORT).unwrap();
        assert_eq!(locks.held_mode(&col("/db/a"), a), Some(LockMode::Read));
        assert_eq!(locks.held_mode(&col("/db/a"), b), Some(LockMode::Read));
    }

    #[test]
    fn test_writer_excludes_others() {
        let locks = LockManager::new();
        let (a, b) = (locks.new_holder(), locks.new_holder());

        let _w = locks.acquire(col("/db/a"), LockMode::Write, a, SHORT).unwrap();
        let err = locks.acquire(col("/db/a"), LockMode::Read, b, SHORT).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert_eq!(locks.stats().timeouts, 1);
    }

    #[test]
    fn test_reentrant_and_upgrade() {
        let locks = LockManager::new();
        let a = locks.new_holder();

        let r1 = locks.acquire(col("/db/a"), LockMode::Read, a, SHORT).unwrap();
        let r2 = locks.acquire(col("/db/a"), LockMode::Read, a, SHORT).unwrap();
        let w = locks.acquire(col("/db/a"), LockMode::Write, a, SHORT).unwrap();
        assert_eq!(locks.held_mode(&col("/db/a"), a), Some(LockMode::Write));
        assert_eq!(locks.stats().upgrades, 1);

        // releasing reads never drops the write hold
        drop(r1);
        drop(r2);
        assert_eq!(locks.held_mode(&col("/db/a"), a), Some(LockMode::Write));

        drop(w);
        assert_eq!(locks.held_mode(&col("/db/a"), a), None);
        assert_eq!(locks.locked_targets(), 0);
    }

    #[test]
    fn test_upgrade_blocked_by_other_reader() {
        let locks = LockManager::new();
        let (a, b) = (locks.new_holder(), locks.new_holder());

        let _ra = locks.acquire(col("/db/a"), LockMode::Read, a, SHORT).unwrap();
        let _rb = locks.acquire(col("/db/a"), LockMode::Read, b, SHORT).unwrap();
        assert!(locks.acquire(col("/db/a"), LockMode::Write, a, SHORT).is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let locks = LockManager::new();
        let a = locks.new_holder();

        let guard = locks.acquire(col("/db/a"), LockMode::Write, a, SHORT).unwrap();
        guard.release();
        assert_eq!(locks.stats().releases, 1);
        assert_eq!(locks.locked_targets(), 0);
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let locks = LockManager::new();
        let (a, b) = (locks.new_holder(), locks.new_holder());
        let guard = locks.acquire(col("/db/a"), LockMode::Write, a, SHORT).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || {
                tx.send(()).unwrap();
                locks.acquire(col("/db/a"), LockMode::Write, b, LONG).map(|g| g.holder())
            })
        };

        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(guard);

        assert_eq!(waiter.join().unwrap().unwrap(), b);
    }

    #[test]
    fn test_acquire_all_orders_and_merges() {
        let locks = LockManager::new();
        let a = locks.new_holder();
        let doc = LockTarget::Document(DocumentPath::parse("/db/a/x.xml").unwrap());

        let guards = locks
            .acquire_all(
                vec![
                    (doc.clone(), LockMode::Write),
                    (col("/db/a"), LockMode::Read),
                    (col("/db/a"), LockMode::Write),
                ],
                a,
                SHORT,
            )
            .unwrap();

        assert_eq!(guards.len(), 2);
        assert_eq!(guards[0].target(), &col("/db/a"));
        assert_eq!(guards[0].mode(), LockMode::Write);
        assert_eq!(guards[1].target(), &doc);
    }

    #[test]
    fn test_acquire_all_releases_on_failure() {
        let locks = LockManager::new();
        let (a, b) = (locks.new_holder(), locks.new_holder());
        let _blocker = locks.acquire(col("/db/b"), LockMode::Write, b, SHORT).unwrap();

        let result = locks.acquire_all(
            vec![(col("/db/a"), LockMode::Write), (col("/db/b"), LockMode::Write)],
            a,
            SHORT,
        );
        assert!(result.is_err());
        assert_eq!(locks.held_mode(&col("/db/a"), a), None);
    }

    #[test]
    fn test_acquire_checked_reports_vanished_target() {
        let locks = LockManager::new();
        let a = locks.new_holder();

        let err = locks
            .acquire_checked(col("/db/gone"), LockMode::Read, a, SHORT, |_| false)
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidState(_)));
        assert_eq!(locks.locked_targets(), 0);
    }
}

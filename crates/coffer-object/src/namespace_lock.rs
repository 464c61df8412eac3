//! Process-wide namespace locking keyed by `(volume, path)`.
//!
//! Every object operation holds one of these for its duration: shared for
//! reads, exclusive for writes. Entries use tokio's write-preferring
//! `RwLock`, so a blocked writer stops new readers from acquiring until it
//! has run (FIFO fairness). Guards release on drop; an entry disappears
//! from the map when its last holder or waiter goes away.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

/// Generate an operation id used purely for lock diagnostics.
#[must_use]
pub fn ops_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct NsParam {
    volume: String,
    path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpsLockState {
    pub ops_id: String,
    pub lock_type: String,
    pub status: String,
    pub since: DateTime<Utc>,
}

/// Lock state of one `(volume, path)` entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumePathLockState {
    pub volume: String,
    pub path: String,
    pub running: usize,
    pub blocked: usize,
    pub lock_details: Vec<OpsLockState>,
}

/// Snapshot of the whole lock map, exposed over the RPC surface.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemLockState {
    pub total_locks: usize,
    pub total_running_locks: usize,
    pub total_blocked_locks: usize,
    pub locks: Vec<VolumePathLockState>,
}

struct NsLockEntry {
    rw: Arc<RwLock<()>>,
    refs: AtomicUsize,
    running: AtomicUsize,
    blocked: AtomicUsize,
    ops: Mutex<Vec<OpsLockState>>,
}

impl NsLockEntry {
    fn new() -> Self {
        Self {
            rw: Arc::new(RwLock::new(())),
            refs: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
            ops: Mutex::new(Vec::new()),
        }
    }
}

struct Shared {
    lock_map: Mutex<HashMap<NsParam, Arc<NsLockEntry>>>,
    trace: bool,
}

impl Shared {
    fn dec_ref(&self, param: &NsParam, entry: &Arc<NsLockEntry>) {
        let mut map = self.lock_map.lock();
        if entry.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(current) = map.get(param) {
                if Arc::ptr_eq(current, entry) {
                    map.remove(param);
                }
            }
        }
    }
}

/// The namespace lock manager.
pub struct NsLockMap {
    shared: Arc<Shared>,
}

impl Default for NsLockMap {
    fn default() -> Self {
        Self::new(false)
    }
}

impl NsLockMap {
    /// Create a lock map; with `trace` enabled each acquisition records its
    /// ops-id and timestamps for the lock-state snapshot.
    #[must_use]
    pub fn new(trace: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                lock_map: Mutex::new(HashMap::new()),
                trace,
            }),
        }
    }

    /// Acquire the exclusive (write) lock for `(volume, path)`.
    pub async fn lock(&self, volume: &str, path: &str, ops_id: &str) -> NsLockGuard {
        self.acquire(volume, path, ops_id, true).await
    }

    /// Acquire a shared (read) lock for `(volume, path)`.
    pub async fn rlock(&self, volume: &str, path: &str, ops_id: &str) -> NsLockGuard {
        self.acquire(volume, path, ops_id, false).await
    }

    async fn acquire(&self, volume: &str, path: &str, ops_id: &str, write: bool) -> NsLockGuard {
        let param = NsParam {
            volume: volume.to_string(),
            path: path.to_string(),
        };
        let entry = {
            let mut map = self.shared.lock_map.lock();
            let entry = map
                .entry(param.clone())
                .or_insert_with(|| Arc::new(NsLockEntry::new()))
                .clone();
            entry.refs.fetch_add(1, Ordering::SeqCst);
            entry
        };

        let lock_type = if write { "write" } else { "read" };
        entry.blocked.fetch_add(1, Ordering::SeqCst);
        if self.shared.trace {
            entry.ops.lock().push(OpsLockState {
                ops_id: ops_id.to_string(),
                lock_type: lock_type.to_string(),
                status: "blocked".to_string(),
                since: Utc::now(),
            });
        }

        // If the acquiring future is dropped while waiting, this rolls the
        // waiter accounting back.
        let pending = PendingRef {
            shared: self.shared.clone(),
            param: param.clone(),
            entry: entry.clone(),
            armed: true,
        };

        let inner = if write {
            GuardInner::Write(entry.rw.clone().write_owned().await)
        } else {
            GuardInner::Read(entry.rw.clone().read_owned().await)
        };

        entry.blocked.fetch_sub(1, Ordering::SeqCst);
        entry.running.fetch_add(1, Ordering::SeqCst);
        if self.shared.trace {
            let mut ops = entry.ops.lock();
            if let Some(op) = ops
                .iter_mut()
                .find(|op| op.ops_id == ops_id && op.status == "blocked")
            {
                op.status = "running".to_string();
                op.since = Utc::now();
            }
        }

        let mut pending = pending;
        pending.armed = false;
        NsLockGuard {
            shared: self.shared.clone(),
            param,
            entry,
            ops_id: ops_id.to_string(),
            _inner: inner,
        }
    }

    /// Snapshot the current lock map.
    #[must_use]
    pub fn lock_state(&self) -> SystemLockState {
        let map = self.shared.lock_map.lock();
        let mut state = SystemLockState::default();
        for (param, entry) in map.iter() {
            let running = entry.running.load(Ordering::SeqCst);
            let blocked = entry.blocked.load(Ordering::SeqCst);
            state.total_locks += running + blocked;
            state.total_running_locks += running;
            state.total_blocked_locks += blocked;
            state.locks.push(VolumePathLockState {
                volume: param.volume.clone(),
                path: param.path.clone(),
                running,
                blocked,
                lock_details: entry.ops.lock().clone(),
            });
        }
        state
    }
}

struct PendingRef {
    shared: Arc<Shared>,
    param: NsParam,
    entry: Arc<NsLockEntry>,
    armed: bool,
}

impl Drop for PendingRef {
    fn drop(&mut self) {
        if self.armed {
            self.entry.blocked.fetch_sub(1, Ordering::SeqCst);
            self.shared.dec_ref(&self.param, &self.entry);
        }
    }
}

enum GuardInner {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// Holds a namespace lock; dropping it releases the lock and reclaims the
/// map entry when nobody else holds or awaits it.
pub struct NsLockGuard {
    shared: Arc<Shared>,
    param: NsParam,
    entry: Arc<NsLockEntry>,
    ops_id: String,
    _inner: GuardInner,
}

impl Drop for NsLockGuard {
    fn drop(&mut self) {
        self.entry.running.fetch_sub(1, Ordering::SeqCst);
        if self.shared.trace {
            let mut ops = self.entry.ops.lock();
            if let Some(pos) = ops
                .iter()
                .position(|op| op.ops_id == self.ops_id && op.status == "running")
            {
                ops.remove(pos);
            }
        }
        self.shared.dec_ref(&self.param, &self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn exclusive_lock_excludes_writers() {
        let ns = Arc::new(NsLockMap::new(false));
        let guard = ns.lock("bucket", "object", &ops_id()).await;

        let ns2 = ns.clone();
        let handle = tokio::spawn(async move {
            let _g = ns2.lock("bucket", "object", &ops_id()).await;
            Utc::now()
        });

        sleep(Duration::from_millis(100)).await;
        let released_at = Utc::now();
        drop(guard);

        let acquired_at = handle.await.unwrap();
        assert!(acquired_at >= released_at);
    }

    #[tokio::test]
    async fn writer_preference_blocks_new_readers() {
        let ns = Arc::new(NsLockMap::new(false));
        let events = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let r1 = ns.rlock("bucket", "object", &ops_id()).await;

        let ns_w = ns.clone();
        let events_w = events.clone();
        let writer = tokio::spawn(async move {
            let _g = ns_w.lock("bucket", "object", &ops_id()).await;
            events_w.lock().push("writer");
        });

        // Give the writer time to queue behind r1.
        sleep(Duration::from_millis(100)).await;

        let ns_r = ns.clone();
        let events_r = events.clone();
        let reader2 = tokio::spawn(async move {
            let _g = ns_r.rlock("bucket", "object", &ops_id()).await;
            events_r.lock().push("reader2");
        });

        // The new reader must not jump the queued writer.
        sleep(Duration::from_millis(100)).await;
        assert!(events.lock().is_empty());

        drop(r1);
        writer.await.unwrap();
        reader2.await.unwrap();
        assert_eq!(*events.lock(), vec!["writer", "reader2"]);
    }

    #[tokio::test]
    async fn shared_locks_coexist() {
        let ns = NsLockMap::new(false);
        let g1 = ns.rlock("bucket", "object", &ops_id()).await;
        let g2 = ns.rlock("bucket", "object", &ops_id()).await;
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn lock_state_reports_and_reclaims() {
        let ns = Arc::new(NsLockMap::new(true));
        let guard = ns.lock("bucket", "object", "op-1").await;

        let ns2 = ns.clone();
        let waiter = tokio::spawn(async move {
            let _g = ns2.lock("bucket", "object", "op-2").await;
        });
        sleep(Duration::from_millis(100)).await;

        let state = ns.lock_state();
        assert_eq!(state.total_running_locks, 1);
        assert_eq!(state.total_blocked_locks, 1);
        assert_eq!(state.locks.len(), 1);
        assert_eq!(state.locks[0].lock_details.len(), 2);

        drop(guard);
        waiter.await.unwrap();

        let state = ns.lock_state();
        assert_eq!(state.total_locks, 0);
        assert!(state.locks.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_interfere() {
        let ns = NsLockMap::new(false);
        let _a = ns.lock("bucket", "a", &ops_id()).await;
        // A different key acquires immediately even while "a" is held.
        let _b = ns.lock("bucket", "b", &ops_id()).await;
        let _c = ns.rlock("other", "a", &ops_id()).await;
    }
}

//! Pool of parked tree-walk sessions.
//!
//! A listing page that ends mid-walk parks its walker here keyed by the
//! parameters the next page will arrive with; the follow-up request resumes
//! the walk instead of starting over. Sessions untouched for the pool
//! timeout are cancelled and evicted.

use crate::tree_walk::TreeWalkItem;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Default idle timeout of a parked walk.
pub const TREE_WALK_TIMEOUT: Duration = Duration::from_secs(60);

/// Key identifying a resumable walk.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListParams {
    pub bucket: String,
    pub recursive: bool,
    pub marker: String,
    pub prefix: String,
}

/// A walk detached from the pool: its result channel plus the cancel side
/// of the producer.
pub struct TreeWalkSession {
    pub items: mpsc::Receiver<TreeWalkItem>,
    pub cancel: watch::Sender<bool>,
}

struct ParkedWalk {
    session: TreeWalkSession,
    id: u64,
}

/// Pool of parked walks, keyed by [`ListParams`].
pub struct TreeWalkPool {
    pool: Arc<Mutex<HashMap<ListParams, Vec<ParkedWalk>>>>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl TreeWalkPool {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pool: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            next_id: AtomicU64::new(0),
        }
    }

    /// Detach a parked session for `params`, if any. The caller owns it and
    /// must re-[`set`](Self::set) it while output remains.
    pub fn release(&self, params: &ListParams) -> Option<TreeWalkSession> {
        let mut pool = self.pool.lock();
        let walks = pool.get_mut(params)?;
        let parked = if walks.is_empty() {
            None
        } else {
            Some(walks.remove(0))
        };
        if walks.is_empty() {
            pool.remove(params);
        }
        parked.map(|p| p.session)
    }

    /// Park a session under `params` and arm its idle timer: when the timer
    /// fires and the session is still parked, its producer is cancelled and
    /// the session evicted.
    pub fn set(&self, params: ListParams, session: TreeWalkSession) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pool
            .lock()
            .entry(params.clone())
            .or_default()
            .push(ParkedWalk { session, id });

        let pool = self.pool.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut pool = pool.lock();
                let Some(walks) = pool.get_mut(&params) else {
                    return;
                };
                let Some(idx) = walks.iter().position(|w| w.id == id) else {
                    return;
                };
                let parked = walks.remove(idx);
                if walks.is_empty() {
                    pool.remove(&params);
                }
                parked
            };
            debug!(bucket = %params.bucket, prefix = %params.prefix, "evicting idle tree walk");
            // Terminate the producer; dropping the receiver happens when
            // the session goes out of scope here.
            let _ = expired.session.cancel.send(true);
        });
    }
}

impl Default for TreeWalkPool {
    fn default() -> Self {
        Self::new(TREE_WALK_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_common::MAX_OBJECT_LIST;

    fn params() -> ListParams {
        ListParams {
            bucket: "bucket".to_string(),
            recursive: true,
            marker: String::new(),
            prefix: String::new(),
        }
    }

    #[tokio::test]
    async fn release_returns_parked_session() {
        let pool = TreeWalkPool::new(Duration::from_secs(60));
        let (tx, rx) = mpsc::channel(4);
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        drop(tx);

        pool.set(
            params(),
            TreeWalkSession {
                items: rx,
                cancel: cancel_tx,
            },
        );
        assert!(pool.release(&params()).is_some());
        assert!(pool.release(&params()).is_none());
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_cancelled() {
        let pool = TreeWalkPool::new(Duration::from_secs(2));
        let (tx, rx) = mpsc::channel(MAX_OBJECT_LIST);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        // A producer that sends until cancelled, like a real walker.
        let producer = tokio::spawn(async move {
            let mut i = 0u64;
            loop {
                let item = Ok(crate::tree_walk::TreeWalkResult {
                    entry: format!("file.{i}"),
                    end: false,
                });
                tokio::select! {
                    _ = cancel_rx.changed() => return i,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            return i;
                        }
                    }
                }
                i += 1;
            }
        });

        pool.set(
            params(),
            TreeWalkSession {
                items: rx,
                cancel: cancel_tx,
            },
        );

        tokio::time::sleep(Duration::from_secs(3)).await;

        // The pool timer evicted and cancelled the session.
        assert!(pool.release(&params()).is_none());
        let produced = tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .expect("producer did not exit after pool timeout")
            .unwrap();
        assert!(produced >= MAX_OBJECT_LIST as u64);
    }

    #[tokio::test]
    async fn reparked_session_restarts_its_timer() {
        let pool = TreeWalkPool::new(Duration::from_secs(2));
        let (tx, rx) = mpsc::channel(4);
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        let _keep_tx = tx;

        pool.set(
            params(),
            TreeWalkSession {
                items: rx,
                cancel: cancel_tx,
            },
        );

        // Release before the timeout, then park again; the stale timer from
        // the first park must not evict the re-parked session.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let session = pool.release(&params()).unwrap();
        pool.set(params(), session);

        // Sleep past the first timer's deadline but not the second's.
        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(pool.release(&params()).is_some());
    }
}

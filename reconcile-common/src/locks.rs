use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::metrics_consts::LOCK_WAIT_DURATION;

/// Serializes reconciliation per identity cluster.
///
/// Matching, deciding and writing is a check-then-act sequence: two requests that
/// both see no match for the same new identity would both insert. Every request takes
/// the lock of each cluster key it touches before matching and holds it until its
/// bulk write has returned, so requests touching the same cluster run one at a time.
///
/// The locks live in this process only, one service instance must own the store.
#[derive(Clone, Default)]
pub struct IdentityLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Holds a set of cluster locks. Releasing happens on drop.
pub struct ClusterGuard {
    guards: Vec<OwnedMutexGuard<()>>,
    keys: Vec<String>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key, always in sorted order so overlapping requests cannot deadlock.
    pub async fn acquire<I>(&self, keys: I) -> ClusterGuard
    where
        I: IntoIterator<Item = String>,
    {
        let keys: BTreeSet<String> = keys.into_iter().collect();
        let start = Instant::now();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.locks.entry(key.clone()).or_default().clone();
            guards.push(lock.lock_owned().await);
        }

        metrics::histogram!(LOCK_WAIT_DURATION).record(start.elapsed().as_millis() as f64);

        ClusterGuard {
            guards,
            keys: keys.into_iter().collect(),
            locks: self.locks.clone(),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for ClusterGuard {
    fn drop(&mut self) {
        self.guards.clear();
        // Only the map itself still points at an idle lock, anyone waiting holds a clone.
        for key in &self.keys {
            self.locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn releases_and_prunes_on_drop() {
        let locks = IdentityLocks::new();

        let guard = locks
            .acquire(vec!["a@x.com".to_owned(), "b@x.com".to_owned()])
            .await;
        assert_eq!(locks.len(), 2);

        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn duplicate_keys_lock_once() {
        let locks = IdentityLocks::new();

        let _guard = locks
            .acquire(vec!["a@x.com".to_owned(), "a@x.com".to_owned()])
            .await;

        assert_eq!(locks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_exclusive() {
        let locks = IdentityLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            // Overlapping key sets in different orders.
            let keys = if i % 2 == 0 {
                vec!["a".to_owned(), "b".to_owned()]
            } else {
                vec!["b".to_owned(), "a".to_owned()]
            };
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(keys).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn disjoint_keys_do_not_block() {
        let locks = IdentityLocks::new();

        let _a = locks.acquire(vec!["a".to_owned()]).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(vec!["b".to_owned()]),
        )
        .await;

        assert!(b.is_ok());
    }
}

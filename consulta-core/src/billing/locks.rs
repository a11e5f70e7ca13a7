//! Per-key mutual exclusion with first-come, first-served ordering.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One FIFO lock per key, created on demand and dropped once idle.
///
/// Operations on the same key run one at a time in arrival order; different keys
/// never wait on each other.
pub struct KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for this key's turn.
    pub async fn lock(&self, key: &K) -> KeyGuard<'_, K> {
        let lock = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let guard = lock.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a live lock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key holds or awaits a lock.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn prune(&self, key: &K) {
        // Only the table holds the lock once nobody owns or awaits it.
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Turn held on one key; released on drop.
pub struct KeyGuard<'locks, K>
where
    K: Eq + Hash + Clone,
{
    owner: &'locks KeyedLocks<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        self.owner.prune(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{task, time};

    use parking_lot::Mutex as SyncMutex;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn same_key_runs_in_arrival_order() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let order = Arc::new(SyncMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..5_u64 {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _turn = locks.lock(&"user-1".to_owned()).await;
                order.lock().push(format!("start-{index}"));
                time::sleep(Duration::from_millis(10)).await;
                order.lock().push(format!("end-{index}"));
            }));
            // Let the task enqueue before the next one arrives.
            task::yield_now().await;
        }
        for handle in handles {
            handle.await.expect("task");
        }

        let expected: Vec<String> = (0..5)
            .flat_map(|index| [format!("start-{index}"), format!("end-{index}")])
            .collect();
        assert_eq!(*order.lock(), expected);
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_do_not_wait() {
        let locks = KeyedLocks::<String>::new();
        let _first = locks.lock(&"user-1".to_owned()).await;

        let second = time::timeout(
            Duration::from_millis(1),
            locks.lock(&"user-2".to_owned()),
        )
        .await;

        assert!(second.is_ok());
    }
}

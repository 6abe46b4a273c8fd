//! Global lock table over named objects (group ids, shard mapping
//! handles). Lock sets are acquired in lexicographic order, which makes
//! deadlock impossible; the per-name mutexes are fair, so conflicting
//! procedures run in acquisition order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held locks of one procedure; dropping releases everything.
pub struct HeldLocks {
    #[allow(dead_code)]
    guards: Vec<OwnedMutexGuard<()>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every named lock, in name order. Blocks until all are held.
    pub async fn acquire(&self, names: &BTreeSet<String>) -> HeldLocks {
        let handles: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = self.locks.lock();
            names
                .iter()
                .map(|name| {
                    locks
                        .entry(name.clone())
                        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                        .clone()
                })
                .collect()
        };

        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }

        HeldLocks { guards }
    }

    /// A lock is currently held by someone.
    #[cfg(test)]
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .lock()
            .get(name)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let table = LockTable::new();
        let held = table.acquire(&names(&["g1", "g2"])).await;
        assert!(table.is_locked("g1"));
        assert!(table.is_locked("g2"));
        drop(held);
        assert!(!table.is_locked("g1"));
    }

    #[tokio::test]
    async fn test_no_deadlock_on_reversed_sets() {
        let table = Arc::new(LockTable::new());

        // Two tasks request the same pair; both sets iterate in
        // lexicographic order regardless of how the caller listed them.
        let mut tasks = vec![];
        for _ in 0..2 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let held = table.acquire(&names(&["b", "a"])).await;
                    tokio::time::sleep(Duration::from_micros(50)).await;
                    drop(held);
                }
            }));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            for task in tasks {
                task.await.unwrap();
            }
        })
        .await
        .expect("lock ordering deadlocked");
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let table = Arc::new(LockTable::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = vec![];
        for _ in 0..4 {
            let table = table.clone();
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                let _held = table.acquire(&names(&["g1"])).await;
                let inside = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(inside, 0, "two holders of the same group lock");
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }
}

//! Keyed mutex tables. Lock order is always session, then user.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

/// One mutex per key, created on first use
pub struct LockTable<K: Eq + Hash + Clone> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for LockTable<K> {
    fn default() -> Self {
        Self { locks: DashMap::new() }
    }
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the mutex for `key`; lock it with [`acquire`]
    pub fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop entries nobody is holding
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Lock a table mutex. The guarded data is `()`, so a poisoned lock carries no
/// broken state and is recovered.
pub fn acquire(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_same_key_shares_mutex() {
        let table: LockTable<u32> = LockTable::new();
        let a = table.handle(&1);
        let b = table.handle(&1);
        let c = table.handle(&2);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_prune_keeps_held_locks() {
        let table: LockTable<u32> = LockTable::new();
        let held = table.handle(&1);
        let _ = table.handle(&2);
        assert_eq!(table.prune(), 1);
        assert_eq!(table.len(), 1);
        drop(held);
        assert_eq!(table.prune(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_serialises_critical_section() {
        let table = Arc::new(LockTable::<u32>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let lock = table.handle(&7);
                        let _guard = acquire(&lock);
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
    }

    #[test]
    fn test_poisoned_lock_recovers() {
        let table = Arc::new(LockTable::<u32>::new());
        let lock = table.handle(&3);
        let poisoner = lock.clone();
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(lock.is_poisoned());
        let _guard = acquire(&lock);
    }
}

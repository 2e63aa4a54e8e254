//! Keyed async locks.
//!
//! Writes that read-modify-write a row (enrollments, grants, bindings) hold
//! the lock for their key across the whole sequence, so two requests for the
//! same participant are linearised while unrelated participants proceed in
//! parallel. Study keys are also taken shared by participant writes, so a
//! binding or lifecycle change never lands in the middle of one.
//!
//! Lock order: study before participant.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Idle entries are swept once the map grows past this size.
const SWEEP_THRESHOLD: usize = 1024;

pub(crate) struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<RwLock<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`.
    pub(crate) async fn lock(&self, key: K) -> OwnedRwLockWriteGuard<()> {
        self.slot(key).write_owned().await
    }

    /// Wait for shared access to `key`.
    pub(crate) async fn share(&self, key: K) -> OwnedRwLockReadGuard<()> {
        self.slot(key).read_owned().await
    }

    fn slot(&self, key: K) -> Arc<RwLock<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots.len() > SWEEP_THRESHOLD {
            slots.retain(|_, m| Arc::strong_count(m) > 1);
        }
        slots
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("k".to_string()).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_shared_holders_block_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let a = locks.share("k").await;
        let b = locks.share("k").await;

        let exclusive = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!exclusive.is_finished());

        drop(a);
        drop(b);
        exclusive.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(1u32).await;
        let _b = locks.lock(2u32).await;
        assert_eq!(locks.len(), 2);
    }
}

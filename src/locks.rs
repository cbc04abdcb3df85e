// src/locks.rs

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Hands out one async mutex per key, standing in for a row lock.
///
/// Guards are not reentrant: code holding a key must not acquire it again.
pub struct LockRegistry<K> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for LockRegistry<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> LockRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            // drop slots nobody is waiting on
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(key.clone()).or_default().clone()
        };
        slot.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_holders_of_the_same_key() {
        let locks = Arc::new(LockRegistry::<u32>::new());
        let counter = Arc::new(AsyncMutex::new(Vec::new()));

        let guard = locks.acquire(&1).await;
        let task = {
            let locks = locks.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&1).await;
                counter.lock().await.push("second");
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        counter.lock().await.push("first");
        drop(guard);
        task.await.unwrap();

        assert_eq!(*counter.lock().await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = LockRegistry::<u32>::new();
        let _a = locks.acquire(&1).await;
        let acquired = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&2)).await;
        assert!(acquired.is_ok());
    }
}

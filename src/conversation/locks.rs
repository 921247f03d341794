//! Per-conversation mutual exclusion.
//!
//! Only one turn (or sweep pass) may mutate a conversation at a time.
//! Different conversations never contend.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct ConversationLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Releases the conversation when dropped.
pub struct ConversationGuard {
    _guard: OwnedMutexGuard<()>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `conversation_id`.
    pub async fn acquire(&self, conversation_id: &str) -> ConversationGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        ConversationGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Drop entries nobody holds or waits on. Returns how many were removed.
    pub async fn cleanup_unused(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        // The map's own Arc is the only reference when the lock is idle
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_conversation_is_sequential() {
        let locks = ConversationLocks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter1 = counter.clone();
        let locks1 = locks.clone();
        let t1 = tokio::spawn(async move {
            let _guard = locks1.acquire("c1").await;
            counter1.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            counter1.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let counter2 = counter.clone();
        let locks2 = locks.clone();
        let t2 = tokio::spawn(async move {
            let _guard = locks2.acquire("c1").await;
            assert!(counter2.load(Ordering::SeqCst) >= 2);
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn different_conversations_run_in_parallel() {
        let locks = ConversationLocks::new();
        let _held = locks.acquire("c1").await;
        // Would deadlock if c2 shared c1's lock
        let _other = tokio::time::timeout(Duration::from_millis(100), locks.acquire("c2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cleanup_keeps_held_locks() {
        let locks = ConversationLocks::new();

        let guard = locks.acquire("c1").await;
        drop(locks.acquire("c2").await);
        assert_eq!(locks.len().await, 2);

        // Held locks survive cleanup
        assert_eq!(locks.cleanup_unused().await, 1);
        drop(guard);
        assert_eq!(locks.cleanup_unused().await, 1);
        assert_eq!(locks.len().await, 0);
    }
}

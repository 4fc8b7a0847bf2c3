//! In-process bucket store with a single owner lock.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::config::TokenBucketPolicy;
use crate::constants::LOCAL_SWEEP_INTERVAL;
use crate::error::RateLimitError;
use crate::key::BucketKey;
use crate::pure::evaluate_bucket;
use crate::store::BucketStore;
use crate::types::BucketOutcome;
use crate::types::BucketState;

struct LocalEntry {
    state: BucketState,
    expires_at_ms: u64,
}

impl LocalEntry {
    fn live_state(&self, now_ms: u64) -> Option<BucketState> {
        (now_ms < self.expires_at_ms).then_some(self.state)
    }
}

/// Bucket map owned by one process.
///
/// Each [`BucketStore::apply`] runs the whole limiter step while holding the
/// map lock, which makes it indivisible for every caller in this process. It
/// never awaits while holding the lock. Use it for single-node deployments and
/// tests; multi-process deployments need a shared store behind
/// [`crate::CasBucketStore`].
#[derive(Default)]
pub struct LocalBucketStore {
    buckets: Mutex<HashMap<String, LocalEntry>>,
    ops: AtomicU64,
}

impl LocalBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live buckets at `now_ms`.
    pub fn len(&self, now_ms: u64) -> usize {
        self.buckets.lock().values().filter(|e| e.live_state(now_ms).is_some()).count()
    }

    pub fn is_empty(&self, now_ms: u64) -> bool {
        self.len(now_ms) == 0
    }

    /// Milliseconds until `key` expires, `None` if absent or already expired.
    pub fn ttl_remaining_ms(&self, key: &BucketKey, now_ms: u64) -> Option<u64> {
        self.buckets
            .lock()
            .get(key.as_str())
            .filter(|e| now_ms < e.expires_at_ms)
            .map(|e| e.expires_at_ms - now_ms)
    }

    /// Drop expired buckets, returning how many were removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, e| now_ms < e.expires_at_ms);
        before - buckets.len()
    }
}

#[async_trait]
impl BucketStore for LocalBucketStore {
    async fn apply(
        &self,
        key: &BucketKey,
        policy: &TokenBucketPolicy,
        now_ms: u64,
    ) -> Result<BucketOutcome, RateLimitError> {
        let outcome = {
            let mut buckets = self.buckets.lock();
            let stored = buckets.get(key.as_str()).and_then(|e| e.live_state(now_ms));
            let outcome = evaluate_bucket(stored, policy, now_ms);
            buckets.insert(key.as_str().to_string(), LocalEntry {
                state: outcome.state,
                expires_at_ms: now_ms.saturating_add(outcome.ttl_ms),
            });
            outcome
        };

        if self.ops.fetch_add(1, Ordering::Relaxed) % LOCAL_SWEEP_INTERVAL == LOCAL_SWEEP_INTERVAL - 1 {
            let removed = self.purge_expired(now_ms);
            trace!(removed, "swept expired buckets");
        }

        Ok(outcome)
    }

    async fn load(&self, key: &BucketKey, now_ms: u64) -> Result<Option<BucketState>, RateLimitError> {
        Ok(self.buckets.lock().get(key.as_str()).and_then(|e| e.live_state(now_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(identity: &str) -> BucketKey {
        BucketKey::new("rl", "chat-send", identity).unwrap()
    }

    #[tokio::test]
    async fn apply_creates_bucket_lazily() {
        let store = LocalBucketStore::new();
        let policy = TokenBucketPolicy::new(3, 1.0).unwrap();
        assert!(store.load(&key("user:1"), 0).await.unwrap().is_none());

        let outcome = store.apply(&key("user:1"), &policy, 0).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(store.load(&key("user:1"), 0).await.unwrap().unwrap().tokens, 2.0);
    }

    #[tokio::test]
    async fn expired_bucket_restarts_full() {
        let store = LocalBucketStore::new();
        let policy = TokenBucketPolicy::new(2, 1.0).unwrap();
        for _ in 0..2 {
            store.apply(&key("user:1"), &policy, 0).await.unwrap();
        }
        assert_eq!(store.ttl_remaining_ms(&key("user:1"), 0), Some(4_000));

        assert!(store.load(&key("user:1"), 4_000).await.unwrap().is_none());
        let outcome = store.apply(&key("user:1"), &policy, 4_000).await.unwrap();
        assert_eq!(outcome.state.tokens, 1.0);
    }

    #[tokio::test]
    async fn purge_drops_idle_identities() {
        let store = LocalBucketStore::new();
        let policy = TokenBucketPolicy::new(1, 1.0).unwrap();
        for i in 0..10 {
            store.apply(&key(&format!("user:{i}")), &policy, 0).await.unwrap();
        }
        assert_eq!(store.len(0), 10);
        assert_eq!(store.purge_expired(2_000), 10);
        assert!(store.is_empty(2_000));
    }

    #[tokio::test]
    async fn periodic_sweep_bounds_memory() {
        let store = LocalBucketStore::new();
        let policy = TokenBucketPolicy::new(1, 1.0).unwrap();
        for i in 0..LOCAL_SWEEP_INTERVAL {
            store.apply(&key(&format!("user:{i}")), &policy, 0).await.unwrap();
        }
        // Everything above expired by t=10s; one more batch triggers a sweep.
        for i in 0..LOCAL_SWEEP_INTERVAL {
            store.apply(&key(&format!("late:{i}")), &policy, 10_000).await.unwrap();
        }
        assert!(store.buckets.lock().len() <= LOCAL_SWEEP_INTERVAL as usize + 1);
    }
}

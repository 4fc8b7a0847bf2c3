use async_trait::async_trait;

use crate::config::TokenBucketPolicy;
use crate::error::RateLimitError;
use crate::key::BucketKey;
use crate::types::BucketOutcome;
use crate::types::BucketState;

/// Shared home of bucket state.
///
/// `apply` is the atomic unit the limiter depends on: read the bucket (or
/// start it full), refill, debit or deny, write the new state and refresh the
/// key's expiry, with no other `apply` on the same key observing anything in
/// between. Implementations decide how: a server-side script, a
/// compare-and-swap loop, or a single owner of the map.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Run one limiter step for `key` at time `now_ms`.
    async fn apply(
        &self,
        key: &BucketKey,
        policy: &TokenBucketPolicy,
        now_ms: u64,
    ) -> Result<BucketOutcome, RateLimitError>;

    /// Read the stored state without modifying it. `None` if absent or expired.
    async fn load(&self, key: &BucketKey, now_ms: u64) -> Result<Option<BucketState>, RateLimitError>;
}

#[async_trait]
impl<T: BucketStore + ?Sized> BucketStore for std::sync::Arc<T> {
    async fn apply(
        &self,
        key: &BucketKey,
        policy: &TokenBucketPolicy,
        now_ms: u64,
    ) -> Result<BucketOutcome, RateLimitError> {
        (**self).apply(key, policy, now_ms).await
    }

    async fn load(&self, key: &BucketKey, now_ms: u64) -> Result<Option<BucketState>, RateLimitError> {
        (**self).load(key, now_ms).await
    }
}

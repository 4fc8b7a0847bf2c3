//! Bucket store over any compare-and-swap key-value store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tandem_kv::KeyValueStore;
use tandem_kv::KeyValueStoreError;
use tandem_kv::ReadRequest;
use tandem_kv::WriteRequest;
use tracing::debug;
use tracing::warn;

use crate::config::TokenBucketPolicy;
use crate::constants::CAS_RETRY_INITIAL_BACKOFF_MS;
use crate::constants::CAS_RETRY_MAX_BACKOFF_MS;
use crate::constants::MAX_CAS_RETRIES;
use crate::error::RateLimitError;
use crate::key::BucketKey;
use crate::pure::evaluate_bucket;
use crate::store::BucketStore;
use crate::types::BucketOutcome;
use crate::types::BucketState;

/// Runs the limiter step as an optimistic transaction on a [`KeyValueStore`].
///
/// Each attempt reads the raw stored value, evaluates the bucket, and writes
/// the result with a compare-and-swap against that exact raw value, refreshing
/// the TTL in the same write. A lost race re-reads and re-evaluates; it never
/// turns into a denial. Retries are bounded by `max_retries`, after which the
/// step fails with [`RateLimitError::StoreUnavailable`].
pub struct CasBucketStore<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    max_retries: u32,
}

impl<S: KeyValueStore + ?Sized> CasBucketStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            max_retries: MAX_CAS_RETRIES,
        }
    }

    /// Override the CAS attempt budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.store
    }

    /// Read the raw value and decode it. Returns the raw string for the CAS precondition.
    async fn read_raw(&self, key: &BucketKey) -> Result<(Option<String>, Option<BucketState>), RateLimitError> {
        let raw = match self.store.read(ReadRequest::new(key.as_str())).await {
            Ok(result) => result.kv.map(|kv| kv.value),
            Err(KeyValueStoreError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };
        let state = raw.as_deref().map(|value| decode_state(key, value)).transpose()?;
        Ok((raw, state))
    }
}

pub(crate) fn decode_state(key: &BucketKey, value: &str) -> Result<BucketState, RateLimitError> {
    let state: BucketState = serde_json::from_str(value).map_err(|e| RateLimitError::CorruptedState {
        key: key.to_string(),
        reason: format!("invalid bucket state JSON: {e}"),
    })?;
    if !state.tokens.is_finite() || state.tokens < 0.0 {
        return Err(RateLimitError::CorruptedState {
            key: key.to_string(),
            reason: format!("token count {} out of range", state.tokens),
        });
    }
    Ok(state)
}

fn encode_state(key: &BucketKey, state: &BucketState) -> Result<String, RateLimitError> {
    serde_json::to_string(state).map_err(|e| RateLimitError::CorruptedState {
        key: key.to_string(),
        reason: format!("failed to encode bucket state: {e}"),
    })
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> BucketStore for CasBucketStore<S> {
    async fn apply(
        &self,
        key: &BucketKey,
        policy: &TokenBucketPolicy,
        now_ms: u64,
    ) -> Result<BucketOutcome, RateLimitError> {
        let mut attempt = 0u32;
        let mut backoff_ms = CAS_RETRY_INITIAL_BACKOFF_MS;

        loop {
            let (expected, stored) = self.read_raw(key).await?;
            let outcome = evaluate_bucket(stored, policy, now_ms);
            let new_value = encode_state(key, &outcome.state)?;

            let request = WriteRequest::compare_and_swap(key.as_str(), expected, new_value, Some(outcome.ttl_ms));
            match self.store.write(request).await {
                Ok(_) => return Ok(outcome),
                Err(e) if e.is_cas_conflict() => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        warn!(key = %key, attempts = attempt, "bucket update lost every compare-and-swap race");
                        return Err(RateLimitError::StoreUnavailable {
                            reason: format!("compare-and-swap contention on '{key}' after {attempt} attempts"),
                        });
                    }
                    debug!(key = %key, attempt, backoff_ms, "bucket compare-and-swap conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(CAS_RETRY_MAX_BACKOFF_MS);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load(&self, key: &BucketKey, _now_ms: u64) -> Result<Option<BucketState>, RateLimitError> {
        // Expiry is enforced by the backing store.
        Ok(self.read_raw(key).await?.1)
    }
}

#[cfg(test)]
mod tests {
    use tandem_kv::DeterministicKeyValueStore;
    use tandem_kv::FaultInjectingStore;
    use tandem_kv::FaultMode;
    use tandem_time::SimulatedTimeProvider;

    use super::*;

    fn key() -> BucketKey {
        BucketKey::new("rl", "api", "user:7").unwrap()
    }

    #[tokio::test]
    async fn apply_writes_json_with_ttl() {
        let time = SimulatedTimeProvider::new(10_000);
        let kv = DeterministicKeyValueStore::with_time(Arc::new(time.clone()));
        let store = CasBucketStore::new(kv.clone());
        let policy = TokenBucketPolicy::new(10, 0.5).unwrap();

        let outcome = store.apply(&key(), &policy, 10_000).await.unwrap();
        assert!(outcome.allowed);

        let raw = kv.read(ReadRequest::new(key().as_str())).await.unwrap().kv.unwrap().value;
        assert_eq!(raw, r#"{"tokens":9.0,"last_update_ms":10000}"#);
        assert_eq!(kv.ttl_remaining_ms(key().as_str()).await, Some(40_000));
    }

    #[tokio::test]
    async fn corrupted_value_is_reported() {
        let kv = DeterministicKeyValueStore::new();
        kv.write(WriteRequest::set(key().as_str(), "not json")).await.unwrap();
        let store = CasBucketStore::new(kv);
        let policy = TokenBucketPolicy::new(10, 1.0).unwrap();

        let err = store.apply(&key(), &policy, 0).await.unwrap_err();
        assert!(matches!(err, RateLimitError::CorruptedState { .. }));
    }

    #[tokio::test]
    async fn negative_tokens_are_corruption() {
        let kv = DeterministicKeyValueStore::new();
        kv.write(WriteRequest::set(key().as_str(), r#"{"tokens":-1.0,"last_update_ms":0}"#)).await.unwrap();
        let store = CasBucketStore::new(kv);
        assert!(matches!(store.load(&key(), 0).await, Err(RateLimitError::CorruptedState { .. })));
    }

    #[tokio::test]
    async fn unavailable_store_is_not_a_denial() {
        let kv = Arc::new(FaultInjectingStore::new(DeterministicKeyValueStore::new()));
        kv.set_mode(FaultMode::Unavailable {
            reason: "connection refused".into(),
        });
        let store = CasBucketStore::new(kv);
        let policy = TokenBucketPolicy::new(10, 1.0).unwrap();

        let err = store.apply(&key(), &policy, 0).await.unwrap_err();
        assert_eq!(err, RateLimitError::StoreUnavailable {
            reason: "store unavailable: connection refused".into(),
        });
    }

    #[tokio::test]
    async fn single_round_trip_pair_without_contention() {
        let kv = Arc::new(FaultInjectingStore::new(DeterministicKeyValueStore::new()));
        let store = CasBucketStore::new(kv.clone());
        let policy = TokenBucketPolicy::new(10, 1.0).unwrap();

        store.apply(&key(), &policy, 0).await.unwrap();
        // One read plus one compare-and-swap.
        assert_eq!(kv.calls(), 2);
    }

    /// Always reports an empty key and always loses the CAS.
    struct AlwaysConflicting;

    #[async_trait]
    impl KeyValueStore for AlwaysConflicting {
        async fn write(&self, request: WriteRequest) -> Result<tandem_kv::WriteResult, KeyValueStoreError> {
            Err(KeyValueStoreError::CompareAndSwapFailed {
                key: request.command.key().to_string(),
                expected: None,
                actual: Some("{}".into()),
            })
        }

        async fn read(&self, _request: ReadRequest) -> Result<tandem_kv::ReadResult, KeyValueStoreError> {
            Ok(tandem_kv::ReadResult { kv: None })
        }
    }

    #[tokio::test]
    async fn contention_budget_exhaustion_is_a_store_failure() {
        let store = CasBucketStore::new(Arc::new(AlwaysConflicting)).with_max_retries(3);
        let policy = TokenBucketPolicy::new(10, 1.0).unwrap();

        let err = store.apply(&key(), &policy, 0).await.unwrap_err();
        assert!(err.is_store_failure());
        assert!(err.to_string().contains("after 3 attempts"));
    }
}

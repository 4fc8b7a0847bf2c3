//! The token bucket admission controller.

use std::sync::Arc;
use std::time::Duration;

use tandem_time::SystemTimeProvider;
use tandem_time::TimeProvider;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::FailurePolicy;
use crate::config::TokenBucketConfig;
use crate::config::TokenBucketPolicy;
use crate::error::ConfigError;
use crate::error::RateLimitError;
use crate::key::BucketKey;
use crate::pure::calculate_replenished_tokens;
use crate::store::BucketStore;
use crate::types::Admission;
use crate::types::AllowResult;

/// Admission controller for one policy.
///
/// Holds no bucket state of its own. Each decision is delegated to the
/// [`BucketStore`] as a single atomic step, so limiters in different tasks or
/// processes that share a store and a key prefix enforce one logical bucket
/// per `(scope, identity)`.
///
/// Store calls are bounded by the configured store timeout. A timed-out call
/// is reported as [`RateLimitError::StoreUnavailable`]; the limiter makes no
/// assumption about whether the write landed.
pub struct TokenBucket<B: BucketStore + ?Sized = dyn BucketStore> {
    store: Arc<B>,
    policy: TokenBucketPolicy,
    key_prefix: String,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
    time: Arc<dyn TimeProvider>,
}

impl<B: BucketStore + ?Sized> TokenBucket<B> {
    /// Build a limiter on the system clock.
    pub fn new(store: Arc<B>, config: TokenBucketConfig) -> Result<Self, ConfigError> {
        Self::with_time_provider(store, config, Arc::new(SystemTimeProvider))
    }

    /// Build a limiter reading time from `time`.
    pub fn with_time_provider(
        store: Arc<B>,
        config: TokenBucketConfig,
        time: Arc<dyn TimeProvider>,
    ) -> Result<Self, ConfigError> {
        let policy = config.validate()?;
        Ok(Self {
            store,
            policy,
            store_timeout: config.store_timeout(),
            key_prefix: config.key_prefix,
            failure_policy: config.failure_policy,
            time,
        })
    }

    pub fn policy(&self) -> &TokenBucketPolicy {
        &self.policy
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    pub fn store(&self) -> &Arc<B> {
        &self.store
    }

    /// Key under which `(scope, identity)` is stored.
    pub fn bucket_key(&self, scope: &str, identity: &str) -> Result<BucketKey, RateLimitError> {
        BucketKey::new(&self.key_prefix, scope, identity)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, RateLimitError>>,
    ) -> Result<T, RateLimitError> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::StoreUnavailable {
                reason: format!("timed out after {}ms", self.store_timeout.as_millis()),
            }),
        }
    }

    /// Take one token for `(scope, identity)` if one is available.
    ///
    /// Every call writes the bucket back and refreshes its expiry, including
    /// denials. Store failures are returned as errors and never reported as
    /// a denial.
    pub async fn allow(&self, scope: &str, identity: &str) -> Result<AllowResult, RateLimitError> {
        let key = self.bucket_key(scope, identity)?;
        let now_ms = self.time.now_unix_ms();

        let outcome = self.bounded(self.store.apply(&key, &self.policy, now_ms)).await?;

        let result = outcome.to_allow_result();
        if result.allowed {
            debug!(key = %key, remaining = result.tokens_remaining, "request admitted");
        } else {
            info!(key = %key, retry_after_ms = outcome.retry_after_ms, "request rate limited");
        }
        Ok(result)
    }

    /// [`allow`](Self::allow) with the failure policy applied.
    pub async fn admit(&self, scope: &str, identity: &str) -> Admission {
        match self.allow(scope, identity).await {
            Ok(result) if result.allowed => Admission::Allowed {
                tokens_remaining: result.tokens_remaining,
            },
            Ok(result) => Admission::Denied {
                retry_after_seconds: result.retry_after_seconds,
            },
            Err(RateLimitError::InvalidKey { reason }) => {
                debug!(scope, identity, %reason, "rejecting request with unusable bucket key");
                Admission::Rejected { reason }
            }
            Err(e) => match self.failure_policy {
                FailurePolicy::Open => {
                    warn!(scope, identity, error = %e, "rate limiter store failed, admitting request (fail-open)");
                    Admission::FailedOpen { reason: e.to_string() }
                }
                FailurePolicy::Closed => {
                    error!(scope, identity, error = %e, "rate limiter store failed, rejecting request (fail-closed)");
                    Admission::FailedClosed { reason: e.to_string() }
                }
            },
        }
    }

    /// Whole tokens currently available, without taking one or touching the expiry.
    pub async fn tokens_available(&self, scope: &str, identity: &str) -> Result<u64, RateLimitError> {
        let key = self.bucket_key(scope, identity)?;
        let now_ms = self.time.now_unix_ms();

        let stored = self.bounded(self.store.load(&key, now_ms)).await?;

        let capacity = self.policy.capacity();
        Ok(match stored {
            None => capacity,
            Some(state) => {
                let available = calculate_replenished_tokens(
                    state.tokens,
                    state.last_update_ms,
                    now_ms,
                    self.policy.refill_rate(),
                    capacity,
                );
                available.floor().max(0.0) as u64
            }
        })
    }
}

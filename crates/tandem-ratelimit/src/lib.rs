//! Distributed token bucket rate limiting.
//!
//! A [`TokenBucket`] decides, per request, whether a caller identified by a
//! `(scope, identity)` pair may proceed. The limiter itself is stateless: all
//! bucket state lives in a shared [`BucketStore`], and every decision is one
//! atomic read-refill-debit-write-expire unit against that store. Any number of
//! limiter instances, in any number of processes, can share one logical bucket.
//!
//! Three store implementations are provided:
//!
//! - [`LocalBucketStore`] - in-process map with a single owner lock
//! - [`CasBucketStore`] - optimistic compare-and-swap over any
//!   [`tandem_kv::KeyValueStore`] that supports TTLs
//! - [`RedisBucketStore`] - one server-side script call per decision, shared
//!   by every process pointed at the same Redis
//!
//! Store failures are never folded into rate-limit denials. [`TokenBucket::allow`]
//! returns them as [`RateLimitError::StoreUnavailable`]; [`TokenBucket::admit`]
//! applies the configured [`FailurePolicy`] (fail-closed unless overridden).
//!
//! ## Example
//!
//! ```ignore
//! use tandem_ratelimit::{LocalBucketStore, TokenBucket, TokenBucketConfig};
//!
//! let store = Arc::new(LocalBucketStore::new());
//! let chat = TokenBucket::new(store, TokenBucketConfig::new(10, 0.5))?;
//!
//! let result = chat.allow("chat-send", "user:42").await?;
//! if !result.allowed {
//!     println!("retry in {:.2}s", result.retry_after_seconds);
//! }
//! ```

mod cas;
mod config;
mod constants;
mod error;
mod key;
mod local;
pub mod pure;
mod rate_limiter;
mod redis_store;
mod store;
mod types;

pub use cas::CasBucketStore;
pub use config::FailurePolicy;
pub use config::TokenBucketConfig;
pub use config::TokenBucketPolicy;
pub use constants::CAS_RETRY_INITIAL_BACKOFF_MS;
pub use constants::CAS_RETRY_MAX_BACKOFF_MS;
pub use constants::DEFAULT_KEY_PREFIX;
pub use constants::DEFAULT_STORE_TIMEOUT_MS;
pub use constants::MAX_CAS_RETRIES;
pub use constants::MAX_IDENTITY_LENGTH;
pub use constants::MAX_SCOPE_LENGTH;
pub use error::ConfigError;
pub use error::RateLimitError;
pub use key::BucketKey;
pub use key::validate_scope;
pub use local::LocalBucketStore;
pub use rate_limiter::TokenBucket;
pub use redis_store::RedisBucketStore;
pub use store::BucketStore;
pub use types::Admission;
pub use types::AllowResult;
pub use types::BucketOutcome;
pub use types::BucketState;

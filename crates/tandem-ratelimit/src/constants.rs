//! Limits and defaults for the rate limiter.

/// Key namespace used when the caller does not supply one.
pub const DEFAULT_KEY_PREFIX: &str = "rl";

/// Upper bound on a single store round trip before the call is reported as
/// [`crate::RateLimitError::StoreUnavailable`].
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Maximum compare-and-swap attempts per decision in [`crate::CasBucketStore`].
///
/// A failed CAS means another caller's update committed, so with fewer than
/// this many concurrent callers on one key the loop cannot be exhausted.
pub const MAX_CAS_RETRIES: u32 = 64;

/// First backoff between CAS attempts.
pub const CAS_RETRY_INITIAL_BACKOFF_MS: u64 = 1;

/// Backoff ceiling between CAS attempts.
pub const CAS_RETRY_MAX_BACKOFF_MS: u64 = 32;

/// Maximum scope length in bytes.
pub const MAX_SCOPE_LENGTH: usize = 64;

/// Maximum identity length in bytes.
pub const MAX_IDENTITY_LENGTH: usize = 256;

/// [`crate::LocalBucketStore`] sweeps expired buckets once every this many decisions.
pub const LOCAL_SWEEP_INTERVAL: u64 = 1_024;

const _: () = assert!(MAX_CAS_RETRIES > 0);
const _: () = assert!(CAS_RETRY_INITIAL_BACKOFF_MS <= CAS_RETRY_MAX_BACKOFF_MS);
const _: () = assert!(DEFAULT_STORE_TIMEOUT_MS > 0);

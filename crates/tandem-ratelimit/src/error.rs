//! Error types for the rate limiter.

use snafu::Snafu;
use tandem_kv::KeyValueStoreError;

/// Failure to reach a decision.
///
/// A denial is not an error: it is reported through
/// [`crate::AllowResult::allowed`]. These variants mean the limiter could not
/// determine the bucket state at all.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum RateLimitError {
    /// The backing store could not be reached, timed out, or kept losing
    /// compare-and-swap races. The write may or may not have applied.
    #[snafu(display("rate limiter store unavailable: {reason}"))]
    StoreUnavailable {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// Stored bucket state could not be decoded.
    #[snafu(display("corrupted bucket state in key '{key}': {reason}"))]
    CorruptedState {
        /// The bucket key.
        key: String,
        /// What was wrong with the stored value.
        reason: String,
    },

    /// Scope or identity cannot form a bucket key.
    #[snafu(display("invalid rate limit key: {reason}"))]
    InvalidKey {
        /// Which part was rejected and why.
        reason: String,
    },
}

impl RateLimitError {
    /// Whether this is a backend failure that a fail-open/fail-closed policy applies to.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, RateLimitError::StoreUnavailable { .. } | RateLimitError::CorruptedState { .. })
    }
}

impl From<KeyValueStoreError> for RateLimitError {
    fn from(source: KeyValueStoreError) -> Self {
        RateLimitError::StoreUnavailable {
            reason: source.to_string(),
        }
    }
}

/// Invalid limiter configuration, reported at construction time.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("capacity must be positive, got {capacity}"))]
    InvalidCapacity { capacity: u64 },

    #[snafu(display("refill rate must be a positive finite number of tokens/second, got {refill_rate}"))]
    InvalidRefillRate { refill_rate: f64 },

    #[snafu(display("invalid key prefix '{prefix}': {reason}"))]
    InvalidKeyPrefix { prefix: String, reason: String },

    #[snafu(display("store timeout must be non-zero"))]
    InvalidStoreTimeout,

    #[snafu(display("unknown failure policy '{value}', expected 'closed' or 'open'"))]
    UnknownFailurePolicy { value: String },

    /// The URL is left out so credentials in it are never logged.
    #[snafu(display("invalid bucket store URL: {reason}"))]
    InvalidStoreUrl { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_unavailable() {
        let err: RateLimitError = KeyValueStoreError::Timeout { duration_ms: 50 }.into();
        assert_eq!(err, RateLimitError::StoreUnavailable {
            reason: "operation timed out after 50ms".into(),
        });
        assert!(err.is_store_failure());
    }

    #[test]
    fn invalid_key_is_not_a_store_failure() {
        let err = RateLimitError::InvalidKey {
            reason: "scope is empty".into(),
        };
        assert!(!err.is_store_failure());
        assert_eq!(err.to_string(), "invalid rate limit key: scope is empty");
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidRefillRate { refill_rate: -1.0 };
        assert_eq!(
            err.to_string(),
            "refill rate must be a positive finite number of tokens/second, got -1"
        );
    }
}

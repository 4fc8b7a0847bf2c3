//! Bucket state and decision types.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::pure::retry_after_header_secs;

/// Bucket state as stored in the shared store.
///
/// Serialized as JSON so operators can inspect buckets with ordinary store
/// tooling. Capacity and refill rate are deliberately absent: they belong to
/// the limiter's policy, not to the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Current token count (fractional).
    pub tokens: f64,
    /// Unix milliseconds of the last refill/debit.
    pub last_update_ms: u64,
}

impl BucketState {
    /// A bucket at full capacity as of `now_ms`.
    pub fn full(capacity: u64, now_ms: u64) -> Self {
        Self {
            tokens: capacity as f64,
            last_update_ms: now_ms,
        }
    }
}

/// Result of one atomic bucket step, produced by [`crate::pure::evaluate_bucket`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// State written back to the store.
    pub state: BucketState,
    /// Whether a token was taken.
    pub allowed: bool,
    /// Milliseconds until one token is available (0 when allowed).
    pub retry_after_ms: u64,
    /// Expiry applied to the key alongside the write.
    pub ttl_ms: u64,
}

impl BucketOutcome {
    /// Caller-facing view of the outcome.
    pub fn to_allow_result(&self) -> AllowResult {
        AllowResult {
            allowed: self.allowed,
            retry_after_seconds: self.retry_after_ms as f64 / 1000.0,
            tokens_remaining: self.state.tokens.floor().max(0.0) as u64,
        }
    }
}

/// Decision returned by [`crate::TokenBucket::allow`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllowResult {
    pub allowed: bool,
    /// Seconds until the next request can be admitted; 0 when allowed.
    pub retry_after_seconds: f64,
    /// Whole tokens left in the bucket after this decision.
    pub tokens_remaining: u64,
}

impl AllowResult {
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs_f64(self.retry_after_seconds.max(0.0))
    }

    /// Value for an HTTP `Retry-After` header: whole seconds, at least 1.
    pub fn retry_after_header(&self) -> u64 {
        retry_after_header_secs(self.retry_after_seconds)
    }
}

/// Decision after a [`crate::FailurePolicy`] has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// A token was taken.
    Allowed { tokens_remaining: u64 },
    /// Rate limited.
    Denied { retry_after_seconds: f64 },
    /// Store failed; the fail-open policy let the request through.
    FailedOpen { reason: String },
    /// Store failed; the fail-closed policy rejected the request.
    FailedClosed { reason: String },
    /// Scope or identity could not be turned into a bucket key.
    Rejected { reason: String },
}

impl Admission {
    /// Whether the caller should proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Allowed { .. } | Admission::FailedOpen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_floors_remaining_tokens() {
        let outcome = BucketOutcome {
            state: BucketState {
                tokens: 3.75,
                last_update_ms: 0,
            },
            allowed: true,
            retry_after_ms: 0,
            ttl_ms: 1,
        };
        let result = outcome.to_allow_result();
        assert_eq!(result.tokens_remaining, 3);
        assert_eq!(result.retry_after_seconds, 0.0);
    }

    #[test]
    fn retry_after_converts_to_seconds() {
        let outcome = BucketOutcome {
            state: BucketState {
                tokens: 0.0,
                last_update_ms: 0,
            },
            allowed: false,
            retry_after_ms: 2_000,
            ttl_ms: 1,
        };
        let result = outcome.to_allow_result();
        assert_eq!(result.retry_after_seconds, 2.0);
        assert_eq!(result.retry_after(), Duration::from_secs(2));
        assert_eq!(result.retry_after_header(), 2);
    }

    #[test]
    fn bucket_state_json_shape() {
        let state = BucketState {
            tokens: 9.5,
            last_update_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"tokens":9.5,"last_update_ms":1700000000000}"#);
    }

    #[test]
    fn admission_classification() {
        assert!(Admission::Allowed { tokens_remaining: 0 }.is_admitted());
        assert!(Admission::FailedOpen { reason: "down".into() }.is_admitted());
        assert!(!Admission::Denied { retry_after_seconds: 1.0 }.is_admitted());
        assert!(!Admission::FailedClosed { reason: "down".into() }.is_admitted());
        assert!(!Admission::Rejected { reason: "bad".into() }.is_admitted());
    }
}

use crate::config::TokenBucketPolicy;
use crate::types::BucketOutcome;
use crate::types::BucketState;

/// Tokens consumed by one admitted request.
const TOKENS_PER_REQUEST: f64 = 1.0;

const MAX_RETRY_NUDGES: u32 = 4;

// ============================================================================
// Refill
// ============================================================================

/// Tokens available after refilling from `last_update_ms` to `now_ms`.
///
/// A clock that moved backwards contributes no refill. The result never
/// exceeds `capacity`.
#[inline]
pub fn calculate_replenished_tokens(
    current_tokens: f64,
    last_update_ms: u64,
    now_ms: u64,
    refill_rate: f64,
    capacity: u64,
) -> f64 {
    let elapsed_ms = now_ms.saturating_sub(last_update_ms);
    let elapsed_secs = elapsed_ms as f64 / 1000.0;
    let replenished = elapsed_secs * refill_rate;
    (current_tokens.max(0.0) + replenished).min(capacity as f64)
}

// ============================================================================
// Availability
// ============================================================================

/// Outcome of trying to take one token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenAvailability {
    /// A token was taken.
    Available {
        /// Tokens left after the debit.
        remaining: f64,
    },
    /// Fewer than one token available.
    Exhausted {
        /// Milliseconds until one full token has accrued.
        retry_after_ms: u64,
    },
}

impl TokenAvailability {
    #[inline]
    pub fn is_available(&self) -> bool {
        matches!(self, TokenAvailability::Available { .. })
    }
}

/// Try to take one token from `available`.
#[inline]
pub fn check_token_availability(available: f64, refill_rate: f64) -> TokenAvailability {
    if available >= TOKENS_PER_REQUEST {
        TokenAvailability::Available {
            remaining: available - TOKENS_PER_REQUEST,
        }
    } else {
        TokenAvailability::Exhausted {
            retry_after_ms: compute_retry_after_ms(available, refill_rate),
        }
    }
}

/// Milliseconds until `tokens` grows to one whole token, rounded up.
///
/// A non-positive refill rate never recovers and yields `u64::MAX`.
#[inline]
pub fn compute_retry_after_ms(tokens: f64, refill_rate: f64) -> u64 {
    let need = TOKENS_PER_REQUEST - tokens;
    if need <= 0.0 {
        return 0;
    }
    if refill_rate <= 0.0 {
        return u64::MAX;
    }
    // Float -> int casts saturate, so an enormous wait clamps to u64::MAX.
    let mut retry_ms = ((need / refill_rate) * 1000.0).ceil() as u64;
    // Rounding can leave the refill a hair short of one token; nudge forward so
    // waiting exactly `retry_ms` always admits under the same arithmetic.
    for _ in 0..MAX_RETRY_NUDGES {
        let refilled = tokens + (retry_ms as f64 / 1000.0) * refill_rate;
        if refilled >= TOKENS_PER_REQUEST || retry_ms == u64::MAX {
            break;
        }
        retry_ms += 1;
    }
    retry_ms
}

// ============================================================================
// Expiry
// ============================================================================

/// Key expiry: twice the time to refill a bucket from empty to `capacity`.
#[inline]
pub fn compute_idle_ttl_ms(capacity: u64, refill_rate: f64) -> u64 {
    if refill_rate <= 0.0 {
        return u64::MAX;
    }
    let refill_from_empty_ms = ((capacity as f64 / refill_rate) * 1000.0).ceil() as u64;
    refill_from_empty_ms.saturating_mul(2)
}

/// `Retry-After` header value in whole seconds, rounded up and at least 1.
///
/// Rounding up keeps a client that honors the header from arriving before
/// the bucket holds a token.
#[inline]
pub fn retry_after_header_secs(retry_after_seconds: f64) -> u64 {
    let secs = retry_after_seconds.ceil();
    if secs.is_nan() || secs < 1.0 { 1 } else { secs as u64 }
}

// ============================================================================
// Full decision
// ============================================================================

/// One complete limiter step: refill, debit or deny, and the state to store.
///
/// `stored` is `None` for a fresh or expired key, which starts full. The
/// returned state is written back whether or not the request was admitted,
/// so refill progress made during a denial is kept. Its timestamp never moves
/// backwards, which keeps a lagging caller clock from crediting the same
/// interval twice.
pub fn evaluate_bucket(stored: Option<BucketState>, policy: &TokenBucketPolicy, now_ms: u64) -> BucketOutcome {
    let capacity = policy.capacity();
    let refill_rate = policy.refill_rate();

    let current = stored.unwrap_or_else(|| BucketState::full(capacity, now_ms));
    let available =
        calculate_replenished_tokens(current.tokens, current.last_update_ms, now_ms, refill_rate, capacity);

    let (tokens, allowed, retry_after_ms) = match check_token_availability(available, refill_rate) {
        TokenAvailability::Available { remaining } => (remaining, true, 0),
        TokenAvailability::Exhausted { retry_after_ms } => (available, false, retry_after_ms),
    };

    BucketOutcome {
        state: BucketState {
            tokens,
            last_update_ms: current.last_update_ms.max(now_ms),
        },
        allowed,
        retry_after_ms,
        ttl_ms: compute_idle_ttl_ms(capacity, refill_rate),
    }
}


#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    use super::*;

    fn policies() -> impl Strategy<Value = TokenBucketPolicy> {
        (1u64..1_000, 0.01f64..1_000.0).prop_map(|(capacity, rate)| TokenBucketPolicy::new(capacity, rate).unwrap())
    }

    fn states() -> impl Strategy<Value = Option<BucketState>> {
        proptest::option::of((0.0f64..2_000.0, 0u64..10_000_000).prop_map(|(tokens, last_update_ms)| BucketState {
            tokens,
            last_update_ms,
        }))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn stored_tokens_stay_within_bounds(
            policy in policies(),
            stored in states(),
            now_ms in 0u64..20_000_000,
        ) {
            let outcome = evaluate_bucket(stored, &policy, now_ms);
            prop_assert!(outcome.state.tokens >= 0.0);
            prop_assert!(outcome.state.tokens <= policy.capacity() as f64);
        }

        #[test]
        fn replenish_is_monotonic_in_time(
            base in 0u64..1_000_000,
            d1 in 0u64..1_000_000,
            d2 in 0u64..1_000_000,
            rate in 0.01f64..100.0,
        ) {
            let a = calculate_replenished_tokens(0.0, base, base + d1, rate, 100);
            let b = calculate_replenished_tokens(0.0, base, base + d1 + d2, rate, 100);
            prop_assert!(b >= a);
        }

        #[test]
        fn denial_carries_positive_retry(
            policy in policies(),
            stored in states(),
            now_ms in 0u64..20_000_000,
        ) {
            let outcome = evaluate_bucket(stored, &policy, now_ms);
            if outcome.allowed {
                prop_assert_eq!(outcome.retry_after_ms, 0);
            } else {
                prop_assert!(outcome.retry_after_ms > 0);
            }
        }

        #[test]
        fn waiting_retry_after_admits(
            capacity in 1u64..100,
            rate in 0.05f64..50.0,
            tokens in 0.0f64..0.999,
            start in 0u64..1_000_000,
        ) {
            let policy = TokenBucketPolicy::new(capacity, rate).unwrap();
            let stored = BucketState { tokens, last_update_ms: start };
            let denied = evaluate_bucket(Some(stored), &policy, start);
            prop_assert!(!denied.allowed);

            let retried = evaluate_bucket(Some(denied.state), &policy, start + denied.retry_after_ms);
            prop_assert!(retried.allowed);
        }

        #[test]
        fn idle_ttl_covers_twice_refill_time(policy in policies()) {
            let ttl_secs = policy.idle_ttl_ms() as f64 / 1000.0;
            let refill_secs = policy.capacity() as f64 / policy.refill_rate();
            prop_assert!(ttl_secs >= 2.0 * refill_secs);
        }
    }
}

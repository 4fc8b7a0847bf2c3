//! Pure token bucket arithmetic.
//!
//! Everything the limiter decides is computed here from explicit inputs: the
//! stored state, the policy, and the current time. No I/O, no clock reads. The
//! store seams ([`crate::LocalBucketStore`], [`crate::CasBucketStore`]) only
//! provide atomicity around [`evaluate_bucket`].
//!
//! # Tiger Style
//!
//! - Saturating arithmetic on timestamps
//! - Time passed as a parameter
//! - Total functions: no panics for any finite input

mod token_bucket;

pub use token_bucket::TokenAvailability;
pub use token_bucket::calculate_replenished_tokens;
pub use token_bucket::check_token_availability;
pub use token_bucket::compute_idle_ttl_ms;
pub use token_bucket::compute_retry_after_ms;
pub use token_bucket::evaluate_bucket;
pub use token_bucket::retry_after_header_secs;

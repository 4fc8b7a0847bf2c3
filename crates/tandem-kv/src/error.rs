//! Key-value store errors.

use snafu::Snafu;

/// Errors returned by [`crate::KeyValueStore`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum KeyValueStoreError {
    /// Key does not exist.
    #[snafu(display("key '{key}' not found"))]
    NotFound { key: String },

    /// Generic backend failure.
    #[snafu(display("operation failed: {reason}"))]
    Failed { reason: String },

    /// Backend could not be reached.
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable { reason: String },

    /// Backend did not answer in time. The write may or may not have applied.
    #[snafu(display("operation timed out after {duration_ms}ms"))]
    Timeout { duration_ms: u64 },

    /// Compare-and-swap precondition did not hold.
    #[snafu(display("compare-and-swap failed for key '{key}': expected {expected:?}, found {actual:?}"))]
    CompareAndSwapFailed {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[snafu(display("key size {size} exceeds maximum of {max} bytes"))]
    KeyTooLarge { size: usize, max: u32 },

    #[snafu(display("value size {size} exceeds maximum of {max} bytes"))]
    ValueTooLarge { size: usize, max: u32 },

    #[snafu(display("key must not be empty"))]
    EmptyKey,
}

impl KeyValueStoreError {
    /// Whether this error reflects a lost optimistic race rather than a fault.
    pub fn is_cas_conflict(&self) -> bool {
        matches!(self, KeyValueStoreError::CompareAndSwapFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = KeyValueStoreError::NotFound { key: "rl:k".into() };
        assert_eq!(err.to_string(), "key 'rl:k' not found");
    }

    #[test]
    fn timeout_display() {
        let err = KeyValueStoreError::Timeout { duration_ms: 2000 };
        assert_eq!(err.to_string(), "operation timed out after 2000ms");
    }

    #[test]
    fn cas_conflict_is_classified() {
        let err = KeyValueStoreError::CompareAndSwapFailed {
            key: "k".into(),
            expected: None,
            actual: Some("v".into()),
        };
        assert!(err.is_cas_conflict());
        assert!(!KeyValueStoreError::Unavailable { reason: "down".into() }.is_cas_conflict());
    }
}

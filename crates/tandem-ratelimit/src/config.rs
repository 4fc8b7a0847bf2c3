//! Limiter policy and configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::constants::DEFAULT_KEY_PREFIX;
use crate::constants::DEFAULT_STORE_TIMEOUT_MS;
use crate::error::ConfigError;
use crate::pure::compute_idle_ttl_ms;

/// What [`crate::TokenBucket::admit`] does when the store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reject the request. Outages surface as server errors, never as 429s.
    #[default]
    Closed,
    /// Let the request through and log a warning.
    Open,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "closed" | "fail-closed" | "fail_closed" => Ok(FailurePolicy::Closed),
            "open" | "fail-open" | "fail_open" => Ok(FailurePolicy::Open),
            _ => Err(ConfigError::UnknownFailurePolicy { value: s.to_string() }),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Closed => f.write_str("closed"),
            FailurePolicy::Open => f.write_str("open"),
        }
    }
}

/// Validated bucket shape: burst capacity and steady refill rate.
///
/// Only constructible through [`TokenBucketPolicy::new`], so every policy in
/// circulation has `capacity > 0` and a positive finite `refill_rate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketPolicy {
    capacity: u64,
    refill_rate: f64,
}

impl TokenBucketPolicy {
    pub fn new(capacity: u64, refill_rate: f64) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::InvalidCapacity { capacity });
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(ConfigError::InvalidRefillRate { refill_rate });
        }
        Ok(Self { capacity, refill_rate })
    }

    /// Maximum tokens (burst size).
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Expiry applied to a bucket key on every access.
    pub fn idle_ttl_ms(&self) -> u64 {
        compute_idle_ttl_ms(self.capacity, self.refill_rate)
    }
}

/// Full configuration of one [`crate::TokenBucket`] instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum tokens (burst capacity).
    pub capacity: u64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Namespace prepended to every bucket key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Behavior of [`crate::TokenBucket::admit`] on store failure.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Bound on one store call, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

impl TokenBucketConfig {
    /// Create a config with the given burst capacity and refill rate per second.
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            key_prefix: default_key_prefix(),
            failure_policy: FailurePolicy::default(),
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }

    /// Create a config with the rate expressed per minute.
    pub fn per_minute(rate_per_minute: u32, burst: u64) -> Self {
        Self::new(burst, rate_per_minute as f64 / 60.0)
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Bound each store call. Sub-millisecond remainders round up.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout_ms = u64::try_from(timeout.as_micros().div_ceil(1_000)).unwrap_or(u64::MAX);
        self
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Check every field, returning the bucket policy on success.
    pub fn validate(&self) -> Result<TokenBucketPolicy, ConfigError> {
        let policy = TokenBucketPolicy::new(self.capacity, self.refill_rate)?;
        validate_key_prefix(&self.key_prefix)?;
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::InvalidStoreTimeout);
        }
        Ok(policy)
    }
}

fn validate_key_prefix(prefix: &str) -> Result<(), ConfigError> {
    let reason = if prefix.is_empty() {
        "must not be empty"
    } else if prefix.chars().any(|c| c.is_whitespace() || c.is_control()) {
        "must not contain whitespace"
    } else if prefix.contains('{') || prefix.contains('}') {
        "must not contain hash-tag braces"
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidKeyPrefix {
        prefix: prefix.to_string(),
        reason: reason.to_string(),
    })
}

//! Write request types.

use serde::Deserialize;
use serde::Serialize;

/// Commands that modify key-value state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteCommand {
    /// Set a key with no expiry.
    Set { key: String, value: String },
    /// Atomically replace the value if the current value equals `expected`.
    ///
    /// `expected: None` means "key must be absent (or expired)". When `ttl_ms`
    /// is set, the key's expiry is refreshed in the same atomic step.
    CompareAndSwap {
        key: String,
        expected: Option<String>,
        new_value: String,
        ttl_ms: Option<u64>,
    },
}

impl WriteCommand {
    /// Key targeted by this command.
    pub fn key(&self) -> &str {
        match self {
            WriteCommand::Set { key, .. } | WriteCommand::CompareAndSwap { key, .. } => key,
        }
    }
}

/// Request to perform a write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteRequest {
    pub command: WriteCommand,
}

impl WriteRequest {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::Set {
                key: key.into(),
                value: value.into(),
            },
        }
    }

    pub fn compare_and_swap(
        key: impl Into<String>,
        expected: Option<String>,
        new_value: impl Into<String>,
        ttl_ms: Option<u64>,
    ) -> Self {
        Self {
            command: WriteCommand::CompareAndSwap {
                key: key.into(),
                expected,
                new_value: new_value.into(),
                ttl_ms,
            },
        }
    }
}

/// Result of a write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WriteResult {
    /// Store revision assigned to this write.
    pub revision: u64,
    /// Absolute expiry of the written key, if it carries a TTL.
    pub expires_at_ms: Option<u64>,
}

//! Read request types.

use serde::Deserialize;
use serde::Serialize;

/// Request to read a single key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRequest {
    pub key: String,
}

impl ReadRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// A stored value with its modification revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValueWithRevision {
    pub key: String,
    pub value: String,
    /// Store-wide revision of the last write to this key.
    pub mod_revision: u64,
    /// Absolute expiry (Unix ms), if the key carries a TTL.
    pub expires_at_ms: Option<u64>,
}

/// Response from a read. `kv` is `None` when the key is absent or expired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadResult {
    pub kv: Option<KeyValueWithRevision>,
}

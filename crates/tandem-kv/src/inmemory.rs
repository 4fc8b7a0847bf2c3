//! In-memory [`KeyValueStore`] with TTL support.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tandem_time::SystemTimeProvider;
use tandem_time::TimeProvider;
use tokio::sync::RwLock;
use tracing::trace;

use crate::constants::EXPIRY_SWEEP_INTERVAL;
use crate::constants::MAX_KEY_SIZE;
use crate::constants::MAX_VALUE_SIZE;
use crate::error::KeyValueStoreError;
use crate::read::KeyValueWithRevision;
use crate::read::ReadRequest;
use crate::read::ReadResult;
use crate::traits::KeyValueStore;
use crate::write::WriteCommand;
use crate::write::WriteRequest;
use crate::write::WriteResult;

#[derive(Clone)]
struct StoredValue {
    value: String,
    revision: u64,
    expires_at_ms: Option<u64>,
}

impl StoredValue {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|deadline| now_ms < deadline)
    }
}

/// A deterministic in-memory key-value store.
///
/// Every command runs under a single write lock, so compare-and-swap is
/// linearizable. Expired keys are invisible to reads and CAS preconditions.
/// They are overwritten by the next write to the same key, and every
/// [`EXPIRY_SWEEP_INTERVAL`] writes the whole map is swept, so keys that are
/// never touched again do not accumulate.
pub struct DeterministicKeyValueStore {
    data: RwLock<BTreeMap<String, StoredValue>>,
    revision: AtomicU64,
    writes: AtomicU64,
    time: Arc<dyn TimeProvider>,
}

impl Default for DeterministicKeyValueStore {
    fn default() -> Self {
        Self::with_time_inner(Arc::new(SystemTimeProvider))
    }
}

impl DeterministicKeyValueStore {
    /// Create a store on the system clock, wrapped in `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a store whose TTLs are measured against `time`.
    pub fn with_time(time: Arc<dyn TimeProvider>) -> Arc<Self> {
        Arc::new(Self::with_time_inner(time))
    }

    fn with_time_inner(time: Arc<dyn TimeProvider>) -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            time,
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Milliseconds until `key` expires. `None` if absent, expired, or persistent.
    pub async fn ttl_remaining_ms(&self, key: &str) -> Option<u64> {
        let now_ms = self.time.now_unix_ms();
        let data = self.data.read().await;
        data.get(key)
            .filter(|v| v.is_live(now_ms))
            .and_then(|v| v.expires_at_ms)
            .map(|deadline| deadline.saturating_sub(now_ms))
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now_ms = self.time.now_unix_ms();
        self.data.read().await.values().filter(|v| v.is_live(now_ms)).count()
    }

    /// Whether the store holds no live keys.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Entries physically held, including expired ones not yet swept.
    pub async fn stored_len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Drop every expired key, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now_ms = self.time.now_unix_ms();
        let mut data = self.data.write().await;
        sweep(&mut data, now_ms)
    }
}

fn sweep(data: &mut BTreeMap<String, StoredValue>, now_ms: u64) -> usize {
    let before = data.len();
    data.retain(|_, v| v.is_live(now_ms));
    before - data.len()
}

fn validate_key(key: &str) -> Result<(), KeyValueStoreError> {
    if key.is_empty() {
        return Err(KeyValueStoreError::EmptyKey);
    }
    if key.len() > MAX_KEY_SIZE as usize {
        return Err(KeyValueStoreError::KeyTooLarge {
            size: key.len(),
            max: MAX_KEY_SIZE,
        });
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<(), KeyValueStoreError> {
    if value.len() > MAX_VALUE_SIZE as usize {
        return Err(KeyValueStoreError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for DeterministicKeyValueStore {
    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        validate_key(&request.key)?;
        let now_ms = self.time.now_unix_ms();
        let data = self.data.read().await;
        let kv = data.get(&request.key).filter(|v| v.is_live(now_ms)).map(|v| KeyValueWithRevision {
            key: request.key.clone(),
            value: v.value.clone(),
            mod_revision: v.revision,
            expires_at_ms: v.expires_at_ms,
        });
        Ok(ReadResult { kv })
    }

    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        validate_key(request.command.key())?;
        let now_ms = self.time.now_unix_ms();
        let mut data = self.data.write().await;

        let (key, value, expires_at_ms) = match request.command {
            WriteCommand::Set { key, value } => (key, value, None),
            WriteCommand::CompareAndSwap {
                key,
                expected,
                new_value,
                ttl_ms,
            } => {
                let actual = data.get(&key).filter(|v| v.is_live(now_ms)).map(|v| v.value.clone());
                if actual != expected {
                    trace!(key = %key, "compare-and-swap precondition failed");
                    return Err(KeyValueStoreError::CompareAndSwapFailed { key, expected, actual });
                }
                (key, new_value, ttl_ms.map(|ttl| now_ms.saturating_add(ttl)))
            }
        };

        validate_value(&value)?;
        let revision = self.next_revision();
        data.insert(key, StoredValue {
            value,
            revision,
            expires_at_ms,
        });

        if self.writes.fetch_add(1, Ordering::Relaxed) % EXPIRY_SWEEP_INTERVAL == EXPIRY_SWEEP_INTERVAL - 1 {
            let removed = sweep(&mut data, now_ms);
            trace!(removed, "swept expired keys");
        }

        Ok(WriteResult { revision, expires_at_ms })
    }
}

use async_trait::async_trait;

use crate::error::KeyValueStoreError;
use crate::read::ReadRequest;
use crate::read::ReadResult;
use crate::write::WriteRequest;
use crate::write::WriteResult;

/// Shared key-value store.
///
/// Implementations must apply each [`crate::WriteCommand`] atomically with
/// respect to other commands on the same key. Compare-and-swap is the only
/// primitive the rate limiter relies on for correctness.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Apply a write command.
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError>;

    /// Read a key. Absent and expired keys yield `kv: None`.
    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        (**self).write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        (**self).read(request).await
    }
}

//! Fault injection wrapper for exercising store outages.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::KeyValueStoreError;
use crate::read::ReadRequest;
use crate::read::ReadResult;
use crate::traits::KeyValueStore;
use crate::write::WriteRequest;
use crate::write::WriteResult;

/// How a [`FaultInjectingStore`] treats incoming calls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FaultMode {
    /// Forward to the inner store.
    #[default]
    Healthy,
    /// Fail every call with [`KeyValueStoreError::Unavailable`].
    Unavailable { reason: String },
    /// Never answer. Callers must bound the call with their own timeout.
    Hang,
}

/// Wraps a store and fails or stalls calls on demand.
pub struct FaultInjectingStore<S> {
    inner: S,
    mode: Mutex<FaultMode>,
    calls: AtomicU64,
}

impl<S: KeyValueStore> FaultInjectingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            mode: Mutex::new(FaultMode::Healthy),
            calls: AtomicU64::new(0),
        }
    }

    /// Switch fault mode for subsequent calls.
    pub fn set_mode(&self, mode: FaultMode) {
        *self.mode.lock() = mode;
    }

    /// Total calls observed, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn gate(&self) -> Result<(), KeyValueStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = self.mode.lock().clone();
        match mode {
            FaultMode::Healthy => Ok(()),
            FaultMode::Unavailable { reason } => Err(KeyValueStoreError::Unavailable { reason }),
            FaultMode::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl<S: KeyValueStore> KeyValueStore for FaultInjectingStore<S> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        self.gate().await?;
        self.inner.write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        self.gate().await?;
        self.inner.read(request).await
    }
}

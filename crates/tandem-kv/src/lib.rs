//! Key-value store interface shared by Tandem components.
//!
//! The rate limiter never owns its backing store: it is handed an
//! `Arc<dyn KeyValueStore>` (or a concrete implementation) and issues
//! compare-and-swap writes against it. This crate defines that seam:
//!
//! - [`KeyValueStore`] - async read / write over string keys
//! - [`WriteCommand`] - unconditional set and compare-and-swap with TTL
//! - [`KeyValueStoreError`] - failures, with CAS conflicts kept distinct
//! - [`DeterministicKeyValueStore`] - in-memory implementation honoring TTLs
//! - [`FaultInjectingStore`] - wrapper that simulates outages and hangs
//!
//! TTLs are expressed in milliseconds and measured against an injected
//! [`tandem_time::TimeProvider`], so expiry is reproducible in tests.

mod constants;
mod error;
mod fault;
mod inmemory;
mod read;
mod traits;
mod write;

pub use constants::EXPIRY_SWEEP_INTERVAL;
pub use constants::MAX_KEY_SIZE;
pub use constants::MAX_VALUE_SIZE;
pub use error::KeyValueStoreError;
pub use fault::FaultInjectingStore;
pub use fault::FaultMode;
pub use inmemory::DeterministicKeyValueStore;
pub use read::KeyValueWithRevision;
pub use read::ReadRequest;
pub use read::ReadResult;
pub use traits::KeyValueStore;
pub use write::WriteCommand;
pub use write::WriteRequest;
pub use write::WriteResult;

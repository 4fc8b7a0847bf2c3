/// Maximum key length in bytes accepted by store implementations.
pub const MAX_KEY_SIZE: u32 = 1024;

/// Maximum value length in bytes accepted by store implementations.
pub const MAX_VALUE_SIZE: u32 = 1024 * 1024;

/// [`crate::DeterministicKeyValueStore`] drops expired keys once every this many writes.
pub const EXPIRY_SWEEP_INTERVAL: u64 = 1_024;

const _: () = assert!(EXPIRY_SWEEP_INTERVAL > 0);

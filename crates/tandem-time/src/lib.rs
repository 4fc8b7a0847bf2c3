//! Wall-clock access for token bucket refill.
//!
//! Bucket refill is computed from Unix milliseconds, so every component that
//! touches bucket state reads time through [`TimeProvider`]. Production code
//! uses [`SystemTimeProvider`]; tests enable the `simulation` feature and drive
//! a [`SimulatedTimeProvider`] by hand so refill is reproducible.
//!
//! # Tiger Style
//!
//! - No `.expect()` or `.unwrap()`: a clock before the epoch reads as 0
//! - Millisecond resolution everywhere, stored as `u64`

#[cfg(feature = "simulation")]
use std::sync::Arc;
#[cfg(feature = "simulation")]
use std::sync::atomic::AtomicU64;
#[cfg(feature = "simulation")]
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Current Unix timestamp in milliseconds, 0 if the clock predates the epoch.
#[inline]
pub fn current_time_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Source of Unix millisecond timestamps.
pub trait TimeProvider: Send + Sync {
    /// Current Unix timestamp in milliseconds.
    fn now_unix_ms(&self) -> u64;
}

impl<T: TimeProvider + ?Sized> TimeProvider for std::sync::Arc<T> {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        (**self).now_unix_ms()
    }
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        current_time_ms()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying counter, so a test can hand one clone to a
/// store and another to a limiter and advance both at once.
///
/// ```ignore
/// let time = SimulatedTimeProvider::new(1_000_000);
/// time.advance_ms(2_000);
/// assert_eq!(time.now_unix_ms(), 1_002_000);
/// ```
#[cfg(feature = "simulation")]
#[derive(Debug, Clone)]
pub struct SimulatedTimeProvider {
    now_ms: Arc<AtomicU64>,
}

#[cfg(feature = "simulation")]
impl SimulatedTimeProvider {
    /// Start the clock at `initial_ms`.
    pub fn new(initial_ms: u64) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(initial_ms)),
        }
    }

    /// Start the clock at the current system time.
    pub fn from_system_time() -> Self {
        Self::new(current_time_ms())
    }

    /// Move the clock forward.
    pub fn advance_ms(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Move the clock forward by whole seconds.
    pub fn advance_secs(&self, delta_secs: u64) {
        self.advance_ms(delta_secs.saturating_mul(1000));
    }

    /// Jump to an absolute timestamp (may move backwards).
    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

#[cfg(feature = "simulation")]
impl Default for SimulatedTimeProvider {
    fn default() -> Self {
        Self::from_system_time()
    }
}

#[cfg(feature = "simulation")]
impl TimeProvider for SimulatedTimeProvider {
    #[inline]
    fn now_unix_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_time_ms_is_after_2020() {
        let year_2020_ms = 1_577_836_800_000u64;
        assert!(current_time_ms() > year_2020_ms);
    }

    #[test]
    fn system_provider_tracks_system_clock() {
        let before = current_time_ms();
        let now = SystemTimeProvider.now_unix_ms();
        let after = current_time_ms();
        assert!(now >= before && now <= after);
    }

    #[test]
    fn arc_provider_delegates() {
        let provider: std::sync::Arc<dyn TimeProvider> = std::sync::Arc::new(SystemTimeProvider);
        assert!(provider.now_unix_ms() > 0);
    }
}

#[cfg(all(test, feature = "simulation"))]
mod simulation_tests {
    use super::*;

    #[test]
    fn simulated_clock_advances() {
        let time = SimulatedTimeProvider::new(1_000_000);
        time.advance_ms(500);
        time.advance_secs(2);
        assert_eq!(time.now_unix_ms(), 1_002_500);
    }

    #[test]
    fn simulated_clock_can_move_backwards() {
        let time = SimulatedTimeProvider::new(5_000);
        time.set_ms(1_000);
        assert_eq!(time.now_unix_ms(), 1_000);
    }

    #[test]
    fn clones_share_the_counter() {
        let a = SimulatedTimeProvider::new(0);
        let b = a.clone();
        a.advance_ms(42);
        assert_eq!(b.now_unix_ms(), 42);
    }
}

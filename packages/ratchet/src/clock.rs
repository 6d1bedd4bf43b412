//! Injectable time sources.
//!
//! Every piece of time math in ratchet goes through a [`Clock`]: the scheduler
//! asks it for "now", action timeouts race against its `sleep`, and the driver
//! waits on it between ticks. Nothing in the crate reads the OS clock directly.
//!
//! Two implementations ship with the crate:
//!
//! - [`SystemClock`]: production clock built on tokio's time driver. Under
//!   `#[tokio::test(start_paused = true)]` it follows tokio's paused clock, so
//!   wall-clock tests stay deterministic too.
//! - [`ManualClock`]: a controllable clock whose time only moves when the test
//!   calls [`ManualClock::advance`]. Sleeps registered on it complete once the
//!   clock has been advanced past their deadline.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ratchet::{Clock, ManualClock};
//!
//! let clock = ManualClock::new();
//! assert_eq!(clock.now().as_millis(), 0);
//!
//! clock.advance(Duration::from_millis(250));
//! assert_eq!(clock.now().as_millis(), 250);
//! ```

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;

// =============================================================================
// Timestamp
// =============================================================================

/// A monotonic instant, measured as the offset from the clock's origin.
///
/// Timestamps are only comparable when they come from the same clock.
/// They serialize as integer microseconds so that status and history output
/// is byte-stable under a controlled clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// The clock origin.
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    /// Build a timestamp from an offset since the clock origin.
    pub const fn from_offset(offset: Duration) -> Self {
        Self(offset)
    }

    /// Build a timestamp from milliseconds since the clock origin.
    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Offset since the clock origin.
    pub const fn offset(&self) -> Duration {
        self.0
    }

    /// Whole milliseconds since the clock origin.
    pub fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }

    /// Whole microseconds since the clock origin.
    pub fn as_micros(&self) -> u128 {
        self.0.as_micros()
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0.as_millis())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let micros = u64::try_from(self.0.as_micros()).unwrap_or(u64::MAX);
        serializer.serialize_u64(micros)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let micros = u64::deserialize(deserializer)?;
        Ok(Timestamp(Duration::from_micros(micros)))
    }
}

// =============================================================================
// Clock Trait
// =============================================================================

/// A source of monotonic time and cooperative sleeps.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// The current instant. Never goes backwards.
    fn now(&self) -> Timestamp;

    /// Suspend until at least `duration` has elapsed on this clock.
    async fn sleep(&self, duration: Duration);
}

// =============================================================================
// System Clock
// =============================================================================

/// Production clock backed by tokio's time driver.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    /// Create a clock whose origin is the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(tokio::time::Instant::now().saturating_duration_since(self.origin))
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// =============================================================================
// Manual Clock
// =============================================================================

/// A clock that only moves when told to.
///
/// Cloning shares the underlying time, so a test can keep one handle and give
/// another to the orchestrator.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<watch::Sender<Duration>>,
}

impl ManualClock {
    /// Create a clock at the origin.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Duration::ZERO);
        Self {
            now: Arc::new(sender),
        }
    }

    /// Move time forward by `step`, waking every sleeper whose deadline passed.
    pub fn advance(&self, step: Duration) {
        self.now.send_modify(|now| *now = now.saturating_add(step));
    }

    /// Move time forward to `target`. Targets in the past are ignored.
    pub fn advance_to(&self, target: Timestamp) {
        self.now.send_if_modified(|now| {
            if target.0 > *now {
                *now = target.0;
                true
            } else {
                false
            }
        });
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(*self.now.borrow())
    }

    async fn sleep(&self, duration: Duration) {
        let mut receiver = self.now.subscribe();
        let deadline = receiver.borrow().saturating_add(duration);
        loop {
            if *receiver.borrow_and_update() >= deadline {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn timestamp_arithmetic_saturates() {
        let early = Timestamp::from_millis(100);
        let late = Timestamp::from_millis(250);

        assert_eq!(late - early, Duration::from_millis(150));
        assert_eq!(early - late, Duration::ZERO);
        assert_eq!(early + Duration::from_millis(150), late);
    }

    #[test]
    fn timestamp_serializes_as_micros() {
        let ts = Timestamp::from_millis(12);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "12000");

        let back: Timestamp = serde_json::from_str("12000").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn manual_clock_only_moves_on_advance() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Timestamp::ZERO);

        clock.advance(Duration::from_millis(10));
        clock.advance(Duration::from_millis(15));
        assert_eq!(clock.now(), Timestamp::from_millis(25));

        clock.advance_to(Timestamp::from_millis(5));
        assert_eq!(clock.now(), Timestamp::from_millis(25));
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();

        clock.advance(Duration::from_millis(40));
        assert_eq!(other.now(), Timestamp::from_millis(40));
    }

    #[tokio::test]
    async fn manual_sleep_completes_after_deadline() {
        let clock = ManualClock::new();
        let mut sleep = Box::pin(clock.sleep(Duration::from_millis(100)));

        assert!((&mut sleep).now_or_never().is_none());

        clock.advance(Duration::from_millis(60));
        assert!((&mut sleep).now_or_never().is_none());

        clock.advance(Duration::from_millis(40));
        assert!((&mut sleep).now_or_never().is_some());
    }

    #[tokio::test]
    async fn manual_zero_sleep_is_immediate() {
        let clock = ManualClock::new();
        assert!(clock.sleep(Duration::ZERO).now_or_never().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn system_clock_follows_paused_tokio_time() {
        let clock = SystemClock::new();
        clock.sleep(Duration::from_secs(3)).await;

        assert_eq!(clock.now().as_millis(), 3000);
    }
}

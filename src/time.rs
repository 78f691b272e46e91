//! Monotonic time types.
//!
//! `std::time::Instant` can't be rewound, which the virtual time domain
//! (tests, deterministic replay) needs. `TimeTicks`/`TimeDelta` are plain
//! microsecond counters instead, backed by either a real monotonic clock
//! or a settable one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// A point in monotonic time, in microseconds since an arbitrary epoch.
/// Not comparable across `Clock` implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeTicks(i64);

impl TimeTicks {
    pub const fn zero() -> Self {
        TimeTicks(0)
    }

    pub const fn from_micros(micros: i64) -> Self {
        TimeTicks(micros)
    }

    pub const fn max() -> Self {
        TimeTicks(i64::MAX)
    }

    pub const fn is_max(self) -> bool {
        self.0 == i64::MAX
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub fn saturating_sub(self, other: TimeTicks) -> TimeDelta {
        TimeDelta(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Add<TimeDelta> for TimeTicks {
    type Output = TimeTicks;
    fn add(self, rhs: TimeDelta) -> TimeTicks {
        TimeTicks(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub<TimeDelta> for TimeTicks {
    type Output = TimeTicks;
    fn sub(self, rhs: TimeDelta) -> TimeTicks {
        TimeTicks(self.0.saturating_sub(rhs.0))
    }
}

/// A signed duration, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeDelta(i64);

impl TimeDelta {
    pub const fn zero() -> Self {
        TimeDelta(0)
    }

    pub const fn from_millis(millis: i64) -> Self {
        TimeDelta(millis * 1_000)
    }

    pub const fn from_secs(secs: i64) -> Self {
        TimeDelta(secs * 1_000_000)
    }

    pub const fn from_micros(micros: i64) -> Self {
        TimeDelta(micros)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// A source of monotonic time. `now()` is safe to call from any thread,
/// though in practice only the bound main thread and cross-thread post
/// paths (for computing a delayed task's absolute run time) call it.
pub trait Clock: Send + Sync {
    fn now(&self) -> TimeTicks;
}

/// Real monotonic clock, backed by `std::time::Instant`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> TimeTicks {
        TimeTicks::from_micros(self.origin.elapsed().as_micros() as i64)
    }
}

/// A settable clock for virtual time domains and deterministic tests.
pub struct VirtualClock {
    now: AtomicI64,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self { now: AtomicI64::new(0) }
    }

    pub fn set_now(&self, t: TimeTicks) {
        self.now.store(t.as_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, delta: TimeDelta) {
        self.now.fetch_add(delta.as_micros(), Ordering::SeqCst);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> TimeTicks {
        TimeTicks::from_micros(self.now.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_advances() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now(), TimeTicks::zero());
        clock.advance(TimeDelta::from_millis(10));
        assert_eq!(clock.now(), TimeTicks::from_micros(10_000));
        clock.set_now(TimeTicks::from_micros(5));
        assert_eq!(clock.now(), TimeTicks::from_micros(5));
    }

    #[test]
    fn time_ticks_arithmetic() {
        let t = TimeTicks::from_micros(100);
        let d = TimeDelta::from_micros(50);
        assert_eq!(t + d, TimeTicks::from_micros(150));
        assert_eq!((t + d).saturating_sub(t), d);
    }
}

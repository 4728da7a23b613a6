use std::{
    ops::Add,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

/// Elapsed process time as seen by a [`Clock`].
///
/// Ticks are only meaningful relative to each other: compare them by
/// subtraction with [`ClockTick::saturating_since`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockTick(Duration);

impl ClockTick {
    pub const ZERO: ClockTick = ClockTick(Duration::ZERO);

    pub fn from_elapsed(elapsed: Duration) -> Self {
        Self(elapsed)
    }
    /// Time elapsed between `earlier` and `self`, zero if `earlier` is later.
    pub fn saturating_since(&self, earlier: ClockTick) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
    /// Fractional milliseconds since the clock origin.
    pub fn as_millis_f64(&self) -> f64 {
        self.0.as_secs_f64() * 1000.0
    }
}

impl Add<Duration> for ClockTick {
    type Output = ClockTick;
    fn add(self, rhs: Duration) -> Self::Output {
        ClockTick(self.0 + rhs)
    }
}

/// Source of [`ClockTick`]s. Must never go backwards.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> ClockTick;
}

/// Default clock, backed by [`Instant`] so wall-clock adjustments have no effect.
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> ClockTick {
        ClockTick(self.origin.elapsed())
    }
}

/// Hand-driven clock. Clones share the same time, so a test can keep one
/// copy and give the other to the registry.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        // saturating add; fetch_update only fails if the closure returns None
        let _ = self
            .nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_add(by))
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> ClockTick {
        ClockTick(Duration::from_nanos(self.nanos.load(Ordering::Acquire)))
    }
}

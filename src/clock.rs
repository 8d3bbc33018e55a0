//! Injected monotonic clocks
//!
//! The throttler never reads wall-clock time on its own: every component
//! receives a [`TickClock`] so tests can drive time by hand with
//! [`ManualClock`] while production code uses [`MonotonicClock`].

#![forbid(unsafe_code)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use crate::time::{TimeDelta, TimeTicks};

/// Source of monotonic time for the scheduler.
pub trait TickClock: Send + Sync {
    /// Returns the current time.
    fn now_ticks(&self) -> TimeTicks;

    /// Returns the name of the clock implementation.
    fn name(&self) -> &'static str;
}

/// Wall-clock time on `std::time::Instant`, measured from construction.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Maps a tick value back onto an `Instant`.
    #[must_use]
    pub fn instant_at(&self, ticks: TimeTicks) -> Instant {
        let offset = ticks.since_origin();
        if offset.is_negative() {
            self.origin
        } else {
            self.origin + offset.to_std()
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for MonotonicClock {
    #[inline]
    fn now_ticks(&self) -> TimeTicks {
        TimeTicks::ORIGIN + TimeDelta::from(self.origin.elapsed())
    }

    fn name(&self) -> &'static str {
        "monotonic"
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: TimeTicks) -> Self {
        Self {
            now_us: AtomicI64::new(start.since_origin().as_micros()),
        }
    }

    /// Moves the clock forward by `delta`.
    ///
    /// # Panics
    ///
    /// Panics if `delta` is negative.
    pub fn advance(&self, delta: TimeDelta) {
        assert!(!delta.is_negative(), "ManualClock cannot move backwards, got {delta}");
        self.now_us.fetch_add(delta.as_micros(), Ordering::AcqRel);
    }

    /// Moves the clock forward by a `Duration`.
    pub fn advance_std(&self, duration: Duration) {
        self.advance(TimeDelta::from(duration));
    }

    /// Sets the clock to `now`.
    ///
    /// # Panics
    ///
    /// Panics if `now` is earlier than the current time.
    pub fn set(&self, now: TimeTicks) {
        let previous = self.now_us.swap(now.since_origin().as_micros(), Ordering::AcqRel);
        assert!(
            previous <= now.since_origin().as_micros(),
            "ManualClock cannot move backwards: {} -> {now}",
            TimeTicks::from_micros(previous)
        );
    }
}

impl TickClock for ManualClock {
    #[inline]
    fn now_ticks(&self) -> TimeTicks {
        TimeTicks::from_micros(self.now_us.load(Ordering::Acquire))
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

/// Reads the clock at most once and caches the result.
pub struct LazyNow<'a> {
    clock: &'a dyn TickClock,
    now: Option<TimeTicks>,
}

impl<'a> LazyNow<'a> {
    /// Defers reading `clock` until [`LazyNow::now`] is first called.
    pub fn new(clock: &'a dyn TickClock) -> Self {
        Self { clock, now: None }
    }

    /// Wraps an already known time.
    pub fn with_now(clock: &'a dyn TickClock, now: TimeTicks) -> Self {
        Self {
            clock,
            now: Some(now),
        }
    }

    /// Returns the cached time, reading the clock on first use.
    pub fn now(&mut self) -> TimeTicks {
        *self.now.get_or_insert_with(|| self.clock.now_ticks())
    }
}

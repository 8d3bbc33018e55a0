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
//! Time primitives for budget accounting
//!
//! Budget levels go negative ("debt"), which `std::time::Duration` cannot
//! represent, so the scheduler works on two signed microsecond types:
//!
//! - [`TimeTicks`]: a point on a monotonic clock, measured from the clock origin
//! - [`TimeDelta`]: a signed span between two ticks
//!
//! Scaling a delta by a floating point factor rounds to the nearest
//! microsecond and saturates at the `i64` range.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Rem, Sub, SubAssign};
use std::time::Duration;

use serde::Serialize;

const MICROS_PER_MILLI: i64 = 1_000;
const MICROS_PER_SECOND: i64 = 1_000_000;

/// Signed time span with microsecond resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TimeDelta(i64);

impl TimeDelta {
    /// Zero-length span.
    pub const ZERO: Self = Self(0);

    /// Largest representable span.
    pub const MAX: Self = Self(i64::MAX);

    /// Creates a span from microseconds.
    #[inline]
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Creates a span from milliseconds.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(MICROS_PER_MILLI))
    }

    /// Creates a span from whole seconds.
    #[inline]
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(MICROS_PER_SECOND))
    }

    /// Creates a span from fractional seconds, rounded to the nearest microsecond.
    #[inline]
    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self::from_micros_f64(secs * MICROS_PER_SECOND as f64)
    }

    /* `as` saturates and maps NaN to zero */
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn from_micros_f64(micros: f64) -> Self {
        Self(micros.round() as i64)
    }

    /// Returns the span in microseconds.
    #[inline]
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Returns the span in milliseconds, truncated toward zero.
    #[inline]
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0 / MICROS_PER_MILLI
    }

    /// Returns the span in fractional seconds.
    #[inline]
    #[must_use]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_SECOND as f64
    }

    /// Returns `true` for spans strictly below zero.
    #[inline]
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Returns `true` for the zero span.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Converts to a `Duration`, clamping negative spans to zero.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn to_std(self) -> Duration {
        Duration::from_micros(self.0.max(0) as u64)
    }
}

impl From<Duration> for TimeDelta {
    fn from(duration: Duration) -> Self {
        Self(i64::try_from(duration.as_micros()).unwrap_or(i64::MAX))
    }
}

impl Add for TimeDelta {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for TimeDelta {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for TimeDelta {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for TimeDelta {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Neg for TimeDelta {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

impl Mul<f64> for TimeDelta {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: f64) -> Self {
        Self::from_micros_f64(self.0 as f64 * rhs)
    }
}

impl Mul<TimeDelta> for f64 {
    type Output = TimeDelta;

    #[inline]
    fn mul(self, rhs: TimeDelta) -> TimeDelta {
        rhs * self
    }
}

impl Div<f64> for TimeDelta {
    type Output = Self;

    #[inline]
    fn div(self, rhs: f64) -> Self {
        Self::from_micros_f64(self.0 as f64 / rhs)
    }
}

/* Euclidean remainder: always in `[0, rhs)` for positive `rhs` */
impl Rem for TimeDelta {
    type Output = Self;

    #[inline]
    fn rem(self, rhs: Self) -> Self {
        Self(self.0.rem_euclid(rhs.0))
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// Point on a monotonic clock, in microseconds since the clock origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TimeTicks(i64);

impl TimeTicks {
    /// The clock origin.
    pub const ORIGIN: Self = Self(0);

    /// Creates a tick value from microseconds since the origin.
    #[inline]
    #[must_use]
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Creates a tick value from whole seconds since the origin.
    #[inline]
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(MICROS_PER_SECOND))
    }

    /// Creates a tick value from milliseconds since the origin.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(MICROS_PER_MILLI))
    }

    /// Span between the origin and this point.
    #[inline]
    #[must_use]
    pub const fn since_origin(self) -> TimeDelta {
        TimeDelta(self.0)
    }
}

impl Add<TimeDelta> for TimeTicks {
    type Output = Self;

    #[inline]
    fn add(self, rhs: TimeDelta) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<TimeDelta> for TimeTicks {
    #[inline]
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl Sub<TimeDelta> for TimeTicks {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: TimeDelta) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Sub for TimeTicks {
    type Output = TimeDelta;

    #[inline]
    fn sub(self, rhs: Self) -> TimeDelta {
        TimeDelta(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for TimeTicks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{}", self.since_origin())
    }
}

use std::{
    fmt::Display,
    ops::{Add, Mul, Sub},
};

use format_num::format_num;
use serde::{Deserialize, Serialize};

use super::Float;

/// A duration of virtual time, in seconds.
#[derive(PartialEq, Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSpan(Float);

impl Eq for TimeSpan {}

impl PartialOrd for TimeSpan {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeSpan {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl TimeSpan {
    pub const ZERO: TimeSpan = TimeSpan(0.);
    pub const MIN: TimeSpan = TimeSpan(Float::MIN);
    pub const MAX: TimeSpan = TimeSpan(Float::MAX);

    #[must_use]
    pub const fn seconds(self) -> Float {
        self.0
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.0 < 0.
    }

    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.0 > 0.
    }
}

impl Display for TimeSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", format_num!(".3s", self.0))
    }
}

#[must_use]
pub const fn seconds(value: Float) -> TimeSpan {
    TimeSpan(value)
}

#[must_use]
pub fn milliseconds(value: Float) -> TimeSpan {
    seconds(value / 1000.)
}

impl Add for TimeSpan {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        TimeSpan(self.0 + rhs.0)
    }
}

impl Sub for TimeSpan {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        TimeSpan(self.0 - rhs.0)
    }
}

impl Mul<TimeSpan> for Float {
    type Output = TimeSpan;

    fn mul(self, rhs: TimeSpan) -> Self::Output {
        TimeSpan(self * rhs.0)
    }
}

//! Fixed-point seconds
//!
//! Every duration and temporal bound in the planner is normalized to
//! [`Seconds`] at the boundary: a millisecond fixed-point value with an
//! explicit infinity for unbounded constraints.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Millisecond fixed-point seconds.
///
/// `Seconds::INFINITY` and `Seconds::NEG_INFINITY` are sentinels kept far
/// enough from `i64::MAX` that adding two finite path lengths never overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "f64", try_from = "f64")]
pub struct Seconds(i64);

const MILLIS_PER_SEC: i64 = 1000;
const INF_MILLIS: i64 = i64::MAX / 4;

impl Seconds {
    pub const ZERO: Seconds = Seconds(0);
    pub const INFINITY: Seconds = Seconds(INF_MILLIS);
    pub const NEG_INFINITY: Seconds = Seconds(-INF_MILLIS);

    /// Build from whole milliseconds
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Build from whole seconds
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * MILLIS_PER_SEC)
    }

    /// Convert float seconds, rounding to the nearest millisecond.
    ///
    /// Returns `None` for NaN and for magnitudes past the infinity sentinel;
    /// `f64::INFINITY` maps to `Seconds::INFINITY`.
    pub fn try_from_secs_f64(secs: f64) -> Option<Self> {
        if secs.is_nan() {
            return None;
        }
        if secs == f64::INFINITY {
            return Some(Self::INFINITY);
        }
        if secs == f64::NEG_INFINITY {
            return Some(Self::NEG_INFINITY);
        }
        let millis = (secs * MILLIS_PER_SEC as f64).round();
        if millis.abs() >= INF_MILLIS as f64 {
            return None;
        }
        Some(Self(millis as i64))
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        if self.is_pos_infinite() {
            f64::INFINITY
        } else if self.is_neg_infinite() {
            f64::NEG_INFINITY
        } else {
            self.0 as f64 / MILLIS_PER_SEC as f64
        }
    }

    pub const fn is_pos_infinite(self) -> bool {
        self.0 >= INF_MILLIS
    }

    pub const fn is_neg_infinite(self) -> bool {
        self.0 <= -INF_MILLIS
    }

    pub const fn is_finite(self) -> bool {
        !self.is_pos_infinite() && !self.is_neg_infinite()
    }

    /// Sum that keeps infinities absorbing
    pub fn saturating_add(self, other: Seconds) -> Seconds {
        if self.is_pos_infinite() || other.is_pos_infinite() {
            return Self::INFINITY;
        }
        if self.is_neg_infinite() || other.is_neg_infinite() {
            return Self::NEG_INFINITY;
        }
        Self(self.0 + other.0).clamp(Self::NEG_INFINITY, Self::INFINITY)
    }

    pub fn neg(self) -> Seconds {
        if self.is_pos_infinite() {
            Self::NEG_INFINITY
        } else if self.is_neg_infinite() {
            Self::INFINITY
        } else {
            Self(-self.0)
        }
    }
}

impl Default for Seconds {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<Seconds> for f64 {
    fn from(s: Seconds) -> f64 {
        s.as_secs_f64()
    }
}

impl TryFrom<f64> for Seconds {
    type Error = String;

    fn try_from(secs: f64) -> Result<Self, Self::Error> {
        Seconds::try_from_secs_f64(secs).ok_or_else(|| format!("{} is not a representable duration", secs))
    }
}

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_pos_infinite() {
            return write!(f, "inf");
        }
        if self.is_neg_infinite() {
            return write!(f, "-inf");
        }
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        let whole = abs / MILLIS_PER_SEC;
        let frac = abs % MILLIS_PER_SEC;
        if frac == 0 {
            write!(f, "{}{}s", sign, whole)
        } else {
            let digits = format!("{:03}", frac);
            write!(f, "{}{}.{}s", sign, whole, digits.trim_end_matches('0'))
        }
    }
}

//! Rational time bases and timestamp rescaling.

use serde::{Deserialize, Serialize};

/// A rational time unit: one tick lasts `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    /// Milliseconds, the unit of caller-supplied presentation timestamps and
    /// of FLV tag timestamps.
    pub const MILLIS: TimeBase = TimeBase { num: 1, den: 1000 };

    /// Create a time base of `num / den` seconds per tick.
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Time base whose tick is one frame at `fps`.
    pub const fn per_frame(fps: u32) -> Self {
        Self { num: 1, den: fps }
    }

    /// Rescale `value` from this time base into `to`, rounding to the nearest
    /// tick with halves away from zero. Saturates at the `i64` range.
    pub fn rescale(self, value: i64, to: TimeBase) -> i64 {
        if self == to {
            return value;
        }
        let num = value as i128 * self.num as i128 * to.den as i128;
        let den = self.den as i128 * to.num as i128;
        if den == 0 {
            return 0;
        }
        let half = den / 2;
        let rounded = if num >= 0 {
            (num + half) / den
        } else {
            -((-num + half) / den)
        };
        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

//! # Fixed-Point Arithmetic
//!
//! **CRITICAL: NO FLOATING POINT IN BALANCE OR COST CALCULATIONS**
//!
//! Modifier factors (leader bonus, class bonus, summon cost discounts) and the
//! fusion cost multiplier are fixed-point decimals with 6 places. Amounts are
//! whole units, so every multiplication ends with a floor back to `u64`.
//!
//! ## Why Fixed-Point?
//!
//! - Deterministic: Same calculation = same result on all hardware
//! - No rounding errors: 0.1 + 0.2 == 0.3 (unlike IEEE 754 floats)
//! - Auditable: every grant can be recomputed from its journal entry
//!
//! Summon tier probabilities are the one place the engine uses `f64`; they
//! only steer a weighted draw and never touch a balance.

use std::fmt;
use std::str::FromStr;

use crate::error::{EconomyError, EconomyResult};

/// Number of decimal places.
const DECIMAL_PLACES: u32 = 6;

/// The multiplier for 6 decimal places.
const MULTIPLIER: u64 = 10u64.pow(DECIMAL_PLACES);

/// Fixed-point decimal number with 6 decimal places.
///
/// Internally stores value * 1,000,000 as a u64.
///
/// # Range
///
/// - Minimum: 0.000000
/// - Maximum: 18,446,744,073,709.551615
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct FixedPoint(u64);

impl FixedPoint {
    /// One unit (1.000000), the neutral modifier.
    pub const ONE: Self = Self(MULTIPLIER);

    /// Maximum representable value.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a fixed-point number from a whole number.
    ///
    /// Saturates at [`FixedPoint::MAX`].
    #[inline]
    #[must_use]
    pub const fn from_whole(whole: u64) -> Self {
        Self(whole.saturating_mul(MULTIPLIER))
    }

    /// Creates a fixed-point number from parts.
    ///
    /// # Arguments
    ///
    /// * `whole` - The whole number part
    /// * `decimal` - The decimal part (0-999999)
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let multiplier = FixedPoint::from_parts(2, 200_000); // 2.2
    /// ```
    #[inline]
    #[must_use]
    pub const fn from_parts(whole: u64, decimal: u32) -> Self {
        Self(
            whole
                .saturating_mul(MULTIPLIER)
                .saturating_add(decimal as u64 % MULTIPLIER),
        )
    }

    /// Converts a float, rounding to the nearest millionth.
    ///
    /// Only used when reading config documents, where TOML hands out floats.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for negative, non-finite or out-of-range input.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn from_f64(value: f64) -> EconomyResult<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(EconomyError::InvalidConfig(format!(
                "{value} is not a non-negative decimal"
            )));
        }
        let scaled = (value * MULTIPLIER as f64).round();
        if scaled >= u64::MAX as f64 {
            return Err(EconomyError::ArithmeticOverflow);
        }
        Ok(Self(scaled as u64))
    }

    /// Returns the raw internal value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the whole number part (the floor).
    #[inline]
    #[must_use]
    pub const fn whole(self) -> u64 {
        self.0 / MULTIPLIER
    }

    /// Returns the decimal part (0-999999).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decimal(self) -> u32 {
        (self.0 % MULTIPLIER) as u32
    }

    /// Converts to `f64` for probability math and reports.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / MULTIPLIER as f64
    }

    /// Checked fixed-point multiplication, truncating below the sixth place.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn checked_mul(self, rhs: Self) -> Option<Self> {
        let wide = (self.0 as u128 * rhs.0 as u128) / MULTIPLIER as u128;
        if wide > u64::MAX as u128 {
            None
        } else {
            Some(Self(wide as u64))
        }
    }

    /// Saturating fixed-point multiplication.
    #[inline]
    #[must_use]
    pub const fn saturating_mul(self, rhs: Self) -> Self {
        match self.checked_mul(rhs) {
            Some(v) => v,
            None => Self::MAX,
        }
    }

    /// Raises to an integer power, saturating at [`FixedPoint::MAX`].
    ///
    /// Once saturated the loop exits, so huge exponents stay cheap.
    #[must_use]
    pub const fn saturating_pow(self, exp: u32) -> Self {
        let mut acc = Self::ONE;
        let mut i = 0;
        while i < exp {
            acc = acc.saturating_mul(self);
            if acc.0 == u64::MAX {
                break;
            }
            i += 1;
        }
        acc
    }

    /// Multiplies a whole amount by this factor and floors the result.
    ///
    /// Returns `None` if the floored result does not fit in `u64`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn mul_floor(self, amount: u64) -> Option<u64> {
        let wide = (amount as u128 * self.0 as u128) / MULTIPLIER as u128;
        if wide > u64::MAX as u128 {
            None
        } else {
            Some(wide as u64)
        }
    }

    /// Product of a list of factors; the empty product is [`FixedPoint::ONE`].
    ///
    /// # Errors
    ///
    /// Returns `ArithmeticOverflow` if an intermediate product overflows.
    pub fn product(factors: &[Self]) -> EconomyResult<Self> {
        factors.iter().try_fold(Self::ONE, |acc, factor| {
            acc.checked_mul(*factor)
                .ok_or(EconomyError::ArithmeticOverflow)
        })
    }

    /// Returns true if this value is zero.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl FromStr for FixedPoint {
    type Err = EconomyError;

    /// Parses `"2"`, `"2.2"` or `"0.000001"`. More than six decimals is an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || EconomyError::InvalidConfig(format!("'{s}' is not a decimal"));
        let s = s.trim();
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(bad());
        }
        if frac.len() > DECIMAL_PLACES as usize {
            return Err(bad());
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| bad())?
        };
        let mut decimal: u64 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| bad())?
        };
        for _ in frac.len()..DECIMAL_PLACES as usize {
            decimal *= 10;
        }
        whole
            .checked_mul(MULTIPLIER)
            .and_then(|w| w.checked_add(decimal))
            .map(Self)
            .ok_or(EconomyError::ArithmeticOverflow)
    }
}

impl fmt::Debug for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedPoint({}.{:06})", self.whole(), self.decimal())
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.whole(), self.decimal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_parts() {
        let value = FixedPoint::from_parts(3, 141_592);
        assert_eq!(value.whole(), 3);
        assert_eq!(value.decimal(), 141_592);
    }

    #[test]
    fn test_mul_floor_rounds_down() {
        let bonus = FixedPoint::from_parts(1, 150_000); // 1.15
        assert_eq!(bonus.mul_floor(999), Some(1148)); // 1148.85
        assert_eq!(FixedPoint::ONE.mul_floor(42), Some(42));
        assert_eq!(FixedPoint::MAX.mul_floor(u64::MAX), None);
    }

    #[test]
    fn test_product_of_factors() {
        let leader = FixedPoint::from_parts(1, 200_000);
        let class = FixedPoint::from_parts(1, 500_000);
        let product = FixedPoint::product(&[leader, class]).unwrap();
        assert_eq!(product, FixedPoint::from_parts(1, 800_000));
        assert_eq!(FixedPoint::product(&[]).unwrap(), FixedPoint::ONE);
    }

    #[test]
    fn test_saturating_pow() {
        let m = FixedPoint::from_parts(2, 200_000);
        assert_eq!(m.saturating_pow(0), FixedPoint::ONE);
        assert_eq!(m.saturating_pow(1), m);
        assert_eq!(m.saturating_pow(2), FixedPoint::from_parts(4, 840_000));
        assert_eq!(m.saturating_pow(10_000), FixedPoint::MAX);
    }

    #[test]
    fn test_parse() {
        assert_eq!("2.2".parse::<FixedPoint>().unwrap(), FixedPoint::from_parts(2, 200_000));
        assert_eq!("7".parse::<FixedPoint>().unwrap(), FixedPoint::from_whole(7));
        assert_eq!(".5".parse::<FixedPoint>().unwrap(), FixedPoint::from_parts(0, 500_000));
        assert!("1.0000001".parse::<FixedPoint>().is_err());
        assert!("-1".parse::<FixedPoint>().is_err());
        assert!("abc".parse::<FixedPoint>().is_err());
    }

    #[test]
    fn test_from_f64() {
        assert_eq!(FixedPoint::from_f64(2.2).unwrap(), FixedPoint::from_parts(2, 200_000));
        assert_eq!(FixedPoint::from_f64(0.85).unwrap(), FixedPoint::from_parts(0, 850_000));
        assert!(FixedPoint::from_f64(-0.1).is_err());
        assert!(FixedPoint::from_f64(f64::NAN).is_err());
    }

    #[test]
    fn test_display() {
        let value = FixedPoint::from_parts(42, 123_456);
        assert_eq!(format!("{value}"), "42.123456");
    }
}

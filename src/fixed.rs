//! Unsigned fixed-point arithmetic with saturation.
//!
//! All quantities of the converter model are non-negative and scaled by `2^FRAC`. Every
//! operator saturates at the numeric bounds instead of wrapping, so that an overflow shows up
//! as a pinned value rather than as a silently wrong one.

use std::fmt;
use std::ops::{Add, Sub, Mul};


/// An unsigned 64-bit fixed-point value with `FRAC` fractional bits.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UFixed<const FRAC: u32>(u64);

impl<const FRAC: u32> UFixed<FRAC> {
    pub const ZERO: UFixed<FRAC> = UFixed(0);
    pub const MAX: UFixed<FRAC> = UFixed(u64::MAX);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        UFixed(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Converts an integer, saturating if it does not fit with `FRAC` fractional bits.
    #[inline]
    pub fn from_int(value: u64) -> Self {
        if value > (u64::MAX >> FRAC) {
            Self::MAX
        } else {
            UFixed(value << FRAC)
        }
    }

    /// Integer part, rounding toward zero.
    #[inline]
    pub fn to_int(self) -> u64 {
        self.0 >> FRAC
    }

    /// Integer part clamped to `u32`.
    #[inline]
    pub fn to_u32(self) -> u32 {
        self.to_int().min(u32::MAX as u64) as u32
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Changes the number of fractional bits.
    #[inline]
    pub fn rescale<const TO: u32>(self) -> UFixed<TO> {
        UFixed(shift_saturating(self.0 as u128, TO as i32 - FRAC as i32))
    }

    #[inline]
    pub fn saturating_add(self, rhs: Self) -> Self {
        UFixed(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Self) -> Self {
        UFixed(self.0.saturating_sub(rhs.0))
    }

    /// Multiplies two values of arbitrary scales into a third scale.
    ///
    /// The product is computed on 128 bits and saturated once.
    #[inline]
    pub fn mul_into<const RHS: u32, const OUT: u32>(self, rhs: UFixed<RHS>) -> UFixed<OUT> {
        let wide = self.0 as u128 * rhs.0 as u128;
        UFixed(shift_saturating(wide, OUT as i32 - (FRAC + RHS) as i32))
    }

    /// Multiplies by a plain integer.
    #[inline]
    pub fn mul_int(self, factor: u64) -> Self {
        UFixed(self.0.saturating_mul(factor))
    }

    /// Divides by an integer through the reciprocal table, without a hardware division.
    ///
    /// The result is accurate to about 0.2%. A zero divisor is treated as one.
    #[inline]
    pub fn div_lut(self, divisor: u32) -> Self {
        UFixed(div_lut(self.0, divisor))
    }

    /// Clamps the value into `[min, max]`.
    #[inline]
    pub fn clamp_to(self, min: Self, max: Self) -> Self {
        if self < min {
            min
        } else if self > max {
            max
        } else {
            self
        }
    }
}

impl<const FRAC: u32> Add for UFixed<FRAC> {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl<const FRAC: u32> Sub for UFixed<FRAC> {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl<const FRAC: u32> Mul for UFixed<FRAC> {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        self.mul_into(rhs)
    }
}

impl<const FRAC: u32> fmt::Debug for UFixed<FRAC> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}+{}/2^{}", self.to_int(), self.0 & ((1u64 << FRAC.min(63)) - 1), FRAC)
    }
}


/// Shifts left (positive) or right (negative) and saturates to `u64`.
#[inline]
fn shift_saturating(value: u128, shift: i32) -> u64 {
    let shifted = if shift >= 0 {
        let shift = shift as u32;
        if shift >= 128 || (value != 0 && value.leading_zeros() < shift) {
            return u64::MAX;
        }
        value << shift
    } else {
        let shift = (-shift) as u32;
        if shift >= 128 { 0 } else { value >> shift }
    };
    if shifted > u64::MAX as u128 { u64::MAX } else { shifted as u64 }
}


const RECIPROCAL_BITS: u32 = 8;
const RECIPROCAL_SIZE: usize = 1 << RECIPROCAL_BITS;

/// `RECIPROCAL_LUT[i] ~ 2^31 / m` where `m` is the midpoint of mantissa bucket `i` in `[1, 2)`.
static RECIPROCAL_LUT: [u32; RECIPROCAL_SIZE] = build_reciprocal_lut();

const fn build_reciprocal_lut() -> [u32; RECIPROCAL_SIZE] {
    let mut lut = [0u32; RECIPROCAL_SIZE];
    let mut i = 0;
    while i < RECIPROCAL_SIZE {
        // m = (2 * 256 + 2i + 1) / 512
        let den = (2 * RECIPROCAL_SIZE + 2 * i + 1) as u64;
        lut[i] = (((1u64 << 31) * (2 * RECIPROCAL_SIZE as u64)) / den) as u32;
        i += 1;
    }
    lut
}

fn div_lut(numerator: u64, divisor: u32) -> u64 {
    let divisor = divisor.max(1);
    let exponent = 31 - divisor.leading_zeros();
    let normalized = if exponent >= RECIPROCAL_BITS {
        divisor >> (exponent - RECIPROCAL_BITS)
    } else {
        divisor << (RECIPROCAL_BITS - exponent)
    };
    let mantissa = normalized as usize & (RECIPROCAL_SIZE - 1);
    let wide = numerator as u128 * RECIPROCAL_LUT[mantissa] as u128;
    shift_saturating(wide, -(31 + exponent as i32))
}


/// Floor of the base-2 logarithm; zero maps to zero.
#[inline]
pub fn log2_safe(value: u32) -> u32 {
    if value == 0 { 0 } else { 31 - value.leading_zeros() }
}

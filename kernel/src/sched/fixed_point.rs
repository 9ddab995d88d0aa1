//! 17.14 signed fixed-point arithmetic.
//!
//! A [`Fixed32`] is an `i32` with the binary point at bit 14. The MLFQS
//! load-average and recent-CPU formulas are the only consumers; their
//! operands stay far below the saturation range, so no overflow checking is
//! performed. Multiplication and division go through 64-bit intermediates so
//! the binary-point shift does not truncate.

use core::ops::{Add, Sub};

/// Scale factor: one, expressed in 17.14.
const BINARY_POINT: i32 = 1 << 14;

/// A signed 17.14 fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed32(i32);

impl Fixed32 {
    /// Zero.
    pub const ZERO: Fixed32 = Fixed32(0);

    /// Converts an integer, lifting it by the scale factor.
    pub const fn from_int(n: i32) -> Fixed32 {
        Fixed32(n * BINARY_POINT)
    }

    /// Raw 17.14 representation.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Converts to an integer, truncating toward zero.
    pub const fn to_int_floor(self) -> i32 {
        self.0 / BINARY_POINT
    }

    /// Converts to an integer, rounding to nearest (half away from zero).
    pub const fn to_int_round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + BINARY_POINT / 2) / BINARY_POINT
        } else {
            (self.0 - BINARY_POINT / 2) / BINARY_POINT
        }
    }

    /// Adds an integer to a fixed-point value.
    pub const fn add_int(self, n: i32) -> Fixed32 {
        Fixed32(self.0 + n * BINARY_POINT)
    }

    /// Subtracts an integer from a fixed-point value.
    pub const fn sub_int(self, n: i32) -> Fixed32 {
        Fixed32(self.0 - n * BINARY_POINT)
    }

    /// `n - self` with an integer minuend.
    pub const fn sub_from_int(self, n: i32) -> Fixed32 {
        Fixed32(n * BINARY_POINT - self.0)
    }

    /// Fixed-point multiplication via a 64-bit intermediate.
    pub const fn mul(self, other: Fixed32) -> Fixed32 {
        Fixed32(((self.0 as i64 * other.0 as i64) / BINARY_POINT as i64) as i32)
    }

    /// Multiplies by an integer.
    pub const fn mul_int(self, n: i32) -> Fixed32 {
        Fixed32(self.0 * n)
    }

    /// Fixed-point division via a 64-bit intermediate.
    pub const fn div(self, other: Fixed32) -> Fixed32 {
        Fixed32(((self.0 as i64 * BINARY_POINT as i64) / other.0 as i64) as i32)
    }

    /// Divides by an integer.
    pub const fn div_int(self, n: i32) -> Fixed32 {
        Fixed32(self.0 / n)
    }
}

impl Add for Fixed32 {
    type Output = Fixed32;

    fn add(self, rhs: Fixed32) -> Fixed32 {
        Fixed32(self.0 + rhs.0)
    }
}

impl Sub for Fixed32 {
    type Output = Fixed32;

    fn sub(self, rhs: Fixed32) -> Fixed32 {
        Fixed32(self.0 - rhs.0)
    }
}

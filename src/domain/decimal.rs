//! Exact decimal amounts for shares, prices and cash.

use rust_decimal::Decimal as Inner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::str::FromStr;

/// Share counts, prices and cash amounts. Never a float.
///
/// Displays without exponent or trailing zeros (`5.500` prints as `5.5`).
/// JSON encodes it as a number; the API layer renders strings where
/// clients must not lose precision.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Decimal(#[serde(with = "rust_decimal::serde::float")] Inner);

impl Decimal {
    /// Parse with surrounding whitespace tolerated.
    pub fn from_str_canonical(s: &str) -> Result<Self, rust_decimal::Error> {
        Inner::from_str(s.trim()).map(Self)
    }

    /// Shortest exact rendering: normalized, no exponent.
    pub fn to_canonical_string(&self) -> String {
        self.0.normalize().to_string()
    }

    pub fn zero() -> Self {
        Self(Inner::ZERO)
    }

    pub fn one() -> Self {
        Self(Inner::ONE)
    }

    /// Exactly 0.5.
    pub fn half() -> Self {
        Self(Inner::new(5, 1))
    }

    pub fn from_i64(value: i64) -> Self {
        Self(Inner::from(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Strictly greater than zero.
    pub fn is_positive(&self) -> bool {
        self.0 > Inner::ZERO
    }

    /// Strictly less than zero.
    pub fn is_negative(&self) -> bool {
        self.0 < Inner::ZERO
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    /// `None` for a zero divisor or overflow.
    pub fn checked_div(&self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_div(rhs.0).map(Self)
    }

    pub fn checked_add(&self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(&self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn checked_mul(&self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_mul(rhs.0).map(Self)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical_string())
    }
}

impl FromStr for Decimal {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_canonical(s)
    }
}

impl From<Inner> for Decimal {
    fn from(value: Inner) -> Self {
        Self(value)
    }
}

macro_rules! forward_binop {
    ($($trait:ident :: $method:ident),* $(,)?) => {
        $(
            impl $trait for Decimal {
                type Output = Decimal;

                fn $method(self, rhs: Decimal) -> Decimal {
                    Decimal($trait::$method(self.0, rhs.0))
                }
            }
        )*
    };
}

forward_binop!(Add::add, Sub::sub, Mul::mul, Div::div);

impl AddAssign for Decimal {
    fn add_assign(&mut self, rhs: Decimal) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Decimal {
    fn sub_assign(&mut self, rhs: Decimal) {
        self.0 -= rhs.0;
    }
}

impl Neg for Decimal {
    type Output = Decimal;

    fn neg(self) -> Decimal {
        Self(-self.0)
    }
}

impl std::iter::Sum for Decimal {
    fn sum<I: Iterator<Item = Decimal>>(iter: I) -> Self {
        iter.fold(Self::zero(), Add::add)
    }
}

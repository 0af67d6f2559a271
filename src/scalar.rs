//! # Scalar Abstraction for Generic Covariance Code
//!
//! The covariance-factor builders in [`crate::covariance`] are written once,
//! generically over a scalar type, and then evaluated at `f64` (plain values),
//! at [`Dual<f64>`](crate::dual::Dual) (first derivatives), and at nested duals
//! (second derivatives). This module defines the trait that makes that
//! possible.
//!
//! The trait surface is small: the arithmetic operators come in through
//! supertraits, and only the transcendental functions the factor builders
//! actually reach for are required methods.

use std::fmt::Debug;
use std::iter::Sum;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// A scalar suitable for covariance-factor evaluation.
///
/// Implemented for `f64` (plain evaluation) and for [`Dual<S>`](crate::dual::Dual)
/// over any `Scalar` (forward-mode AD, nestable for higher derivatives).
pub trait Scalar:
    Copy
    + Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Sum
    + PartialOrd
    + Sized
{
    /// Lift an `f64` constant into the scalar type (derivative = 0 for AD types).
    fn from_f64(v: f64) -> Self;

    /// Extract the primal (function) value, discarding derivative information.
    fn value(&self) -> f64;

    /// Natural logarithm.
    fn ln(self) -> Self;

    /// Exponential.
    fn exp(self) -> Self;

    /// Square root.
    fn sqrt(self) -> Self;

    /// Integer power.
    fn powi(self, n: i32) -> Self;

    /// Absolute value (non-smooth at zero; derivative follows the sign).
    fn abs(self) -> Self;
}

impl Scalar for f64 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn value(&self) -> f64 {
        *self
    }

    #[inline]
    fn ln(self) -> Self {
        f64::ln(self)
    }

    #[inline]
    fn exp(self) -> Self {
        f64::exp(self)
    }

    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    #[inline]
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }

    #[inline]
    fn abs(self) -> Self {
        f64::abs(self)
    }
}

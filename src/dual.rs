//! # Forward-Mode Dual Numbers
//!
//! A dual number carries a primal value together with the derivative of that
//! value along one direction in parameter space. Arithmetic on duals applies
//! the usual rules of calculus to the derivative component, so any function
//! written against [`Scalar`] differentiates itself as a side effect of
//! evaluation.
//!
//! The type is generic over its component scalar, and [`Dual<S>`] itself
//! implements [`Scalar`]. Nesting (`Dual<Dual<f64>>`) therefore works out of
//! the box and yields exact second derivatives; this is how the Hessian of the
//! Cholesky factor map is obtained in [`crate::autodiff`].

use crate::scalar::Scalar;
use std::cmp::Ordering;
use std::iter::Sum;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Value/derivative pair for forward-mode differentiation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual<S: Scalar> {
    /// Primal value.
    pub val: S,
    /// Derivative along the active direction.
    pub dot: S,
}

impl<S: Scalar> Dual<S> {
    /// Build a dual from explicit value and derivative components.
    #[inline]
    pub fn new(val: S, dot: S) -> Self {
        Dual { val, dot }
    }

    /// A constant: derivative zero.
    #[inline]
    pub fn constant(val: S) -> Self {
        Dual {
            val,
            dot: S::from_f64(0.0),
        }
    }

    /// The active variable: derivative one.
    #[inline]
    pub fn var(val: S) -> Self {
        Dual {
            val,
            dot: S::from_f64(1.0),
        }
    }
}

impl<S: Scalar> Add for Dual<S> {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Dual {
            val: self.val + rhs.val,
            dot: self.dot + rhs.dot,
        }
    }
}

impl<S: Scalar> Sub for Dual<S> {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Dual {
            val: self.val - rhs.val,
            dot: self.dot - rhs.dot,
        }
    }
}

impl<S: Scalar> Mul for Dual<S> {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        // Product rule.
        Dual {
            val: self.val * rhs.val,
            dot: self.dot * rhs.val + self.val * rhs.dot,
        }
    }
}

impl<S: Scalar> Div for Dual<S> {
    type Output = Self;

    #[inline]
    fn div(self, rhs: Self) -> Self {
        // Quotient rule.
        Dual {
            val: self.val / rhs.val,
            dot: (self.dot * rhs.val - self.val * rhs.dot) / (rhs.val * rhs.val),
        }
    }
}

impl<S: Scalar> Neg for Dual<S> {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Dual {
            val: -self.val,
            dot: -self.dot,
        }
    }
}

impl<S: Scalar> Sum for Dual<S> {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Dual::constant(S::from_f64(0.0)), Add::add)
    }
}

/// Ordering compares primal values only; derivatives are tangent information
/// and must not affect control flow decisions.
impl<S: Scalar> PartialOrd for Dual<S> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.val.partial_cmp(&other.val)
    }
}

impl<S: Scalar> Scalar for Dual<S> {
    #[inline]
    fn from_f64(v: f64) -> Self {
        Dual::constant(S::from_f64(v))
    }

    #[inline]
    fn value(&self) -> f64 {
        self.val.value()
    }

    #[inline]
    fn ln(self) -> Self {
        Dual {
            val: self.val.ln(),
            dot: self.dot / self.val,
        }
    }

    #[inline]
    fn exp(self) -> Self {
        let e = self.val.exp();
        Dual {
            val: e,
            dot: self.dot * e,
        }
    }

    #[inline]
    fn sqrt(self) -> Self {
        let root = self.val.sqrt();
        Dual {
            val: root,
            dot: self.dot / (S::from_f64(2.0) * root),
        }
    }

    fn powi(self, n: i32) -> Self {
        // n = 0 and n = 1 short-circuit so that a zero primal never meets a
        // val^(n-1) with non-positive exponent.
        match n {
            0 => Dual::constant(S::from_f64(1.0)),
            1 => self,
            _ => Dual {
                val: self.val.powi(n),
                dot: S::from_f64(f64::from(n)) * self.val.powi(n - 1) * self.dot,
            },
        }
    }

    #[inline]
    fn abs(self) -> Self {
        if self.val < S::from_f64(0.0) { -self } else { self }
    }
}

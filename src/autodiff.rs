//! # Jacobians and Hessians by Operator Overloading
//!
//! A map is a function from a parameter slice to a flattened output vector,
//! written generically over [`Scalar`]. To differentiate it, evaluate it on
//! [`Dual`] inputs with one direction seeded at a time and read the
//! derivative components back out.
//!
//! Because [`JacobianFn`] is itself a [`DifferentiableMap`], the same
//! machinery applied twice produces exact second derivatives through nested
//! duals, with no symbolic work and no truncation error.
//!
//! # Layout
//!
//! For a map with `m` outputs differentiated in `n` directions, the returned
//! vector has length `n * m` and is direction-major: entry `i * m + k` holds
//! the derivative of output `k` along direction `i`.

use crate::dual::Dual;
use crate::scalar::Scalar;

/// A vector-valued function of a parameter vector, evaluable at any scalar.
///
/// Implementors must produce the same output length for every call with the
/// same parameter length, and must route all arithmetic through the [`Scalar`]
/// surface so dual numbers can flow through.
pub trait DifferentiableMap {
    /// Evaluate the map at `theta`, returning the flattened output.
    fn eval<S: Scalar>(&self, theta: &[S]) -> Vec<S>;
}

/// Forward-mode Jacobian of `map` at `theta`, direction-major.
///
/// Seeds one parameter direction per pass, so the map is evaluated
/// `theta.len()` times on dual inputs.
pub fn jacobian<S, F>(map: &F, theta: &[S]) -> Vec<S>
where
    S: Scalar,
    F: DifferentiableMap + ?Sized,
{
    let n = theta.len();
    let mut out = Vec::new();
    for dir in 0..n {
        let lifted: Vec<Dual<S>> = theta
            .iter()
            .enumerate()
            .map(|(k, &t)| {
                if k == dir {
                    Dual::var(t)
                } else {
                    Dual::constant(t)
                }
            })
            .collect();
        out.extend(map.eval(&lifted).into_iter().map(|d| d.dot));
    }
    out
}

/// Second derivatives of `map` at `theta`, obtained by differentiating the
/// Jacobian. For `m` outputs and `n` parameters the result has length
/// `n * n * m`; entry `(i * n + j) * m + k` holds the derivative of output
/// `k` along directions `i` and `j`.
pub fn hessian<S, F>(map: &F, theta: &[S]) -> Vec<S>
where
    S: Scalar,
    F: DifferentiableMap,
{
    jacobian(&JacobianFn::new(map), theta)
}

/// Wraps a map so that its Jacobian becomes a map in its own right.
///
/// Evaluating this wrapper on dual inputs nests one dual level inside
/// another, which is what makes [`hessian`] exact.
pub struct JacobianFn<'a, F: ?Sized> {
    map: &'a F,
}

impl<'a, F: DifferentiableMap + ?Sized> JacobianFn<'a, F> {
    pub fn new(map: &'a F) -> Self {
        JacobianFn { map }
    }
}

impl<F: DifferentiableMap + ?Sized> DifferentiableMap for JacobianFn<'_, F> {
    fn eval<S: Scalar>(&self, theta: &[S]) -> Vec<S> {
        jacobian(self.map, theta)
    }
}

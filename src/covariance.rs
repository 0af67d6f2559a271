//! # Covariance Families and Their Cholesky Factors
//!
//! Every covariance structure here is parameterized through a lower Cholesky
//! factor: an unconstrained parameter vector `theta` maps to a lower
//! triangular `L` with positive diagonal, and the covariance over the full
//! visit grid is `Sigma = L * L^T`. Working on the factor keeps `Sigma`
//! positive definite for any `theta` and gives the derivative pipeline in
//! [`crate::derivatives`] a single smooth map to differentiate.
//!
//! # Parameter conventions
//!
//! Standard deviations enter on the log scale (`sd = exp(theta_k)`), and
//! correlation parameters pass through [`map_to_cor`], which maps the real
//! line onto `(-1, 1)`. Heterogeneous variants (`csh`, `ar1h`, `toeph`,
//! `adh`) carry one log-sd per visit followed by the correlation parameters;
//! homogeneous variants carry a single log-sd first.
//!
//! Families with a closed-form factor (`us`, `ar1`/`ar1h`, `ad`/`adh`) are
//! built directly. The rest (`cs`/`csh`, `toep`/`toeph`) build their
//! correlation matrix and factor it with an unblocked Cholesky written
//! against [`Scalar`], so dual numbers differentiate straight through the
//! decomposition.

use crate::autodiff::DifferentiableMap;
use crate::scalar::Scalar;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors surfaced by covariance construction, pattern handling, and the
/// information-matrix accumulator.
#[derive(Debug, Error)]
pub enum CovarianceError {
    /// A family tag that does not name a supported structure.
    #[error(
        "unrecognized covariance family tag `{tag}` (expected one of: us, cs, csh, ar1, ar1h, toep, toeph, ad, adh)"
    )]
    InvalidFamily { tag: String },

    /// Parameter vector length does not match the family and visit count.
    #[error("family `{family}` over {n_visits} visits takes {expected} parameters, but {actual} were supplied")]
    DimensionMismatch {
        family: CovarianceFamily,
        n_visits: usize,
        expected: usize,
        actual: usize,
    },

    /// The covariance for the named visit pattern failed to factorize.
    #[error("covariance matrix for visit pattern {pattern:?} is not positive definite")]
    SingularCovariance { pattern: Vec<usize> },

    /// A visit index at or beyond the visit-grid size.
    #[error("visit index {index} is out of range for {n_visits} visits")]
    PatternOutOfRange { index: usize, n_visits: usize },

    /// A pattern that is not strictly increasing.
    #[error("invalid visit pattern: {reason}")]
    InvalidPattern { reason: String },

    /// Subject bookkeeping that does not tile the stacked design matrix.
    #[error("design bookkeeping mismatch: {reason}")]
    DesignMismatch { reason: String },
}

/// The supported covariance structures over a common visit grid of size `n`.
///
/// Short tags follow the conventional mixed-model naming and are what
/// [`FromStr`], [`fmt::Display`], and serde use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceFamily {
    /// `us`: unstructured; every variance and covariance free. `n(n+1)/2` parameters.
    #[serde(rename = "us")]
    Unstructured,
    /// `cs`: compound symmetry; one variance, one common correlation. 2 parameters.
    #[serde(rename = "cs")]
    CompoundSymmetry,
    /// `csh`: compound symmetry with per-visit standard deviations. `n + 1` parameters.
    #[serde(rename = "csh")]
    HeterogeneousCompoundSymmetry,
    /// `ar1`: first-order autoregressive; correlation decays as `rho^|i-j|`. 2 parameters.
    #[serde(rename = "ar1")]
    Ar1,
    /// `ar1h`: autoregressive with per-visit standard deviations. `n + 1` parameters.
    #[serde(rename = "ar1h")]
    HeterogeneousAr1,
    /// `toep`: Toeplitz; one free correlation per lag. `n` parameters.
    #[serde(rename = "toep")]
    Toeplitz,
    /// `toeph`: Toeplitz with per-visit standard deviations. `2n - 1` parameters.
    #[serde(rename = "toeph")]
    HeterogeneousToeplitz,
    /// `ad`: ante-dependence; one free correlation per adjacent visit pair. `n` parameters.
    #[serde(rename = "ad")]
    AnteDependence,
    /// `adh`: ante-dependence with per-visit standard deviations. `2n - 1` parameters.
    #[serde(rename = "adh")]
    HeterogeneousAnteDependence,
}

impl CovarianceFamily {
    /// Every supported family, in tag order.
    pub const ALL: [CovarianceFamily; 9] = [
        CovarianceFamily::Unstructured,
        CovarianceFamily::CompoundSymmetry,
        CovarianceFamily::HeterogeneousCompoundSymmetry,
        CovarianceFamily::Ar1,
        CovarianceFamily::HeterogeneousAr1,
        CovarianceFamily::Toeplitz,
        CovarianceFamily::HeterogeneousToeplitz,
        CovarianceFamily::AnteDependence,
        CovarianceFamily::HeterogeneousAnteDependence,
    ];

    /// The short tag used for parsing and display.
    pub fn tag(&self) -> &'static str {
        match self {
            CovarianceFamily::Unstructured => "us",
            CovarianceFamily::CompoundSymmetry => "cs",
            CovarianceFamily::HeterogeneousCompoundSymmetry => "csh",
            CovarianceFamily::Ar1 => "ar1",
            CovarianceFamily::HeterogeneousAr1 => "ar1h",
            CovarianceFamily::Toeplitz => "toep",
            CovarianceFamily::HeterogeneousToeplitz => "toeph",
            CovarianceFamily::AnteDependence => "ad",
            CovarianceFamily::HeterogeneousAnteDependence => "adh",
        }
    }

    /// Length of the parameter vector for this family over `n_visits` visits.
    pub fn param_count(&self, n_visits: usize) -> usize {
        let n = n_visits;
        match self {
            CovarianceFamily::Unstructured => n * (n + 1) / 2,
            CovarianceFamily::CompoundSymmetry | CovarianceFamily::Ar1 => 2,
            CovarianceFamily::HeterogeneousCompoundSymmetry
            | CovarianceFamily::HeterogeneousAr1 => n + 1,
            CovarianceFamily::Toeplitz | CovarianceFamily::AnteDependence => n,
            CovarianceFamily::HeterogeneousToeplitz
            | CovarianceFamily::HeterogeneousAnteDependence => n + n.saturating_sub(1),
        }
    }
}

impl fmt::Display for CovarianceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for CovarianceFamily {
    type Err = CovarianceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CovarianceFamily::ALL
            .iter()
            .find(|fam| fam.tag() == s)
            .copied()
            .ok_or_else(|| CovarianceError::InvalidFamily { tag: s.to_string() })
    }
}

/// Map an unconstrained real onto the open interval `(-1, 1)`.
///
/// `x / sqrt(1 + x^2)` is smooth, odd, and strictly increasing, with
/// `map_to_cor(0) = 0`. All correlation parameters pass through it.
#[inline]
pub fn map_to_cor<S: Scalar>(x: S) -> S {
    x / (S::from_f64(1.0) + x * x).sqrt()
}

/// Unblocked lower Cholesky of a symmetric matrix in row-major storage.
///
/// Written against [`Scalar`] so dual numbers differentiate through the
/// factorization. A non positive definite input produces NaN entries (square
/// root of a negative pivot) rather than an error; callers working at `f64`
/// check the result for finiteness.
fn cholesky_lower<S: Scalar>(a: &[S], n: usize) -> Vec<S> {
    let mut l = vec![S::from_f64(0.0); n * n];
    for j in 0..n {
        let mut pivot = a[j * n + j];
        for k in 0..j {
            let v = l[j * n + k];
            pivot = pivot - v * v;
        }
        let d = pivot.sqrt();
        l[j * n + j] = d;
        for i in (j + 1)..n {
            let mut s = a[i * n + j];
            for k in 0..j {
                s = s - l[i * n + k] * l[j * n + k];
            }
            l[i * n + j] = s / d;
        }
    }
    l
}

/// Factor the correlation matrix with unit diagonal and off-diagonal entries
/// supplied by `cor`.
fn correlation_cholesky<S: Scalar>(n: usize, cor: impl Fn(usize, usize) -> S) -> Vec<S> {
    let one = S::from_f64(1.0);
    let mut r = vec![S::from_f64(0.0); n * n];
    for i in 0..n {
        for j in 0..n {
            r[i * n + j] = if i == j { one } else { cor(i, j) };
        }
    }
    cholesky_lower(&r, n)
}

/// Closed-form factor of the AR(1) correlation matrix.
///
/// Row `i` is `[rho^i, rho^(i-1) * w, ..., rho * w, w]` with
/// `w = sqrt(1 - rho^2)`, which reproduces `rho^|i-j|` under `L * L^T`.
fn ar1_cholesky<S: Scalar>(rho: S, n: usize) -> Vec<S> {
    let one = S::from_f64(1.0);
    let w = (one - rho * rho).sqrt();
    let mut pows = Vec::with_capacity(n);
    let mut p = one;
    for _ in 0..n {
        pows.push(p);
        p = p * rho;
    }
    let mut l = vec![S::from_f64(0.0); n * n];
    for i in 0..n {
        l[i * n] = pows[i];
        for j in 1..=i {
            l[i * n + j] = pows[i - j] * w;
        }
    }
    l
}

/// Closed-form factor of the ante-dependence correlation matrix.
///
/// `rhos[k]` is the correlation between visits `k` and `k + 1`; the induced
/// correlation between visits `i < j` is the product of the adjacent
/// correlations along the chain from `i` to `j`.
fn ante_dependence_cholesky<S: Scalar>(rhos: &[S], n: usize) -> Vec<S> {
    let one = S::from_f64(1.0);
    let mut l = vec![S::from_f64(0.0); n * n];
    for i in 0..n {
        // Suffix product over rhos[j..i], maintained while j walks down to 0.
        let mut sp = one;
        for j in (1..=i).rev() {
            let r = rhos[j - 1];
            l[i * n + j] = sp * (one - r * r).sqrt();
            sp = sp * r;
        }
        l[i * n] = sp;
    }
    l
}

fn scale_uniform<S: Scalar>(l: &mut [S], sd: S) {
    for v in l.iter_mut() {
        *v = *v * sd;
    }
}

/// Left-multiply the factor by `diag(sds)`: row `i` is scaled by `sds[i]`.
fn scale_rows<S: Scalar>(l: &mut [S], sds: &[S], n: usize) {
    for i in 0..n {
        for j in 0..n {
            l[i * n + j] = l[i * n + j] * sds[i];
        }
    }
}

fn log_sds<S: Scalar>(theta: &[S], n: usize) -> Vec<S> {
    theta[..n].iter().map(|t| t.exp()).collect()
}

/// The map `theta -> vec(L)` for one family over a fixed visit grid.
///
/// This is the single function the whole derivative pipeline differentiates.
/// Output is the row-major flattening of the `n x n` lower triangular factor.
#[derive(Debug, Clone)]
pub struct CholFactorFn {
    family: CovarianceFamily,
    n_visits: usize,
}

impl CholFactorFn {
    /// Validates the grid size and parameter count up front so that
    /// [`eval`](DifferentiableMap::eval) can index `theta` without further
    /// checks.
    pub fn new(
        family: CovarianceFamily,
        n_visits: usize,
        n_theta: usize,
    ) -> Result<Self, CovarianceError> {
        if n_visits == 0 {
            return Err(CovarianceError::DesignMismatch {
                reason: "the visit grid must contain at least one visit".to_string(),
            });
        }
        let expected = family.param_count(n_visits);
        if n_theta != expected {
            return Err(CovarianceError::DimensionMismatch {
                family,
                n_visits,
                expected,
                actual: n_theta,
            });
        }
        Ok(CholFactorFn { family, n_visits })
    }

    pub fn n_visits(&self) -> usize {
        self.n_visits
    }
}

impl DifferentiableMap for CholFactorFn {
    fn eval<S: Scalar>(&self, theta: &[S]) -> Vec<S> {
        debug_assert_eq!(theta.len(), self.family.param_count(self.n_visits));
        let n = self.n_visits;
        match self.family {
            CovarianceFamily::Unstructured => {
                let mut l = vec![S::from_f64(0.0); n * n];
                let mut k = 0;
                for i in 0..n {
                    for j in 0..=i {
                        l[i * n + j] = if i == j { theta[k].exp() } else { theta[k] };
                        k += 1;
                    }
                }
                l
            }
            CovarianceFamily::CompoundSymmetry => {
                let sd = theta[0].exp();
                let rho = map_to_cor(theta[1]);
                let mut l = correlation_cholesky(n, |_, _| rho);
                scale_uniform(&mut l, sd);
                l
            }
            CovarianceFamily::HeterogeneousCompoundSymmetry => {
                let sds = log_sds(theta, n);
                let rho = map_to_cor(theta[n]);
                let mut l = correlation_cholesky(n, |_, _| rho);
                scale_rows(&mut l, &sds, n);
                l
            }
            CovarianceFamily::Ar1 => {
                let sd = theta[0].exp();
                let rho = map_to_cor(theta[1]);
                let mut l = ar1_cholesky(rho, n);
                scale_uniform(&mut l, sd);
                l
            }
            CovarianceFamily::HeterogeneousAr1 => {
                let sds = log_sds(theta, n);
                let rho = map_to_cor(theta[n]);
                let mut l = ar1_cholesky(rho, n);
                scale_rows(&mut l, &sds, n);
                l
            }
            CovarianceFamily::Toeplitz => {
                let sd = theta[0].exp();
                let rhos: Vec<S> = theta[1..n].iter().map(|&t| map_to_cor(t)).collect();
                let mut l = correlation_cholesky(n, |i, j| rhos[i.abs_diff(j) - 1]);
                scale_uniform(&mut l, sd);
                l
            }
            CovarianceFamily::HeterogeneousToeplitz => {
                let sds = log_sds(theta, n);
                let rhos: Vec<S> = theta[n..2 * n - 1].iter().map(|&t| map_to_cor(t)).collect();
                let mut l = correlation_cholesky(n, |i, j| rhos[i.abs_diff(j) - 1]);
                scale_rows(&mut l, &sds, n);
                l
            }
            CovarianceFamily::AnteDependence => {
                let sd = theta[0].exp();
                let rhos: Vec<S> = theta[1..n].iter().map(|&t| map_to_cor(t)).collect();
                let mut l = ante_dependence_cholesky(&rhos, n);
                scale_uniform(&mut l, sd);
                l
            }
            CovarianceFamily::HeterogeneousAnteDependence => {
                let sds = log_sds(theta, n);
                let rhos: Vec<S> = theta[n..2 * n - 1].iter().map(|&t| map_to_cor(t)).collect();
                let mut l = ante_dependence_cholesky(&rhos, n);
                scale_rows(&mut l, &sds, n);
                l
            }
        }
    }
}

//! # longcov
//!
//! Exact covariance derivatives for longitudinal and repeated-measures
//! designs. Given a covariance family over a common visit grid and an
//! unconstrained parameter vector, the crate produces the covariance, its
//! inverse, and exact first and second parameter derivatives, restricted to
//! each subject's attended visits, together with the `P`/`Q`/`R` matrix
//! stacks that assemble the observed information of a generalized least
//! squares fit.
//!
//! The pieces compose in layers:
//!
//! - [`scalar`] and [`dual`] provide nestable forward-mode numbers.
//! - [`autodiff`] turns any [`autodiff::DifferentiableMap`] into exact
//!   Jacobians and Hessians.
//! - [`covariance`] defines the families and their Cholesky factor maps.
//! - [`derivatives`] assembles factor derivatives into covariance
//!   derivatives.
//! - [`pattern`] and [`cache`] share per-pattern work across subjects.
//! - [`information`] accumulates the per-subject quadratic forms.

#![deny(dead_code)]
#![deny(unused_imports)]

pub mod autodiff;
pub mod cache;
pub mod covariance;
pub mod derivatives;
pub mod dual;
pub mod information;
pub mod pattern;
pub mod scalar;

pub use cache::{PatternCache, PatternEntry};
pub use covariance::{CholFactorFn, CovarianceError, CovarianceFamily, map_to_cor};
pub use derivatives::{CovarianceDerivatives, derive_covariance};
pub use dual::Dual;
pub use information::{
    InformationTerms, SubjectLayout, accumulate_information, information_terms, subject_layouts,
};
pub use pattern::VisitPattern;
pub use scalar::Scalar;

//! # Covariance Derivatives via the Factor Map
//!
//! [`derive_covariance`] differentiates the Cholesky factor map of a family
//! and assembles exact first and second derivatives of the covariance itself.
//! With `P = dL/dtheta_i` and `P2 = d2L/dtheta_i dtheta_j`, the product rule
//! on `Sigma = L * L^T` gives
//!
//! ```text
//! dSigma_i    = P * L^T + (P * L^T)^T
//! d2Sigma_ij  = P2 * L^T + (P2 * L^T)^T + Pi * Pj^T + (Pi * Pj^T)^T
//! ```
//!
//! Both assemblies are sums of a matrix and its transpose, so every returned
//! block is symmetric by construction and the second-derivative stack
//! satisfies `d2Sigma_ij = d2Sigma_ji` up to rounding.

use crate::autodiff::{DifferentiableMap, hessian, jacobian};
use crate::covariance::{CholFactorFn, CovarianceError, CovarianceFamily};
use ndarray::Array2;

/// Full-grid covariance with its factor and derivative stacks.
///
/// For `q` parameters, `sigma_d1` holds `q` blocks and `sigma_d2` holds
/// `q * q` blocks with the `(i, j)` block at index `i * q + j`.
#[derive(Debug, Clone)]
pub struct CovarianceDerivatives {
    /// Lower Cholesky factor of `sigma`.
    pub chol: Array2<f64>,
    /// Covariance over the full visit grid.
    pub sigma: Array2<f64>,
    /// First derivatives of `sigma`, one block per parameter.
    pub sigma_d1: Vec<Array2<f64>>,
    /// Second derivatives of `sigma`, row-major over parameter pairs.
    pub sigma_d2: Vec<Array2<f64>>,
}

/// Evaluate and differentiate the covariance of `family` at `theta`.
///
/// The factor map is evaluated three times: plain for values, on duals for
/// the Jacobian, and on nested duals for the Hessian. A factor with NaN
/// entries or a non-positive diagonal (a non positive definite construction,
/// e.g. a Toeplitz correlation outside its validity region) is rejected with
/// [`CovarianceError::SingularCovariance`] before any derivative work.
pub fn derive_covariance(
    family: CovarianceFamily,
    n_visits: usize,
    theta: &[f64],
) -> Result<CovarianceDerivatives, CovarianceError> {
    let map = CholFactorFn::new(family, n_visits, theta.len())?;
    let n = n_visits;
    let q = theta.len();
    let nn = n * n;

    let l_flat = map.eval(theta);
    let finite = l_flat.iter().all(|v| v.is_finite());
    let positive_diag = (0..n).all(|i| l_flat[i * n + i] > 0.0);
    if !finite || !positive_diag {
        return Err(CovarianceError::SingularCovariance {
            pattern: (0..n).collect(),
        });
    }

    let jac = jacobian(&map, theta);
    let hess = hessian(&map, theta);

    let l = block(&l_flat, 0, n);
    let sigma = l.dot(&l.t());

    let l_d1: Vec<Array2<f64>> = (0..q).map(|i| block(&jac, i * nn, n)).collect();

    let mut sigma_d1 = Vec::with_capacity(q);
    for li in &l_d1 {
        let pllt = li.dot(&l.t());
        sigma_d1.push(&pllt + &pllt.t());
    }

    let mut sigma_d2 = Vec::with_capacity(q * q);
    for i in 0..q {
        for j in 0..q {
            let lij = block(&hess, (i * q + j) * nn, n);
            let a = lij.dot(&l.t());
            let b = l_d1[i].dot(&l_d1[j].t());
            sigma_d2.push(&a + &a.t() + &b + &b.t());
        }
    }

    Ok(CovarianceDerivatives {
        chol: l,
        sigma,
        sigma_d1,
        sigma_d2,
    })
}

/// View one `n x n` row-major block of a flat buffer as an owned array.
fn block(flat: &[f64], offset: usize, n: usize) -> Array2<f64> {
    Array2::from_shape_fn((n, n), |(i, j)| flat[offset + i * n + j])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sigma_at(family: CovarianceFamily, n: usize, theta: &[f64]) -> Array2<f64> {
        let map = CholFactorFn::new(family, n, theta.len()).unwrap();
        let l = block(&map.eval(theta), 0, n);
        l.dot(&l.t())
    }

    fn assert_block_close(got: &Array2<f64>, want: &Array2<f64>, tol: f64, context: &str) {
        for ((i, j), g) in got.indexed_iter() {
            let w = want[[i, j]];
            assert!(
                (g - w).abs() <= tol * (1.0 + w.abs()),
                "{context} at ({i}, {j}): got {g}, want {w}"
            );
        }
    }

    /// Deterministic parameter vectors, small enough to keep every family
    /// positive definite.
    fn test_theta(family: CovarianceFamily, n: usize) -> Vec<f64> {
        (0..family.param_count(n))
            .map(|k| 0.35 * ((k as f64) * 0.7 + 0.3).sin())
            .collect()
    }

    #[test]
    fn one_by_one_unstructured_has_closed_form_derivatives() {
        // sigma = exp(2t): d1 = 2 exp(2t), d2 = 4 exp(2t).
        let t = 0.3;
        let d = derive_covariance(CovarianceFamily::Unstructured, 1, &[t]).unwrap();
        let s = (2.0 * t).exp();
        assert!((d.sigma[[0, 0]] - s).abs() < 1e-14);
        assert!((d.sigma_d1[0][[0, 0]] - 2.0 * s).abs() < 1e-13);
        assert!((d.sigma_d2[0][[0, 0]] - 4.0 * s).abs() < 1e-13);
    }

    #[test]
    fn two_by_two_unstructured_cross_derivatives_are_exact() {
        // theta = [a, b, c], L = [[e^a, 0], [b, e^c]]:
        //   sigma = [[e^2a, b e^a], [b e^a, b^2 + e^2c]]
        let (a, b, c) = (0.2, -0.4, 0.1);
        let d = derive_covariance(CovarianceFamily::Unstructured, 2, &[a, b, c]).unwrap();
        let q = 3;
        let ea = a.exp();

        // d sigma / db
        let want_db = ndarray::arr2(&[[0.0, ea], [ea, 2.0 * b]]);
        assert_block_close(&d.sigma_d1[1], &want_db, 1e-13, "d sigma/db");

        // d2 sigma / db2 is constant in b
        let want_dbb = ndarray::arr2(&[[0.0, 0.0], [0.0, 2.0]]);
        assert_block_close(&d.sigma_d2[q + 1], &want_dbb, 1e-13, "d2 sigma/db2");

        // The mixed block d2 sigma / da db exists only through the
        // first-derivative cross products and must come out symmetric.
        let want_dab = ndarray::arr2(&[[0.0, ea], [ea, 0.0]]);
        assert_block_close(&d.sigma_d2[1], &want_dab, 1e-13, "d2 sigma/da db");
        assert_block_close(&d.sigma_d2[q], &want_dab, 1e-13, "d2 sigma/db da");
    }

    #[test]
    fn first_derivatives_match_central_differences_for_every_family() {
        let n = 3;
        let h = 1e-5;
        for family in CovarianceFamily::ALL {
            let theta = test_theta(family, n);
            let q = theta.len();
            let d = derive_covariance(family, n, &theta).unwrap();
            for i in 0..q {
                let mut up = theta.clone();
                let mut dn = theta.clone();
                up[i] += h;
                dn[i] -= h;
                let fd = (&sigma_at(family, n, &up) - &sigma_at(family, n, &dn)) / (2.0 * h);
                assert_block_close(&d.sigma_d1[i], &fd, 1e-5, &format!("{family} d1[{i}]"));
            }
        }
    }

    #[test]
    fn second_derivatives_match_central_differences_of_first() {
        let n = 3;
        let h = 1e-5;
        for family in [
            CovarianceFamily::Unstructured,
            CovarianceFamily::CompoundSymmetry,
            CovarianceFamily::HeterogeneousAr1,
            CovarianceFamily::AnteDependence,
            CovarianceFamily::Toeplitz,
        ] {
            let theta = test_theta(family, n);
            let q = theta.len();
            let d = derive_covariance(family, n, &theta).unwrap();
            for i in 0..q {
                for j in 0..q {
                    let mut up = theta.clone();
                    let mut dn = theta.clone();
                    up[j] += h;
                    dn[j] -= h;
                    let d_up = derive_covariance(family, n, &up).unwrap();
                    let d_dn = derive_covariance(family, n, &dn).unwrap();
                    let fd = (&d_up.sigma_d1[i] - &d_dn.sigma_d1[i]) / (2.0 * h);
                    assert_block_close(
                        &d.sigma_d2[i * q + j],
                        &fd,
                        1e-4,
                        &format!("{family} d2[{i},{j}]"),
                    );
                }
            }
        }
    }

    #[test]
    fn derivative_blocks_are_symmetric_and_pair_symmetric() {
        let n = 4;
        let family = CovarianceFamily::HeterogeneousToeplitz;
        let theta = test_theta(family, n);
        let q = theta.len();
        let d = derive_covariance(family, n, &theta).unwrap();

        for (i, b) in d.sigma_d1.iter().enumerate() {
            assert_block_close(b, &b.t().to_owned(), 1e-12, &format!("d1[{i}] symmetry"));
        }
        for i in 0..q {
            for j in 0..q {
                let ij = &d.sigma_d2[i * q + j];
                assert_block_close(ij, &ij.t().to_owned(), 1e-12, "d2 block symmetry");
                assert_block_close(ij, &d.sigma_d2[j * q + i], 1e-10, "d2 pair symmetry");
            }
        }
    }

    #[test]
    fn non_positive_definite_construction_is_rejected() {
        // rho = map_to_cor(-5) is about -0.98, far below the -1/2 bound for a
        // 3-visit compound-symmetry correlation matrix.
        let err = derive_covariance(CovarianceFamily::CompoundSymmetry, 3, &[0.0, -5.0])
            .unwrap_err();
        match err {
            CovarianceError::SingularCovariance { pattern } => {
                assert_eq!(pattern, vec![0, 1, 2]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

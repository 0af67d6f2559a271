//! # Pattern-Keyed Covariance Cache
//!
//! Longitudinal designs repeat the same attendance patterns across many
//! subjects, and everything the accumulator needs per subject depends only on
//! the pattern, not on the subject. This cache computes the full-grid
//! covariance, its inverse, and both derivative stacks once at construction,
//! then materializes restricted versions per distinct [`VisitPattern`] on
//! first lookup.
//!
//! Restriction of `sigma` and of every derivative block is plain row/column
//! selection, because selection commutes with differentiation. The restricted
//! inverse does not restrict: `(S * Sigma * S^T)^-1` is not a submatrix of
//! `Sigma^-1`, so each new pattern pays one Cholesky factorization of its
//! restricted covariance. A relaxed counter tracks how many such
//! factorizations have run, which makes cache idempotence observable in
//! tests.
//!
//! Lookups are lock-free reads on a sharded map; a missing key is computed by
//! exactly one thread while other threads asking for the same key wait for
//! the inserted value.

use crate::covariance::{CovarianceError, CovarianceFamily};
use crate::derivatives::derive_covariance;
use crate::pattern::VisitPattern;
use ahash::RandomState;
use dashmap::DashMap;
use ndarray::{Array2, ArrayView1};
use ndarray_linalg::{Cholesky, Diag, SolveTriangular, UPLO};
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Everything the information accumulator needs for one visit pattern.
///
/// For `q = n_theta` parameters over a pattern of `k` visits: `sigma` and
/// `sigma_inv` are `k x k`, `sigma_d1` holds `q` blocks, and `sigma_d2`
/// holds `q * q` blocks with pair `(i, j)` at index `i * q + j`.
#[derive(Debug)]
pub struct PatternEntry {
    pub sigma: Array2<f64>,
    pub sigma_inv: Array2<f64>,
    pub sigma_d1: Vec<Array2<f64>>,
    pub sigma_d2: Vec<Array2<f64>>,
}

/// Shared, thread-safe store of per-pattern covariance material at one
/// parameter point.
#[derive(Debug)]
pub struct PatternCache {
    family: CovarianceFamily,
    n_visits: usize,
    n_theta: usize,
    full: Arc<PatternEntry>,
    restricted: DashMap<VisitPattern, Arc<PatternEntry>, RandomState>,
    refactorizations: AtomicUsize,
}

impl PatternCache {
    /// Build the cache for `family` at the parameter point `theta`.
    ///
    /// All derivative work for the full grid happens here; subsequent lookups
    /// only restrict and, for new patterns, refactorize.
    pub fn new(
        family: CovarianceFamily,
        n_visits: usize,
        theta: ArrayView1<f64>,
    ) -> Result<Self, CovarianceError> {
        let theta = theta.to_vec();
        let derived = derive_covariance(family, n_visits, &theta)?;
        let full_pattern = VisitPattern::full(n_visits);
        let sigma_inv = invert_from_factor(&derived.chol, &full_pattern)?;
        log::debug!(
            "pattern cache ready: family={family}, n_visits={n_visits}, n_theta={}",
            theta.len()
        );
        Ok(PatternCache {
            family,
            n_visits,
            n_theta: theta.len(),
            full: Arc::new(PatternEntry {
                sigma: derived.sigma,
                sigma_inv,
                sigma_d1: derived.sigma_d1,
                sigma_d2: derived.sigma_d2,
            }),
            restricted: DashMap::with_hasher(RandomState::new()),
            refactorizations: AtomicUsize::new(0),
        })
    }

    pub fn family(&self) -> CovarianceFamily {
        self.family
    }

    pub fn n_visits(&self) -> usize {
        self.n_visits
    }

    pub fn n_theta(&self) -> usize {
        self.n_theta
    }

    /// Number of restricted Cholesky factorizations performed so far.
    ///
    /// Grows by one the first time each non-full, non-empty pattern is looked
    /// up and never again for that pattern.
    pub fn refactorizations(&self) -> usize {
        self.refactorizations.load(Ordering::Relaxed)
    }

    /// Look up (or compute and insert) the entry for `pattern`.
    ///
    /// The full pattern is answered from the eagerly built entry without
    /// touching the map. Concurrent first lookups of the same missing pattern
    /// compute it exactly once.
    pub fn entry(&self, pattern: &VisitPattern) -> Result<Arc<PatternEntry>, CovarianceError> {
        // Patterns validate against their own grid at construction; a cache
        // serving a smaller grid must still reject them here.
        if let Some(&last) = pattern.visits().last() {
            if last >= self.n_visits {
                return Err(CovarianceError::PatternOutOfRange {
                    index: last,
                    n_visits: self.n_visits,
                });
            }
        }
        if pattern.is_full(self.n_visits) {
            return Ok(Arc::clone(&self.full));
        }
        if let Some(hit) = self.restricted.get(pattern) {
            return Ok(Arc::clone(hit.value()));
        }
        let guard = self
            .restricted
            .entry(pattern.clone())
            .or_try_insert_with(|| self.compute_restricted(pattern).map(Arc::new))?;
        Ok(Arc::clone(guard.value()))
    }

    /// Populate entries for `patterns` in parallel, stopping at the first
    /// error. Duplicates in the input are fine and cost one computation.
    pub fn warm(&self, patterns: &[VisitPattern]) -> Result<(), CovarianceError> {
        patterns
            .par_iter()
            .try_for_each(|pattern| self.entry(pattern).map(|_| ()))
    }

    fn compute_restricted(&self, pattern: &VisitPattern) -> Result<PatternEntry, CovarianceError> {
        let sigma = pattern.restrict(self.full.sigma.view());
        let sigma_d1: Vec<Array2<f64>> = self
            .full
            .sigma_d1
            .iter()
            .map(|b| pattern.restrict(b.view()))
            .collect();
        let sigma_d2: Vec<Array2<f64>> = self
            .full
            .sigma_d2
            .iter()
            .map(|b| pattern.restrict(b.view()))
            .collect();
        if pattern.is_empty() {
            return Ok(PatternEntry {
                sigma,
                sigma_inv: Array2::zeros((0, 0)),
                sigma_d1,
                sigma_d2,
            });
        }
        log::debug!("factorizing restricted covariance for pattern {:?}", pattern.visits());
        self.refactorizations.fetch_add(1, Ordering::Relaxed);
        let chol = sigma.cholesky(UPLO::Lower).map_err(|_| {
            CovarianceError::SingularCovariance {
                pattern: pattern.visits().to_vec(),
            }
        })?;
        let sigma_inv = invert_from_factor(&chol, pattern)?;
        Ok(PatternEntry {
            sigma,
            sigma_inv,
            sigma_d1,
            sigma_d2,
        })
    }
}

/// Invert a covariance from its lower factor via two triangular solves:
/// `Sigma^-1 = (L^-1)^T * (L^-1)`.
fn invert_from_factor(
    l: &Array2<f64>,
    pattern: &VisitPattern,
) -> Result<Array2<f64>, CovarianceError> {
    let eye = Array2::eye(l.nrows());
    let l_inv = l
        .solve_triangular(UPLO::Lower, Diag::NonUnit, &eye)
        .map_err(|_| CovarianceError::SingularCovariance {
            pattern: pattern.visits().to_vec(),
        })?;
    Ok(l_inv.t().dot(&l_inv))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs_cache(theta: [f64; 2], n_visits: usize) -> PatternCache {
        PatternCache::new(
            CovarianceFamily::CompoundSymmetry,
            n_visits,
            ndarray::aview1(&theta),
        )
        .unwrap()
    }

    fn assert_identity(m: &Array2<f64>, tol: f64) {
        for ((i, j), v) in m.indexed_iter() {
            let want = if i == j { 1.0 } else { 0.0 };
            assert!((v - want).abs() < tol, "({i}, {j}): got {v}");
        }
    }

    #[test]
    fn full_pattern_is_served_from_the_eager_entry() {
        let cache = cs_cache([0.2, 0.5], 3);
        let full = VisitPattern::full(3);
        let a = cache.entry(&full).unwrap();
        let b = cache.entry(&full).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.refactorizations(), 0);
        assert_identity(&a.sigma_inv.dot(&a.sigma), 1e-10);
        assert_eq!(a.sigma_d1.len(), 2);
        assert_eq!(a.sigma_d2.len(), 4);
    }

    #[test]
    fn repeated_lookups_factorize_once_and_share_the_entry() {
        let cache = cs_cache([0.2, 0.5], 3);
        let pattern = VisitPattern::new(vec![0, 2], 3).unwrap();
        let a = cache.entry(&pattern).unwrap();
        let b = cache.entry(&pattern).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.refactorizations(), 1);
    }

    #[test]
    fn restricted_blocks_are_selections_but_the_inverse_is_not() {
        let cache = cs_cache([0.3, 0.6], 3);
        let full = cache.entry(&VisitPattern::full(3)).unwrap();
        let pattern = VisitPattern::new(vec![0, 2], 3).unwrap();
        let entry = cache.entry(&pattern).unwrap();

        // Covariance and every derivative block restrict by selection.
        let idx = [0usize, 2];
        for (r, &i) in idx.iter().enumerate() {
            for (c, &j) in idx.iter().enumerate() {
                assert_eq!(entry.sigma[[r, c]], full.sigma[[i, j]]);
                for q in 0..cache.n_theta() {
                    assert_eq!(entry.sigma_d1[q][[r, c]], full.sigma_d1[q][[i, j]]);
                }
                for q in 0..cache.n_theta() * cache.n_theta() {
                    assert_eq!(entry.sigma_d2[q][[r, c]], full.sigma_d2[q][[i, j]]);
                }
            }
        }

        // The inverse comes from refactorizing the restricted covariance.
        assert_identity(&entry.sigma_inv.dot(&entry.sigma), 1e-10);
        let selected_inverse = pattern.restrict(full.sigma_inv.view());
        let diff = (&entry.sigma_inv - &selected_inverse).mapv(f64::abs).sum();
        assert!(
            diff > 1e-3,
            "restricted inverse should differ from a selected inverse"
        );
    }

    #[test]
    fn empty_pattern_yields_empty_blocks_without_factorizing() {
        let cache = cs_cache([0.1, 0.4], 3);
        let entry = cache.entry(&VisitPattern::new(vec![], 3).unwrap()).unwrap();
        assert_eq!(entry.sigma.dim(), (0, 0));
        assert_eq!(entry.sigma_inv.dim(), (0, 0));
        assert!(entry.sigma_d1.iter().all(|b| b.dim() == (0, 0)));
        assert_eq!(cache.refactorizations(), 0);
    }

    #[test]
    fn concurrent_warm_of_one_pattern_factorizes_once() {
        let cache = cs_cache([0.2, 0.5], 4);
        let patterns: Vec<VisitPattern> = (0..64)
            .map(|_| VisitPattern::new(vec![1, 3], 4).unwrap())
            .collect();
        cache.warm(&patterns).unwrap();
        assert_eq!(cache.refactorizations(), 1);
    }

    #[test]
    fn warm_counts_one_factorization_per_distinct_pattern() {
        let cache = cs_cache([0.2, 0.5], 4);
        let patterns = vec![
            VisitPattern::new(vec![0, 1], 4).unwrap(),
            VisitPattern::new(vec![0, 1], 4).unwrap(),
            VisitPattern::full(4),
            VisitPattern::new(vec![2], 4).unwrap(),
            VisitPattern::new(vec![], 4).unwrap(),
        ];
        cache.warm(&patterns).unwrap();
        assert_eq!(cache.refactorizations(), 2);
    }

    #[test]
    fn patterns_from_a_larger_grid_are_rejected() {
        let cache = cs_cache([0.2, 0.5], 3);
        let foreign = VisitPattern::new(vec![0, 2, 4], 5).unwrap();
        let err = cache.entry(&foreign).unwrap_err();
        assert!(matches!(
            err,
            CovarianceError::PatternOutOfRange {
                index: 4,
                n_visits: 3
            }
        ));
    }

    #[test]
    fn non_positive_definite_parameters_fail_at_construction() {
        let err = PatternCache::new(
            CovarianceFamily::CompoundSymmetry,
            3,
            ndarray::aview1(&[0.0, -5.0]),
        )
        .unwrap_err();
        assert!(matches!(err, CovarianceError::SingularCovariance { .. }));
    }

    #[test]
    fn zero_visit_grid_is_rejected() {
        let err = PatternCache::new(
            CovarianceFamily::Unstructured,
            0,
            ndarray::aview1::<f64>(&[]),
        )
        .unwrap_err();
        assert!(matches!(err, CovarianceError::DesignMismatch { .. }));
    }

    #[test]
    fn compound_symmetry_identity_point_inverts_to_identity() {
        // theta = [0, 0]: unit variance, zero correlation, sigma = I.
        let cache = cs_cache([0.0, 0.0], 3);
        let full = cache.entry(&VisitPattern::full(3)).unwrap();
        assert_identity(&full.sigma, 1e-12);
        assert_identity(&full.sigma_inv, 1e-10);
        // d sigma / d log-sd = 2 * sigma = 2I at this point.
        let d0 = &full.sigma_d1[0];
        for ((i, j), v) in d0.indexed_iter() {
            let want = if i == j { 2.0 } else { 0.0 };
            assert!((v - want).abs() < 1e-12, "({i}, {j}): got {v}");
        }
    }
}

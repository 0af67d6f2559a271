//! # Visit Patterns
//!
//! A visit pattern records which visits of the common grid a subject actually
//! attended, as a strictly increasing list of zero-based indices. Patterns
//! are value-semantic: two subjects with the same attendance compare equal,
//! hash equal, and share one cache entry in [`crate::cache::PatternCache`].
//!
//! Validation happens once at construction. Everything downstream relies on
//! the invariant that indices are strictly increasing and inside the grid, so
//! restriction never needs bounds checks of its own.

use crate::covariance::CovarianceError;
use ndarray::{Array2, ArrayView2, Axis};

/// Strictly increasing, in-range visit indices for one subject.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VisitPattern {
    visits: Vec<usize>,
}

impl VisitPattern {
    /// Validate `visits` against a grid of `n_visits` visits.
    ///
    /// Out-of-range indices are reported before ordering problems, so a
    /// pattern that is wrong in both ways surfaces the range error first.
    pub fn new(visits: Vec<usize>, n_visits: usize) -> Result<Self, CovarianceError> {
        for &v in &visits {
            if v >= n_visits {
                return Err(CovarianceError::PatternOutOfRange {
                    index: v,
                    n_visits,
                });
            }
        }
        for w in visits.windows(2) {
            if w[0] >= w[1] {
                return Err(CovarianceError::InvalidPattern {
                    reason: format!(
                        "visit indices must be strictly increasing, got {} followed by {}",
                        w[0], w[1]
                    ),
                });
            }
        }
        Ok(VisitPattern { visits })
    }

    /// The complete-attendance pattern `0, 1, ..., n_visits - 1`.
    pub fn full(n_visits: usize) -> Self {
        VisitPattern {
            visits: (0..n_visits).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.visits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visits.is_empty()
    }

    pub fn visits(&self) -> &[usize] {
        &self.visits
    }

    /// Whether this pattern covers the whole grid it was validated against.
    pub fn is_full(&self, n_visits: usize) -> bool {
        self.visits.len() == n_visits
    }

    /// The 0/1 selection matrix `S` with one row per observed visit;
    /// `S * v` picks the observed entries of a full-grid vector.
    pub fn selection_matrix(&self, n_visits: usize) -> Array2<f64> {
        let mut s = Array2::zeros((self.visits.len(), n_visits));
        for (row, &v) in self.visits.iter().enumerate() {
            s[[row, v]] = 1.0;
        }
        s
    }

    /// Restrict a full-grid matrix to the observed rows and columns.
    ///
    /// Same result as `S * m * S^T` without materializing the selection
    /// matrix. An empty pattern yields a `0 x 0` array.
    pub fn restrict(&self, m: ArrayView2<f64>) -> Array2<f64> {
        m.select(Axis(0), &self.visits)
            .select(Axis(1), &self.visits)
    }
}

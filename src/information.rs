//! # Information-Matrix Building Blocks
//!
//! For a subject with design block `X_i` over pattern covariance `Sigma_i`,
//! the second derivative of the generalized least squares quadratic form
//! needs three families of `p x p` matrices, summed over subjects:
//!
//! ```text
//! P_r  = sum_i X_i^T (d Sigma_i^-1 / d theta_r) X_i
//! Q_rs = sum_i X_i^T (d Sigma_i^-1 / d theta_r) Sigma_i (d Sigma_i^-1 / d theta_s) X_i
//! R_rs = sum_i X_i^T Sigma_i^-1 (d2 Sigma_i / d theta_r d theta_s) Sigma_i^-1 X_i
//! ```
//!
//! with `d Sigma^-1 / d theta_r = -Sigma^-1 (d Sigma / d theta_r) Sigma^-1`.
//! The accumulator works from a [`PatternCache`], so per-subject cost is a
//! handful of small matrix products against the cached pattern entry; the
//! pair of minus signs inside `Q` cancels, while `P` keeps its sign.
//!
//! Accumulation runs serially in subject order: the sums are tiny compared
//! to the cached factorization work, and a fixed summation order keeps
//! results bit-reproducible run to run. Parallelism lives in the cache
//! warm-up.

use crate::cache::PatternCache;
use crate::covariance::{CovarianceError, CovarianceFamily};
use crate::pattern::VisitPattern;
use itertools::iproduct;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis, s};

/// Where one subject's rows live in the stacked design, and which visits
/// those rows correspond to.
#[derive(Debug, Clone)]
pub struct SubjectLayout {
    /// First row of this subject's block in the design matrix.
    pub start: usize,
    /// Visits attended, in row order.
    pub pattern: VisitPattern,
}

/// The accumulated `P`, `Q`, and `R` stacks.
///
/// For `q` covariance parameters and `p` design columns: `p_term` has shape
/// `(q, p, p)`; `q_term` and `r_term` have shape `(q * q, p, p)` with the
/// parameter pair `(r, s)` at index `r * q + s`.
#[derive(Debug, Clone)]
pub struct InformationTerms {
    pub p_term: Array3<f64>,
    pub q_term: Array3<f64>,
    pub r_term: Array3<f64>,
}

/// Resolve raw per-subject bookkeeping into validated layouts.
///
/// `subject_starts[s]` is the offset of subject `s` both into the design
/// rows and into `visit_indices`; `subject_counts[s]` is the number of rows
/// in the block. Every block must fit inside the design, and every visit
/// slice must form a valid [`VisitPattern`].
pub fn subject_layouts(
    n_rows: usize,
    n_visits: usize,
    subject_starts: &[usize],
    subject_counts: &[usize],
    visit_indices: &[usize],
) -> Result<Vec<SubjectLayout>, CovarianceError> {
    if subject_starts.len() != subject_counts.len() {
        return Err(CovarianceError::DesignMismatch {
            reason: format!(
                "{} subject offsets but {} subject visit counts",
                subject_starts.len(),
                subject_counts.len()
            ),
        });
    }
    if visit_indices.len() != n_rows {
        return Err(CovarianceError::DesignMismatch {
            reason: format!(
                "design matrix has {n_rows} rows but {} visit indices were supplied",
                visit_indices.len()
            ),
        });
    }
    let mut subjects = Vec::with_capacity(subject_starts.len());
    for (s, (&start, &count)) in subject_starts.iter().zip(subject_counts).enumerate() {
        let end = start
            .checked_add(count)
            .filter(|&end| end <= n_rows)
            .ok_or_else(|| CovarianceError::DesignMismatch {
                reason: format!(
                    "subject {s}: block of {count} rows at offset {start} exceeds the {n_rows}-row design"
                ),
            })?;
        let pattern = VisitPattern::new(visit_indices[start..end].to_vec(), n_visits)?;
        subjects.push(SubjectLayout { start, pattern });
    }
    Ok(subjects)
}

/// One-call pipeline: build the cache, warm it with the distinct patterns,
/// and accumulate over all subjects.
///
/// Fails before any arithmetic if the bookkeeping is inconsistent or the
/// covariance cannot be factorized, so callers never observe a partial sum.
pub fn information_terms(
    family: CovarianceFamily,
    n_visits: usize,
    theta: ArrayView1<f64>,
    x: ArrayView2<f64>,
    subject_starts: &[usize],
    subject_counts: &[usize],
    visit_indices: &[usize],
) -> Result<InformationTerms, CovarianceError> {
    let cache = PatternCache::new(family, n_visits, theta)?;
    let subjects = subject_layouts(
        x.nrows(),
        n_visits,
        subject_starts,
        subject_counts,
        visit_indices,
    )?;
    let mut unique: Vec<VisitPattern> = subjects.iter().map(|s| s.pattern.clone()).collect();
    unique.sort();
    unique.dedup();
    cache.warm(&unique)?;
    log::info!(
        "accumulating information terms: {} subjects, {} distinct visit patterns, family {}",
        subjects.len(),
        unique.len(),
        cache.family()
    );
    accumulate_information(&cache, x, &subjects)
}

/// Serial sweep over subjects against an already constructed cache.
pub fn accumulate_information(
    cache: &PatternCache,
    x: ArrayView2<f64>,
    subjects: &[SubjectLayout],
) -> Result<InformationTerms, CovarianceError> {
    let p = x.ncols();
    let q = cache.n_theta();
    let mut p_term = Array3::zeros((q, p, p));
    let mut q_term = Array3::zeros((q * q, p, p));
    let mut r_term = Array3::zeros((q * q, p, p));

    for subject in subjects {
        let k = subject.pattern.len();
        if subject.start + k > x.nrows() {
            return Err(CovarianceError::DesignMismatch {
                reason: format!(
                    "subject block of {k} rows at offset {} exceeds the {}-row design",
                    subject.start,
                    x.nrows()
                ),
            });
        }
        let xi = x.slice(s![subject.start..subject.start + k, ..]);
        let entry = cache.entry(&subject.pattern)?;

        // z = Sigma^-1 X_i; g_r = Sigma^-1 d1_r Sigma^-1 X_i, so that the
        // inverse derivative applied to X_i is -g_r.
        let z = entry.sigma_inv.dot(&xi);
        let g: Vec<Array2<f64>> = entry
            .sigma_d1
            .iter()
            .map(|d| entry.sigma_inv.dot(&d.dot(&z)))
            .collect();

        for (r, g_r) in g.iter().enumerate() {
            let mut slot = p_term.index_axis_mut(Axis(0), r);
            slot.scaled_add(-1.0, &xi.t().dot(g_r));
        }

        let sg: Vec<Array2<f64>> = g.iter().map(|g_s| entry.sigma.dot(g_s)).collect();
        for (r, s_idx) in iproduct!(0..q, 0..q) {
            let mut slot = q_term.index_axis_mut(Axis(0), r * q + s_idx);
            slot += &g[r].t().dot(&sg[s_idx]);
            let mut slot = r_term.index_axis_mut(Axis(0), r * q + s_idx);
            slot += &z.t().dot(&entry.sigma_d2[r * q + s_idx].dot(&z));
        }
    }

    Ok(InformationTerms {
        p_term,
        q_term,
        r_term,
    })
}

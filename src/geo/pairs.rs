//! Finite-difference pairs operator over a k-nearest-neighbor graph.
//!
//! For each observation we take the k-th smallest non-zero distance as a
//! per-row threshold and keep every pair `(i, j)` with
//! `0 < distance(i, j) <= threshold(i)`. Each kept pair contributes one
//! operator row with `+1/k` at column `i` and `-1/k` at column `j`, so that
//! `lambda * ||pairs @ fractions||^2` penalizes abrupt spatial changes in
//! mixing fractions between nearby samples.
//!
//! Thresholds are computed independently per row, so reciprocal pairs
//! (`i -> j` and `j -> i`) can both appear; they are intentionally not
//! deduplicated (this matches the reference behavior).

use nalgebra::DMatrix;

use crate::domain::ObservationTable;
use crate::error::OmpaError;
use crate::geo::pairwise_distances;

/// Sparse `num_pairs × num_observations` finite-difference operator.
///
/// Stored as one `(i, j)` index pair per row with a shared `±1/k`
/// coefficient; `dense()` materializes the full matrix for tests and small
/// problems.
#[derive(Debug, Clone)]
pub struct PairsOperator {
    pairs: Vec<(usize, usize)>,
    coeff: f64,
    num_observations: usize,
}

impl PairsOperator {
    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    pub fn num_observations(&self) -> usize {
        self.num_observations
    }

    /// The shared `1/k` magnitude of every non-zero entry.
    pub fn coeff(&self) -> f64 {
        self.coeff
    }

    /// Iterate `(i, j)` index pairs; row r of the operator has `+coeff` at
    /// column `i` and `-coeff` at column `j`.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.pairs.iter().copied()
    }

    /// Dense materialization (rows = pairs, columns = observations).
    pub fn dense(&self) -> DMatrix<f64> {
        let mut out = DMatrix::<f64>::zeros(self.pairs.len(), self.num_observations);
        for (row, &(i, j)) in self.pairs.iter().enumerate() {
            out[(row, i)] = self.coeff;
            out[(row, j)] = -self.coeff;
        }
        out
    }

    /// Number of operator rows whose `+1/k` entry sits at observation `i`.
    pub fn outgoing_pairs(&self, i: usize) -> usize {
        self.pairs.iter().filter(|&&(a, _)| a == i).count()
    }
}

/// Build the pairs operator from a precomputed symmetric distance matrix.
///
/// Precondition: `k` is at least 1 and smaller than the number of
/// observations (there must be a k-th smallest non-zero distance per row).
pub fn pairs_from_distances(
    distances: &DMatrix<f64>,
    k: usize,
) -> Result<PairsOperator, OmpaError> {
    let n = distances.nrows();
    if distances.ncols() != n {
        return Err(OmpaError::new(
            3,
            format!(
                "Distance matrix must be square, got {}x{}.",
                distances.nrows(),
                distances.ncols()
            ),
        ));
    }
    if k == 0 || k >= n {
        return Err(OmpaError::new(
            2,
            format!("Neighbor count k={k} must satisfy 1 <= k < {n} observations."),
        ));
    }

    let mut pairs = Vec::new();
    for i in 0..n {
        let mut nonzero: Vec<f64> = (0..n)
            .map(|j| distances[(i, j)])
            .filter(|&d| d > 0.0)
            .collect();
        if nonzero.len() < k {
            return Err(OmpaError::new(
                3,
                format!("Observation {i} has fewer than {k} distinct neighbors."),
            ));
        }
        nonzero.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let threshold = nonzero[k - 1];

        for j in 0..n {
            let d = distances[(i, j)];
            if d > 0.0 && d <= threshold {
                pairs.push((i, j));
            }
        }
    }

    Ok(PairsOperator {
        pairs,
        coeff: 1.0 / k as f64,
        num_observations: n,
    })
}

/// Build the pairs operator directly from observation positions.
pub fn build_pairs_operator(
    observations: &ObservationTable,
    depth_field: &str,
    depth_scale: f64,
    k: usize,
) -> Result<PairsOperator, OmpaError> {
    let distances = pairwise_distances(observations, depth_field, depth_scale)?;
    pairs_from_distances(&distances, k)
}

//! Unconstrained least squares solver.
//!
//! The end-member refinement step repeatedly solves small linear regression
//! problems of the form:
//!
//! ```text
//! minimize ||F E - T||^2
//! ```
//!
//! where `F` holds the fixed mixing fractions and `T` stacks one
//! converted-corrected observation column per tracer. No sign or sum
//! constraint applies here, so a direct solve is enough.
//!
//! Implementation choices:
//! - SVD rather than QR, so tall systems (more observations than end members)
//!   are handled robustly even when fraction columns are nearly collinear
//!   (observations dominated by the same pair of water masses produce exactly
//!   that).
//! - The parameter dimension is tiny (a handful of end members), so SVD cost
//!   is irrelevant next to the QP solves.

use nalgebra::DMatrix;

/// Solve `min ||X B - Y||^2` for a matrix right-hand side, reusing one SVD
/// factorization across the columns.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares_multi(x: &DMatrix<f64>, y: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if the strict solve fails.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

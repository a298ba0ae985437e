//! Core constrained weighted least-squares solve.
//!
//! Given:
//! - the weighted mixing matrix `A` (end-member rows + conversion-ratio rows)
//! - weighted observations `b`
//! - a per-observation usage-penalty matrix
//! - sign constraints for the converted columns
//! - optionally a pairs operator and smoothness weight
//!
//! we solve one joint QP over `X` (observations × (end members + converted
//! columns)):
//!
//! ```text
//! minimize ||X A - b||^2 + ||X[:, :n_em] ⊙ penalty||^2
//!          + lambda * ||pairs @ X[:, :n_em]||^2
//! subject to X[:, :n_em] >= 0
//!            sum(X[:, :n_em], axis=1) == 1     (when enabled)
//!            sign ⊙ X[:, n_em..] >= 0
//! ```
//!
//! Infeasibility (or hitting the iteration cap) is fatal here: there is no
//! automatic retry or relaxation, the error message suggests lowering tracer
//! weights instead.
//!
//! After the solve, tiny constraint violations from solver tolerance are
//! corrected: negative fractions are clamped to zero and each row
//! renormalized to sum one, converted values are clamped to their
//! sign-constrained half-line. Residuals are recomputed after the correction
//! and both the pre- and post-correction totals are reported.

use nalgebra::{DMatrix, DVector};

use crate::domain::GroupSigns;
use crate::error::OmpaError;
use crate::geo::PairsOperator;
use crate::solver::{Program, SolveStatus};

/// Inputs of one core solve. `a_weighted` / `b_weighted` already carry the
/// per-tracer weights.
pub struct CoreInputs<'a> {
    /// (end members + converted columns) × tracers.
    pub a_weighted: &'a DMatrix<f64>,
    /// observations × tracers.
    pub b_weighted: &'a DMatrix<f64>,
    pub num_end_members: usize,
    /// observations × end members, zero where unspecified.
    pub usage_penalty: &'a DMatrix<f64>,
    /// One sign constraint per converted group.
    pub signs: &'a [GroupSigns],
    /// Group index of each converted column.
    pub conv_col_group: &'a [usize],
    pub smoothness: Option<(&'a PairsOperator, f64)>,
    pub sum_to_one: bool,
}

/// Corrected solution of one core solve.
#[derive(Debug, Clone)]
pub struct CoreOutput {
    /// observations × (end members + converted columns), post-correction.
    pub x: DMatrix<f64>,
    pub fractions: DMatrix<f64>,
    pub converted: DMatrix<f64>,
    /// Per-observation weighted residual sum of squares, pre-correction.
    pub residuals_sq_precorrection: DVector<f64>,
    /// Per-observation weighted residual sum of squares, post-correction.
    pub residuals_sq: DVector<f64>,
    pub residual_sum_precorrection: f64,
    pub residual_sum: f64,
    pub status: SolveStatus,
    /// Backend-reported objective value.
    pub objective: f64,
}

pub fn core_solve(inputs: &CoreInputs<'_>) -> Result<CoreOutput, OmpaError> {
    let a = inputs.a_weighted;
    let b = inputs.b_weighted;
    let n = b.nrows();
    let k = a.nrows();
    let n_em = inputs.num_end_members;
    let n_conv = k - n_em;

    if a.ncols() != b.ncols() {
        return Err(OmpaError::new(
            4,
            format!(
                "Mixing matrix has {} tracer columns but observations have {}.",
                a.ncols(),
                b.ncols()
            ),
        ));
    }
    if inputs.conv_col_group.len() != n_conv {
        return Err(OmpaError::new(
            4,
            "Converted-column group map does not match the mixing matrix.",
        ));
    }

    let idx = |obs: usize, col: usize| obs * k + col;
    let mut program = Program::new(n * k);

    // ||X A - b||^2 expands, per observation row x_i, into
    // x_i (A A') x_i' - 2 (A b_i') . x_i + const.
    let gram = a * a.transpose(); // k × k
    let ab = a * b.transpose(); // k × n

    for i in 0..n {
        for c in 0..k {
            // x' G x contributes G[c][c] * x_c^2 on the diagonal and
            // 2 * G[c][d] * x_c * x_d for each unordered pair c < d.
            program.add_quad_objective(idx(i, c), idx(i, c), gram[(c, c)]);
            for d in (c + 1)..k {
                program.add_quad_objective(idx(i, c), idx(i, d), 2.0 * gram[(c, d)]);
            }
            program.add_linear_objective(idx(i, c), -2.0 * ab[(c, i)]);
        }
        for e in 0..n_em {
            let p = inputs.usage_penalty[(i, e)];
            if p != 0.0 {
                program.add_quad_objective(idx(i, e), idx(i, e), p * p);
            }
        }
    }

    // The converted columns are left out of the smoothness penalty: they live
    // on a different scale than fractions.
    if let Some((pairs, lambda)) = inputs.smoothness {
        let c2 = lambda * pairs.coeff() * pairs.coeff();
        if c2 > 0.0 {
            for (pi, pj) in pairs.pairs() {
                for e in 0..n_em {
                    program.add_quad_objective(idx(pi, e), idx(pi, e), c2);
                    program.add_quad_objective(idx(pj, e), idx(pj, e), c2);
                    program.add_quad_objective(idx(pi, e), idx(pj, e), -2.0 * c2);
                }
            }
        }
    }

    for i in 0..n {
        if inputs.sum_to_one {
            let row: Vec<(usize, f64)> = (0..n_em).map(|e| (idx(i, e), 1.0)).collect();
            program.add_eq_constraint(row, 1.0);
        }
        for e in 0..n_em {
            program.add_ineq_constraint(vec![(idx(i, e), -1.0)], 0.0);
        }
        for c in 0..n_conv {
            let sign = inputs.signs[inputs.conv_col_group[c]].sign_for(i);
            program.add_ineq_constraint(vec![(idx(i, n_em + c), -sign)], 0.0);
        }
    }

    let solution = program.solve()?;
    if solution.status != SolveStatus::Optimal {
        return Err(OmpaError::new(
            4,
            format!(
                "OMPA solve failed (solver status: {:?}); consider lowering tracer weights.",
                solution.status
            ),
        ));
    }

    let mut x = DMatrix::<f64>::zeros(n, k);
    for i in 0..n {
        for c in 0..k {
            x[(i, c)] = solution.x[idx(i, c)];
        }
    }

    let residuals_sq_precorrection = weighted_residuals(&x, a, b);

    // Post-solve correction against solver tolerance.
    for i in 0..n {
        for e in 0..n_em {
            if x[(i, e)] < 0.0 {
                x[(i, e)] = 0.0;
            }
        }
        if inputs.sum_to_one {
            let total: f64 = (0..n_em).map(|e| x[(i, e)]).sum();
            if total > 1e-12 {
                for e in 0..n_em {
                    x[(i, e)] /= total;
                }
            }
        }
        for c in 0..n_conv {
            let sign = inputs.signs[inputs.conv_col_group[c]].sign_for(i);
            if sign * x[(i, n_em + c)] < 0.0 {
                x[(i, n_em + c)] = 0.0;
            }
        }
    }

    let residuals_sq = weighted_residuals(&x, a, b);
    let residual_sum_precorrection = residuals_sq_precorrection.sum();
    let residual_sum = residuals_sq.sum();

    let fractions = x.columns(0, n_em).into_owned();
    let converted = x.columns(n_em, n_conv).into_owned();

    Ok(CoreOutput {
        x,
        fractions,
        converted,
        residuals_sq_precorrection,
        residuals_sq,
        residual_sum_precorrection,
        residual_sum,
        status: solution.status,
        objective: solution.objective,
    })
}

/// Per-observation `||x_i A - b_i||²` for weighted `A`, `b`.
fn weighted_residuals(x: &DMatrix<f64>, a: &DMatrix<f64>, b: &DMatrix<f64>) -> DVector<f64> {
    let r = x * a - b;
    DVector::from_iterator(
        r.nrows(),
        r.row_iter().map(|row| row.iter().map(|v| v * v).sum()),
    )
}

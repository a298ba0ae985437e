//! Nullspace-based ambiguity quantification.
//!
//! The linear mixing equation usually does not pin the solution down
//! uniquely: directions in the nullspace of the mixing matrix (augmented
//! with the mass-conservation row) change nothing about the reconstructed
//! tracer values. This module bounds how far a solution could drift along
//! those directions while staying feasible, for a caller-chosen linear
//! objective such as "maximize one end member's fraction", by solving two
//! small LPs per observation (one per assumed converted-variable sign) and
//! keeping the better one.
//!
//! The nullspace is extracted as the orthogonal complement of the augmented
//! matrix's row space: rows are unit-normalized (tracer rows can sit orders
//! of magnitude above the mass row, and scaling rows never changes the
//! kernel), a thin SVD yields the row-space basis, and the eigenvectors of
//! the kernel projector `I - V V'` with eigenvalue near one form the basis.
//! The projector's spectrum is {0, 1}, so this stays accurate at realistic
//! tracer magnitudes where decomposing `M' M` directly would not. The basis
//! is checked hard against `‖M N‖∞ < 1e-8` on the normalized matrix; a
//! violation is an internal invariant failure, not a user error.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rayon::prelude::*;

use crate::error::OmpaError;
use crate::fit::OmpaSoln;
use crate::problem::OmpaProblem;
use crate::solver::{Program, SolveStatus};

/// Max |entry| allowed in `M N` for the basis to count as a nullspace.
const NULLSPACE_TOL: f64 = 1e-8;

/// Best alternative solution found for one observation.
#[derive(Debug, Clone)]
pub struct ObservationAmbiguity {
    /// Achieved objective `c · x` at the perturbed solution.
    pub objective: f64,
    /// The converted-variable sign assumed by the winning LP.
    pub sign: f64,
    /// Perturbed and re-corrected solution row (fractions + converted).
    pub x: DVector<f64>,
    /// False when both LPs were infeasible and the original row was kept.
    pub shifted: bool,
}

/// Nullspace basis of the mixing matrix augmented with the
/// mass-conservation row.
///
/// The augmented matrix `M` has one row per tracer (the columns of `A`
/// transposed) plus a final row with ones over the end-member entries and
/// zeros over the converted entries; a basis vector `v` then satisfies both
/// `v · A = 0` and `sum(v[:n_em]) = 0`.
pub fn nullspace_basis(
    a: &DMatrix<f64>,
    num_end_members: usize,
) -> Result<DMatrix<f64>, OmpaError> {
    let k = a.nrows();
    let t = a.ncols();

    let mut m = DMatrix::<f64>::zeros(t + 1, k);
    for j in 0..t {
        for c in 0..k {
            m[(j, c)] = a[(c, j)];
        }
    }
    for e in 0..num_end_members {
        m[(t, e)] = 1.0;
    }

    // Unit-normalize rows; the kernel is unchanged and the singular-value
    // cutoff becomes scale-free.
    for r in 0..(t + 1) {
        let norm = m.row(r).norm();
        if norm > 0.0 {
            for c in 0..k {
                m[(r, c)] /= norm;
            }
        }
    }

    let svd = m.clone().svd(false, true);
    let v_t = svd
        .v_t
        .as_ref()
        .expect("right singular vectors were requested");
    let max_sv = svd.singular_values.iter().cloned().fold(0.0f64, f64::max);
    let cutoff = NULLSPACE_TOL * max_sv.max(1.0);

    // Kernel projector I - V V' over the row-space singular vectors. Its
    // eigenvalues are 0 or 1, so the eigenvectors near 1 give an orthonormal
    // nullspace basis without squaring the conditioning.
    let mut projector = DMatrix::<f64>::identity(k, k);
    for (i, &sv) in svd.singular_values.iter().enumerate() {
        if sv > cutoff {
            let row = v_t.row(i);
            projector -= row.transpose() * row;
        }
    }
    let eigen = SymmetricEigen::new(projector);

    let null_cols: Vec<usize> = (0..k).filter(|&i| eigen.eigenvalues[i] > 0.5).collect();
    let mut basis = DMatrix::<f64>::zeros(k, null_cols.len());
    for (out, &i) in null_cols.iter().enumerate() {
        basis.set_column(out, &eigen.eigenvectors.column(i));
    }

    let check = &m * &basis;
    let max_abs = check.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if max_abs >= NULLSPACE_TOL {
        return Err(OmpaError::new(
            4,
            format!(
                "Nullspace consistency check failed: max |M N| = {max_abs:e} (internal invariant)."
            ),
        ));
    }
    Ok(basis)
}

/// Bound the per-observation solution shift for a linear objective over
/// (fractions, converted values).
///
/// For each observation, two LPs over the nullspace coordinates are solved
/// (one per assumed converted sign) subject to: fractions stay in [0, 1],
/// converted values keep the assumed sign, and (where the observation
/// carries usage penalties) the penalty-weighted combination of end-member
/// shifts stays zero. An LP that is not solved to optimality counts as +∞;
/// if both fail the observation keeps its original row.
pub fn quantify_ambiguity(
    problem: &OmpaProblem,
    soln: &OmpaSoln,
    objective: &[f64],
) -> Result<Vec<ObservationAmbiguity>, OmpaError> {
    let n_em = problem.num_end_members();
    let n_conv = problem.num_conv_cols();
    let k = n_em + n_conv;
    if objective.len() != k {
        return Err(OmpaError::new(
            2,
            format!(
                "Ambiguity objective has {} entries, expected {} (end members + converted columns).",
                objective.len(),
                k
            ),
        ));
    }

    let basis = &soln.nullspace;
    let dim = basis.ncols();
    let n = problem.num_observations();

    // Objective restricted to the nullspace coordinates.
    let c_eff: Vec<f64> = (0..dim)
        .map(|d| (0..k).map(|c| objective[c] * basis[(c, d)]).sum())
        .collect();

    (0..n)
        .into_par_iter()
        .map(|obs| {
            let x0: DVector<f64> = soln.x.row(obs).transpose();
            let base_objective: f64 = (0..k).map(|c| objective[c] * x0[c]).sum();

            if dim == 0 {
                return Ok(ObservationAmbiguity {
                    objective: base_objective,
                    sign: 1.0,
                    x: x0,
                    shifted: false,
                });
            }

            let mut best: Option<(f64, f64, Vec<f64>)> = None;
            let candidate_signs: &[f64] = if n_conv == 0 { &[1.0] } else { &[1.0, -1.0] };
            for &sign in candidate_signs {
                let Some((value, t)) =
                    solve_direction_lp(problem, basis, &c_eff, &x0, obs, sign, n_em)?
                else {
                    continue;
                };
                let total = base_objective + value;
                if best.as_ref().map(|(b, _, _)| total < *b).unwrap_or(true) {
                    best = Some((total, sign, t));
                }
            }

            let Some((_, sign, t)) = best else {
                return Ok(ObservationAmbiguity {
                    objective: base_objective,
                    sign: 1.0,
                    x: x0,
                    shifted: false,
                });
            };

            // Apply the winning perturbation, then re-correct exactly like
            // the primary solve does.
            let mut x = x0.clone();
            for c in 0..k {
                for d in 0..dim {
                    x[c] += basis[(c, d)] * t[d];
                }
            }
            for e in 0..n_em {
                if x[e] < 0.0 {
                    x[e] = 0.0;
                }
            }
            let total: f64 = (0..n_em).map(|e| x[e]).sum();
            if total > 1e-12 {
                for e in 0..n_em {
                    x[e] /= total;
                }
            }
            for c in n_em..k {
                if sign * x[c] < 0.0 {
                    x[c] = 0.0;
                }
            }

            let objective_value: f64 = (0..k).map(|c| objective[c] * x[c]).sum();
            Ok(ObservationAmbiguity {
                objective: objective_value,
                sign,
                x,
                shifted: true,
            })
        })
        .collect()
}

/// One direction LP: minimize `c_eff · t` subject to feasibility of
/// `x0 + N t` under the assumed converted sign. Returns `None` when the LP
/// is not solved to optimality.
fn solve_direction_lp(
    problem: &OmpaProblem,
    basis: &DMatrix<f64>,
    c_eff: &[f64],
    x0: &DVector<f64>,
    obs: usize,
    sign: f64,
    n_em: usize,
) -> Result<Option<(f64, Vec<f64>)>, OmpaError> {
    let dim = basis.ncols();
    let k = basis.nrows();
    let mut lp = Program::new(dim);
    for (d, &c) in c_eff.iter().enumerate() {
        lp.add_linear_objective(d, c);
    }

    let basis_row = |c: usize| -> Vec<(usize, f64)> {
        (0..dim)
            .map(|d| (d, basis[(c, d)]))
            .filter(|&(_, v)| v != 0.0)
            .collect()
    };

    for e in 0..n_em {
        // 0 <= x0_e + (N t)_e <= 1
        let row = basis_row(e);
        let neg: Vec<(usize, f64)> = row.iter().map(|&(d, v)| (d, -v)).collect();
        lp.add_ineq_constraint(neg, x0[e]);
        lp.add_ineq_constraint(row, 1.0 - x0[e]);
    }
    for c in n_em..k {
        // sign * (x0_c + (N t)_c) >= 0
        let row: Vec<(usize, f64)> = basis_row(c)
            .into_iter()
            .map(|(d, v)| (d, -sign * v))
            .collect();
        lp.add_ineq_constraint(row, sign * x0[c]);
    }

    let penalty = problem.usage_penalty();
    if (0..n_em).any(|e| penalty[(obs, e)] != 0.0) {
        // Penalized end members must not trade mass through the nullspace.
        let mut row = vec![0.0; dim];
        for e in 0..n_em {
            let p = penalty[(obs, e)];
            if p != 0.0 {
                for d in 0..dim {
                    row[d] += p * basis[(e, d)];
                }
            }
        }
        let sparse: Vec<(usize, f64)> = row
            .into_iter()
            .enumerate()
            .map(|(d, v)| (d, v))
            .filter(|&(_, v)| v != 0.0)
            .collect();
        if !sparse.is_empty() {
            lp.add_eq_constraint(sparse, 0.0);
        }
    }

    let out = lp.solve()?;
    if out.status != SolveStatus::Optimal {
        return Ok(None);
    }
    let value: f64 = c_eff.iter().zip(out.x.iter()).map(|(c, t)| c * t).sum();
    Ok(Some((value, out.x)))
}

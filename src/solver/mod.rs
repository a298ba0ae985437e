//! Pluggable numerical-solver interface.
//!
//! The core never talks to a solver backend directly; it assembles a
//! `Program`, a convex quadratic (or, with no quadratic terms, linear)
//! objective plus linear equality and inequality constraint rows, and asks
//! for a solution vector and a status. Clarabel is the backend; swapping it
//! out only touches this module.
//!
//! Conventions:
//!
//! - objective terms are added as plain coefficients of `x_i * x_j` and
//!   `x_i` (the `1/2 x' P x` bookkeeping is internal)
//! - inequality rows mean `row · x <= rhs`
//! - the iteration cap is fixed; exhausting it reports `IterationLimit`,
//!   which callers treat the same as infeasibility

use std::collections::HashMap;

use clarabel::algebra::CscMatrix;
use clarabel::solver::SupportedConeT::{NonnegativeConeT, ZeroConeT};
use clarabel::solver::{DefaultSettings, DefaultSolver, IPSolver, SolverStatus};

use crate::error::OmpaError;

/// Internal iteration cap handed to the backend.
const MAX_ITERATIONS: u32 = 50_000;

/// Solver outcome, collapsed to the four cases callers care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    Unbounded,
    IterationLimit,
}

/// Solution vector plus status and backend-reported objective value.
#[derive(Debug, Clone)]
pub struct ProgramSolution {
    pub x: Vec<f64>,
    pub status: SolveStatus,
    pub objective: f64,
}

/// A convex program under construction.
///
/// Objective: `sum of quad terms + sum of linear terms`, minimized subject to
/// the accumulated equality and inequality rows.
pub struct Program {
    num_vars: usize,
    /// Upper-triangular accumulation of the quadratic form, keyed `(i, j)`
    /// with `i <= j`, in `1/2 x' P x` scaling.
    quad: HashMap<(usize, usize), f64>,
    linear: Vec<f64>,
    eq_rows: Vec<Vec<(usize, f64)>>,
    eq_rhs: Vec<f64>,
    ineq_rows: Vec<Vec<(usize, f64)>>,
    ineq_rhs: Vec<f64>,
}

impl Program {
    pub fn new(num_vars: usize) -> Self {
        Self {
            num_vars,
            quad: HashMap::new(),
            linear: vec![0.0; num_vars],
            eq_rows: Vec::new(),
            eq_rhs: Vec::new(),
            ineq_rows: Vec::new(),
            ineq_rhs: Vec::new(),
        }
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    /// Add `c * x_i * x_j` (or `c * x_i²` when `i == j`) to the objective.
    pub fn add_quad_objective(&mut self, i: usize, j: usize, c: f64) {
        if c == 0.0 {
            return;
        }
        let (lo, hi) = if i <= j { (i, j) } else { (j, i) };
        // 1/2 x'Px with symmetric P: diagonal entries carry a factor 2,
        // off-diagonal entries appear once per (i, j) + (j, i).
        let p = if lo == hi { 2.0 * c } else { c };
        *self.quad.entry((lo, hi)).or_insert(0.0) += p;
    }

    /// Add `c * x_i` to the objective.
    pub fn add_linear_objective(&mut self, i: usize, c: f64) {
        self.linear[i] += c;
    }

    /// Add the equality constraint `row · x == rhs`.
    pub fn add_eq_constraint(&mut self, row: Vec<(usize, f64)>, rhs: f64) {
        self.eq_rows.push(row);
        self.eq_rhs.push(rhs);
    }

    /// Add the inequality constraint `row · x <= rhs`.
    pub fn add_ineq_constraint(&mut self, row: Vec<(usize, f64)>, rhs: f64) {
        self.ineq_rows.push(row);
        self.ineq_rhs.push(rhs);
    }

    /// Solve the assembled program.
    ///
    /// Infeasibility is NOT an error at this layer; callers inspect
    /// `status` and decide what is fatal.
    pub fn solve(&self) -> Result<ProgramSolution, OmpaError> {
        let n = self.num_vars;
        let p = upper_triangular_csc(n, &self.quad);
        let (a, b, cones) = self.constraint_matrix();

        let settings = DefaultSettings {
            verbose: false,
            max_iter: MAX_ITERATIONS,
            ..DefaultSettings::default()
        };

        let mut solver = DefaultSolver::new(&p, &self.linear, &a, &b, &cones, settings);
        solver.solve();

        let status = map_status(solver.solution.status);
        Ok(ProgramSolution {
            x: solver.solution.x.clone(),
            status,
            objective: solver.solution.obj_val,
        })
    }

    /// Stack equality rows (zero cone) above inequality rows (nonnegative
    /// cone) in Clarabel's `A x + s = b, s ∈ K` form.
    fn constraint_matrix(
        &self,
    ) -> (
        CscMatrix<f64>,
        Vec<f64>,
        Vec<clarabel::solver::SupportedConeT<f64>>,
    ) {
        let m_eq = self.eq_rows.len();
        let m_in = self.ineq_rows.len();

        let mut triplets: Vec<(usize, usize, f64)> = Vec::new();
        for (r, row) in self.eq_rows.iter().enumerate() {
            for &(col, v) in row {
                triplets.push((r, col, v));
            }
        }
        for (r, row) in self.ineq_rows.iter().enumerate() {
            for &(col, v) in row {
                triplets.push((m_eq + r, col, v));
            }
        }

        let a = csc_from_triplets(m_eq + m_in, self.num_vars, triplets);
        let mut b = self.eq_rhs.clone();
        b.extend_from_slice(&self.ineq_rhs);

        let mut cones = Vec::new();
        if m_eq > 0 {
            cones.push(ZeroConeT(m_eq));
        }
        if m_in > 0 {
            cones.push(NonnegativeConeT(m_in));
        }
        (a, b, cones)
    }
}

fn map_status(status: SolverStatus) -> SolveStatus {
    match status {
        SolverStatus::Solved | SolverStatus::AlmostSolved => SolveStatus::Optimal,
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
            SolveStatus::Infeasible
        }
        SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => {
            SolveStatus::Unbounded
        }
        // Everything else (max iterations, time limit, numerical trouble) is
        // reported as the iteration-limit case and treated like infeasibility
        // by callers.
        _ => SolveStatus::IterationLimit,
    }
}

/// Build the upper-triangular `P` matrix in CSC form.
fn upper_triangular_csc(n: usize, entries: &HashMap<(usize, usize), f64>) -> CscMatrix<f64> {
    let triplets: Vec<(usize, usize, f64)> = entries
        .iter()
        .map(|(&(i, j), &v)| (i, j, v))
        .collect();
    csc_from_triplets(n, n, triplets)
}

/// Assemble a CSC matrix from unordered `(row, col, value)` triplets.
/// Duplicate positions are summed.
fn csc_from_triplets(m: usize, n: usize, mut triplets: Vec<(usize, usize, f64)>) -> CscMatrix<f64> {
    triplets.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));

    let mut colptr = vec![0usize; n + 1];
    let mut rowval = Vec::with_capacity(triplets.len());
    let mut nzval: Vec<f64> = Vec::with_capacity(triplets.len());
    let mut last: Option<(usize, usize)> = None;

    for &(row, col, v) in &triplets {
        if last == Some((col, row)) {
            *nzval.last_mut().unwrap() += v;
        } else {
            rowval.push(row);
            nzval.push(v);
            colptr[col + 1] += 1;
            last = Some((col, row));
        }
    }
    for c in 0..n {
        colptr[c + 1] += colptr[c];
    }

    CscMatrix::new(m, n, colptr, rowval, nzval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconstrained_quadratic_minimum() {
        // minimize (x - 3)^2 = x^2 - 6x + 9
        let mut p = Program::new(1);
        p.add_quad_objective(0, 0, 1.0);
        p.add_linear_objective(0, -6.0);
        let soln = p.solve().unwrap();
        assert_eq!(soln.status, SolveStatus::Optimal);
        assert!((soln.x[0] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn equality_and_bound_constraints() {
        // minimize x0^2 + x1^2  s.t. x0 + x1 == 1, x0 >= 0, x1 >= 0
        let mut p = Program::new(2);
        p.add_quad_objective(0, 0, 1.0);
        p.add_quad_objective(1, 1, 1.0);
        p.add_eq_constraint(vec![(0, 1.0), (1, 1.0)], 1.0);
        p.add_ineq_constraint(vec![(0, -1.0)], 0.0);
        p.add_ineq_constraint(vec![(1, -1.0)], 0.0);
        let soln = p.solve().unwrap();
        assert_eq!(soln.status, SolveStatus::Optimal);
        assert!((soln.x[0] - 0.5).abs() < 1e-6);
        assert!((soln.x[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn linear_program_reports_infeasible() {
        // x >= 1 and x <= 0 cannot both hold.
        let mut p = Program::new(1);
        p.add_linear_objective(0, 1.0);
        p.add_ineq_constraint(vec![(0, -1.0)], -1.0);
        p.add_ineq_constraint(vec![(0, 1.0)], 0.0);
        let soln = p.solve().unwrap();
        assert_eq!(soln.status, SolveStatus::Infeasible);
    }

    #[test]
    fn quadratic_cross_terms_expand_correctly() {
        // minimize (x0 - x1)^2 + x1^2 s.t. x0 == 2
        // => x1 minimizes (2 - x1)^2 + x1^2 => x1 = 1.
        let mut p = Program::new(2);
        p.add_quad_objective(0, 0, 1.0);
        p.add_quad_objective(1, 1, 2.0);
        p.add_quad_objective(0, 1, -2.0);
        p.add_eq_constraint(vec![(0, 1.0)], 2.0);
        let soln = p.solve().unwrap();
        assert_eq!(soln.status, SolveStatus::Optimal);
        assert!((soln.x[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn csc_assembly_handles_empty_columns_and_duplicates() {
        let m = csc_from_triplets(2, 3, vec![(0, 2, 1.0), (0, 2, 2.0), (1, 0, 4.0)]);
        assert_eq!(m.m, 2);
        assert_eq!(m.n, 3);
        assert_eq!(m.colptr, vec![0, 1, 1, 2]);
        assert_eq!(m.rowval, vec![1, 0]);
        assert_eq!(m.nzval, vec![4.0, 3.0]);
    }
}

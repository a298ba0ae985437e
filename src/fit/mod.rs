//! Solve orchestration.
//!
//! Responsibilities:
//!
//! - standardize and weight the mixing matrix and observations
//! - run the sign-combination search (parallel)
//! - run the final regularized core solve
//! - derive reporting quantities: tracer residuals, per-group totals,
//!   effective conversion ratios, the nullspace basis
//!
//! The output `OmpaSoln` is a plain immutable value: every field is typed
//! and listed here, and it owns a copy of the end-member table it was solved
//! against, so downstream consumers (export, refinement, ambiguity) can read
//! it concurrently without touching the problem again.

pub mod core;
pub mod refine;
pub mod signs;

pub use self::core::*;
pub use self::refine::*;
pub use self::signs::*;

use nalgebra::{DMatrix, DVector};

use crate::ambiguity::nullspace_basis;
use crate::domain::{EndMemberTable, GroupSigns, Standardization};
use crate::error::OmpaError;
use crate::geo::build_pairs_operator;
use crate::problem::OmpaProblem;
use crate::solver::SolveStatus;

/// Tolerance for the per-observation, per-group sign-consistency check.
const SIGN_TOL: f64 = 1e-6;

/// Proportion-weighted effective conversion ratios of one group.
///
/// Where a group's total converted value is near zero the proportions (and
/// therefore these ratios) are undefined and reported as NaN; that is an
/// expected outcome, not an error.
#[derive(Debug, Clone)]
pub struct EffectiveRatios {
    pub group: String,
    pub tracers: Vec<String>,
    /// observations × group tracers.
    pub values: DMatrix<f64>,
}

/// A complete, immutable solve result.
#[derive(Debug, Clone)]
pub struct OmpaSoln {
    /// The end-member table this solution was solved against.
    pub endmembers: EndMemberTable,
    /// observations × end members; non-negative, rows sum to one when the
    /// sum-to-one constraint is enabled.
    pub fractions: DMatrix<f64>,
    /// observations × converted columns, sign-consistent per group.
    pub converted: DMatrix<f64>,
    /// Full corrected decision matrix (fractions + converted columns).
    pub x: DMatrix<f64>,
    /// observations × tracers, in (possibly standardized) tracer units.
    pub param_reconstruction: DMatrix<f64>,
    /// observations × tracers: observed minus reconstructed.
    pub param_residuals: DMatrix<f64>,
    /// Per-observation weighted residual sum of squares (post-correction).
    pub residuals_sq: DVector<f64>,
    pub residual_sum_precorrection: f64,
    pub residual_sum: f64,
    /// observations × groups: summed converted values per group.
    pub group_totals: DMatrix<f64>,
    pub effective_ratios: Vec<EffectiveRatios>,
    /// Nullspace basis of the augmented mixing matrix (columns = directions).
    pub nullspace: DMatrix<f64>,
    /// The sign assignment used for the final solve, one entry per group.
    pub signs: Vec<GroupSigns>,
    pub status: SolveStatus,
    /// Backend-reported objective value of the final solve.
    pub objective: f64,
    /// Non-fatal conditions observed during the solve.
    pub warnings: Vec<String>,
    /// Observation values actually fitted (standardized when enabled),
    /// kept for the refinement cross-checks.
    pub observations_used: DMatrix<f64>,
    /// Mixing matrix actually fitted (standardized, unweighted).
    pub mixing_matrix: DMatrix<f64>,
    pub standardization: Option<Standardization>,
}

/// Solve the OMPA problem against an end-member table.
pub fn solve(problem: &OmpaProblem, endmembers: &EndMemberTable) -> Result<OmpaSoln, OmpaError> {
    problem.check_endmembers(endmembers)?;

    let standardization = problem.standardization_for(endmembers)?;
    let a = problem.mixing_matrix(endmembers, standardization.as_ref())?;
    let b = problem.observation_matrix(standardization.as_ref());

    let weights = problem.weights();
    let a_weighted = scale_columns(&a, weights);
    let b_weighted = scale_columns(&b, weights);

    let conv_col_group: Vec<usize> = problem.conv_cols().iter().map(|c| c.group).collect();

    // Sign search first (unregularized), then the final solve holds the
    // per-observation selection fixed.
    let signs: Vec<GroupSigns> = if problem.num_groups() > 0 {
        search_signs(problem, &a_weighted, &b_weighted)?.signs
    } else {
        Vec::new()
    };

    let pairs = match &problem.config().smoothness {
        Some(s) => Some((
            build_pairs_operator(
                problem.observations(),
                &s.depth_field,
                s.depth_scale,
                s.n_neighbors,
            )?,
            s.lambda,
        )),
        None => None,
    };

    let out = core_solve(&CoreInputs {
        a_weighted: &a_weighted,
        b_weighted: &b_weighted,
        num_end_members: problem.num_end_members(),
        usage_penalty: problem.usage_penalty(),
        signs: &signs,
        conv_col_group: &conv_col_group,
        smoothness: pairs.as_ref().map(|(op, lambda)| (op, *lambda)),
        sum_to_one: problem.config().sum_to_one,
    })?;

    let param_reconstruction = &out.x * &a;
    let param_residuals = &b - &param_reconstruction;

    let mut warnings: Vec<String> = Vec::new();
    let (group_totals, effective_ratios) =
        derive_group_quantities(problem, &out.converted, &mut warnings);

    let nullspace = nullspace_basis(&a, problem.num_end_members())?;

    Ok(OmpaSoln {
        endmembers: endmembers.clone(),
        fractions: out.fractions,
        converted: out.converted,
        x: out.x,
        param_reconstruction,
        param_residuals,
        residuals_sq: out.residuals_sq,
        residual_sum_precorrection: out.residual_sum_precorrection,
        residual_sum: out.residual_sum,
        group_totals,
        effective_ratios,
        nullspace,
        signs,
        status: out.status,
        objective: out.objective,
        warnings,
        observations_used: b,
        mixing_matrix: a,
        standardization,
    })
}

/// Per-group totals, sign-consistency warnings, and effective ratios.
fn derive_group_quantities(
    problem: &OmpaProblem,
    converted: &DMatrix<f64>,
    warnings: &mut Vec<String>,
) -> (DMatrix<f64>, Vec<EffectiveRatios>) {
    let n = converted.nrows();
    let num_groups = problem.num_groups();
    let mut totals = DMatrix::<f64>::zeros(n, num_groups);
    let mut ratios = Vec::with_capacity(num_groups);

    for g in 0..num_groups {
        let range = problem.group_range(g);
        let group_name = problem.config().converted_groups[g].name.clone();
        let (group_tracers, ratio_matrix) = problem.group_ratio_matrix(g);
        let mut effective = DMatrix::<f64>::from_element(n, group_tracers.len(), f64::NAN);

        for i in 0..n {
            let values: Vec<f64> = range.clone().map(|c| converted[(i, c)]).collect();
            let any_pos = values.iter().any(|&v| v > SIGN_TOL);
            let any_neg = values.iter().any(|&v| v < -SIGN_TOL);
            if any_pos && any_neg {
                warnings.push(format!(
                    "Observation {i}: converted group '{group_name}' has mixed signs beyond tolerance."
                ));
            }

            let total: f64 = values.iter().sum();
            totals[(i, g)] = total;

            // Proportion-weighted combination of the group's ratio vectors;
            // near-zero totals leave the row as NaN (documented edge case).
            if total.abs() > 1e-12 {
                for (t, _) in group_tracers.iter().enumerate() {
                    let mut acc = 0.0;
                    for (r, &v) in values.iter().enumerate() {
                        acc += (v / total) * ratio_matrix[(r, t)];
                    }
                    effective[(i, t)] = acc;
                }
            }
        }

        ratios.push(EffectiveRatios {
            group: group_name,
            tracers: group_tracers,
            values: effective,
        });
    }

    (totals, ratios)
}

/// Multiply each column by its weight (columns = tracers).
fn scale_columns(m: &DMatrix<f64>, weights: &[f64]) -> DMatrix<f64> {
    let mut out = m.clone();
    for (j, &w) in weights.iter().enumerate() {
        for i in 0..out.nrows() {
            out[(i, j)] *= w;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConvertedGroup, ObservationTable, OmpaConfig, Smoothness, TracerParam};
    use std::collections::BTreeMap;

    fn two_member_table() -> EndMemberTable {
        EndMemberTable::new(
            vec!["Upper".to_string(), "Lower".to_string()],
            vec!["salinity".to_string()],
            DMatrix::from_row_slice(2, 1, &[34.0, 36.0]),
        )
        .unwrap()
    }

    #[test]
    fn interior_observation_recovers_even_mixture() {
        let observations =
            ObservationTable::new(vec![("salinity".to_string(), vec![35.0])]).unwrap();
        let config = OmpaConfig {
            tracers: vec![TracerParam::new("salinity", 1.0)],
            ..OmpaConfig::default()
        };
        let endmembers = two_member_table();
        let problem = OmpaProblem::new(config, &observations, &endmembers).unwrap();
        let soln = problem.solve(&endmembers).unwrap();

        assert!((soln.fractions[(0, 0)] - 0.5).abs() < 1e-5);
        assert!((soln.fractions[(0, 1)] - 0.5).abs() < 1e-5);
        assert!(soln.residual_sum < 1e-8);
        assert!(soln.param_residuals[(0, 0)].abs() < 1e-4);
        assert_eq!(soln.nullspace.ncols(), 0);
    }

    #[test]
    fn exterior_observation_keeps_constraints_with_residual() {
        let observations =
            ObservationTable::new(vec![("salinity".to_string(), vec![37.0])]).unwrap();
        let config = OmpaConfig {
            tracers: vec![TracerParam::new("salinity", 1.0)],
            ..OmpaConfig::default()
        };
        let endmembers = two_member_table();
        let problem = OmpaProblem::new(config, &observations, &endmembers).unwrap();
        let soln = problem.solve(&endmembers).unwrap();

        assert!(soln.fractions.iter().all(|&f| f >= 0.0));
        let total: f64 = soln.fractions.row(0).iter().sum();
        assert!((total - 1.0).abs() < 1e-7);
        assert!((soln.fractions[(0, 1)] - 1.0).abs() < 1e-5);
        assert!(soln.residual_sum > 0.5);
    }

    #[test]
    fn converted_groups_report_totals_and_effective_ratios() {
        let endmembers = EndMemberTable::new(
            vec!["Upper".to_string(), "Lower".to_string()],
            vec!["salinity".to_string(), "oxygen".to_string()],
            DMatrix::from_row_slice(2, 2, &[34.0, 200.0, 36.0, 200.0]),
        )
        .unwrap();
        let observations = ObservationTable::new(vec![
            ("salinity".to_string(), vec![35.0, 35.0]),
            ("oxygen".to_string(), vec![160.0, 240.0]),
        ])
        .unwrap();
        let ratio: BTreeMap<String, f64> = [("oxygen".to_string(), -1.0)].into();
        let config = OmpaConfig {
            tracers: vec![
                TracerParam::new("salinity", 1.0),
                TracerParam::new("oxygen", 1.0),
            ],
            converted_groups: vec![ConvertedGroup {
                name: "oxygen_use".to_string(),
                ratios: vec![ratio],
                always_positive: false,
            }],
            ..OmpaConfig::default()
        };
        let problem = OmpaProblem::new(config, &observations, &endmembers).unwrap();
        let soln = problem.solve(&endmembers).unwrap();

        // Depleted observation: +40 units of use; enriched: -40.
        assert!((soln.group_totals[(0, 0)] - 40.0).abs() < 1e-3);
        assert!((soln.group_totals[(1, 0)] + 40.0).abs() < 1e-3);

        // Single-ratio group: the effective ratio is the ratio itself.
        let eff = &soln.effective_ratios[0];
        assert_eq!(eff.group, "oxygen_use");
        assert_eq!(eff.tracers, vec!["oxygen".to_string()]);
        assert!((eff.values[(0, 0)] + 1.0).abs() < 1e-9);

        // Per-observation sign consistency (trivially one column here).
        for i in 0..2 {
            let vals: Vec<f64> = (0..1).map(|c| soln.converted[(i, c)]).collect();
            assert!(
                vals.iter().all(|&v| v >= -1e-6) || vals.iter().all(|&v| v <= 1e-6)
            );
        }
        assert!(soln.warnings.is_empty());
    }

    #[test]
    fn noisy_mixtures_are_recovered_approximately() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use rand_distr::{Distribution, Normal};

        let endmembers = EndMemberTable::new(
            vec!["Upper".to_string(), "Lower".to_string()],
            vec!["salinity".to_string(), "oxygen".to_string()],
            DMatrix::from_row_slice(2, 2, &[34.0, 200.0, 36.0, 150.0]),
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let noise = Normal::new(0.0, 0.01).unwrap();
        let mut salinity = Vec::new();
        let mut oxygen = Vec::new();
        let mut truth = Vec::new();
        for _ in 0..20 {
            let f: f64 = rng.gen_range(0.0..=1.0);
            truth.push(f);
            salinity.push(f * 34.0 + (1.0 - f) * 36.0 + noise.sample(&mut rng));
            oxygen.push(f * 200.0 + (1.0 - f) * 150.0 + 5.0 * noise.sample(&mut rng));
        }
        let observations = ObservationTable::new(vec![
            ("salinity".to_string(), salinity),
            ("oxygen".to_string(), oxygen),
        ])
        .unwrap();
        let config = OmpaConfig {
            tracers: vec![
                TracerParam::new("salinity", 1.0),
                TracerParam::new("oxygen", 0.1),
            ],
            ..OmpaConfig::default()
        };
        let problem = OmpaProblem::new(config, &observations, &endmembers).unwrap();
        let soln = problem.solve(&endmembers).unwrap();

        for (i, &f) in truth.iter().enumerate() {
            assert!((soln.fractions[(i, 0)] - f).abs() < 0.05);
            let total: f64 = soln.fractions.row(i).iter().sum();
            assert!((total - 1.0).abs() < 1e-7);
        }
    }

    #[test]
    fn smoothness_requires_positions_and_runs_end_to_end() {
        let observations = ObservationTable::new(vec![
            ("salinity".to_string(), vec![34.2, 35.8, 35.0]),
            ("latitude".to_string(), vec![10.0, 10.01, 10.02]),
            ("longitude".to_string(), vec![20.0, 20.0, 20.0]),
            ("depth".to_string(), vec![100.0, 100.0, 100.0]),
        ])
        .unwrap();
        let config = OmpaConfig {
            tracers: vec![TracerParam::new("salinity", 1.0)],
            smoothness: Some(Smoothness {
                lambda: 0.5,
                depth_field: "depth".to_string(),
                depth_scale: 1.0,
                n_neighbors: 2,
            }),
            ..OmpaConfig::default()
        };
        let endmembers = two_member_table();
        let problem = OmpaProblem::new(config, &observations, &endmembers).unwrap();
        let soln = problem.solve(&endmembers).unwrap();
        for i in 0..3 {
            let total: f64 = soln.fractions.row(i).iter().sum();
            assert!((total - 1.0).abs() < 1e-7);
        }
    }
}

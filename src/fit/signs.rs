//! Sign-combination search over converted-variable groups.
//!
//! A converted variable can in principle act in either direction (e.g.
//! remineralization vs. photosynthesis), but within one observation a group
//! must be sign-consistent. Groups flagged `always_positive` only admit the
//! all-positive assignment; every other group admits all-positive and
//! all-negative.
//!
//! The full candidate set is the Cartesian product of per-group sign
//! candidates. Each combination is solved once without smoothness
//! regularization (candidates are independent, so they run in parallel), and
//! for every observation independently the combination with the smallest
//! pre-correction weighted residual wins. Different observations may end up
//! with different assignments; the selection is then held fixed for the
//! final regularized solve.

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::domain::GroupSigns;
use crate::error::OmpaError;
use crate::fit::core::{core_solve, CoreInputs};
use crate::problem::OmpaProblem;

/// Outcome of the search: one per-observation sign vector per group.
#[derive(Debug, Clone)]
pub struct SignSelection {
    pub signs: Vec<GroupSigns>,
    pub combinations_tried: usize,
}

/// Enumerate and score the sign combinations, then pick per observation.
pub fn search_signs(
    problem: &OmpaProblem,
    a_weighted: &DMatrix<f64>,
    b_weighted: &DMatrix<f64>,
) -> Result<SignSelection, OmpaError> {
    let num_groups = problem.num_groups();
    let n = problem.num_observations();

    let combos = sign_combinations(problem);
    let conv_col_group: Vec<usize> = problem.conv_cols().iter().map(|c| c.group).collect();

    // One unregularized solve per combination; the smoothness term would
    // couple observations and make the per-observation comparison meaningless
    // (and the search needlessly expensive).
    let residuals: Vec<Vec<f64>> = combos
        .par_iter()
        .map(|combo| {
            let signs: Vec<GroupSigns> = combo.iter().map(|&s| GroupSigns::Global(s)).collect();
            let out = core_solve(&CoreInputs {
                a_weighted,
                b_weighted,
                num_end_members: problem.num_end_members(),
                usage_penalty: problem.usage_penalty(),
                signs: &signs,
                conv_col_group: &conv_col_group,
                smoothness: None,
                sum_to_one: problem.config().sum_to_one,
            })?;
            Ok(out.residuals_sq_precorrection.iter().copied().collect())
        })
        .collect::<Result<Vec<Vec<f64>>, OmpaError>>()?;

    // Per observation: lowest residual wins; ties go to the earliest
    // combination (all-positive first), deterministically.
    let mut per_group: Vec<Vec<f64>> = vec![vec![1.0; n]; num_groups];
    for obs in 0..n {
        let mut best = 0usize;
        for c in 1..combos.len() {
            if residuals[c][obs] < residuals[best][obs] {
                best = c;
            }
        }
        for g in 0..num_groups {
            per_group[g][obs] = combos[best][g];
        }
    }

    Ok(SignSelection {
        signs: per_group.into_iter().map(GroupSigns::PerObservation).collect(),
        combinations_tried: combos.len(),
    })
}

/// Cartesian product of per-group candidate signs.
fn sign_combinations(problem: &OmpaProblem) -> Vec<Vec<f64>> {
    let mut combos: Vec<Vec<f64>> = vec![Vec::new()];
    for group in &problem.config().converted_groups {
        let candidates: &[f64] = if group.always_positive {
            &[1.0]
        } else {
            &[1.0, -1.0]
        };
        combos = combos
            .iter()
            .flat_map(|prefix| {
                candidates.iter().map(move |&s| {
                    let mut next = prefix.clone();
                    next.push(s);
                    next
                })
            })
            .collect();
    }
    combos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ConvertedGroup, EndMemberTable, ObservationTable, OmpaConfig, TracerParam,
    };
    use std::collections::BTreeMap;

    fn problem_with_groups(groups: Vec<ConvertedGroup>) -> (OmpaProblem, EndMemberTable) {
        let endmembers = EndMemberTable::new(
            vec!["Upper".to_string(), "Lower".to_string()],
            vec!["salinity".to_string(), "oxygen".to_string()],
            DMatrix::from_row_slice(2, 2, &[34.0, 200.0, 36.0, 200.0]),
        )
        .unwrap();
        // One oxygen-rich and one oxygen-poor observation relative to pure
        // mixing: they should pick opposite signs.
        let observations = ObservationTable::new(vec![
            ("salinity".to_string(), vec![35.0, 35.0]),
            ("oxygen".to_string(), vec![160.0, 240.0]),
        ])
        .unwrap();
        let config = OmpaConfig {
            tracers: vec![
                TracerParam::new("salinity", 1.0),
                TracerParam::new("oxygen", 1.0),
            ],
            converted_groups: groups,
            ..OmpaConfig::default()
        };
        let problem = OmpaProblem::new(config, &observations, &endmembers).unwrap();
        (problem, endmembers)
    }

    fn oxygen_group(always_positive: bool) -> ConvertedGroup {
        let ratio: BTreeMap<String, f64> = [("oxygen".to_string(), -1.0)].into();
        ConvertedGroup {
            name: "oxygen_use".to_string(),
            ratios: vec![ratio],
            always_positive,
        }
    }

    #[test]
    fn free_group_tries_both_signs_and_selects_per_observation() {
        let (problem, endmembers) = problem_with_groups(vec![oxygen_group(false)]);
        let standardization = problem.standardization_for(&endmembers).unwrap();
        let a = problem
            .mixing_matrix(&endmembers, standardization.as_ref())
            .unwrap();
        let b = problem.observation_matrix(standardization.as_ref());

        let selection = search_signs(&problem, &a, &b).unwrap();
        assert_eq!(selection.combinations_tried, 2);

        let GroupSigns::PerObservation(signs) = &selection.signs[0] else {
            panic!("expected per-observation signs");
        };
        // Ratio is -1 per unit: the oxygen-depleted observation wants a
        // positive converted value, the enriched one a negative value.
        assert_eq!(signs[0], 1.0);
        assert_eq!(signs[1], -1.0);
    }

    #[test]
    fn always_positive_group_is_never_negated() {
        let (problem, endmembers) = problem_with_groups(vec![oxygen_group(true)]);
        let a = problem.mixing_matrix(&endmembers, None).unwrap();
        let b = problem.observation_matrix(None);

        let selection = search_signs(&problem, &a, &b).unwrap();
        assert_eq!(selection.combinations_tried, 1);
        let GroupSigns::PerObservation(signs) = &selection.signs[0] else {
            panic!("expected per-observation signs");
        };
        assert!(signs.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn candidate_set_is_the_cartesian_product() {
        let (problem, _) =
            problem_with_groups(vec![oxygen_group(false), {
                let ratio: BTreeMap<String, f64> = [("salinity".to_string(), 0.1)].into();
                ConvertedGroup {
                    name: "salt_shift".to_string(),
                    ratios: vec![ratio],
                    always_positive: true,
                }
            }]);
        let combos = sign_combinations(&problem);
        assert_eq!(combos, vec![vec![1.0, 1.0], vec![-1.0, 1.0]]);
    }
}

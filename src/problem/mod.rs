//! Problem specification: validation, row filtering, usage penalties,
//! standardization, and mixing-matrix assembly.
//!
//! Design goals:
//! - **Strict validation up front** with clear errors and exit codes; a
//!   constructed `OmpaProblem` is immutable and safe to share
//! - **Row-level filtering is reported, not silent**: rows missing a required
//!   tracer are dropped and counted
//! - **Derived data never lands on caller tables**: filtered observations,
//!   penalty matrices, and standardizations are fresh values

use nalgebra::DMatrix;

use crate::domain::{
    EndMemberTable, ObservationTable, OmpaConfig, PenaltyFields, Standardization,
    UsagePenaltySource,
};
use crate::error::OmpaError;
use crate::fit::OmpaSoln;

/// Maps one converted column of the decision matrix back to its group and
/// ratio vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvColumn {
    pub group: usize,
    pub ratio: usize,
}

/// A validated OMPA problem: filtered observations, tracer weights, converted
/// column layout, and the per-observation usage-penalty matrix.
///
/// Effectively immutable after construction; solves borrow it freely.
#[derive(Debug)]
pub struct OmpaProblem {
    config: OmpaConfig,
    observations: ObservationTable,
    end_member_names: Vec<String>,
    tracer_names: Vec<String>,
    weights: Vec<f64>,
    /// observations × end members, zero where unspecified.
    usage_penalty: DMatrix<f64>,
    conv_cols: Vec<ConvColumn>,
    group_ranges: Vec<std::ops::Range<usize>>,
    dropped_rows: usize,
    warnings: Vec<String>,
}

impl OmpaProblem {
    /// Validate the configuration against the tables and build the problem.
    ///
    /// The end-member table passed here fixes the end-member names and is
    /// used to sanity-check standardization; refined tables with the same
    /// names can be solved against later.
    pub fn new(
        config: OmpaConfig,
        observations: &ObservationTable,
        endmembers: &EndMemberTable,
    ) -> Result<Self, OmpaError> {
        let mut warnings = Vec::new();

        if config.tracers.is_empty() {
            return Err(OmpaError::new(2, "No tracer parameters configured."));
        }
        if endmembers.is_empty() {
            return Err(OmpaError::new(2, "End-member table is empty."));
        }

        let mut tracer_names = Vec::with_capacity(config.tracers.len());
        for param in &config.tracers {
            if tracer_names.contains(&param.name) {
                return Err(OmpaError::new(
                    2,
                    format!("Tracer '{}' is listed twice.", param.name),
                ));
            }
            if !(param.weight.is_finite() && param.weight > 0.0) {
                return Err(OmpaError::new(
                    2,
                    format!(
                        "Tracer '{}' needs a positive finite weight, got {}.",
                        param.name, param.weight
                    ),
                ));
            }
            if param.weight > 100.0 {
                warnings.push(format!(
                    "Tracer '{}' weight {} exceeds 100; the solve may become numerically unstable.",
                    param.name, param.weight
                ));
            }
            if !observations.has_column(&param.name) {
                return Err(OmpaError::new(
                    2,
                    format!("Tracer '{}' is missing from the observation table.", param.name),
                ));
            }
            if !endmembers.has_tracer(&param.name) {
                return Err(OmpaError::new(
                    2,
                    format!("Tracer '{}' is missing from the end-member table.", param.name),
                ));
            }
            tracer_names.push(param.name.clone());
        }
        let weights: Vec<f64> = config.tracers.iter().map(|p| p.weight).collect();

        // Converted groups: unique names, consistent ratio key sets, tracers
        // drawn from the declared list.
        let mut conv_cols = Vec::new();
        let mut group_ranges = Vec::with_capacity(config.converted_groups.len());
        for (g, group) in config.converted_groups.iter().enumerate() {
            if config.converted_groups[..g]
                .iter()
                .any(|other| other.name == group.name)
            {
                return Err(OmpaError::new(
                    2,
                    format!("Duplicate converted-group name '{}'.", group.name),
                ));
            }
            if group.ratios.is_empty() {
                return Err(OmpaError::new(
                    2,
                    format!("Converted group '{}' has no ratio vectors.", group.name),
                ));
            }
            let keys: Vec<&String> = group.ratios[0].keys().collect();
            for (r, ratio) in group.ratios.iter().enumerate() {
                let these: Vec<&String> = ratio.keys().collect();
                if these != keys {
                    return Err(OmpaError::new(
                        2,
                        format!(
                            "Converted group '{}' ratio vector {r} maps a different tracer set.",
                            group.name
                        ),
                    ));
                }
            }
            for key in &keys {
                if !tracer_names.contains(key) {
                    return Err(OmpaError::new(
                        2,
                        format!(
                            "Converted group '{}' references undeclared tracer '{key}'.",
                            group.name
                        ),
                    ));
                }
            }
            let start = conv_cols.len();
            for r in 0..group.ratios.len() {
                conv_cols.push(ConvColumn { group: g, ratio: r });
            }
            group_ranges.push(start..conv_cols.len());
        }

        if let Some(smoothness) = &config.smoothness {
            if !(smoothness.lambda.is_finite() && smoothness.lambda >= 0.0) {
                return Err(OmpaError::new(
                    2,
                    format!("Smoothness lambda must be >= 0, got {}.", smoothness.lambda),
                ));
            }
        }

        // Drop rows with missing required tracer values (intentional, counted).
        let keep: Vec<bool> = (0..observations.len())
            .map(|row| {
                tracer_names.iter().all(|name| {
                    observations
                        .column(name)
                        .map(|col| col[row].is_finite())
                        .unwrap_or(false)
                })
            })
            .collect();
        let dropped_rows = keep.iter().filter(|&&k| !k).count();
        let filtered = observations.retain_rows(&keep);
        if dropped_rows > 0 {
            warnings.push(format!(
                "Dropped {dropped_rows} observation row(s) with missing tracer values."
            ));
        }
        if filtered.is_empty() {
            return Err(OmpaError::new(
                3,
                "No observation rows remain after dropping rows with missing tracers.",
            ));
        }

        if let Some(smoothness) = &config.smoothness {
            let n = filtered.len();
            if smoothness.n_neighbors == 0 || smoothness.n_neighbors >= n {
                return Err(OmpaError::new(
                    2,
                    format!(
                        "Smoothness neighbor count {} must satisfy 1 <= k < {n} observations.",
                        smoothness.n_neighbors
                    ),
                ));
            }
        }

        let end_member_names: Vec<String> = endmembers.names().to_vec();
        let usage_penalty =
            build_usage_penalty(&config, observations, &keep, &filtered, &end_member_names)?;

        let problem = Self {
            config,
            observations: filtered,
            end_member_names,
            tracer_names,
            weights,
            usage_penalty,
            conv_cols,
            group_ranges,
            dropped_rows,
            warnings,
        };

        // Standardization is validated once, up front, so misconfigured mass
        // dimensions fail before any solve.
        if problem.config.standardize {
            problem.standardization_for(endmembers)?;
        }

        Ok(problem)
    }

    /// Solve for mixing fractions and converted variables against an
    /// end-member table (see `fit::solve`).
    pub fn solve(&self, endmembers: &EndMemberTable) -> Result<OmpaSoln, OmpaError> {
        crate::fit::solve(self, endmembers)
    }

    pub fn config(&self) -> &OmpaConfig {
        &self.config
    }

    /// Filtered observation table (rows with missing tracers removed).
    pub fn observations(&self) -> &ObservationTable {
        &self.observations
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn end_member_names(&self) -> &[String] {
        &self.end_member_names
    }

    pub fn num_end_members(&self) -> usize {
        self.end_member_names.len()
    }

    pub fn tracer_names(&self) -> &[String] {
        &self.tracer_names
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn usage_penalty(&self) -> &DMatrix<f64> {
        &self.usage_penalty
    }

    pub fn has_usage_penalty(&self) -> bool {
        self.usage_penalty.iter().any(|&v| v != 0.0)
    }

    /// Converted-column layout (one column per ratio vector, grouped).
    pub fn conv_cols(&self) -> &[ConvColumn] {
        &self.conv_cols
    }

    pub fn num_conv_cols(&self) -> usize {
        self.conv_cols.len()
    }

    /// Column range (within the converted block) of one group.
    pub fn group_range(&self, group: usize) -> std::ops::Range<usize> {
        self.group_ranges[group].clone()
    }

    pub fn num_groups(&self) -> usize {
        self.group_ranges.len()
    }

    /// Count of observation rows dropped for missing tracer values.
    pub fn dropped_rows(&self) -> usize {
        self.dropped_rows
    }

    /// Non-fatal conditions collected during construction.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Check an end-member table against the problem (same names, same
    /// order, all tracers present).
    pub fn check_endmembers(&self, endmembers: &EndMemberTable) -> Result<(), OmpaError> {
        if endmembers.names() != self.end_member_names.as_slice() {
            return Err(OmpaError::new(
                2,
                "End-member table names/order do not match the problem specification.",
            ));
        }
        for tracer in &self.tracer_names {
            if !endmembers.has_tracer(tracer) {
                return Err(OmpaError::new(
                    2,
                    format!("End-member table is missing tracer '{tracer}'."),
                ));
            }
        }
        Ok(())
    }

    /// Standardization parameters for an end-member table, or `None` when
    /// standardization is disabled.
    ///
    /// Exactly one tracer dimension must have zero standard deviation across
    /// end members (the one encoding total mass); zero or several such
    /// dimensions is a fatal configuration error.
    pub fn standardization_for(
        &self,
        endmembers: &EndMemberTable,
    ) -> Result<Option<Standardization>, OmpaError> {
        if !self.config.standardize {
            return Ok(None);
        }
        self.check_endmembers(endmembers)?;

        let n_em = endmembers.len() as f64;
        let mut mean = Vec::with_capacity(self.tracer_names.len());
        let mut std = Vec::with_capacity(self.tracer_names.len());
        let mut mass_idxs = Vec::new();
        for (j, tracer) in self.tracer_names.iter().enumerate() {
            let col = endmembers.tracer_index(tracer).unwrap_or(usize::MAX);
            let values: Vec<f64> = (0..endmembers.len())
                .map(|e| endmembers.value(e, col))
                .collect();
            let mu = values.iter().sum::<f64>() / n_em;
            let var = values.iter().map(|v| (v - mu) * (v - mu)).sum::<f64>() / n_em;
            let sigma = var.sqrt();
            if sigma < 1e-12 {
                mass_idxs.push(j);
            }
            mean.push(mu);
            std.push(sigma);
        }

        match mass_idxs.as_slice() {
            [mass_idx] => Ok(Some(Standardization {
                mean,
                std,
                mass_idx: *mass_idx,
            })),
            [] => Err(OmpaError::new(
                2,
                "Standardization requires exactly one zero-std (mass) tracer dimension; found none.",
            )),
            many => Err(OmpaError::new(
                2,
                format!(
                    "Standardization requires exactly one zero-std (mass) tracer dimension; found {}.",
                    many.len()
                ),
            )),
        }
    }

    /// Assemble the mixing matrix A: end-member tracer rows stacked above
    /// conversion-ratio rows; columns follow the declared tracer order.
    ///
    /// Rebuilt from scratch whenever end members (or the standardization
    /// derived from them) change.
    pub fn mixing_matrix(
        &self,
        endmembers: &EndMemberTable,
        standardization: Option<&Standardization>,
    ) -> Result<DMatrix<f64>, OmpaError> {
        self.check_endmembers(endmembers)?;

        let n_em = self.end_member_names.len();
        let n_tracers = self.tracer_names.len();
        let mut a = DMatrix::<f64>::zeros(n_em + self.conv_cols.len(), n_tracers);

        for (j, tracer) in self.tracer_names.iter().enumerate() {
            let col = endmembers.tracer_index(tracer).unwrap_or(usize::MAX);
            for e in 0..n_em {
                a[(e, j)] = transform_value(endmembers.value(e, col), j, standardization);
            }
        }

        for (c, conv) in self.conv_cols.iter().enumerate() {
            let group = &self.config.converted_groups[conv.group];
            let ratio = &group.ratios[conv.ratio];
            for (tracer, &value) in ratio {
                let j = self
                    .tracer_names
                    .iter()
                    .position(|t| t == tracer)
                    .expect("ratio tracers validated at construction");
                a[(n_em + c, j)] = scale_delta(value, j, standardization);
            }
        }

        Ok(a)
    }

    /// Observation values in declared tracer order (rows = observations),
    /// standardized when requested.
    pub fn observation_matrix(&self, standardization: Option<&Standardization>) -> DMatrix<f64> {
        let n = self.observations.len();
        let mut b = DMatrix::<f64>::zeros(n, self.tracer_names.len());
        for (j, tracer) in self.tracer_names.iter().enumerate() {
            let col = self
                .observations
                .column(tracer)
                .expect("tracer columns validated at construction");
            for i in 0..n {
                b[(i, j)] = transform_value(col[i], j, standardization);
            }
        }
        b
    }

    /// Raw conversion-ratio rows of one group (ratio vectors × group tracers),
    /// used for effective-ratio reporting in original units.
    pub fn group_ratio_matrix(&self, group: usize) -> (Vec<String>, DMatrix<f64>) {
        let g = &self.config.converted_groups[group];
        let tracers: Vec<String> = g.ratios[0].keys().cloned().collect();
        let mut m = DMatrix::<f64>::zeros(g.ratios.len(), tracers.len());
        for (r, ratio) in g.ratios.iter().enumerate() {
            for (t, name) in tracers.iter().enumerate() {
                m[(r, t)] = ratio[name];
            }
        }
        (tracers, m)
    }
}

/// Standardize an absolute value: `(v - mean) / std`, identity on the mass
/// dimension.
fn transform_value(v: f64, tracer_idx: usize, standardization: Option<&Standardization>) -> f64 {
    match standardization {
        Some(s) if tracer_idx != s.mass_idx => (v - s.mean[tracer_idx]) / s.std[tracer_idx],
        _ => v,
    }
}

/// Standardize a delta (conversion ratio): scale only, no mean shift.
fn scale_delta(v: f64, tracer_idx: usize, standardization: Option<&Standardization>) -> f64 {
    match standardization {
        Some(s) if tracer_idx != s.mass_idx => v / s.std[tracer_idx],
        _ => v,
    }
}

/// Invert `transform_value` (used when refined end members must be reported
/// in original units).
pub fn untransform_value(
    v: f64,
    tracer_idx: usize,
    standardization: Option<&Standardization>,
) -> f64 {
    match standardization {
        Some(s) if tracer_idx != s.mass_idx => v * s.std[tracer_idx] + s.mean[tracer_idx],
        _ => v,
    }
}

fn build_usage_penalty(
    config: &OmpaConfig,
    original: &ObservationTable,
    keep: &[bool],
    filtered: &ObservationTable,
    end_member_names: &[String],
) -> Result<DMatrix<f64>, OmpaError> {
    let n = filtered.len();
    let n_em = end_member_names.len();
    let mut penalty = DMatrix::<f64>::zeros(n, n_em);

    match &config.usage_penalty {
        UsagePenaltySource::None => {}
        UsagePenaltySource::Matrix(m) => {
            if m.nrows() != original.len() || m.ncols() != n_em {
                return Err(OmpaError::new(
                    2,
                    format!(
                        "Usage-penalty matrix shape {}x{} does not match {} observations x {} end members.",
                        m.nrows(),
                        m.ncols(),
                        original.len(),
                        n_em
                    ),
                ));
            }
            let mut out_row = 0;
            for (in_row, &k) in keep.iter().enumerate() {
                if k {
                    for e in 0..n_em {
                        penalty[(out_row, e)] = m[(in_row, e)];
                    }
                    out_row += 1;
                }
            }
        }
        UsagePenaltySource::Functions(fns) => {
            let latitude = filtered.column("latitude").ok_or_else(|| {
                OmpaError::new(
                    3,
                    "Usage-penalty functions need a 'latitude' observation column.",
                )
            })?;
            let sig0 = filtered.column("sig0").ok_or_else(|| {
                OmpaError::new(3, "Usage-penalty functions need a 'sig0' observation column.")
            })?;
            let fields = PenaltyFields { latitude, sig0 };

            for (name, func) in fns {
                let e = end_member_names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| {
                        OmpaError::new(
                            2,
                            format!("Usage penalty specified for unknown end member '{name}'."),
                        )
                    })?;
                let values = func(&fields);
                if values.len() != n {
                    return Err(OmpaError::new(
                        2,
                        format!(
                            "Usage-penalty function for '{name}' returned {} values for {n} observations.",
                            values.len()
                        ),
                    ));
                }
                for (i, &v) in values.iter().enumerate() {
                    if !(v.is_finite() && v >= 0.0) {
                        return Err(OmpaError::new(
                            2,
                            format!("Usage penalty for '{name}' must be non-negative and finite."),
                        ));
                    }
                    penalty[(i, e)] = v;
                }
            }
        }
    }

    for &v in penalty.iter() {
        if !(v.is_finite() && v >= 0.0) {
            return Err(OmpaError::new(2, "Usage penalties must be non-negative and finite."));
        }
    }

    Ok(penalty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConvertedGroup, TracerParam};
    use std::collections::BTreeMap;

    fn simple_endmembers() -> EndMemberTable {
        EndMemberTable::new(
            vec!["Upper".to_string(), "Lower".to_string()],
            vec!["salinity".to_string(), "oxygen".to_string()],
            DMatrix::from_row_slice(2, 2, &[34.0, 200.0, 36.0, 150.0]),
        )
        .unwrap()
    }

    fn simple_observations() -> ObservationTable {
        ObservationTable::new(vec![
            ("salinity".to_string(), vec![35.0, 34.5, f64::NAN]),
            ("oxygen".to_string(), vec![180.0, 190.0, 170.0]),
        ])
        .unwrap()
    }

    fn base_config() -> OmpaConfig {
        OmpaConfig {
            tracers: vec![
                TracerParam::new("salinity", 1.0),
                TracerParam::new("oxygen", 0.5),
            ],
            ..OmpaConfig::default()
        }
    }

    #[test]
    fn rows_with_missing_tracers_are_dropped_and_counted() {
        let problem =
            OmpaProblem::new(base_config(), &simple_observations(), &simple_endmembers()).unwrap();
        assert_eq!(problem.num_observations(), 2);
        assert_eq!(problem.dropped_rows(), 1);
        assert!(problem.warnings().iter().any(|w| w.contains("Dropped 1")));
        // Row identity survives filtering.
        assert_eq!(problem.observations().row_ids(), &[0, 1]);
    }

    #[test]
    fn missing_weight_free_tracer_is_rejected() {
        let mut config = base_config();
        config.tracers.push(TracerParam::new("phosphate", 1.0));
        let err = OmpaProblem::new(config, &simple_observations(), &simple_endmembers())
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn large_weight_warns_but_does_not_fail() {
        let mut config = base_config();
        config.tracers[0].weight = 250.0;
        let problem =
            OmpaProblem::new(config, &simple_observations(), &simple_endmembers()).unwrap();
        assert!(problem.warnings().iter().any(|w| w.contains("exceeds 100")));
    }

    #[test]
    fn duplicate_group_names_are_rejected() {
        let mut config = base_config();
        let ratio: BTreeMap<String, f64> = [("oxygen".to_string(), -1.0)].into();
        let group = ConvertedGroup {
            name: "remin".to_string(),
            ratios: vec![ratio],
            always_positive: false,
        };
        config.converted_groups = vec![group.clone(), group];
        let err = OmpaProblem::new(config, &simple_observations(), &simple_endmembers())
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("Duplicate converted-group"));
    }

    #[test]
    fn inconsistent_ratio_key_sets_are_rejected() {
        let mut config = base_config();
        let r1: BTreeMap<String, f64> = [("oxygen".to_string(), -1.0)].into();
        let r2: BTreeMap<String, f64> = [("salinity".to_string(), 0.1)].into();
        config.converted_groups = vec![ConvertedGroup {
            name: "remin".to_string(),
            ratios: vec![r1, r2],
            always_positive: false,
        }];
        let err = OmpaProblem::new(config, &simple_observations(), &simple_endmembers())
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn penalty_for_unknown_end_member_is_rejected() {
        let mut config = base_config();
        config.usage_penalty = UsagePenaltySource::Functions(vec![(
            "Abyssal".to_string(),
            Box::new(|fields: &PenaltyFields<'_>| vec![0.0; fields.latitude.len()]),
        )]);
        let observations = ObservationTable::new(vec![
            ("salinity".to_string(), vec![35.0]),
            ("oxygen".to_string(), vec![180.0]),
            ("latitude".to_string(), vec![10.0]),
            ("sig0".to_string(), vec![26.5]),
        ])
        .unwrap();
        let err = OmpaProblem::new(config, &observations, &simple_endmembers()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("unknown end member"));
    }

    #[test]
    fn penalty_matrix_rows_follow_dropped_observations() {
        let mut config = base_config();
        // 3 original rows; row 2 is dropped for NaN salinity.
        config.usage_penalty = UsagePenaltySource::Matrix(DMatrix::from_row_slice(
            3,
            2,
            &[0.0, 1.0, 0.0, 2.0, 0.0, 3.0],
        ));
        let problem =
            OmpaProblem::new(config, &simple_observations(), &simple_endmembers()).unwrap();
        assert_eq!(problem.usage_penalty().nrows(), 2);
        assert_eq!(problem.usage_penalty()[(1, 1)], 2.0);
    }

    #[test]
    fn mixing_matrix_stacks_ratio_rows_under_end_members() {
        let mut config = base_config();
        let ratio: BTreeMap<String, f64> = [("oxygen".to_string(), -1.0)].into();
        config.converted_groups = vec![ConvertedGroup {
            name: "remin".to_string(),
            ratios: vec![ratio],
            always_positive: false,
        }];
        let endmembers = simple_endmembers();
        let problem = OmpaProblem::new(config, &simple_observations(), &endmembers).unwrap();
        let a = problem.mixing_matrix(&endmembers, None).unwrap();
        assert_eq!((a.nrows(), a.ncols()), (3, 2));
        assert_eq!(a[(0, 0)], 34.0);
        assert_eq!(a[(1, 1)], 150.0);
        // Ratio row: zero for salinity, -1 for oxygen.
        assert_eq!(a[(2, 0)], 0.0);
        assert_eq!(a[(2, 1)], -1.0);
    }

    #[test]
    fn standardization_needs_exactly_one_mass_dimension() {
        // No zero-std tracer: fatal.
        let mut config = base_config();
        config.standardize = true;
        let err = OmpaProblem::new(config, &simple_observations(), &simple_endmembers())
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);

        // Add a constant "mass" tracer column: accepted, and its index found.
        let endmembers = EndMemberTable::new(
            vec!["Upper".to_string(), "Lower".to_string()],
            vec![
                "salinity".to_string(),
                "oxygen".to_string(),
                "mass".to_string(),
            ],
            DMatrix::from_row_slice(2, 3, &[34.0, 200.0, 1.0, 36.0, 150.0, 1.0]),
        )
        .unwrap();
        let observations = ObservationTable::new(vec![
            ("salinity".to_string(), vec![35.0]),
            ("oxygen".to_string(), vec![180.0]),
            ("mass".to_string(), vec![1.0]),
        ])
        .unwrap();
        let mut config = base_config();
        config.tracers.push(TracerParam::new("mass", 10.0));
        config.standardize = true;
        let problem = OmpaProblem::new(config, &observations, &endmembers).unwrap();
        let standardization = problem.standardization_for(&endmembers).unwrap().unwrap();
        assert_eq!(standardization.mass_idx, 2);

        // Mass column passes through untouched; others are centered/scaled.
        let b = problem.observation_matrix(Some(&standardization));
        assert_eq!(b[(0, 2)], 1.0);
        assert!((b[(0, 0)] - 0.0).abs() < 1e-9); // 35 is the end-member mean
    }
}

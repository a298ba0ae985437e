//! Shared domain types.
//!
//! These types are intentionally kept lightweight so they can be:
//!
//! - built in-memory by whatever loads the caller's tables
//! - used directly during solving
//! - exported to CSV afterwards
//!
//! Missing values are encoded as `NaN`; rows with missing required tracers
//! are dropped (and counted) before any solve.

use std::collections::{BTreeMap, HashMap};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::OmpaError;

/// An in-memory table of observations: one row per water sample, one column
/// per measured quantity (tracers plus optional `latitude` / `longitude` /
/// depth / `sig0` columns).
///
/// Tables are immutable once built; filtering returns a new table. Row
/// identities (`row_ids`) survive filtering so exported rows can be traced
/// back to the caller's original data.
#[derive(Debug, Clone)]
pub struct ObservationTable {
    column_order: Vec<String>,
    columns: HashMap<String, Vec<f64>>,
    row_ids: Vec<usize>,
    num_rows: usize,
}

impl ObservationTable {
    /// Build a table from named columns. All columns must have equal length.
    pub fn new(columns: Vec<(String, Vec<f64>)>) -> Result<Self, OmpaError> {
        let num_rows = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut order = Vec::with_capacity(columns.len());
        let mut map = HashMap::with_capacity(columns.len());
        for (name, values) in columns {
            if values.len() != num_rows {
                return Err(OmpaError::new(
                    3,
                    format!(
                        "Observation column '{name}' has {} rows, expected {num_rows}.",
                        values.len()
                    ),
                ));
            }
            if map.insert(name.clone(), values).is_some() {
                return Err(OmpaError::new(
                    3,
                    format!("Duplicate observation column '{name}'."),
                ));
            }
            order.push(name);
        }
        Ok(Self {
            column_order: order,
            columns: map,
            row_ids: (0..num_rows).collect(),
            num_rows,
        })
    }

    pub fn len(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    /// Original (pre-filtering) index of each current row.
    pub fn row_ids(&self) -> &[usize] {
        &self.row_ids
    }

    /// Return a new table keeping only rows where `keep` is true.
    ///
    /// Never mutates `self`; derived tables are always fresh values.
    pub fn retain_rows(&self, keep: &[bool]) -> Self {
        let columns = self
            .column_order
            .iter()
            .map(|name| {
                let src = &self.columns[name];
                let kept: Vec<f64> = src
                    .iter()
                    .zip(keep.iter())
                    .filter_map(|(v, &k)| if k { Some(*v) } else { None })
                    .collect();
                (name.clone(), kept)
            })
            .collect::<Vec<_>>();

        let row_ids: Vec<usize> = self
            .row_ids
            .iter()
            .zip(keep.iter())
            .filter_map(|(id, &k)| if k { Some(*id) } else { None })
            .collect();
        let num_rows = row_ids.len();

        let mut map = HashMap::with_capacity(columns.len());
        let mut order = Vec::with_capacity(columns.len());
        for (name, values) in columns {
            order.push(name.clone());
            map.insert(name, values);
        }
        Self {
            column_order: order,
            columns: map,
            row_ids,
            num_rows,
        }
    }
}

/// Named reference water masses: one row per end member, one column per
/// tracer. Refinement produces a new table; the table itself is never
/// mutated in place.
#[derive(Debug, Clone)]
pub struct EndMemberTable {
    names: Vec<String>,
    tracers: Vec<String>,
    /// `names.len() × tracers.len()`
    values: DMatrix<f64>,
}

impl EndMemberTable {
    pub fn new(
        names: Vec<String>,
        tracers: Vec<String>,
        values: DMatrix<f64>,
    ) -> Result<Self, OmpaError> {
        if values.nrows() != names.len() || values.ncols() != tracers.len() {
            return Err(OmpaError::new(
                3,
                format!(
                    "End-member table shape {}x{} does not match {} names x {} tracers.",
                    values.nrows(),
                    values.ncols(),
                    names.len(),
                    tracers.len()
                ),
            ));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(OmpaError::new(2, format!("Duplicate end member '{name}'.")));
            }
        }
        Ok(Self {
            names,
            tracers,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn tracers(&self) -> &[String] {
        &self.tracers
    }

    pub fn has_tracer(&self, name: &str) -> bool {
        self.tracers.iter().any(|t| t == name)
    }

    pub fn tracer_index(&self, name: &str) -> Option<usize> {
        self.tracers.iter().position(|t| t == name)
    }

    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    pub fn value(&self, end_member: usize, tracer: usize) -> f64 {
        self.values[(end_member, tracer)]
    }

    /// Same names/tracers, replaced values (used by the refiner).
    pub fn with_values(&self, values: DMatrix<f64>) -> Result<Self, OmpaError> {
        Self::new(self.names.clone(), self.tracers.clone(), values)
    }
}

/// One named converted-parameter group: a set of conversion-ratio vectors
/// (tracer name → ratio per unit of the converted variable) plus a flag for
/// groups whose sign is known to be positive (e.g. oxygen consumption along
/// an aging water mass).
///
/// Every ratio vector in a group must map the same tracer set; group names
/// must be unique within a problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertedGroup {
    pub name: String,
    pub ratios: Vec<BTreeMap<String, f64>>,
    pub always_positive: bool,
}

impl ConvertedGroup {
    pub fn num_ratios(&self) -> usize {
        self.ratios.len()
    }

    /// Tracer names covered by this group (keys of the first ratio vector).
    pub fn tracer_names(&self) -> Vec<&str> {
        self.ratios
            .first()
            .map(|r| r.keys().map(|k| k.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Sign constraint for one converted-variable group, resolved once at the
/// call boundary (replaces a "maybe array, maybe scalar" parameter).
#[derive(Debug, Clone, PartialEq)]
pub enum GroupSigns {
    /// The same sign for every observation.
    Global(f64),
    /// One sign per observation (sign-combination search output).
    PerObservation(Vec<f64>),
}

impl GroupSigns {
    pub fn sign_for(&self, observation: usize) -> f64 {
        match self {
            GroupSigns::Global(s) => *s,
            GroupSigns::PerObservation(signs) => signs[observation],
        }
    }
}

/// Per-observation fields handed to usage-penalty functions.
#[derive(Debug, Clone, Copy)]
pub struct PenaltyFields<'a> {
    pub latitude: &'a [f64],
    /// Potential density anomaly (`sig0` column).
    pub sig0: &'a [f64],
}

/// A usage-penalty function for one end member: given per-observation fields,
/// return one non-negative weight per observation.
pub type PenaltyFn = Box<dyn Fn(&PenaltyFields<'_>) -> Vec<f64> + Send + Sync>;

/// Where the usage-penalty matrix comes from.
///
/// Either computed once from latitude / potential density via per-end-member
/// functions, or supplied directly as an `observations × end members` matrix.
pub enum UsagePenaltySource {
    None,
    Functions(Vec<(String, PenaltyFn)>),
    Matrix(DMatrix<f64>),
}

impl std::fmt::Debug for UsagePenaltySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsagePenaltySource::None => write!(f, "None"),
            UsagePenaltySource::Functions(fns) => {
                let names: Vec<&str> = fns.iter().map(|(n, _)| n.as_str()).collect();
                f.debug_tuple("Functions").field(&names).finish()
            }
            UsagePenaltySource::Matrix(m) => f
                .debug_tuple("Matrix")
                .field(&(m.nrows(), m.ncols()))
                .finish(),
        }
    }
}

/// Spatial-smoothness regularization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Smoothness {
    /// Weight of the `‖pairs · fractions‖²` penalty.
    pub lambda: f64,
    /// Observation column holding the depth-like coordinate.
    pub depth_field: String,
    /// Scale applied to depth differences before combining with planar
    /// distance in quadrature.
    pub depth_scale: f64,
    /// Neighbor count `k` for the pairs operator. Must be smaller than the
    /// number of observations.
    pub n_neighbors: usize,
}

impl Smoothness {
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda,
            depth_field: "depth".to_string(),
            depth_scale: 1.0,
            n_neighbors: 4,
        }
    }
}

/// One tracer parameter and its objective weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerParam {
    pub name: String,
    /// Multiplies both end-member and observed values before squaring, so the
    /// effective residual weight is `weight²`. Weights above 100 trigger a
    /// non-fatal instability warning.
    pub weight: f64,
}

impl TracerParam {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Full problem configuration.
#[derive(Debug)]
pub struct OmpaConfig {
    pub tracers: Vec<TracerParam>,
    pub converted_groups: Vec<ConvertedGroup>,
    pub usage_penalty: UsagePenaltySource,
    pub smoothness: Option<Smoothness>,
    /// Require mixing fractions to sum to one (default on).
    pub sum_to_one: bool,
    /// Standardize values by end-member mean/std per tracer (default off).
    pub standardize: bool,
}

impl Default for OmpaConfig {
    fn default() -> Self {
        Self {
            tracers: Vec::new(),
            converted_groups: Vec::new(),
            usage_penalty: UsagePenaltySource::None,
            smoothness: None,
            sum_to_one: true,
            standardize: false,
        }
    }
}

/// Standardization parameters derived from an end-member table.
#[derive(Debug, Clone)]
pub struct Standardization {
    /// Per-tracer end-member mean.
    pub mean: Vec<f64>,
    /// Per-tracer end-member standard deviation.
    pub std: Vec<f64>,
    /// The single zero-std tracer dimension (the one encoding total mass).
    pub mass_idx: usize,
}

/// Which columns the results CSV should contain (column suffixes:
/// `_resid`, `_frac`, `_total`, `_to_<group>_ratio`, `_penalty`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Original observation columns to copy through. Requesting a column the
    /// observation table does not have is a fatal configuration error.
    pub original_columns: Vec<String>,
    pub include_residuals: bool,
    pub include_fractions: bool,
    pub include_group_totals: bool,
    pub include_effective_ratios: bool,
    pub include_usage_penalties: bool,
}

impl Default for ExportOptions {
    /// No passthrough columns, every derived block enabled.
    fn default() -> Self {
        Self {
            original_columns: Vec::new(),
            include_residuals: true,
            include_fractions: true,
            include_group_totals: true,
            include_effective_ratios: true,
            include_usage_penalties: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_table_rejects_ragged_columns() {
        let err = ObservationTable::new(vec![
            ("a".to_string(), vec![1.0, 2.0]),
            ("b".to_string(), vec![1.0]),
        ])
        .unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn retain_rows_keeps_row_identity() {
        let table = ObservationTable::new(vec![(
            "salinity".to_string(),
            vec![34.0, 35.0, 36.0],
        )])
        .unwrap();
        let filtered = table.retain_rows(&[true, false, true]);
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.row_ids(), &[0, 2]);
        assert_eq!(filtered.column("salinity").unwrap(), &[34.0, 36.0]);
        // original untouched
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn end_member_table_rejects_duplicate_names() {
        let err = EndMemberTable::new(
            vec!["AAIW".to_string(), "AAIW".to_string()],
            vec!["salinity".to_string()],
            DMatrix::from_row_slice(2, 1, &[34.0, 36.0]),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn group_signs_resolve_per_observation() {
        let global = GroupSigns::Global(1.0);
        assert_eq!(global.sign_for(7), 1.0);
        let per_obs = GroupSigns::PerObservation(vec![1.0, -1.0]);
        assert_eq!(per_obs.sign_for(1), -1.0);
    }
}

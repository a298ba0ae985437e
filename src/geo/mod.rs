//! Geometry: planar projection of sample positions and a depth-aware
//! pairwise-distance metric.
//!
//! Positions are projected onto a fixed-radius sphere's surface Cartesian
//! coordinates; depth differences are folded into the planar distance in
//! quadrature so that a single scalar controls how strongly vertical
//! separation counts against "nearness".

pub mod pairs;

pub use pairs::*;

use nalgebra::DMatrix;

use crate::domain::ObservationTable;
use crate::error::OmpaError;

/// Earth radius in km.
const EARTH_RADIUS_KM: f64 = 6.371e3;

/// Map geographic coordinates (degrees) to surface Cartesian coordinates on
/// a fixed-radius sphere.
///
/// Inputs are expected in degrees, latitude in [-90, 90] and longitude in
/// [-180, 180]; no range validation is performed.
pub fn to_planar_coordinates(lat: f64, lon: f64) -> (f64, f64) {
    let theta = (1.0 - lat) / 180.0 * std::f64::consts::PI;
    let phi = lon / 180.0 * std::f64::consts::PI;
    let x = EARTH_RADIUS_KM * theta.sin() * phi.cos();
    let y = EARTH_RADIUS_KM * theta.sin() * phi.sin();
    (x, y)
}

/// Pairwise distances between observations: planar Euclidean distance
/// combined in quadrature with scaled depth differences.
///
/// Requires `latitude`, `longitude` and `depth_field` columns; all three
/// must be finite for every row. The result is symmetric with a zero
/// diagonal.
pub fn pairwise_distances(
    observations: &ObservationTable,
    depth_field: &str,
    depth_scale: f64,
) -> Result<DMatrix<f64>, OmpaError> {
    let lat = require_column(observations, "latitude")?;
    let lon = require_column(observations, "longitude")?;
    let depth = require_column(observations, depth_field)?;

    let n = observations.len();
    let coords: Vec<(f64, f64)> = lat
        .iter()
        .zip(lon.iter())
        .map(|(&la, &lo)| to_planar_coordinates(la, lo))
        .collect();

    let mut out = DMatrix::<f64>::zeros(n, n);
    for i in 0..n {
        for j in (i + 1)..n {
            let dx = coords[i].0 - coords[j].0;
            let dy = coords[i].1 - coords[j].1;
            let dz = (depth[i] - depth[j]).abs() * depth_scale;
            let d = (dx * dx + dy * dy + dz * dz).sqrt();
            out[(i, j)] = d;
            out[(j, i)] = d;
        }
    }
    Ok(out)
}

fn require_column<'a>(
    observations: &'a ObservationTable,
    name: &str,
) -> Result<&'a [f64], OmpaError> {
    let column = observations.column(name).ok_or_else(|| {
        OmpaError::new(
            3,
            format!("Observation table is missing the '{name}' column required for spatial distances."),
        )
    })?;
    if column.iter().any(|v| !v.is_finite()) {
        return Err(OmpaError::new(
            3,
            format!("Observation column '{name}' contains non-finite values."),
        ));
    }
    Ok(column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ObservationTable;

    #[test]
    fn planar_coordinates_match_reference_values() {
        // theta = (1 - lat)/180 * pi, phi = lon/180 * pi, r = 6371 km.
        let (x, y) = to_planar_coordinates(0.0, 0.0);
        let theta = (1.0f64 / 180.0) * std::f64::consts::PI;
        assert!((x - EARTH_RADIUS_KM * theta.sin()).abs() < 1e-9);
        assert!(y.abs() < 1e-9);

        let (x2, y2) = to_planar_coordinates(45.0, 90.0);
        let theta2 = (1.0 - 45.0) / 180.0 * std::f64::consts::PI;
        assert!(x2.abs() < 1e-9);
        assert!((y2 - EARTH_RADIUS_KM * theta2.sin()).abs() < 1e-9);
    }

    fn colocated_obs(depths: &[f64]) -> ObservationTable {
        let n = depths.len();
        ObservationTable::new(vec![
            ("latitude".to_string(), vec![10.0; n]),
            ("longitude".to_string(), vec![20.0; n]),
            ("depth".to_string(), depths.to_vec()),
        ])
        .unwrap()
    }

    #[test]
    fn distances_are_symmetric_with_zero_diagonal() {
        let obs = colocated_obs(&[0.0, 100.0, 250.0]);
        let d = pairwise_distances(&obs, "depth", 1.0).unwrap();
        for i in 0..3 {
            assert_eq!(d[(i, i)], 0.0);
            for j in 0..3 {
                assert!((d[(i, j)] - d[(j, i)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn depth_scale_folds_into_quadrature() {
        // Same horizontal position: distance reduces to scaled depth difference.
        let obs = colocated_obs(&[0.0, 100.0]);
        let d = pairwise_distances(&obs, "depth", 0.5).unwrap();
        assert!((d[(0, 1)] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn missing_coordinate_column_is_a_data_error() {
        let obs = ObservationTable::new(vec![("depth".to_string(), vec![0.0])]).unwrap();
        let err = pairwise_distances(&obs, "depth", 1.0).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}

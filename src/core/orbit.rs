use crate::core::geodesy::{WGS84_A, WGS84_B};
use crate::types::{SarError, SarResult, StateVector, SPEED_OF_LIGHT};
use nalgebra::{DMatrix, Matrix3, Vector3};
use std::ops::Range;

/// Highest polynomial degree accepted for orbit interpolation
pub const MAX_ORBIT_DEGREE: usize = 5;

/// Number of state vectors in a local interpolation window
const LOCAL_WINDOW: usize = 8;

const MAX_ITERATIONS: usize = 50;
const AZIMUTH_TOLERANCE: f64 = 1e-9; // seconds
const POSITION_TOLERANCE: f64 = 1e-6; // meters

/// Zero-Doppler solution for a ground point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZeroDopplerSolution {
    pub azimuth_time: f64,
    /// One-way slant range time (s)
    pub range_time: f64,
}

/// Continuous satellite trajectory fitted to discrete state vectors
///
/// Each ECEF axis is a least-squares polynomial in normalized time, so
/// velocity and acceleration come from the analytic derivatives.
#[derive(Debug, Clone)]
pub struct OrbitTrajectory {
    state_vectors: Vec<StateVector>,
    degree: usize,
    time_centre: f64,
    time_scale: f64,
    coefficients: [Vec<f64>; 3],
}

impl OrbitTrajectory {
    /// Fit a trajectory of the given degree over all state vectors
    ///
    /// The degree is reduced to `n - 1` when fewer vectors are supplied.
    pub fn new(state_vectors: &[StateVector], degree: usize) -> SarResult<Self> {
        if degree == 0 || degree > MAX_ORBIT_DEGREE {
            return Err(SarError::Configuration(format!(
                "Orbit interpolation degree must be in 1..={}, got {}",
                MAX_ORBIT_DEGREE, degree
            )));
        }
        if state_vectors.len() < 2 {
            return Err(SarError::Geometry(format!(
                "At least 2 orbit state vectors are required, got {}",
                state_vectors.len()
            )));
        }

        let mut svs = state_vectors.to_vec();
        svs.sort_by(|a, b| a.time.total_cmp(&b.time));

        let t_min = svs[0].time;
        let t_max = svs[svs.len() - 1].time;
        if t_max - t_min <= 0.0 || !(t_max - t_min).is_finite() {
            return Err(SarError::Geometry(format!(
                "Degenerate state vector times: {} .. {}",
                t_min, t_max
            )));
        }

        let degree = degree.min(svs.len() - 1);
        let time_centre = 0.5 * (t_min + t_max);
        let time_scale = 0.25 * (t_max - t_min);

        let n = svs.len();
        let design = DMatrix::from_fn(n, degree + 1, |r, c| {
            ((svs[r].time - time_centre) / time_scale).powi(c as i32)
        });
        let positions = DMatrix::from_fn(n, 3, |r, c| svs[r].position[c]);

        let solution = design
            .svd(true, true)
            .solve(&positions, 1e-12)
            .map_err(|e| SarError::Numeric(format!("Orbit polynomial fit failed: {}", e)))?;
        let coefficients: [Vec<f64>; 3] = [0usize, 1, 2].map(|axis| solution.column(axis).iter().copied().collect());

        check_orbit_radius(&svs);
        log::debug!(
            "Orbit fitted: {} state vectors, degree {}, {:.3}..{:.3} s",
            n,
            degree,
            t_min,
            t_max
        );

        Ok(Self {
            state_vectors: svs,
            degree,
            time_centre,
            time_scale,
            coefficients,
        })
    }

    /// Fit a trajectory over the 7-8 state vectors nearest to `target`
    pub fn local(state_vectors: &[StateVector], target: &Vector3<f64>, degree: usize) -> SarResult<Self> {
        let mut svs = state_vectors.to_vec();
        svs.sort_by(|a, b| a.time.total_cmp(&b.time));
        let window = Self::adjacent_window(&svs, target)?;
        log::debug!("Local orbit window {:?} of {} state vectors", window, svs.len());
        Self::new(&svs[window], degree)
    }

    /// Index window of the state vectors used for local interpolation
    ///
    /// Centred on the vector closest in 3D distance to `target`, shifted
    /// inward near either end of the list.
    pub fn adjacent_window(state_vectors: &[StateVector], target: &Vector3<f64>) -> SarResult<Range<usize>> {
        let n = state_vectors.len();
        if n < 2 {
            return Err(SarError::Geometry(format!(
                "At least 2 orbit state vectors are required, got {}",
                n
            )));
        }

        let nearest = state_vectors
            .iter()
            .map(|sv| (Vector3::from(sv.position) - target).norm())
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let window = if nearest < 3 {
            0..LOCAL_WINDOW.min(n)
        } else if nearest + 5 > n {
            n.saturating_sub(LOCAL_WINDOW)..n
        } else {
            nearest - 3..nearest + 5
        };
        Ok(window)
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn state_vectors(&self) -> &[StateVector] {
        &self.state_vectors
    }

    pub fn position_at(&self, time: f64) -> Vector3<f64> {
        let x = self.normalized(time);
        Vector3::from_fn(|axis, _| horner(&self.coefficients[axis], x))
    }

    pub fn velocity_at(&self, time: f64) -> Vector3<f64> {
        let x = self.normalized(time);
        Vector3::from_fn(|axis, _| first_derivative(&self.coefficients[axis], x) / self.time_scale)
    }

    pub fn acceleration_at(&self, time: f64) -> Vector3<f64> {
        let x = self.normalized(time);
        let scale2 = self.time_scale * self.time_scale;
        Vector3::from_fn(|axis, _| second_derivative(&self.coefficients[axis], x) / scale2)
    }

    /// Time of closest approach (zero Doppler) of the trajectory to `target`
    ///
    /// Newton iteration on `(P - S(t)) . V(t) = 0` seeded with `reference_time`.
    pub fn time_of_closest_approach(
        &self,
        target: &Vector3<f64>,
        reference_time: f64,
    ) -> SarResult<ZeroDopplerSolution> {
        let mut time = reference_time;

        for _ in 0..MAX_ITERATIONS {
            let delta = target - self.position_at(time);
            let velocity = self.velocity_at(time);

            let doppler = velocity.dot(&delta);
            let slope = self.acceleration_at(time).dot(&delta) - velocity.norm_squared();
            if slope.abs() < f64::EPSILON {
                return Err(SarError::Geometry(format!(
                    "Zero-Doppler iteration stalled at t = {:.6}",
                    time
                )));
            }

            let step = -doppler / slope;
            time += step;

            if step.abs() < AZIMUTH_TOLERANCE {
                let range = (target - self.position_at(time)).norm();
                return Ok(ZeroDopplerSolution {
                    azimuth_time: time,
                    range_time: range / SPEED_OF_LIGHT,
                });
            }
        }

        Err(SarError::Geometry(format!(
            "Zero-Doppler time did not converge from t = {:.6}",
            reference_time
        )))
    }

    /// Ground position seen at the given azimuth and one-way range time
    ///
    /// Solves the Doppler, range and ellipsoid equations (WGS84 inflated by
    /// `height`) with Newton steps from `initial_guess`.
    pub fn geolocate(
        &self,
        azimuth_time: f64,
        range_time: f64,
        height: f64,
        initial_guess: &Vector3<f64>,
    ) -> SarResult<Vector3<f64>> {
        let satellite = self.position_at(azimuth_time);
        let velocity = self.velocity_at(azimuth_time);
        let range = range_time * SPEED_OF_LIGHT;
        let a2 = (WGS84_A + height).powi(2);
        let b2 = (WGS84_B + height).powi(2);

        let mut point = *initial_guess;
        for _ in 0..MAX_ITERATIONS {
            let los = point - satellite;
            let residual = Vector3::new(
                velocity.dot(&los),
                los.norm_squared() - range * range,
                (point.x * point.x + point.y * point.y) / a2 + point.z * point.z / b2 - 1.0,
            );
            let jacobian = Matrix3::new(
                velocity.x, velocity.y, velocity.z,
                2.0 * los.x, 2.0 * los.y, 2.0 * los.z,
                2.0 * point.x / a2, 2.0 * point.y / a2, 2.0 * point.z / b2,
            );

            let step = jacobian.lu().solve(&(-residual)).ok_or_else(|| {
                SarError::Geometry(format!(
                    "Singular geolocation system at t = {:.6}, tr = {:.9}",
                    azimuth_time, range_time
                ))
            })?;
            point += step;

            if step.norm() < POSITION_TOLERANCE {
                return Ok(point);
            }
        }

        Err(SarError::Geometry(format!(
            "Geolocation did not converge at t = {:.6}, tr = {:.9}",
            azimuth_time, range_time
        )))
    }

    fn normalized(&self, time: f64) -> f64 {
        (time - self.time_centre) / self.time_scale
    }
}

fn horner(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}

fn first_derivative(coefficients: &[f64], x: f64) -> f64 {
    coefficients
        .iter()
        .enumerate()
        .skip(1)
        .rev()
        .fold(0.0, |acc, (k, &c)| acc * x + k as f64 * c)
}

fn second_derivative(coefficients: &[f64], x: f64) -> f64 {
    coefficients
        .iter()
        .enumerate()
        .skip(2)
        .rev()
        .fold(0.0, |acc, (k, &c)| acc * x + (k * (k - 1)) as f64 * c)
}

fn check_orbit_radius(state_vectors: &[StateVector]) {
    // Sentinel-1 flies at roughly 7000 km from the Earth's centre
    for sv in state_vectors {
        let radius = Vector3::from(sv.position).norm();
        if !(6_500_000.0..=7_500_000.0).contains(&radius) {
            log::warn!("Unusual orbital radius: {:.1} km at t = {:.3}", radius / 1000.0, sv.time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geodesy::latlon_to_ecef;
    use approx::assert_abs_diff_eq;

    const RADIUS: f64 = 7_071_000.0;
    const OMEGA: f64 = 2.0 * std::f64::consts::PI / 5940.0;

    fn circular_position(t: f64) -> Vector3<f64> {
        let angle = OMEGA * t;
        Vector3::new(RADIUS * angle.cos(), 0.0, RADIUS * angle.sin())
    }

    fn circular_orbit() -> Vec<StateVector> {
        (0..21)
            .map(|i| {
                let t = i as f64 * 10.0;
                let p = circular_position(t);
                StateVector {
                    time: t,
                    position: [p.x, p.y, p.z],
                }
            })
            .collect()
    }

    #[test]
    fn test_interpolation_matches_circular_orbit() {
        let svs = circular_orbit();
        let orbit = OrbitTrajectory::new(&svs[6..14], 5).unwrap();

        let t = 95.5;
        let expected = circular_position(t);
        let p = orbit.position_at(t);
        assert_abs_diff_eq!((p - expected).norm(), 0.0, epsilon = 1e-3);

        let angle = OMEGA * t;
        let expected_velocity = Vector3::new(-angle.sin(), 0.0, angle.cos()) * RADIUS * OMEGA;
        assert_abs_diff_eq!((orbit.velocity_at(t) - expected_velocity).norm(), 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_degree_reduced_for_few_vectors() {
        let svs = circular_orbit();
        let orbit = OrbitTrajectory::new(&svs[..3], 5).unwrap();
        assert_eq!(orbit.degree(), 2);
    }

    #[test]
    fn test_too_few_state_vectors() {
        let svs = circular_orbit();
        assert!(matches!(
            OrbitTrajectory::new(&svs[..1], 3),
            Err(SarError::Geometry(_))
        ));
        assert!(matches!(
            OrbitTrajectory::new(&svs, 6),
            Err(SarError::Configuration(_))
        ));
    }

    #[test]
    fn test_adjacent_window_selection() {
        let svs = circular_orbit();
        let at = |i: usize| Vector3::from(svs[i].position);

        assert_eq!(OrbitTrajectory::adjacent_window(&svs, &at(1)).unwrap(), 0..8);
        assert_eq!(OrbitTrajectory::adjacent_window(&svs, &at(10)).unwrap(), 7..15);
        assert_eq!(OrbitTrajectory::adjacent_window(&svs, &at(16)).unwrap(), 13..21);
        assert_eq!(OrbitTrajectory::adjacent_window(&svs, &at(20)).unwrap(), 13..21);
        assert_eq!(OrbitTrajectory::adjacent_window(&svs[..5], &at(3)).unwrap(), 0..5);
    }

    #[test]
    fn test_time_of_closest_approach() {
        let svs = circular_orbit();
        let target = latlon_to_ecef(6.0, 5.0, 0.0);
        let orbit = OrbitTrajectory::local(&svs, &target, 5).unwrap();

        let solution = orbit.time_of_closest_approach(&target, 90.0).unwrap();

        let expected_time = target.z.atan2(target.x) / OMEGA;
        let expected_range = (target - circular_position(expected_time)).norm() / SPEED_OF_LIGHT;
        assert_abs_diff_eq!(solution.azimuth_time, expected_time, epsilon = 1e-6);
        assert_abs_diff_eq!(solution.range_time, expected_range, epsilon = 1e-11);
    }

    #[test]
    fn test_geolocation_inverts_zero_doppler() {
        let svs = circular_orbit();
        let target = latlon_to_ecef(6.0, 5.0, 0.0);
        let orbit = OrbitTrajectory::local(&svs, &target, 5).unwrap();
        let solution = orbit.time_of_closest_approach(&target, 100.0).unwrap();

        let guess = latlon_to_ecef(6.5, 4.0, 0.0);
        let point = orbit
            .geolocate(solution.azimuth_time, solution.range_time, 0.0, &guess)
            .unwrap();

        assert_abs_diff_eq!((point - target).norm(), 0.0, epsilon = 1e-2);
    }
}

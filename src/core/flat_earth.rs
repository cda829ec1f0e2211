use crate::core::acquisition::AcquisitionPair;
use crate::core::geodesy::{ecef_to_latlon, latlon_to_ecef};
use crate::core::orbit::OrbitTrajectory;
use crate::core::polynomial::{FlatEarthPolynomial, NormalizationWindow};
use crate::core::segmentation::{Burst, PolynomialScope, Segmentation};
use crate::types::{SarError, SarResult, SPEED_OF_LIGHT};
use dashmap::DashMap;
use nalgebra::Vector3;
use std::f64::consts::PI;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Cache key of a flat-earth polynomial
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolynomialKey {
    pub pair: String,
    pub scope: PolynomialScope,
}

impl std::fmt::Display for PolynomialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.pair, self.scope)
    }
}

/// Spread `num_points` (line, pixel) samples over a window on a regular grid
///
/// The grid aspect follows the window aspect; bounds are inclusive.
pub fn distribute_points(
    num_points: usize,
    lines: (usize, usize),
    pixels: (usize, usize),
) -> Vec<(usize, usize)> {
    if num_points == 0 || lines.1 < lines.0 || pixels.1 < pixels.0 {
        return Vec::new();
    }
    let n_lines = lines.1 - lines.0 + 1;
    let n_pixels = pixels.1 - pixels.0 + 1;

    let ratio = n_lines as f64 / n_pixels as f64;
    let rows = ((num_points as f64 * ratio).sqrt().round() as usize).clamp(1, num_points.min(n_lines));
    let cols = (num_points + rows - 1) / rows;
    let line_step = n_lines as f64 / rows as f64;
    let pixel_step = n_pixels as f64 / cols as f64;

    (0..num_points)
        .map(|i| {
            let (r, c) = (i / cols, i % cols);
            let line = lines.0 + ((r as f64 + 0.5) * line_step) as usize;
            let pixel = pixels.0 + ((c as f64 + 0.5) * pixel_step) as usize;
            (line.min(lines.1), pixel.min(pixels.1))
        })
        .collect()
}

/// Orbits and radar constants of a pair, ready for phase sampling
struct PairGeometry {
    master_orbit: OrbitTrajectory,
    slave_orbit: OrbitTrajectory,
    master_wavelength: f64,
    slave_wavelength: f64,
    slave_reference_time: f64,
    ground_guess: Vector3<f64>,
    bistatic: bool,
}

impl PairGeometry {
    /// Geometric phase difference at a master (azimuth, range) time
    fn phase_residual(&self, azimuth_time: f64, range_time: f64) -> SarResult<f64> {
        let ground = self
            .master_orbit
            .geolocate(azimuth_time, range_time, 0.0, &self.ground_guess)?;
        let slave = self
            .slave_orbit
            .time_of_closest_approach(&ground, self.slave_reference_time)?;

        let slave_range_time = if self.bistatic {
            0.5 * (slave.range_time + range_time)
        } else {
            slave.range_time
        };

        let master_phase = -4.0 * PI * SPEED_OF_LIGHT / self.master_wavelength * range_time;
        let slave_phase = -4.0 * PI * SPEED_OF_LIGHT / self.slave_wavelength * slave_range_time;
        Ok(master_phase - slave_phase)
    }
}

/// Estimates flat-earth polynomials from orbit geometry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatEarthEstimator {
    pub degree: usize,
    pub num_points: usize,
    pub orbit_degree: usize,
    pub bistatic: bool,
}

impl FlatEarthEstimator {
    /// Create a new estimator
    pub fn new(degree: usize, num_points: usize, orbit_degree: usize, bistatic: bool) -> Self {
        Self {
            degree,
            num_points,
            orbit_degree,
            bistatic,
        }
    }

    /// Polynomial over the whole `width` x `height` scene
    pub fn estimate_scene(
        &self,
        pair: &AcquisitionPair,
        width: usize,
        height: usize,
    ) -> SarResult<FlatEarthPolynomial> {
        if width == 0 || height == 0 {
            return Err(SarError::Configuration(format!("Empty scene {}x{}", width, height)));
        }
        let master = &pair.master.metadata;
        let slave = &pair.slave.metadata;

        let geometry = PairGeometry {
            master_orbit: OrbitTrajectory::new(&master.state_vectors, self.orbit_degree)?,
            slave_orbit: OrbitTrajectory::new(&slave.state_vectors, self.orbit_degree)?,
            master_wavelength: pair.master.radar_wavelength,
            slave_wavelength: pair.slave.radar_wavelength,
            slave_reference_time: slave.scene_centre_azimuth_time(),
            ground_guess: latlon_to_ecef(master.centre_lat, master.centre_lon, 0.0),
            bistatic: self.bistatic,
        };

        self.fit(&geometry, (0, height - 1), (0, width - 1), |line, pixel| {
            (master.azimuth_time(line), master.range_time(pixel))
        })
    }

    /// Polynomial over one TOPSAR burst
    ///
    /// Both orbits are refitted over the state vectors nearest to the burst
    /// centre, and geolocation starts from that centre.
    pub fn estimate_burst(&self, pair: &AcquisitionPair, burst: &Burst) -> SarResult<FlatEarthPolynomial> {
        let master = &pair.master.metadata;
        let slave = &pair.slave.metadata;

        let master_full = OrbitTrajectory::new(&master.state_vectors, self.orbit_degree)?;
        let scene_guess = latlon_to_ecef(master.centre_lat, master.centre_lon, 0.0);
        let centre = burst_centre(&master_full, burst, &scene_guess)?;

        let geometry = PairGeometry {
            master_orbit: OrbitTrajectory::local(&master.state_vectors, &centre, self.orbit_degree)?,
            slave_orbit: OrbitTrajectory::local(&slave.state_vectors, &centre, self.orbit_degree)?,
            master_wavelength: pair.master.radar_wavelength,
            slave_wavelength: pair.slave.radar_wavelength,
            slave_reference_time: slave.scene_centre_azimuth_time(),
            ground_guess: centre,
            bistatic: self.bistatic,
        };

        self.fit(&geometry, burst.lines, burst.pixels, |line, pixel| {
            (burst.azimuth_time(line), burst.range_time(pixel))
        })
    }

    fn fit<F>(
        &self,
        geometry: &PairGeometry,
        lines: (usize, usize),
        pixels: (usize, usize),
        timing: F,
    ) -> SarResult<FlatEarthPolynomial>
    where
        F: Fn(f64, f64) -> (f64, f64),
    {
        let samples = distribute_points(self.num_points, lines, pixels)
            .into_iter()
            .map(|(line, pixel)| {
                let (line, pixel) = (line as f64, pixel as f64);
                let (azimuth_time, range_time) = timing(line, pixel);
                Ok((line, pixel, geometry.phase_residual(azimuth_time, range_time)?))
            })
            .collect::<SarResult<Vec<_>>>()?;

        FlatEarthPolynomial::fit(self.degree, NormalizationWindow::new(lines, pixels), &samples)
    }
}

/// Ground point at the mean latitude/longitude of the burst corners
fn burst_centre(orbit: &OrbitTrajectory, burst: &Burst, guess: &Vector3<f64>) -> SarResult<Vector3<f64>> {
    let corners = [
        (burst.first_line_time, burst.slr_time_to_first_pixel),
        (burst.first_line_time, burst.slr_time_to_last_pixel),
        (burst.last_line_time, burst.slr_time_to_first_pixel),
        (burst.last_line_time, burst.slr_time_to_last_pixel),
    ];

    let mut lat = 0.0;
    let mut lon = 0.0;
    for (azimuth_time, range_time) in corners {
        let corner = orbit.geolocate(azimuth_time, range_time, 0.0, guess)?;
        let (corner_lat, corner_lon, _) = ecef_to_latlon(&corner);
        lat += corner_lat;
        lon += corner_lon;
    }
    Ok(latlon_to_ecef(lat / 4.0, lon / 4.0, 0.0))
}

/// Flat-earth polynomials of a stack, estimated at most once per key
pub struct FlatEarthCache {
    estimator: FlatEarthEstimator,
    segmentation: Arc<Segmentation>,
    polynomials: DashMap<PolynomialKey, Arc<FlatEarthPolynomial>>,
}

impl FlatEarthCache {
    pub fn new(estimator: FlatEarthEstimator, segmentation: Arc<Segmentation>) -> Self {
        Self {
            estimator,
            segmentation,
            polynomials: DashMap::new(),
        }
    }

    pub fn estimator(&self) -> &FlatEarthEstimator {
        &self.estimator
    }

    /// Cached polynomial for `pair` and `scope`, estimated on first access
    ///
    /// Concurrent first requests for the same key block on the estimating
    /// worker and receive its result.
    pub fn get_or_estimate(
        &self,
        pair: &AcquisitionPair,
        scope: PolynomialScope,
    ) -> SarResult<Arc<FlatEarthPolynomial>> {
        let key = PolynomialKey {
            pair: pair.name.clone(),
            scope,
        };
        if let Some(existing) = self.polynomials.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        let entry = self
            .polynomials
            .entry(key)
            .or_try_insert_with(|| self.estimate(pair, scope).map(Arc::new))?;
        Ok(Arc::clone(entry.value()))
    }

    /// Estimate every missing polynomial of `pairs` up front
    pub fn prepare(&self, pairs: &[AcquisitionPair]) -> SarResult<()> {
        let scopes = self.segmentation.scopes();
        let jobs: Vec<(&AcquisitionPair, PolynomialScope)> = pairs
            .iter()
            .flat_map(|pair| scopes.iter().map(move |&scope| (pair, scope)))
            .filter(|(pair, scope)| {
                !self.polynomials.contains_key(&PolynomialKey {
                    pair: pair.name.clone(),
                    scope: *scope,
                })
            })
            .collect();

        log::info!("Estimating {} flat-earth polynomial(s)", jobs.len());

        #[cfg(feature = "parallel")]
        let iter = jobs.par_iter();
        #[cfg(not(feature = "parallel"))]
        let iter = jobs.iter();

        let estimated = iter
            .map(|&(pair, scope)| {
                let polynomial = self.estimate(pair, scope)?;
                let key = PolynomialKey {
                    pair: pair.name.clone(),
                    scope,
                };
                Ok((key, polynomial))
            })
            .collect::<SarResult<Vec<_>>>()?;

        for (key, polynomial) in estimated {
            self.polynomials.entry(key).or_insert_with(|| Arc::new(polynomial));
        }
        Ok(())
    }

    pub fn get(&self, key: &PolynomialKey) -> Option<Arc<FlatEarthPolynomial>> {
        self.polynomials.get(key).map(|p| Arc::clone(p.value()))
    }

    pub fn len(&self) -> usize {
        self.polynomials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polynomials.is_empty()
    }

    fn estimate(&self, pair: &AcquisitionPair, scope: PolynomialScope) -> SarResult<FlatEarthPolynomial> {
        log::debug!("Estimating flat-earth polynomial for {} ({})", pair.name, scope);
        let polynomial = match scope {
            PolynomialScope::Scene => {
                let (width, height) = self.segmentation.raster_size();
                self.estimator.estimate_scene(pair, width, height)
            }
            PolynomialScope::Burst { .. } => {
                let burst = self.segmentation.burst(scope).ok_or_else(|| {
                    SarError::Configuration(format!("Unknown burst {} for pair {}", scope, pair.name))
                })?;
                self.estimator.estimate_burst(pair, burst)
            }
        }?;
        log::debug!(
            "Flat-earth polynomial {} ({}): constant term {:.3} rad",
            pair.name,
            scope,
            polynomial.coefficients()[0]
        );
        Ok(polynomial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::acquisition::{Acquisition, AcquisitionKey, ComplexBandPair};
    use crate::io::metadata::AcquisitionMetadata;
    use crate::types::StateVector;
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;

    const RADIUS: f64 = 7_071_000.0;
    const OMEGA: f64 = 2.0 * PI / 5940.0;

    fn metadata(orbit: u32, radius: f64) -> AcquisitionMetadata {
        let state_vectors = (0..21)
            .map(|i| {
                let t = i as f64 * 10.0;
                let angle = OMEGA * t;
                StateVector {
                    time: t,
                    position: [radius * angle.cos(), 0.0, radius * angle.sin()],
                }
            })
            .collect();
        AcquisitionMetadata {
            mission: "SENTINEL-1A".to_string(),
            abs_orbit: orbit,
            date: NaiveDate::from_ymd_opt(2020, 1, 3).unwrap(),
            first_line_time: 95.0,
            last_line_time: 95.99,
            azimuth_time_interval: 0.01,
            radar_wavelength: 0.0555,
            range_spacing: 20.0,
            azimuth_spacing: 70.0,
            slant_range_to_first_pixel: 900_000.0,
            incidence_angle: 38.0,
            srgr: false,
            centre_lat: 6.0,
            centre_lon: 5.0,
            state_vectors,
            sub_swaths: Vec::new(),
        }
    }

    fn acquisition(orbit: u32, radius: f64) -> Arc<Acquisition> {
        Arc::new(Acquisition {
            key: AcquisitionKey {
                orbit,
                subswath: None,
                polarization: None,
            },
            date: "03Jan2020".to_string(),
            polarization: None,
            subswath: None,
            radar_wavelength: 0.0555,
            bands: ComplexBandPair {
                real: format!("i_{}", orbit),
                imaginary: format!("q_{}", orbit),
            },
            metadata: Arc::new(metadata(orbit, radius)),
        })
    }

    fn pair(slave_radius: f64) -> AcquisitionPair {
        AcquisitionPair {
            name: "1_2".to_string(),
            master: acquisition(1, RADIUS),
            slave: acquisition(2, slave_radius),
            outputs: Vec::new(),
        }
    }

    fn estimator() -> FlatEarthEstimator {
        FlatEarthEstimator::new(5, 501, 5, false)
    }

    #[test]
    fn test_distribute_points() {
        let points = distribute_points(501, (0, 99), (0, 199));
        assert_eq!(points.len(), 501);
        assert!(points.iter().all(|&(l, p)| l <= 99 && p <= 199));

        let mut unique = points.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 501);

        let offset = distribute_points(10, (50, 59), (0, 9));
        assert!(offset.iter().all(|&(l, _)| (50..=59).contains(&l)));
    }

    #[test]
    fn test_identical_orbits_give_zero_phase() {
        let poly = estimator().estimate_scene(&pair(RADIUS), 200, 100).unwrap();
        for &(line, pixel) in &[(0.0, 0.0), (37.0, 123.0), (99.0, 199.0)] {
            assert_abs_diff_eq!(poly.evaluate(line, pixel), 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_polynomial_tracks_phase_residual() {
        let pair = pair(RADIUS + 50.0);
        let est = estimator();
        let poly = est.estimate_scene(&pair, 200, 100).unwrap();

        let master = &pair.master.metadata;
        let geometry = PairGeometry {
            master_orbit: OrbitTrajectory::new(&master.state_vectors, 5).unwrap(),
            slave_orbit: OrbitTrajectory::new(&pair.slave.metadata.state_vectors, 5).unwrap(),
            master_wavelength: 0.0555,
            slave_wavelength: 0.0555,
            slave_reference_time: pair.slave.metadata.scene_centre_azimuth_time(),
            ground_guess: latlon_to_ecef(6.0, 5.0, 0.0),
            bistatic: false,
        };

        for &(line, pixel) in &[(3.0, 11.0), (37.0, 123.0), (88.0, 190.0)] {
            let direct = geometry
                .phase_residual(master.azimuth_time(line), master.range_time(pixel))
                .unwrap();
            assert_abs_diff_eq!(poly.evaluate(line, pixel), direct, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_bistatic_uses_mean_range_time() {
        let pair = pair(RADIUS + 50.0);
        let master = &pair.master.metadata;
        let geometry = |bistatic| PairGeometry {
            master_orbit: OrbitTrajectory::new(&master.state_vectors, 5).unwrap(),
            slave_orbit: OrbitTrajectory::new(&pair.slave.metadata.state_vectors, 5).unwrap(),
            master_wavelength: 0.0555,
            slave_wavelength: 0.0555,
            slave_reference_time: pair.slave.metadata.scene_centre_azimuth_time(),
            ground_guess: latlon_to_ecef(6.0, 5.0, 0.0),
            bistatic,
        };
        let monostatic = geometry(false);
        let bistatic = geometry(true);

        let (azimuth_time, range_time) = (master.azimuth_time(40.0), master.range_time(150.0));
        let ground = bistatic
            .master_orbit
            .geolocate(azimuth_time, range_time, 0.0, &bistatic.ground_guess)
            .unwrap();
        let slave = bistatic
            .slave_orbit
            .time_of_closest_approach(&ground, bistatic.slave_reference_time)
            .unwrap();
        let k = -4.0 * PI * SPEED_OF_LIGHT / 0.0555;
        let expected = k * range_time - k * 0.5 * (slave.range_time + range_time);

        let residual = bistatic.phase_residual(azimuth_time, range_time).unwrap();
        assert_abs_diff_eq!(residual, expected, epsilon = 1e-6 * expected.abs().max(1.0));

        // one-way slave path: half the monostatic phase difference
        let full = monostatic.phase_residual(azimuth_time, range_time).unwrap();
        assert!(full.abs() > 1.0);
        assert_abs_diff_eq!(residual, 0.5 * full, epsilon = 1e-6 * full.abs());

        let mono_poly = estimator().estimate_scene(&pair, 200, 100).unwrap();
        let bi_poly = FlatEarthEstimator::new(5, 501, 5, true)
            .estimate_scene(&pair, 200, 100)
            .unwrap();
        for &(line, pixel) in &[(3.0, 11.0), (50.0, 100.0), (88.0, 190.0)] {
            assert_abs_diff_eq!(
                bi_poly.evaluate(line, pixel),
                0.5 * mono_poly.evaluate(line, pixel),
                epsilon = 1e-2
            );
        }
    }

    #[test]
    fn test_burst_estimation() {
        let burst = Burst {
            subswath: 0,
            index: 0,
            first_line_time: 95.0,
            last_line_time: 95.49,
            azimuth_time_interval: 0.01,
            range_pixel_spacing: 20.0,
            slr_time_to_first_pixel: 900_000.0 / SPEED_OF_LIGHT,
            slr_time_to_last_pixel: (900_000.0 + 199.0 * 20.0) / SPEED_OF_LIGHT,
            lines: (0, 49),
            pixels: (0, 199),
        };
        let poly = estimator().estimate_burst(&pair(RADIUS), &burst).unwrap();
        assert_eq!(poly.coefficients().len(), 21);
        assert_abs_diff_eq!(poly.evaluate(25.0, 100.0), 0.0, epsilon = 1e-4);
        assert_eq!(poly.window().max_line, 49.0);
    }

    #[test]
    fn test_missing_orbit_is_geometry_error() {
        let mut pair = pair(RADIUS);
        let mut slave = (*pair.slave).clone();
        let mut meta = (*slave.metadata).clone();
        meta.state_vectors.truncate(1);
        slave.metadata = Arc::new(meta);
        pair.slave = Arc::new(slave);

        assert!(matches!(
            estimator().estimate_scene(&pair, 200, 100),
            Err(SarError::Geometry(_))
        ));
    }

    #[test]
    fn test_cache_estimates_once() {
        let segmentation = Arc::new(Segmentation::WholeScene { width: 200, height: 100 });
        let cache = FlatEarthCache::new(estimator(), segmentation);
        let pair = pair(RADIUS + 50.0);

        let first = cache.get_or_estimate(&pair, PolynomialScope::Scene).unwrap();
        let second = cache.get_or_estimate(&pair, PolynomialScope::Scene).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        cache.prepare(std::slice::from_ref(&pair)).unwrap();
        let key = PolynomialKey {
            pair: pair.name.clone(),
            scope: PolynomialScope::Scene,
        };
        assert!(Arc::ptr_eq(&cache.get(&key).unwrap(), &first));
    }
}

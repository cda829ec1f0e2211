use crate::types::{ComplexTile, Rect, SarComplex, SarError, SarResult};
use ndarray::{Array2, Zip};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

/// Coherence estimation window (azimuth lines x range pixels)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherenceWindow {
    pub azimuth: usize,
    pub range: usize,
}

impl CoherenceWindow {
    pub fn new(azimuth: usize, range: usize) -> SarResult<Self> {
        if azimuth == 0 || range == 0 {
            return Err(SarError::Configuration(format!(
                "Coherence window must be at least 1x1, got {}x{}",
                azimuth, range
            )));
        }
        Ok(Self { azimuth, range })
    }

    /// Window with roughly square ground footprint for a given range size
    ///
    /// Falls back to a single azimuth line and a derived range size when the
    /// azimuth pixels are larger than the ground range pixels. Missing range
    /// spacing means unit spacing in both directions; a missing incidence
    /// angle leaves the slant range spacing as is.
    pub fn square_pixel(
        range: usize,
        range_spacing: f64,
        azimuth_spacing: f64,
        incidence_angle_deg: f64,
        ground_range_product: bool,
    ) -> SarResult<Self> {
        let (ground_range_spacing, azimuth_spacing) = if !is_spacing(range_spacing) {
            log::warn!("No range spacing in metadata, assuming square 1x1 pixels");
            (1.0, 1.0)
        } else {
            let azimuth_spacing = if is_spacing(azimuth_spacing) { azimuth_spacing } else { 1.0 };
            let incidence_known = incidence_angle_deg.is_finite()
                && incidence_angle_deg > 0.0
                && incidence_angle_deg < 90.0;
            if ground_range_product || !incidence_known {
                (range_spacing, azimuth_spacing)
            } else {
                (range_spacing / incidence_angle_deg.to_radians().sin(), azimuth_spacing)
            }
        };

        let azimuth = range as f64 * ground_range_spacing / azimuth_spacing;
        if azimuth < 1.0 {
            let range = ((azimuth_spacing / ground_range_spacing).round() as usize).max(1);
            Self::new(1, range)
        } else {
            Self::new(azimuth.round() as usize, range)
        }
    }

    /// Margins (azimuth, range) before the output pixel
    pub fn leading(&self) -> (usize, usize) {
        ((self.azimuth - 1) / 2, (self.range - 1) / 2)
    }

    /// Margins (azimuth, range) after the output pixel
    pub fn trailing(&self) -> (usize, usize) {
        (self.azimuth / 2, self.range / 2)
    }

    /// Input window needed to estimate coherence over `rect`
    pub fn extend(&self, rect: &Rect) -> Rect {
        let (lead_az, lead_rg) = self.leading();
        let (trail_az, trail_rg) = self.trailing();
        rect.extend(lead_rg, trail_rg, lead_az, trail_az)
    }
}

fn is_spacing(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Windowed complex coherence estimator
#[derive(Debug, Clone, Copy)]
pub struct CoherenceEstimator {
    window: CoherenceWindow,
}

impl CoherenceEstimator {
    /// Create a new coherence estimator
    pub fn new(window: CoherenceWindow) -> Self {
        Self { window }
    }

    pub fn window(&self) -> CoherenceWindow {
        self.window
    }

    /// Complex coherence of two border-extended tiles
    ///
    /// `master` and `slave` cover the output tile grown by the window margins.
    /// Rows outside `valid_rows` (inclusive, extended-tile coordinates) are
    /// dropped from the cross product but still count towards the powers.
    /// Output pixels with no power are 0.
    pub fn estimate(
        &self,
        master: &ComplexTile,
        slave: &ComplexTile,
        valid_rows: Option<(i64, i64)>,
    ) -> SarResult<ComplexTile> {
        let (rows, cols) = master.dim();
        if slave.dim() != (rows, cols) {
            return Err(SarError::Processing(format!(
                "Master tile {:?} and slave tile {:?} differ in shape",
                master.dim(),
                slave.dim()
            )));
        }
        if rows < self.window.azimuth || cols < self.window.range {
            return Err(SarError::Processing(format!(
                "Tile {:?} is smaller than the {}x{} coherence window",
                master.dim(),
                self.window.azimuth,
                self.window.range
            )));
        }

        let mut cross = Zip::from(master)
            .and(slave)
            .map_collect(|m, s| m * s.conj());
        if let Some((first, last)) = valid_rows {
            for (r, mut row) in cross.rows_mut().into_iter().enumerate() {
                let r = r as i64;
                if r < first || r > last {
                    row.fill(SarComplex::zero());
                }
            }
        }
        let master_power = master.mapv(|m| m.norm_sqr());
        let slave_power = slave.mapv(|s| s.norm_sqr());

        let cross_sum = moving_sum(&cross, self.window);
        let master_sum = moving_sum(&master_power, self.window);
        let slave_sum = moving_sum(&slave_power, self.window);

        Ok(Zip::from(&cross_sum)
            .and(&master_sum)
            .and(&slave_sum)
            .map_collect(|&sum, &pm, &ps| {
                let product = pm * ps;
                if product <= 0.0 {
                    return SarComplex::zero();
                }
                let coherence = sum / product.sqrt();
                // running sums can drift a few ulp past the Cauchy-Schwarz bound
                let magnitude = coherence.norm();
                if magnitude > 1.0 {
                    coherence / magnitude
                } else {
                    coherence
                }
            }))
    }
}

/// Box sums of size `window` over every fully covered output position
///
/// Range sums are taken per row, azimuth sums run down each column adding
/// the entering row and subtracting the leaving one.
fn moving_sum<T>(input: &Array2<T>, window: CoherenceWindow) -> Array2<T>
where
    T: Copy + Zero + Add<Output = T> + Sub<Output = T>,
{
    let (rows, cols) = input.dim();
    let out_rows = rows + 1 - window.azimuth;
    let out_cols = cols + 1 - window.range;

    let mut range_sums = Array2::<T>::zeros((rows, out_cols));
    for r in 0..rows {
        for c in 0..out_cols {
            let mut acc = T::zero();
            for k in c..c + window.range {
                acc = acc + input[[r, k]];
            }
            range_sums[[r, c]] = acc;
        }
    }

    let mut sums = Array2::<T>::zeros((out_rows, out_cols));
    for c in 0..out_cols {
        let mut acc = T::zero();
        for r in 0..window.azimuth {
            acc = acc + range_sums[[r, c]];
        }
        sums[[0, c]] = acc;
        for r in 1..out_rows {
            acc = acc + range_sums[[r + window.azimuth - 1, c]] - range_sums[[r - 1, c]];
            sums[[r, c]] = acc;
        }
    }
    sums
}

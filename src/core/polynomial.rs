use crate::types::{SarError, SarResult};
use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Highest degree accepted for the flat-earth surface
pub const MAX_POLYNOMIAL_DEGREE: usize = 8;

const SINGULAR_PIVOT_RATIO: f64 = 1e-12;

/// Number of coefficients of a full 2D polynomial of the given degree
pub fn num_coefficients(degree: usize) -> usize {
    (degree + 1) * (degree + 2) / 2
}

/// Inverse of [`num_coefficients`]
pub fn degree_from_coefficients(count: usize) -> SarResult<usize> {
    (0..=MAX_POLYNOMIAL_DEGREE)
        .find(|&d| num_coefficients(d) == count)
        .ok_or_else(|| {
            SarError::Numeric(format!("{} is not a valid 2D polynomial coefficient count", count))
        })
}

/// Map `value` from [min, max] onto [-2, 2]
pub fn normalize(value: f64, min: f64, max: f64) -> f64 {
    let span = max - min;
    if span <= 0.0 {
        return 0.0;
    }
    (value - 0.5 * (min + max)) / (0.25 * span)
}

/// Line/pixel extent a polynomial is normalized over (inclusive bounds)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationWindow {
    pub min_line: f64,
    pub max_line: f64,
    pub min_pixel: f64,
    pub max_pixel: f64,
}

impl NormalizationWindow {
    pub fn new(lines: (usize, usize), pixels: (usize, usize)) -> Self {
        Self {
            min_line: lines.0 as f64,
            max_line: lines.1 as f64,
            min_pixel: pixels.0 as f64,
            max_pixel: pixels.1 as f64,
        }
    }

    pub fn line(&self, line: f64) -> f64 {
        normalize(line, self.min_line, self.max_line)
    }

    pub fn pixel(&self, pixel: f64) -> f64 {
        normalize(pixel, self.min_pixel, self.max_pixel)
    }
}

/// 2D power-basis polynomial approximating the flat-earth phase
///
/// Coefficients are ordered by total degree `j`, then by pixel exponent `k`:
/// term `(j, k)` multiplies `line^(j-k) * pixel^k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatEarthPolynomial {
    degree: usize,
    coefficients: Vec<f64>,
    window: NormalizationWindow,
}

impl FlatEarthPolynomial {
    pub fn new(degree: usize, coefficients: Vec<f64>, window: NormalizationWindow) -> SarResult<Self> {
        if coefficients.len() != num_coefficients(degree) {
            return Err(SarError::Numeric(format!(
                "Degree {} polynomial needs {} coefficients, got {}",
                degree,
                num_coefficients(degree),
                coefficients.len()
            )));
        }
        Ok(Self {
            degree,
            coefficients,
            window,
        })
    }

    /// Least-squares fit through `(line, pixel, value)` samples
    ///
    /// Solves the normal equations with a Cholesky factorization; a singular
    /// system is reported as a numeric error, no lower degree is tried.
    pub fn fit(
        degree: usize,
        window: NormalizationWindow,
        samples: &[(f64, f64, f64)],
    ) -> SarResult<Self> {
        if degree == 0 || degree > MAX_POLYNOMIAL_DEGREE {
            return Err(SarError::Configuration(format!(
                "Polynomial degree must be in 1..={}, got {}",
                MAX_POLYNOMIAL_DEGREE, degree
            )));
        }
        let n_coeffs = num_coefficients(degree);
        if samples.len() < n_coeffs {
            return Err(SarError::Numeric(format!(
                "{} samples cannot determine {} coefficients",
                samples.len(),
                n_coeffs
            )));
        }

        let rows: Vec<Vec<f64>> = samples
            .iter()
            .map(|&(line, pixel, _)| basis(degree, window.line(line), window.pixel(pixel)))
            .collect();
        let design = DMatrix::from_fn(samples.len(), n_coeffs, |r, c| rows[r][c]);
        let observations = DVector::from_iterator(samples.len(), samples.iter().map(|s| s.2));

        let design_t = design.transpose();
        let normal = &design_t * &design;
        let rhs = &design_t * &observations;

        let singular = || {
            SarError::Numeric(format!(
                "Singular normal matrix for degree {} fit over {} samples",
                degree,
                samples.len()
            ))
        };
        let cholesky = normal.clone().cholesky().ok_or_else(singular)?;

        // A pivot that lost almost all of its column's energy means a rank
        // deficient design that only rounding kept positive.
        let pivots = cholesky.l_dirty().diagonal();
        if (0..n_coeffs).any(|i| pivots[i] * pivots[i] <= SINGULAR_PIVOT_RATIO * normal[(i, i)]) {
            return Err(singular());
        }
        let solution = cholesky.solve(&rhs);

        if solution.iter().any(|c| !c.is_finite()) {
            return Err(SarError::Numeric("Non-finite polynomial coefficients".to_string()));
        }

        Self::new(degree, solution.iter().copied().collect(), window)
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn window(&self) -> &NormalizationWindow {
        &self.window
    }

    /// Evaluate at already normalized coordinates
    pub fn evaluate_normalized(&self, line: f64, pixel: f64) -> f64 {
        basis(self.degree, line, pixel)
            .iter()
            .zip(&self.coefficients)
            .map(|(b, c)| b * c)
            .sum()
    }

    /// Evaluate at an absolute image line/pixel
    pub fn evaluate(&self, line: f64, pixel: f64) -> f64 {
        self.evaluate_normalized(self.window.line(line), self.window.pixel(pixel))
    }

    /// Evaluate on the grid of lines `y0..y0+height` and pixels `x0..x0+width`
    pub fn evaluate_grid(&self, y0: i64, x0: i64, height: usize, width: usize) -> Array2<f64> {
        let line_powers: Vec<Vec<f64>> = (0..height)
            .map(|r| powers(self.window.line((y0 + r as i64) as f64), self.degree))
            .collect();
        let pixel_powers: Vec<Vec<f64>> = (0..width)
            .map(|c| powers(self.window.pixel((x0 + c as i64) as f64), self.degree))
            .collect();

        Array2::from_shape_fn((height, width), |(r, c)| {
            let (lp, pp) = (&line_powers[r], &pixel_powers[c]);
            let mut value = 0.0;
            let mut idx = 0;
            for j in 0..=self.degree {
                for k in 0..=j {
                    value += self.coefficients[idx] * lp[j - k] * pp[k];
                    idx += 1;
                }
            }
            value
        })
    }
}

fn powers(x: f64, degree: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(degree + 1);
    let mut p = 1.0;
    for _ in 0..=degree {
        out.push(p);
        p *= x;
    }
    out
}

fn basis(degree: usize, line: f64, pixel: f64) -> Vec<f64> {
    let lp = powers(line, degree);
    let pp = powers(pixel, degree);
    let mut row = Vec::with_capacity(num_coefficients(degree));
    for j in 0..=degree {
        for k in 0..=j {
            row.push(lp[j - k] * pp[k]);
        }
    }
    row
}

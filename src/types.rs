use ndarray::Array2;
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Speed of light in vacuum (m/s)
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Complex-valued SAR sample (I + jQ) used by all interferometric arithmetic
pub type SarComplex = Complex<f64>;

/// 2D complex tile (azimuth x range)
pub type ComplexTile = Array2<SarComplex>;

/// 2D real tile as stored in a raster band (azimuth x range)
pub type RealTile = Array2<f32>;

/// Polarization modes for Sentinel-1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Polarization {
    VV,
    VH,
    HV,
    HH,
}

impl std::fmt::Display for Polarization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Polarization::VV => write!(f, "VV"),
            Polarization::VH => write!(f, "VH"),
            Polarization::HV => write!(f, "HV"),
            Polarization::HH => write!(f, "HH"),
        }
    }
}

impl FromStr for Polarization {
    type Err = SarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VV" => Ok(Polarization::VV),
            "VH" => Ok(Polarization::VH),
            "HV" => Ok(Polarization::HV),
            "HH" => Ok(Polarization::HH),
            other => Err(SarError::Metadata(format!("Unknown polarization: {}", other))),
        }
    }
}

/// Orbit state vector
///
/// Time is in seconds relative to midnight of the acquisition day, so that
/// every time belonging to one acquisition lives on the same axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    pub time: f64,
    pub position: [f64; 3], // [x, y, z] in meters (ECEF)
}

/// Rectangular pixel window
///
/// `x`/`y` are signed because border-extended windows may start before the
/// first pixel of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i64,
    pub y: i64,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: i64, y: i64, width: usize, height: usize) -> Self {
        Self { x, y, width, height }
    }

    /// Exclusive right edge
    pub fn right(&self) -> i64 {
        self.x + self.width as i64
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> i64 {
        self.y + self.height as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    /// Overlap of two windows, `None` when they do not touch
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0, y0, (x1 - x0) as usize, (y1 - y0) as usize))
    }

    /// Grow the window by the given margins on each side
    pub fn extend(&self, left: usize, right: usize, top: usize, bottom: usize) -> Rect {
        Rect::new(
            self.x - left as i64,
            self.y - top as i64,
            self.width + left + right,
            self.height + top + bottom,
        )
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[x={}, y={}, {}x{}]", self.x, self.y, self.width, self.height)
    }
}

/// Error types for interferometric processing
#[derive(Debug, thiserror::Error)]
pub enum SarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Numeric error: {0}")]
    Numeric(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),
}

/// Result type for SAR operations
pub type SarResult<T> = Result<T, SarError>;

use crate::io::metadata::{StackMetadata, SubSwathInfo};
use crate::types::{Rect, SarError, SarResult, SPEED_OF_LIGHT};

/// Which polynomial a segment of the image is corrected with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolynomialScope {
    Scene,
    Burst { subswath: usize, burst: usize },
}

impl std::fmt::Display for PolynomialScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolynomialScope::Scene => write!(f, "scene"),
            PolynomialScope::Burst { subswath, burst } => write!(f, "s{}_b{}", subswath, burst),
        }
    }
}

/// One TOPSAR burst of a split sub-swath
#[derive(Debug, Clone, PartialEq)]
pub struct Burst {
    pub subswath: usize,
    pub index: usize,
    pub first_line_time: f64,
    pub last_line_time: f64,
    pub azimuth_time_interval: f64,
    pub range_pixel_spacing: f64,
    pub slr_time_to_first_pixel: f64,
    pub slr_time_to_last_pixel: f64,
    /// Inclusive line range of the burst in the stack raster
    pub lines: (usize, usize),
    /// Inclusive pixel range
    pub pixels: (usize, usize),
}

impl Burst {
    /// Bursts of one sub-swath, stacked one after another along azimuth
    pub fn from_subswath(subswath: usize, info: &SubSwathInfo) -> SarResult<Vec<Burst>> {
        if info.lines_per_burst == 0 || info.samples_per_burst == 0 {
            return Err(SarError::Configuration(format!(
                "Sub-swath {} has empty bursts ({} lines x {} samples)",
                info.name, info.lines_per_burst, info.samples_per_burst
            )));
        }

        Ok(info
            .bursts
            .iter()
            .enumerate()
            .map(|(index, timing)| {
                let min_line = index * info.lines_per_burst;
                Burst {
                    subswath,
                    index,
                    first_line_time: timing.first_line_time,
                    last_line_time: timing.last_line_time,
                    azimuth_time_interval: info.azimuth_time_interval,
                    range_pixel_spacing: info.range_pixel_spacing,
                    slr_time_to_first_pixel: info.slr_time_to_first_pixel,
                    slr_time_to_last_pixel: info.slr_time_to_last_pixel,
                    lines: (min_line, min_line + info.lines_per_burst - 1),
                    pixels: (0, info.samples_per_burst - 1),
                }
            })
            .collect())
    }

    pub fn scope(&self) -> PolynomialScope {
        PolynomialScope::Burst {
            subswath: self.subswath,
            burst: self.index,
        }
    }

    pub fn contains_line(&self, line: i64) -> bool {
        line >= self.lines.0 as i64 && line <= self.lines.1 as i64
    }

    /// Azimuth time of a stack line inside this burst
    pub fn azimuth_time(&self, line: f64) -> f64 {
        self.first_line_time + (line - self.lines.0 as f64) * self.azimuth_time_interval
    }

    /// One-way slant range time of a pixel
    pub fn range_time(&self, pixel: f64) -> f64 {
        self.slr_time_to_first_pixel + pixel * self.range_pixel_spacing / SPEED_OF_LIGHT
    }
}

/// Part of a requested rectangle handled with a single polynomial
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub rect: Rect,
    pub scope: PolynomialScope,
    /// Inclusive line range used for normalization and burst clipping
    pub lines: (usize, usize),
    /// Inclusive pixel range used for normalization
    pub pixels: (usize, usize),
}

/// How the image is partitioned for flat-earth correction
#[derive(Debug, Clone, PartialEq)]
pub enum Segmentation {
    WholeScene { width: usize, height: usize },
    BurstSegmented { width: usize, height: usize, bursts: Vec<Burst> },
}

impl Segmentation {
    /// Burst segmentation when the master carries TOPSAR burst timing
    pub fn from_metadata(metadata: &StackMetadata) -> SarResult<Self> {
        let (width, height) = (metadata.width, metadata.height);
        if width == 0 || height == 0 {
            return Err(SarError::Configuration(format!(
                "Empty stack raster {}x{}",
                width, height
            )));
        }

        let swaths: Vec<&SubSwathInfo> = metadata
            .master
            .sub_swaths
            .iter()
            .filter(|sw| !sw.bursts.is_empty())
            .collect();

        match swaths.as_slice() {
            [] => Ok(Segmentation::WholeScene { width, height }),
            [swath] => {
                let bursts = Burst::from_subswath(0, swath)?;
                let covered = bursts.len() * swath.lines_per_burst;
                if covered != height {
                    return Err(SarError::Configuration(format!(
                        "{} bursts of {} lines cover {} lines, raster has {}",
                        bursts.len(),
                        swath.lines_per_burst,
                        covered,
                        height
                    )));
                }
                log::info!("TOPSAR product: {} bursts in sub-swath {}", bursts.len(), swath.name);
                Ok(Segmentation::BurstSegmented {
                    width,
                    height,
                    bursts,
                })
            }
            _ => Err(SarError::Configuration(format!(
                "Burst processing expects a single split sub-swath, found {}",
                swaths.len()
            ))),
        }
    }

    pub fn raster_size(&self) -> (usize, usize) {
        match self {
            Segmentation::WholeScene { width, height } => (*width, *height),
            Segmentation::BurstSegmented { width, height, .. } => (*width, *height),
        }
    }

    pub fn is_burst_segmented(&self) -> bool {
        matches!(self, Segmentation::BurstSegmented { .. })
    }

    pub fn bursts(&self) -> &[Burst] {
        match self {
            Segmentation::WholeScene { .. } => &[],
            Segmentation::BurstSegmented { bursts, .. } => bursts,
        }
    }

    pub fn burst(&self, scope: PolynomialScope) -> Option<&Burst> {
        match scope {
            PolynomialScope::Scene => None,
            PolynomialScope::Burst { subswath, burst } => self
                .bursts()
                .iter()
                .find(|b| b.subswath == subswath && b.index == burst),
        }
    }

    /// Every polynomial scope a full run can touch
    pub fn scopes(&self) -> Vec<PolynomialScope> {
        match self {
            Segmentation::WholeScene { .. } => vec![PolynomialScope::Scene],
            Segmentation::BurstSegmented { bursts, .. } => bursts.iter().map(Burst::scope).collect(),
        }
    }

    /// Split a requested rectangle into disjoint per-polynomial segments
    ///
    /// Whole-scene products yield the rectangle itself. Burst products yield
    /// one segment per burst whose line range intersects the rectangle.
    pub fn partition(&self, rect: Rect) -> Vec<Segment> {
        match self {
            Segmentation::WholeScene { width, height } => vec![Segment {
                rect,
                scope: PolynomialScope::Scene,
                lines: (0, height.saturating_sub(1)),
                pixels: (0, width.saturating_sub(1)),
            }],
            Segmentation::BurstSegmented { bursts, .. } => {
                let ty0 = rect.y;
                let ty_max = rect.bottom();
                bursts
                    .iter()
                    .filter_map(|burst| {
                        let first = burst.lines.0 as i64;
                        let last = burst.lines.1 as i64;
                        if ty_max <= first || ty0 > last {
                            return None;
                        }
                        let nty0 = ty0.max(first);
                        let nty_max = ty_max.min(last + 1);
                        Some(Segment {
                            rect: Rect::new(rect.x, nty0, rect.width, (nty_max - nty0) as usize),
                            scope: burst.scope(),
                            lines: burst.lines,
                            pixels: burst.pixels,
                        })
                    })
                    .collect()
            }
        }
    }
}

use crate::core::acquisition::{AcquisitionPair, OutputKind, StackPairs};
use crate::core::coherence::{CoherenceEstimator, CoherenceWindow};
use crate::core::flat_earth::{FlatEarthCache, FlatEarthEstimator};
use crate::core::orbit::MAX_ORBIT_DEGREE;
use crate::core::polynomial::{num_coefficients, MAX_POLYNOMIAL_DEGREE};
use crate::core::segmentation::{Segment, Segmentation};
use crate::io::metadata::StackMetadata;
use crate::io::raster::{BorderExtension, ProductRegistry, RasterSink, RasterSource};
use crate::types::{ComplexTile, Rect, RealTile, SarComplex, SarError, SarResult};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Product generated by the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProductKind {
    /// Flattened interferogram, optionally with coherence
    #[default]
    Interferogram,
    /// Coherence magnitude, with coherence phase when flattening
    Coherence,
}

/// Configuration for interferogram formation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterferogramConfig {
    pub product: ProductKind,
    pub coh_win_az: usize,
    pub coh_win_rg: usize,
    pub subtract_flat_earth_phase: bool,
    pub srp_polynomial_degree: usize,
    pub srp_number_points: usize,
    pub orbit_degree: usize,
    pub include_coherence: bool,
    pub output_intensity_phase: bool,
    pub output_flat_earth_phase: bool,
    pub square_pixel: bool,
}

impl Default for InterferogramConfig {
    fn default() -> Self {
        Self {
            product: ProductKind::Interferogram,
            coh_win_az: 10,                  // Azimuth lines
            coh_win_rg: 10,                  // Range pixels
            subtract_flat_earth_phase: true,
            srp_polynomial_degree: 5,        // Flat-earth surface degree
            srp_number_points: 501,          // Orbit samples per fit
            orbit_degree: 3,                 // Orbit interpolation degree
            include_coherence: true,
            output_intensity_phase: true,
            output_flat_earth_phase: false,  // Debug band
            square_pixel: false,             // Derive azimuth window from spacing
        }
    }
}

impl InterferogramConfig {
    /// Defaults for the coherence-only product
    ///
    /// Unlike the interferogram product, coherence is estimated without
    /// flat-earth removal unless asked for.
    pub fn coherence() -> Self {
        Self {
            product: ProductKind::Coherence,
            subtract_flat_earth_phase: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> SarResult<()> {
        if self.coh_win_az == 0 || self.coh_win_rg == 0 {
            return Err(SarError::Configuration(format!(
                "Coherence window must be at least 1x1, got {}x{}",
                self.coh_win_az, self.coh_win_rg
            )));
        }
        if self.subtract_flat_earth_phase {
            if !(1..=MAX_POLYNOMIAL_DEGREE).contains(&self.srp_polynomial_degree) {
                return Err(SarError::Configuration(format!(
                    "Flat-earth polynomial degree must be in 1..={}, got {}",
                    MAX_POLYNOMIAL_DEGREE, self.srp_polynomial_degree
                )));
            }
            if self.srp_number_points < num_coefficients(self.srp_polynomial_degree) {
                return Err(SarError::Configuration(format!(
                    "{} flat-earth points cannot fit a degree {} polynomial",
                    self.srp_number_points, self.srp_polynomial_degree
                )));
            }
            if !(1..=MAX_ORBIT_DEGREE).contains(&self.orbit_degree) {
                return Err(SarError::Configuration(format!(
                    "Orbit degree must be in 1..={}, got {}",
                    MAX_ORBIT_DEGREE, self.orbit_degree
                )));
            }
        }
        Ok(())
    }

    /// Output bands written for every pair
    pub fn output_kinds(&self) -> Vec<OutputKind> {
        let mut kinds = Vec::new();
        match self.product {
            ProductKind::Interferogram => {
                kinds.push(OutputKind::InterferogramReal);
                kinds.push(OutputKind::InterferogramImaginary);
                if self.output_intensity_phase {
                    kinds.push(OutputKind::Intensity);
                    kinds.push(OutputKind::Phase);
                }
                if self.include_coherence {
                    kinds.push(OutputKind::Coherence);
                }
                if self.subtract_flat_earth_phase && self.output_flat_earth_phase {
                    kinds.push(OutputKind::FlatEarthPhase);
                }
            }
            ProductKind::Coherence => {
                kinds.push(OutputKind::Coherence);
                if self.subtract_flat_earth_phase {
                    kinds.push(OutputKind::CoherencePhase);
                }
            }
        }
        kinds
    }
}

/// Step of the per-tile pipeline, reported with tile failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStage {
    Fetch,
    EstimateFlatEarth,
    Correct,
    Combine,
    Cohere,
    Write,
}

impl std::fmt::Display for TileStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileStage::Fetch => write!(f, "fetch"),
            TileStage::EstimateFlatEarth => write!(f, "flat-earth estimation"),
            TileStage::Correct => write!(f, "phase correction"),
            TileStage::Combine => write!(f, "interferogram formation"),
            TileStage::Cohere => write!(f, "coherence estimation"),
            TileStage::Write => write!(f, "write"),
        }
    }
}

/// Cooperative cancellation shared with tile workers
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a full-raster run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingSummary {
    pub tiles_total: usize,
    pub tiles_written: usize,
    pub cancelled: bool,
}

/// Tiles of `tile_width` x `tile_height` covering a raster, row by row
pub fn tile_grid(width: usize, height: usize, tile_width: usize, tile_height: usize) -> Vec<Rect> {
    let mut tiles = Vec::new();
    if tile_width == 0 || tile_height == 0 {
        return tiles;
    }
    for y in (0..height).step_by(tile_height) {
        for x in (0..width).step_by(tile_width) {
            tiles.push(Rect::new(
                x as i64,
                y as i64,
                tile_width.min(width - x),
                tile_height.min(height - y),
            ));
        }
    }
    tiles
}

/// Interferogram / coherence processor for a co-registered stack
pub struct InterferogramProcessor {
    config: InterferogramConfig,
    pairs: StackPairs,
    segmentation: Arc<Segmentation>,
    coherence: CoherenceEstimator,
    flat_earth: Option<FlatEarthCache>,
    no_data_value: f64,
}

impl InterferogramProcessor {
    /// Create a new processor for the stack described by `metadata`
    ///
    /// Pairs acquisitions found in `band_names`; no flat-earth work happens
    /// until [`initialize`](Self::initialize) or the first tile.
    pub fn new(config: InterferogramConfig, metadata: &StackMetadata, band_names: &[String]) -> SarResult<Self> {
        config.validate()?;

        let window = if config.square_pixel {
            let master = &metadata.master;
            CoherenceWindow::square_pixel(
                config.coh_win_rg,
                master.range_spacing,
                master.azimuth_spacing,
                master.incidence_angle,
                master.srgr,
            )?
        } else {
            CoherenceWindow::new(config.coh_win_az, config.coh_win_rg)?
        };

        let pairs = StackPairs::build(metadata, band_names, &config)?;
        let segmentation = Arc::new(Segmentation::from_metadata(metadata)?);

        let flat_earth = config.subtract_flat_earth_phase.then(|| {
            let estimator = FlatEarthEstimator::new(
                config.srp_polynomial_degree,
                config.srp_number_points,
                config.orbit_degree,
                metadata.bistatic,
            );
            FlatEarthCache::new(estimator, Arc::clone(&segmentation))
        });

        log::info!(
            "Interferogram processor: {:?} product, {} pair(s), coherence window {}x{}, flat-earth {}",
            config.product,
            pairs.pairs().len(),
            window.azimuth,
            window.range,
            if config.subtract_flat_earth_phase { "subtracted" } else { "kept" }
        );

        Ok(Self {
            config,
            pairs,
            segmentation,
            coherence: CoherenceEstimator::new(window),
            flat_earth,
            no_data_value: metadata.no_data_value,
        })
    }

    pub fn config(&self) -> &InterferogramConfig {
        &self.config
    }

    pub fn pairs(&self) -> &[AcquisitionPair] {
        self.pairs.pairs()
    }

    pub fn window(&self) -> CoherenceWindow {
        self.coherence.window()
    }

    pub fn segmentation(&self) -> &Segmentation {
        &self.segmentation
    }

    pub fn flat_earth(&self) -> Option<&FlatEarthCache> {
        self.flat_earth.as_ref()
    }

    /// Allocate the output bands of every pair
    pub fn register_outputs<R: ProductRegistry + ?Sized>(&self, registry: &mut R) -> SarResult<()> {
        self.pairs.register_outputs(registry, self.no_data_value)
    }

    /// Estimate every flat-earth polynomial before tiles are requested
    pub fn initialize(&self) -> SarResult<()> {
        match &self.flat_earth {
            Some(cache) => cache.prepare(self.pairs.pairs()),
            None => Ok(()),
        }
    }

    /// Compute and write all output bands over `rect`
    pub fn compute_tile<S, W>(&self, rect: Rect, source: &S, sink: &W) -> SarResult<()>
    where
        S: RasterSource + ?Sized,
        W: RasterSink + ?Sized,
    {
        for segment in self.segmentation.partition(rect) {
            for pair in self.pairs.pairs() {
                self.compute_segment(&segment, pair, source, sink)?;
            }
        }
        Ok(())
    }

    /// Run over the whole raster in tiles, stopping early on cancellation
    pub fn process<S, W>(
        &self,
        source: &S,
        sink: &W,
        tile_size: (usize, usize),
        cancel: &CancelFlag,
    ) -> SarResult<ProcessingSummary>
    where
        S: RasterSource + ?Sized,
        W: RasterSink + ?Sized,
    {
        if tile_size.0 == 0 || tile_size.1 == 0 {
            return Err(SarError::Configuration(format!(
                "Tile size must be at least 1x1, got {}x{}",
                tile_size.0, tile_size.1
            )));
        }
        let (width, height) = self.segmentation.raster_size();
        let tiles = tile_grid(width, height, tile_size.0, tile_size.1);
        let total = tiles.len();
        let written = AtomicUsize::new(0);

        log::info!(
            "Processing {}x{} raster in {} tile(s) of {}x{}",
            width,
            height,
            total,
            tile_size.0,
            tile_size.1
        );

        let run = |rect: &Rect| -> SarResult<()> {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.compute_tile(*rect, source, sink)?;
            let done = written.fetch_add(1, Ordering::Relaxed) + 1;
            if total >= 10 && done % (total / 10) == 0 {
                log::info!("Interferogram progress: {}%", done * 100 / total);
            }
            Ok(())
        };

        #[cfg(feature = "parallel")]
        tiles.par_iter().try_for_each(run)?;
        #[cfg(not(feature = "parallel"))]
        tiles.iter().try_for_each(run)?;

        let summary = ProcessingSummary {
            tiles_total: total,
            tiles_written: written.load(Ordering::Relaxed),
            cancelled: cancel.is_cancelled(),
        };
        if summary.cancelled {
            log::warn!(
                "Processing cancelled after {}/{} tiles; output is incomplete",
                summary.tiles_written,
                summary.tiles_total
            );
        } else {
            log::info!("Processing completed: {} tiles", summary.tiles_written);
        }
        Ok(summary)
    }

    fn compute_segment<S, W>(&self, segment: &Segment, pair: &AcquisitionPair, source: &S, sink: &W) -> SarResult<()>
    where
        S: RasterSource + ?Sized,
        W: RasterSink + ?Sized,
    {
        let rect = segment.rect;
        let at = |stage: TileStage| {
            move |e: SarError| {
                SarError::Processing(format!(
                    "Tile {} of pair {} failed during {}: {}",
                    rect, pair.name, stage, e
                ))
            }
        };

        // fetch
        let master = read_complex(source, pair, true, rect).map_err(at(TileStage::Fetch))?;
        let slave = read_complex(source, pair, false, rect).map_err(at(TileStage::Fetch))?;
        let no_data = self.no_data_mask(source, pair, rect).map_err(at(TileStage::Fetch))?;

        let extended = if pair.needs_coherence() {
            let ext_rect = self.coherence.window().extend(&rect);
            let m = read_complex(source, pair, true, ext_rect).map_err(at(TileStage::Fetch))?;
            let s = read_complex(source, pair, false, ext_rect).map_err(at(TileStage::Fetch))?;
            Some((ext_rect, m, s))
        } else {
            None
        };

        // flat-earth phase of the segment
        let flat_earth_phase = match &self.flat_earth {
            Some(cache) => {
                let polynomial = cache
                    .get_or_estimate(pair, segment.scope)
                    .map_err(at(TileStage::EstimateFlatEarth))?;
                Some(polynomial.evaluate_grid(rect.y, rect.x, rect.height, rect.width))
            }
            None => None,
        };

        // slave * exp(i*phi)
        let correction = flat_earth_phase
            .as_ref()
            .map(|phase| phase.mapv(|p| SarComplex::from_polar(1.0, p)));
        let corrected_slave = match &correction {
            Some(c) => &slave * c,
            None => slave,
        };

        // master * conj(slave)
        let interferogram = Zip::from(&master)
            .and(&corrected_slave)
            .map_collect(|m, s| m * s.conj());

        // coherence
        let coherence = match extended {
            Some((ext_rect, m, s)) => {
                let valid_rows = self.segmentation.is_burst_segmented().then(|| {
                    (
                        segment.lines.0 as i64 - ext_rect.y,
                        segment.lines.1 as i64 - ext_rect.y,
                    )
                });
                let mut coh = self
                    .coherence
                    .estimate(&m, &s, valid_rows)
                    .map_err(at(TileStage::Cohere))?;
                if let Some(c) = &correction {
                    Zip::from(&mut coh).and(c).for_each(|coh, c| *coh *= c.conj());
                }
                Some(coh)
            }
            None => None,
        };

        // write
        let no_data_value = self.no_data_value as f32;
        for output in &pair.outputs {
            let values: RealTile = match output.kind {
                OutputKind::InterferogramReal => interferogram.mapv(|c| c.re as f32),
                OutputKind::InterferogramImaginary => interferogram.mapv(|c| c.im as f32),
                OutputKind::Intensity => interferogram.mapv(|c| c.norm_sqr() as f32),
                OutputKind::Phase => interferogram.mapv(|c| c.arg() as f32),
                OutputKind::Coherence => coherence_band(&coherence, |c| c.norm())?,
                OutputKind::CoherencePhase => coherence_band(&coherence, |c| c.arg())?,
                OutputKind::FlatEarthPhase => match &flat_earth_phase {
                    Some(phase) => phase.mapv(|p| p as f32),
                    None => Array2::zeros((rect.height, rect.width)),
                },
            };
            let values = Zip::from(&values)
                .and(&no_data)
                .map_collect(|&v, &nd| if nd { no_data_value } else { v });

            sink.write_window(&output.name, rect, &values)
                .map_err(at(TileStage::Write))?;
        }

        log::debug!("Tile {} of pair {} written ({})", rect, pair.name, segment.scope);
        Ok(())
    }

    /// Pixels whose master or slave real sample carries the no-data value
    fn no_data_mask<S>(&self, source: &S, pair: &AcquisitionPair, rect: Rect) -> SarResult<Array2<bool>>
    where
        S: RasterSource + ?Sized,
    {
        let master_nd = source.no_data_value(&pair.master.bands.real)?;
        let slave_nd = source.no_data_value(&pair.slave.bands.real)?;
        let master = source.read_window(&pair.master.bands.real, rect, BorderExtension::Zero)?;
        let slave = source.read_window(&pair.slave.bands.real, rect, BorderExtension::Zero)?;

        Ok(Zip::from(&master)
            .and(&slave)
            .map_collect(|&m, &s| m as f64 == master_nd || s as f64 == slave_nd))
    }
}

fn read_complex<S>(source: &S, pair: &AcquisitionPair, master: bool, rect: Rect) -> SarResult<ComplexTile>
where
    S: RasterSource + ?Sized,
{
    let bands = if master { &pair.master.bands } else { &pair.slave.bands };
    source.read_complex_window(&bands.real, &bands.imaginary, rect, BorderExtension::Zero)
}

fn coherence_band<F>(coherence: &Option<ComplexTile>, value: F) -> SarResult<RealTile>
where
    F: Fn(&SarComplex) -> f64,
{
    coherence
        .as_ref()
        .map(|coh| coh.map(|c| value(c) as f32))
        .ok_or_else(|| SarError::Processing("Coherence band requested without coherence".to_string()))
}

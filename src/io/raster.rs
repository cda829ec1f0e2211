use crate::types::{ComplexTile, Rect, RealTile, SarComplex, SarError, SarResult};
use ndarray::{s, Array2, Zip};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a window reaching past the image edge is filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BorderExtension {
    /// Samples outside the image read as zero
    #[default]
    Zero,
    /// Windows must lie inside the image
    Reject,
}

/// Physical meaning of a band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BandUnit {
    Real,
    Imaginary,
    Intensity,
    Phase,
    Coherence,
}

/// Description of a band allocated in an output product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandSpec {
    pub name: String,
    pub unit: BandUnit,
    pub no_data_value: f64,
}

/// Supplies rectangular windows of band samples
pub trait RasterSource: Sync {
    /// Raster size as (width, height)
    fn raster_size(&self) -> (usize, usize);

    fn band_names(&self) -> Vec<String>;

    fn no_data_value(&self, band: &str) -> SarResult<f64>;

    /// Read `rect` of `band` as a (height, width) array
    fn read_window(&self, band: &str, rect: Rect, border: BorderExtension) -> SarResult<RealTile>;

    /// Read a real/imaginary band pair as one complex window
    fn read_complex_window(
        &self,
        real_band: &str,
        imag_band: &str,
        rect: Rect,
        border: BorderExtension,
    ) -> SarResult<ComplexTile> {
        let re = self.read_window(real_band, rect, border)?;
        let im = self.read_window(imag_band, rect, border)?;
        Ok(Zip::from(&re)
            .and(&im)
            .map_collect(|&re, &im| SarComplex::new(re as f64, im as f64)))
    }
}

/// Accepts writes of rectangular output windows
pub trait RasterSink: Sync {
    fn write_window(&self, band: &str, rect: Rect, data: &RealTile) -> SarResult<()>;
}

/// Allocates output bands of a product
pub trait ProductRegistry {
    fn add_band(&mut self, spec: BandSpec) -> SarResult<()>;
}

struct MemoryBand {
    spec: BandSpec,
    data: RwLock<RealTile>,
}

/// Raster held entirely in memory
///
/// Serves as both input stack and output product. Band data sits behind a
/// per-band lock so that tile workers can write disjoint windows concurrently.
pub struct MemoryRaster {
    width: usize,
    height: usize,
    bands: BTreeMap<String, MemoryBand>,
}

impl MemoryRaster {
    /// Create a new empty raster of the given size
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            bands: BTreeMap::new(),
        }
    }

    /// Add a band with existing sample data
    pub fn insert_band(&mut self, spec: BandSpec, data: RealTile) -> SarResult<()> {
        if data.dim() != (self.height, self.width) {
            return Err(SarError::InvalidFormat(format!(
                "Band {} has shape {:?}, raster is {}x{}",
                spec.name,
                data.dim(),
                self.height,
                self.width
            )));
        }
        if self.bands.contains_key(&spec.name) {
            return Err(SarError::Configuration(format!("Band {} already exists", spec.name)));
        }
        self.bands.insert(
            spec.name.clone(),
            MemoryBand {
                spec,
                data: RwLock::new(data),
            },
        );
        Ok(())
    }

    /// Add a complex image as an `i_`/`q_` band pair
    pub fn insert_complex(
        &mut self,
        real_name: &str,
        imag_name: &str,
        data: &ComplexTile,
        no_data_value: f64,
    ) -> SarResult<()> {
        let re = data.mapv(|c| c.re as f32);
        let im = data.mapv(|c| c.im as f32);
        self.insert_band(
            BandSpec {
                name: real_name.to_string(),
                unit: BandUnit::Real,
                no_data_value,
            },
            re,
        )?;
        self.insert_band(
            BandSpec {
                name: imag_name.to_string(),
                unit: BandUnit::Imaginary,
                no_data_value,
            },
            im,
        )
    }

    pub fn contains_band(&self, name: &str) -> bool {
        self.bands.contains_key(name)
    }

    pub fn band_spec(&self, name: &str) -> Option<&BandSpec> {
        self.bands.get(name).map(|b| &b.spec)
    }

    /// Snapshot of a full band
    pub fn band_data(&self, name: &str) -> SarResult<RealTile> {
        Ok(self.band(name)?.data.read().clone())
    }

    fn band(&self, name: &str) -> SarResult<&MemoryBand> {
        self.bands
            .get(name)
            .ok_or_else(|| SarError::Processing(format!("Unknown band: {}", name)))
    }

    fn image_rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }
}

impl RasterSource for MemoryRaster {
    fn raster_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn band_names(&self) -> Vec<String> {
        self.bands.keys().cloned().collect()
    }

    fn no_data_value(&self, band: &str) -> SarResult<f64> {
        Ok(self.band(band)?.spec.no_data_value)
    }

    fn read_window(&self, band: &str, rect: Rect, border: BorderExtension) -> SarResult<RealTile> {
        let band = self.band(band)?;
        let image = self.image_rect();

        if border == BorderExtension::Reject && !image.contains_rect(&rect) {
            return Err(SarError::Processing(format!(
                "Window {} exceeds raster {}",
                rect, image
            )));
        }

        let mut window = Array2::zeros((rect.height, rect.width));
        if let Some(overlap) = rect.intersect(&image) {
            let data = band.data.read();
            let (sy, sx) = (overlap.y as usize, overlap.x as usize);
            let (dy, dx) = ((overlap.y - rect.y) as usize, (overlap.x - rect.x) as usize);
            window
                .slice_mut(s![dy..dy + overlap.height, dx..dx + overlap.width])
                .assign(&data.slice(s![sy..sy + overlap.height, sx..sx + overlap.width]));
        }
        Ok(window)
    }
}

impl RasterSink for MemoryRaster {
    fn write_window(&self, band: &str, rect: Rect, data: &RealTile) -> SarResult<()> {
        let band = self.band(band)?;
        if !self.image_rect().contains_rect(&rect) || data.dim() != (rect.height, rect.width) {
            return Err(SarError::Processing(format!(
                "Cannot write {:?} samples to window {} of band {}",
                data.dim(),
                rect,
                band.spec.name
            )));
        }
        let (y, x) = (rect.y as usize, rect.x as usize);
        band.data
            .write()
            .slice_mut(s![y..y + rect.height, x..x + rect.width])
            .assign(data);
        Ok(())
    }
}

impl ProductRegistry for MemoryRaster {
    fn add_band(&mut self, spec: BandSpec) -> SarResult<()> {
        log::debug!("Allocating band {} ({:?})", spec.name, spec.unit);
        let data = Array2::zeros((self.height, self.width));
        self.insert_band(spec, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_raster() -> MemoryRaster {
        let mut raster = MemoryRaster::new(4, 3);
        let data = Array2::from_shape_fn((3, 4), |(y, x)| (y * 4 + x) as f32 + 1.0);
        raster
            .insert_band(
                BandSpec {
                    name: "i_VV_mst_03Jan2020".to_string(),
                    unit: BandUnit::Real,
                    no_data_value: 0.0,
                },
                data,
            )
            .unwrap();
        raster
    }

    #[test]
    fn test_zero_border_extension() {
        let raster = ramp_raster();
        let window = raster
            .read_window("i_VV_mst_03Jan2020", Rect::new(-1, -1, 3, 3), BorderExtension::Zero)
            .unwrap();

        assert_eq!(window.dim(), (3, 3));
        assert_eq!(window[[0, 0]], 0.0);
        assert_eq!(window[[0, 2]], 0.0);
        assert_eq!(window[[1, 0]], 0.0);
        assert_eq!(window[[1, 1]], 1.0);
        assert_eq!(window[[2, 2]], 6.0);
    }

    #[test]
    fn test_reject_border() {
        let raster = ramp_raster();
        let result = raster.read_window(
            "i_VV_mst_03Jan2020",
            Rect::new(2, 0, 4, 1),
            BorderExtension::Reject,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_write_window() {
        let mut raster = MemoryRaster::new(4, 4);
        raster
            .add_band(BandSpec {
                name: "coh".to_string(),
                unit: BandUnit::Coherence,
                no_data_value: 0.0,
            })
            .unwrap();

        let tile = Array2::from_elem((2, 2), 0.5f32);
        raster.write_window("coh", Rect::new(2, 1, 2, 2), &tile).unwrap();

        let band = raster.band_data("coh").unwrap();
        assert_eq!(band[[1, 2]], 0.5);
        assert_eq!(band[[2, 3]], 0.5);
        assert_eq!(band[[0, 0]], 0.0);

        assert!(raster.write_window("coh", Rect::new(3, 3, 2, 2), &tile).is_err());
    }

    #[test]
    fn test_complex_pair_round_trip() {
        let mut raster = MemoryRaster::new(2, 2);
        let data = Array2::from_elem((2, 2), SarComplex::new(1.0, -2.0));
        raster.insert_complex("i_a", "q_a", &data, 0.0).unwrap();

        let window = raster
            .read_complex_window("i_a", "q_a", Rect::new(0, 0, 2, 2), BorderExtension::Zero)
            .unwrap();
        assert_eq!(window[[1, 1]], SarComplex::new(1.0, -2.0));
    }
}

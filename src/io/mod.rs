//! Stack metadata and raster access

pub mod metadata;
pub mod raster;

pub use metadata::{AcquisitionMetadata, MetadataParser, StackMetadata, SubSwathInfo};
pub use raster::{BandSpec, BandUnit, BorderExtension, MemoryRaster, ProductRegistry, RasterSink, RasterSource};

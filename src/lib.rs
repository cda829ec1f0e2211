//! sarifg: interferogram and coherence formation for co-registered SAR stacks
//!
//! Pairs master and slave acquisitions of a stack, removes the flat-earth
//! phase predicted from the orbits and writes interferogram, intensity,
//! phase and coherence bands tile by tile.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{ComplexTile, Polarization, Rect, RealTile, SarComplex, SarError, SarResult, StateVector};

pub use io::{MemoryRaster, RasterSink, RasterSource, StackMetadata};
pub use core::{CancelFlag, InterferogramConfig, InterferogramProcessor, ProcessingSummary, ProductKind};

//! Core interferometric processing modules

pub mod acquisition;
pub mod coherence;
pub mod flat_earth;
pub mod geodesy;
pub mod interferogram;
pub mod orbit;
pub mod polynomial;
pub mod segmentation;

// Re-export main types
pub use acquisition::{Acquisition, AcquisitionKey, AcquisitionPair, OutputBand, OutputKind, StackPairs};
pub use coherence::{CoherenceEstimator, CoherenceWindow};
pub use flat_earth::{FlatEarthCache, FlatEarthEstimator, PolynomialKey};
pub use interferogram::{
    CancelFlag, InterferogramConfig, InterferogramProcessor, ProcessingSummary, ProductKind, TileStage,
};
pub use orbit::OrbitTrajectory;
pub use polynomial::{FlatEarthPolynomial, NormalizationWindow};
pub use segmentation::{Burst, PolynomialScope, Segment, Segmentation};

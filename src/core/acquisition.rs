use crate::core::interferogram::InterferogramConfig;
use crate::io::metadata::{AcquisitionMetadata, StackMetadata};
use crate::io::raster::{BandSpec, BandUnit, ProductRegistry};
use crate::types::{Polarization, SarError, SarResult};
use regex::Regex;
use std::sync::Arc;

const MASTER_TAG: &str = "mst";
const SLAVE_TAG: &str = "slv";

/// Composite acquisition identifier: orbit, sub-swath and polarization
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AcquisitionKey {
    pub orbit: u32,
    pub subswath: Option<String>,
    pub polarization: Option<Polarization>,
}

impl std::fmt::Display for AcquisitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.orbit)?;
        if let Some(swath) = &self.subswath {
            write!(f, "_{}", swath)?;
        }
        if let Some(pol) = &self.polarization {
            write!(f, "_{}", pol)?;
        }
        Ok(())
    }
}

/// Names of the real and imaginary bands holding one complex image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexBandPair {
    pub real: String,
    pub imaginary: String,
}

/// One complex image of the stack
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub key: AcquisitionKey,
    /// Date marker as it appears in band names, e.g. `03Jan2020`
    pub date: String,
    pub polarization: Option<Polarization>,
    pub subswath: Option<String>,
    pub radar_wavelength: f64,
    pub bands: ComplexBandPair,
    pub metadata: Arc<AcquisitionMetadata>,
}

/// Kinds of band produced for each pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    InterferogramReal,
    InterferogramImaginary,
    Intensity,
    Phase,
    Coherence,
    CoherencePhase,
    FlatEarthPhase,
}

impl OutputKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            OutputKind::InterferogramReal => "i_ifg",
            OutputKind::InterferogramImaginary => "q_ifg",
            OutputKind::Intensity => "Intensity_ifg",
            OutputKind::Phase => "Phase_ifg",
            OutputKind::Coherence => "coh",
            OutputKind::CoherencePhase => "Phase_coh",
            OutputKind::FlatEarthPhase => "fep",
        }
    }

    pub fn unit(&self) -> BandUnit {
        match self {
            OutputKind::InterferogramReal => BandUnit::Real,
            OutputKind::InterferogramImaginary => BandUnit::Imaginary,
            OutputKind::Intensity => BandUnit::Intensity,
            OutputKind::Phase | OutputKind::CoherencePhase | OutputKind::FlatEarthPhase => BandUnit::Phase,
            OutputKind::Coherence => BandUnit::Coherence,
        }
    }

    pub fn needs_coherence(&self) -> bool {
        matches!(self, OutputKind::Coherence | OutputKind::CoherencePhase)
    }
}

/// Output band allocated for a pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBand {
    pub name: String,
    pub kind: OutputKind,
}

/// Master/slave combination producing one set of output bands
#[derive(Debug, Clone)]
pub struct AcquisitionPair {
    pub name: String,
    pub master: Arc<Acquisition>,
    pub slave: Arc<Acquisition>,
    pub outputs: Vec<OutputBand>,
}

impl AcquisitionPair {
    fn new(master: Arc<Acquisition>, slave: Arc<Acquisition>, kinds: &[OutputKind]) -> Self {
        let mut tag = String::new();
        if let Some(swath) = &master.subswath {
            tag.push('_');
            tag.push_str(swath);
        }
        if let Some(pol) = &master.polarization {
            tag.push('_');
            tag.push_str(&pol.to_string());
        }
        tag.push_str(&format!("_{}_{}", master.date, slave.date));

        let outputs = kinds
            .iter()
            .map(|&kind| OutputBand {
                name: format!("{}{}", kind.prefix(), tag),
                kind,
            })
            .collect();

        Self {
            name: format!("{}_{}", master.key, slave.key),
            master,
            slave,
            outputs,
        }
    }

    pub fn output(&self, kind: OutputKind) -> Option<&OutputBand> {
        self.outputs.iter().find(|o| o.kind == kind)
    }

    pub fn needs_coherence(&self) -> bool {
        self.outputs.iter().any(|o| o.kind.needs_coherence())
    }
}

/// Acquisitions of a stack and the master x slave pairs built from them
#[derive(Debug, Clone)]
pub struct StackPairs {
    masters: Vec<Arc<Acquisition>>,
    slaves: Vec<Arc<Acquisition>>,
    pairs: Vec<AcquisitionPair>,
}

impl StackPairs {
    /// Scan band names and pair every compatible master/slave acquisition
    pub fn build(
        metadata: &StackMetadata,
        band_names: &[String],
        config: &InterferogramConfig,
    ) -> SarResult<Self> {
        if metadata.slaves.is_empty() {
            return Err(SarError::Configuration(
                "Stack has no slave acquisitions".to_string(),
            ));
        }

        let scanner = BandScanner::new(band_names)?;

        let subswaths: Vec<Option<String>> = if metadata.master.sub_swaths.is_empty() {
            vec![None]
        } else {
            metadata.master.sub_swaths.iter().map(|sw| Some(sw.name.clone())).collect()
        };
        let polarizations: Vec<Option<Polarization>> = if metadata.polarizations.is_empty() {
            vec![None]
        } else {
            metadata.polarizations.iter().copied().map(Some).collect()
        };

        let masters = scanner.acquisitions(
            Arc::new(metadata.master.clone()),
            MASTER_TAG,
            &subswaths,
            &polarizations,
        )?;
        let mut slaves = Vec::new();
        for slave in &metadata.slaves {
            slaves.extend(scanner.acquisitions(
                Arc::new(slave.clone()),
                SLAVE_TAG,
                &subswaths,
                &polarizations,
            )?);
        }

        let kinds = config.output_kinds();
        let mut pairs = Vec::new();
        for master in &masters {
            for slave in &slaves {
                if is_compatible(master, slave) {
                    pairs.push(AcquisitionPair::new(Arc::clone(master), Arc::clone(slave), &kinds));
                }
            }
        }

        if pairs.is_empty() {
            return Err(SarError::Configuration(
                "No master/slave combination with matching polarization".to_string(),
            ));
        }

        log::info!(
            "Paired {} master and {} slave acquisition(s) into {} pair(s)",
            masters.len(),
            slaves.len(),
            pairs.len()
        );
        for pair in &pairs {
            log::debug!("Pair {}: {} output band(s)", pair.name, pair.outputs.len());
        }

        Ok(Self {
            masters,
            slaves,
            pairs,
        })
    }

    pub fn masters(&self) -> &[Arc<Acquisition>] {
        &self.masters
    }

    pub fn slaves(&self) -> &[Arc<Acquisition>] {
        &self.slaves
    }

    pub fn pairs(&self) -> &[AcquisitionPair] {
        &self.pairs
    }

    /// Allocate every output band of every pair in the target product
    pub fn register_outputs<R: ProductRegistry + ?Sized>(
        &self,
        registry: &mut R,
        no_data_value: f64,
    ) -> SarResult<()> {
        for pair in &self.pairs {
            for output in &pair.outputs {
                registry.add_band(BandSpec {
                    name: output.name.clone(),
                    unit: output.kind.unit(),
                    no_data_value,
                })?;
            }
        }
        Ok(())
    }
}

fn is_compatible(master: &Acquisition, slave: &Acquisition) -> bool {
    let polarization = master.polarization.is_none() || master.polarization == slave.polarization;
    let subswath = match (&master.subswath, &slave.subswath) {
        (Some(m), Some(s)) => m == s,
        _ => true,
    };
    polarization && subswath
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BandPart {
    Real,
    Imaginary,
}

/// Band names split into real/imaginary parts
struct BandScanner {
    bands: Vec<(BandPart, String)>,
}

impl BandScanner {
    fn new(band_names: &[String]) -> SarResult<Self> {
        let pattern = Regex::new(r"^(?P<part>[iq])_")
            .map_err(|e| SarError::Configuration(format!("Invalid band pattern: {}", e)))?;

        let bands = band_names
            .iter()
            .filter_map(|name| {
                let caps = pattern.captures(name)?;
                let part = match &caps["part"] {
                    "i" => BandPart::Real,
                    _ => BandPart::Imaginary,
                };
                Some((part, name.clone()))
            })
            .collect();
        Ok(Self { bands })
    }

    fn find(&self, part: BandPart, markers: &[String]) -> Option<&String> {
        self.bands
            .iter()
            .filter(|(p, _)| *p == part)
            .map(|(_, name)| name)
            .find(|name| markers.iter().all(|m| name.contains(m.as_str())))
    }

    fn acquisitions(
        &self,
        metadata: Arc<AcquisitionMetadata>,
        tag: &str,
        subswaths: &[Option<String>],
        polarizations: &[Option<Polarization>],
    ) -> SarResult<Vec<Arc<Acquisition>>> {
        let date = metadata.date_tag();
        let mut found = Vec::new();

        for subswath in subswaths {
            for polarization in polarizations {
                let mut markers = vec![tag.to_string(), date.clone()];
                if let Some(swath) = subswath {
                    markers.push(format!("_{}", swath));
                }
                if let Some(pol) = polarization {
                    markers.push(format!("_{}", pol));
                }

                let key = AcquisitionKey {
                    orbit: metadata.abs_orbit,
                    subswath: subswath.clone(),
                    polarization: *polarization,
                };

                match (self.find(BandPart::Real, &markers), self.find(BandPart::Imaginary, &markers)) {
                    (Some(real), Some(imaginary)) => {
                        log::debug!("Acquisition {} ({}): {} / {}", key, tag, real, imaginary);
                        found.push(Arc::new(Acquisition {
                            key,
                            date: date.clone(),
                            polarization: *polarization,
                            subswath: subswath.clone(),
                            radar_wavelength: metadata.radar_wavelength,
                            bands: ComplexBandPair {
                                real: real.clone(),
                                imaginary: imaginary.clone(),
                            },
                            metadata: Arc::clone(&metadata),
                        }));
                    }
                    (None, None) => {
                        log::debug!("No bands for {} ({}) on {}", key, tag, date);
                    }
                    (real, _) => {
                        return Err(SarError::Configuration(format!(
                            "Incomplete complex band pair for {} ({}) on {}: missing {} band",
                            key,
                            tag,
                            date,
                            if real.is_some() { "imaginary" } else { "real" }
                        )));
                    }
                }
            }
        }

        if found.is_empty() {
            return Err(SarError::Configuration(format!(
                "No complex bands found for {} acquisition of {} (orbit {})",
                tag, date, metadata.abs_orbit
            )));
        }
        Ok(found)
    }
}

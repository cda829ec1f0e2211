use crate::types::{Polarization, SarError, SarResult, StateVector, SPEED_OF_LIGHT};
use chrono::{NaiveDate, NaiveDateTime};
use quick_xml::de::from_str;
use serde::Deserialize;
use std::path::Path;

/// Root <stackMetadata> element of a co-registered stack
#[derive(Debug, Deserialize)]
pub struct StackMetadataRoot {
    #[serde(rename = "rasterWidth")]
    pub raster_width: usize,
    #[serde(rename = "rasterHeight")]
    pub raster_height: usize,
    #[serde(rename = "bistatic", default)]
    pub bistatic: bool,
    #[serde(rename = "noDataValue", default)]
    pub no_data_value: f64,
    #[serde(rename = "polarisations", default)]
    pub polarisations: PolarisationList,
    #[serde(rename = "master")]
    pub master: AcquisitionRecord,
    #[serde(rename = "slaves", default)]
    pub slaves: SlaveList,
}

#[derive(Debug, Default, Deserialize)]
pub struct PolarisationList {
    #[serde(rename = "polarisation", default)]
    pub polarisations: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SlaveList {
    #[serde(rename = "slave", default)]
    pub slaves: Vec<AcquisitionRecord>,
}

/// Per-acquisition abstracted metadata
#[derive(Debug, Deserialize)]
pub struct AcquisitionRecord {
    #[serde(rename = "mission", default)]
    pub mission: String,
    #[serde(rename = "absOrbit")]
    pub abs_orbit: u32,
    #[serde(rename = "firstLineTime")]
    pub first_line_time: String,
    #[serde(rename = "lastLineTime")]
    pub last_line_time: String,
    #[serde(rename = "lineTimeInterval")]
    pub line_time_interval: f64,
    #[serde(rename = "radarFrequency")]
    pub radar_frequency: f64, // MHz
    #[serde(rename = "rangeSpacing")]
    pub range_spacing: f64,
    #[serde(rename = "azimuthSpacing")]
    pub azimuth_spacing: f64,
    #[serde(rename = "slantRangeToFirstPixel")]
    pub slant_range_to_first_pixel: f64,
    #[serde(rename = "incidenceNear", default)]
    pub incidence_near: f64,
    #[serde(rename = "incidenceFar", default)]
    pub incidence_far: f64,
    #[serde(rename = "srgrFlag", default)]
    pub srgr_flag: bool,
    #[serde(rename = "centreLat")]
    pub centre_lat: f64,
    #[serde(rename = "centreLon")]
    pub centre_lon: f64,
    #[serde(rename = "orbitStateVectors", default)]
    pub orbit_state_vectors: OrbitVectorList,
    #[serde(rename = "subSwaths", default)]
    pub sub_swaths: SubSwathList,
}

#[derive(Debug, Default, Deserialize)]
pub struct OrbitVectorList {
    #[serde(rename = "orbitVector", default)]
    pub vectors: Vec<OrbitVectorRecord>,
}

#[derive(Debug, Deserialize)]
pub struct OrbitVectorRecord {
    #[serde(rename = "time")]
    pub time: String,
    #[serde(rename = "xPos")]
    pub x_pos: f64,
    #[serde(rename = "yPos")]
    pub y_pos: f64,
    #[serde(rename = "zPos")]
    pub z_pos: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubSwathList {
    #[serde(rename = "subSwath", default)]
    pub sub_swaths: Vec<SubSwathRecord>,
}

#[derive(Debug, Deserialize)]
pub struct SubSwathRecord {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "linesPerBurst")]
    pub lines_per_burst: usize,
    #[serde(rename = "samplesPerBurst")]
    pub samples_per_burst: usize,
    #[serde(rename = "azimuthTimeInterval")]
    pub azimuth_time_interval: f64,
    #[serde(rename = "rangePixelSpacing")]
    pub range_pixel_spacing: f64,
    #[serde(rename = "slrTimeToFirstPixel")]
    pub slr_time_to_first_pixel: f64, // one-way, seconds
    #[serde(rename = "slrTimeToLastPixel")]
    pub slr_time_to_last_pixel: f64,
    #[serde(rename = "bursts", default)]
    pub bursts: BurstTimingList,
}

#[derive(Debug, Default, Deserialize)]
pub struct BurstTimingList {
    #[serde(rename = "burst", default)]
    pub bursts: Vec<BurstTimingRecord>,
}

#[derive(Debug, Deserialize)]
pub struct BurstTimingRecord {
    #[serde(rename = "firstLineTime")]
    pub first_line_time: String,
    #[serde(rename = "lastLineTime")]
    pub last_line_time: String,
}

/// TOPSAR burst timing, times in seconds of the acquisition day
#[derive(Debug, Clone, PartialEq)]
pub struct BurstTiming {
    pub first_line_time: f64,
    pub last_line_time: f64,
}

/// Sub-swath geometry of a TOPSAR split product
#[derive(Debug, Clone, PartialEq)]
pub struct SubSwathInfo {
    pub name: String,                    // IW1, IW2, IW3
    pub lines_per_burst: usize,
    pub samples_per_burst: usize,
    pub azimuth_time_interval: f64,      // seconds
    pub range_pixel_spacing: f64,        // meters
    pub slr_time_to_first_pixel: f64,    // one-way, seconds
    pub slr_time_to_last_pixel: f64,     // one-way, seconds
    pub bursts: Vec<BurstTiming>,
}

/// Geometry and orbit of one acquisition of the stack
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionMetadata {
    pub mission: String,
    pub abs_orbit: u32,
    pub date: NaiveDate,
    pub first_line_time: f64,            // seconds of day
    pub last_line_time: f64,             // seconds of day
    pub azimuth_time_interval: f64,      // seconds
    pub radar_wavelength: f64,           // meters
    pub range_spacing: f64,              // meters
    pub azimuth_spacing: f64,            // meters
    pub slant_range_to_first_pixel: f64, // meters
    pub incidence_angle: f64,            // degrees, mid swath
    pub srgr: bool,
    pub centre_lat: f64,
    pub centre_lon: f64,
    pub state_vectors: Vec<StateVector>,
    pub sub_swaths: Vec<SubSwathInfo>,
}

impl AcquisitionMetadata {
    /// Date marker used in band names, e.g. `03Jan2020`
    pub fn date_tag(&self) -> String {
        self.date.format("%d%b%Y").to_string()
    }

    pub fn scene_centre_azimuth_time(&self) -> f64 {
        0.5 * (self.first_line_time + self.last_line_time)
    }

    /// One-way slant range time to the first pixel
    pub fn range_time_first_pixel(&self) -> f64 {
        self.slant_range_to_first_pixel / SPEED_OF_LIGHT
    }

    pub fn azimuth_time(&self, line: f64) -> f64 {
        self.first_line_time + line * self.azimuth_time_interval
    }

    pub fn range_time(&self, pixel: f64) -> f64 {
        self.range_time_first_pixel() + pixel * self.range_spacing / SPEED_OF_LIGHT
    }
}

/// Metadata of a co-registered master/slave stack
#[derive(Debug, Clone, PartialEq)]
pub struct StackMetadata {
    pub width: usize,
    pub height: usize,
    pub bistatic: bool,
    pub no_data_value: f64,
    pub polarizations: Vec<Polarization>,
    pub master: AcquisitionMetadata,
    pub slaves: Vec<AcquisitionMetadata>,
}

impl StackMetadata {
    /// Read stack metadata from an XML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> SarResult<Self> {
        log::info!("Reading stack metadata: {}", path.as_ref().display());
        let content = std::fs::read_to_string(&path)?;
        MetadataParser::parse_stack(&content)
    }

    pub fn from_xml(xml_content: &str) -> SarResult<Self> {
        MetadataParser::parse_stack(xml_content)
    }
}

/// Stack metadata parser
pub struct MetadataParser;

impl MetadataParser {
    /// Parse the XML document and convert it to stack metadata
    pub fn parse_stack(xml_content: &str) -> SarResult<StackMetadata> {
        let root = from_str::<StackMetadataRoot>(xml_content)
            .map_err(|e| SarError::XmlParsing(format!("Failed to parse stack metadata: {}", e)))?;

        let polarizations = root
            .polarisations
            .polarisations
            .iter()
            .map(|p| p.parse::<Polarization>())
            .collect::<SarResult<Vec<_>>>()?;

        let master = Self::convert_acquisition(&root.master)?;
        let slaves = root
            .slaves
            .slaves
            .iter()
            .map(Self::convert_acquisition)
            .collect::<SarResult<Vec<_>>>()?;

        log::debug!(
            "Stack metadata: {}x{}, master orbit {}, {} slave(s), polarisations {:?}",
            root.raster_width,
            root.raster_height,
            master.abs_orbit,
            slaves.len(),
            polarizations
        );

        Ok(StackMetadata {
            width: root.raster_width,
            height: root.raster_height,
            bistatic: root.bistatic,
            no_data_value: root.no_data_value,
            polarizations,
            master,
            slaves,
        })
    }

    fn convert_acquisition(record: &AcquisitionRecord) -> SarResult<AcquisitionMetadata> {
        let first_line = parse_utc_time(&record.first_line_time)?;
        let date = first_line.date();
        let day_start = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| SarError::Metadata(format!("Invalid acquisition date {}", date)))?;
        let seconds = |text: &str| -> SarResult<f64> {
            seconds_since(day_start, parse_utc_time(text)?)
        };

        if record.radar_frequency <= 0.0 {
            return Err(SarError::Metadata(format!(
                "Invalid radar frequency {} MHz for orbit {}",
                record.radar_frequency, record.abs_orbit
            )));
        }

        let state_vectors = record
            .orbit_state_vectors
            .vectors
            .iter()
            .map(|v| {
                Ok(StateVector {
                    time: seconds(&v.time)?,
                    position: [v.x_pos, v.y_pos, v.z_pos],
                })
            })
            .collect::<SarResult<Vec<_>>>()?;

        let sub_swaths = record
            .sub_swaths
            .sub_swaths
            .iter()
            .map(|sw| {
                let bursts = sw
                    .bursts
                    .bursts
                    .iter()
                    .map(|b| {
                        Ok(BurstTiming {
                            first_line_time: seconds(&b.first_line_time)?,
                            last_line_time: seconds(&b.last_line_time)?,
                        })
                    })
                    .collect::<SarResult<Vec<_>>>()?;
                Ok(SubSwathInfo {
                    name: sw.name.to_ascii_uppercase(),
                    lines_per_burst: sw.lines_per_burst,
                    samples_per_burst: sw.samples_per_burst,
                    azimuth_time_interval: sw.azimuth_time_interval,
                    range_pixel_spacing: sw.range_pixel_spacing,
                    slr_time_to_first_pixel: sw.slr_time_to_first_pixel,
                    slr_time_to_last_pixel: sw.slr_time_to_last_pixel,
                    bursts,
                })
            })
            .collect::<SarResult<Vec<_>>>()?;

        Ok(AcquisitionMetadata {
            mission: record.mission.clone(),
            abs_orbit: record.abs_orbit,
            date,
            first_line_time: seconds(&record.first_line_time)?,
            last_line_time: seconds(&record.last_line_time)?,
            azimuth_time_interval: record.line_time_interval,
            radar_wavelength: SPEED_OF_LIGHT / (record.radar_frequency * 1.0e6),
            range_spacing: record.range_spacing,
            azimuth_spacing: record.azimuth_spacing,
            slant_range_to_first_pixel: record.slant_range_to_first_pixel,
            incidence_angle: 0.5 * (record.incidence_near + record.incidence_far),
            srgr: record.srgr_flag,
            centre_lat: record.centre_lat,
            centre_lon: record.centre_lon,
            state_vectors,
            sub_swaths,
        })
    }
}

/// Parse an ISO-8601 UTC timestamp such as `2020-01-03T17:08:15.674828`
pub fn parse_utc_time(text: &str) -> SarResult<NaiveDateTime> {
    let trimmed = text.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| SarError::Metadata(format!("Invalid UTC time '{}': {}", text, e)))
}

fn seconds_since(reference: NaiveDateTime, time: NaiveDateTime) -> SarResult<f64> {
    time.signed_duration_since(reference)
        .num_nanoseconds()
        .map(|ns| ns as f64 * 1.0e-9)
        .ok_or_else(|| SarError::Metadata(format!("Time {} too far from {}", time, reference)))
}

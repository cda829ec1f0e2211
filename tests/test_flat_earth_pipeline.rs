use approx::assert_abs_diff_eq;
use ndarray::Array2;
use sarifg::core::{CancelFlag, InterferogramConfig, InterferogramProcessor, PolynomialKey, PolynomialScope};
use sarifg::io::{MemoryRaster, StackMetadata};
use sarifg::types::{ComplexTile, SarComplex};
use std::f64::consts::PI;
use tempfile::TempDir;

const RADIUS: f64 = 7_071_000.0;
const OMEGA: f64 = 2.0 * PI / 5940.0;
const WIDTH: usize = 200;
const HEIGHT: usize = 100;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn orbit_xml(day: &str, radius: f64) -> String {
    let mut xml = String::from("<orbitStateVectors>");
    for i in 0..21 {
        let t = i * 10;
        let angle = OMEGA * t as f64;
        xml.push_str(&format!(
            "<orbitVector><time>2020-01-{}T00:{:02}:{:02}.000000</time><xPos>{:.6}</xPos><yPos>0.0</yPos><zPos>{:.6}</zPos></orbitVector>",
            day,
            t / 60,
            t % 60,
            radius * angle.cos(),
            radius * angle.sin()
        ));
    }
    xml.push_str("</orbitStateVectors>");
    xml
}

fn acquisition_xml(orbit: u32, day: &str, radius: f64, sub_swaths: &str) -> String {
    format!(
        r#"<mission>SENTINEL-1A</mission>
    <absOrbit>{orbit}</absOrbit>
    <firstLineTime>2020-01-{day}T00:01:35.000000</firstLineTime>
    <lastLineTime>2020-01-{day}T00:01:35.990000</lastLineTime>
    <lineTimeInterval>0.01</lineTimeInterval>
    <radarFrequency>5405.0</radarFrequency>
    <rangeSpacing>20.0</rangeSpacing>
    <azimuthSpacing>70.0</azimuthSpacing>
    <slantRangeToFirstPixel>900000.0</slantRangeToFirstPixel>
    <incidenceNear>38.0</incidenceNear>
    <incidenceFar>38.0</incidenceFar>
    <centreLat>6.0</centreLat>
    <centreLon>5.0</centreLon>
    {orbits}
    {sub_swaths}"#,
        orbit = orbit,
        day = day,
        orbits = orbit_xml(day, radius),
        sub_swaths = sub_swaths,
    )
}

const BURSTS_XML: &str = r#"<subSwaths>
      <subSwath>
        <name>IW1</name>
        <linesPerBurst>50</linesPerBurst>
        <samplesPerBurst>200</samplesPerBurst>
        <azimuthTimeInterval>0.01</azimuthTimeInterval>
        <rangePixelSpacing>20.0</rangePixelSpacing>
        <slrTimeToFirstPixel>0.0030020768567833684</slrTimeToFirstPixel>
        <slrTimeToLastPixel>0.003015352707772255</slrTimeToLastPixel>
        <bursts>
          <burst><firstLineTime>2020-01-03T00:01:35.000000</firstLineTime><lastLineTime>2020-01-03T00:01:35.490000</lastLineTime></burst>
          <burst><firstLineTime>2020-01-03T00:01:35.500000</firstLineTime><lastLineTime>2020-01-03T00:01:35.990000</lastLineTime></burst>
        </bursts>
      </subSwath>
    </subSwaths>"#;

fn stack_xml(slave_radius: f64, with_bursts: bool) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<stackMetadata>
  <rasterWidth>{}</rasterWidth>
  <rasterHeight>{}</rasterHeight>
  <bistatic>false</bistatic>
  <noDataValue>0</noDataValue>
  <master>
    {}
  </master>
  <slaves>
    <slave>
    {}
    </slave>
  </slaves>
</stackMetadata>"#,
        WIDTH,
        HEIGHT,
        acquisition_xml(100, "03", RADIUS, if with_bursts { BURSTS_XML } else { "" }),
        acquisition_xml(275, "15", slave_radius, ""),
    )
}

fn load_stack(dir: &TempDir, xml: &str) -> StackMetadata {
    let path = dir.path().join("stack.xml");
    std::fs::write(&path, xml).unwrap();
    StackMetadata::from_file(&path).unwrap()
}

fn master_tile() -> ComplexTile {
    Array2::from_shape_fn((HEIGHT, WIDTH), |(r, c)| {
        SarComplex::from_polar(1.0 + 0.01 * c as f64, 0.37 * r as f64 + 0.11 * c as f64)
    })
}

fn names(tag: &str) -> Vec<String> {
    vec![
        format!("i{}_mst_03Jan2020", tag),
        format!("q{}_mst_03Jan2020", tag),
        format!("i{}_slv_15Jan2020", tag),
        format!("q{}_slv_15Jan2020", tag),
    ]
}

#[test]
fn test_metadata_file_drives_processor() {
    init_logging();
    let dir = TempDir::new().expect("Failed to create temp directory");
    let stack = load_stack(&dir, &stack_xml(RADIUS + 50.0, false));

    assert_eq!(stack.width, WIDTH);
    assert_eq!(stack.master.state_vectors.len(), 21);
    assert_abs_diff_eq!(stack.master.first_line_time, 95.0, epsilon = 1e-9);
    assert_abs_diff_eq!(stack.slaves[0].first_line_time, 95.0, epsilon = 1e-9);

    let config = InterferogramConfig {
        square_pixel: true,
        ..InterferogramConfig::default()
    };
    let processor = InterferogramProcessor::new(config, &stack, &names("")).unwrap();
    let window = processor.window();
    assert_eq!((window.azimuth, window.range), (5, 10));
    assert!(!processor.segmentation().is_burst_segmented());
}

#[test]
fn test_flat_earth_phase_removed() {
    init_logging();
    let dir = TempDir::new().expect("Failed to create temp directory");
    let stack = load_stack(&dir, &stack_xml(RADIUS + 50.0, false));
    let band_names = names("");

    let config = InterferogramConfig {
        coh_win_az: 3,
        coh_win_rg: 3,
        output_flat_earth_phase: true,
        ..InterferogramConfig::default()
    };
    let processor = InterferogramProcessor::new(config, &stack, &band_names).unwrap();
    processor.initialize().unwrap();

    let cache = processor.flat_earth().unwrap();
    assert_eq!(cache.len(), 1);
    let pair = &processor.pairs()[0];
    let polynomial = cache
        .get(&PolynomialKey {
            pair: pair.name.clone(),
            scope: PolynomialScope::Scene,
        })
        .unwrap();

    // slave carries exactly the predicted flat-earth phase
    let master = master_tile();
    let slave = Array2::from_shape_fn((HEIGHT, WIDTH), |(r, c)| {
        master[[r, c]] * SarComplex::from_polar(1.0, -polynomial.evaluate(r as f64, c as f64))
    });

    let mut raster = MemoryRaster::new(WIDTH, HEIGHT);
    raster.insert_complex(&band_names[0], &band_names[1], &master, 0.0).unwrap();
    raster.insert_complex(&band_names[2], &band_names[3], &slave, 0.0).unwrap();
    processor.register_outputs(&mut raster).unwrap();

    let summary = processor.process(&raster, &raster, (64, 32), &CancelFlag::new()).unwrap();
    assert_eq!(summary.tiles_total, 16);
    assert_eq!(summary.tiles_written, 16);
    // already estimated during initialization
    assert_eq!(cache.len(), 1);

    let phase = raster.band_data("Phase_ifg_03Jan2020_15Jan2020").unwrap();
    let fep = raster.band_data("fep_03Jan2020_15Jan2020").unwrap();
    for r in (0..HEIGHT).step_by(7) {
        for c in (0..WIDTH).step_by(13) {
            assert_abs_diff_eq!(phase[[r, c]], 0.0, epsilon = 1e-3);
            let expected = polynomial.evaluate(r as f64, c as f64);
            assert_abs_diff_eq!(fep[[r, c]] as f64, expected, epsilon = 1e-6 * expected.abs().max(1.0));
        }
    }
}

#[test]
fn test_burst_polynomials_per_segment() {
    init_logging();
    let dir = TempDir::new().expect("Failed to create temp directory");
    let stack = load_stack(&dir, &stack_xml(RADIUS + 50.0, true));
    let band_names = names("_IW1");

    let config = InterferogramConfig {
        coh_win_az: 3,
        coh_win_rg: 3,
        include_coherence: false,
        output_flat_earth_phase: true,
        ..InterferogramConfig::default()
    };
    let processor = InterferogramProcessor::new(config, &stack, &band_names).unwrap();
    assert!(processor.segmentation().is_burst_segmented());

    let master = master_tile();
    let mut raster = MemoryRaster::new(WIDTH, HEIGHT);
    raster.insert_complex(&band_names[0], &band_names[1], &master, 0.0).unwrap();
    raster.insert_complex(&band_names[2], &band_names[3], &master, 0.0).unwrap();
    processor.register_outputs(&mut raster).unwrap();

    // tiles straddle the burst boundary at line 50; polynomials are estimated lazily
    let summary = processor.process(&raster, &raster, (WIDTH, 30), &CancelFlag::new()).unwrap();
    assert_eq!(summary.tiles_written, 4);

    let cache = processor.flat_earth().unwrap();
    assert_eq!(cache.len(), 2);
    let pair = &processor.pairs()[0];
    let fep = raster.band_data("fep_IW1_03Jan2020_15Jan2020").unwrap();

    for burst in 0..2 {
        let polynomial = cache
            .get(&PolynomialKey {
                pair: pair.name.clone(),
                scope: PolynomialScope::Burst { subswath: 0, burst },
            })
            .unwrap();
        assert_eq!(polynomial.window().min_line, (burst * 50) as f64);

        for r in (burst * 50..burst * 50 + 50).step_by(7) {
            for c in (0..WIDTH).step_by(17) {
                let expected = polynomial.evaluate(r as f64, c as f64);
                assert_abs_diff_eq!(fep[[r, c]] as f64, expected, epsilon = 1e-6 * expected.abs().max(1.0));
            }
        }
    }
}

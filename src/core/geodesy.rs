use nalgebra::Vector3;

/// WGS84 semi-major axis (m)
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 semi-minor axis (m)
pub const WGS84_B: f64 = 6_356_752.314_245;
/// WGS84 first eccentricity squared
pub const WGS84_E2: f64 = 0.006_694_379_990_14;

/// Geodetic latitude/longitude (degrees) and ellipsoid height to ECEF
pub fn latlon_to_ecef(lat: f64, lon: f64, height: f64) -> Vector3<f64> {
    let lat_rad = lat.to_radians();
    let lon_rad = lon.to_radians();

    let n = WGS84_A / (1.0 - WGS84_E2 * lat_rad.sin().powi(2)).sqrt();

    Vector3::new(
        (n + height) * lat_rad.cos() * lon_rad.cos(),
        (n + height) * lat_rad.cos() * lon_rad.sin(),
        (n * (1.0 - WGS84_E2) + height) * lat_rad.sin(),
    )
}

/// ECEF to geodetic (lat, lon in degrees, height in meters), Bowring's method
pub fn ecef_to_latlon(xyz: &Vector3<f64>) -> (f64, f64, f64) {
    let ep2 = (WGS84_A * WGS84_A - WGS84_B * WGS84_B) / (WGS84_B * WGS84_B);
    let p = (xyz.x * xyz.x + xyz.y * xyz.y).sqrt();
    let theta = (xyz.z * WGS84_A).atan2(p * WGS84_B);
    let (sin_t, cos_t) = theta.sin_cos();

    let lat = (xyz.z + ep2 * WGS84_B * sin_t.powi(3)).atan2(p - WGS84_E2 * WGS84_A * cos_t.powi(3));
    let lon = xyz.y.atan2(xyz.x);
    let n = WGS84_A / (1.0 - WGS84_E2 * lat.sin().powi(2)).sqrt();
    let height = p / lat.cos() - n;

    (lat.to_degrees(), lon.to_degrees(), height)
}

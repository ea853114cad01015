//! geo.rs
//! Spherical-earth projection for simulators that only report a local offset.

/// Mean earth radius, metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat_deg: f64,
    pub lon_deg: f64,
}

impl GeoPoint {
    pub const fn new(lat_deg: f64, lon_deg: f64) -> Self {
        Self { lat_deg, lon_deg }
    }
}

/// Point reached travelling `distance_m` from `origin` along the great circle at `bearing_deg`.
pub fn destination(origin: GeoPoint, bearing_deg: f64, distance_m: f64) -> GeoPoint {
    let lat1 = origin.lat_deg.to_radians();
    let lon1 = origin.lon_deg.to_radians();
    let brg = bearing_deg.to_radians();
    let d = distance_m / EARTH_RADIUS_M;

    let lat2 = (lat1.sin() * d.cos() + lat1.cos() * d.sin() * brg.cos()).asin();
    let lon2 = lon1 + (brg.sin() * d.sin() * lat1.cos()).atan2(d.cos() - lat1.sin() * lat2.sin());

    // normalise to -180..180
    let lon2 = (lon2.to_degrees() + 540.0) % 360.0 - 180.0;
    GeoPoint::new(lat2.to_degrees(), lon2)
}

/// Project a north/east offset in metres around `origin`.
pub fn offset(origin: GeoPoint, north_m: f64, east_m: f64) -> GeoPoint {
    let distance = north_m.hypot(east_m);
    if distance == 0.0 {
        return origin;
    }
    let bearing = east_m.atan2(north_m).to_degrees();
    destination(origin, bearing, distance)
}

//! Great-circle distance on a spherical earth.

use crate::Coordinate;

/// Mean earth radius (IUGG), meters.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Haversine distance in meters.
pub fn distance(a: &Coordinate, b: &Coordinate) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let dphi = (b.lat - a.lat).to_radians();
    let dlambda = (b.lng - a.lng).to_radians();
    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.clamp(0.0, 1.0).sqrt().asin()
}

/// Boundary-inclusive radius test.
pub fn within_radius(a: &Coordinate, b: &Coordinate, radius_m: f64) -> bool {
    distance(a, b) <= radius_m
}

/// Point reached from `origin` after `distance_m` along the initial `bearing_deg`.
/// Longitude is normalised into `[-180, 180]`.
pub fn destination(origin: &Coordinate, bearing_deg: f64, distance_m: f64) -> Coordinate {
    let delta = distance_m / EARTH_RADIUS_M;
    let theta = bearing_deg.to_radians();
    let phi1 = origin.lat.to_radians();
    let lambda1 = origin.lng.to_radians();
    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).clamp(-1.0, 1.0).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());
    let mut lng = lambda2.to_degrees();
    while lng > 180.0 {
        lng -= 360.0;
    }
    while lng < -180.0 {
        lng += 360.0;
    }
    Coordinate { lat: phi2.to_degrees().clamp(-90.0, 90.0), lng }
}

/// Coordinates are stored as decimal degrees scaled by 1e7 (E7 integers).
const E7: f64 = 1e7;

/// Mean Earth radius in metres.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn to_e7(degrees: f64) -> i64 {
    (degrees * E7).round() as i64
}

pub fn e7_to_degrees(e7: i64) -> f64 {
    e7 as f64 / E7
}

/// Haversine distance in metres between two E7 points. Membership decisions
/// (geo fences, feed radius) always use this, never a bounding-box
/// approximation.
pub fn haversine_m(lat1_e7: i64, lng1_e7: i64, lat2_e7: i64, lng2_e7: i64) -> f64 {
    let lat1 = e7_to_degrees(lat1_e7).to_radians();
    let lat2 = e7_to_degrees(lat2_e7).to_radians();
    let dlat = (e7_to_degrees(lat2_e7) - e7_to_degrees(lat1_e7)).to_radians();
    let dlng = (e7_to_degrees(lng2_e7) - e7_to_degrees(lng1_e7)).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

/// Squared E7 Euclidean distance, used only to order pin listings by
/// proximity (near pins first); never for membership.
pub fn squared_e7_distance(lat1_e7: i64, lng1_e7: i64, lat2_e7: i64, lng2_e7: i64) -> i64 {
    let dlat = lat1_e7 - lat2_e7;
    let dlng = lng1_e7 - lng2_e7;
    dlat.saturating_mul(dlat).saturating_add(dlng.saturating_mul(dlng))
}

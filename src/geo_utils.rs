//! Geographic utilities: great-circle distance and local planar projection.
//!
//! The resolver works over distances of a few hundred meters at most, so an
//! equirectangular approximation around a local origin is accurate enough for
//! segment projection; haversine is used for absolute distances.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per mile.
pub const METERS_PER_MILE: f64 = 1_609.344;

/// Great-circle distance in meters between two lat/lon pairs.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Project a lat/lon pair onto a local planar (equirectangular) frame centered
/// on `origin_lat`/`origin_lon`. Returns (x, y) in meters. Valid only for
/// short distances from the origin.
pub fn to_local_plane(lat: f64, lon: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    let x = (lon - origin_lon).to_radians() * origin_lat.to_radians().cos() * EARTH_RADIUS_M;
    let y = (lat - origin_lat).to_radians() * EARTH_RADIUS_M;
    (x, y)
}

/// Clamped projection parameter of point `p` onto segment `a`→`b` in the
/// local plane. Returns (t in [0,1], perpendicular distance in meters from
/// `p` to the clamped projection).
pub fn project_onto_segment(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    let ab = (b.0 - a.0, b.1 - a.1);
    let ap = (p.0 - a.0, p.1 - a.1);
    let ab_len_sq = ab.0 * ab.0 + ab.1 * ab.1;

    // Degenerate segment: both endpoints coincide.
    if ab_len_sq <= f64::EPSILON {
        return (0.0, (ap.0 * ap.0 + ap.1 * ap.1).sqrt());
    }

    let t = ((ap.0 * ab.0 + ap.1 * ab.1) / ab_len_sq).clamp(0.0, 1.0);
    let proj = (a.0 + t * ab.0, a.1 + t * ab.1);
    let d = ((p.0 - proj.0).powi(2) + (p.1 - proj.1).powi(2)).sqrt();
    (t, d)
}

/// Convert meters to miles.
pub fn meters_to_miles(meters: f64) -> f64 {
    meters / METERS_PER_MILE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_zero_distance() {
        assert!(haversine_distance(40.0, -100.0, 40.0, -100.0) < 1e-6);
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.2 km.
        let d = haversine_distance(40.0, -100.0, 41.0, -100.0);
        assert!((d - 111_195.0).abs() < 200.0, "got {d}");
    }

    #[test]
    fn test_local_plane_matches_haversine_nearby() {
        let (x, y) = to_local_plane(40.004, -100.001, 40.0, -100.0);
        let planar = (x * x + y * y).sqrt();
        let great_circle = haversine_distance(40.0, -100.0, 40.004, -100.001);
        assert!((planar - great_circle).abs() < 1.0);
    }

    #[test]
    fn test_projection_midpoint() {
        let (t, d) = project_onto_segment((5.0, 1.0), (0.0, 0.0), (10.0, 0.0));
        assert!((t - 0.5).abs() < 1e-9);
        assert!((d - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_projection_clamped_past_ends() {
        let (t, _) = project_onto_segment((-5.0, 0.0), (0.0, 0.0), (10.0, 0.0));
        assert_eq!(t, 0.0);
        let (t, _) = project_onto_segment((15.0, 0.0), (0.0, 0.0), (10.0, 0.0));
        assert_eq!(t, 1.0);
    }

    #[test]
    fn test_projection_degenerate_segment() {
        let (t, d) = project_onto_segment((3.0, 4.0), (0.0, 0.0), (0.0, 0.0));
        assert_eq!(t, 0.0);
        assert!((d - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_meters_to_miles() {
        assert!((meters_to_miles(METERS_PER_MILE) - 1.0).abs() < 1e-12);
    }
}

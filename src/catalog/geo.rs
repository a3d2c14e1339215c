/// Mean Earth radius (IUGG)
const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Great-circle distance in kilometres between two points given in degrees.
pub fn great_circle_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // clamp guards against rounding pushing `a` past 1 for antipodal points
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_distance() {
        assert_eq!(great_circle_km(38.0, 27.0, 38.0, 27.0), 0.0);
    }

    #[test]
    fn test_one_degree_of_latitude() {
        let d = great_circle_km(0.0, 30.0, 1.0, 30.0);
        assert!((d - 111.19).abs() < 0.1, "got {d}");
    }

    #[test]
    fn test_known_city_pair() {
        // Istanbul -> Ankara, roughly 350 km
        let d = great_circle_km(41.0082, 28.9784, 39.9334, 32.8597);
        assert!((340.0..360.0).contains(&d), "got {d}");
    }
}

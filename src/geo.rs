use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// A bare coordinate pair, used for distance queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// A geocoded place: human-readable address plus coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub address: String,
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn coords(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

/// Opaque distance lookup. The default implementation is great-circle;
/// a road-network provider can be swapped in behind the same trait.
pub trait Geocoder: Send + Sync {
    fn distance_km(&self, a: LatLon, b: LatLon) -> f64;
}

/// Haversine great-circle distance.
pub struct GreatCircle;

impl Geocoder for GreatCircle {
    fn distance_km(&self, a: LatLon, b: LatLon) -> f64 {
        let d_lat = (b.lat - a.lat).to_radians();
        let d_lon = (b.lon - a.lon).to_radians();
        let h = (d_lat / 2.0).sin().powi(2)
            + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_to_self() {
        let p = LatLon::new(29.6516, -82.3248);
        assert!(GreatCircle.distance_km(p, p) < 1e-9);
    }

    #[test]
    fn gainesville_to_orlando_is_about_160_km() {
        let gainesville = LatLon::new(29.6516, -82.3248);
        let orlando = LatLon::new(28.5384, -81.3789);
        let d = GreatCircle.distance_km(gainesville, orlando);
        assert!((150.0..170.0).contains(&d), "got {d}");
    }

    #[test]
    fn short_hop_is_under_the_proximity_threshold() {
        // Two points ~2 km apart.
        let a = LatLon::new(29.6516, -82.3248);
        let b = LatLon::new(29.6696, -82.3248);
        let d = GreatCircle.distance_km(a, b);
        assert!((1.5..2.5).contains(&d), "got {d}");
    }

    #[test]
    fn coordinate_validation() {
        assert!(LatLon::new(0.0, 0.0).is_valid());
        assert!(!LatLon::new(91.0, 0.0).is_valid());
        assert!(!LatLon::new(0.0, 181.0).is_valid());
        assert!(!LatLon::new(f64::NAN, 0.0).is_valid());
    }
}

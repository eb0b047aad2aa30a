//! Local tangent-plane projection of GPS fixes.
//!
//! A mowing area spans at most a few hundred metres, so an equirectangular
//! projection around a fixed datum is accurate to well under the GPS error.
//! `x` grows east and `y` grows north, in metres.

use mower_types::Point;
use serde::{Deserialize, Serialize};

const METERS_PER_DEG_LAT: f64 = 111_320.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalFrame {
    pub datum_lat: f64,
    pub datum_lon: f64,
    meters_per_deg_lon: f64,
}

impl LocalFrame {
    pub fn new(datum_lat: f64, datum_lon: f64) -> Self {
        Self {
            datum_lat,
            datum_lon,
            meters_per_deg_lon: METERS_PER_DEG_LAT * datum_lat.to_radians().cos(),
        }
    }

    pub fn to_local(&self, lat: f64, lon: f64) -> Point {
        Point::new(
            (lon - self.datum_lon) * self.meters_per_deg_lon,
            (lat - self.datum_lat) * METERS_PER_DEG_LAT,
        )
    }

    /// Inverse of [`to_local`](Self::to_local); returns `(lat, lon)`.
    pub fn to_geo(&self, p: Point) -> (f64, f64) {
        (
            self.datum_lat + p.y / METERS_PER_DEG_LAT,
            self.datum_lon + p.x / self.meters_per_deg_lon,
        )
    }
}

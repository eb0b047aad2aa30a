//! Planar geometry in the local metric frame (east = +x, north = +y, metres).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A point in the local tangent plane, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance_to(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Bearing from `self` toward `other` in compass degrees
    /// (0 = north, clockwise positive), in `[0, 360)`.
    pub fn bearing_to(&self, other: &Point) -> f64 {
        let east = other.x - self.x;
        let north = other.y - self.y;
        east.atan2(north).to_degrees().rem_euclid(360.0)
    }

    /// Linear interpolation between `self` (t = 0) and `other` (t = 1).
    pub fn lerp(&self, other: &Point, t: f64) -> Point {
        Point::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
        )
    }
}

/// Signed shortest rotation from compass heading `current` to `target`, in
/// degrees within `(-180, 180]`, clockwise positive.
pub fn heading_error_deg(current: f64, target: f64) -> f64 {
    let e = (target - current).rem_euclid(360.0);
    if e > 180.0 { e - 360.0 } else { e }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Point::new(x, y)
    }
}

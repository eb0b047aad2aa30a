//! [`Geofence`] – the closed polygon the mower must stay inside.
//!
//! Vertices are in the local metric frame. A geofence is validated once at
//! construction (and on deserialization) and never mutated afterwards; edits
//! produce a new value with a new id.
//!
//! The buffer is an outward tolerance: a position up to `buffer_m` outside
//! the polygon does not count as a violation. Planned waypoints must lie
//! inside the polygon itself.

use mower_types::Point;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const EPS: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeofenceError {
    #[error("geofence needs at least 3 distinct vertices, got {0}")]
    TooFewVertices(usize),

    #[error("geofence vertex {0} is not a finite coordinate")]
    NonFinite(usize),

    #[error("geofence edges {first} and {second} intersect")]
    SelfIntersecting { first: usize, second: usize },

    #[error("geofence encloses no area")]
    Degenerate,

    #[error("geofence buffer must be non-negative, got {0}")]
    NegativeBuffer(f64),
}

/// Unvalidated form, as written in configuration or sent by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeofenceSpec {
    #[serde(default = "default_name")]
    pub name: String,
    pub vertices: Vec<Point>,
    #[serde(default)]
    pub buffer_m: f64,
}

fn default_name() -> String {
    "boundary".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGeofence")]
pub struct Geofence {
    id: Uuid,
    name: String,
    vertices: Vec<Point>,
    buffer_m: f64,
}

#[derive(Deserialize)]
struct RawGeofence {
    id: Uuid,
    name: String,
    vertices: Vec<Point>,
    buffer_m: f64,
}

impl TryFrom<RawGeofence> for Geofence {
    type Error = GeofenceError;

    fn try_from(raw: RawGeofence) -> Result<Self, Self::Error> {
        let mut fence = Geofence::new(raw.name, raw.vertices, raw.buffer_m)?;
        fence.id = raw.id;
        Ok(fence)
    }
}

impl TryFrom<GeofenceSpec> for Geofence {
    type Error = GeofenceError;

    fn try_from(spec: GeofenceSpec) -> Result<Self, Self::Error> {
        Geofence::new(spec.name, spec.vertices, spec.buffer_m)
    }
}

impl Geofence {
    /// Validate and build a geofence. A closing vertex equal to the first one
    /// is accepted and dropped.
    pub fn new(
        name: impl Into<String>,
        vertices: Vec<Point>,
        buffer_m: f64,
    ) -> Result<Self, GeofenceError> {
        if let Some(i) = vertices
            .iter()
            .position(|p| !p.x.is_finite() || !p.y.is_finite())
        {
            return Err(GeofenceError::NonFinite(i));
        }
        if !buffer_m.is_finite() || buffer_m < 0.0 {
            return Err(GeofenceError::NegativeBuffer(buffer_m));
        }

        let mut vertices = vertices;
        vertices.dedup_by(|a, b| a.distance_to(b) < EPS);
        if vertices.len() > 1 && vertices[0].distance_to(&vertices[vertices.len() - 1]) < EPS {
            vertices.pop();
        }
        if vertices.len() < 3 {
            return Err(GeofenceError::TooFewVertices(vertices.len()));
        }

        let fence = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            vertices,
            buffer_m,
        };
        fence.check_simple()?;
        if fence.area() < EPS {
            return Err(GeofenceError::Degenerate);
        }
        Ok(fence)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    pub fn buffer_m(&self) -> f64 {
        self.buffer_m
    }

    pub fn to_spec(&self) -> GeofenceSpec {
        GeofenceSpec {
            name: self.name.clone(),
            vertices: self.vertices.clone(),
            buffer_m: self.buffer_m,
        }
    }

    fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    /// Enclosed area in square metres (shoelace formula).
    pub fn area(&self) -> f64 {
        self.edges()
            .map(|(a, b)| a.x * b.y - b.x * a.y)
            .sum::<f64>()
            .abs()
            / 2.0
    }

    /// Axis-aligned bounding box as `(min, max)`.
    pub fn bounding_box(&self) -> (Point, Point) {
        self.vertices.iter().fold(
            (
                Point::new(f64::INFINITY, f64::INFINITY),
                Point::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
            ),
            |(lo, hi), p| {
                (
                    Point::new(lo.x.min(p.x), lo.y.min(p.y)),
                    Point::new(hi.x.max(p.x), hi.y.max(p.y)),
                )
            },
        )
    }

    /// `true` when `p` is inside the polygon or on its boundary.
    pub fn contains(&self, p: &Point) -> bool {
        if self.distance_to_boundary(p) < EPS {
            return true;
        }
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > p.y) != (b.y > p.y) {
                let x = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if p.x < x {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// `true` when `p` is inside the polygon or within the buffer distance of
    /// its boundary.
    pub fn permits(&self, p: &Point) -> bool {
        self.contains(p) || self.distance_to_boundary(p) <= self.buffer_m
    }

    /// Shortest distance from `p` to any edge.
    pub fn distance_to_boundary(&self, p: &Point) -> f64 {
        self.edges()
            .map(|(a, b)| distance_to_segment(p, &a, &b))
            .fold(f64::INFINITY, f64::min)
    }

    /// X coordinates where the horizontal line at `y` crosses the boundary,
    /// sorted ascending. Consecutive pairs bound the interior spans.
    pub fn crossings_at(&self, y: f64) -> Vec<f64> {
        let mut xs: Vec<f64> = self
            .edges()
            .filter(|(a, b)| (a.y > y) != (b.y > y))
            .map(|(a, b)| a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y))
            .collect();
        xs.sort_by(f64::total_cmp);
        xs
    }

    fn check_simple(&self) -> Result<(), GeofenceError> {
        let n = self.vertices.len();
        let edges: Vec<(Point, Point)> = self.edges().collect();
        for i in 0..n {
            for j in (i + 1)..n {
                let adjacent = j == i + 1 || (i == 0 && j == n - 1);
                if adjacent {
                    continue;
                }
                if segments_intersect(&edges[i].0, &edges[i].1, &edges[j].0, &edges[j].1) {
                    return Err(GeofenceError::SelfIntersecting {
                        first: i,
                        second: j,
                    });
                }
            }
        }
        Ok(())
    }
}

fn distance_to_segment(p: &Point, a: &Point, b: &Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len2 = dx * dx + dy * dy;
    if len2 < EPS {
        return p.distance_to(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    p.distance_to(&a.lerp(b, t))
}

fn orientation(a: &Point, b: &Point, c: &Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn on_segment(a: &Point, b: &Point, p: &Point) -> bool {
    p.x >= a.x.min(b.x) - EPS
        && p.x <= a.x.max(b.x) + EPS
        && p.y >= a.y.min(b.y) - EPS
        && p.y <= a.y.max(b.y) + EPS
}

fn segments_intersect(p1: &Point, p2: &Point, q1: &Point, q2: &Point) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if ((d1 > EPS && d2 < -EPS) || (d1 < -EPS && d2 > EPS))
        && ((d3 > EPS && d4 < -EPS) || (d3 < -EPS && d4 > EPS))
    {
        return true;
    }
    (d1.abs() <= EPS && on_segment(q1, q2, p1))
        || (d2.abs() <= EPS && on_segment(q1, q2, p2))
        || (d3.abs() <= EPS && on_segment(p1, p2, q1))
        || (d4.abs() <= EPS && on_segment(p1, p2, q2))
}

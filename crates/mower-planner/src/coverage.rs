//! Boustrophedon coverage planning over a [`Geofence`].
//!
//! ```text
//! bounding box ─► scanlines every width·(1 − overlap)
//!              ─► clip each scanline to the polygon (interior spans)
//!              ─► inset span ends by half a cutting width
//!              ─► order passes greedily by nearest endpoint
//!              ─► join adjacent passes with turning arcs
//! ```
//!
//! A [`CoveragePattern`] is never edited once produced. When the geofence
//! changes, plan again.

use std::f64::consts::PI;
use std::time::Duration;

use mower_types::{Point, WaypointRef};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::geofence::{Geofence, GeofenceError};

/// Scanlines closer than this are refused.
pub const MIN_SPACING_M: f64 = 0.2;

/// Turn arc flattening factors tried in order; the last is the straight chord.
const TURN_BULGE_STEPS: [f64; 4] = [1.0, 0.5, 0.25, 0.0];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanningError {
    #[error(transparent)]
    Geofence(#[from] GeofenceError),

    #[error("cutting width must be positive, got {0} m")]
    InvalidCuttingWidth(f64),

    #[error("overlap must be within [0, 1), got {0}")]
    InvalidOverlap(f64),

    #[error("line spacing {spacing:.3} m is below the {minimum} m minimum")]
    SpacingTooSmall { spacing: f64, minimum: f64 },

    #[error("geofence is too narrow for a single pass")]
    NoCoverage,

    #[error("turn between passes leaves the geofence at ({x:.2}, {y:.2})")]
    TurnOutside { x: f64, y: f64 },

    #[error("waypoint {index} at ({x:.2}, {y:.2}) lies outside the geofence")]
    WaypointOutside { index: usize, x: f64, y: f64 },

    #[error("estimated duration {estimated:?} exceeds remaining runtime {available:?}")]
    ExceedsRuntime {
        estimated: Duration,
        available: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PlannerConfig {
    pub cutting_width_m: f64,
    /// Fraction of the cutting width shared by neighbouring passes.
    pub overlap: f64,
    pub mowing_speed_mps: f64,
    /// Intermediate points on each turning arc.
    pub arc_points: usize,
    /// Time added per turn on top of the distance-based estimate.
    pub turn_time_s: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            cutting_width_m: 0.3,
            overlap: 0.1,
            mowing_speed_mps: 0.5,
            arc_points: 3,
            turn_time_s: 2.0,
        }
    }
}

impl PlannerConfig {
    pub fn spacing(&self) -> f64 {
        self.cutting_width_m * (1.0 - self.overlap)
    }

    pub fn validate(&self) -> Result<(), PlanningError> {
        if self.cutting_width_m.is_nan() || self.cutting_width_m <= 0.0 {
            return Err(PlanningError::InvalidCuttingWidth(self.cutting_width_m));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(PlanningError::InvalidOverlap(self.overlap));
        }
        let spacing = self.spacing();
        if spacing < MIN_SPACING_M {
            return Err(PlanningError::SpacingTooSmall {
                spacing,
                minimum: MIN_SPACING_M,
            });
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pattern
// ────────────────────────────────────────────────────────────────────────────

/// What the leg ending at a waypoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointKind {
    /// Start of a pass, reached by a straight move.
    Transit,
    /// Point on a turning arc between two adjacent passes.
    Turn,
    /// End of a mowing pass.
    Cut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationWaypoint {
    pub index: usize,
    pub position: Point,
    pub kind: WaypointKind,
    completed: bool,
}

impl NavigationWaypoint {
    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoveragePattern {
    id: Uuid,
    geofence_id: Uuid,
    waypoints: Vec<NavigationWaypoint>,
    cutting_width_m: f64,
    overlap: f64,
    spacing_m: f64,
    path_length_m: f64,
    estimated_duration: Duration,
}

impl CoveragePattern {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn geofence_id(&self) -> Uuid {
        self.geofence_id
    }

    pub fn waypoints(&self) -> &[NavigationWaypoint] {
        &self.waypoints
    }

    pub fn cutting_width_m(&self) -> f64 {
        self.cutting_width_m
    }

    pub fn overlap(&self) -> f64 {
        self.overlap
    }

    pub fn spacing_m(&self) -> f64 {
        self.spacing_m
    }

    pub fn path_length_m(&self) -> f64 {
        self.path_length_m
    }

    pub fn estimated_duration(&self) -> Duration {
        self.estimated_duration
    }

    /// First waypoint not yet reached.
    pub fn next_pending(&self) -> Option<&NavigationWaypoint> {
        self.waypoints.iter().find(|w| !w.completed)
    }

    pub fn completed_count(&self) -> usize {
        self.waypoints.iter().filter(|w| w.completed).count()
    }

    pub fn is_complete(&self) -> bool {
        self.waypoints.iter().all(|w| w.completed)
    }

    /// Mark waypoint `index` as reached. Returns `false` if it already was
    /// (or does not exist); a waypoint completes exactly once.
    pub fn mark_completed(&mut self, index: usize) -> bool {
        match self.waypoints.get_mut(index) {
            Some(w) if !w.completed => {
                w.completed = true;
                true
            }
            _ => false,
        }
    }

    pub fn waypoint_ref(&self, index: usize) -> Option<WaypointRef> {
        self.waypoints.get(index).map(|w| WaypointRef {
            pattern_id: self.id,
            index,
            target: w.position,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Planner
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CoveragePlanner {
    config: PlannerConfig,
}

type Pass = (Point, Point);

impl CoveragePlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan a pattern covering `fence`, starting from `start`.
    ///
    /// `available_runtime` is the runtime left on the current charge; a
    /// pattern estimated to take longer is rejected.
    pub fn plan(
        &self,
        fence: &Geofence,
        start: Point,
        available_runtime: Option<Duration>,
    ) -> Result<CoveragePattern, PlanningError> {
        self.config.validate()?;
        let spacing = self.config.spacing();

        let passes = self.passes(fence, spacing);
        if passes.is_empty() {
            return Err(PlanningError::NoCoverage);
        }
        let ordered = order_nearest(passes, start);

        let mut points: Vec<(Point, WaypointKind)> = Vec::new();
        let mut turns = 0usize;
        let mut last: Option<Pass> = None;
        for (a, b) in ordered {
            let mut entry = WaypointKind::Transit;
            if let Some((prev_a, prev_b)) = last {
                if prev_b.distance_to(&a) <= 2.0 * spacing + 1e-6 {
                    turns += 1;
                    entry = WaypointKind::Turn;
                    let turn = self.turn_inside(fence, prev_a, prev_b, a)?;
                    points.extend(turn.into_iter().map(|p| (p, WaypointKind::Turn)));
                }
            }
            points.push((a, entry));
            if b.distance_to(&a) > 1e-6 {
                points.push((b, WaypointKind::Cut));
            }
            last = Some((a, b));
        }

        let waypoints: Vec<NavigationWaypoint> = points
            .into_iter()
            .enumerate()
            .map(|(index, (position, kind))| NavigationWaypoint {
                index,
                position,
                kind,
                completed: false,
            })
            .collect();

        if let Some(w) = waypoints.iter().find(|w| !fence.contains(&w.position)) {
            return Err(PlanningError::WaypointOutside {
                index: w.index,
                x: w.position.x,
                y: w.position.y,
            });
        }

        let path_length_m = waypoints
            .iter()
            .scan(start, |cursor, w| {
                let d = cursor.distance_to(&w.position);
                *cursor = w.position;
                Some(d)
            })
            .sum::<f64>();
        let seconds =
            path_length_m / self.config.mowing_speed_mps + turns as f64 * self.config.turn_time_s;
        let estimated_duration = Duration::from_secs_f64(seconds.max(0.0));

        if let Some(available) = available_runtime {
            if estimated_duration > available {
                return Err(PlanningError::ExceedsRuntime {
                    estimated: estimated_duration,
                    available,
                });
            }
        }

        let pattern = CoveragePattern {
            id: Uuid::new_v4(),
            geofence_id: fence.id(),
            waypoints,
            cutting_width_m: self.config.cutting_width_m,
            overlap: self.config.overlap,
            spacing_m: spacing,
            path_length_m,
            estimated_duration,
        };
        info!(
            pattern = %pattern.id,
            geofence = %fence.id(),
            waypoints = pattern.waypoints.len(),
            length_m = path_length_m,
            duration_s = estimated_duration.as_secs(),
            "coverage pattern planned"
        );
        Ok(pattern)
    }

    /// Interior spans of every scanline, inset by half a cutting width.
    fn passes(&self, fence: &Geofence, spacing: f64) -> Vec<Pass> {
        let (lo, hi) = fence.bounding_box();
        let inset = self.config.cutting_width_m / 2.0;
        let mut passes = Vec::new();

        for row in 0.. {
            let y = lo.y + spacing * (row as f64 + 0.5);
            if y >= hi.y {
                break;
            }
            for span in fence.crossings_at(y).chunks_exact(2) {
                let (x0, x1) = (span[0] + inset, span[1] - inset);
                if x1 >= x0 {
                    passes.push((Point::new(x0, y), Point::new(x1, y)));
                }
            }
        }
        debug!(rows = passes.len(), spacing, "scanlines clipped");
        passes
    }

    /// The turning arc from `from` to `to`, flattened until every point lies
    /// inside `fence`. Fails when even the straight connection leaves it.
    fn turn_inside(
        &self,
        fence: &Geofence,
        prev_start: Point,
        from: Point,
        to: Point,
    ) -> Result<Vec<Point>, PlanningError> {
        let mut escape = from;
        for bulge in TURN_BULGE_STEPS {
            let arc = self.arc(prev_start, from, to, bulge);
            match arc.iter().find(|p| !fence.contains(p)) {
                None => {
                    if bulge < 1.0 {
                        debug!(bulge, x = from.x, y = from.y, "turn arc flattened to fit the geofence");
                    }
                    return Ok(arc);
                }
                Some(p) => escape = *p,
            }
        }
        Err(PlanningError::TurnOutside {
            x: escape.x,
            y: escape.y,
        })
    }

    /// Points strictly between `from` and `to` on a half ellipse that bulges
    /// in the direction of travel of the pass `prev_start → from`. A `bulge`
    /// of 1 is a half circle, 0 the straight chord.
    fn arc(&self, prev_start: Point, from: Point, to: Point, bulge: f64) -> Vec<Point> {
        let n = self.config.arc_points;
        let mid = from.lerp(&to, 0.5);
        let radius = from.distance_to(&to) / 2.0;
        let travel = prev_start.distance_to(&from);
        if n == 0 || radius < 1e-9 || travel < 1e-9 {
            return Vec::new();
        }
        let (dx, dy) = ((from.x - prev_start.x) / travel, (from.y - prev_start.y) / travel);
        (1..=n)
            .map(|k| {
                let theta = PI * k as f64 / (n + 1) as f64;
                Point::new(
                    mid.x + (from.x - mid.x) * theta.cos() + dx * radius * bulge * theta.sin(),
                    mid.y + (from.y - mid.y) * theta.cos() + dy * radius * bulge * theta.sin(),
                )
            })
            .collect()
    }
}

/// Greedy nearest-neighbour ordering; each pass is entered at whichever end
/// is closer to the current position.
fn order_nearest(mut remaining: Vec<Pass>, start: Point) -> Vec<Pass> {
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut cursor = start;
    while !remaining.is_empty() {
        let mut best = (0usize, false, f64::INFINITY);
        for (i, (a, b)) in remaining.iter().enumerate() {
            let (da, db) = (cursor.distance_to(a), cursor.distance_to(b));
            if da < best.2 {
                best = (i, false, da);
            }
            if db < best.2 {
                best = (i, true, db);
            }
        }
        let (a, b) = remaining.remove(best.0);
        let pass = if best.1 { (b, a) } else { (a, b) };
        cursor = pass.1;
        ordered.push(pass);
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_fence() -> Geofence {
        Geofence::new(
            "lawn",
            vec![
                Point::new(0.0, 0.0),
                Point::new(0.0, 10.0),
                Point::new(10.0, 10.0),
                Point::new(10.0, 0.0),
                Point::new(0.0, 0.0),
            ],
            0.0,
        )
        .unwrap()
    }

    fn planner(width: f64, overlap: f64) -> CoveragePlanner {
        CoveragePlanner::new(PlannerConfig {
            cutting_width_m: width,
            overlap,
            ..PlannerConfig::default()
        })
    }

    #[test]
    fn square_pattern_stays_inside() {
        let fence = square_fence();
        let pattern = planner(0.3, 0.1)
            .plan(&fence, Point::new(0.0, 0.0), None)
            .unwrap();

        assert!((pattern.spacing_m() - 0.27).abs() < 1e-9);
        assert!(!pattern.waypoints().is_empty());
        for w in pattern.waypoints() {
            assert!(fence.contains(&w.position), "{:?}", w.position);
        }
        // 37 rows, each with a transit/turn start and a cut end.
        let cuts = pattern
            .waypoints()
            .iter()
            .filter(|w| w.kind == WaypointKind::Cut)
            .count();
        assert_eq!(cuts, 37);
    }

    #[test]
    fn adjacent_rows_are_joined_by_arcs() {
        let pattern = planner(0.3, 0.1)
            .plan(&square_fence(), Point::new(0.0, 0.0), None)
            .unwrap();
        let turns = pattern
            .waypoints()
            .iter()
            .filter(|w| w.kind == WaypointKind::Turn)
            .count();
        // 36 row changes, each with 3 arc points plus the arc's end.
        assert_eq!(turns, 36 * 4);
    }

    #[test]
    fn spacing_below_minimum_is_rejected() {
        let err = planner(0.2, 0.5)
            .plan(&square_fence(), Point::new(0.0, 0.0), None)
            .unwrap_err();
        assert!(matches!(err, PlanningError::SpacingTooSmall { .. }));
    }

    #[test]
    fn overlap_out_of_range_is_rejected() {
        let err = planner(0.3, 1.0)
            .plan(&square_fence(), Point::new(0.0, 0.0), None)
            .unwrap_err();
        assert_eq!(err, PlanningError::InvalidOverlap(1.0));
    }

    #[test]
    fn starts_at_the_nearest_pass_end() {
        let pattern = planner(0.5, 0.0)
            .plan(&square_fence(), Point::new(10.0, 10.0), None)
            .unwrap();
        let first = pattern.waypoints()[0].position;
        assert!((first.x - 9.75).abs() < 1e-9);
        assert!((first.y - 9.75).abs() < 1e-9);
    }

    #[test]
    fn rejects_pattern_longer_than_runtime() {
        let err = planner(0.3, 0.1)
            .plan(
                &square_fence(),
                Point::new(0.0, 0.0),
                Some(Duration::from_secs(60)),
            )
            .unwrap_err();
        assert!(matches!(err, PlanningError::ExceedsRuntime { .. }));
    }

    #[test]
    fn concave_fence_is_clipped() {
        let fence = Geofence::new(
            "l",
            vec![
                Point::new(0.0, 0.0),
                Point::new(0.0, 10.0),
                Point::new(5.0, 10.0),
                Point::new(5.0, 5.0),
                Point::new(10.0, 5.0),
                Point::new(10.0, 0.0),
            ],
            0.0,
        )
        .unwrap();
        let pattern = planner(0.5, 0.0)
            .plan(&fence, Point::new(0.0, 0.0), None)
            .unwrap();
        for w in pattern.waypoints() {
            assert!(fence.contains(&w.position));
            if w.position.y > 5.0 {
                assert!(w.position.x <= 5.0 + 1e-9);
            }
        }
    }

    #[test]
    fn turn_near_the_edge_is_flattened_not_dropped() {
        let fence = square_fence();
        let p = planner(0.3, 0.1);
        // A full half circle would reach x = 10.45.
        let from = Point::new(9.95, 4.0);
        let to = Point::new(9.95, 5.0);
        let turn = p.turn_inside(&fence, Point::new(0.0, 4.0), from, to).unwrap();
        assert_eq!(turn.len(), p.config().arc_points);
        assert!(turn.iter().all(|pt| fence.contains(pt)));
        assert!(turn.iter().all(|pt| pt.y > from.y && pt.y < to.y));
    }

    #[test]
    fn turn_across_a_notch_is_rejected() {
        let fence = Geofence::new(
            "u",
            vec![
                Point::new(0.0, 0.0),
                Point::new(10.0, 0.0),
                Point::new(10.0, 10.0),
                Point::new(6.0, 10.0),
                Point::new(6.0, 2.0),
                Point::new(4.0, 2.0),
                Point::new(4.0, 10.0),
                Point::new(0.0, 10.0),
            ],
            0.0,
        )
        .unwrap();
        let err = planner(0.3, 0.1)
            .turn_inside(&fence, Point::new(3.5, 0.5), Point::new(3.5, 5.0), Point::new(6.5, 5.0))
            .unwrap_err();
        assert!(matches!(err, PlanningError::TurnOutside { .. }));
    }

    #[test]
    fn waypoints_complete_once() {
        let mut pattern = planner(0.5, 0.0)
            .plan(&square_fence(), Point::new(0.0, 0.0), None)
            .unwrap();
        assert!(pattern.mark_completed(0));
        assert!(!pattern.mark_completed(0));
        assert_eq!(pattern.completed_count(), 1);
        assert_eq!(pattern.next_pending().map(|w| w.index), Some(1));
        assert!(!pattern.mark_completed(pattern.waypoints().len()));
    }

    #[test]
    fn replanning_yields_a_new_pattern() {
        let fence = square_fence();
        let p = planner(0.5, 0.0);
        let a = p.plan(&fence, Point::new(0.0, 0.0), None).unwrap();
        let b = p.plan(&fence, Point::new(0.0, 0.0), None).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.geofence_id(), b.geofence_id());
        assert_eq!(a.waypoints().len(), b.waypoints().len());
    }
}

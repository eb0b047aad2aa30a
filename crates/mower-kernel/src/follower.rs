//! [`WaypointFollower`] – steers toward the next pending waypoint of a
//! coverage pattern.
//!
//! Steering is a PID on the wrapped heading error. Forward speed falls off
//! linearly with heading error (zero at `spin_heading_error_deg`, i.e. turn
//! in place) and with distance inside the approach zone. A waypoint is
//! reached inside `arrival_threshold_m`; no progress toward it for
//! `stall_timeout_ms` is a stall.

use std::time::Duration;

use mower_hal::pid::{PidController, heading_error_deg};
use mower_planner::CoveragePattern;
use mower_types::{MotionCommand, RobotState};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FollowerConfig {
    pub arrival_threshold_m: f64,
    pub cruise_speed_mps: f64,
    /// Inside this distance the speed ramps down toward `min_approach_speed_mps`.
    pub approach_distance_m: f64,
    pub min_approach_speed_mps: f64,
    /// Heading error at which forward speed reaches zero.
    pub spin_heading_error_deg: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub max_angular_rps: f64,
    pub stall_timeout_ms: u64,
    /// Distance gain that counts as progress.
    pub min_progress_m: f64,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            arrival_threshold_m: 0.2,
            cruise_speed_mps: 0.5,
            approach_distance_m: 1.0,
            min_approach_speed_mps: 0.15,
            spin_heading_error_deg: 60.0,
            kp: 0.03,
            ki: 0.0,
            kd: 0.005,
            max_angular_rps: 1.0,
            stall_timeout_ms: 30_000,
            min_progress_m: 0.1,
        }
    }
}

impl FollowerConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FollowStep {
    Drive(MotionCommand),
    /// Waypoint `index` was reached and marked completed.
    Arrived { index: usize },
    /// Every waypoint of the pattern is completed.
    Completed,
    Stalled { index: usize, detail: String },
    /// No position fix; hold still.
    NoFix,
}

#[derive(Debug, Clone)]
pub struct WaypointFollower {
    config: FollowerConfig,
    pid: PidController,
    target: Option<usize>,
    best_distance: f64,
    progress_at_us: u64,
    last_step_us: Option<u64>,
}

impl WaypointFollower {
    pub fn new(config: FollowerConfig) -> Self {
        let mut pid = PidController::new(config.kp, config.ki, config.kd);
        pid.set_output_limits(-config.max_angular_rps, config.max_angular_rps);
        Self {
            config,
            pid,
            target: None,
            best_distance: f64::INFINITY,
            progress_at_us: 0,
            last_step_us: None,
        }
    }

    pub fn config(&self) -> &FollowerConfig {
        &self.config
    }

    /// Forget the current target, e.g. when autonomy is paused.
    pub fn reset(&mut self) {
        self.pid.reset();
        self.target = None;
        self.best_distance = f64::INFINITY;
        self.last_step_us = None;
    }

    pub fn step(&mut self, pattern: &mut CoveragePattern, state: &RobotState) -> FollowStep {
        let Some(waypoint) = pattern.next_pending().cloned() else {
            return FollowStep::Completed;
        };
        let now = state.timestamp_us;
        if self.target != Some(waypoint.index) {
            self.reset();
            self.target = Some(waypoint.index);
            self.progress_at_us = now;
        }
        let Some(position) = state.position else {
            return FollowStep::NoFix;
        };

        let distance = position.distance_to(&waypoint.position);
        if distance <= self.config.arrival_threshold_m {
            pattern.mark_completed(waypoint.index);
            debug!(index = waypoint.index, "waypoint reached");
            self.reset();
            return if pattern.is_complete() {
                FollowStep::Completed
            } else {
                FollowStep::Arrived {
                    index: waypoint.index,
                }
            };
        }

        if distance < self.best_distance - self.config.min_progress_m
            || self.best_distance.is_infinite()
        {
            self.best_distance = distance;
            self.progress_at_us = now;
        }
        let stalled_for = Duration::from_micros(now.saturating_sub(self.progress_at_us));
        if stalled_for > self.config.stall_timeout() {
            return FollowStep::Stalled {
                index: waypoint.index,
                detail: format!(
                    "no progress toward waypoint {} for {:.0} s ({:.2} m away)",
                    waypoint.index,
                    stalled_for.as_secs_f64(),
                    distance
                ),
            };
        }

        let dt = self
            .last_step_us
            .map(|t| now.saturating_sub(t) as f64 / 1e6)
            .unwrap_or(0.0);
        self.last_step_us = Some(now);

        let error = heading_error_deg(state.heading_deg, position.bearing_to(&waypoint.position));
        let angular = if dt > 0.0 {
            self.pid.update_error(error, dt)
        } else {
            (self.config.kp * error).clamp(-self.config.max_angular_rps, self.config.max_angular_rps)
        };

        let alignment = (1.0 - error.abs() / self.config.spin_heading_error_deg).max(0.0);
        let approach = if distance < self.config.approach_distance_m {
            let ratio = distance / self.config.approach_distance_m;
            self.config.min_approach_speed_mps
                + ratio * (self.config.cruise_speed_mps - self.config.min_approach_speed_mps)
        } else {
            self.config.cruise_speed_mps
        };

        FollowStep::Drive(MotionCommand::Drive {
            linear_mps: (approach * alignment) as f32,
            angular_rps: angular as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mower_planner::{CoveragePlanner, Geofence, PlannerConfig};
    use mower_types::Point;

    fn pattern() -> CoveragePattern {
        let fence = Geofence::new(
            "strip",
            vec![
                Point::new(0.0, 0.0),
                Point::new(0.0, 1.0),
                Point::new(10.0, 1.0),
                Point::new(10.0, 0.0),
            ],
            0.0,
        )
        .unwrap();
        CoveragePlanner::new(PlannerConfig {
            cutting_width_m: 0.5,
            overlap: 0.0,
            ..PlannerConfig::default()
        })
        .plan(&fence, Point::new(0.0, 0.0), None)
        .unwrap()
    }

    fn at(ts: u64, x: f64, y: f64, heading: f64) -> RobotState {
        RobotState {
            timestamp_us: ts,
            position: Some(Point::new(x, y)),
            heading_deg: heading,
            ..RobotState::default()
        }
    }

    #[test]
    fn turns_toward_the_waypoint() {
        let mut p = pattern();
        let mut f = WaypointFollower::new(FollowerConfig::default());
        let first = p.waypoints()[0].position;
        // Facing north with the target due east: turn clockwise, crawl.
        let step = f.step(&mut p, &at(1, first.x - 3.0, first.y, 0.0));
        match step {
            FollowStep::Drive(MotionCommand::Drive {
                linear_mps,
                angular_rps,
            }) => {
                assert!(angular_rps > 0.0);
                assert_eq!(linear_mps, 0.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Facing it: full cruise speed, no turn.
        let mut f = WaypointFollower::new(FollowerConfig::default());
        let step = f.step(&mut p, &at(2, first.x - 3.0, first.y, 90.0));
        assert_eq!(
            step,
            FollowStep::Drive(MotionCommand::Drive {
                linear_mps: 0.5,
                angular_rps: 0.0
            })
        );
    }

    #[test]
    fn arrival_completes_each_waypoint_once() {
        let mut p = pattern();
        let mut f = WaypointFollower::new(FollowerConfig::default());
        let first = p.waypoints()[0].position;
        assert_eq!(
            f.step(&mut p, &at(1, first.x, first.y, 0.0)),
            FollowStep::Arrived { index: 0 }
        );
        assert_eq!(p.next_pending().map(|w| w.index), Some(1));

        let n = p.waypoints().len();
        for i in 1..n {
            let w = p.waypoints()[i].position;
            let step = f.step(&mut p, &at(1 + i as u64, w.x, w.y, 0.0));
            if i + 1 == n {
                assert_eq!(step, FollowStep::Completed);
            }
        }
        assert!(p.is_complete());
    }

    #[test]
    fn stall_is_reported() {
        let mut p = pattern();
        let mut f = WaypointFollower::new(FollowerConfig::default());
        let first = p.waypoints()[0].position;
        let stuck = |ts| at(ts, first.x - 3.0, first.y, 90.0);
        assert!(matches!(f.step(&mut p, &stuck(1)), FollowStep::Drive(_)));
        assert!(matches!(f.step(&mut p, &stuck(20_000_000)), FollowStep::Drive(_)));
        assert!(matches!(
            f.step(&mut p, &stuck(31_000_002)),
            FollowStep::Stalled { index: 0, .. }
        ));
    }

    #[test]
    fn no_fix_holds() {
        let mut p = pattern();
        let mut f = WaypointFollower::new(FollowerConfig::default());
        let state = RobotState {
            timestamp_us: 1,
            ..RobotState::default()
        };
        assert_eq!(f.step(&mut p, &state), FollowStep::NoFix);
    }
}

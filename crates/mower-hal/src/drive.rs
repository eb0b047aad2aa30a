//! Differential-drive kinematics: body velocity ↔ per-wheel duty cycle.
//!
//! Turn rates are clockwise positive so they agree with compass headings.
//! A positive `angular_rps` therefore speeds up the left wheel.

use crate::config::DriverConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifferentialDrive {
    /// Wheel ground speed at 100 % duty cycle.
    pub max_speed_mps: f64,
    /// Distance between the wheel contact points.
    pub track_width_m: f64,
}

impl Default for DifferentialDrive {
    fn default() -> Self {
        Self {
            max_speed_mps: 1.0,
            track_width_m: 0.4,
        }
    }
}

impl DifferentialDrive {
    /// Reads `max_speed_mps` and `track_width_m` from the driver params.
    pub fn from_config(config: &DriverConfig) -> Self {
        let d = Self::default();
        Self {
            max_speed_mps: config.param("max_speed_mps", d.max_speed_mps).max(0.01),
            track_width_m: config.param("track_width_m", d.track_width_m).max(0.01),
        }
    }

    /// `(left, right)` duty cycles in `[-1, 1]`.
    pub fn wheel_pwm(&self, linear_mps: f32, angular_rps: f32) -> (f32, f32) {
        let half = angular_rps as f64 * self.track_width_m * 0.5;
        let left = (linear_mps as f64 + half) / self.max_speed_mps;
        let right = (linear_mps as f64 - half) / self.max_speed_mps;
        (left.clamp(-1.0, 1.0) as f32, right.clamp(-1.0, 1.0) as f32)
    }

    /// `(linear m/s, angular rad/s clockwise)` produced by the given duty
    /// cycles.
    pub fn body_velocity(&self, left_pwm: f32, right_pwm: f32) -> (f64, f64) {
        let left = left_pwm as f64 * self.max_speed_mps;
        let right = right_pwm as f64 * self.max_speed_mps;
        ((left + right) * 0.5, (left - right) / self.track_width_m)
    }
}

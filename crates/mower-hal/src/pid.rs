//! PID controller used for heading steering.
//!
//! The waypoint follower feeds it the signed heading error (already wrapped
//! into `(-180, 180]` with [`heading_error_deg`]) and gets back a turn rate.
//!
//! ```rust
//! use mower_hal::pid::{PidController, heading_error_deg};
//!
//! let mut pid = PidController::new(0.02, 0.0, 0.0);
//! pid.set_output_limits(-1.0, 1.0);
//!
//! // Facing 350°, target at 10°: turn 20° clockwise, not 340° back.
//! let err = heading_error_deg(350.0, 10.0);
//! assert_eq!(err, 20.0);
//! assert!(pid.update_error(err, 0.2) > 0.0);
//! ```

pub use mower_types::geometry::heading_error_deg;

#[derive(Debug, Clone)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    integral: f64,
    last_error: Option<f64>,
    output_min: f64,
    output_max: f64,
}

impl PidController {
    /// Output is unclamped until [`set_output_limits`](Self::set_output_limits).
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            integral: 0.0,
            last_error: None,
            output_min: f64::NEG_INFINITY,
            output_max: f64::INFINITY,
        }
    }

    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    /// Clamp the output to `[min, max]`. The integral term is clamped too.
    pub fn set_output_limits(&mut self, min: f64, max: f64) {
        self.output_min = min;
        self.output_max = max;
    }

    /// Next output for an already computed `error` over `dt` seconds.
    /// A non-positive `dt` returns `0.0` and leaves the state untouched.
    pub fn update_error(&mut self, error: f64, dt: f64) -> f64 {
        if dt <= 0.0 {
            return 0.0;
        }
        let p = self.kp * error;

        self.integral += error * dt;
        let i = (self.ki * self.integral).clamp(self.output_min, self.output_max);
        if self.ki.abs() > f64::EPSILON {
            self.integral = i / self.ki;
        }

        let d = match self.last_error {
            Some(prev) => self.kd * (error - prev) / dt,
            None => 0.0,
        };
        self.last_error = Some(error);

        (p + i + d).clamp(self.output_min, self.output_max)
    }

    /// Next output driving `measurement` toward `set_point`.
    pub fn update(&mut self, set_point: f64, measurement: f64, dt: f64) -> f64 {
        self.update_error(set_point - measurement, dt)
    }

    /// Forget the integral and derivative memory, e.g. when switching to a
    /// new waypoint.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steers_toward_heading_across_north() {
        let mut pid = PidController::new(0.05, 0.0, 0.0);
        pid.set_output_limits(-1.0, 1.0);
        assert!(pid.update_error(heading_error_deg(10.0, 350.0), 0.2) < 0.0);
    }

    #[test]
    fn proportional_only() {
        let mut pid = PidController::new(2.0, 0.0, 0.0);
        assert!((pid.update(10.0, 0.0, 0.1) - 20.0).abs() < 1e-9);
        assert!(pid.update(5.0, 5.0, 0.1).abs() < 1e-12);
    }

    #[test]
    fn output_clamped_to_limits() {
        let mut pid = PidController::new(100.0, 0.0, 0.0);
        pid.set_output_limits(-1.0, 1.0);
        assert_eq!(pid.update_error(45.0, 0.2), 1.0);
        assert_eq!(pid.update_error(-45.0, 0.2), -1.0);
    }

    #[test]
    fn integral_accumulates_and_is_bounded() {
        let mut pid = PidController::new(0.0, 1.0, 0.0);
        pid.update_error(1.0, 0.5);
        assert!((pid.update_error(1.0, 0.5) - 1.0).abs() < 1e-9);

        let mut bounded = PidController::new(0.0, 1.0, 0.0);
        bounded.set_output_limits(-0.5, 0.5);
        for _ in 0..100 {
            bounded.update_error(10.0, 0.2);
        }
        // Wind-up is clamped: one step of opposite error pulls it back at once.
        assert!(bounded.update_error(-10.0, 0.2) < 0.5);
    }

    #[test]
    fn reset_matches_a_fresh_controller() {
        let mut pid = PidController::new(1.0, 1.0, 1.0);
        pid.update_error(5.0, 0.1);
        pid.reset();
        let mut fresh = PidController::new(1.0, 1.0, 1.0);
        assert!((pid.update_error(5.0, 0.1) - fresh.update_error(5.0, 0.1)).abs() < 1e-12);
    }

    #[test]
    fn non_positive_dt_is_ignored() {
        let mut pid = PidController::new(1.0, 1.0, 1.0);
        assert_eq!(pid.update_error(5.0, 0.0), 0.0);
        assert_eq!(pid.update_error(5.0, -0.1), 0.0);
        let mut fresh = PidController::new(1.0, 1.0, 1.0);
        assert!((pid.update_error(5.0, 0.1) - fresh.update_error(5.0, 0.1)).abs() < 1e-12);
    }
}

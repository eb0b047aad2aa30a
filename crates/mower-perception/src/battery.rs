//! Battery state-of-charge and remaining-runtime estimate.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Linear voltage → charge model of the traction pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BatteryModel {
    /// Pack voltage treated as 0 %.
    pub empty_voltage: f64,
    /// Pack voltage treated as 100 %.
    pub full_voltage: f64,
    pub capacity_ah: f64,
    /// Draw assumed while mowing when no current reading is available, or
    /// when the measured draw is lower (idle readings).
    pub mowing_draw_a: f64,
}

impl Default for BatteryModel {
    fn default() -> Self {
        Self {
            empty_voltage: 10.0,
            full_voltage: 12.6,
            capacity_ah: 20.0,
            mowing_draw_a: 6.0,
        }
    }
}

impl BatteryModel {
    /// State of charge in `[0, 100]`.
    pub fn percent(&self, voltage: f64) -> f64 {
        let span = (self.full_voltage - self.empty_voltage).max(f64::EPSILON);
        ((voltage - self.empty_voltage) / span * 100.0).clamp(0.0, 100.0)
    }

    /// How long the pack can keep mowing at the given charge.
    pub fn runtime(&self, percent: f64, current_a: Option<f64>) -> Duration {
        let draw = current_a
            .map(f64::abs)
            .unwrap_or(0.0)
            .max(self.mowing_draw_a)
            .max(0.1);
        let hours = self.capacity_ah * (percent.clamp(0.0, 100.0) / 100.0) / draw;
        Duration::from_secs_f64(hours * 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_linear_and_clamped() {
        let model = BatteryModel::default();
        assert_eq!(model.percent(10.0), 0.0);
        assert_eq!(model.percent(12.6), 100.0);
        assert!((model.percent(11.3) - 50.0).abs() < 1e-9);
        assert_eq!(model.percent(9.0), 0.0);
        assert_eq!(model.percent(13.5), 100.0);
    }

    #[test]
    fn runtime_uses_mowing_draw_as_floor() {
        let model = BatteryModel::default();
        // 20 Ah at 50 % over 6 A ⇒ 1 h 40 min.
        let idle = model.runtime(50.0, Some(0.4)).as_secs_f64();
        assert!((idle - 6000.0).abs() < 1e-3);
        // A heavier measured draw shortens it.
        let heavy = model.runtime(50.0, Some(10.0)).as_secs_f64();
        assert!((heavy - 3600.0).abs() < 1e-3);
    }
}

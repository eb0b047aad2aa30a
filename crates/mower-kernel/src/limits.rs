//! Configured thresholds the safety layer enforces.

use std::time::Duration;

use mower_types::MowerError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SafetyLimits {
    /// Roll or pitch magnitude beyond which `tilt_detected` is raised.
    pub max_tilt_deg: f64,
    /// Pack voltage below which `low_battery` is raised.
    pub low_battery_voltage: f64,
    /// `low_battery` clears only above `low_battery_voltage + hysteresis`.
    pub battery_hysteresis_v: f64,
    pub max_temperature_c: f64,
    /// `high_temperature` clears only below `max_temperature_c − hysteresis`.
    pub temperature_hysteresis_c: f64,
    /// Obstacles closer than this raise `obstacle_detected`.
    pub obstacle_stop_distance_m: f64,
    pub watchdog_timeout_ms: u64,
    pub max_linear_mps: f32,
    pub max_angular_rps: f32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_tilt_deg: 25.0,
            low_battery_voltage: 10.0,
            battery_hysteresis_v: 0.5,
            max_temperature_c: 60.0,
            temperature_hysteresis_c: 2.0,
            obstacle_stop_distance_m: 0.3,
            watchdog_timeout_ms: 1000,
            max_linear_mps: 1.0,
            max_angular_rps: 1.5,
        }
    }
}

impl SafetyLimits {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    /// Reject limits that would disable a safety check.
    pub fn validate(&self) -> Result<(), MowerError> {
        let positive = [
            ("max_tilt_deg", self.max_tilt_deg),
            ("low_battery_voltage", self.low_battery_voltage),
            ("max_temperature_c", self.max_temperature_c),
            ("max_linear_mps", f64::from(self.max_linear_mps)),
            ("max_angular_rps", f64::from(self.max_angular_rps)),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(MowerError::Config(format!(
                    "safety.{name} must be positive, got {value}"
                )));
            }
        }
        let non_negative = [
            ("battery_hysteresis_v", self.battery_hysteresis_v),
            ("temperature_hysteresis_c", self.temperature_hysteresis_c),
            ("obstacle_stop_distance_m", self.obstacle_stop_distance_m),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(MowerError::Config(format!(
                    "safety.{name} must not be negative, got {value}"
                )));
            }
        }
        if self.watchdog_timeout_ms == 0 {
            return Err(MowerError::Config(
                "safety.watchdog_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SafetyLimits::default().validate().is_ok());
        assert_eq!(SafetyLimits::default().watchdog_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn zero_tilt_limit_rejected() {
        let limits = SafetyLimits {
            max_tilt_deg: 0.0,
            ..SafetyLimits::default()
        };
        assert!(matches!(limits.validate(), Err(MowerError::Config(_))));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let limits: SafetyLimits = serde_json::from_str(r#"{"max_tilt_deg": 30.0}"#).unwrap();
        assert_eq!(limits.max_tilt_deg, 30.0);
        assert_eq!(limits.low_battery_voltage, 10.0);
    }
}

//! The canonical [`RobotState`] snapshot and the enums it is built from.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::Point;
use crate::reading::SensorChannel;

// ────────────────────────────────────────────────────────────────────────────
// Interlocks
// ────────────────────────────────────────────────────────────────────────────

/// A named safety condition that, while present, blocks motion commands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum InterlockKind {
    EmergencyStop,
    TiltDetected,
    LowBattery,
    GeofenceViolation,
    WatchdogTimeout,
    HighTemperature,
    ObstacleDetected,
}

impl InterlockKind {
    pub const ALL: [InterlockKind; 7] = [
        InterlockKind::EmergencyStop,
        InterlockKind::TiltDetected,
        InterlockKind::LowBattery,
        InterlockKind::GeofenceViolation,
        InterlockKind::WatchdogTimeout,
        InterlockKind::HighTemperature,
        InterlockKind::ObstacleDetected,
    ];

    /// `true` for the kinds that never clear without an operator
    /// acknowledgment, even once the triggering condition is gone.
    pub fn requires_ack(self) -> bool {
        matches!(
            self,
            InterlockKind::EmergencyStop
                | InterlockKind::TiltDetected
                | InterlockKind::GeofenceViolation
                | InterlockKind::WatchdogTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InterlockKind::EmergencyStop => "emergency_stop",
            InterlockKind::TiltDetected => "tilt_detected",
            InterlockKind::LowBattery => "low_battery",
            InterlockKind::GeofenceViolation => "geofence_violation",
            InterlockKind::WatchdogTimeout => "watchdog_timeout",
            InterlockKind::HighTemperature => "high_temperature",
            InterlockKind::ObstacleDetected => "obstacle_detected",
        }
    }
}

impl fmt::Display for InterlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterlockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InterlockKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown interlock kind '{s}'"))
    }
}

/// Lifecycle position of a single interlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlockStatus {
    /// The triggering condition currently holds.
    Active,
    /// The condition is gone but the operator has not acknowledged it yet.
    ClearedPendingAck,
    /// Terminal: acknowledged and removed from the active set.
    Acknowledged,
}

// ────────────────────────────────────────────────────────────────────────────
// Navigation mode
// ────────────────────────────────────────────────────────────────────────────

/// Which command sources may act on the motors.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NavigationMode {
    Manual,
    Autonomous,
    Calibration,
    EmergencyStop,
    #[default]
    Idle,
}

impl NavigationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NavigationMode::Manual => "MANUAL",
            NavigationMode::Autonomous => "AUTONOMOUS",
            NavigationMode::Calibration => "CALIBRATION",
            NavigationMode::EmergencyStop => "EMERGENCY_STOP",
            NavigationMode::Idle => "IDLE",
        }
    }
}

impl fmt::Display for NavigationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NavigationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(NavigationMode::Manual),
            "AUTONOMOUS" => Ok(NavigationMode::Autonomous),
            "CALIBRATION" => Ok(NavigationMode::Calibration),
            "EMERGENCY_STOP" => Ok(NavigationMode::EmergencyStop),
            "IDLE" => Ok(NavigationMode::Idle),
            other => Err(format!("unknown navigation mode '{other}'")),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RobotState
// ────────────────────────────────────────────────────────────────────────────

/// Reference to the waypoint the robot is currently driving toward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaypointRef {
    pub pattern_id: Uuid,
    pub index: usize,
    pub target: Point,
}

/// Last actuator state echoed back by the drivers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotorState {
    /// Left wheel duty cycle in `[-1, 1]`.
    pub left_pwm: f32,
    /// Right wheel duty cycle in `[-1, 1]`.
    pub right_pwm: f32,
    pub blade_enabled: bool,
    /// Blade duty cycle in `[0, 1]`.
    pub blade_pwm: f32,
}

impl MotorState {
    pub fn is_idle(&self) -> bool {
        self.left_pwm == 0.0 && self.right_pwm == 0.0 && !self.blade_enabled
    }

    /// Fold one actuator's echo into the combined motor state.
    pub fn apply_echo(&mut self, echo: &ActuatorEcho) {
        match *echo {
            ActuatorEcho::Wheels { left_pwm, right_pwm } => {
                self.left_pwm = left_pwm;
                self.right_pwm = right_pwm;
            }
            ActuatorEcho::Blade { enabled, pwm } => {
                self.blade_enabled = enabled;
                self.blade_pwm = pwm;
            }
        }
    }
}

/// What a single actuator driver reports after applying a command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActuatorEcho {
    Wheels { left_pwm: f32, right_pwm: f32 },
    Blade { enabled: bool, pwm: f32 },
}

/// Canonical, immutable snapshot of everything the core knows about the
/// robot.
///
/// Only the fusion engine constructs new snapshots; everyone else holds an
/// `Arc<RobotState>` and reads it. Sensor-derived fields that have never been
/// observed are `None`; fields whose source went stale keep their last value
/// and their channel is listed in [`low_confidence`](Self::low_confidence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    /// Microseconds since the Unix epoch. Strictly increasing per snapshot.
    pub timestamp_us: u64,

    pub position: Option<Point>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub position_accuracy_m: Option<f64>,

    /// Compass heading in degrees, `[0, 360)`.
    pub heading_deg: f64,
    pub velocity_mps: f64,
    pub angular_velocity_dps: f64,
    pub roll_deg: f64,
    pub pitch_deg: f64,

    pub battery_voltage: Option<f64>,
    pub battery_current_a: Option<f64>,
    pub battery_percent: Option<f64>,
    pub solar_voltage: Option<f64>,
    pub solar_current_a: Option<f64>,

    pub temperature_c: Option<f64>,
    pub humidity_percent: Option<f64>,
    pub rain_detected: bool,
    pub obstacle_distance_m: Option<f64>,

    pub active_interlocks: BTreeSet<InterlockKind>,
    pub estop_engaged: bool,
    pub watchdog_healthy: bool,
    pub navigation_mode: NavigationMode,
    pub current_waypoint: Option<WaypointRef>,
    pub motors: MotorState,

    /// Channels whose most recent reading is older than the staleness window.
    pub low_confidence: BTreeSet<SensorChannel>,
}

impl Default for RobotState {
    fn default() -> Self {
        Self {
            timestamp_us: 0,
            position: None,
            latitude: None,
            longitude: None,
            position_accuracy_m: None,
            heading_deg: 0.0,
            velocity_mps: 0.0,
            angular_velocity_dps: 0.0,
            roll_deg: 0.0,
            pitch_deg: 0.0,
            battery_voltage: None,
            battery_current_a: None,
            battery_percent: None,
            solar_voltage: None,
            solar_current_a: None,
            temperature_c: None,
            humidity_percent: None,
            rain_detected: false,
            obstacle_distance_m: None,
            active_interlocks: BTreeSet::new(),
            estop_engaged: false,
            watchdog_healthy: true,
            navigation_mode: NavigationMode::Idle,
            current_waypoint: None,
            motors: MotorState::default(),
            low_confidence: BTreeSet::new(),
        }
    }
}

impl RobotState {
    /// `true` when no interlock is active or awaiting acknowledgment.
    pub fn is_clear(&self) -> bool {
        self.active_interlocks.is_empty()
    }

    pub fn is_low_confidence(&self, channel: SensorChannel) -> bool {
        self.low_confidence.contains(&channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interlock_kind_serializes_snake_case() {
        let json = serde_json::to_string(&InterlockKind::TiltDetected).unwrap();
        assert_eq!(json, "\"tilt_detected\"");
        let back: InterlockKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InterlockKind::TiltDetected);
    }

    #[test]
    fn interlock_kind_parses_from_str() {
        assert_eq!(
            "geofence_violation".parse::<InterlockKind>(),
            Ok(InterlockKind::GeofenceViolation)
        );
        assert!("not_a_kind".parse::<InterlockKind>().is_err());
    }

    #[test]
    fn only_four_kinds_require_ack() {
        let needing_ack: Vec<_> = InterlockKind::ALL
            .into_iter()
            .filter(|k| k.requires_ack())
            .collect();
        assert_eq!(
            needing_ack,
            vec![
                InterlockKind::EmergencyStop,
                InterlockKind::TiltDetected,
                InterlockKind::GeofenceViolation,
                InterlockKind::WatchdogTimeout,
            ]
        );
    }

    #[test]
    fn navigation_mode_wire_format() {
        let json = serde_json::to_string(&NavigationMode::EmergencyStop).unwrap();
        assert_eq!(json, "\"EMERGENCY_STOP\"");
        assert_eq!(
            "autonomous".parse::<NavigationMode>(),
            Ok(NavigationMode::Autonomous)
        );
    }

    #[test]
    fn echoes_merge_into_motor_state() {
        let mut motors = MotorState::default();
        motors.apply_echo(&ActuatorEcho::Wheels {
            left_pwm: 0.4,
            right_pwm: 0.2,
        });
        motors.apply_echo(&ActuatorEcho::Blade {
            enabled: true,
            pwm: 1.0,
        });
        assert_eq!(motors.left_pwm, 0.4);
        assert!(motors.blade_enabled);
        assert!(!motors.is_idle());
    }

    #[test]
    fn default_state_is_idle_and_clear() {
        let state = RobotState::default();
        assert_eq!(state.navigation_mode, NavigationMode::Idle);
        assert!(state.is_clear());
        assert!(state.watchdog_healthy);
        assert!(state.motors.is_idle());
    }
}

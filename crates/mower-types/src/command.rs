//! Motion commands that flow from the operator or autonomy toward the motors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Strict definition of the physical actions the core may request.
/// The driver registry translates these into per-motor duty cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum MotionCommand {
    /// Differential drive command.
    Drive {
        linear_mps: f32,
        /// Turn rate, clockwise positive (rad/s).
        angular_rps: f32,
    },
    /// Blade motor on/off.
    Blade { enabled: bool },
    /// Zero every motor and stop the blade.
    Stop,
}

impl MotionCommand {
    /// `true` when the command can only make the robot safer (stop, zero
    /// drive, blade off). Such commands pass every interlock.
    pub fn is_safe(&self) -> bool {
        match self {
            MotionCommand::Stop => true,
            MotionCommand::Blade { enabled } => !enabled,
            MotionCommand::Drive {
                linear_mps,
                angular_rps,
            } => *linear_mps == 0.0 && *angular_rps == 0.0,
        }
    }
}

/// Who issued a command. The navigation mode decides which sources may act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Operator,
    Autonomy,
    Calibration,
    /// Commands emitted by the safety path itself (always stops).
    Safety,
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandSource::Operator => "operator",
            CommandSource::Autonomy => "autonomy",
            CommandSource::Calibration => "calibration",
            CommandSource::Safety => "safety",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_commands() {
        assert!(MotionCommand::Stop.is_safe());
        assert!(MotionCommand::Blade { enabled: false }.is_safe());
        assert!(
            MotionCommand::Drive {
                linear_mps: 0.0,
                angular_rps: 0.0
            }
            .is_safe()
        );
        assert!(!MotionCommand::Blade { enabled: true }.is_safe());
        assert!(
            !MotionCommand::Drive {
                linear_mps: 0.2,
                angular_rps: 0.0
            }
            .is_safe()
        );
    }

    #[test]
    fn drive_roundtrip() {
        let cmd = MotionCommand::Drive {
            linear_mps: 0.5,
            angular_rps: -0.3,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"action\":\"drive\""));
        let back: MotionCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }
}

//! [`CommandGate`] – the single check every motion command passes before it
//! reaches the actuators.
//!
//! Checks run in order and the first failure wins:
//!
//! 1. **Safe commands** (stop, zero drive, blade off) always pass, from any
//!    source in any mode.
//! 2. **Interlocks**: any interlock that is active or awaiting
//!    acknowledgment rejects the command and names every such interlock.
//! 3. **Mode**: the navigation mode must admit the command's source.
//! 4. **Command rules**: every registered [`CommandRule`] (speed caps, ...)
//!    must accept the command.
//!
//! | Mode | Admitted sources |
//! |------|------------------|
//! | `MANUAL` | operator |
//! | `AUTONOMOUS` | autonomy |
//! | `CALIBRATION` | calibration, operator |
//! | `EMERGENCY_STOP`, `IDLE` | none |
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeSet;
//! use mower_kernel::gate::{CommandGate, RejectionReason, SpeedCapRule};
//! use mower_types::{CommandSource, InterlockKind, MotionCommand, NavigationMode};
//!
//! let mut gate = CommandGate::new();
//! gate.add_rule(Box::new(SpeedCapRule { max_linear_mps: 1.0, max_angular_rps: 1.0 }));
//!
//! let drive = MotionCommand::Drive { linear_mps: 0.5, angular_rps: 0.0 };
//! let clear = BTreeSet::new();
//! assert!(gate.check(&drive, CommandSource::Operator, NavigationMode::Manual, &clear).is_ok());
//!
//! let tilted = BTreeSet::from([InterlockKind::TiltDetected]);
//! let err = gate
//!     .check(&MotionCommand::Blade { enabled: true }, CommandSource::Operator, NavigationMode::Manual, &tilted)
//!     .unwrap_err();
//! assert_eq!(err.reason, RejectionReason::Interlock);
//! assert_eq!(err.interlocks, vec![InterlockKind::TiltDetected]);
//! ```

use std::collections::BTreeSet;
use std::fmt;

use mower_types::{CommandSource, InterlockKind, MotionCommand, NavigationMode};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Rejection
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    /// One or more interlocks are active or awaiting acknowledgment.
    Interlock,
    /// The current navigation mode does not admit this source.
    Mode,
    /// A command rule was violated.
    Rule { rule: String },
}

/// Structured reason a command was not forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRejection {
    pub reason: RejectionReason,
    pub command: MotionCommand,
    pub source: CommandSource,
    pub mode: NavigationMode,
    /// Interlocks in effect at the time, sorted.
    pub interlocks: Vec<InterlockKind>,
    pub detail: String,
}

impl fmt::Display for CommandRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            RejectionReason::Interlock => {
                let names: Vec<&str> = self.interlocks.iter().map(|k| k.as_str()).collect();
                write!(f, "blocked by interlock(s): {}", names.join(", "))
            }
            RejectionReason::Mode => write!(
                f,
                "{} commands are not accepted in {} mode",
                self.source, self.mode
            ),
            RejectionReason::Rule { rule } => write!(f, "{rule}: {}", self.detail),
        }
    }
}

impl std::error::Error for CommandRejection {}

// ────────────────────────────────────────────────────────────────────────────
// Command rules
// ────────────────────────────────────────────────────────────────────────────

/// A physical invariant a command must satisfy.
pub trait CommandRule: Send + Sync {
    fn name(&self) -> &str;

    /// `Err(detail)` when the command violates the rule.
    fn check(&self, command: &MotionCommand) -> Result<(), String>;
}

/// Rejects drive commands faster than the configured caps.
pub struct SpeedCapRule {
    pub max_linear_mps: f32,
    pub max_angular_rps: f32,
}

impl CommandRule for SpeedCapRule {
    fn name(&self) -> &str {
        "speed_cap"
    }

    fn check(&self, command: &MotionCommand) -> Result<(), String> {
        if let MotionCommand::Drive {
            linear_mps,
            angular_rps,
        } = command
        {
            if !linear_mps.is_finite() || linear_mps.abs() > self.max_linear_mps {
                return Err(format!(
                    "linear {linear_mps} m/s exceeds cap {}",
                    self.max_linear_mps
                ));
            }
            if !angular_rps.is_finite() || angular_rps.abs() > self.max_angular_rps {
                return Err(format!(
                    "angular {angular_rps} rad/s exceeds cap {}",
                    self.max_angular_rps
                ));
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CommandGate
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CommandGate {
    rules: Vec<Box<dyn CommandRule>>,
}

impl CommandGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn CommandRule>) {
        self.rules.push(rule);
    }

    pub fn admits(mode: NavigationMode, source: CommandSource) -> bool {
        matches!(
            (mode, source),
            (NavigationMode::Manual, CommandSource::Operator)
                | (NavigationMode::Autonomous, CommandSource::Autonomy)
                | (
                    NavigationMode::Calibration,
                    CommandSource::Calibration | CommandSource::Operator
                )
        )
    }

    pub fn check(
        &self,
        command: &MotionCommand,
        source: CommandSource,
        mode: NavigationMode,
        interlocks: &BTreeSet<InterlockKind>,
    ) -> Result<(), CommandRejection> {
        if command.is_safe() {
            return Ok(());
        }

        let reject = |reason: RejectionReason, detail: String| CommandRejection {
            reason,
            command: *command,
            source,
            mode,
            interlocks: interlocks.iter().copied().collect(),
            detail,
        };

        if !interlocks.is_empty() {
            return Err(reject(
                RejectionReason::Interlock,
                "motion is blocked until every interlock is acknowledged".to_string(),
            ));
        }
        if !Self::admits(mode, source) {
            return Err(reject(RejectionReason::Mode, String::new()));
        }
        for rule in &self.rules {
            rule.check(command).map_err(|detail| {
                reject(
                    RejectionReason::Rule {
                        rule: rule.name().to_string(),
                    },
                    detail,
                )
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODES: [NavigationMode; 5] = [
        NavigationMode::Manual,
        NavigationMode::Autonomous,
        NavigationMode::Calibration,
        NavigationMode::EmergencyStop,
        NavigationMode::Idle,
    ];

    fn capped() -> CommandGate {
        let mut gate = CommandGate::new();
        gate.add_rule(Box::new(SpeedCapRule {
            max_linear_mps: 1.0,
            max_angular_rps: 1.0,
        }));
        gate
    }

    fn drive(linear_mps: f32, angular_rps: f32) -> MotionCommand {
        MotionCommand::Drive {
            linear_mps,
            angular_rps,
        }
    }

    #[test]
    fn tilt_blocks_blade_in_every_mode() {
        let gate = capped();
        let tilted = BTreeSet::from([InterlockKind::TiltDetected]);
        for mode in MODES {
            for source in [
                CommandSource::Operator,
                CommandSource::Autonomy,
                CommandSource::Calibration,
            ] {
                let err = gate
                    .check(&MotionCommand::Blade { enabled: true }, source, mode, &tilted)
                    .unwrap_err();
                assert_eq!(err.reason, RejectionReason::Interlock);
                assert!(err.to_string().contains("tilt_detected"));
            }
        }
    }

    #[test]
    fn safe_commands_always_pass() {
        let gate = capped();
        let all: BTreeSet<_> = InterlockKind::ALL.into_iter().collect();
        for mode in MODES {
            for cmd in [
                MotionCommand::Stop,
                MotionCommand::Blade { enabled: false },
                drive(0.0, 0.0),
            ] {
                assert!(gate.check(&cmd, CommandSource::Safety, mode, &all).is_ok());
            }
        }
    }

    #[test]
    fn mode_admits_only_its_sources() {
        let gate = capped();
        let clear = BTreeSet::new();
        let cmd = drive(0.3, 0.0);
        assert!(gate.check(&cmd, CommandSource::Operator, NavigationMode::Manual, &clear).is_ok());
        assert!(gate.check(&cmd, CommandSource::Autonomy, NavigationMode::Autonomous, &clear).is_ok());

        let err = gate
            .check(&cmd, CommandSource::Autonomy, NavigationMode::Manual, &clear)
            .unwrap_err();
        assert_eq!(err.reason, RejectionReason::Mode);

        for mode in [NavigationMode::Idle, NavigationMode::EmergencyStop] {
            assert!(gate.check(&cmd, CommandSource::Operator, mode, &clear).is_err());
        }
    }

    #[test]
    fn speed_cap_is_enforced_after_mode() {
        let gate = capped();
        let clear = BTreeSet::new();
        let err = gate
            .check(&drive(1.5, 0.0), CommandSource::Operator, NavigationMode::Manual, &clear)
            .unwrap_err();
        assert_eq!(
            err.reason,
            RejectionReason::Rule {
                rule: "speed_cap".to_string()
            }
        );
        assert!(gate
            .check(&drive(-0.5, -1.2), CommandSource::Operator, NavigationMode::Manual, &clear)
            .is_err());
        assert!(gate
            .check(&drive(1.0, 1.0), CommandSource::Operator, NavigationMode::Manual, &clear)
            .is_ok());
    }

    #[test]
    fn non_finite_speeds_are_rejected() {
        let gate = capped();
        let clear = BTreeSet::new();
        assert!(gate
            .check(&drive(f32::NAN, 0.0), CommandSource::Operator, NavigationMode::Manual, &clear)
            .is_err());
    }

    #[test]
    fn rejection_serializes_with_reason() {
        let gate = capped();
        let err = gate
            .check(
                &MotionCommand::Blade { enabled: true },
                CommandSource::Operator,
                NavigationMode::Idle,
                &BTreeSet::new(),
            )
            .unwrap_err();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["reason"]["kind"], "mode");
        assert_eq!(json["mode"], "IDLE");
    }
}

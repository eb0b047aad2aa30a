//! [`NavigationModeManager`] – the mode state machine that decides which
//! command sources may act on the motors.
//!
//! ```text
//!            any interlock becomes active
//!   (any) ───────────────────────────────► EMERGENCY_STOP
//!                                                │ reset(): every interlock
//!                                                ▼ acknowledged
//!   MANUAL ◄──────────────────────────────────► IDLE
//!     │   zero interlocks + valid pattern         │
//!     └──────────────► AUTONOMOUS ◄───────────────┘
//! ```
//!
//! Every transition and every command consults the
//! [`SafetyInterlockManager`]; commands go through the [`CommandGate`].
//! In `AUTONOMOUS` the embedded [`WaypointFollower`] produces drive commands
//! from the loaded [`CoveragePattern`].

use mower_planner::CoveragePattern;
use mower_types::{
    CommandSource, EventPayload, InterlockKind, MotionCommand, NavigationMode, RobotState,
    WaypointRef,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::follower::{FollowStep, FollowerConfig, WaypointFollower};
use crate::gate::{CommandGate, CommandRejection, SpeedCapRule};
use crate::interlock::SafetyInterlockManager;
use crate::limits::SafetyLimits;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("interlocks not clear: {0:?}")]
    InterlocksActive(Vec<InterlockKind>),

    #[error("no coverage pattern with pending waypoints is loaded")]
    NoPattern,

    #[error("coverage pattern {pattern} was planned for a different geofence")]
    StalePattern { pattern: Uuid },

    #[error("cannot switch from {from} to {to}")]
    Invalid {
        from: NavigationMode,
        to: NavigationMode,
    },

    #[error("EMERGENCY_STOP is left only through an explicit reset")]
    ResetRequired,

    #[error("the coverage pattern cannot change while AUTONOMOUS")]
    PatternLocked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModeChange {
    pub from: NavigationMode,
    pub to: NavigationMode,
    pub reason: String,
}

impl ModeChange {
    pub fn to_payload(&self) -> EventPayload {
        EventPayload::ModeChanged {
            from: self.from,
            to: self.to,
            reason: self.reason.clone(),
        }
    }
}

/// Outcome of one autonomous navigation step.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationStep {
    /// Not in `AUTONOMOUS`; nothing to do.
    Inactive,
    Command(MotionCommand),
    Rejected(CommandRejection),
    Arrived(WaypointRef),
    /// The pattern is done; the manager has returned to `IDLE`.
    Completed { pattern: Uuid, change: ModeChange },
    /// No progress within the stall timeout; the manager has returned to
    /// `IDLE`.
    Stalled { detail: String, change: ModeChange },
}

pub struct NavigationModeManager {
    mode: NavigationMode,
    gate: CommandGate,
    pattern: Option<CoveragePattern>,
    follower: WaypointFollower,
}

impl NavigationModeManager {
    pub fn new(gate: CommandGate, follower: FollowerConfig) -> Self {
        Self {
            mode: NavigationMode::Idle,
            gate,
            pattern: None,
            follower: WaypointFollower::new(follower),
        }
    }

    /// A manager whose gate enforces the speed caps in `limits`.
    pub fn with_limits(limits: &SafetyLimits, follower: FollowerConfig) -> Self {
        let mut gate = CommandGate::new();
        gate.add_rule(Box::new(SpeedCapRule {
            max_linear_mps: limits.max_linear_mps,
            max_angular_rps: limits.max_angular_rps,
        }));
        Self::new(gate, follower)
    }

    pub fn mode(&self) -> NavigationMode {
        self.mode
    }

    pub fn pattern(&self) -> Option<&CoveragePattern> {
        self.pattern.as_ref()
    }

    pub fn load_pattern(&mut self, pattern: CoveragePattern) -> Result<(), TransitionError> {
        if self.mode == NavigationMode::Autonomous {
            return Err(TransitionError::PatternLocked);
        }
        info!(pattern = %pattern.id(), waypoints = pattern.waypoints().len(), "coverage pattern loaded");
        self.follower.reset();
        self.pattern = Some(pattern);
        Ok(())
    }

    pub fn clear_pattern(&mut self) -> Result<Option<CoveragePattern>, TransitionError> {
        if self.mode == NavigationMode::Autonomous {
            return Err(TransitionError::PatternLocked);
        }
        self.follower.reset();
        Ok(self.pattern.take())
    }

    /// The waypoint currently being driven to, while `AUTONOMOUS`.
    pub fn current_waypoint(&self) -> Option<WaypointRef> {
        if self.mode != NavigationMode::Autonomous {
            return None;
        }
        let pattern = self.pattern.as_ref()?;
        let next = pattern.next_pending()?;
        pattern.waypoint_ref(next.index)
    }

    fn switch(&mut self, to: NavigationMode, reason: impl Into<String>) -> ModeChange {
        let change = ModeChange {
            from: self.mode,
            to,
            reason: reason.into(),
        };
        if change.from == NavigationMode::Autonomous {
            self.follower.reset();
        }
        self.mode = to;
        if to == NavigationMode::EmergencyStop {
            warn!(from = %change.from, reason = %change.reason, "navigation mode → EMERGENCY_STOP");
        } else {
            info!(from = %change.from, to = %to, reason = %change.reason, "navigation mode changed");
        }
        change
    }

    /// Request a mode change. Returns `Ok(None)` when already in `target`.
    pub fn request(
        &mut self,
        target: NavigationMode,
        safety: &SafetyInterlockManager,
        reason: &str,
    ) -> Result<Option<ModeChange>, TransitionError> {
        if target == self.mode {
            return Ok(None);
        }
        match (self.mode, target) {
            (_, NavigationMode::EmergencyStop) => {}
            (NavigationMode::EmergencyStop, _) => return Err(TransitionError::ResetRequired),
            (from, NavigationMode::Autonomous) => {
                if !matches!(from, NavigationMode::Idle | NavigationMode::Manual) {
                    return Err(TransitionError::Invalid { from, to: target });
                }
                Self::require_clear(safety)?;
                self.check_pattern(safety)?;
            }
            (from, NavigationMode::Calibration) => {
                if !matches!(from, NavigationMode::Idle | NavigationMode::Manual) {
                    return Err(TransitionError::Invalid { from, to: target });
                }
                Self::require_clear(safety)?;
            }
            (_, NavigationMode::Manual | NavigationMode::Idle) => {}
        }
        Ok(Some(self.switch(target, reason)))
    }

    fn require_clear(safety: &SafetyInterlockManager) -> Result<(), TransitionError> {
        if safety.is_clear() {
            Ok(())
        } else {
            Err(TransitionError::InterlocksActive(
                safety.active_set().into_iter().collect(),
            ))
        }
    }

    fn check_pattern(&self, safety: &SafetyInterlockManager) -> Result<(), TransitionError> {
        let pattern = self
            .pattern
            .as_ref()
            .filter(|p| !p.is_complete())
            .ok_or(TransitionError::NoPattern)?;
        match safety.geofence() {
            Some(fence) if fence.id() == pattern.geofence_id() => Ok(()),
            _ => Err(TransitionError::StalePattern {
                pattern: pattern.id(),
            }),
        }
    }

    /// Leave `EMERGENCY_STOP` for `IDLE` once every interlock has been
    /// acknowledged.
    pub fn reset(&mut self, safety: &SafetyInterlockManager) -> Result<ModeChange, TransitionError> {
        if self.mode != NavigationMode::EmergencyStop {
            return Err(TransitionError::Invalid {
                from: self.mode,
                to: NavigationMode::Idle,
            });
        }
        Self::require_clear(safety)?;
        Ok(self.switch(NavigationMode::Idle, "operator reset"))
    }

    /// Call after every safety evaluation: any active interlock forces
    /// `EMERGENCY_STOP`.
    pub fn on_safety(&mut self, safety: &SafetyInterlockManager) -> Option<ModeChange> {
        if self.mode == NavigationMode::EmergencyStop || !safety.has_active() {
            return None;
        }
        let names: Vec<&str> = safety.active_set().iter().map(|k| k.as_str()).collect();
        Some(self.switch(
            NavigationMode::EmergencyStop,
            format!("interlock active: {}", names.join(", ")),
        ))
    }

    /// Gate a command from `source` against the current mode and interlocks.
    pub fn submit(
        &self,
        command: MotionCommand,
        source: CommandSource,
        safety: &SafetyInterlockManager,
    ) -> Result<MotionCommand, CommandRejection> {
        self.gate
            .check(&command, source, self.mode, &safety.active_set())?;
        Ok(command)
    }

    /// One waypoint-following step while `AUTONOMOUS`.
    pub fn advance(
        &mut self,
        state: &RobotState,
        safety: &SafetyInterlockManager,
    ) -> NavigationStep {
        if self.mode != NavigationMode::Autonomous {
            return NavigationStep::Inactive;
        }
        let Some(pattern) = self.pattern.as_mut() else {
            let change = self.switch(NavigationMode::Idle, "no coverage pattern");
            return NavigationStep::Stalled {
                detail: "no coverage pattern".to_string(),
                change,
            };
        };

        match self.follower.step(pattern, state) {
            FollowStep::Drive(command) => match self.submit(command, CommandSource::Autonomy, safety) {
                Ok(command) => NavigationStep::Command(command),
                Err(rejection) => NavigationStep::Rejected(rejection),
            },
            FollowStep::NoFix => NavigationStep::Command(MotionCommand::Stop),
            FollowStep::Arrived { index } => match pattern.waypoint_ref(index) {
                Some(waypoint) => NavigationStep::Arrived(waypoint),
                None => NavigationStep::Command(MotionCommand::Stop),
            },
            FollowStep::Completed => {
                let id = pattern.id();
                let change = self.switch(NavigationMode::Idle, "coverage pattern completed");
                NavigationStep::Completed { pattern: id, change }
            }
            FollowStep::Stalled { detail, .. } => {
                let change = self.switch(NavigationMode::Idle, "waypoint stall");
                NavigationStep::Stalled { detail, change }
            }
        }
    }
}

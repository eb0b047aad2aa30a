//! `mower-kernel` – Safety & Orchestration
//!
//! The part of the mower core that decides whether anything may move. It
//! never plans; it enforces rules and holds the navigation mode.
//!
//! # Modules
//!
//! - [`limits`] – [`SafetyLimits`][limits::SafetyLimits]: the thresholds every
//!   interlock rule and speed cap reads.
//! - [`interlock`] – [`SafetyInterlockManager`][interlock::SafetyInterlockManager]:
//!   evaluates interlock rules against the fused
//!   [`RobotState`][mower_types::RobotState] and tracks the
//!   active → cleared-pending-ack → acknowledged lifecycle.
//! - [`gate`] – [`CommandGate`][gate::CommandGate]: the single check a
//!   [`MotionCommand`][mower_types::MotionCommand] passes before it reaches the
//!   drivers. Combines interlocks, mode admission and command rules in one
//!   call.
//! - [`navigation`] – [`NavigationModeManager`][navigation::NavigationModeManager]:
//!   MANUAL / AUTONOMOUS / CALIBRATION / EMERGENCY_STOP / IDLE state machine.
//! - [`follower`] – [`WaypointFollower`][follower::WaypointFollower]: turns the
//!   next pending coverage waypoint into drive commands.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: tracks heartbeats from
//!   drivers and core tasks so silent components raise `watchdog_timeout`.

pub mod follower;
pub mod gate;
pub mod interlock;
pub mod limits;
pub mod navigation;
pub mod watchdog;

pub use follower::{FollowStep, FollowerConfig, WaypointFollower};
pub use gate::{CommandGate, CommandRejection, CommandRule, RejectionReason, SpeedCapRule};
pub use interlock::{
    AckError, GeofenceRule, InterlockRecord, InterlockRule, InterlockTransition,
    SafetyInterlockManager,
};
pub use limits::SafetyLimits;
pub use navigation::{ModeChange, NavigationModeManager, NavigationStep, TransitionError};
pub use watchdog::{ComponentHealth, Watchdog};

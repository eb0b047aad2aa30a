//! `mower-types` – shared vocabulary of the mower control core.
//!
//! Every crate in the workspace speaks in terms of these types: the canonical
//! [`RobotState`] snapshot, raw [`SensorReading`]s produced by drivers,
//! [`MotionCommand`]s flowing toward the actuators, and the [`BusEvent`]
//! envelope that carries all of them across the message bus.
//!
//! # Modules
//!
//! - [`geometry`] – planar [`Point`] in the local metric frame.
//! - [`state`] – [`RobotState`], [`InterlockKind`], [`NavigationMode`].
//! - [`reading`] – [`SensorReading`] and its per-sensor payloads.
//! - [`command`] – [`MotionCommand`] and [`CommandSource`].
//! - [`driver`] – [`DriverState`] and [`DriverHealth`].
//! - [`job`] – [`ScheduledJob`] and its [`JobState`] lifecycle.
//! - [`event`] – [`BusEvent`], [`EventPayload`], [`DeliveryTier`] and the
//!   well-known topic names in [`topics`].

pub mod command;
pub mod driver;
pub mod event;
pub mod geometry;
pub mod job;
pub mod reading;
pub mod state;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::{CommandSource, MotionCommand};
pub use driver::{DriverHealth, DriverState};
pub use event::{BusEvent, DeliveryTier, EventPayload, topics};
pub use geometry::Point;
pub use job::{JobSpec, JobState, ScheduledJob};
pub use reading::{ReadingData, SensorChannel, SensorReading};
pub use state::{
    ActuatorEcho, InterlockKind, InterlockStatus, MotorState, NavigationMode, RobotState,
    WaypointRef,
};

/// Microseconds in one second.
pub const MICROS_PER_SEC: u64 = 1_000_000;

/// Current wall-clock time as microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

/// Error type shared across crate boundaries.
///
/// Serializable so it can be returned verbatim to the operator interface.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MowerError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Safety Blocked: {0}")]
    SafetyBlocked(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

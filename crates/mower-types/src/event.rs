//! Envelope for everything routed over the message bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::{CommandSource, MotionCommand};
use crate::driver::{DriverHealth, DriverState};
use crate::job::JobState;
use crate::reading::SensorReading;
use crate::state::{ActuatorEcho, InterlockKind, InterlockStatus, NavigationMode, RobotState};

/// Delivery class of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryTier {
    /// Retained for 24 h, acknowledged per consumer group, at-least-once.
    Critical,
    /// 1 h time-to-live, fire-and-forget, oldest dropped under backpressure.
    BestEffort,
}

/// Immutable event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: Uuid,
    /// Bus-wide publish sequence number; defines publish order.
    pub sequence: u64,
    /// Hierarchical `/`-separated topic, e.g. `sensors/imu/imu0`.
    pub topic: String,
    /// Publish time, microseconds since the Unix epoch.
    pub timestamp_us: u64,
    pub tier: DeliveryTier,
    pub payload: EventPayload,
}

/// Variants of data that can be routed over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Reading(SensorReading),
    State(Box<RobotState>),
    /// A gated command on its way to the actuators.
    Command {
        command: MotionCommand,
        source: CommandSource,
    },
    /// Actuator state after a driver applied a command.
    CommandEcho {
        driver_id: String,
        command: MotionCommand,
        echo: ActuatorEcho,
    },
    Interlock {
        kind: InterlockKind,
        status: InterlockStatus,
        detail: String,
    },
    ModeChanged {
        from: NavigationMode,
        to: NavigationMode,
        reason: String,
    },
    DriverLifecycle {
        driver_id: String,
        resource: String,
        state: DriverState,
        message: String,
    },
    DriverHealth {
        driver_id: String,
        health: DriverHealth,
    },
    Heartbeat {
        component: String,
    },
    Job {
        job_id: Uuid,
        state: JobState,
        detail: String,
    },
    LogBundle {
        bundle_id: Uuid,
        trigger: String,
    },
}

/// Well-known topic names.
pub mod topics {
    use crate::reading::SensorChannel;
    use crate::state::InterlockKind;

    pub const STATE: &str = "state/robot";
    pub const COMMANDS: &str = "actuators/command";
    pub const COMMAND_ECHO: &str = "actuators/echo";
    pub const NAVIGATION_MODE: &str = "navigation/mode";
    pub const LOG_BUNDLES: &str = "diagnostics/bundle";

    pub const ALL_SENSORS: &str = "sensors/#";
    pub const ALL_INTERLOCKS: &str = "safety/interlock/#";
    pub const ALL_DRIVERS: &str = "drivers/#";
    pub const ALL_HEARTBEATS: &str = "system/heartbeat/#";
    pub const ALL_JOBS: &str = "jobs/#";

    pub fn sensors(channel: SensorChannel) -> String {
        format!("sensors/{channel}/#")
    }

    pub fn interlock(kind: InterlockKind) -> String {
        format!("safety/interlock/{kind}")
    }

    pub fn driver_lifecycle(driver_id: &str) -> String {
        format!("drivers/{driver_id}/lifecycle")
    }

    pub fn driver_health(driver_id: &str) -> String {
        format!("drivers/{driver_id}/health")
    }

    pub fn heartbeat(component: &str) -> String {
        format!("system/heartbeat/{component}")
    }

    pub fn job(job_id: &uuid::Uuid) -> String {
        format!("jobs/{job_id}")
    }
}

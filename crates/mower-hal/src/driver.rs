//! The uniform lifecycle interface every hardware driver implements.
//!
//! Sensors, motor controllers and the e-stop button all look the same to the
//! [`DriverRegistry`][crate::registry::DriverRegistry]. Wire protocols
//! (NMEA, I²C registers, PWM timers) live entirely behind this trait, which
//! is also what lets simulation drivers stand in for real ones.

use std::time::Duration;

use async_trait::async_trait;
use mower_types::{ActuatorEcho, DriverHealth, MotionCommand, MowerError, ReadingData};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DriverError {
    /// Expected to go away on retry (bus glitch, checksum error, no fix yet).
    #[error("transient fault: {0}")]
    Transient(String),

    /// The device is unusable; the registry marks the driver failed at once.
    #[error("fatal fault: {0}")]
    Fatal(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("driver does not handle this command")]
    Unsupported,
}

impl DriverError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Fatal(_))
    }
}

impl From<DriverError> for MowerError {
    fn from(e: DriverError) -> Self {
        MowerError::HardwareFault {
            component: "driver".to_string(),
            details: e.to_string(),
        }
    }
}

/// A pluggable hardware driver.
///
/// Sensor drivers return readings from [`read`](Driver::read); actuator
/// drivers return `Ok(None)` there and handle commands in
/// [`apply`](Driver::apply).
#[async_trait]
pub trait Driver: Send {
    /// Open the device. Called once, before the first `read`.
    async fn initialize(&mut self) -> Result<(), DriverError>;

    /// Take one sample. `Ok(None)` means the driver has nothing to report.
    async fn read(&mut self) -> Result<Option<ReadingData>, DriverError>;

    /// `true` when this driver acts on `command`.
    fn accepts(&self, _command: &MotionCommand) -> bool {
        false
    }

    /// Apply a command and report the resulting actuator state.
    async fn apply(&mut self, _command: &MotionCommand) -> Result<ActuatorEcho, DriverError> {
        Err(DriverError::Unsupported)
    }

    async fn health_check(&mut self) -> Result<DriverHealth, DriverError>;

    /// Release the device. Actuators must leave their outputs de-energised.
    async fn shutdown(&mut self) -> Result<(), DriverError>;
}

//! `mower-hal` – hardware abstraction layer of the mower control core.
//!
//! Drivers implement one async [`Driver`] trait regardless of what they talk
//! to. The [`DriverRegistry`] owns them, enforces single-owner resource
//! claims, runs one poll task per driver and applies gated motion commands
//! coming off the bus.
//!
//! # Modules
//!
//! - [`driver`] – the [`Driver`] trait and [`DriverError`].
//! - [`config`] – [`HardwareConfig`], [`DriverConfig`], [`DriverKind`],
//!   [`DriverPolicy`].
//! - [`factory`] – [`DriverFactory`]: driver kind → constructor map.
//! - [`registry`] – [`DriverRegistry`], lifecycle and actuation.
//! - [`drive`] – differential-drive kinematics.
//! - [`pid`] – PID controller for heading steering.
//! - [`sim`] – simulation drivers sharing a [`SimWorld`].

pub mod config;
pub mod drive;
pub mod driver;
pub mod factory;
pub mod pid;
pub mod registry;
pub mod sim;

pub use config::{DriverConfig, DriverKind, DriverPolicy, HardwareConfig};
pub use drive::DifferentialDrive;
pub use driver::{Driver, DriverError};
pub use factory::DriverFactory;
pub use pid::{PidController, heading_error_deg};
pub use registry::{DriverInstance, DriverRegistry, RegistryError};
pub use sim::{SimWorld, SimWorldState};

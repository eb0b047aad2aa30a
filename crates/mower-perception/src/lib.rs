//! `mower-perception` – turns raw sensor readings into the canonical
//! [`RobotState`](mower_types::RobotState).
//!
//! # Modules
//!
//! - [`fusion`] – [`FusionEngine`]: buffers readings between ticks and folds
//!   them into a state snapshot (complementary heading filter, GPS/odometry
//!   position, staleness tracking).
//! - [`frame`] – [`LocalFrame`]: WGS84 ↔ local east/north metres.
//! - [`battery`] – [`BatteryModel`]: voltage → charge percent and remaining
//!   runtime.

pub mod battery;
pub mod frame;
pub mod fusion;

pub use battery::BatteryModel;
pub use frame::LocalFrame;
pub use fusion::{FusionConfig, FusionEngine, IngestOutcome, SafetyOverlay};

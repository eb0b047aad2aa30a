//! `mower-planner` – where the mower is allowed to go and how it covers it.
//!
//! # Modules
//!
//! - [`geofence`] – [`Geofence`]: validated simple polygon with an outward
//!   buffer tolerance; containment and scanline clipping.
//! - [`coverage`] – [`CoveragePlanner`]: turns a geofence and cutting
//!   geometry into an ordered, immutable [`CoveragePattern`].

pub mod coverage;
pub mod geofence;

pub use coverage::{
    CoveragePattern, CoveragePlanner, MIN_SPACING_M, NavigationWaypoint, PlannerConfig,
    PlanningError, WaypointKind,
};
pub use geofence::{Geofence, GeofenceError, GeofenceSpec};

//! `mower-runtime` – Control Loop, Scheduling & Operator API
//!
//! Everything that runs on a clock. The lower crates provide pure state
//! machines; this crate gives them a task, a timer and a front door.
//!
//! # Modules
//!
//! - [`control`] – [`ControlLoop`][control::ControlLoop]: the single task that
//!   owns fusion, interlocks, the navigation mode and the job scheduler, and
//!   publishes one [`RobotState`][mower_types::RobotState] per fusion tick.
//!   [`ControlHandle`][control::ControlHandle] is the cloneable request
//!   channel into it.
//! - [`scheduler`] – [`JobScheduler`][scheduler::JobScheduler]: mowing job
//!   lifecycle, pre-start gate (interlocks, mode, battery, weather), retries
//!   with backoff and SQLite persistence.
//! - [`cron`] – [`CronSchedule`][cron::CronSchedule]: five-field expressions
//!   and a pure next-fire-time calculator.
//! - [`weather`] – [`WeatherGate`][weather::WeatherGate] and the HTTP
//!   [`ForecastProvider`][weather::ForecastProvider], with on-board sensor
//!   fallback when the forecast is stale.
//! - [`diagnostics`] – [`DiagnosticsBundler`][diagnostics::DiagnosticsBundler]:
//!   freezes recent state and events into incident bundles.
//! - [`api`] – [`ControlApi`][api::ControlApi]: status, manual control,
//!   geofence and job CRUD, driver health, bundles and the state stream,
//!   with an error taxonomy that maps onto HTTP status codes.
//! - [`boot`] – [`MowerCore`][boot::MowerCore]: boots and shuts down the
//!   whole stack.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter. Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.

pub mod api;
pub mod boot;
pub mod control;
pub mod cron;
pub mod diagnostics;
pub mod scheduler;
pub mod telemetry;
pub mod weather;

pub use api::{ApiConfig, ApiError, ControlApi, DriverReport, ErrorBody};
pub use boot::{CoreConfig, CoreError, ForecastSource, MowerCore, StorageConfig};
pub use control::{
    ControlConfig, ControlError, ControlHandle, ControlLoop, GeofenceInfo, PatternSummary,
    StatusReport,
};
pub use cron::{CronError, CronSchedule};
pub use diagnostics::{ArchiveHandle, DiagnosticsBundler, DiagnosticsConfig, DiagnosticsError};
pub use scheduler::{JobScheduler, SchedulerConfig, SchedulerError};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use weather::{Forecast, ForecastProvider, HttpForecastProvider, WeatherGate, WeatherThresholds};

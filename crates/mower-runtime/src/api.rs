//! Operator-facing request/response surface.
//!
//! [`ControlApi`] is transport-agnostic: every method returns either a
//! serialisable value or an [`ApiError`] whose [`status_code`](ApiError::status_code)
//! follows the HTTP taxonomy (400 invalid input, 403 safety-blocked, 404
//! unknown id, 409 state conflict, 429 rate-limited). A transport layer maps
//! the two onto its own wire format.
//!
//! Motion and mode requests share one token bucket. Stop and emergency-stop
//! requests bypass it.

use std::num::NonZeroU32;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use mower_hal::{DriverInstance, DriverRegistry, RegistryError};
use mower_memory::{ArchiveError, BundleSummary, LogBundle};
use mower_planner::GeofenceSpec;
use mower_types::{
    DriverHealth, InterlockKind, JobSpec, MotionCommand, NavigationMode, RobotState, ScheduledJob,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::control::{ControlError, ControlHandle, GeofenceInfo, StatusReport};
use crate::diagnostics::{ArchiveHandle, DiagnosticsError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ApiConfig {
    /// Sustained rate for motion and mode requests.
    pub commands_per_second: u32,
    pub burst: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            commands_per_second: 10,
            burst: 20,
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    #[error("too many requests, slow down")]
    RateLimited,
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Control(e) => e.status_code(),
            ApiError::Registry(RegistryError::UnknownDriver(_)) => 404,
            ApiError::Registry(_) => 500,
            ApiError::Diagnostics(DiagnosticsError::Archive(ArchiveError::NotFound(_))) => 404,
            ApiError::Diagnostics(_) => 500,
            ApiError::RateLimited => 429,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            status: self.status_code(),
            error: self.to_string(),
        }
    }
}

/// Wire shape of an error response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverReport {
    #[serde(flatten)]
    pub instance: DriverInstance,
    /// Fresh health-check result.
    pub checked: DriverHealth,
}

pub struct ControlApi {
    control: ControlHandle,
    registry: Arc<DriverRegistry>,
    archive: ArchiveHandle,
    limiter: DefaultDirectRateLimiter,
}

impl ControlApi {
    pub fn new(
        control: ControlHandle,
        registry: Arc<DriverRegistry>,
        archive: ArchiveHandle,
        config: ApiConfig,
    ) -> Self {
        let rate = NonZeroU32::new(config.commands_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(rate);
        Self {
            control,
            registry,
            archive,
            limiter: RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
        }
    }

    fn throttle(&self) -> Result<(), ApiError> {
        self.limiter.check().map_err(|_| {
            warn!("command rate limit hit");
            ApiError::RateLimited
        })
    }

    // ── State ───────────────────────────────────────────────────────────────

    pub async fn status(&self) -> Result<StatusReport, ApiError> {
        Ok(self.control.status().await?)
    }

    pub fn state(&self) -> Arc<RobotState> {
        self.control.state()
    }

    /// Every fused snapshot from now on. A slow consumer skips intermediate
    /// snapshots but always sees the latest.
    pub fn state_stream(&self) -> BoxStream<'static, Arc<RobotState>> {
        self.control.state_reader().into_stream()
    }

    // ── Motion ──────────────────────────────────────────────────────────────

    pub async fn drive(&self, linear_mps: f32, angular_rps: f32) -> Result<(), ApiError> {
        if !linear_mps.is_finite() || !angular_rps.is_finite() {
            return Err(ApiError::BadRequest("speeds must be finite".to_string()));
        }
        self.throttle()?;
        Ok(self
            .control
            .command(MotionCommand::Drive {
                linear_mps,
                angular_rps,
            })
            .await?)
    }

    pub async fn blade(&self, enabled: bool) -> Result<(), ApiError> {
        self.throttle()?;
        Ok(self.control.command(MotionCommand::Blade { enabled }).await?)
    }

    pub async fn stop(&self) -> Result<(), ApiError> {
        Ok(self.control.command(MotionCommand::Stop).await?)
    }

    pub async fn set_mode(&self, mode: NavigationMode) -> Result<NavigationMode, ApiError> {
        self.throttle()?;
        Ok(self.control.set_mode(mode).await?)
    }

    /// [`set_mode`](Self::set_mode) from a mode name such as `manual`.
    pub async fn set_mode_named(&self, name: &str) -> Result<NavigationMode, ApiError> {
        let mode = name.parse().map_err(ApiError::BadRequest)?;
        self.set_mode(mode).await
    }

    pub async fn reset(&self) -> Result<(), ApiError> {
        Ok(self.control.reset().await?)
    }

    pub async fn emergency_stop(&self, reason: &str) -> Result<(), ApiError> {
        Ok(self.control.emergency_stop(reason).await?)
    }

    pub async fn acknowledge(&self, kind: InterlockKind) -> Result<(), ApiError> {
        Ok(self.control.acknowledge(kind).await?)
    }

    pub async fn acknowledge_named(&self, name: &str) -> Result<(), ApiError> {
        let kind = name.parse().map_err(ApiError::BadRequest)?;
        self.acknowledge(kind).await
    }

    // ── Geofence ────────────────────────────────────────────────────────────

    pub async fn geofence(&self) -> Result<Option<GeofenceInfo>, ApiError> {
        Ok(self.control.geofence().await?)
    }

    pub async fn set_geofence(&self, spec: GeofenceSpec) -> Result<GeofenceInfo, ApiError> {
        Ok(self.control.set_geofence(spec).await?)
    }

    pub async fn clear_geofence(&self) -> Result<(), ApiError> {
        Ok(self.control.clear_geofence().await?)
    }

    // ── Jobs ────────────────────────────────────────────────────────────────

    pub async fn jobs(&self) -> Result<Vec<ScheduledJob>, ApiError> {
        Ok(self.control.jobs().await?)
    }

    pub async fn job(&self, id: Uuid) -> Result<ScheduledJob, ApiError> {
        Ok(self.control.job(id).await?)
    }

    pub async fn create_job(&self, spec: JobSpec) -> Result<ScheduledJob, ApiError> {
        Ok(self.control.create_job(spec).await?)
    }

    pub async fn update_job(&self, id: Uuid, spec: JobSpec) -> Result<ScheduledJob, ApiError> {
        Ok(self.control.update_job(id, spec).await?)
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<ScheduledJob, ApiError> {
        Ok(self.control.delete_job(id).await?)
    }

    pub async fn start_job(&self, id: Uuid) -> Result<ScheduledJob, ApiError> {
        Ok(self.control.start_job(id).await?)
    }

    pub async fn cancel_job(&self, id: Uuid) -> Result<ScheduledJob, ApiError> {
        Ok(self.control.cancel_job(id).await?)
    }

    // ── Drivers ─────────────────────────────────────────────────────────────

    pub fn drivers(&self) -> Vec<DriverInstance> {
        self.registry.instances()
    }

    pub async fn driver_health(&self, id: &str) -> Result<DriverReport, ApiError> {
        let checked = self.registry.health_check(id).await?;
        Ok(DriverReport {
            instance: self.registry.instance(id)?,
            checked,
        })
    }

    // ── Diagnostics ─────────────────────────────────────────────────────────

    pub async fn request_bundle(&self, note: &str) -> Result<BundleSummary, ApiError> {
        Ok(self.control.request_bundle(note).await?)
    }

    pub async fn bundles(&self) -> Result<Vec<BundleSummary>, ApiError> {
        Ok(self.archive.list().await?)
    }

    pub async fn bundle(&self, id: Uuid) -> Result<LogBundle, ApiError> {
        Ok(self.archive.get(id).await?)
    }
}

//! Boot and shutdown of the whole control core.
//!
//! [`MowerCore::start`] wires the pieces together in dependency order:
//! storage, bus (replaying the critical journal), driver registration, the
//! control loop, actuation, driver start-up and finally the background
//! refresh tasks. Any failure before the drivers start leaves no hardware
//! touched.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mower_hal::{DriverFactory, DriverRegistry, HardwareConfig, RegistryError};
use mower_memory::{
    ArchiveError, DEFAULT_ARCHIVE_CAP_BYTES, EventJournal, IncidentArchive, JobStore, JobStoreError,
    JournalError,
};
use mower_middleware::{BusConfig, BusError, MessageBus};
use mower_types::MowerError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api::{ApiConfig, ControlApi};
use crate::control::{ControlConfig, ControlError, ControlHandle, ControlLoop};
use crate::diagnostics::{ArchiveHandle, spawn_retention};
use crate::scheduler::{JobScheduler, SchedulerConfig, SchedulerError};
use crate::weather::{HttpForecastProvider, spawn_refresh};

const RETENTION_SWEEP: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the journal, archive and job databases. Without one
    /// everything is kept in memory.
    pub data_dir: Option<PathBuf>,
    pub archive_cap_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            archive_cap_bytes: DEFAULT_ARCHIVE_CAP_BYTES,
        }
    }
}

#[derive(Clone)]
pub struct ForecastSource {
    pub url: String,
    pub api_key: Option<String>,
    pub refresh: Duration,
}

impl std::fmt::Debug for ForecastSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForecastSource")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("refresh", &self.refresh)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub control: ControlConfig,
    pub hardware: HardwareConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub bus: BusConfig,
    pub forecast: Option<ForecastSource>,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] MowerError),
    #[error("driver registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("message bus: {0}")]
    Bus(#[from] BusError),
    #[error("event journal: {0}")]
    Journal(#[from] JournalError),
    #[error("incident archive: {0}")]
    Archive(#[from] ArchiveError),
    #[error("job store: {0}")]
    JobStore(#[from] JobStoreError),
    #[error("scheduler: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("control loop: {0}")]
    Control(#[from] ControlError),
    #[error("storage: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreConfig {
    /// Configuration errors refuse startup.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.control.validate()?;
        self.hardware.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

pub struct MowerCore {
    bus: MessageBus,
    registry: Arc<DriverRegistry>,
    control: ControlHandle,
    api: Arc<ControlApi>,
    control_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl MowerCore {
    pub async fn start(config: CoreConfig, factory: DriverFactory) -> Result<Self, CoreError> {
        config.validate()?;
        let CoreConfig {
            mut control,
            hardware,
            scheduler,
            storage,
            api,
            bus,
            forecast,
        } = config;

        if let Some(dir) = &storage.data_dir {
            std::fs::create_dir_all(dir)?;
        }
        let db = |name: &str| storage.data_dir.as_ref().map(|d| d.join(name));

        let bus = match db("journal.db") {
            Some(path) => MessageBus::with_journal(bus, Box::new(EventJournal::open(path)?))?,
            None => MessageBus::new(bus),
        };
        let archive = ArchiveHandle::new(match db("archive.db") {
            Some(path) => IncidentArchive::open(path, storage.archive_cap_bytes)?,
            None => IncidentArchive::open_in_memory(storage.archive_cap_bytes)?,
        });
        let scheduler = match db("jobs.db") {
            Some(path) => JobScheduler::with_store(scheduler, bus.clone(), JobStore::open(path)?, Utc::now())?,
            None => JobScheduler::new(scheduler, bus.clone()),
        };

        let registry = Arc::new(DriverRegistry::new(bus.clone(), factory, hardware.policy.clone()));
        registry.register_all(&hardware)?;

        if control.watched_components.is_empty() {
            // A slow sensor gets two poll periods before it counts as silent.
            let floor = control.safety.watchdog_timeout();
            control.watched_components = hardware
                .drivers
                .iter()
                .filter(|d| !d.kind.is_actuator())
                .map(|d| (d.id.clone(), floor.max(d.poll_interval() * 2)))
                .collect();
        }
        let (forecast_tx, forecast_rx) = mpsc::channel(4);
        let (handle, control_task) =
            ControlLoop::new(bus.clone(), control, scheduler, archive.clone())?.spawn(forecast_rx)?;

        let mut background = vec![registry.spawn_actuation()?];
        if let Err(e) = registry.start_all().await {
            error!(error = %e, "driver start-up failed");
            handle.shutdown().await;
            registry.shutdown().await;
            for task in background {
                task.abort();
            }
            return Err(e.into());
        }

        if let Some(source) = forecast {
            info!(url = %source.url, refresh_s = source.refresh.as_secs(), "weather forecast enabled");
            let provider = Arc::new(HttpForecastProvider::new(source.url, source.api_key));
            background.push(spawn_refresh(provider, source.refresh, forecast_tx));
        }
        background.push(spawn_retention(archive.clone(), RETENTION_SWEEP));

        let api = Arc::new(ControlApi::new(handle.clone(), Arc::clone(&registry), archive, api));
        info!(drivers = registry.ids().len(), "mower core started");
        Ok(Self {
            bus,
            registry,
            control: handle,
            api,
            control_task,
            background,
        })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    pub fn api(&self) -> Arc<ControlApi> {
        Arc::clone(&self.api)
    }

    /// Stop the motors, the control loop and every driver, in that order.
    pub async fn shutdown(self) {
        info!("mower core shutting down");
        self.control.shutdown().await;
        if let Err(e) = self.control_task.await {
            error!(error = %e, "control loop task failed");
        }
        self.registry.shutdown().await;
        for task in self.background {
            task.abort();
        }
        info!("mower core stopped");
    }
}

//! Incident log bundling.
//!
//! The [`DiagnosticsBundler`] lives inside the control loop and keeps a
//! rolling window of recent fused states and bus events. When an interlock
//! fires, a job fails for good, or the operator asks, the window is frozen
//! into a [`LogBundle`] and written to the [`IncidentArchive`] on the blocking
//! pool so SQLite I/O never stalls a fusion tick.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mower_memory::{ArchiveError, BundleSummary, BundleTrigger, IncidentArchive, LogBundle};
use mower_middleware::{BusError, MessageBus};
use mower_types::{BusEvent, DriverHealth, EventPayload, RobotState, topics};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("archive task failed: {0}")]
    Task(String),
}

/// How much history each bundle carries.
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsConfig {
    /// 30 s at the default 5 Hz fusion rate.
    pub state_history: usize,
    pub event_history: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            state_history: 150,
            event_history: 500,
        }
    }
}

/// Shared handle to the archive; readers (API listing) lock it briefly.
#[derive(Clone)]
pub struct ArchiveHandle(Arc<Mutex<IncidentArchive>>);

impl ArchiveHandle {
    pub fn new(archive: IncidentArchive) -> Self {
        Self(Arc::new(Mutex::new(archive)))
    }

    fn lock(&self) -> MutexGuard<'_, IncidentArchive> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run<T: Send + 'static>(
        &self,
        f: impl FnOnce(&IncidentArchive) -> Result<T, ArchiveError> + Send + 'static,
    ) -> Result<T, DiagnosticsError> {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || f(&*handle.lock()))
            .await
            .map_err(|e| DiagnosticsError::Task(e.to_string()))?
            .map_err(DiagnosticsError::from)
    }

    pub async fn list(&self) -> Result<Vec<BundleSummary>, DiagnosticsError> {
        self.run(|a| a.list()).await
    }

    pub async fn get(&self, id: Uuid) -> Result<LogBundle, DiagnosticsError> {
        self.run(move |a| a.get(id)).await
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, DiagnosticsError> {
        self.run(move |a| a.sweep(now)).await
    }
}

/// Apply the retention policy every `every`, starting after the first
/// period.
pub fn spawn_retention(archive: ArchiveHandle, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        loop {
            ticker.tick().await;
            match archive.sweep(Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "expired incident bundles removed"),
                Err(e) => warn!(error = %e, "incident retention sweep failed"),
            }
        }
    })
}

pub struct DiagnosticsBundler {
    archive: ArchiveHandle,
    bus: MessageBus,
    config: DiagnosticsConfig,
    states: VecDeque<RobotState>,
    events: VecDeque<BusEvent>,
    driver_health: BTreeMap<String, DriverHealth>,
}

impl DiagnosticsBundler {
    pub fn new(archive: ArchiveHandle, bus: MessageBus, config: DiagnosticsConfig) -> Self {
        Self {
            archive,
            bus,
            config,
            states: VecDeque::with_capacity(config.state_history),
            events: VecDeque::with_capacity(config.event_history),
            driver_health: BTreeMap::new(),
        }
    }

    pub fn archive(&self) -> &ArchiveHandle {
        &self.archive
    }

    pub fn record_state(&mut self, state: &RobotState) {
        if self.states.len() == self.config.state_history {
            self.states.pop_front();
        }
        self.states.push_back(state.clone());
    }

    pub fn record_event(&mut self, event: &BusEvent) {
        if let EventPayload::DriverHealth { driver_id, health } = &event.payload {
            self.driver_health.insert(driver_id.clone(), *health);
        }
        if self.events.len() == self.config.event_history {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
    }

    /// Freeze the current window into a bundle without storing it.
    pub fn snapshot(&self, trigger: BundleTrigger) -> LogBundle {
        let mut bundle = LogBundle::new(trigger);
        bundle.states = self.states.iter().cloned().collect();
        bundle.events = self.events.iter().cloned().collect();
        bundle.driver_health = self.driver_health.clone();
        bundle
    }

    /// Snapshot now, archive and announce in the background.
    ///
    /// The returned handle resolves once the bundle is stored and the
    /// critical `diagnostics/bundle` event is published. Dropping it is fine;
    /// failures are logged either way.
    pub fn bundle(
        &self,
        trigger: BundleTrigger,
    ) -> JoinHandle<Result<BundleSummary, DiagnosticsError>> {
        let bundle = self.snapshot(trigger);
        let archive = self.archive.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let label = bundle.trigger.label();
            let result: Result<BundleSummary, DiagnosticsError> = async {
                let summary = archive.run(move |a| a.store(bundle)).await?;
                bus.publish_critical(
                    topics::LOG_BUNDLES,
                    EventPayload::LogBundle {
                        bundle_id: summary.id,
                        trigger: summary.trigger.clone(),
                    },
                )?;
                Ok(summary)
            }
            .await;
            match &result {
                Ok(summary) => info!(bundle = %summary.id, trigger = %label, "incident bundle created"),
                Err(e) => error!(error = %e, trigger = %label, "incident bundle failed"),
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mower_memory::DEFAULT_ARCHIVE_CAP_BYTES;
    use mower_types::{DeliveryTier, InterlockKind};

    fn bundler(config: DiagnosticsConfig) -> (DiagnosticsBundler, MessageBus) {
        let bus = MessageBus::default();
        let archive =
            ArchiveHandle::new(IncidentArchive::open_in_memory(DEFAULT_ARCHIVE_CAP_BYTES).unwrap());
        (DiagnosticsBundler::new(archive, bus.clone(), config), bus)
    }

    fn health_event(seq: u64, driver: &str, health: DriverHealth) -> BusEvent {
        BusEvent {
            id: Uuid::new_v4(),
            sequence: seq,
            topic: topics::driver_health(driver),
            timestamp_us: seq,
            tier: DeliveryTier::BestEffort,
            payload: EventPayload::DriverHealth {
                driver_id: driver.to_string(),
                health,
            },
        }
    }

    #[test]
    fn windows_are_bounded() {
        let (mut b, _bus) = bundler(DiagnosticsConfig {
            state_history: 3,
            event_history: 2,
        });
        for ts in 1..=5 {
            b.record_state(&RobotState {
                timestamp_us: ts,
                ..RobotState::default()
            });
            b.record_event(&health_event(ts, "imu0", DriverHealth::Healthy));
        }
        b.record_event(&health_event(6, "gps0", DriverHealth::Degraded));

        let bundle = b.snapshot(BundleTrigger::Operator {
            note: "check".to_string(),
        });
        let ts: Vec<u64> = bundle.states.iter().map(|s| s.timestamp_us).collect();
        assert_eq!(ts, vec![3, 4, 5]);
        assert_eq!(bundle.events.len(), 2);
        assert_eq!(bundle.driver_health["gps0"], DriverHealth::Degraded);
        assert_eq!(bundle.driver_health["imu0"], DriverHealth::Healthy);
    }

    #[tokio::test]
    async fn bundle_is_archived_and_announced() {
        let (mut b, bus) = bundler(DiagnosticsConfig::default());
        let mut consumer = bus.subscribe_critical("test", topics::LOG_BUNDLES).unwrap();
        b.record_state(&RobotState::default());

        let summary = b
            .bundle(BundleTrigger::Interlock {
                interlock: InterlockKind::TiltDetected,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.trigger, "interlock:tilt_detected");
        assert!(!summary.retained);

        let event = consumer.recv().await.unwrap();
        assert_eq!(
            event.payload,
            EventPayload::LogBundle {
                bundle_id: summary.id,
                trigger: summary.trigger.clone(),
            }
        );

        let stored = b.archive().get(summary.id).await.unwrap();
        assert_eq!(stored.states.len(), 1);
        assert_eq!(b.archive().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_keeps_operator_bundles() {
        let (b, _bus) = bundler(DiagnosticsConfig::default());
        b.bundle(BundleTrigger::Operator {
            note: "keep".to_string(),
        })
        .await
        .unwrap()
        .unwrap();
        b.bundle(BundleTrigger::JobFailed { job_id: Uuid::new_v4() })
            .await
            .unwrap()
            .unwrap();

        let later = Utc::now() + chrono::Duration::days(8);
        assert_eq!(b.archive().sweep(later).await.unwrap(), 1);
        let left = b.archive().list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert!(left[0].retained);
    }
}

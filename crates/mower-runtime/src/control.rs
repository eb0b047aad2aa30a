//! The control loop: a single task that owns every piece of mutable robot
//! state and advances it on a fixed fusion tick.
//!
//! Sensor readings, actuator echoes, heartbeats and driver events arrive
//! over the bus; operator requests arrive over an mpsc channel from any
//! number of [`ControlHandle`]s. Nothing outside this task touches the
//! fusion engine, the interlock manager, the navigation mode manager or the
//! job scheduler, so no locks are needed around them.
//!
//! One tick:
//!
//! 1. fuse buffered readings into a draft [`RobotState`],
//! 2. evaluate interlocks on the draft and force `EMERGENCY_STOP` if any is
//!    active,
//! 3. take one waypoint-following step while `AUTONOMOUS`,
//! 4. commit the safety overlay and publish the snapshot.
//!
//! An emergency-stop or tilt reading is screened the moment it arrives and
//! triggers an immediate out-of-band tick, so the motors are told to stop
//! without waiting for the next period.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::{BoxStream, select_all};
use mower_kernel::{
    AckError, CommandRejection, FollowerConfig, InterlockRecord, InterlockTransition, ModeChange,
    NavigationModeManager, NavigationStep, RejectionReason, SafetyInterlockManager, SafetyLimits,
    TransitionError, Watchdog,
};
use mower_memory::{BundleSummary, BundleTrigger};
use mower_middleware::{BusError, CriticalConsumer, MessageBus, StatePublisher, StateReader, state_channel};
use mower_perception::{FusionConfig, FusionEngine, IngestOutcome, SafetyOverlay};
use mower_planner::{CoveragePlanner, Geofence, GeofenceError, GeofenceSpec, PlannerConfig, PlanningError};
use mower_types::{
    BusEvent, CommandSource, DeliveryTier, EventPayload, InterlockKind, InterlockStatus, JobSpec,
    JobState, MotionCommand, MowerError, NavigationMode, ReadingData, RobotState, ScheduledJob,
    SensorReading, now_us, topics,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::diagnostics::{ArchiveHandle, DiagnosticsBundler, DiagnosticsConfig, DiagnosticsError};
use crate::scheduler::{FailureOutcome, JobScheduler, SchedulerAction, SchedulerError, StartConditions};
use crate::weather::{Forecast, WeatherGate, WeatherThresholds};

/// Consumer group the loop uses for critical sensor events.
const CONTROL_GROUP: &str = "control";
const REQUEST_QUEUE: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Fusion and safety evaluation rate, 1 to 10 Hz.
    pub fusion_hz: u32,
    pub scheduler_interval: Duration,
    pub safety: SafetyLimits,
    pub fusion: FusionConfig,
    pub follower: FollowerConfig,
    pub planner: PlannerConfig,
    pub forecast_thresholds: WeatherThresholds,
    pub sensor_thresholds: WeatherThresholds,
    pub diagnostics: DiagnosticsConfig,
    /// Components the watchdog expects heartbeats from, usually the sensor
    /// driver ids, with the silence each one may go through.
    pub watched_components: Vec<(String, Duration)>,
    pub geofence: Option<Geofence>,
    /// Wall clock for job scheduling, backoff and forecast age.
    pub clock: fn() -> DateTime<Utc>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            fusion_hz: 5,
            scheduler_interval: Duration::from_secs(1),
            safety: SafetyLimits::default(),
            fusion: FusionConfig::default(),
            follower: FollowerConfig::default(),
            planner: PlannerConfig::default(),
            forecast_thresholds: WeatherThresholds::default(),
            sensor_thresholds: WeatherThresholds::default(),
            diagnostics: DiagnosticsConfig::default(),
            watched_components: Vec::new(),
            geofence: None,
            clock: Utc::now,
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), MowerError> {
        if !(1..=10).contains(&self.fusion_hz) {
            return Err(MowerError::Config(format!(
                "fusion_hz must be within 1..=10, got {}",
                self.fusion_hz
            )));
        }
        if self.scheduler_interval.is_zero() {
            return Err(MowerError::Config("scheduler interval must be positive".to_string()));
        }
        self.safety.validate()
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.fusion_hz.max(1)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("command rejected: {0}")]
    Rejected(#[from] CommandRejection),
    #[error("mode change refused: {0}")]
    Transition(#[from] TransitionError),
    #[error("acknowledge failed: {0}")]
    Acknowledge(#[from] AckError),
    #[error("invalid geofence: {0}")]
    Geofence(#[from] GeofenceError),
    #[error("planning failed: {0}")]
    Planning(#[from] PlanningError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] MowerError),
    #[error("control loop is not running")]
    Stopped,
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests and reports
// ─────────────────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, ControlError>>;

/// Operator requests, each carrying its reply channel.
pub enum ControlRequest {
    Status(Reply<StatusReport>),
    Command {
        command: MotionCommand,
        reply: Reply<()>,
    },
    SetMode {
        mode: NavigationMode,
        reply: Reply<NavigationMode>,
    },
    Reset(Reply<()>),
    Acknowledge {
        kind: InterlockKind,
        reply: Reply<()>,
    },
    EmergencyStop {
        reason: String,
        reply: Reply<()>,
    },
    Geofence(Reply<Option<GeofenceInfo>>),
    SetGeofence {
        spec: GeofenceSpec,
        reply: Reply<GeofenceInfo>,
    },
    ClearGeofence(Reply<()>),
    Jobs(Reply<Vec<ScheduledJob>>),
    Job {
        id: Uuid,
        reply: Reply<ScheduledJob>,
    },
    CreateJob {
        spec: JobSpec,
        reply: Reply<ScheduledJob>,
    },
    UpdateJob {
        id: Uuid,
        spec: JobSpec,
        reply: Reply<ScheduledJob>,
    },
    DeleteJob {
        id: Uuid,
        reply: Reply<ScheduledJob>,
    },
    StartJob {
        id: Uuid,
        reply: Reply<ScheduledJob>,
    },
    CancelJob {
        id: Uuid,
        reply: Reply<ScheduledJob>,
    },
    RequestBundle {
        note: String,
        reply: Reply<BundleSummary>,
    },
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Serialize)]
pub struct GeofenceInfo {
    pub id: Uuid,
    pub area_m2: f64,
    #[serde(flatten)]
    pub spec: GeofenceSpec,
}

impl From<&Geofence> for GeofenceInfo {
    fn from(fence: &Geofence) -> Self {
        Self {
            id: fence.id(),
            area_m2: fence.area(),
            spec: fence.to_spec(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PatternSummary {
    pub id: Uuid,
    pub geofence_id: Uuid,
    pub waypoints: usize,
    pub completed: usize,
    pub path_length_m: f64,
    pub estimated_duration_s: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: RobotState,
    pub interlocks: Vec<InterlockRecord>,
    pub active_job: Option<ScheduledJob>,
    pub pattern: Option<PatternSummary>,
    pub forecast: Option<Forecast>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap, cloneable front door to a running [`ControlLoop`].
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
    state: StateReader,
}

impl ControlHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> ControlRequest,
    ) -> Result<T, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ControlError::Stopped)?;
        rx.await.map_err(|_| ControlError::Stopped)?
    }

    /// Latest fused snapshot, without a round trip through the loop.
    pub fn state(&self) -> std::sync::Arc<RobotState> {
        self.state.latest()
    }

    pub fn state_reader(&self) -> StateReader {
        self.state.clone()
    }

    pub async fn status(&self) -> Result<StatusReport, ControlError> {
        self.call(ControlRequest::Status).await
    }

    pub async fn command(&self, command: MotionCommand) -> Result<(), ControlError> {
        self.call(|reply| ControlRequest::Command { command, reply }).await
    }

    pub async fn set_mode(&self, mode: NavigationMode) -> Result<NavigationMode, ControlError> {
        self.call(|reply| ControlRequest::SetMode { mode, reply }).await
    }

    pub async fn reset(&self) -> Result<(), ControlError> {
        self.call(ControlRequest::Reset).await
    }

    pub async fn acknowledge(&self, kind: InterlockKind) -> Result<(), ControlError> {
        self.call(|reply| ControlRequest::Acknowledge { kind, reply }).await
    }

    pub async fn emergency_stop(&self, reason: impl Into<String>) -> Result<(), ControlError> {
        let reason = reason.into();
        self.call(|reply| ControlRequest::EmergencyStop { reason, reply }).await
    }

    pub async fn geofence(&self) -> Result<Option<GeofenceInfo>, ControlError> {
        self.call(ControlRequest::Geofence).await
    }

    pub async fn set_geofence(&self, spec: GeofenceSpec) -> Result<GeofenceInfo, ControlError> {
        self.call(|reply| ControlRequest::SetGeofence { spec, reply }).await
    }

    pub async fn clear_geofence(&self) -> Result<(), ControlError> {
        self.call(ControlRequest::ClearGeofence).await
    }

    pub async fn jobs(&self) -> Result<Vec<ScheduledJob>, ControlError> {
        self.call(ControlRequest::Jobs).await
    }

    pub async fn job(&self, id: Uuid) -> Result<ScheduledJob, ControlError> {
        self.call(|reply| ControlRequest::Job { id, reply }).await
    }

    pub async fn create_job(&self, spec: JobSpec) -> Result<ScheduledJob, ControlError> {
        self.call(|reply| ControlRequest::CreateJob { spec, reply }).await
    }

    pub async fn update_job(&self, id: Uuid, spec: JobSpec) -> Result<ScheduledJob, ControlError> {
        self.call(|reply| ControlRequest::UpdateJob { id, spec, reply }).await
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<ScheduledJob, ControlError> {
        self.call(|reply| ControlRequest::DeleteJob { id, reply }).await
    }

    pub async fn start_job(&self, id: Uuid) -> Result<ScheduledJob, ControlError> {
        self.call(|reply| ControlRequest::StartJob { id, reply }).await
    }

    pub async fn cancel_job(&self, id: Uuid) -> Result<ScheduledJob, ControlError> {
        self.call(|reply| ControlRequest::CancelJob { id, reply }).await
    }

    pub async fn request_bundle(&self, note: impl Into<String>) -> Result<BundleSummary, ControlError> {
        let note = note.into();
        self.call(|reply| ControlRequest::RequestBundle { note, reply }).await
    }

    /// Stop the motors and end the loop. Resolves once the loop has exited.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ControlRequest::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlLoop
// ─────────────────────────────────────────────────────────────────────────────

/// Bus and channel inputs, kept apart from the loop state so `select!` can
/// borrow them while handlers borrow the loop mutably.
struct Inputs {
    sensors: mower_middleware::Subscription,
    critical_sensors: CriticalConsumer,
    events: BoxStream<'static, BusEvent>,
    requests: mpsc::Receiver<ControlRequest>,
    forecasts: mpsc::Receiver<Forecast>,
}

pub struct ControlLoop {
    bus: MessageBus,
    config: ControlConfig,
    fusion: FusionEngine,
    safety: SafetyInterlockManager,
    nav: NavigationModeManager,
    watchdog: Watchdog,
    scheduler: JobScheduler,
    planner: CoveragePlanner,
    weather: WeatherGate,
    bundler: DiagnosticsBundler,
    publisher: StatePublisher,
}

impl ControlLoop {
    pub fn new(
        bus: MessageBus,
        config: ControlConfig,
        scheduler: JobScheduler,
        archive: ArchiveHandle,
    ) -> Result<Self, ControlError> {
        config.validate()?;
        let mut safety = SafetyInterlockManager::new(config.safety.clone());
        safety.set_geofence(config.geofence.clone());
        let mut watchdog = Watchdog::new(config.safety.watchdog_timeout());
        for (component, timeout) in &config.watched_components {
            watchdog.register_with_timeout(component, *timeout);
        }
        let (publisher, _) = state_channel(RobotState::default());
        Ok(Self {
            fusion: FusionEngine::new(config.fusion.clone()),
            nav: NavigationModeManager::with_limits(&config.safety, config.follower.clone()),
            planner: CoveragePlanner::new(config.planner.clone()),
            weather: WeatherGate::new(config.forecast_thresholds, config.sensor_thresholds),
            bundler: DiagnosticsBundler::new(archive, bus.clone(), config.diagnostics),
            safety,
            watchdog,
            scheduler,
            publisher,
            bus,
            config,
        })
    }

    /// Subscribe to the bus and run the loop on its own task.
    ///
    /// Subscriptions are taken before the task starts so nothing published
    /// after this call is missed.
    pub fn spawn(
        self,
        forecasts: mpsc::Receiver<Forecast>,
    ) -> Result<(ControlHandle, JoinHandle<()>), ControlError> {
        let sensors = self.bus.subscribe(topics::ALL_SENSORS)?;
        let critical_sensors = self.bus.subscribe_critical(CONTROL_GROUP, topics::ALL_SENSORS)?;
        let mut streams = Vec::new();
        for pattern in [
            topics::ALL_HEARTBEATS,
            topics::COMMAND_ECHO,
            topics::ALL_DRIVERS,
            topics::ALL_INTERLOCKS,
            topics::NAVIGATION_MODE,
            topics::COMMANDS,
            topics::ALL_JOBS,
            topics::LOG_BUNDLES,
        ] {
            streams.push(self.bus.subscribe(pattern)?.into_stream());
        }
        let (tx, requests) = mpsc::channel(REQUEST_QUEUE);
        let handle = ControlHandle {
            tx,
            state: self.publisher.reader(),
        };
        let inputs = Inputs {
            sensors,
            critical_sensors,
            events: select_all(streams).boxed(),
            requests,
            forecasts,
        };
        Ok((handle, tokio::spawn(self.run(inputs))))
    }

    async fn run(mut self, mut inputs: Inputs) {
        let mut fusion_tick = interval(self.config.tick_period());
        fusion_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut scheduler_tick = interval(self.config.scheduler_interval);
        scheduler_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(hz = self.config.fusion_hz, "control loop started");

        loop {
            tokio::select! {
                biased;

                critical = inputs.critical_sensors.recv() => match critical {
                    Ok(event) => {
                        self.on_sensor_event(&event);
                        if let Err(e) = inputs.critical_sensors.ack(event.sequence) {
                            error!(error = %e, "critical ack failed");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "critical sensor stream ended");
                        break;
                    }
                },
                Some(event) = inputs.sensors.recv() => {
                    if event.tier == DeliveryTier::BestEffort {
                        self.on_sensor_event(&event);
                    }
                }
                request = inputs.requests.recv() => match request {
                    Some(ControlRequest::Shutdown(done)) => {
                        self.halt("control loop shutdown");
                        let _ = done.send(());
                        break;
                    }
                    Some(request) => self.handle(request),
                    None => {
                        self.halt("all control handles dropped");
                        break;
                    }
                },
                _ = fusion_tick.tick() => self.tick(),
                _ = scheduler_tick.tick() => self.schedule(),
                Some(event) = inputs.events.next() => self.on_bus_event(&event),
                Some(forecast) = inputs.forecasts.recv() => self.weather.record_forecast(forecast),
            }
        }
        self.scheduler.close().await;
        info!("control loop stopped");
    }

    // ── Inputs ──────────────────────────────────────────────────────────────

    fn on_sensor_event(&mut self, event: &BusEvent) {
        let EventPayload::Reading(reading) = &event.payload else {
            return;
        };
        let transitions = self.safety.screen(reading);
        match self.fusion.ingest(reading.clone(), now_us()) {
            IngestOutcome::Accepted | IngestOutcome::Superseded => {}
            outcome => debug!(sensor = %reading.sensor_id, ?outcome, "reading not fused"),
        }
        if !transitions.is_empty() {
            self.apply_transitions(transitions);
            self.tick();
        }
    }

    fn on_bus_event(&mut self, event: &BusEvent) {
        match &event.payload {
            EventPayload::Heartbeat { component } => {
                self.watchdog.heartbeat(component);
                return;
            }
            EventPayload::CommandEcho { echo, .. } => self.fusion.ingest_echo(echo),
            _ => {}
        }
        self.bundler.record_event(event);
    }

    // ── Tick ────────────────────────────────────────────────────────────────

    fn tick(&mut self) {
        let mut draft = self.fusion.tick(now_us()).clone();
        let stale = self.watchdog.check_all();
        if !stale.is_empty() {
            debug!(components = ?stale, "watchdog reports stale components");
        }
        draft.watchdog_healthy = stale.is_empty();

        let transitions = self.safety.evaluate(&draft);
        self.apply_transitions(transitions);
        self.enforce_safety();

        self.navigate(&draft);

        let state = self.fusion.commit(SafetyOverlay {
            active_interlocks: self.safety.active_set(),
            watchdog_healthy: draft.watchdog_healthy,
            navigation_mode: self.nav.mode(),
            current_waypoint: self.nav.current_waypoint(),
        });
        self.bundler.record_state(&state);
        if let Err(e) = self.bus.publish(topics::STATE, EventPayload::State(Box::new(state.clone()))) {
            warn!(error = %e, "state publish failed");
        }
        self.publisher.publish(state);
    }

    /// Publish interlock transitions and, if any interlock is active, force
    /// `EMERGENCY_STOP` before anything else runs.
    fn apply_transitions(&mut self, transitions: Vec<InterlockTransition>) {
        let raised = transitions.iter().any(|t| t.status == InterlockStatus::Active);
        for t in transitions {
            self.publish_critical(&topics::interlock(t.kind), t.to_payload());
            if t.status == InterlockStatus::Active {
                self.bundler.bundle(BundleTrigger::Interlock { interlock: t.kind });
                let reason = format!("interlock {}", t.kind);
                if let Some(job) = self.scheduler.pause_active(&reason, self.now()) {
                    info!(%job, interlock = %t.kind, "job paused");
                }
            }
        }
        if raised {
            self.enforce_safety();
        }
    }

    fn enforce_safety(&mut self) {
        if let Some(change) = self.nav.on_safety(&self.safety) {
            self.announce_mode(&change);
            self.send_stop(CommandSource::Safety);
        }
    }

    fn navigate(&mut self, state: &RobotState) {
        match self.nav.advance(state, &self.safety) {
            NavigationStep::Inactive => {}
            NavigationStep::Command(command) => self.send(command, CommandSource::Autonomy),
            NavigationStep::Rejected(rejection) => {
                warn!(%rejection, "autonomy command rejected");
                self.send_stop(CommandSource::Autonomy);
            }
            NavigationStep::Arrived(waypoint) => {
                debug!(index = waypoint.index, "waypoint reached");
            }
            NavigationStep::Completed { pattern, change } => {
                self.announce_mode(&change);
                self.send_stop(CommandSource::Autonomy);
                info!(%pattern, "coverage pattern completed");
                if let Some(id) = self.running_job() {
                    if let Err(e) = self.scheduler.job_completed(id, self.now()) {
                        error!(job = %id, error = %e, "could not complete job");
                    }
                }
                if let Err(e) = self.nav.clear_pattern() {
                    warn!(%pattern, error = %e, "completed pattern not cleared");
                }
            }
            NavigationStep::Stalled { detail, change } => {
                self.announce_mode(&change);
                self.send_stop(CommandSource::Autonomy);
                if let Some(id) = self.running_job() {
                    self.fail_job(id, &detail);
                }
            }
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.config.clock)()
    }

    fn running_job(&self) -> Option<Uuid> {
        self.scheduler
            .active()
            .filter(|j| j.state == JobState::Running)
            .map(|j| j.id)
    }

    // ── Scheduling ──────────────────────────────────────────────────────────

    fn schedule(&mut self) {
        let now = self.now();
        let state = self.publisher.latest();
        let conditions = StartConditions {
            interlocks_clear: self.safety.is_clear(),
            mode: self.nav.mode(),
            battery_percent: state.battery_percent,
            weather: self.weather.assess(now, &state),
        };
        for action in self.scheduler.tick(now, &conditions) {
            let (id, result) = match action {
                SchedulerAction::Start { job_id } => (job_id, self.start_job(job_id, &state)),
                SchedulerAction::Resume { job_id } => (job_id, self.engage(&format!("resume job {job_id}"))),
            };
            if let Err(e) = result {
                warn!(job = %id, error = %e, "job could not start");
                self.fail_job(id, &e.to_string());
            }
        }
    }

    fn start_job(&mut self, id: Uuid, state: &RobotState) -> Result<(), ControlError> {
        let fence = self
            .safety
            .geofence()
            .cloned()
            .ok_or_else(|| ControlError::Conflict("no geofence configured".to_string()))?;
        let start = state
            .position
            .ok_or_else(|| ControlError::Conflict("no position fix".to_string()))?;
        let runtime = state.battery_percent.map(|percent| {
            self.fusion
                .battery_model()
                .runtime(percent, state.battery_current_a)
        });
        let pattern = self.planner.plan(&fence, start, runtime)?;
        let pattern_id = pattern.id();
        info!(
            job = %id,
            pattern = %pattern_id,
            waypoints = pattern.waypoints().len(),
            estimate_s = pattern.estimated_duration().as_secs(),
            "coverage pattern planned"
        );
        self.nav.load_pattern(pattern)?;
        self.scheduler.attach_pattern(id, pattern_id);
        self.engage(&format!("job {id}"))
    }

    /// Enter `AUTONOMOUS` on the loaded pattern and start the blade.
    fn engage(&mut self, reason: &str) -> Result<(), ControlError> {
        if let Some(change) = self.nav.request(NavigationMode::Autonomous, &self.safety, reason)? {
            self.announce_mode(&change);
        }
        let blade = self
            .nav
            .submit(MotionCommand::Blade { enabled: true }, CommandSource::Autonomy, &self.safety)?;
        self.send(blade, CommandSource::Autonomy);
        Ok(())
    }

    fn fail_job(&mut self, id: Uuid, reason: &str) {
        match self.scheduler.job_failed(id, reason, self.now()) {
            Ok(FailureOutcome::Retry { attempt, at }) => {
                info!(job = %id, attempt, retry_at = %at, "job will be retried");
            }
            Ok(FailureOutcome::Exhausted) => {
                self.bundler.bundle(BundleTrigger::JobFailed { job_id: id });
            }
            Err(e) => error!(job = %id, error = %e, "could not record job failure"),
        }
    }

    // ── Publishing ──────────────────────────────────────────────────────────

    fn announce_mode(&self, change: &ModeChange) {
        self.publish_critical(topics::NAVIGATION_MODE, change.to_payload());
    }

    fn send(&self, command: MotionCommand, source: CommandSource) {
        let payload = EventPayload::Command { command, source };
        let result = if command == MotionCommand::Stop {
            self.bus.publish_critical(topics::COMMANDS, payload)
        } else {
            self.bus.publish(topics::COMMANDS, payload)
        };
        if let Err(e) = result {
            error!(?command, error = %e, "command publish failed");
        }
    }

    fn send_stop(&self, source: CommandSource) {
        self.send(MotionCommand::Stop, source);
    }

    fn publish_critical(&self, topic: &str, payload: EventPayload) {
        if let Err(e) = self.bus.publish_critical(topic, payload) {
            if e.is_fatal() {
                error!(topic, error = %e, "critical publish failed, bus can no longer guarantee delivery");
            } else {
                error!(topic, error = %e, "critical publish failed");
            }
        }
    }

    /// Stop everything on the way out.
    fn halt(&mut self, reason: &str) {
        if self.nav.mode() == NavigationMode::Autonomous {
            if let Ok(Some(change)) = self.nav.request(NavigationMode::Idle, &self.safety, reason) {
                self.announce_mode(&change);
            }
            self.scheduler.pause_active(reason, self.now());
        }
        self.send_stop(CommandSource::Safety);
    }

    // ── Requests ────────────────────────────────────────────────────────────

    fn handle(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Status(reply) => {
                let _ = reply.send(Ok(self.status()));
            }
            ControlRequest::Command { command, reply } => {
                let _ = reply.send(self.operator_command(command));
            }
            ControlRequest::SetMode { mode, reply } => {
                let _ = reply.send(self.set_mode(mode));
            }
            ControlRequest::Reset(reply) => {
                let result = self.nav.reset(&self.safety).map_err(ControlError::from);
                if let Ok(change) = &result {
                    self.announce_mode(change);
                }
                let _ = reply.send(result.map(|_| ()));
            }
            ControlRequest::Acknowledge { kind, reply } => {
                let result = self.safety.acknowledge(kind).map_err(ControlError::from);
                if let Ok(t) = &result {
                    info!(interlock = %kind, "interlock acknowledged");
                    self.publish_critical(&topics::interlock(t.kind), t.to_payload());
                }
                let _ = reply.send(result.map(|_| ()));
            }
            ControlRequest::EmergencyStop { reason, reply } => {
                warn!(%reason, "operator emergency stop");
                let reading = SensorReading::new(
                    "operator",
                    now_us(),
                    ReadingData::EmergencyStop { engaged: true },
                );
                let transitions = self.safety.screen(&reading);
                self.apply_transitions(transitions);
                self.tick();
                let _ = reply.send(Ok(()));
            }
            ControlRequest::Geofence(reply) => {
                let _ = reply.send(Ok(self.safety.geofence().map(GeofenceInfo::from)));
            }
            ControlRequest::SetGeofence { spec, reply } => {
                let result = Geofence::try_from(spec)
                    .map_err(ControlError::from)
                    .and_then(|fence| {
                        let info = GeofenceInfo::from(&fence);
                        self.replace_geofence(Some(fence))?;
                        info!(geofence = %info.id, name = %info.spec.name, area_m2 = info.area_m2, "geofence set");
                        Ok(info)
                    });
                let _ = reply.send(result);
            }
            ControlRequest::ClearGeofence(reply) => {
                let result = self.replace_geofence(None);
                if result.is_ok() {
                    info!("geofence cleared");
                }
                let _ = reply.send(result);
            }
            ControlRequest::Jobs(reply) => {
                let _ = reply.send(Ok(self.scheduler.list()));
            }
            ControlRequest::Job { id, reply } => {
                let _ = reply.send(self.scheduler.get(id).cloned().map_err(ControlError::from));
            }
            ControlRequest::CreateJob { spec, reply } => {
                let _ = reply.send(self.scheduler.create(spec, self.now()).map_err(ControlError::from));
            }
            ControlRequest::UpdateJob { id, spec, reply } => {
                let _ = reply.send(
                    self.scheduler
                        .update(id, spec, self.now())
                        .map_err(ControlError::from),
                );
            }
            ControlRequest::DeleteJob { id, reply } => {
                let _ = reply.send(self.scheduler.delete(id).map_err(ControlError::from));
            }
            ControlRequest::StartJob { id, reply } => {
                let result = self.scheduler.start_now(id, self.now()).map_err(ControlError::from);
                if result.is_ok() {
                    self.schedule();
                }
                let _ = reply.send(result.and_then(|_| self.job_snapshot(id)));
            }
            ControlRequest::CancelJob { id, reply } => {
                let _ = reply.send(self.cancel_job(id));
            }
            ControlRequest::RequestBundle { note, reply } => {
                let task = self.bundler.bundle(BundleTrigger::Operator { note });
                tokio::spawn(async move {
                    let result = match task.await {
                        Ok(result) => result.map_err(ControlError::from),
                        Err(e) => Err(DiagnosticsError::Task(e.to_string()).into()),
                    };
                    let _ = reply.send(result);
                });
            }
            ControlRequest::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    fn status(&self) -> StatusReport {
        StatusReport {
            state: (*self.publisher.latest()).clone(),
            interlocks: self.safety.records(),
            active_job: self.scheduler.active().cloned(),
            pattern: self.nav.pattern().map(|p| PatternSummary {
                id: p.id(),
                geofence_id: p.geofence_id(),
                waypoints: p.waypoints().len(),
                completed: p.completed_count(),
                path_length_m: p.path_length_m(),
                estimated_duration_s: p.estimated_duration().as_secs_f64(),
            }),
            forecast: self.weather.latest().copied(),
        }
    }

    fn job_snapshot(&self, id: Uuid) -> Result<ScheduledJob, ControlError> {
        Ok(self.scheduler.get(id)?.clone())
    }

    fn operator_command(&mut self, command: MotionCommand) -> Result<(), ControlError> {
        let command = self.nav.submit(command, CommandSource::Operator, &self.safety)?;
        self.send(command, CommandSource::Operator);
        Ok(())
    }

    fn set_mode(&mut self, mode: NavigationMode) -> Result<NavigationMode, ControlError> {
        let was_autonomous = self.nav.mode() == NavigationMode::Autonomous;
        if let Some(change) = self.nav.request(mode, &self.safety, "operator request")? {
            self.announce_mode(&change);
            if was_autonomous {
                self.send_stop(CommandSource::Operator);
                if let Some(job) = self.scheduler.pause_active("operator changed mode", self.now()) {
                    info!(%job, to = %mode, "job paused by operator");
                }
            }
        }
        Ok(self.nav.mode())
    }

    /// Swap the geofence. Any loaded pattern was planned for the old one and
    /// is dropped.
    fn replace_geofence(&mut self, fence: Option<Geofence>) -> Result<(), ControlError> {
        if let Some(job) = self.scheduler.active() {
            return Err(ControlError::Conflict(format!(
                "job '{}' is {}; cancel it before changing the geofence",
                job.name, job.state
            )));
        }
        if self.nav.pattern().is_some() {
            self.nav.clear_pattern()?;
        }
        self.safety.set_geofence(fence);
        Ok(())
    }

    fn cancel_job(&mut self, id: Uuid) -> Result<ScheduledJob, ControlError> {
        let previous = self.scheduler.get(id)?.state;
        self.scheduler.cancel(id, self.now())?;
        if matches!(previous, JobState::Running | JobState::Paused) {
            if self.nav.mode() == NavigationMode::Autonomous {
                if let Some(change) = self.nav.request(NavigationMode::Idle, &self.safety, "job cancelled")? {
                    self.announce_mode(&change);
                }
                self.send_stop(CommandSource::Operator);
            }
            self.nav.clear_pattern()?;
        }
        self.job_snapshot(id)
    }
}

/// HTTP-ish status class for a control error.
impl ControlError {
    pub fn status_code(&self) -> u16 {
        match self {
            ControlError::Rejected(r) => match r.reason {
                RejectionReason::Rule { .. } => 400,
                RejectionReason::Interlock | RejectionReason::Mode => 403,
            },
            // Illegal mode transitions are safety blocks, not state conflicts.
            ControlError::Transition(_) => 403,
            ControlError::Acknowledge(AckError::NotRaised(_)) => 404,
            ControlError::Acknowledge(AckError::StillActive(_)) => 409,
            ControlError::Geofence(_) | ControlError::Planning(_) => 400,
            ControlError::Scheduler(e) => match e {
                SchedulerError::InvalidSchedule(_)
                | SchedulerError::InvalidJob(_)
                | SchedulerError::InvalidConfig(_) => 400,
                SchedulerError::NotFound(_) => 404,
                SchedulerError::Conflict { .. } => 409,
                SchedulerError::Store(_) => 500,
            },
            ControlError::Diagnostics(DiagnosticsError::Archive(
                mower_memory::ArchiveError::NotFound(_),
            )) => 404,
            ControlError::Conflict(_) => 409,
            ControlError::Config(_) => 400,
            ControlError::Diagnostics(_) | ControlError::Bus(_) => 500,
            ControlError::Stopped => 503,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mower_planner::GeofenceSpec;
    use mower_types::Point;

    fn square(side: f64) -> GeofenceSpec {
        GeofenceSpec {
            name: "lawn".to_string(),
            vertices: vec![
                Point::new(0.0, 0.0),
                Point::new(side, 0.0),
                Point::new(side, side),
                Point::new(0.0, side),
            ],
            buffer_m: 0.0,
        }
    }

    fn spawn_loop(config: ControlConfig) -> (ControlHandle, MessageBus, JoinHandle<()>) {
        let (handle, bus, _archive, task) = spawn_loop_with_archive(config);
        (handle, bus, task)
    }

    fn spawn_loop_with_archive(
        config: ControlConfig,
    ) -> (ControlHandle, MessageBus, ArchiveHandle, JoinHandle<()>) {
        let bus = MessageBus::default();
        let archive = ArchiveHandle::new(
            mower_memory::IncidentArchive::open_in_memory(mower_memory::DEFAULT_ARCHIVE_CAP_BYTES)
                .unwrap(),
        );
        let scheduler = JobScheduler::new(Default::default(), bus.clone());
        let (_tx, rx) = mpsc::channel(1);
        let control = ControlLoop::new(bus.clone(), config, scheduler, archive.clone()).unwrap();
        let (handle, task) = control.spawn(rx).unwrap();
        (handle, bus, archive, task)
    }

    async fn eventually(mut cond: impl AsyncFnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn config_rejects_out_of_range_rate() {
        let config = ControlConfig {
            fusion_hz: 20,
            ..ControlConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(ControlConfig::default().tick_period(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn operator_estop_latches_until_ack_and_reset() {
        let (handle, _bus, task) = spawn_loop(ControlConfig::default());

        handle.emergency_stop("test").await.unwrap();
        let state = handle.state();
        assert_eq!(state.navigation_mode, NavigationMode::EmergencyStop);
        assert!(state.active_interlocks.contains(&InterlockKind::EmergencyStop));

        // No hardware switch is engaged, so the condition has already cleared
        // but stays latched until acknowledged.
        assert_eq!(handle.reset().await.unwrap_err().status_code(), 403);
        assert_eq!(
            handle.set_mode(NavigationMode::Manual).await.unwrap_err().status_code(),
            403
        );

        handle.acknowledge(InterlockKind::EmergencyStop).await.unwrap();
        assert_eq!(
            handle.acknowledge(InterlockKind::EmergencyStop).await.unwrap_err().status_code(),
            404
        );
        handle.reset().await.unwrap();
        let status = handle.status().await.unwrap();
        assert!(status.interlocks.is_empty());
        assert_eq!(handle.set_mode(NavigationMode::Manual).await.unwrap(), NavigationMode::Manual);

        handle.shutdown().await;
        task.await.unwrap();
    }

    // Seconds since the epoch seen by `fake_clock`.
    static FAKE_NOW: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(1_780_000_000);

    fn fake_clock() -> DateTime<Utc> {
        let secs = FAKE_NOW.load(std::sync::atomic::Ordering::SeqCst);
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn advance_clock(by: chrono::Duration) {
        FAKE_NOW.fetch_add(by.num_seconds(), std::sync::atomic::Ordering::SeqCst);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_job_with_one_bundle() {
        let config = ControlConfig {
            scheduler_interval: Duration::from_millis(10),
            clock: fake_clock,
            ..ControlConfig::default()
        };
        let (handle, bus, archive, task) = spawn_loop_with_archive(config);

        // A full battery passes the start gate; the missing geofence then
        // fails every start attempt.
        let battery_topic = topics::sensors(mower_types::SensorChannel::Battery);
        assert!(
            eventually(async || {
                let reading = SensorReading::new(
                    "bms0",
                    now_us(),
                    ReadingData::Battery { voltage: 12.6, current_a: 0.0 },
                );
                bus.publish(&battery_topic, EventPayload::Reading(reading)).unwrap();
                handle.state().battery_percent.is_some()
            })
            .await
        );

        let job = handle
            .create_job(JobSpec {
                name: "front".to_string(),
                schedule: "0 3 * * *".to_string(),
                enabled: true,
            })
            .await
            .unwrap();
        let started = handle.start_job(job.id).await.unwrap();
        assert_eq!(started.state, JobState::Scheduled);
        assert_eq!(started.retry_count, 1);

        for (attempt, minutes) in [(2, 30), (3, 60)] {
            advance_clock(chrono::Duration::minutes(minutes - 1));
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(handle.job(job.id).await.unwrap().retry_count, attempt - 1, "backoff respected");
            advance_clock(chrono::Duration::minutes(1));
            assert!(
                eventually(async || handle.job(job.id).await.unwrap().retry_count == attempt).await,
                "retry {attempt} never ran"
            );
        }
        advance_clock(chrono::Duration::minutes(120));
        assert!(eventually(async || handle.job(job.id).await.unwrap().state == JobState::Failed).await);

        // No further attempts, however long we wait.
        advance_clock(chrono::Duration::days(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let failed = handle.job(job.id).await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.retry_count, 3);
        assert_eq!(failed.next_run, None);

        let label = format!("job_failed:{}", job.id);
        assert!(eventually(async || archive.list().await.unwrap().iter().any(|b| b.trigger == label)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let bundles = archive.list().await.unwrap();
        assert_eq!(bundles.iter().filter(|b| b.trigger.starts_with("job_failed:")).count(), 1);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn illegal_transitions_are_safety_blocked() {
        let (handle, _bus, task) = spawn_loop(ControlConfig::default());

        let no_pattern = handle.set_mode(NavigationMode::Autonomous).await.unwrap_err();
        assert!(matches!(no_pattern, ControlError::Transition(TransitionError::NoPattern)));
        assert_eq!(no_pattern.status_code(), 403);
        // Reset is only meaningful from EMERGENCY_STOP.
        assert_eq!(handle.reset().await.unwrap_err().status_code(), 403);

        handle.emergency_stop("test").await.unwrap();
        for target in [NavigationMode::Manual, NavigationMode::Idle, NavigationMode::Autonomous] {
            let err = handle.set_mode(target).await.unwrap_err();
            assert!(matches!(err, ControlError::Transition(TransitionError::ResetRequired)));
            assert_eq!(err.status_code(), 403, "{target}");
        }
        assert_eq!(handle.state().navigation_mode, NavigationMode::EmergencyStop);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn operator_drive_needs_manual_mode() {
        let (handle, bus, task) = spawn_loop(ControlConfig::default());
        let mut commands = bus.subscribe(topics::COMMANDS).unwrap();

        let drive = MotionCommand::Drive {
            linear_mps: 0.4,
            angular_rps: 0.0,
        };
        let err = handle.command(drive).await.unwrap_err();
        assert_eq!(err.status_code(), 403);

        assert_eq!(handle.set_mode(NavigationMode::Manual).await.unwrap(), NavigationMode::Manual);
        handle.command(drive).await.unwrap();
        let event = commands.recv().await.unwrap();
        assert_eq!(
            event.payload,
            EventPayload::Command {
                command: drive,
                source: CommandSource::Operator
            }
        );

        let too_fast = MotionCommand::Drive {
            linear_mps: 5.0,
            angular_rps: 0.0,
        };
        assert_eq!(handle.command(too_fast).await.unwrap_err().status_code(), 400);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn geofence_set_and_clear() {
        let (handle, _bus, task) = spawn_loop(ControlConfig::default());
        assert!(handle.geofence().await.unwrap().is_none());

        let info = handle.set_geofence(square(10.0)).await.unwrap();
        assert!((info.area_m2 - 100.0).abs() < 1e-9);
        assert_eq!(handle.geofence().await.unwrap().unwrap().id, info.id);

        let mut bad = square(10.0);
        bad.vertices.truncate(2);
        assert_eq!(handle.set_geofence(bad).await.unwrap_err().status_code(), 400);

        handle.clear_geofence().await.unwrap();
        assert!(handle.geofence().await.unwrap().is_none());

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn job_crud_maps_errors() {
        let (handle, _bus, task) = spawn_loop(ControlConfig::default());
        let spec = JobSpec {
            name: "front".to_string(),
            schedule: "0 9 * * *".to_string(),
            enabled: true,
        };
        let job = handle.create_job(spec.clone()).await.unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(handle.jobs().await.unwrap().len(), 1);

        let bad = JobSpec {
            schedule: "not cron".to_string(),
            ..spec
        };
        assert_eq!(handle.create_job(bad).await.unwrap_err().status_code(), 400);
        assert_eq!(handle.job(Uuid::new_v4()).await.unwrap_err().status_code(), 404);

        handle.delete_job(job.id).await.unwrap();
        assert!(handle.jobs().await.unwrap().is_empty());

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_handles_stop_the_loop() {
        let (handle, _bus, task) = spawn_loop(ControlConfig::default());
        drop(handle);
        task.await.unwrap();
    }
}

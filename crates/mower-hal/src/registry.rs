//! [`DriverRegistry`] – owns every driver instance, its lifecycle and its
//! exclusive resource claim.
//!
//! # Lifecycle
//!
//! ```text
//! uninitialized → initializing → ready → running → stopped
//!        └──────────────┴───────────┴───────┴────→ failed
//! ```
//!
//! `stopped` and `failed` are terminal and release the resource claim. The
//! registry never restarts a failed driver on its own.
//!
//! # Tasks
//!
//! Each running driver gets one poll task that samples it at its configured
//! interval, publishes readings and a heartbeat, and absorbs transient read
//! faults with exponential backoff until the retry budget is spent. A single
//! actuation task (see [`DriverRegistry::spawn_actuation`]) applies gated
//! commands from the bus and echoes the resulting actuator state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mower_middleware::{BusError, MessageBus};
use mower_types::{
    ActuatorEcho, BusEvent, DeliveryTier, DriverHealth, DriverState, EventPayload, MotionCommand,
    ReadingData, SensorReading, now_us, topics,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{DriverConfig, DriverKind, DriverPolicy, HardwareConfig};
use crate::driver::{Driver, DriverError};
use crate::factory::DriverFactory;

/// Consumer group the actuation task uses on the critical tier.
pub const ACTUATION_GROUP: &str = "actuation";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("driver id '{0}' is already registered")]
    DuplicateId(String),

    #[error("resource '{resource}' requested by '{requester}' is already claimed by '{holder}'")]
    ResourceConflict {
        resource: String,
        holder: String,
        requester: String,
    },

    #[error("no constructor registered for driver kind {0:?}")]
    NoConstructor(DriverKind),

    #[error("unknown driver '{0}'")]
    UnknownDriver(String),

    #[error("driver '{id}' is {state} and cannot be started")]
    NotStartable { id: String, state: DriverState },

    #[error("driver '{id}': {source}")]
    Driver {
        id: String,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Point-in-time view of one registered driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverInstance {
    pub id: String,
    pub kind: DriverKind,
    pub resource: String,
    pub state: DriverState,
    pub health: DriverHealth,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Slots
// ────────────────────────────────────────────────────────────────────────────

struct SlotStatus {
    state: DriverState,
    health: DriverHealth,
    failures: u32,
    last_error: Option<String>,
    poll_task: Option<JoinHandle<()>>,
}

struct DriverSlot {
    config: DriverConfig,
    driver: tokio::sync::Mutex<Box<dyn Driver>>,
    status: Mutex<SlotStatus>,
}

impl DriverSlot {
    fn new(config: DriverConfig, driver: Box<dyn Driver>) -> Self {
        Self {
            config,
            driver: tokio::sync::Mutex::new(driver),
            status: Mutex::new(SlotStatus {
                state: DriverState::Uninitialized,
                health: DriverHealth::Healthy,
                failures: 0,
                last_error: None,
                poll_task: None,
            }),
        }
    }

    fn status(&self) -> MutexGuard<'_, SlotStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> DriverState {
        self.status().state
    }

    fn id(&self) -> &str {
        &self.config.id
    }

    fn instance(&self) -> DriverInstance {
        let st = self.status();
        DriverInstance {
            id: self.config.id.clone(),
            kind: self.config.kind,
            resource: self.config.resource.clone(),
            state: st.state,
            health: st.health,
            consecutive_failures: st.failures,
            last_error: st.last_error.clone(),
        }
    }
}

/// Everything a background task needs to report on a slot.
#[derive(Clone)]
struct Reporter {
    bus: MessageBus,
    policy: DriverPolicy,
}

impl Reporter {
    /// Move `slot` to `next`. Terminal states are never left.
    fn transition(&self, slot: &DriverSlot, next: DriverState, message: &str) -> bool {
        {
            let mut st = slot.status();
            if st.state.is_terminal() || st.state == next {
                return false;
            }
            st.state = next;
            if next == DriverState::Failed {
                st.health = DriverHealth::Unhealthy;
                st.last_error = Some(message.to_string());
                st.poll_task.take();
            }
        }

        let payload = EventPayload::DriverLifecycle {
            driver_id: slot.config.id.clone(),
            resource: slot.config.resource.clone(),
            state: next,
            message: message.to_string(),
        };
        let topic = topics::driver_lifecycle(slot.id());
        if next == DriverState::Failed {
            error!(driver = slot.id(), resource = %slot.config.resource, reason = message, "driver failed");
            if let Err(e) = self.bus.publish_critical(&topic, payload) {
                error!(driver = slot.id(), error = %e, "could not publish driver failure");
            }
        } else {
            info!(driver = slot.id(), state = %next, "driver state changed");
            let _ = self.bus.publish(&topic, payload);
        }
        true
    }

    fn fail(&self, slot: &DriverSlot, message: &str) {
        self.transition(slot, DriverState::Failed, message);
    }

    fn set_health(&self, slot: &DriverSlot, health: DriverHealth) {
        let changed = {
            let mut st = slot.status();
            let changed = st.health != health && !st.state.is_terminal();
            if changed {
                st.health = health;
            }
            changed
        };
        if changed {
            debug!(driver = slot.id(), %health, "driver health changed");
            let _ = self.bus.publish(
                &topics::driver_health(slot.id()),
                EventPayload::DriverHealth {
                    driver_id: slot.config.id.clone(),
                    health,
                },
            );
        }
    }

    /// Records a transient fault; returns the consecutive failure count.
    fn note_failure(&self, slot: &DriverSlot, err: &DriverError) -> u32 {
        let failures = {
            let mut st = slot.status();
            st.failures += 1;
            st.last_error = Some(err.to_string());
            st.failures
        };
        warn!(driver = slot.id(), failures, error = %err, "driver fault");
        self.set_health(slot, DriverHealth::Degraded);
        failures
    }

    fn note_success(&self, slot: &DriverSlot) {
        let recovered = {
            let mut st = slot.status();
            let had = st.failures > 0;
            st.failures = 0;
            had
        };
        if recovered {
            info!(driver = slot.id(), "driver recovered");
            self.set_health(slot, DriverHealth::Healthy);
        }
    }

    fn publish_reading(&self, slot: &DriverSlot, data: ReadingData, last_estop: &mut Option<bool>) {
        let reading = SensorReading::new(slot.id(), now_us(), data);
        let topic = reading.topic();
        // E-stop edges go on the critical tier; steady-state samples do not.
        let critical = match reading.data {
            ReadingData::EmergencyStop { engaged } => {
                let edge = *last_estop != Some(engaged);
                *last_estop = Some(engaged);
                edge
            }
            _ => false,
        };
        let payload = EventPayload::Reading(reading);
        let result = if critical {
            self.bus.publish_critical(&topic, payload)
        } else {
            self.bus.publish(&topic, payload)
        };
        if let Err(e) = result {
            error!(driver = slot.id(), error = %e, "failed to publish reading");
        }
    }
}

async fn poll_loop(reporter: Reporter, slot: Arc<DriverSlot>) {
    let read_timeout = Duration::from_millis(reporter.policy.read_timeout_ms);
    let heartbeat_topic = topics::heartbeat(slot.id());
    let mut ticker = tokio::time::interval(slot.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_estop = None;

    loop {
        ticker.tick().await;
        let outcome = timeout(read_timeout, async { slot.driver.lock().await.read().await })
            .await
            .unwrap_or(Err(DriverError::Timeout(read_timeout)));

        match outcome {
            Ok(reading) => {
                reporter.note_success(&slot);
                if let Some(data) = reading {
                    reporter.publish_reading(&slot, data, &mut last_estop);
                }
                let _ = reporter.bus.publish(
                    &heartbeat_topic,
                    EventPayload::Heartbeat {
                        component: slot.config.id.clone(),
                    },
                );
            }
            Err(e) if e.is_fatal() => {
                reporter.fail(&slot, &e.to_string());
                return;
            }
            Err(e) => {
                let failures = reporter.note_failure(&slot, &e);
                if failures >= reporter.policy.retry_budget {
                    reporter.fail(
                        &slot,
                        &format!("{failures} consecutive faults, last: {e}"),
                    );
                    return;
                }
                tokio::time::sleep(reporter.policy.backoff(failures)).await;
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Registry
// ────────────────────────────────────────────────────────────────────────────

/// Central driver registry. Share it behind an `Arc`.
pub struct DriverRegistry {
    reporter: Reporter,
    factory: DriverFactory,
    slots: Mutex<BTreeMap<String, Arc<DriverSlot>>>,
}

impl DriverRegistry {
    pub fn new(bus: MessageBus, factory: DriverFactory, policy: DriverPolicy) -> Self {
        Self {
            reporter: Reporter { bus, policy },
            factory,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<String, Arc<DriverSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: &str) -> Result<Arc<DriverSlot>, RegistryError> {
        self.slots()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownDriver(id.to_string()))
    }

    fn check_claims(
        slots: &BTreeMap<String, Arc<DriverSlot>>,
        config: &DriverConfig,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = slots.get(&config.id) {
            if !existing.state().is_terminal() {
                return Err(RegistryError::DuplicateId(config.id.clone()));
            }
        }
        let holder = slots.values().find(|s| {
            s.config.resource == config.resource
                && s.config.id != config.id
                && !s.state().is_terminal()
        });
        match holder {
            Some(h) => Err(RegistryError::ResourceConflict {
                resource: config.resource.clone(),
                holder: h.config.id.clone(),
                requester: config.id.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Construct the driver for `config` via the factory and register it.
    ///
    /// Resource claims are checked before the driver is constructed; a
    /// conflict never reaches the hardware.
    pub fn register(&self, config: DriverConfig) -> Result<DriverInstance, RegistryError> {
        Self::check_claims(&self.slots(), &config)?;
        let driver = self.factory.build(&config)?;
        self.register_driver(config, driver)
    }

    /// Register an already constructed driver.
    pub fn register_driver(
        &self,
        config: DriverConfig,
        driver: Box<dyn Driver>,
    ) -> Result<DriverInstance, RegistryError> {
        let slot = {
            let mut slots = self.slots();
            Self::check_claims(&slots, &config)?;
            let slot = Arc::new(DriverSlot::new(config, driver));
            slots.insert(slot.config.id.clone(), Arc::clone(&slot));
            slot
        };
        info!(
            driver = slot.id(),
            kind = ?slot.config.kind,
            resource = %slot.config.resource,
            "driver registered"
        );
        Ok(slot.instance())
    }

    /// Validate the whole configuration, then register every driver.
    pub fn register_all(&self, hardware: &HardwareConfig) -> Result<Vec<DriverInstance>, RegistryError> {
        hardware.validate()?;
        {
            let slots = self.slots();
            for config in &hardware.drivers {
                Self::check_claims(&slots, config)?;
                if !self.factory.supports(config.kind) {
                    return Err(RegistryError::NoConstructor(config.kind));
                }
            }
        }
        hardware
            .drivers
            .iter()
            .map(|c| self.register(c.clone()))
            .collect()
    }

    /// Initialize (if needed) and start polling. Starting a running driver
    /// is a no-op; terminal drivers cannot be started again.
    pub async fn start(&self, id: &str) -> Result<DriverInstance, RegistryError> {
        let slot = self.slot(id)?;
        let policy = &self.reporter.policy;

        match slot.state() {
            DriverState::Running | DriverState::Initializing => return Ok(slot.instance()),
            state @ (DriverState::Stopped | DriverState::Failed) => {
                return Err(RegistryError::NotStartable {
                    id: id.to_string(),
                    state,
                });
            }
            DriverState::Uninitialized => {
                self.reporter
                    .transition(&slot, DriverState::Initializing, "initializing");
                let init_timeout = Duration::from_millis(policy.init_timeout_ms);
                let result = timeout(init_timeout, async {
                    slot.driver.lock().await.initialize().await
                })
                .await
                .unwrap_or(Err(DriverError::Timeout(init_timeout)));
                if let Err(e) = result {
                    self.reporter
                        .fail(&slot, &format!("initialization failed: {e}"));
                    return Err(RegistryError::Driver {
                        id: id.to_string(),
                        source: e,
                    });
                }
                self.reporter.transition(&slot, DriverState::Ready, "initialized");
            }
            DriverState::Ready => {}
        }

        if self.reporter.transition(&slot, DriverState::Running, "polling") {
            let handle = tokio::spawn(poll_loop(self.reporter.clone(), Arc::clone(&slot)));
            let mut st = slot.status();
            if st.state == DriverState::Running {
                st.poll_task = Some(handle);
            }
        }
        Ok(slot.instance())
    }

    /// Stop polling and shut the driver down. A no-op on a driver that is
    /// already stopped or failed.
    pub async fn stop(&self, id: &str) -> Result<DriverInstance, RegistryError> {
        let slot = self.slot(id)?;
        let task = {
            let mut st = slot.status();
            if st.state.is_terminal() {
                return Ok(slot_instance_locked(&slot, &st));
            }
            st.poll_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        let limit = Duration::from_millis(self.reporter.policy.init_timeout_ms);
        let result = timeout(limit, async { slot.driver.lock().await.shutdown().await })
            .await
            .unwrap_or(Err(DriverError::Timeout(limit)));
        if let Err(e) = result {
            warn!(driver = id, error = %e, "driver shutdown reported an error");
        }
        self.reporter.transition(&slot, DriverState::Stopped, "stopped");
        Ok(slot.instance())
    }

    /// Start every registered driver; stops at the first failure.
    pub async fn start_all(&self) -> Result<(), RegistryError> {
        for id in self.ids() {
            self.start(&id).await?;
        }
        Ok(())
    }

    /// Zero the actuators, then stop every driver.
    pub async fn shutdown(&self) {
        if let Err(e) = self.dispatch(&MotionCommand::Stop).await {
            error!(error = %e, "stop command failed during shutdown");
        }
        for id in self.ids() {
            if let Err(e) = self.stop(&id).await {
                warn!(driver = %id, error = %e, "stop failed");
            }
        }
    }

    /// Ask the driver for its health. An answer slower than the configured
    /// health timeout marks it unhealthy.
    pub async fn health_check(&self, id: &str) -> Result<DriverHealth, RegistryError> {
        let slot = self.slot(id)?;
        if slot.state().is_terminal() {
            return Ok(DriverHealth::Unhealthy);
        }
        let limit = Duration::from_millis(self.reporter.policy.health_timeout_ms);
        let reported = timeout(limit, async {
            slot.driver.lock().await.health_check().await
        })
        .await;

        let health = match reported {
            Ok(Ok(DriverHealth::Healthy)) if slot.status().failures > 0 => DriverHealth::Degraded,
            Ok(Ok(h)) => h,
            Ok(Err(e)) => {
                warn!(driver = id, error = %e, "health check failed");
                DriverHealth::Unhealthy
            }
            Err(_) => {
                warn!(driver = id, timeout_ms = limit.as_millis() as u64, "health check timed out");
                DriverHealth::Unhealthy
            }
        };
        self.reporter.set_health(&slot, health);
        Ok(health)
    }

    pub async fn health_check_all(&self) -> Vec<(String, DriverHealth)> {
        let mut out = Vec::new();
        for id in self.ids() {
            if let Ok(h) = self.health_check(&id).await {
                out.push((id, h));
            }
        }
        out
    }

    pub fn ids(&self) -> Vec<String> {
        self.slots().keys().cloned().collect()
    }

    pub fn instance(&self, id: &str) -> Result<DriverInstance, RegistryError> {
        Ok(self.slot(id)?.instance())
    }

    pub fn instances(&self) -> Vec<DriverInstance> {
        self.slots().values().map(|s| s.instance()).collect()
    }

    /// Apply `command` to every running actuator that accepts it.
    ///
    /// All actuators are attempted even when one fails; the first error is
    /// returned after the rest have been commanded.
    pub async fn dispatch(
        &self,
        command: &MotionCommand,
    ) -> Result<Vec<(String, ActuatorEcho)>, RegistryError> {
        let targets: Vec<Arc<DriverSlot>> = self
            .slots()
            .values()
            .filter(|s| s.config.kind.is_actuator() && s.state() == DriverState::Running)
            .cloned()
            .collect();
        let limit = Duration::from_millis(self.reporter.policy.command_timeout_ms);
        let mut echoes = Vec::new();
        let mut first_error = None;

        for slot in targets {
            let outcome = timeout(limit, async {
                let mut driver = slot.driver.lock().await;
                if !driver.accepts(command) {
                    return Ok(None);
                }
                driver.apply(command).await.map(Some)
            })
            .await
            .unwrap_or(Err(DriverError::Timeout(limit)));

            match outcome {
                Ok(Some(echo)) => {
                    self.reporter.note_success(&slot);
                    let _ = self.reporter.bus.publish(
                        topics::COMMAND_ECHO,
                        EventPayload::CommandEcho {
                            driver_id: slot.config.id.clone(),
                            command: *command,
                            echo,
                        },
                    );
                    echoes.push((slot.config.id.clone(), echo));
                }
                Ok(None) => {}
                Err(e) => {
                    if e.is_fatal() {
                        self.reporter.fail(&slot, &e.to_string());
                    } else {
                        self.reporter.note_failure(&slot, &e);
                    }
                    first_error.get_or_insert(RegistryError::Driver {
                        id: slot.config.id.clone(),
                        source: e,
                    });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(echoes),
        }
    }

    async fn handle_command_event(&self, event: &BusEvent) {
        if let EventPayload::Command { command, source } = &event.payload {
            if let Err(e) = self.dispatch(command).await {
                error!(%source, ?command, error = %e, "command dispatch failed");
            }
        }
    }

    /// Spawn the task that applies commands published on
    /// [`topics::COMMANDS`]. Critical-tier commands (emergency stops) are
    /// consumed through an acknowledged consumer group.
    pub fn spawn_actuation(self: &Arc<Self>) -> Result<JoinHandle<()>, RegistryError> {
        let bus = &self.reporter.bus;
        let mut routine = bus.subscribe(topics::COMMANDS)?;
        let mut critical = bus.subscribe_critical(ACTUATION_GROUP, topics::COMMANDS)?;
        let registry = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = critical.recv() => match event {
                        Ok(event) => {
                            registry.handle_command_event(&event).await;
                            if let Err(e) = critical.ack(event.sequence) {
                                error!(error = %e, "failed to acknowledge command");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "critical command stream closed");
                            break;
                        }
                    },
                    event = routine.recv() => match event {
                        Some(event) if event.tier == DeliveryTier::BestEffort => {
                            registry.handle_command_event(&event).await;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        }))
    }
}

fn slot_instance_locked(slot: &DriverSlot, st: &SlotStatus) -> DriverInstance {
    DriverInstance {
        id: slot.config.id.clone(),
        kind: slot.config.kind,
        resource: slot.config.resource.clone(),
        state: st.state,
        health: st.health,
        consecutive_failures: st.failures,
        last_error: st.last_error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimWorld;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sim_registry(world: &SimWorld) -> (MessageBus, Arc<DriverRegistry>) {
        let bus = MessageBus::default();
        let registry = DriverRegistry::new(
            bus.clone(),
            DriverFactory::simulation(world.clone()),
            DriverPolicy::default(),
        );
        (bus, Arc::new(registry))
    }

    /// Counts how often the hardware was touched.
    struct CountingDriver {
        touched: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Driver for CountingDriver {
        async fn initialize(&mut self) -> Result<(), DriverError> {
            self.touched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn read(&mut self) -> Result<Option<ReadingData>, DriverError> {
            Ok(None)
        }
        async fn health_check(&mut self) -> Result<DriverHealth, DriverError> {
            Ok(DriverHealth::Healthy)
        }
        async fn shutdown(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn conflicting_claim_fails_before_any_io() {
        let (_bus, registry) = sim_registry(&SimWorld::default());
        let touched = Arc::new(AtomicUsize::new(0));
        let gps0 = DriverConfig::new("gps0", DriverKind::Gps, "/dev/ttyS0");
        let gps1 = DriverConfig::new("gps1", DriverKind::Gps, "/dev/ttyS0");

        registry
            .register_driver(gps0, Box::new(CountingDriver { touched: touched.clone() }))
            .unwrap();
        let err = registry
            .register_driver(gps1, Box::new(CountingDriver { touched: touched.clone() }))
            .unwrap_err();

        assert!(matches!(err, RegistryError::ResourceConflict { ref holder, .. } if holder == "gps0"));
        assert_eq!(touched.load(Ordering::SeqCst), 0);
        assert_eq!(registry.ids(), vec!["gps0".to_string()]);
    }

    #[tokio::test]
    async fn register_all_rejects_conflicts_up_front() {
        let (_bus, registry) = sim_registry(&SimWorld::default());
        let mut hw = HardwareConfig::simulated();
        hw.drivers[1].resource = hw.drivers[0].resource.clone();
        assert!(registry.register_all(&hw).is_err());
        assert!(registry.ids().is_empty());
    }

    #[tokio::test]
    async fn stop_twice_is_a_noop() {
        let (bus, registry) = sim_registry(&SimWorld::default());
        let mut lifecycle = bus.subscribe(topics::ALL_DRIVERS).unwrap();
        registry
            .register(DriverConfig::new("bms0", DriverKind::Battery, "sim:bms"))
            .unwrap();
        registry.start("bms0").await.unwrap();

        assert_eq!(registry.stop("bms0").await.unwrap().state, DriverState::Stopped);
        assert_eq!(registry.stop("bms0").await.unwrap().state, DriverState::Stopped);

        let mut stopped_events = 0;
        while let Some(ev) = lifecycle.try_recv() {
            if let EventPayload::DriverLifecycle {
                state: DriverState::Stopped,
                ..
            } = ev.payload
            {
                stopped_events += 1;
            }
        }
        assert_eq!(stopped_events, 1);
        assert!(matches!(
            registry.start("bms0").await,
            Err(RegistryError::NotStartable { .. })
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (_bus, registry) = sim_registry(&SimWorld::default());
        registry
            .register(DriverConfig::new("imu0", DriverKind::Imu, "sim:imu"))
            .unwrap();
        registry.start("imu0").await.unwrap();
        let again = registry.start("imu0").await.unwrap();
        assert_eq!(again.state, DriverState::Running);
        registry.stop("imu0").await.unwrap();
    }

    #[tokio::test]
    async fn stopped_driver_releases_its_resource() {
        let (_bus, registry) = sim_registry(&SimWorld::default());
        registry
            .register(DriverConfig::new("gps0", DriverKind::Gps, "/dev/ttyS0"))
            .unwrap();
        registry.stop("gps0").await.unwrap();
        assert!(registry
            .register(DriverConfig::new("gps1", DriverKind::Gps, "/dev/ttyS0"))
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_health_check_marks_unhealthy() {
        let world = SimWorld::default();
        let (_bus, registry) = sim_registry(&world);
        registry
            .register(DriverConfig::new("env0", DriverKind::Environment, "sim:env"))
            .unwrap();
        registry.start("env0").await.unwrap();
        world.hang_health("env0", true);

        let started = tokio::time::Instant::now();
        let health = registry.health_check("env0").await.unwrap();
        assert_eq!(health, DriverHealth::Unhealthy);
        assert!(started.elapsed() <= Duration::from_millis(510));
        assert_eq!(registry.instance("env0").unwrap().health, DriverHealth::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_faults_degrade_then_recover() {
        let world = SimWorld::default();
        let (bus, registry) = sim_registry(&world);
        let mut health_events = bus.subscribe("drivers/+/health").unwrap();
        registry
            .register(DriverConfig::new("gps0", DriverKind::Gps, "sim:gps"))
            .unwrap();
        world.inject_read_faults("gps0", 2);
        registry.start("gps0").await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        let inst = registry.instance("gps0").unwrap();
        assert_eq!(inst.state, DriverState::Running);
        assert_eq!(inst.consecutive_failures, 0);
        assert_eq!(inst.health, DriverHealth::Healthy);

        let mut seen = Vec::new();
        while let Some(ev) = health_events.try_recv() {
            if let EventPayload::DriverHealth { health, .. } = ev.payload {
                seen.push(health);
            }
        }
        assert_eq!(seen, vec![DriverHealth::Degraded, DriverHealth::Healthy]);
        registry.stop("gps0").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retry_budget_fails_the_driver_on_the_critical_tier() {
        let world = SimWorld::default();
        let (bus, registry) = sim_registry(&world);
        let mut failures = bus.subscribe_critical("test", topics::ALL_DRIVERS).unwrap();
        registry
            .register(DriverConfig::new("imu0", DriverKind::Imu, "sim:imu"))
            .unwrap();
        world.inject_read_faults("imu0", 100);
        registry.start("imu0").await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;

        let inst = registry.instance("imu0").unwrap();
        assert_eq!(inst.state, DriverState::Failed);
        assert_eq!(inst.consecutive_failures, 5);

        let event = failures.recv().await.unwrap();
        assert_eq!(event.tier, DeliveryTier::Critical);
        assert!(matches!(
            event.payload,
            EventPayload::DriverLifecycle {
                state: DriverState::Failed,
                ..
            }
        ));
        // Never restarted automatically.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(registry.instance("imu0").unwrap().state, DriverState::Failed);
    }

    #[tokio::test]
    async fn stop_command_reaches_every_actuator() {
        let world = SimWorld::default();
        let (bus, registry) = sim_registry(&world);
        let mut echoes = bus.subscribe(topics::COMMAND_ECHO).unwrap();
        for cfg in HardwareConfig::simulated().drivers {
            if cfg.kind.is_actuator() {
                registry.register(cfg).unwrap();
            }
        }
        registry.start_all().await.unwrap();

        registry
            .dispatch(&MotionCommand::Blade { enabled: true })
            .await
            .unwrap();
        assert!(world.state().blade_enabled);

        let applied = registry.dispatch(&MotionCommand::Stop).await.unwrap();
        assert_eq!(applied.len(), 2);
        assert!(!world.state().blade_enabled);

        let mut count = 0;
        while echoes.try_recv().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn actuation_task_applies_bus_commands() {
        let world = SimWorld::default();
        let (bus, registry) = sim_registry(&world);
        registry
            .register(DriverConfig::new("blade", DriverKind::BladeMotor, "sim:pwm-1"))
            .unwrap();
        registry.start("blade").await.unwrap();
        let mut echoes = bus.subscribe(topics::COMMAND_ECHO).unwrap();
        let task = registry.spawn_actuation().unwrap();

        bus.publish(
            topics::COMMANDS,
            EventPayload::Command {
                command: MotionCommand::Blade { enabled: true },
                source: mower_types::CommandSource::Operator,
            },
        )
        .unwrap();
        echoes.recv().await.unwrap();
        assert!(world.state().blade_enabled);

        bus.publish_critical(
            topics::COMMANDS,
            EventPayload::Command {
                command: MotionCommand::Stop,
                source: mower_types::CommandSource::Safety,
            },
        )
        .unwrap();
        echoes.recv().await.unwrap();
        assert!(!world.state().blade_enabled);
        // Applied once: the fan-out copy of the critical event is ignored.
        assert!(echoes.try_recv().is_none());
        task.abort();
    }

    #[tokio::test]
    async fn estop_edges_use_the_critical_tier() {
        let world = SimWorld::default();
        let (bus, registry) = sim_registry(&world);
        let mut critical = bus.subscribe_critical("control", "sensors/emergency_stop/#").unwrap();
        registry
            .register(
                DriverConfig::new("estop0", DriverKind::EmergencyStop, "sim:gpio-17")
                    .with_poll_interval(5),
            )
            .unwrap();
        registry.start("estop0").await.unwrap();

        let first = critical.recv().await.unwrap();
        critical.ack(first.sequence).unwrap();
        world.set_estop(true);
        let edge = tokio::time::timeout(Duration::from_secs(1), critical.recv())
            .await
            .unwrap()
            .unwrap();
        match edge.payload {
            EventPayload::Reading(r) => {
                assert_eq!(r.data, ReadingData::EmergencyStop { engaged: true })
            }
            other => panic!("unexpected payload {other:?}"),
        }
        registry.stop("estop0").await.unwrap();
    }
}

//! In-process simulation drivers for running the whole core without
//! hardware.
//!
//! Every simulated driver shares one [`SimWorld`]: the wheel driver writes
//! duty cycles into it, the world integrates a simple differential-drive
//! model, and the sensor drivers sample it. Tests and the operator console
//! poke the world directly (press the e-stop, tilt the chassis, drain the
//! battery) and can inject read faults or hung health checks per driver.
//!
//! ```rust
//! use mower_hal::sim::SimWorld;
//!
//! let world = SimWorld::new(47.0, 8.0);
//! world.set_estop(true);
//! assert!(world.state().estop_engaged);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use mower_types::{ActuatorEcho, DriverHealth, MotionCommand, ReadingData};
use tokio::time::Instant;

use crate::config::{DriverConfig, DriverKind};
use crate::drive::DifferentialDrive;
use crate::driver::{Driver, DriverError};

const METERS_PER_DEG_LAT: f64 = 111_320.0;

/// Range reported by the simulated sonar when nothing is in front of it.
const OBSTACLE_MAX_RANGE_M: f64 = 4.0;

/// Physical state of the simulated robot and its surroundings.
#[derive(Debug, Clone, PartialEq)]
pub struct SimWorldState {
    pub latitude: f64,
    pub longitude: f64,
    pub gps_accuracy_m: f64,
    pub gps_available: bool,
    pub heading_deg: f64,
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub linear_mps: f64,
    /// Clockwise positive.
    pub angular_dps: f64,
    pub left_pwm: f32,
    pub right_pwm: f32,
    pub blade_enabled: bool,
    pub battery_voltage: f64,
    pub battery_current_a: f64,
    pub solar_voltage: f64,
    pub solar_current_a: f64,
    pub temperature_c: f64,
    pub humidity_percent: f64,
    pub rain_detected: bool,
    pub obstacle_distance_m: Option<f64>,
    pub estop_engaged: bool,
    pub drive: DifferentialDrive,
}

impl SimWorldState {
    fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            gps_accuracy_m: 0.02,
            gps_available: true,
            heading_deg: 0.0,
            roll_deg: 0.0,
            pitch_deg: 0.0,
            linear_mps: 0.0,
            angular_dps: 0.0,
            left_pwm: 0.0,
            right_pwm: 0.0,
            blade_enabled: false,
            battery_voltage: 12.6,
            battery_current_a: 0.3,
            solar_voltage: 18.0,
            solar_current_a: 0.5,
            temperature_c: 21.0,
            humidity_percent: 55.0,
            rain_detected: false,
            obstacle_distance_m: None,
            estop_engaged: false,
            drive: DifferentialDrive::default(),
        }
    }

    fn integrate(&mut self, dt: f64) {
        let (v, w_rps) = self.drive.body_velocity(self.left_pwm, self.right_pwm);
        self.linear_mps = v;
        self.angular_dps = w_rps.to_degrees();
        self.heading_deg = (self.heading_deg + self.angular_dps * dt).rem_euclid(360.0);

        let heading = self.heading_deg.to_radians();
        let east = v * heading.sin() * dt;
        let north = v * heading.cos() * dt;
        self.latitude += north / METERS_PER_DEG_LAT;
        self.longitude += east / (METERS_PER_DEG_LAT * self.latitude.to_radians().cos());

        let wheel_load = (self.left_pwm.abs() + self.right_pwm.abs()) as f64 * 1.5;
        let blade_load = if self.blade_enabled { 4.0 } else { 0.0 };
        self.battery_current_a = 0.3 + wheel_load + blade_load;
        let net = self.battery_current_a - self.solar_current_a;
        self.battery_voltage = (self.battery_voltage - net * dt * 5e-5).clamp(9.0, 12.6);
    }
}

#[derive(Debug)]
struct SimInner {
    state: SimWorldState,
    last_step: Option<Instant>,
    read_faults: HashMap<String, u32>,
    fatal: HashSet<String>,
    hung_health: HashSet<String>,
}

/// Shared handle to the simulated world. Clones refer to the same world.
#[derive(Debug, Clone)]
pub struct SimWorld {
    inner: Arc<Mutex<SimInner>>,
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new(47.3769, 8.5417)
    }
}

impl SimWorld {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimInner {
                state: SimWorldState::new(latitude, longitude),
                last_step: None,
                read_faults: HashMap::new(),
                fatal: HashSet::new(),
                hung_health: HashSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advance the physics to now and return a copy of the state.
    pub fn state(&self) -> SimWorldState {
        let mut inner = self.lock();
        let now = Instant::now();
        if let Some(last) = inner.last_step {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                inner.state.integrate(dt);
            }
        }
        inner.last_step = Some(now);
        inner.state.clone()
    }

    /// Mutate the world directly.
    pub fn update(&self, f: impl FnOnce(&mut SimWorldState)) {
        f(&mut self.lock().state);
    }

    pub fn set_estop(&self, engaged: bool) {
        self.update(|s| s.estop_engaged = engaged);
    }

    pub fn set_tilt(&self, roll_deg: f64, pitch_deg: f64) {
        self.update(|s| {
            s.roll_deg = roll_deg;
            s.pitch_deg = pitch_deg;
        });
    }

    pub fn set_battery_voltage(&self, voltage: f64) {
        self.update(|s| s.battery_voltage = voltage);
    }

    pub fn set_temperature(&self, celsius: f64) {
        self.update(|s| s.temperature_c = celsius);
    }

    pub fn set_rain(&self, raining: bool) {
        self.update(|s| s.rain_detected = raining);
    }

    pub fn set_obstacle(&self, distance_m: Option<f64>) {
        self.update(|s| s.obstacle_distance_m = distance_m);
    }

    pub fn set_gps_available(&self, available: bool) {
        self.update(|s| s.gps_available = available);
    }

    /// The next `count` reads of `driver_id` fail with a transient fault.
    pub fn inject_read_faults(&self, driver_id: &str, count: u32) {
        self.lock().read_faults.insert(driver_id.to_string(), count);
    }

    /// Every further read of `driver_id` fails fatally.
    pub fn inject_fatal(&self, driver_id: &str) {
        self.lock().fatal.insert(driver_id.to_string());
    }

    /// Make `driver_id`'s health check never answer.
    pub fn hang_health(&self, driver_id: &str, hung: bool) {
        let mut inner = self.lock();
        if hung {
            inner.hung_health.insert(driver_id.to_string());
        } else {
            inner.hung_health.remove(driver_id);
        }
    }

    fn take_fault(&self, driver_id: &str) -> Option<DriverError> {
        let mut inner = self.lock();
        if inner.fatal.contains(driver_id) {
            return Some(DriverError::Fatal("simulated device failure".into()));
        }
        match inner.read_faults.get_mut(driver_id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Some(DriverError::Transient("simulated read error".into()))
            }
            _ => None,
        }
    }

    fn health_hung(&self, driver_id: &str) -> bool {
        self.lock().hung_health.contains(driver_id)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensors
// ────────────────────────────────────────────────────────────────────────────

/// A simulated sensor of any [`DriverKind`] that is not an actuator.
pub struct SimSensor {
    id: String,
    kind: DriverKind,
    world: SimWorld,
    open: bool,
}

impl SimSensor {
    pub fn new(config: &DriverConfig, world: SimWorld) -> Box<Self> {
        Box::new(Self {
            id: config.id.clone(),
            kind: config.kind,
            world,
            open: false,
        })
    }

    fn sample(&self, s: &SimWorldState) -> Option<ReadingData> {
        let data = match self.kind {
            DriverKind::Gps if !s.gps_available => return None,
            DriverKind::Gps => ReadingData::Gps {
                latitude: s.latitude,
                longitude: s.longitude,
                accuracy_m: s.gps_accuracy_m,
            },
            DriverKind::Imu => ReadingData::Imu {
                roll_deg: s.roll_deg,
                pitch_deg: s.pitch_deg,
                yaw_rate_dps: s.angular_dps,
                heading_deg: Some(s.heading_deg),
            },
            DriverKind::Odometry => ReadingData::Odometry {
                linear_mps: s.linear_mps,
                angular_dps: s.angular_dps,
            },
            DriverKind::Battery => ReadingData::Battery {
                voltage: s.battery_voltage,
                current_a: s.battery_current_a,
            },
            DriverKind::Solar => ReadingData::Solar {
                voltage: s.solar_voltage,
                current_a: s.solar_current_a,
            },
            DriverKind::Environment => ReadingData::Environment {
                temperature_c: s.temperature_c,
                humidity_percent: s.humidity_percent,
                rain_detected: s.rain_detected,
            },
            DriverKind::Obstacle => ReadingData::Obstacle {
                distance_m: s.obstacle_distance_m.unwrap_or(OBSTACLE_MAX_RANGE_M),
            },
            DriverKind::EmergencyStop => ReadingData::EmergencyStop {
                engaged: s.estop_engaged,
            },
            DriverKind::DriveMotors | DriverKind::BladeMotor => return None,
        };
        Some(data)
    }
}

#[async_trait]
impl Driver for SimSensor {
    async fn initialize(&mut self) -> Result<(), DriverError> {
        self.open = true;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<ReadingData>, DriverError> {
        if !self.open {
            return Err(DriverError::Transient("device not open".into()));
        }
        if let Some(fault) = self.world.take_fault(&self.id) {
            return Err(fault);
        }
        Ok(self.sample(&self.world.state()))
    }

    async fn health_check(&mut self) -> Result<DriverHealth, DriverError> {
        if self.world.health_hung(&self.id) {
            std::future::pending::<()>().await;
        }
        Ok(DriverHealth::Healthy)
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        self.open = false;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Actuators
// ────────────────────────────────────────────────────────────────────────────

/// Simulated differential-drive motor controller.
pub struct SimWheels {
    id: String,
    world: SimWorld,
}

impl SimWheels {
    pub fn new(config: &DriverConfig, world: SimWorld) -> Box<Self> {
        let drive = DifferentialDrive::from_config(config);
        world.update(|s| s.drive = drive);
        Box::new(Self {
            id: config.id.clone(),
            world,
        })
    }

    fn set(&self, left: f32, right: f32) -> ActuatorEcho {
        // Integrate the old duty cycles up to now before switching.
        let _ = self.world.state();
        self.world.update(|s| {
            s.left_pwm = left;
            s.right_pwm = right;
        });
        ActuatorEcho::Wheels {
            left_pwm: left,
            right_pwm: right,
        }
    }
}

#[async_trait]
impl Driver for SimWheels {
    async fn initialize(&mut self) -> Result<(), DriverError> {
        self.set(0.0, 0.0);
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<ReadingData>, DriverError> {
        match self.world.take_fault(&self.id) {
            Some(fault) => Err(fault),
            None => Ok(None),
        }
    }

    fn accepts(&self, command: &MotionCommand) -> bool {
        matches!(command, MotionCommand::Drive { .. } | MotionCommand::Stop)
    }

    async fn apply(&mut self, command: &MotionCommand) -> Result<ActuatorEcho, DriverError> {
        match *command {
            MotionCommand::Drive {
                linear_mps,
                angular_rps,
            } => {
                let drive = self.world.state().drive;
                let (left, right) = drive.wheel_pwm(linear_mps, angular_rps);
                Ok(self.set(left, right))
            }
            MotionCommand::Stop => Ok(self.set(0.0, 0.0)),
            MotionCommand::Blade { .. } => Err(DriverError::Unsupported),
        }
    }

    async fn health_check(&mut self) -> Result<DriverHealth, DriverError> {
        if self.world.health_hung(&self.id) {
            std::future::pending::<()>().await;
        }
        Ok(DriverHealth::Healthy)
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        self.set(0.0, 0.0);
        Ok(())
    }
}

/// Simulated blade motor.
pub struct SimBlade {
    id: String,
    world: SimWorld,
}

impl SimBlade {
    pub fn new(config: &DriverConfig, world: SimWorld) -> Box<Self> {
        Box::new(Self {
            id: config.id.clone(),
            world,
        })
    }

    fn set(&self, enabled: bool) -> ActuatorEcho {
        self.world.update(|s| s.blade_enabled = enabled);
        ActuatorEcho::Blade {
            enabled,
            pwm: if enabled { 1.0 } else { 0.0 },
        }
    }
}

#[async_trait]
impl Driver for SimBlade {
    async fn initialize(&mut self) -> Result<(), DriverError> {
        self.set(false);
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<ReadingData>, DriverError> {
        match self.world.take_fault(&self.id) {
            Some(fault) => Err(fault),
            None => Ok(None),
        }
    }

    fn accepts(&self, command: &MotionCommand) -> bool {
        matches!(command, MotionCommand::Blade { .. } | MotionCommand::Stop)
    }

    async fn apply(&mut self, command: &MotionCommand) -> Result<ActuatorEcho, DriverError> {
        match *command {
            MotionCommand::Blade { enabled } => Ok(self.set(enabled)),
            MotionCommand::Stop => Ok(self.set(false)),
            MotionCommand::Drive { .. } => Err(DriverError::Unsupported),
        }
    }

    async fn health_check(&mut self) -> Result<DriverHealth, DriverError> {
        if self.world.health_hung(&self.id) {
            std::future::pending::<()>().await;
        }
        Ok(DriverHealth::Healthy)
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        self.set(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg(id: &str, kind: DriverKind) -> DriverConfig {
        DriverConfig::new(id, kind, format!("sim:{id}"))
    }

    #[tokio::test]
    async fn sensor_reports_world_values() {
        let world = SimWorld::default();
        world.set_tilt(3.0, -40.0);
        let mut imu = SimSensor::new(&cfg("imu0", DriverKind::Imu), world.clone());
        imu.initialize().await.unwrap();
        match imu.read().await.unwrap() {
            Some(ReadingData::Imu { pitch_deg, .. }) => assert_eq!(pitch_deg, -40.0),
            other => panic!("unexpected reading {other:?}"),
        }
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let world = SimWorld::default();
        let mut gps = SimSensor::new(&cfg("gps0", DriverKind::Gps), world.clone());
        gps.initialize().await.unwrap();
        world.inject_read_faults("gps0", 2);
        assert!(matches!(gps.read().await, Err(DriverError::Transient(_))));
        assert!(matches!(gps.read().await, Err(DriverError::Transient(_))));
        assert!(matches!(gps.read().await, Ok(Some(ReadingData::Gps { .. }))));
    }

    #[tokio::test]
    async fn stop_zeroes_every_actuator() {
        let world = SimWorld::default();
        let mut wheels = SimWheels::new(&cfg("wheels", DriverKind::DriveMotors), world.clone());
        let mut blade = SimBlade::new(&cfg("blade", DriverKind::BladeMotor), world.clone());

        wheels
            .apply(&MotionCommand::Drive {
                linear_mps: 0.5,
                angular_rps: 0.0,
            })
            .await
            .unwrap();
        blade.apply(&MotionCommand::Blade { enabled: true }).await.unwrap();
        assert!(world.state().blade_enabled);

        wheels.apply(&MotionCommand::Stop).await.unwrap();
        blade.apply(&MotionCommand::Stop).await.unwrap();
        let s = world.state();
        assert_eq!((s.left_pwm, s.right_pwm, s.blade_enabled), (0.0, 0.0, false));
    }

    #[tokio::test(start_paused = true)]
    async fn driving_north_moves_latitude() {
        let world = SimWorld::default();
        let start = world.state().latitude;
        let mut wheels = SimWheels::new(&cfg("wheels", DriverKind::DriveMotors), world.clone());
        wheels
            .apply(&MotionCommand::Drive {
                linear_mps: 0.5,
                angular_rps: 0.0,
            })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let moved_m = (world.state().latitude - start) * METERS_PER_DEG_LAT;
        assert!((moved_m - 5.0).abs() < 0.05, "moved {moved_m} m");
    }
}

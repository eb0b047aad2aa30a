//! Maps each [`DriverKind`] to a constructor, resolved once at startup.

use std::collections::HashMap;
use std::fmt;

use crate::config::{DriverConfig, DriverKind};
use crate::driver::Driver;
use crate::registry::RegistryError;
use crate::sim::{SimBlade, SimSensor, SimWheels, SimWorld};

/// Builds a driver from its configuration. Must not touch the hardware.
pub type DriverConstructor = Box<dyn Fn(&DriverConfig) -> Box<dyn Driver> + Send + Sync>;

#[derive(Default)]
pub struct DriverFactory {
    constructors: HashMap<DriverKind, DriverConstructor>,
}

impl fmt::Debug for DriverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.constructors.keys().collect();
        kinds.sort_by_key(|k| format!("{k:?}"));
        f.debug_struct("DriverFactory").field("kinds", &kinds).finish()
    }
}

impl DriverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn with(
        mut self,
        kind: DriverKind,
        constructor: impl Fn(&DriverConfig) -> Box<dyn Driver> + Send + Sync + 'static,
    ) -> Self {
        self.constructors.insert(kind, Box::new(constructor));
        self
    }

    /// Every kind backed by a simulation driver sharing `world`.
    pub fn simulation(world: SimWorld) -> Self {
        let sensors = [
            DriverKind::Gps,
            DriverKind::Imu,
            DriverKind::Odometry,
            DriverKind::Battery,
            DriverKind::Solar,
            DriverKind::Environment,
            DriverKind::Obstacle,
            DriverKind::EmergencyStop,
        ];
        let mut factory = Self::new();
        for kind in sensors {
            let w = world.clone();
            factory = factory.with(kind, move |cfg| SimSensor::new(cfg, w.clone()));
        }
        let w = world.clone();
        factory = factory.with(DriverKind::DriveMotors, move |cfg| {
            SimWheels::new(cfg, w.clone())
        });
        factory.with(DriverKind::BladeMotor, move |cfg| {
            SimBlade::new(cfg, world.clone())
        })
    }

    pub fn supports(&self, kind: DriverKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    pub fn build(&self, config: &DriverConfig) -> Result<Box<dyn Driver>, RegistryError> {
        self.constructors
            .get(&config.kind)
            .map(|ctor| ctor(config))
            .ok_or(RegistryError::NoConstructor(config.kind))
    }
}

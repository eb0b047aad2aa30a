//! `HardwareConfig` – which drivers exist, what they claim, and how the
//! registry treats their faults.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::registry::RegistryError;

/// Every driver type the factory knows how to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Gps,
    Imu,
    Odometry,
    Battery,
    Solar,
    Environment,
    Obstacle,
    EmergencyStop,
    DriveMotors,
    BladeMotor,
}

impl DriverKind {
    pub fn is_actuator(self) -> bool {
        matches!(self, DriverKind::DriveMotors | DriverKind::BladeMotor)
    }
}

/// One `[[hardware.drivers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DriverConfig {
    /// Unique driver identifier, also used in topic names.
    pub id: String,
    pub kind: DriverKind,
    /// Exclusive hardware resource (serial port, I²C address, GPIO line).
    pub resource: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Driver-specific numeric parameters.
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl DriverConfig {
    pub fn new(id: impl Into<String>, kind: DriverKind, resource: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            resource: resource.into(),
            poll_interval_ms: default_poll_interval_ms(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_param(mut self, key: &str, value: f64) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn param(&self, key: &str, default: f64) -> f64 {
        self.params.get(key).copied().unwrap_or(default)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Timeouts and retry budget applied to every driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DriverPolicy {
    pub health_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Upper bound on applying one command; exceeding it is a fault.
    pub command_timeout_ms: u64,
    /// Consecutive transient failures tolerated before a driver is failed.
    pub retry_budget: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for DriverPolicy {
    fn default() -> Self {
        Self {
            health_timeout_ms: 500,
            init_timeout_ms: 5_000,
            read_timeout_ms: 1_000,
            command_timeout_ms: 50,
            retry_budget: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

impl DriverPolicy {
    /// Delay before retry number `failures` (1-based), doubling each time.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// The `[hardware]` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct HardwareConfig {
    #[serde(default)]
    pub drivers: Vec<DriverConfig>,
    #[serde(default)]
    pub policy: DriverPolicy,
}

impl HardwareConfig {
    /// One driver of every kind, each on its own simulated resource.
    pub fn simulated() -> Self {
        let drivers = vec![
            DriverConfig::new("gps0", DriverKind::Gps, "sim:/dev/ttyGPS0").with_poll_interval(200),
            DriverConfig::new("imu0", DriverKind::Imu, "sim:i2c-1:0x68").with_poll_interval(20),
            DriverConfig::new("odom0", DriverKind::Odometry, "sim:encoders").with_poll_interval(50),
            DriverConfig::new("bms0", DriverKind::Battery, "sim:i2c-1:0x40").with_poll_interval(1000),
            DriverConfig::new("solar0", DriverKind::Solar, "sim:i2c-1:0x41").with_poll_interval(1000),
            DriverConfig::new("env0", DriverKind::Environment, "sim:i2c-1:0x76")
                .with_poll_interval(1000),
            DriverConfig::new("sonar0", DriverKind::Obstacle, "sim:gpio-23").with_poll_interval(100),
            DriverConfig::new("estop0", DriverKind::EmergencyStop, "sim:gpio-17")
                .with_poll_interval(20),
            DriverConfig::new("wheels", DriverKind::DriveMotors, "sim:pwm-0"),
            DriverConfig::new("blade", DriverKind::BladeMotor, "sim:pwm-1"),
        ];
        Self {
            drivers,
            policy: DriverPolicy::default(),
        }
    }

    /// Rejects duplicate ids and duplicate resource claims. Checked before
    /// any driver is constructed.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut ids = HashMap::new();
        let mut resources: HashMap<&str, &str> = HashMap::new();
        for d in &self.drivers {
            if ids.insert(d.id.as_str(), ()).is_some() {
                return Err(RegistryError::DuplicateId(d.id.clone()));
            }
            if let Some(holder) = resources.insert(d.resource.as_str(), d.id.as_str()) {
                return Err(RegistryError::ResourceConflict {
                    resource: d.resource.clone(),
                    holder: holder.to_string(),
                    requester: d.id.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_config_is_valid() {
        let cfg = HardwareConfig::simulated();
        assert!(cfg.validate().is_ok());
        assert!(cfg.drivers.iter().any(|d| d.kind == DriverKind::EmergencyStop));
    }

    #[test]
    fn duplicate_resource_is_rejected() {
        let cfg = HardwareConfig {
            drivers: vec![
                DriverConfig::new("gps0", DriverKind::Gps, "/dev/ttyS0"),
                DriverConfig::new("gps1", DriverKind::Gps, "/dev/ttyS0"),
            ],
            policy: DriverPolicy::default(),
        };
        match cfg.validate() {
            Err(RegistryError::ResourceConflict {
                resource, holder, ..
            }) => {
                assert_eq!(resource, "/dev/ttyS0");
                assert_eq!(holder, "gps0");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = DriverPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(30), Duration::from_millis(5_000));
    }

    #[test]
    fn parses_from_toml() {
        let cfg: HardwareConfig = toml::from_str(
            r#"
            [[drivers]]
            id = "gps0"
            kind = "gps"
            resource = "/dev/ttyUSB0"
            params = { baud = 9600.0 }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.drivers[0].poll_interval_ms, 100);
        assert_eq!(cfg.drivers[0].param("baud", 0.0), 9600.0);
        assert_eq!(cfg.policy.retry_budget, 5);
    }
}

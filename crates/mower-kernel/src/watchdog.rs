//! [`Watchdog`] – heartbeat monitor for drivers and core tasks.
//!
//! Each monitored component calls [`Watchdog::heartbeat`] (in practice the
//! control loop forwards `system/heartbeat/<component>` events). A component
//! that stays silent past its timeout is reported by [`Watchdog::check_all`],
//! and the control loop raises `watchdog_timeout` for it.
//!
//! Time comes from `tokio::time::Instant` so paused-clock tests can step over
//! the deadline.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Healthy,
    TimedOut,
}

#[derive(Debug)]
struct ComponentEntry {
    last_heartbeat: Instant,
    timeout: Duration,
}

/// Tracks heartbeats from registered components.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use mower_kernel::watchdog::{ComponentHealth, Watchdog};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut wd = Watchdog::new(Duration::from_secs(1));
/// wd.register("gps0");
/// wd.heartbeat("gps0");
/// assert_eq!(wd.health("gps0"), ComponentHealth::Healthy);
/// # }
/// ```
#[derive(Debug)]
pub struct Watchdog {
    default_timeout: Duration,
    components: HashMap<String, ComponentEntry>,
}

impl Watchdog {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            components: HashMap::new(),
        }
    }

    /// Register with the default timeout. The deadline starts now;
    /// re-registering resets it.
    pub fn register(&mut self, component: &str) {
        self.register_with_timeout(component, self.default_timeout);
    }

    pub fn register_with_timeout(&mut self, component: &str, timeout: Duration) {
        self.components.insert(
            component.to_string(),
            ComponentEntry {
                last_heartbeat: Instant::now(),
                timeout,
            },
        );
    }

    /// Stop monitoring `component`, e.g. after a deliberate driver stop.
    pub fn deregister(&mut self, component: &str) {
        self.components.remove(component);
    }

    /// No-op for components that were never registered.
    pub fn heartbeat(&mut self, component: &str) {
        if let Some(entry) = self.components.get_mut(component) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Unknown components count as timed out.
    pub fn health(&self, component: &str) -> ComponentHealth {
        match self.components.get(component) {
            Some(entry) if entry.last_heartbeat.elapsed() <= entry.timeout => {
                ComponentHealth::Healthy
            }
            _ => ComponentHealth::TimedOut,
        }
    }

    /// Timed-out components, sorted by id.
    pub fn check_all(&self) -> Vec<String> {
        let mut frozen: Vec<String> = self
            .components
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat.elapsed() > entry.timeout)
            .map(|(id, _)| id.clone())
            .collect();
        frozen.sort();
        frozen
    }

    pub fn is_registered(&self, component: &str) -> bool {
        self.components.contains_key(component)
    }
}

//! Driver lifecycle and health vocabulary, shared by the HAL and the bus.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one driver instance.
///
/// `Uninitialized → Initializing → Ready → Running → Stopped`, with `Failed`
/// reachable from every non-terminal state. `Stopped` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Uninitialized,
    Initializing,
    Ready,
    Running,
    Stopped,
    Failed,
}

impl DriverState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DriverState::Stopped | DriverState::Failed)
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverState::Uninitialized => "uninitialized",
            DriverState::Initializing => "initializing",
            DriverState::Ready => "ready",
            DriverState::Running => "running",
            DriverState::Stopped => "stopped",
            DriverState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Health reported by (or inferred for) a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverHealth {
    Healthy,
    /// Transient faults are being retried but have not exhausted the budget.
    Degraded,
    /// The health check failed or did not answer in time.
    Unhealthy,
}

impl fmt::Display for DriverHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverHealth::Healthy => "healthy",
            DriverHealth::Degraded => "degraded",
            DriverHealth::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(DriverState::Stopped.is_terminal());
        assert!(DriverState::Failed.is_terminal());
        assert!(!DriverState::Running.is_terminal());
        assert!(!DriverState::Uninitialized.is_terminal());
    }
}

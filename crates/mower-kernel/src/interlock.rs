//! [`SafetyInterlockManager`] – rule engine that turns a [`RobotState`] into
//! the set of active safety interlocks.
//!
//! Every registered [`InterlockRule`] is evaluated against the fused state on
//! each tick. A rule reports whether its condition currently holds; the
//! manager layers the interlock lifecycle on top:
//!
//! ```text
//!            condition holds                 condition gone
//!   (none) ─────────────────► active ───────────────────────► cleared_pending_ack
//!                               ▲                                   │
//!                               └────────── holds again ────────────┤
//!                                                                   │ acknowledge()
//!                                                                   ▼
//!                                                             acknowledged (removed)
//! ```
//!
//! Kinds that do not require acknowledgment (`low_battery`,
//! `high_temperature`, `obstacle_detected`) skip the pending state and are
//! removed as soon as their condition clears. Hysteresis is the rule's job:
//! it is told whether its interlock is currently active.
//!
//! [`SafetyInterlockManager::screen`] is the fast path for raw e-stop, IMU
//! and obstacle readings. It only ever raises interlocks, never clears them, and does no
//! I/O.

use std::collections::{BTreeMap, BTreeSet};

use mower_planner::Geofence;
use mower_types::{
    EventPayload, InterlockKind, InterlockStatus, ReadingData, RobotState, SensorReading,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::limits::SafetyLimits;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single condition that, while it holds, blocks motion.
pub trait InterlockRule: Send + Sync {
    fn kind(&self) -> InterlockKind;

    /// `Some(detail)` while the condition holds. `latched` is `true` when the
    /// interlock is currently active, so the rule can apply hysteresis or
    /// hold its state when the input is missing.
    fn check(&self, state: &RobotState, limits: &SafetyLimits, latched: bool) -> Option<String>;
}

pub struct EmergencyStopRule;

impl InterlockRule for EmergencyStopRule {
    fn kind(&self) -> InterlockKind {
        InterlockKind::EmergencyStop
    }

    fn check(&self, state: &RobotState, _: &SafetyLimits, _: bool) -> Option<String> {
        state
            .estop_engaged
            .then(|| "emergency stop engaged".to_string())
    }
}

pub struct TiltRule;

impl InterlockRule for TiltRule {
    fn kind(&self) -> InterlockKind {
        InterlockKind::TiltDetected
    }

    fn check(&self, state: &RobotState, limits: &SafetyLimits, _: bool) -> Option<String> {
        tilt_breach(state.roll_deg, state.pitch_deg, limits.max_tilt_deg)
    }
}

fn tilt_breach(roll: f64, pitch: f64, max: f64) -> Option<String> {
    (roll.abs() > max || pitch.abs() > max)
        .then(|| format!("roll {roll:.1}° / pitch {pitch:.1}° exceeds {max:.1}°"))
}

pub struct LowBatteryRule;

impl InterlockRule for LowBatteryRule {
    fn kind(&self) -> InterlockKind {
        InterlockKind::LowBattery
    }

    fn check(&self, state: &RobotState, limits: &SafetyLimits, latched: bool) -> Option<String> {
        let clear_above = limits.low_battery_voltage + limits.battery_hysteresis_v;
        match state.battery_voltage {
            Some(v) if v < limits.low_battery_voltage => Some(format!(
                "battery {v:.2} V below {:.2} V",
                limits.low_battery_voltage
            )),
            Some(v) if latched && v <= clear_above => {
                Some(format!("battery {v:.2} V not yet above {clear_above:.2} V"))
            }
            None if latched => Some("battery voltage unknown".to_string()),
            _ => None,
        }
    }
}

pub struct HighTemperatureRule;

impl InterlockRule for HighTemperatureRule {
    fn kind(&self) -> InterlockKind {
        InterlockKind::HighTemperature
    }

    fn check(&self, state: &RobotState, limits: &SafetyLimits, latched: bool) -> Option<String> {
        let clear_below = limits.max_temperature_c - limits.temperature_hysteresis_c;
        match state.temperature_c {
            Some(t) if t > limits.max_temperature_c => Some(format!(
                "temperature {t:.1} °C above {:.1} °C",
                limits.max_temperature_c
            )),
            Some(t) if latched && t >= clear_below => {
                Some(format!("temperature {t:.1} °C not yet below {clear_below:.1} °C"))
            }
            None if latched => Some("temperature unknown".to_string()),
            _ => None,
        }
    }
}

pub struct ObstacleRule;

impl InterlockRule for ObstacleRule {
    fn kind(&self) -> InterlockKind {
        InterlockKind::ObstacleDetected
    }

    fn check(&self, state: &RobotState, limits: &SafetyLimits, _: bool) -> Option<String> {
        state
            .obstacle_distance_m
            .filter(|d| *d < limits.obstacle_stop_distance_m)
            .map(|d| format!("obstacle at {d:.2} m"))
    }
}

pub struct WatchdogRule;

impl InterlockRule for WatchdogRule {
    fn kind(&self) -> InterlockKind {
        InterlockKind::WatchdogTimeout
    }

    fn check(&self, state: &RobotState, _: &SafetyLimits, _: bool) -> Option<String> {
        (!state.watchdog_healthy).then(|| "component heartbeat missed".to_string())
    }
}

/// Raised while the fused position is outside the geofence plus its buffer.
pub struct GeofenceRule {
    fence: Geofence,
}

impl GeofenceRule {
    pub fn new(fence: Geofence) -> Self {
        Self { fence }
    }

    pub fn fence(&self) -> &Geofence {
        &self.fence
    }
}

impl InterlockRule for GeofenceRule {
    fn kind(&self) -> InterlockKind {
        InterlockKind::GeofenceViolation
    }

    fn check(&self, state: &RobotState, _: &SafetyLimits, latched: bool) -> Option<String> {
        match state.position {
            Some(p) if !self.fence.permits(&p) => Some(format!(
                "position ({:.2}, {:.2}) outside geofence '{}'",
                p.x,
                p.y,
                self.fence.name()
            )),
            None if latched => Some("position unknown".to_string()),
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Records and transitions
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterlockRecord {
    pub kind: InterlockKind,
    pub status: InterlockStatus,
    pub detail: String,
    pub raised_at_us: u64,
    pub cleared_at_us: Option<u64>,
}

/// A lifecycle change, to be published on the critical tier.
#[derive(Debug, Clone, PartialEq)]
pub struct InterlockTransition {
    pub kind: InterlockKind,
    pub status: InterlockStatus,
    pub detail: String,
}

impl InterlockTransition {
    pub fn to_payload(&self) -> EventPayload {
        EventPayload::Interlock {
            kind: self.kind,
            status: self.status,
            detail: self.detail.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("no {0} interlock to acknowledge")]
    NotRaised(InterlockKind),

    #[error("{0} condition still holds")]
    StillActive(InterlockKind),
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyInterlockManager
// ────────────────────────────────────────────────────────────────────────────

pub struct SafetyInterlockManager {
    limits: SafetyLimits,
    rules: Vec<Box<dyn InterlockRule>>,
    geofence: Option<GeofenceRule>,
    records: BTreeMap<InterlockKind, InterlockRecord>,
}

impl SafetyInterlockManager {
    /// A manager with every built-in rule except the geofence, which needs
    /// [`set_geofence`](Self::set_geofence).
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            limits,
            rules: vec![
                Box::new(EmergencyStopRule),
                Box::new(TiltRule),
                Box::new(WatchdogRule),
                Box::new(LowBatteryRule),
                Box::new(HighTemperatureRule),
                Box::new(ObstacleRule),
            ],
            geofence: None,
            records: BTreeMap::new(),
        }
    }

    /// Register an additional rule. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn InterlockRule>) {
        self.rules.push(rule);
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    pub fn set_geofence(&mut self, fence: Option<Geofence>) {
        self.geofence = fence.map(GeofenceRule::new);
    }

    pub fn geofence(&self) -> Option<&Geofence> {
        self.geofence.as_ref().map(GeofenceRule::fence)
    }

    fn all_rules(&self) -> impl Iterator<Item = &dyn InterlockRule> {
        self.rules
            .iter()
            .map(|r| r.as_ref())
            .chain(self.geofence.as_ref().map(|g| g as &dyn InterlockRule))
    }

    /// Conditions that hold for `state`, without touching the lifecycle.
    pub fn breached(&self, state: &RobotState) -> BTreeSet<InterlockKind> {
        self.all_rules()
            .filter(|rule| {
                let latched = self.status(rule.kind()) == Some(InterlockStatus::Active);
                rule.check(state, &self.limits, latched).is_some()
            })
            .map(|rule| rule.kind())
            .collect()
    }

    /// Re-evaluate every rule against `state` and advance the lifecycle.
    pub fn evaluate(&mut self, state: &RobotState) -> Vec<InterlockTransition> {
        // Several rules may share a kind; the condition holds if any of them
        // reports it.
        let mut conditions: BTreeMap<InterlockKind, Option<String>> = BTreeMap::new();
        for rule in self.all_rules() {
            let latched = self.status(rule.kind()) == Some(InterlockStatus::Active);
            let condition = rule.check(state, &self.limits, latched);
            let slot = conditions.entry(rule.kind()).or_insert(None);
            if slot.is_none() {
                *slot = condition;
            }
        }

        let mut transitions = Vec::new();
        for (kind, condition) in conditions {
            self.apply(kind, condition, state.timestamp_us, &mut transitions);
        }
        transitions
    }

    /// Fast path for raw readings: raises `emergency_stop`, `tilt_detected`
    /// or `obstacle_detected` straight from the sample, ahead of the next
    /// fusion tick.
    pub fn screen(&mut self, reading: &SensorReading) -> Vec<InterlockTransition> {
        let condition = match &reading.data {
            ReadingData::EmergencyStop { engaged: true } => Some((
                InterlockKind::EmergencyStop,
                format!("emergency stop engaged ({})", reading.sensor_id),
            )),
            ReadingData::Imu {
                roll_deg,
                pitch_deg,
                ..
            } => tilt_breach(*roll_deg, *pitch_deg, self.limits.max_tilt_deg)
                .map(|detail| (InterlockKind::TiltDetected, detail)),
            ReadingData::Obstacle { distance_m }
                if *distance_m < self.limits.obstacle_stop_distance_m =>
            {
                Some((
                    InterlockKind::ObstacleDetected,
                    format!("obstacle at {distance_m:.2} m ({})", reading.sensor_id),
                ))
            }
            _ => None,
        };

        let mut transitions = Vec::new();
        if let Some((kind, detail)) = condition {
            self.apply(kind, Some(detail), reading.timestamp_us, &mut transitions);
        }
        transitions
    }

    fn apply(
        &mut self,
        kind: InterlockKind,
        condition: Option<String>,
        now_us: u64,
        out: &mut Vec<InterlockTransition>,
    ) {
        match (self.records.get_mut(&kind), condition) {
            (None, Some(detail)) => {
                warn!(interlock = %kind, %detail, "interlock raised");
                self.records.insert(
                    kind,
                    InterlockRecord {
                        kind,
                        status: InterlockStatus::Active,
                        detail: detail.clone(),
                        raised_at_us: now_us,
                        cleared_at_us: None,
                    },
                );
                out.push(InterlockTransition {
                    kind,
                    status: InterlockStatus::Active,
                    detail,
                });
            }
            (Some(record), Some(detail)) => {
                let reactivated = record.status == InterlockStatus::ClearedPendingAck;
                record.status = InterlockStatus::Active;
                record.detail = detail.clone();
                record.cleared_at_us = None;
                if reactivated {
                    warn!(interlock = %kind, %detail, "interlock re-raised before acknowledgment");
                    out.push(InterlockTransition {
                        kind,
                        status: InterlockStatus::Active,
                        detail,
                    });
                }
            }
            (Some(record), None) if record.status == InterlockStatus::Active => {
                if kind.requires_ack() {
                    record.status = InterlockStatus::ClearedPendingAck;
                    record.cleared_at_us = Some(now_us);
                    warn!(interlock = %kind, "condition cleared, awaiting acknowledgment");
                    out.push(InterlockTransition {
                        kind,
                        status: InterlockStatus::ClearedPendingAck,
                        detail: "condition cleared, acknowledgment required".to_string(),
                    });
                } else {
                    self.records.remove(&kind);
                    info!(interlock = %kind, "interlock cleared");
                    out.push(InterlockTransition {
                        kind,
                        status: InterlockStatus::Acknowledged,
                        detail: "condition cleared".to_string(),
                    });
                }
            }
            _ => {}
        }
    }

    /// Operator acknowledgment. Only interlocks whose condition has already
    /// cleared can be acknowledged.
    pub fn acknowledge(&mut self, kind: InterlockKind) -> Result<InterlockTransition, AckError> {
        match self.records.get(&kind).map(|r| r.status) {
            None => Err(AckError::NotRaised(kind)),
            Some(InterlockStatus::Active) => Err(AckError::StillActive(kind)),
            Some(_) => {
                self.records.remove(&kind);
                info!(interlock = %kind, "interlock acknowledged");
                Ok(InterlockTransition {
                    kind,
                    status: InterlockStatus::Acknowledged,
                    detail: "acknowledged by operator".to_string(),
                })
            }
        }
    }

    pub fn status(&self, kind: InterlockKind) -> Option<InterlockStatus> {
        self.records.get(&kind).map(|r| r.status)
    }

    /// Every interlock that is active or awaiting acknowledgment.
    pub fn active_set(&self) -> BTreeSet<InterlockKind> {
        self.records.keys().copied().collect()
    }

    /// `true` when at least one condition currently holds.
    pub fn has_active(&self) -> bool {
        self.records
            .values()
            .any(|r| r.status == InterlockStatus::Active)
    }

    pub fn is_clear(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> Vec<InterlockRecord> {
        self.records.values().cloned().collect()
    }
}

//! Sensor Fusion Engine.
//!
//! Folds raw [`SensorReading`]s into the canonical [`RobotState`] once per
//! fusion tick. Between ticks readings are only buffered, one per sensor,
//! last value wins. At each tick the engine:
//!
//! 1. applies the buffered readings oldest first; several obstacle sensors
//!    fuse to the nearest distance and several e-stop switches to "any
//!    engaged",
//! 2. blends gyro integration with the magnetometer heading using a
//!    complementary filter,
//! 3. dead-reckons position from odometry while GPS is stale,
//! 4. flags channels whose newest reading is older than the staleness window
//!    as low-confidence (their fields keep the last value).
//!
//! The heading filter:
//! ```text
//! predicted = heading + yaw_rate · dt
//! heading   = predicted + (1 − α) · wrap(magnetometer − predicted)
//! ```
//! with α ∈ [0, 1]; higher α trusts the gyro more.
//!
//! Safety and navigation fields are not sensor-derived. The control loop
//! computes them from the draft returned by [`FusionEngine::tick`] and hands
//! them back through [`FusionEngine::commit`], which yields the snapshot to
//! publish. The engine is the only code that builds `RobotState` values.
//!
//! # Example
//!
//! ```rust
//! use mower_perception::fusion::{FusionConfig, FusionEngine, SafetyOverlay};
//! use mower_types::{ReadingData, SensorReading};
//!
//! let mut fusion = FusionEngine::new(FusionConfig::default());
//! let now = 1_700_000_000_000_000;
//! fusion.ingest(
//!     SensorReading::new("bms0", now, ReadingData::Battery { voltage: 11.3, current_a: 2.0 }),
//!     now,
//! );
//! fusion.tick(now + 1);
//! let state = fusion.commit(SafetyOverlay::default());
//! assert_eq!(state.battery_voltage, Some(11.3));
//! assert!((state.battery_percent.unwrap() - 50.0).abs() < 1e-9);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::time::Duration;

use mower_types::geometry::heading_error_deg;
use mower_types::{
    ActuatorEcho, InterlockKind, NavigationMode, Point, ReadingData, RobotState, SensorChannel,
    SensorReading, WaypointRef,
};
use tracing::{debug, trace};

use crate::battery::BatteryModel;
use crate::frame::LocalFrame;

// ────────────────────────────────────────────────────────────────────────────
// Configuration and results
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    /// Complementary filter coefficient, clamped to `[0, 1]`.
    pub alpha: f64,
    /// Readings older than this are discarded and their channel is flagged
    /// low-confidence.
    pub staleness: Duration,
    /// Without a GPS fix for this long, position is dead-reckoned.
    pub gps_timeout: Duration,
    /// Origin of the local frame. When `None`, the first GPS fix is used.
    pub datum: Option<(f64, f64)>,
    pub battery: BatteryModel,
    /// Position uncertainty added per metre of dead reckoning.
    pub drift_per_meter: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.98,
            staleness: Duration::from_secs(10),
            gps_timeout: Duration::from_secs(2),
            datum: None,
            battery: BatteryModel::default(),
            drift_per_meter: 0.05,
        }
    }
}

/// What happened to a reading handed to [`FusionEngine::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Older than the current state snapshot.
    OutOfOrder,
    /// Older than the staleness window.
    Stale,
    /// A newer reading from the same sensor is already buffered.
    Superseded,
}

/// Fields owned by the safety and navigation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyOverlay {
    pub active_interlocks: BTreeSet<InterlockKind>,
    pub watchdog_healthy: bool,
    pub navigation_mode: NavigationMode,
    pub current_waypoint: Option<WaypointRef>,
}

impl Default for SafetyOverlay {
    fn default() -> Self {
        Self {
            active_interlocks: BTreeSet::new(),
            watchdog_healthy: true,
            navigation_mode: NavigationMode::Idle,
            current_waypoint: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FusionEngine
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FusionEngine {
    config: FusionConfig,
    frame: Option<LocalFrame>,
    pending: BTreeMap<String, SensorReading>,
    /// Latest distance per obstacle sensor.
    obstacles: BTreeMap<String, f64>,
    /// Latest switch position per e-stop input.
    estops: BTreeMap<String, bool>,
    /// Timestamp of the newest accepted reading per channel.
    last_seen: BTreeMap<SensorChannel, u64>,
    last_gps_us: Option<u64>,
    last_tick_us: Option<u64>,
    heading_initialized: bool,
    state: RobotState,
}

impl FusionEngine {
    pub fn new(mut config: FusionConfig) -> Self {
        config.alpha = config.alpha.clamp(0.0, 1.0);
        let frame = config.datum.map(|(lat, lon)| LocalFrame::new(lat, lon));
        Self {
            config,
            frame,
            pending: BTreeMap::new(),
            obstacles: BTreeMap::new(),
            estops: BTreeMap::new(),
            last_seen: BTreeMap::new(),
            last_gps_us: None,
            last_tick_us: None,
            heading_initialized: false,
            state: RobotState::default(),
        }
    }

    /// The most recent snapshot (draft or committed).
    pub fn state(&self) -> &RobotState {
        &self.state
    }

    pub fn frame(&self) -> Option<&LocalFrame> {
        self.frame.as_ref()
    }

    pub fn battery_model(&self) -> &BatteryModel {
        &self.config.battery
    }

    /// Buffer `reading` for the next tick.
    pub fn ingest(&mut self, reading: SensorReading, now_us: u64) -> IngestOutcome {
        let channel = reading.channel();
        let staleness_us = self.config.staleness.as_micros() as u64;

        if reading.timestamp_us < self.state.timestamp_us {
            trace!(sensor = %reading.sensor_id, %channel, "out-of-order reading discarded");
            return IngestOutcome::OutOfOrder;
        }
        if now_us.saturating_sub(reading.timestamp_us) > staleness_us {
            debug!(sensor = %reading.sensor_id, %channel, "stale reading discarded");
            return IngestOutcome::Stale;
        }
        if let Some(buffered) = self.pending.get(&reading.sensor_id) {
            if buffered.timestamp_us > reading.timestamp_us {
                return IngestOutcome::Superseded;
            }
        }

        let seen = self.last_seen.entry(channel).or_insert(0);
        *seen = (*seen).max(reading.timestamp_us);
        self.pending.insert(reading.sensor_id.clone(), reading);
        IngestOutcome::Accepted
    }

    /// Record what an actuator reported after applying a command.
    pub fn ingest_echo(&mut self, echo: &ActuatorEcho) {
        self.state.motors.apply_echo(echo);
    }

    /// Apply everything buffered since the last tick and return the draft
    /// snapshot. The timestamp is `now_us`, or one past the previous
    /// snapshot if the clock has not advanced.
    pub fn tick(&mut self, now_us: u64) -> &RobotState {
        let ts = now_us.max(self.state.timestamp_us + 1);
        let dt = self
            .last_tick_us
            .map(|t| ts.saturating_sub(t) as f64 / 1e6)
            .unwrap_or(0.0);

        let mut gps_fix = None;
        let mut magnetometer = None;
        let mut yaw_rate = None;

        let mut readings: Vec<SensorReading> = mem::take(&mut self.pending).into_values().collect();
        readings.sort_by_key(|r| r.timestamp_us);
        for reading in readings {
            match reading.data {
                ReadingData::Gps {
                    latitude,
                    longitude,
                    accuracy_m,
                } => gps_fix = Some((latitude, longitude, accuracy_m, reading.timestamp_us)),
                ReadingData::Imu {
                    roll_deg,
                    pitch_deg,
                    yaw_rate_dps,
                    heading_deg,
                } => {
                    self.state.roll_deg = roll_deg;
                    self.state.pitch_deg = pitch_deg;
                    yaw_rate = Some(yaw_rate_dps);
                    magnetometer = heading_deg;
                }
                ReadingData::Odometry {
                    linear_mps,
                    angular_dps,
                } => {
                    self.state.velocity_mps = linear_mps;
                    self.state.angular_velocity_dps = angular_dps;
                }
                ReadingData::Battery { voltage, current_a } => {
                    self.state.battery_voltage = Some(voltage);
                    self.state.battery_current_a = Some(current_a);
                    self.state.battery_percent = Some(self.config.battery.percent(voltage));
                }
                ReadingData::Solar { voltage, current_a } => {
                    self.state.solar_voltage = Some(voltage);
                    self.state.solar_current_a = Some(current_a);
                }
                ReadingData::Environment {
                    temperature_c,
                    humidity_percent,
                    rain_detected,
                } => {
                    self.state.temperature_c = Some(temperature_c);
                    self.state.humidity_percent = Some(humidity_percent);
                    self.state.rain_detected = rain_detected;
                }
                ReadingData::Obstacle { distance_m } => {
                    self.obstacles.insert(reading.sensor_id, distance_m);
                }
                ReadingData::EmergencyStop { engaged } => {
                    self.estops.insert(reading.sensor_id, engaged);
                }
            }
        }
        if let Some(nearest) = self.obstacles.values().copied().reduce(f64::min) {
            self.state.obstacle_distance_m = Some(nearest);
        }
        self.state.estop_engaged = self.estops.values().any(|&engaged| engaged);

        if let Some(rate) = yaw_rate {
            self.state.angular_velocity_dps = rate;
        }
        self.update_heading(dt, magnetometer);
        self.update_position(ts, dt, gps_fix);

        let staleness_us = self.config.staleness.as_micros() as u64;
        self.state.low_confidence = self
            .last_seen
            .iter()
            .filter(|&(_, &seen)| ts.saturating_sub(seen) > staleness_us)
            .map(|(&channel, _)| channel)
            .collect();

        self.state.timestamp_us = ts;
        self.last_tick_us = Some(ts);
        &self.state
    }

    fn update_heading(&mut self, dt: f64, magnetometer: Option<f64>) {
        let predicted = self.state.heading_deg + self.state.angular_velocity_dps * dt;
        let heading = match magnetometer {
            Some(mag) if !self.heading_initialized => {
                self.heading_initialized = true;
                mag
            }
            Some(mag) => predicted + (1.0 - self.config.alpha) * heading_error_deg(predicted, mag),
            None => predicted,
        };
        self.state.heading_deg = heading.rem_euclid(360.0);
    }

    fn update_position(&mut self, ts: u64, dt: f64, fix: Option<(f64, f64, f64, u64)>) {
        if let Some((lat, lon, accuracy, at)) = fix {
            let frame = *self
                .frame
                .get_or_insert_with(|| LocalFrame::new(lat, lon));
            self.state.position = Some(frame.to_local(lat, lon));
            self.state.latitude = Some(lat);
            self.state.longitude = Some(lon);
            self.state.position_accuracy_m = Some(accuracy);
            self.last_gps_us = Some(at);
            return;
        }

        let gps_stale = self
            .last_gps_us
            .is_none_or(|t| ts.saturating_sub(t) > self.config.gps_timeout.as_micros() as u64);
        let odometry_fresh = self.last_seen.contains_key(&SensorChannel::Odometry)
            && !self.state.low_confidence.contains(&SensorChannel::Odometry);
        let (Some(frame), Some(position)) = (self.frame, self.state.position) else {
            return;
        };
        if !gps_stale || !odometry_fresh || dt <= 0.0 {
            return;
        }

        let distance = self.state.velocity_mps * dt;
        let heading = self.state.heading_deg.to_radians();
        let next = Point::new(
            position.x + distance * heading.sin(),
            position.y + distance * heading.cos(),
        );
        let (lat, lon) = frame.to_geo(next);
        self.state.position = Some(next);
        self.state.latitude = Some(lat);
        self.state.longitude = Some(lon);
        self.state.position_accuracy_m = self
            .state
            .position_accuracy_m
            .map(|a| a + distance.abs() * self.config.drift_per_meter);
    }

    /// Attach the safety and navigation fields to the current draft and
    /// return the snapshot to publish.
    pub fn commit(&mut self, overlay: SafetyOverlay) -> RobotState {
        self.state.active_interlocks = overlay.active_interlocks;
        self.state.watchdog_healthy = overlay.watchdog_healthy;
        self.state.navigation_mode = overlay.navigation_mode;
        self.state.current_waypoint = overlay.current_waypoint;
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000_000;
    const SEC: u64 = 1_000_000;

    fn battery(ts: u64, voltage: f64) -> SensorReading {
        SensorReading::new(
            "bms0",
            ts,
            ReadingData::Battery {
                voltage,
                current_a: 1.0,
            },
        )
    }

    fn imu(ts: u64, heading: Option<f64>, yaw_rate: f64) -> SensorReading {
        SensorReading::new(
            "imu0",
            ts,
            ReadingData::Imu {
                roll_deg: 0.0,
                pitch_deg: 0.0,
                yaw_rate_dps: yaw_rate,
                heading_deg: heading,
            },
        )
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut fusion = FusionEngine::new(FusionConfig::default());
        let a = fusion.tick(T0).timestamp_us;
        let b = fusion.tick(T0).timestamp_us;
        let c = fusion.tick(T0 - SEC).timestamp_us;
        assert!(a < b && b < c);
    }

    #[test]
    fn out_of_order_readings_are_discarded() {
        let mut fusion = FusionEngine::new(FusionConfig::default());
        fusion.ingest(battery(T0, 12.0), T0);
        fusion.tick(T0 + 10);

        assert_eq!(fusion.ingest(battery(T0 + 5, 10.5), T0 + 20), IngestOutcome::OutOfOrder);
        fusion.tick(T0 + 30);
        assert_eq!(fusion.state().battery_voltage, Some(12.0));
    }

    #[test]
    fn last_value_wins_within_a_tick() {
        let mut fusion = FusionEngine::new(FusionConfig::default());
        assert_eq!(fusion.ingest(battery(T0 + 2, 11.0), T0 + 3), IngestOutcome::Accepted);
        assert_eq!(fusion.ingest(battery(T0 + 1, 12.0), T0 + 3), IngestOutcome::Superseded);
        assert_eq!(fusion.ingest(battery(T0 + 3, 11.5), T0 + 3), IngestOutcome::Accepted);
        fusion.tick(T0 + 4);
        assert_eq!(fusion.state().battery_voltage, Some(11.5));
    }

    #[test]
    fn readings_are_kept_per_sensor() {
        let tof = |id: &str, ts: u64, distance_m: f64| {
            SensorReading::new(id, ts, ReadingData::Obstacle { distance_m })
        };
        let mut fusion = FusionEngine::new(FusionConfig::default());
        assert_eq!(fusion.ingest(tof("tof_left", T0, 0.2), T0), IngestOutcome::Accepted);
        assert_eq!(fusion.ingest(tof("tof_right", T0 + 1, 3.0), T0 + 1), IngestOutcome::Accepted);
        assert_eq!(fusion.tick(T0 + 2).obstacle_distance_m, Some(0.2));

        // The left sensor's last reading still counts while only the right
        // one reports.
        fusion.ingest(tof("tof_right", T0 + 3, 2.5), T0 + 3);
        assert_eq!(fusion.tick(T0 + 4).obstacle_distance_m, Some(0.2));
        fusion.ingest(tof("tof_left", T0 + 5, 4.0), T0 + 5);
        assert_eq!(fusion.tick(T0 + 6).obstacle_distance_m, Some(2.5));

        // Either switch holds the e-stop.
        let estop = |id: &str, ts: u64, engaged: bool| {
            SensorReading::new(id, ts, ReadingData::EmergencyStop { engaged })
        };
        fusion.ingest(estop("estop_deck", T0 + 7, true), T0 + 7);
        fusion.ingest(estop("estop_remote", T0 + 8, false), T0 + 8);
        assert!(fusion.tick(T0 + 9).estop_engaged);
        fusion.ingest(estop("estop_deck", T0 + 10, false), T0 + 10);
        assert!(!fusion.tick(T0 + 11).estop_engaged);
    }

    #[test]
    fn stale_channel_keeps_value_but_loses_confidence() {
        let mut fusion = FusionEngine::new(FusionConfig::default());
        fusion.ingest(battery(T0, 11.3), T0);
        fusion.tick(T0 + 1);
        assert!(!fusion.state().is_low_confidence(SensorChannel::Battery));

        fusion.tick(T0 + 11 * SEC);
        let state = fusion.state();
        assert_eq!(state.battery_voltage, Some(11.3));
        assert!(state.is_low_confidence(SensorChannel::Battery));

        // A reading already older than the window is dropped outright.
        assert_eq!(
            fusion.ingest(battery(T0 + 12 * SEC, 12.0), T0 + 23 * SEC),
            IngestOutcome::Stale
        );
    }

    #[test]
    fn complementary_filter_pulls_toward_magnetometer() {
        let mut fusion = FusionEngine::new(FusionConfig {
            alpha: 0.5,
            ..FusionConfig::default()
        });
        fusion.ingest(imu(T0, Some(350.0), 0.0), T0);
        fusion.tick(T0 + 1);
        assert_eq!(fusion.state().heading_deg, 350.0);

        // Magnetometer now says 10°: the estimate moves halfway, across north.
        fusion.ingest(imu(T0 + 100_000, Some(10.0), 0.0), T0 + 100_000);
        fusion.tick(T0 + 200_000);
        assert!((fusion.state().heading_deg - 0.0).abs() < 1e-9);
    }

    #[test]
    fn gyro_integrates_between_magnetometer_samples() {
        let mut fusion = FusionEngine::new(FusionConfig::default());
        fusion.ingest(imu(T0, Some(90.0), 0.0), T0);
        fusion.tick(T0);
        fusion.ingest(imu(T0 + SEC / 2, None, 10.0), T0 + SEC / 2);
        fusion.tick(T0 + SEC);
        assert!((fusion.state().heading_deg - 100.0).abs() < 1e-6);
    }

    #[test]
    fn dead_reckons_when_gps_goes_quiet() {
        let mut fusion = FusionEngine::new(FusionConfig {
            datum: Some((47.0, 8.0)),
            ..FusionConfig::default()
        });
        fusion.ingest(
            SensorReading::new(
                "gps0",
                T0,
                ReadingData::Gps {
                    latitude: 47.0,
                    longitude: 8.0,
                    accuracy_m: 0.05,
                },
            ),
            T0,
        );
        fusion.ingest(imu(T0, Some(90.0), 0.0), T0);
        fusion.tick(T0);
        assert_eq!(fusion.state().position, Some(Point::new(0.0, 0.0)));

        // GPS silent; driving east at 0.5 m/s.
        for i in 1..=10 {
            let t = T0 + i * SEC;
            fusion.ingest(
                SensorReading::new(
                    "odom0",
                    t,
                    ReadingData::Odometry {
                        linear_mps: 0.5,
                        angular_dps: 0.0,
                    },
                ),
                t,
            );
            fusion.tick(t);
        }
        let p = fusion.state().position.unwrap();
        // The first two seconds are inside the GPS timeout.
        assert!((p.x - 4.0).abs() < 1e-6, "x = {}", p.x);
        assert!(p.y.abs() < 1e-6);
        assert!(fusion.state().position_accuracy_m.unwrap() > 0.05);
    }

    #[test]
    fn commit_carries_safety_fields() {
        let mut fusion = FusionEngine::new(FusionConfig::default());
        fusion.tick(T0);
        let state = fusion.commit(SafetyOverlay {
            active_interlocks: [InterlockKind::TiltDetected].into_iter().collect(),
            watchdog_healthy: true,
            navigation_mode: NavigationMode::EmergencyStop,
            current_waypoint: None,
        });
        assert!(state.active_interlocks.contains(&InterlockKind::TiltDetected));
        assert_eq!(state.navigation_mode, NavigationMode::EmergencyStop);
    }

    #[test]
    fn command_echoes_update_motor_state() {
        let mut fusion = FusionEngine::new(FusionConfig::default());
        fusion.ingest_echo(&ActuatorEcho::Blade {
            enabled: true,
            pwm: 1.0,
        });
        fusion.tick(T0);
        assert!(fusion.state().motors.blade_enabled);
    }
}

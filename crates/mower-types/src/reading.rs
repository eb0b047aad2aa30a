//! Raw sensor readings as produced by drivers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical sensor channel. The fusion engine keeps one latest reading per
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorChannel {
    Gps,
    Imu,
    Odometry,
    Battery,
    Solar,
    Environment,
    Obstacle,
    EmergencyStop,
}

impl SensorChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorChannel::Gps => "gps",
            SensorChannel::Imu => "imu",
            SensorChannel::Odometry => "odometry",
            SensorChannel::Battery => "battery",
            SensorChannel::Solar => "solar",
            SensorChannel::Environment => "environment",
            SensorChannel::Obstacle => "obstacle",
            SensorChannel::EmergencyStop => "emergency_stop",
        }
    }
}

impl fmt::Display for SensorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-sensor measurement payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadingData {
    Gps {
        latitude: f64,
        longitude: f64,
        accuracy_m: f64,
    },
    Imu {
        roll_deg: f64,
        pitch_deg: f64,
        /// Yaw rate, clockwise positive (deg/s).
        yaw_rate_dps: f64,
        /// Absolute compass heading from the magnetometer, when available.
        heading_deg: Option<f64>,
    },
    Odometry {
        linear_mps: f64,
        angular_dps: f64,
    },
    Battery {
        voltage: f64,
        current_a: f64,
    },
    Solar {
        voltage: f64,
        current_a: f64,
    },
    Environment {
        temperature_c: f64,
        humidity_percent: f64,
        rain_detected: bool,
    },
    Obstacle {
        distance_m: f64,
    },
    EmergencyStop {
        engaged: bool,
    },
}

impl ReadingData {
    pub fn channel(&self) -> SensorChannel {
        match self {
            ReadingData::Gps { .. } => SensorChannel::Gps,
            ReadingData::Imu { .. } => SensorChannel::Imu,
            ReadingData::Odometry { .. } => SensorChannel::Odometry,
            ReadingData::Battery { .. } => SensorChannel::Battery,
            ReadingData::Solar { .. } => SensorChannel::Solar,
            ReadingData::Environment { .. } => SensorChannel::Environment,
            ReadingData::Obstacle { .. } => SensorChannel::Obstacle,
            ReadingData::EmergencyStop { .. } => SensorChannel::EmergencyStop,
        }
    }
}

/// A single timestamped measurement from one driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Identifier of the producing driver instance.
    pub sensor_id: String,
    /// Sample time, microseconds since the Unix epoch.
    pub timestamp_us: u64,
    pub data: ReadingData,
}

impl SensorReading {
    pub fn new(sensor_id: impl Into<String>, timestamp_us: u64, data: ReadingData) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp_us,
            data,
        }
    }

    pub fn channel(&self) -> SensorChannel {
        self.data.channel()
    }

    /// Bus topic this reading is published on: `sensors/<channel>/<sensor_id>`.
    pub fn topic(&self) -> String {
        format!("sensors/{}/{}", self.channel(), self.sensor_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_hierarchical() {
        let r = SensorReading::new(
            "imu0",
            1,
            ReadingData::Imu {
                roll_deg: 0.0,
                pitch_deg: 0.0,
                yaw_rate_dps: 0.0,
                heading_deg: None,
            },
        );
        assert_eq!(r.topic(), "sensors/imu/imu0");
    }

    #[test]
    fn reading_data_is_internally_tagged() {
        let data = ReadingData::Battery {
            voltage: 12.4,
            current_a: -1.0,
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "battery");
        let back: ReadingData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }
}

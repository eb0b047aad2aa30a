//! Weather gate for job starts.
//!
//! A live forecast is trusted while it is younger than
//! [`FORECAST_MAX_AGE_HOURS`]; after that the gate falls back to the on-board
//! environment sensors. Forecast and sensor checks have separate
//! [`WeatherThresholds`] so the fallback can be tuned independently; by
//! default both use the forecast values.
//!
//! | condition | postpones when |
//! |---|---|
//! | rain probability | `> max_rain_probability` (sensor rain counts as 100 %) |
//! | wind | `> max_wind_mph` (forecast only, no anemometer) |
//! | temperature | outside `[min_temperature_c, max_temperature_c]` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mower_types::RobotState;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const FORECAST_MAX_AGE_HOURS: i64 = 6;

// ─────────────────────────────────────────────────────────────────────────────
// Thresholds and verdicts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WeatherThresholds {
    /// Probability in `[0, 1]`.
    pub max_rain_probability: f64,
    pub max_wind_mph: f64,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
}

impl Default for WeatherThresholds {
    fn default() -> Self {
        Self {
            max_rain_probability: 0.30,
            max_wind_mph: 15.0,
            min_temperature_c: 5.0,
            max_temperature_c: 35.0,
        }
    }
}

impl WeatherThresholds {
    fn check_temperature(&self, temperature_c: f64) -> Option<String> {
        if temperature_c < self.min_temperature_c || temperature_c > self.max_temperature_c {
            Some(format!(
                "temperature {temperature_c:.1}°C outside {:.0}..{:.0}°C",
                self.min_temperature_c, self.max_temperature_c
            ))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WeatherVerdict {
    Clear,
    Postpone { reason: String },
}

impl WeatherVerdict {
    pub fn is_clear(&self) -> bool {
        matches!(self, WeatherVerdict::Clear)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub rain_probability: f64,
    pub wind_mph: f64,
    pub temperature_c: f64,
    pub fetched_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum WeatherError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected forecast response: {0}")]
    BadResponse(String),
}

#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn fetch(&self) -> Result<Forecast, WeatherError>;
}

/// Response body expected from the forecast endpoint.
#[derive(Deserialize)]
struct ForecastResponse {
    rain_probability: f64,
    wind_mph: f64,
    temperature_c: f64,
}

/// Fetches a JSON forecast for the mowing site with a plain `GET`.
pub struct HttpForecastProvider {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpForecastProvider {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ForecastProvider for HttpForecastProvider {
    async fn fetch(&self) -> Result<Forecast, WeatherError> {
        let mut request = self.client.get(&self.url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let body: ForecastResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !(0.0..=1.0).contains(&body.rain_probability) {
            return Err(WeatherError::BadResponse(format!(
                "rain_probability {} not in [0, 1]",
                body.rain_probability
            )));
        }
        Ok(Forecast {
            rain_probability: body.rain_probability,
            wind_mph: body.wind_mph,
            temperature_c: body.temperature_c,
            fetched_at: Utc::now(),
        })
    }
}

/// Poll `provider` every `every` and forward successful forecasts to `tx`.
/// Fetch errors are logged and the previous forecast simply ages out.
pub fn spawn_refresh(
    provider: Arc<dyn ForecastProvider>,
    every: Duration,
    tx: mpsc::Sender<Forecast>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match provider.fetch().await {
                Ok(forecast) => {
                    if tx.send(forecast).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "weather forecast fetch failed"),
            }
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Gate
// ─────────────────────────────────────────────────────────────────────────────

pub struct WeatherGate {
    forecast_thresholds: WeatherThresholds,
    sensor_thresholds: WeatherThresholds,
    latest: Option<Forecast>,
}

impl WeatherGate {
    pub fn new(forecast_thresholds: WeatherThresholds, sensor_thresholds: WeatherThresholds) -> Self {
        Self {
            forecast_thresholds,
            sensor_thresholds,
            latest: None,
        }
    }

    pub fn record_forecast(&mut self, forecast: Forecast) {
        info!(
            rain = forecast.rain_probability,
            wind_mph = forecast.wind_mph,
            temperature_c = forecast.temperature_c,
            "weather forecast updated"
        );
        self.latest = Some(forecast);
    }

    pub fn latest(&self) -> Option<&Forecast> {
        self.latest.as_ref()
    }

    fn fresh_forecast(&self, now: DateTime<Utc>) -> Option<&Forecast> {
        self.latest
            .as_ref()
            .filter(|f| now - f.fetched_at < chrono::Duration::hours(FORECAST_MAX_AGE_HOURS))
    }

    pub fn assess(&self, now: DateTime<Utc>, state: &RobotState) -> WeatherVerdict {
        let reason = match self.fresh_forecast(now) {
            Some(forecast) => self.assess_forecast(forecast),
            None => {
                debug!("no fresh forecast, using environment sensors");
                self.assess_sensors(state)
            }
        };
        match reason {
            Some(reason) => WeatherVerdict::Postpone { reason },
            None => WeatherVerdict::Clear,
        }
    }

    fn assess_forecast(&self, f: &Forecast) -> Option<String> {
        let t = &self.forecast_thresholds;
        if f.rain_probability > t.max_rain_probability {
            return Some(format!(
                "forecast rain probability {:.0}% above {:.0}%",
                f.rain_probability * 100.0,
                t.max_rain_probability * 100.0
            ));
        }
        if f.wind_mph > t.max_wind_mph {
            return Some(format!(
                "forecast wind {:.1} mph above {:.1} mph",
                f.wind_mph, t.max_wind_mph
            ));
        }
        t.check_temperature(f.temperature_c)
            .map(|r| format!("forecast {r}"))
    }

    fn assess_sensors(&self, state: &RobotState) -> Option<String> {
        let t = &self.sensor_thresholds;
        if state.rain_detected && t.max_rain_probability < 1.0 {
            return Some("rain detected by sensor".to_string());
        }
        state
            .temperature_c
            .and_then(|c| t.check_temperature(c))
            .map(|r| format!("sensor {r}"))
    }
}

impl Default for WeatherGate {
    fn default() -> Self {
        Self::new(WeatherThresholds::default(), WeatherThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forecast(rain: f64, wind: f64, temp: f64, fetched_at: DateTime<Utc>) -> Forecast {
        Forecast {
            rain_probability: rain,
            wind_mph: wind,
            temperature_c: temp,
            fetched_at,
        }
    }

    #[test]
    fn fresh_forecast_decides() {
        let now = Utc::now();
        let mut gate = WeatherGate::default();
        let state = RobotState {
            rain_detected: true,
            ..RobotState::default()
        };

        gate.record_forecast(forecast(0.10, 5.0, 20.0, now));
        assert!(gate.assess(now, &state).is_clear());

        gate.record_forecast(forecast(0.31, 5.0, 20.0, now));
        assert!(matches!(
            gate.assess(now, &state),
            WeatherVerdict::Postpone { reason } if reason.contains("rain")
        ));
    }

    #[test]
    fn boundaries_are_inclusive() {
        let now = Utc::now();
        let mut gate = WeatherGate::default();
        gate.record_forecast(forecast(0.30, 15.0, 5.0, now));
        assert!(gate.assess(now, &RobotState::default()).is_clear());

        gate.record_forecast(forecast(0.0, 15.1, 20.0, now));
        assert!(!gate.assess(now, &RobotState::default()).is_clear());

        gate.record_forecast(forecast(0.0, 0.0, 35.5, now));
        assert!(!gate.assess(now, &RobotState::default()).is_clear());
    }

    #[test]
    fn stale_forecast_falls_back_to_sensors() {
        let now = Utc::now();
        let mut gate = WeatherGate::default();
        gate.record_forecast(forecast(0.9, 40.0, 20.0, now - chrono::Duration::hours(7)));

        // Forecast ignored; dry and mild on-board.
        let dry = RobotState {
            temperature_c: Some(18.0),
            ..RobotState::default()
        };
        assert!(gate.assess(now, &dry).is_clear());

        let raining = RobotState {
            rain_detected: true,
            ..dry.clone()
        };
        assert_eq!(
            gate.assess(now, &raining),
            WeatherVerdict::Postpone {
                reason: "rain detected by sensor".to_string()
            }
        );

        let frosty = RobotState {
            temperature_c: Some(2.0),
            ..dry
        };
        assert!(!gate.assess(now, &frosty).is_clear());
    }

    #[test]
    fn sensor_thresholds_are_independent() {
        let now = Utc::now();
        let gate = WeatherGate::new(
            WeatherThresholds::default(),
            WeatherThresholds {
                min_temperature_c: 0.0,
                ..WeatherThresholds::default()
            },
        );
        let cool = RobotState {
            temperature_c: Some(2.0),
            ..RobotState::default()
        };
        assert!(gate.assess(now, &cool).is_clear());
    }

    struct FixedProvider(Forecast);

    #[async_trait]
    impl ForecastProvider for FixedProvider {
        async fn fetch(&self) -> Result<Forecast, WeatherError> {
            Ok(self.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_task_forwards_forecasts() {
        let f = forecast(0.2, 3.0, 21.0, Utc::now());
        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_refresh(Arc::new(FixedProvider(f)), Duration::from_secs(1800), tx);

        assert_eq!(rx.recv().await, Some(f));
        tokio::time::advance(Duration::from_secs(1800)).await;
        assert_eq!(rx.recv().await, Some(f));

        drop(rx);
        tokio::time::advance(Duration::from_secs(1800)).await;
        handle.await.unwrap();
    }
}

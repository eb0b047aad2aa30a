//! Configuration Vault – reads/writes `~/.mower/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mower_hal::HardwareConfig;
use mower_kernel::SafetyLimits;
use mower_perception::{BatteryModel, FusionConfig};
use mower_planner::{Geofence, GeofenceSpec, PlannerConfig};
use mower_runtime::{
    ApiConfig, ControlConfig, CoreConfig, ForecastSource, SchedulerConfig, StorageConfig,
    WeatherThresholds,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Datum {
    pub latitude: f64,
    pub longitude: f64,
}

/// The `[core]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CoreSection {
    /// Fusion and safety evaluation rate, 1 to 10 Hz.
    pub fusion_hz: u32,
    /// Boot against simulated hardware.
    pub simulation: bool,
    /// Origin of the local frame. The first GPS fix is used when unset.
    pub datum: Option<Datum>,
    pub battery: BatteryModel,
}

impl Default for CoreSection {
    fn default() -> Self {
        Self {
            fusion_hz: 5,
            simulation: true,
            datum: None,
            battery: BatteryModel::default(),
        }
    }
}

/// The `[weather]` section.
#[derive(Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WeatherSection {
    pub thresholds: WeatherThresholds,
    /// Applied to on-board sensors when the forecast is stale. Falls back to
    /// `thresholds` when unset.
    pub sensor_thresholds: Option<WeatherThresholds>,
    pub forecast_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub api_key: Option<Zeroizing<String>>,
    pub refresh_minutes: u64,
}

impl Default for WeatherSection {
    fn default() -> Self {
        Self {
            thresholds: WeatherThresholds::default(),
            sensor_thresholds: None,
            forecast_url: None,
            api_key: None,
            refresh_minutes: 360,
        }
    }
}

impl std::fmt::Debug for WeatherSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherSection")
            .field("thresholds", &self.thresholds)
            .field("sensor_thresholds", &self.sensor_thresholds)
            .field("forecast_url", &self.forecast_url)
            .field(
                "api_key",
                if self.api_key.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("refresh_minutes", &self.refresh_minutes)
            .finish()
    }
}

/// Persisted operator configuration stored in `~/.mower/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MowerConfig {
    pub core: CoreSection,
    pub safety: SafetyLimits,
    /// Empty in simulation means one simulated driver of every kind.
    pub hardware: HardwareConfig,
    /// Initial mowing area.
    pub geofence: Option<GeofenceSpec>,
    pub planner: PlannerConfig,
    pub scheduler: SchedulerConfig,
    pub weather: WeatherSection,
    pub storage: StorageConfig,
    pub api: ApiConfig,
}

impl MowerConfig {
    /// Every configuration error refuses startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_core_config().map(|_| ())
    }

    pub fn to_core_config(&self) -> Result<CoreConfig, ConfigError> {
        let hardware = if self.hardware.drivers.is_empty() {
            if !self.core.simulation {
                return Err(ConfigError::Invalid(
                    "no [[hardware.drivers]] configured and simulation is off".to_string(),
                ));
            }
            HardwareConfig {
                policy: self.hardware.policy.clone(),
                ..HardwareConfig::simulated()
            }
        } else {
            self.hardware.clone()
        };

        let geofence = self
            .geofence
            .clone()
            .map(Geofence::try_from)
            .transpose()
            .map_err(|e| ConfigError::Invalid(format!("geofence: {e}")))?;

        let control = ControlConfig {
            fusion_hz: self.core.fusion_hz,
            safety: self.safety.clone(),
            fusion: FusionConfig {
                datum: self.core.datum.map(|d| (d.latitude, d.longitude)),
                battery: self.core.battery.clone(),
                ..FusionConfig::default()
            },
            planner: self.planner.clone(),
            forecast_thresholds: self.weather.thresholds,
            sensor_thresholds: self.weather.sensor_thresholds.unwrap_or(self.weather.thresholds),
            geofence,
            ..ControlConfig::default()
        };

        if self.weather.refresh_minutes == 0 {
            return Err(ConfigError::Invalid(
                "weather.refresh_minutes must be positive".to_string(),
            ));
        }
        let forecast = self.weather.forecast_url.as_ref().map(|url| ForecastSource {
            url: url.clone(),
            api_key: self.weather.api_key.as_ref().map(|k| k.as_str().to_owned()),
            refresh: Duration::from_secs(self.weather.refresh_minutes * 60),
        });

        let core = CoreConfig {
            control,
            hardware,
            scheduler: self.scheduler.clone(),
            storage: self.storage.clone(),
            api: self.api.clone(),
            forecast,
            ..CoreConfig::default()
        };
        core.validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(core)
    }
}

/// JSON Schema of the whole file, for `mower schema`.
pub fn schema() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&schemars::schema_for!(MowerConfig))
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

/// Return the path to `~/.mower/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mower").join("config.toml")
}

/// Load the config from disk and apply environment overrides. Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<MowerConfig>, ConfigError> {
    let Some(mut cfg) = read_from(&config_path())? else {
        return Ok(None);
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Load and validate a specific file, without environment overrides.
#[cfg(test)]
pub(crate) fn load_from(path: &Path) -> Result<Option<MowerConfig>, ConfigError> {
    let cfg = read_from(path)?;
    if let Some(cfg) = &cfg {
        cfg.validate()?;
    }
    Ok(cfg)
}

fn read_from(path: &Path) -> Result<Option<MowerConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(toml::from_str(&raw)?))
}

/// Apply `MOWER_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MOWER_FUSION_HZ` | `core.fusion_hz` |
/// | `MOWER_SIMULATION` | `core.simulation` |
/// | `MOWER_DATA_DIR` | `storage.data_dir` |
/// | `MOWER_WEATHER_URL` | `weather.forecast_url` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut MowerConfig) {
    if let Ok(v) = std::env::var("MOWER_FUSION_HZ")
        && let Ok(hz) = v.parse::<u32>()
    {
        cfg.core.fusion_hz = hz;
    }
    if let Ok(v) = std::env::var("MOWER_SIMULATION") {
        match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => cfg.core.simulation = true,
            "0" | "false" | "no" => cfg.core.simulation = false,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("MOWER_DATA_DIR") {
        cfg.storage.data_dir = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("MOWER_WEATHER_URL") {
        cfg.weather.forecast_url = Some(v);
    }
}

/// Save the config to disk, creating `~/.mower/` if necessary.
pub fn save(cfg: &MowerConfig) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &MowerConfig, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = Zeroizing::new(toml::to_string_pretty(cfg)?);
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw.as_bytes()).map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mower_types::Point;

    fn square() -> GeofenceSpec {
        GeofenceSpec {
            name: "front lawn".to_string(),
            vertices: vec![
                Point::new(0.0, 0.0),
                Point::new(20.0, 0.0),
                Point::new(20.0, 10.0),
                Point::new(0.0, 10.0),
            ],
            buffer_m: 0.5,
        }
    }

    #[test]
    fn defaults_boot_the_simulator() {
        let core = MowerConfig::default().to_core_config().expect("valid");
        assert_eq!(core.hardware.drivers.len(), 10);
        assert_eq!(core.control.fusion_hz, 5);
        assert!(core.forecast.is_none());
        assert!(core.storage.data_dir.is_none());
    }

    #[test]
    fn debug_redacts_weather_key() {
        let mut cfg = MowerConfig::default();
        cfg.weather.api_key = Some(Zeroizing::new("wx-super-secret".to_string()));
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("wx-super-secret"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn debug_shows_not_set_for_missing_key() {
        let debug_str = format!("{:?}", MowerConfig::default());
        assert!(debug_str.contains("<not set>"));
    }

    #[test]
    fn fusion_rate_out_of_range_is_rejected() {
        let mut cfg = MowerConfig::default();
        cfg.core.fusion_hz = 20;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
        cfg.core.fusion_hz = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn real_hardware_needs_drivers() {
        let mut cfg = MowerConfig::default();
        cfg.core.simulation = false;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("hardware.drivers"), "{err}");
    }

    #[test]
    fn duplicate_resource_claims_are_rejected() {
        let mut cfg = MowerConfig::default();
        cfg.hardware = HardwareConfig::simulated();
        cfg.hardware.drivers[1].resource = cfg.hardware.drivers[0].resource.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn degenerate_geofence_is_rejected() {
        let mut cfg = MowerConfig::default();
        let mut spec = square();
        spec.vertices.truncate(2);
        cfg.geofence = Some(spec);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("geofence"), "{err}");
    }

    #[test]
    fn non_increasing_backoff_is_rejected() {
        let mut cfg = MowerConfig::default();
        cfg.scheduler.backoff_minutes = vec![30, 30];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sensor_thresholds_default_to_forecast_thresholds() {
        let mut cfg = MowerConfig::default();
        cfg.weather.thresholds.max_rain_probability = 0.1;
        let core = cfg.to_core_config().expect("valid");
        assert_eq!(core.control.sensor_thresholds.max_rain_probability, 0.1);
    }

    #[test]
    fn geofence_and_datum_flow_into_core_config() {
        let mut cfg = MowerConfig::default();
        cfg.geofence = Some(square());
        cfg.core.datum = Some(Datum {
            latitude: 47.3769,
            longitude: 8.5417,
        });
        let core = cfg.to_core_config().expect("valid");
        assert!(core.control.geofence.is_some());
        assert_eq!(core.control.fusion.datum, Some((47.3769, 8.5417)));
    }

    #[test]
    fn forecast_source_carries_key_and_refresh() {
        let mut cfg = MowerConfig::default();
        cfg.weather.forecast_url = Some("http://wx.local/forecast".to_string());
        cfg.weather.api_key = Some(Zeroizing::new("k".to_string()));
        let forecast = cfg.to_core_config().expect("valid").forecast.expect("forecast");
        assert_eq!(forecast.api_key.as_deref(), Some("k"));
        assert_eq!(forecast.refresh, Duration::from_secs(6 * 60 * 60));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&MowerConfig::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).expect("file").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap())
            .expect("dir")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = MowerConfig::default();
        cfg.geofence = Some(square());
        cfg.scheduler.min_battery_percent = 55.0;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.geofence, cfg.geofence);
        assert_eq!(loaded.scheduler.min_battery_percent, 55.0);
        assert_eq!(loaded.safety, cfg.safety);
    }

    #[test]
    fn sections_are_optional_in_toml() {
        let cfg: MowerConfig = toml::from_str(
            r#"
            [core]
            fusion_hz = 8

            [scheduler]
            max_retries = 5
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.core.fusion_hz, 8);
        assert!(cfg.core.simulation);
        assert_eq!(cfg.scheduler.max_retries, 5);
        assert_eq!(cfg.scheduler.min_battery_percent, 40.0);
    }

    #[test]
    fn invalid_file_refuses_to_load() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[core]\nfusion_hz = 50\n").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn schema_lists_every_section() {
        let schema = schema().expect("schema");
        for section in ["core", "safety", "hardware", "geofence", "scheduler", "weather", "api"] {
            assert!(schema.contains(&format!("\"{section}\"")), "missing {section}");
        }
    }

    #[test]
    fn env_overrides_apply() {
        // SAFETY: the only test touching these variables.
        unsafe {
            std::env::set_var("MOWER_FUSION_HZ", "7");
            std::env::set_var("MOWER_SIMULATION", "false");
            std::env::set_var("MOWER_DATA_DIR", "/var/lib/mower");
            std::env::set_var("MOWER_WEATHER_URL", "http://wx.local");
        }
        let mut cfg = MowerConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.core.fusion_hz, 7);
        assert!(!cfg.core.simulation);
        assert_eq!(cfg.storage.data_dir, Some(PathBuf::from("/var/lib/mower")));
        assert_eq!(cfg.weather.forecast_url.as_deref(), Some("http://wx.local"));
        unsafe {
            std::env::set_var("MOWER_FUSION_HZ", "fast");
        }
        let mut cfg = MowerConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.core.fusion_hz, 5);
        unsafe {
            for var in [
                "MOWER_FUSION_HZ",
                "MOWER_SIMULATION",
                "MOWER_DATA_DIR",
                "MOWER_WEATHER_URL",
            ] {
                std::env::remove_var(var);
            }
        }
    }
}

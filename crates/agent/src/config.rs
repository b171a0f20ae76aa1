//! TOML config file loading and validation: broker endpoint, HTTP API,
//! token cache, and per-device threshold settings.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::normalize::SensorKind;
use crate::threshold::Bounds;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Device selected at startup. Defaults to the first configured device.
    pub default_device: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base")]
    pub base_url: String,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    /// How often historical stream data is re-fetched for the selected device.
    #[serde(default = "default_history_refresh")]
    pub history_refresh_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base(),
            timeout_secs: default_api_timeout(),
            history_refresh_secs: default_history_refresh(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Where access/refresh tokens are cached between runs.
    #[serde(default = "default_token_cache")]
    pub token_cache: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_cache: default_token_cache(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub name: String,
    /// When true the controller actuates the pump; otherwise it only advises.
    #[serde(default)]
    pub auto_mode: bool,
    #[serde(default)]
    pub thresholds: Thresholds,
}

/// Per-sensor alert bounds. Defaults match the dashboard's stock profile.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Thresholds {
    #[serde(default = "d_moisture_min")]
    pub moisture_min: f64,
    #[serde(default = "d_moisture_max")]
    pub moisture_max: f64,
    #[serde(default = "d_temperature_min")]
    pub temperature_min: f64,
    #[serde(default = "d_temperature_max")]
    pub temperature_max: f64,
    #[serde(default = "d_humidity_min")]
    pub humidity_min: f64,
    #[serde(default = "d_humidity_max")]
    pub humidity_max: f64,
    #[serde(default = "d_light_min")]
    pub light_min: f64,
    #[serde(default = "d_light_max")]
    pub light_max: f64,
    #[serde(default = "d_battery_min")]
    pub battery_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            moisture_min: d_moisture_min(),
            moisture_max: d_moisture_max(),
            temperature_min: d_temperature_min(),
            temperature_max: d_temperature_max(),
            humidity_min: d_humidity_min(),
            humidity_max: d_humidity_max(),
            light_min: d_light_min(),
            light_max: d_light_max(),
            battery_min: d_battery_min(),
        }
    }
}

impl Thresholds {
    /// Bounds for one sensor. Battery has a fixed physical ceiling of 100%.
    pub fn bounds(&self, kind: SensorKind) -> Bounds {
        match kind {
            SensorKind::Moisture => Bounds::new(Some(self.moisture_min), Some(self.moisture_max)),
            SensorKind::Temperature => {
                Bounds::new(Some(self.temperature_min), Some(self.temperature_max))
            }
            SensorKind::Humidity => Bounds::new(Some(self.humidity_min), Some(self.humidity_max)),
            SensorKind::Light => Bounds::new(Some(self.light_min), Some(self.light_max)),
            SensorKind::Battery => Bounds::new(Some(self.battery_min), Some(100.0)),
        }
    }
}

fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_broker_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    30
}
fn default_api_base() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_api_timeout() -> u64 {
    15
}
fn default_history_refresh() -> u64 {
    30
}
fn default_token_cache() -> String {
    "greenhouse-tokens.json".to_string()
}
fn d_moisture_min() -> f64 {
    20.0
}
fn d_moisture_max() -> f64 {
    70.0
}
fn d_temperature_min() -> f64 {
    10.0
}
fn d_temperature_max() -> f64 {
    35.0
}
fn d_humidity_min() -> f64 {
    30.0
}
fn d_humidity_max() -> f64 {
    80.0
}
fn d_light_min() -> f64 {
    200.0
}
fn d_light_max() -> f64 {
    1000.0
}
fn d_battery_min() -> f64 {
    20.0
}

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

impl Config {
    pub fn device(&self, device_id: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    /// The device to select at startup: `default_device` if set, else the
    /// first configured entry.
    pub fn initial_device(&self) -> Option<&DeviceEntry> {
        match &self.default_device {
            Some(id) => self.device(id),
            None => self.devices.first(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.broker.host.trim().is_empty() {
            errors.push("broker.host is empty".to_string());
        }
        if self.broker.port == 0 {
            errors.push("broker.port must be non-zero".to_string());
        }
        if self.broker.keep_alive_secs == 0 {
            errors.push("broker.keep_alive_secs must be positive".to_string());
        }
        if self.api.base_url.trim().is_empty() {
            errors.push("api.base_url is empty".to_string());
        }
        if self.api.timeout_secs == 0 {
            errors.push("api.timeout_secs must be positive".to_string());
        }
        if self.api.history_refresh_secs == 0 {
            errors.push("api.history_refresh_secs must be positive".to_string());
        }

        self.validate_devices(&mut errors);

        if let Some(id) = &self.default_device {
            if self.device(id).is_none() {
                errors.push(format!("default_device '{id}' does not match any device"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.device_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if d.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if !seen_ids.insert(&d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Threshold ordering ──────────────────────────────
            let t = &d.thresholds;
            let pairs = [
                ("moisture", t.moisture_min, t.moisture_max),
                ("temperature", t.temperature_min, t.temperature_max),
                ("humidity", t.humidity_min, t.humidity_max),
                ("light", t.light_min, t.light_max),
            ];
            for (label, min, max) in pairs {
                if !min.is_finite() || !max.is_finite() {
                    errors.push(format!("{}: {label} bounds must be finite", ctx()));
                } else if min >= max {
                    errors.push(format!(
                        "{}: {label}_min ({min}) must be less than {label}_max ({max})",
                        ctx()
                    ));
                }
            }

            if !(0.0..=100.0).contains(&t.battery_min) {
                errors.push(format!(
                    "{}: battery_min {} out of range [0, 100]",
                    ctx(),
                    t.battery_min
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

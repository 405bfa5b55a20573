// Configuration module - handles device list loading and runtime settings
//
// This module is responsible for:
// 1. Reading the device access file named by VPLC_ACCESS_FILE
// 2. Parsing and validating the device records
// 3. Reading runtime settings (port, interval, timeout) from the environment
// 4. Providing strongly-typed access to settings

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Environment variable naming the device access file
pub const ACCESS_FILE_VAR: &str = "VPLC_ACCESS_FILE";

const PORT_VAR: &str = "METRICS_PORT";
const INTERVAL_VAR: &str = "SCRAPE_INTERVAL_SECS";
const TIMEOUT_VAR: &str = "REQUEST_TIMEOUT_SECS";

const DEFAULT_PORT: u16 = 2112;
const DEFAULT_INTERVAL_SECS: u64 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Errors that can occur during configuration loading
///
/// All of these are fatal: the process must not start without a valid device list.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable {0} is not set or empty")]
    MissingVariable(&'static str),

    #[error("Failed to read access file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse access file: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Access file contains no devices")]
    NoDevices,

    #[error("Invalid device record: {0}")]
    InvalidDevice(String),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidSetting { name: &'static str, value: String },
}

/// Connection record for a single monitored device
///
/// Loaded once at startup and never mutated afterwards. The name is the
/// value of the `vplc_instance` label on every exported series.
#[derive(Clone, Deserialize)]
pub struct DeviceRecord {
    /// Unique display name
    pub name: String,

    /// Full URL of the login endpoint
    #[serde(rename = "loginUrl")]
    pub login_url: String,

    /// Base URL of the data API
    #[serde(rename = "apiUrl")]
    pub api_url: String,

    #[serde(rename = "user")]
    pub username: String,

    pub password: String,
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("name", &self.name)
            .field("login_url", &self.login_url)
            .field("api_url", &self.api_url)
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// Top-level shape of the access file
///
/// # Example
/// ```json
/// {
///   "vplcs": [
///     {
///       "name": "plc-line-1",
///       "loginUrl": "https://10.0.0.5/api/login",
///       "apiUrl": "https://10.0.0.5/api/v2",
///       "user": "monitor",
///       "password": "secret"
///     }
///   ]
/// }
/// ```
#[derive(Debug, Deserialize)]
struct AccessFile {
    #[serde(rename = "vplcs")]
    devices: Vec<DeviceRecord>,
}

/// Parses and validates the access file contents
///
/// # Returns
/// * `Ok(Vec<DeviceRecord>)` - At least one device, names unique and non-empty
/// * `Err(ConfigError)` - Malformed JSON or an invalid device list
pub fn parse_devices(raw: &str) -> Result<Vec<DeviceRecord>, ConfigError> {
    let file: AccessFile = serde_json::from_str(raw)?;

    if file.devices.is_empty() {
        return Err(ConfigError::NoDevices);
    }

    let mut seen = HashSet::new();
    for device in &file.devices {
        if device.name.trim().is_empty() {
            return Err(ConfigError::InvalidDevice("empty device name".to_string()));
        }
        if !seen.insert(device.name.as_str()) {
            return Err(ConfigError::InvalidDevice(format!(
                "duplicate device name '{}'",
                device.name
            )));
        }
    }

    Ok(file.devices)
}

/// Reads the device list from a file on disk
pub fn load_devices(path: &Path) -> Result<Vec<DeviceRecord>, ConfigError> {
    info!("Loading device list from: {}", path.display());

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.display().to_string(),
        source,
    })?;

    let devices = parse_devices(&raw)?;

    info!("Loaded {} device(s)", devices.len());
    for device in &devices {
        info!("  {} - login: '{}', api: '{}'", device.name, device.login_url, device.api_url);
    }

    Ok(devices)
}

/// Runtime settings for the collector process
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the device access file
    pub access_file: String,

    /// Port the scrape endpoint listens on
    pub port: u16,

    /// Period between collection ticks
    pub interval: Duration,

    /// Upper bound on every login and data request
    pub request_timeout: Duration,
}

impl Settings {
    /// Builds settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds settings from an arbitrary variable lookup
    ///
    /// Unset or empty optional variables fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let access_file = get(ACCESS_FILE_VAR).ok_or(ConfigError::MissingVariable(ACCESS_FILE_VAR))?;

        let port = match get(PORT_VAR) {
            Some(v) => parse_setting(PORT_VAR, &v)?,
            None => DEFAULT_PORT,
        };

        let interval_secs: u64 = match get(INTERVAL_VAR) {
            Some(v) => parse_setting(INTERVAL_VAR, &v)?,
            None => DEFAULT_INTERVAL_SECS,
        };

        let timeout_secs: u64 = match get(TIMEOUT_VAR) {
            Some(v) => parse_setting(TIMEOUT_VAR, &v)?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        if interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                name: INTERVAL_VAR,
                value: "0".to_string(),
            });
        }
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                name: TIMEOUT_VAR,
                value: "0".to_string(),
            });
        }

        Ok(Settings {
            access_file,
            port,
            interval: Duration::from_secs(interval_secs),
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

fn parse_setting<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidSetting {
        name,
        value: value.to_string(),
    })
}

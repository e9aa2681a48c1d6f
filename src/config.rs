//! Configuration management for the capillary client.
//!
//! [`Settings`] holds the endpoints and tuning knobs of a capture session and
//! supports environment variable overrides. [`UserConfig`] is the small piece
//! of state that persists across runs (preferred camera, last login).

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::channel::ReconnectPolicy;
use crate::{OurError, OurResult};

/// Label fragments reported by capillaroscope hardware, matched case-insensitively
pub const DEFAULT_MICROSCOPE_LABELS: &[&str] = &[
    "microscope",
    "microsope",
    "capillaroscope",
    "dino-lite",
    "dinolite",
    "andonstar",
];

/// Configuration settings for the capillary client.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Page origin the device endpoint is served from; `/ws` is appended
    pub device_base_url: Url,
    /// Origin of the clinical REST API; `/api` is appended
    pub api_base_url: Url,
    /// JPEG quality used for captured stills (1-100)
    pub jpeg_quality: u8,
    /// Timeout applied to every REST request
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Control channel reconnect policy
    pub reconnect: ReconnectPolicy,
    /// Label fragments identifying the microscope, in priority order
    pub microscope_labels: Vec<String>,
    /// Number of entries kept in the session event log
    pub log_capacity: usize,
    /// Enable debug output
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_base_url: default_local_url(),
            api_base_url: default_local_url(),
            jpeg_quality: 95,
            request_timeout: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
            microscope_labels: DEFAULT_MICROSCOPE_LABELS
                .iter()
                .map(|label| label.to_string())
                .collect(),
            log_capacity: 25,
            debug: false,
        }
    }
}

#[allow(clippy::expect_used)]
fn default_local_url() -> Url {
    Url::parse("http://localhost:8080").expect("static URL is valid")
}

/// User configuration that persists across application restarts
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    /// Camera picked by hand the last time, overrides auto-selection
    #[serde(default)]
    pub preferred_camera: Option<String>,
    /// Username of the last successful login
    #[serde(default)]
    pub last_username: Option<String>,
}

impl UserConfig {
    /// Load from `path`, falling back to defaults when missing or unreadable
    pub fn load_from(path: &Path) -> UserConfig {
        if !path.exists() {
            return UserConfig::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<UserConfig>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to parse user config from {path:?}: {e}");
                    UserConfig::default()
                }
            },
            Err(e) => {
                warn!("Failed to read user config from {path:?}: {e}");
                UserConfig::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> OurResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;

        info!("Saved user config to {path:?}");
        Ok(())
    }
}

impl Settings {
    /// Create a new instance of Settings with environment variable overrides
    pub fn new() -> OurResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from defaults plus whatever `lookup` returns for the
    /// `CAPILLARY_*` keys
    pub fn from_lookup<F>(lookup: F) -> OurResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(url) = lookup("CAPILLARY_DEVICE_URL") {
            settings.device_base_url = parse_value("CAPILLARY_DEVICE_URL", &url)?;
        }
        if let Some(url) = lookup("CAPILLARY_API_URL") {
            settings.api_base_url = parse_value("CAPILLARY_API_URL", &url)?;
        }
        if let Some(quality) = lookup("CAPILLARY_JPEG_QUALITY") {
            settings.jpeg_quality = parse_value("CAPILLARY_JPEG_QUALITY", &quality)?;
        }
        if let Some(timeout) = lookup("CAPILLARY_REQUEST_TIMEOUT_MS") {
            settings.request_timeout =
                Duration::from_millis(parse_value("CAPILLARY_REQUEST_TIMEOUT_MS", &timeout)?);
        }
        if let Some(attempts) = lookup("CAPILLARY_RECONNECT_ATTEMPTS") {
            settings.reconnect.max_attempts =
                parse_value("CAPILLARY_RECONNECT_ATTEMPTS", &attempts)?;
        }
        if let Some(delay) = lookup("CAPILLARY_RECONNECT_INITIAL_MS") {
            settings.reconnect.initial_delay =
                Duration::from_millis(parse_value("CAPILLARY_RECONNECT_INITIAL_MS", &delay)?);
        }
        if let Some(delay) = lookup("CAPILLARY_RECONNECT_MAX_MS") {
            settings.reconnect.max_delay =
                Duration::from_millis(parse_value("CAPILLARY_RECONNECT_MAX_MS", &delay)?);
        }
        if let Some(capacity) = lookup("CAPILLARY_LOG_CAPACITY") {
            settings.log_capacity = parse_value("CAPILLARY_LOG_CAPACITY", &capacity)?;
        }
        if let Some(labels) = lookup("CAPILLARY_MICROSCOPE_LABELS") {
            settings.microscope_labels = labels
                .split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(debug) = lookup("CAPILLARY_DEBUG") {
            settings.debug = parse_value("CAPILLARY_DEBUG", &debug)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> OurResult<()> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(OurError::Config(format!(
                "JPEG quality must be between 1 and 100, got {}",
                self.jpeg_quality
            )));
        }
        if self.log_capacity == 0 {
            return Err(OurError::Config("log capacity must be positive".to_string()));
        }
        if self.reconnect.max_delay < self.reconnect.initial_delay {
            return Err(OurError::Config(format!(
                "reconnect max delay {:?} is shorter than the initial delay {:?}",
                self.reconnect.max_delay, self.reconnect.initial_delay
            )));
        }
        Ok(())
    }

    /// Get the path to the user config file
    pub fn get_config_path() -> PathBuf {
        if let Ok(config_path_override) = env::var("CAPILLARY_CONFIG_PATH") {
            return PathBuf::from(config_path_override);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("capillary-client.json")
    }

    /// Load user configuration from capillary-client.json
    pub fn load_user_config() -> UserConfig {
        UserConfig::load_from(&Self::get_config_path())
    }

    /// Save user configuration to capillary-client.json
    pub fn save_user_config(config: &UserConfig) -> OurResult<()> {
        config.save_to(&Self::get_config_path())
    }
}

fn parse_value<T>(key: &str, value: &str) -> OurResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| OurError::Config(format!("invalid value for {key}: {e}")))
}

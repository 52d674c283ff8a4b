//! Configuration management for faultline
//!
//! Handles loading and validation of `faultline.toml` configuration files.
//! Every section is optional; missing keys fall back to the defaults below.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FAULTLINE_CONFIG";

/// Config file name looked up in the platform config directory.
pub const CONFIG_FILE_NAME: &str = "faultline.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Capture behaviour of the interceptors and boundaries
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Store bounds
    #[serde(default)]
    pub stores: StoresConfig,

    /// Device metadata overrides for native records
    #[serde(default)]
    pub device: DeviceConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Data directory holding both fault stores
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Application-specific prefix for every storage key
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
            data_dir: default_data_dir(),
            storage_prefix: default_storage_prefix(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> String {
    "~/.local/share/faultline".to_string()
}

fn default_storage_prefix() -> String {
    "voicejot".to_string()
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Show non-fatal notices (diagnostic builds). Fatal dialogs are always shown.
    #[serde(default)]
    pub diagnostic_notices: bool,

    /// Console-error texts containing any of these substrings are printed but not recorded.
    #[serde(default = "default_console_noise_patterns")]
    pub console_noise_patterns: Vec<String>,

    /// Consecutive re-faults after which a boundary stops offering "Try Again".
    /// 0 disables the limit.
    #[serde(default = "default_boundary_retry_limit")]
    pub boundary_retry_limit: u32,
}

impl CaptureConfig {
    /// Retry limit as an option; `None` means unlimited.
    #[must_use]
    pub fn retry_limit(&self) -> Option<u32> {
        (self.boundary_retry_limit > 0).then_some(self.boundary_retry_limit)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            diagnostic_notices: false,
            console_noise_patterns: default_console_noise_patterns(),
            boundary_retry_limit: default_boundary_retry_limit(),
        }
    }
}

fn default_console_noise_patterns() -> Vec<String> {
    vec![
        "componentWillReceiveProps".to_string(),
        "componentWillMount".to_string(),
        "componentWillUpdate".to_string(),
        "Non-serializable values were found in the navigation state".to_string(),
        "[react-native-gesture-handler]".to_string(),
        "Sending `onAnimatedValueUpdate` with no listeners registered".to_string(),
    ]
}

fn default_boundary_retry_limit() -> u32 {
    5
}

/// Store bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    /// Most recent managed records kept
    #[serde(default = "default_managed_capacity")]
    pub managed_capacity: usize,

    /// Most recent native records kept, per native log
    #[serde(default = "default_native_capacity")]
    pub native_capacity: usize,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            managed_capacity: default_managed_capacity(),
            native_capacity: default_native_capacity(),
        }
    }
}

fn default_managed_capacity() -> usize {
    50
}

fn default_native_capacity() -> usize {
    20
}

/// Device metadata overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Manufacturer reported in native records
    #[serde(default)]
    pub manufacturer: Option<String>,

    /// Model reported in native records
    #[serde(default)]
    pub model: Option<String>,
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// `$FAULTLINE_CONFIG` wins when set. Otherwise the platform config
    /// directory is checked; a missing file yields the defaults.
    pub fn load() -> crate::Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                tracing::debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config = Self::from_toml(&text).map_err(|e| match e {
            ConfigError::ParseFailed { message, .. } => ConfigError::ParseFailed {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::ParseFailed {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()).into())
    }

    /// Reject values the stores cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stores.managed_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "stores.managed_capacity must be >= 1".to_string(),
            ));
        }
        if self.stores.native_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "stores.native_capacity must be >= 1".to_string(),
            ));
        }
        let prefix = self.general.storage_prefix.trim();
        if prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "general.storage_prefix must not be empty".to_string(),
            ));
        }
        if prefix.contains(['/', '\\']) {
            return Err(ConfigError::ValidationError(
                "general.storage_prefix must not contain path separators".to_string(),
            ));
        }
        Ok(())
    }

    /// Data directory with `~` expanded.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    /// Directory of the managed key-value namespace.
    #[must_use]
    pub fn managed_dir(&self) -> PathBuf {
        self.data_dir().join("managed")
    }

    /// Directory of the native key-value namespace.
    #[must_use]
    pub fn native_dir(&self) -> PathBuf {
        self.data_dir().join("native")
    }
}

/// Platform default config path (`<config dir>/faultline/faultline.toml`).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("faultline").join(CONFIG_FILE_NAME))
}

fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(raw));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

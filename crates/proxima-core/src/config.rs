//! Application configuration management.
//!
//! Handles loading and validating the node configuration:
//! - Instance name used as the origin of published observations
//! - Allow/deny lists (literal or regular expression)
//! - Signal smoothing parameters, update frequency and presence timeout
//! - Beacon decoding masks and per-tag overrides
//! - HTTP status API bind address
//!
//! Configuration is read from a TOML file and layered with `PROXIMA__*`
//! environment variables (`__` separates nested keys, for example
//! `PROXIMA__BLE__TIMEOUT_SECS=30`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that overrides the configuration file path.
pub const CONFIG_PATH_ENV: &str = "PROXIMA_CONFIG";

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "PROXIMA";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    ReadError {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("failed to write {}: {source}", .path.display())]
    WriteError {
        /// Path that was written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be rendered as TOML.
    #[error("failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// The configuration sources could not be merged or deserialized.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// A regular expression in an allow/deny list does not compile.
    #[error("{field}: invalid pattern '{pattern}': {source}")]
    InvalidRegex {
        /// Field holding the pattern.
        field: &'static str,
        /// The offending pattern.
        pattern: String,
        /// Compilation error.
        #[source]
        source: regex::Error,
    },

    /// A single field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted path of the field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of this node; published as the origin of every observation.
    pub instance_name: String,

    /// Bluetooth Low Energy presence settings.
    pub ble: BleConfig,

    /// HTTP status API settings.
    pub api: ApiConfig,
}

/// Bluetooth Low Energy presence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Tag ids (or patterns) that are tracked.
    pub allowlist: Vec<String>,

    /// Treat `allowlist` entries as regular expressions.
    pub allowlist_regex: bool,

    /// Tag ids (or patterns) that are never tracked.
    pub denylist: Vec<String>,

    /// Treat `denylist` entries as regular expressions.
    pub denylist_regex: bool,

    /// Kalman process noise. Lower values smooth more aggressively.
    pub process_noise: f64,

    /// Kalman measurement noise. Lower values trust new readings faster.
    pub measurement_noise: f64,

    /// Minimum seconds between two dispatched observations of one tag.
    pub update_frequency_secs: u64,

    /// Seconds after which a node's observation no longer counts.
    pub timeout_secs: u64,

    /// Distance in meters beyond which a tag is reported out of range.
    pub max_distance: Option<f64>,

    /// Resolve companion app identities over a GATT handshake.
    pub companion_app_detection: bool,

    /// Structured beacon decoding.
    pub beacon: BeaconConfig,

    /// Per-tag overrides keyed by tag id.
    pub tag_overrides: HashMap<String, TagOverride>,
}

/// Structured beacon (iBeacon layout) decoding settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Decode matching advertisements as beacons instead of generic tags.
    pub enabled: bool,

    /// Mask applied to the raw major value.
    pub major_mask: u16,

    /// Mask applied to the raw minor value.
    pub minor_mask: u16,
}

/// Overrides applied to a single tag after classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TagOverride {
    /// Display name.
    pub name: Option<String>,

    /// Expected RSSI at one meter, in dBm.
    pub measured_power: Option<i16>,

    /// Mask over the major/minor word that holds the battery level.
    pub battery_mask: Option<u32>,
}

/// HTTP status API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Socket address the API listens on.
    pub bind_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "proxima".to_string()),
            ble: BleConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            allowlist_regex: false,
            denylist: Vec::new(),
            denylist_regex: false,
            process_noise: 0.01,
            measurement_noise: 0.75,
            update_frequency_secs: 1,
            timeout_secs: 60,
            max_distance: None,
            companion_app_detection: true,
            beacon: BeaconConfig::default(),
            tag_overrides: HashMap::new(),
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            major_mask: 0xffff,
            minor_mask: 0xffff,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6415".to_string(),
        }
    }
}

impl BleConfig {
    /// Throttle window for dispatched observations.
    #[must_use]
    pub const fn update_frequency(&self) -> Duration {
        Duration::from_secs(self.update_frequency_secs)
    }

    /// Time after which an origin's observation expires.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from `path`, layered with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file does not exist, or a parse
    /// or validation error if its contents are invalid.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::build(Some(path))
    }

    /// Load configuration from `path`, falling back to defaults (plus
    /// environment overrides) when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be parsed or the merged
    /// configuration fails validation.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::build(Some(path))
        } else {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            Self::build(None)
        }
    }

    fn build(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            // Read up front so I/O failures are reported distinctly from parse failures.
            let content = std::fs::read_to_string(path).map_err(|source| {
                ConfigError::ReadError {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            builder = builder.add_source(config::File::from_str(
                &content,
                config::FileFormat::Toml,
            ));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let mut config: Self = settings.try_deserialize()?;
        // Table keys are case-folded by the loader; keep every source consistent.
        config.ble.tag_overrides = std::mem::take(&mut config.ble.tag_overrides)
            .into_iter()
            .map(|(id, tag)| (id.to_lowercase(), tag))
            .collect();
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to `path` as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized or written.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let write_error = |source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_error)
    }

    /// Default configuration file location.
    ///
    /// `PROXIMA_CONFIG` wins when set. Otherwise `/etc/proxima/config.toml`
    /// on Linux and the platform config directory elsewhere.
    #[must_use]
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        #[cfg(target_os = "linux")]
        {
            PathBuf::from("/etc/proxima/config.toml")
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "proxima").map_or_else(
                || PathBuf::from("config.toml"),
                |dirs| dirs.config_dir().join("config.toml"),
            )
        }
    }

    /// Validate the configuration, collecting every violation.
    ///
    /// # Errors
    ///
    /// Returns the single violation, or [`ConfigError::MultipleValidationErrors`]
    /// when more than one field is invalid.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.instance_name.trim().is_empty() {
            errors.push(invalid("instance_name", "must not be empty"));
        }

        let ble = &self.ble;
        if ble.update_frequency_secs == 0 {
            errors.push(invalid("ble.update_frequency_secs", "must be at least 1"));
        }
        if ble.timeout_secs == 0 {
            errors.push(invalid("ble.timeout_secs", "must be at least 1"));
        }
        if !(ble.process_noise > 0.0) {
            errors.push(invalid("ble.process_noise", "must be greater than 0"));
        }
        if !(ble.measurement_noise > 0.0) {
            errors.push(invalid("ble.measurement_noise", "must be greater than 0"));
        }
        if let Some(max) = ble.max_distance {
            if !(max > 0.0) {
                errors.push(invalid("ble.max_distance", "must be greater than 0"));
            }
        }
        if ble.allowlist_regex {
            errors.extend(check_patterns("ble.allowlist", &ble.allowlist).err());
        }
        if ble.denylist_regex {
            errors.extend(check_patterns("ble.denylist", &ble.denylist).err());
        }
        for (id, tag) in &ble.tag_overrides {
            if tag.measured_power.is_some_and(|power| power >= 0) {
                errors.push(invalid(
                    &format!("ble.tag_overrides.{id}.measured_power"),
                    "must be a negative dBm value",
                ));
            }
        }

        if self.api.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(invalid(
                "api.bind_address",
                &format!("'{}' is not a socket address", self.api.bind_address),
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

/// Compile every pattern of a list, reporting the first failure.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidRegex`] naming the offending pattern.
pub fn compile_patterns(field: &'static str, patterns: &[String]) -> ConfigResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
                field,
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

fn check_patterns(field: &'static str, patterns: &[String]) -> ConfigResult<()> {
    compile_patterns(field, patterns).map(|_| ())
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

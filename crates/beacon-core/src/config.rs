//! Engine configuration management.
//!
//! Handles loading, saving, and validating engine configuration including:
//! - Which beacon layouts are decoded before `initialize` is called
//! - The Eddystone power calibration correction
//! - How long an availability request may wait for the user
//!
//! Files are TOML. Values can be overridden with `BEACON_`-prefixed
//! environment variables using `__` between sections, for example
//! `BEACON_REMEDIATION__TIMEOUT_SECS=30`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decoder::{FrameDecoder, DEFAULT_EDDYSTONE_POWER_CORRECTION};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "BEACON";

/// Upper bound for [`RemediationConfig::timeout_secs`].
pub const MAX_REMEDIATION_TIMEOUT_SECS: u64 = 3600;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The configuration file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration could not be parsed or merged.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// The configuration could not be serialized.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field is invalid.
    #[error("Invalid value for '{field}': {message}")]
    ValidationError {
        /// Field path, e.g. `remediation.timeout_secs`.
        field: String,
        /// What is wrong.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Beacon layouts active before the host calls `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Decode Eddystone-UID frames.
    pub eddystone: bool,
    /// Decode iBeacon/AltBeacon frames.
    pub altbeacon: bool,
    /// dBm added to the Eddystone 0 m power to get the 1 m calibration.
    pub eddystone_power_correction: i8,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            eddystone: true,
            altbeacon: true,
            eddystone_power_correction: DEFAULT_EDDYSTONE_POWER_CORRECTION,
        }
    }
}

/// Permission/settings flow limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    /// Seconds a caller waits for the user before giving up.
    pub timeout_secs: u64,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Decoder layouts.
    pub layouts: LayoutConfig,
    /// Remediation limits.
    pub remediation: RemediationConfig,
}

impl EngineConfig {
    /// Load configuration from `path`, applying environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable, unparsable, or
    /// fails validation.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from `path`, or defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be loaded.
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        match Self::load(path) {
            Err(ConfigError::NotFound(path)) => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Parse TOML content and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the content cannot be parsed or fails validation.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path` as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::WriteError {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_err)
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns a single `ValidationError`, or `MultipleValidationErrors`.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.remediation.timeout_secs == 0
            || self.remediation.timeout_secs > MAX_REMEDIATION_TIMEOUT_SECS
        {
            errors.push(ConfigError::ValidationError {
                field: "remediation.timeout_secs".into(),
                message: format!("must be between 1 and {MAX_REMEDIATION_TIMEOUT_SECS}"),
            });
        }

        if !(-100..=20).contains(&self.layouts.eddystone_power_correction) {
            errors.push(ConfigError::ValidationError {
                field: "layouts.eddystone_power_correction".into(),
                message: "must be between -100 and 20 dBm".into(),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Remediation timeout as a [`Duration`].
    #[must_use]
    pub const fn remediation_timeout(&self) -> Duration {
        Duration::from_secs(self.remediation.timeout_secs)
    }

    /// Decoder configured with these layouts.
    #[must_use]
    pub const fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.layouts.eddystone, self.layouts.altbeacon)
            .with_eddystone_power_correction(self.layouts.eddystone_power_correction)
    }
}

/// Default configuration file location for the current user.
#[must_use]
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "beacon-region").map_or_else(
        || PathBuf::from("beacon.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/smu.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `KEYSIGHT_SMU_`, nested keys separated
//!    by a double underscore
//!
//! Every field has a default, so an empty or missing file yields
//! [`SmuConfig::default()`], which talks to the simulated instrument.
//!
//! # Example
//! ```no_run
//! use keysight_smu::config::SmuConfig;
//!
//! // KEYSIGHT_SMU_CONNECTION__RESOURCE=TCPIP0::10.0.0.5::5025::SOCKET
//! let config = SmuConfig::load()?;
//! config.validate()?;
//! println!("Resource: {}", config.connection.resource);
//! # Ok::<(), keysight_smu::SmuError>(())
//! ```

use crate::error::{SmuError, SmuResult};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/smu.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "KEYSIGHT_SMU_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmuConfig {
    pub application: ApplicationConfig,
    pub connection: ConnectionConfig,
    pub channels: ChannelDefaults,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name, used in log output
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "keysight-smu".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
        }
    }
}

/// How the resource is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw socket resources use TCP, everything else VISA
    Auto,
    Tcp,
    Visa,
    /// Simulated B2902B
    Mock,
}

/// Instrument connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// VISA resource string, e.g. `USB0::2391::12345::XY00001234::0::INSTR`
    pub resource: String,
    pub transport: TransportKind,
    /// Reply timeout in milliseconds
    pub timeout_ms: u64,
    /// Connection timeout in milliseconds (TCP only)
    pub connect_timeout_ms: u64,
    /// Appended to every command line
    pub write_terminator: String,
    /// Substring the `*IDN?` model field must contain
    pub expected_model: String,
    /// Query the error queue after every command
    pub verify_commands: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            resource: "USB0::2391::12345::XY00001234::0::INSTR".to_string(),
            transport: TransportKind::Mock,
            timeout_ms: 2_000,
            connect_timeout_ms: 5_000,
            write_terminator: "\n".to_string(),
            expected_model: "B2902B".to_string(),
            verify_commands: false,
        }
    }
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Range assumed for each channel until it is set explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelDefaults {
    /// Volts
    pub voltage_range: f64,
    /// Amperes
    pub current_range: f64,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        Self {
            voltage_range: 20.0,
            current_range: 2.0,
        }
    }
}

impl SmuConfig {
    /// Load configuration from `config/smu.toml` and environment variables
    ///
    /// Example override: `KEYSIGHT_SMU_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> SmuResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> SmuResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> SmuResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(SmuError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let connection = &self.connection;
        if connection.resource.trim().is_empty() {
            return Err(SmuError::Configuration(
                "connection.resource must not be empty".into(),
            ));
        }
        if connection.expected_model.trim().is_empty() {
            return Err(SmuError::Configuration(
                "connection.expected_model must not be empty".into(),
            ));
        }
        if connection.timeout_ms == 0 || connection.connect_timeout_ms == 0 {
            return Err(SmuError::Configuration(
                "connection timeouts must be greater than zero".into(),
            ));
        }

        for (name, value) in [
            ("voltage_range", self.channels.voltage_range),
            ("current_range", self.channels.current_range),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(SmuError::Configuration(format!(
                    "channels.{name} must be positive, got {value}"
                )));
            }
        }

        Ok(())
    }
}

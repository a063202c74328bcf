//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and every field is optional; missing values take the defaults
//! below, so an empty file is a valid configuration.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{GcsError, Result};

/// Baud rates offered by common telemetry radios
pub const SUPPORTED_BAUD_RATES: [u32; 19] = [
    1200, 2400, 4800, 9600, 14400, 19200, 28800, 38400, 57600, 76800, 115200, 153600, 230400,
    307200, 460800, 614400, 921600, 1000000, 1500000,
];

/// Upper bound for most timing fields, in milliseconds
const MAX_TIMING_MS: u64 = 60_000;

/// Upper bound for the connect timeout, in milliseconds
const MAX_CONNECT_TIMEOUT_MS: u64 = 300_000;

/// Upper bound for per-metric history capacity
const MAX_HISTORY_CAPACITY: usize = 10_000;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection lifecycle configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Port to connect to at startup (empty: wait for the user)
    #[serde(default)]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_failed_reset_ms")]
    pub failed_reset_ms: u64,

    #[serde(default = "default_status_clear_ms")]
    pub status_clear_ms: u64,

    #[serde(default = "default_cancel_message_clear_ms")]
    pub cancel_message_clear_ms: u64,

    /// Connect when an accepted notification names a known telemetry radio
    #[serde(default)]
    pub auto_connect_known: bool,

    /// Radio settings JSON imported at startup (empty: built-in defaults)
    #[serde(default)]
    pub radio_settings_file: String,
}

/// Port discovery configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PortsConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_notification_dismiss_ms")]
    pub notification_dismiss_ms: u64,
}

/// Rolling history configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HistoryConfig {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

/// Flight command configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CommandConfig {
    #[serde(default = "default_takeoff_altitude_m")]
    pub takeoff_altitude_m: f64,

    #[serde(default = "default_land_min_altitude_m")]
    pub land_min_altitude_m: f64,

    #[serde(default = "default_command_status_clear_ms")]
    pub command_status_clear_ms: u64,
}

/// Telemetry ingestion configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// Clamp battery, throttle, satellites and GPS status into range
    #[serde(default = "default_clamp_ranges")]
    pub clamp_ranges: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily log files (empty: stdout only)
    #[serde(default)]
    pub log_dir: String,
}

// Default value functions
fn default_baud_rate() -> u32 { 57600 }
fn default_connect_timeout_ms() -> u64 { 30_000 }
fn default_failed_reset_ms() -> u64 { 3000 }
fn default_status_clear_ms() -> u64 { 3000 }
fn default_cancel_message_clear_ms() -> u64 { 2000 }

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_notification_dismiss_ms() -> u64 { 3000 }

fn default_history_capacity() -> usize { crate::telemetry::history::DEFAULT_HISTORY_CAPACITY }

fn default_takeoff_altitude_m() -> f64 { 10.0 }
fn default_land_min_altitude_m() -> f64 { crate::session::connection::DEFAULT_LAND_MIN_ALTITUDE_M }
fn default_command_status_clear_ms() -> u64 { 5000 }

fn default_clamp_ranges() -> bool { true }

fn default_log_level() -> String { "info".to_string() }

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            connect_timeout_ms: default_connect_timeout_ms(),
            failed_reset_ms: default_failed_reset_ms(),
            status_clear_ms: default_status_clear_ms(),
            cancel_message_clear_ms: default_cancel_message_clear_ms(),
            auto_connect_known: false,
            radio_settings_file: String::new(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            notification_dismiss_ms: default_notification_dismiss_ms(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: default_history_capacity() }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            takeoff_altitude_m: default_takeoff_altitude_m(),
            land_min_altitude_m: default_land_min_altitude_m(),
            command_status_clear_ms: default_command_status_clear_ms(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { clamp_ranges: default_clamp_ranges() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: String::new(),
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> GcsError {
    GcsError::Config(toml::de::Error::custom(message))
}

fn check_timing(name: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 || value > max {
        return Err(invalid(format!("{} must be between 1 and {}", name, max)));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use skypulse_gcs::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Validate baud rate
        if !SUPPORTED_BAUD_RATES.contains(&self.connection.baud_rate) {
            return Err(invalid(format!(
                "baud_rate {} is not supported (expected one of {:?})",
                self.connection.baud_rate, SUPPORTED_BAUD_RATES
            )));
        }

        // Validate timing fields
        check_timing(
            "connect_timeout_ms",
            self.connection.connect_timeout_ms,
            MAX_CONNECT_TIMEOUT_MS,
        )?;
        for (name, value) in [
            ("failed_reset_ms", self.connection.failed_reset_ms),
            ("status_clear_ms", self.connection.status_clear_ms),
            ("cancel_message_clear_ms", self.connection.cancel_message_clear_ms),
            ("poll_interval_ms", self.ports.poll_interval_ms),
            ("notification_dismiss_ms", self.ports.notification_dismiss_ms),
            ("command_status_clear_ms", self.commands.command_status_clear_ms),
        ] {
            check_timing(name, value, MAX_TIMING_MS)?;
        }

        // Validate history capacity
        if self.history.capacity == 0 || self.history.capacity > MAX_HISTORY_CAPACITY {
            return Err(invalid(format!(
                "history capacity must be between 1 and {}",
                MAX_HISTORY_CAPACITY
            )));
        }

        // Validate command limits
        if !self.commands.takeoff_altitude_m.is_finite() || self.commands.takeoff_altitude_m <= 0.0 {
            return Err(invalid("takeoff_altitude_m must be a positive number"));
        }

        if !self.commands.land_min_altitude_m.is_finite() || self.commands.land_min_altitude_m < 0.0 {
            return Err(invalid("land_min_altitude_m must be zero or positive"));
        }

        // Validate log level
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid(format!(
                "log level '{}' must be one of: trace, debug, info, warn, error",
                self.logging.level
            )));
        }

        Ok(())
    }
}

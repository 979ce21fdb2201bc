//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. `config/keithley.toml` (base configuration)
//! 2. Environment variables (prefixed with `KEITHLEY_`, sections separated by `__`)
//!
//! # Example
//! ```no_run
//! use daq_driver_keithley::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```
//!
//! Environment override example: `KEITHLEY_SWEEP__POINTS=51`.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::keithley2600::SourceMode;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/keithley.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Sweep detector settings
    #[serde(default)]
    pub sweep: Option<SweepSettings>,
    /// Source actuator settings
    #[serde(default)]
    pub source: Option<SourceSettings>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// How a resource identifier is turned into an open connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Pick from the resource prefix: `SIM` is simulated, `TCPIP...::SOCKET` is a raw
    /// socket, anything else goes through VISA.
    #[default]
    Auto,
    /// System VISA library (requires the `instrument_visa` feature)
    Visa,
    /// Raw TCP socket (`TCPIP0::<host>::<port>::SOCKET`)
    Socket,
    /// In-process instrument simulator
    Simulated,
}

/// Connection to one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Resource identifier, e.g. `USB0::0x05E6::0x2614::4103593::INSTR`.
    ///
    /// Empty means "first discovered resource".
    #[serde(default)]
    pub resource: String,
    /// Transport backend
    #[serde(default)]
    pub backend: Backend,
    /// Per-reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            resource: String::new(),
            backend: Backend::Auto,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    /// Connection to `resource` with default backend selection and timeout.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Default::default()
        }
    }

    /// Builder: force a backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Builder: set the reply timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Reply timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backend after resolving `Auto` against the resource prefix.
    #[must_use]
    pub fn resolved_backend(&self) -> Backend {
        match self.backend {
            Backend::Auto => {
                let upper = self.resource.to_ascii_uppercase();
                if upper.starts_with("SIM") {
                    Backend::Simulated
                } else if upper.starts_with("TCPIP") && upper.ends_with("::SOCKET") {
                    Backend::Socket
                } else {
                    Backend::Visa
                }
            }
            explicit => explicit,
        }
    }

    /// Validate connection settings
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Sweep detector (1D viewer) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSettings {
    /// Instrument connection
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// SMU channel letter
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Enable measurement autorange when the channel is created
    #[serde(default = "default_true")]
    pub autorange: bool,
    /// Sweep start voltage (V)
    #[serde(default)]
    pub start_v: f64,
    /// Sweep stop voltage (V)
    #[serde(default = "default_stop_v")]
    pub stop_v: f64,
    /// Settling time per point (s)
    #[serde(default = "default_stabilization_s")]
    pub stabilization_s: f64,
    /// Number of sweep points
    #[serde(default = "default_points")]
    pub points: u32,
    /// Source current compliance (A)
    #[serde(default = "default_current_limit")]
    pub current_limit_a: f64,
    /// Source a fixed voltage between sweeps
    #[serde(default)]
    pub idle_polarization: bool,
    /// Voltage applied between sweeps when idle polarization is on (V)
    #[serde(default)]
    pub idle_voltage_v: f64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            channel: default_channel(),
            autorange: true,
            start_v: 0.0,
            stop_v: default_stop_v(),
            stabilization_s: default_stabilization_s(),
            points: default_points(),
            current_limit_a: default_current_limit(),
            idle_polarization: false,
            idle_voltage_v: 0.0,
        }
    }
}

impl SweepSettings {
    /// Validate sweep settings
    pub fn validate(&self) -> Result<(), String> {
        self.connection.validate()?;
        validate_channel(&self.channel)?;
        if !self.start_v.is_finite() || !self.stop_v.is_finite() {
            return Err("start_v and stop_v must be finite".to_string());
        }
        if !(self.stabilization_s >= 0.0) {
            return Err(format!(
                "stabilization_s must be >= 0, got {}",
                self.stabilization_s
            ));
        }
        if !(self.current_limit_a > 0.0) {
            return Err(format!(
                "current_limit_a must be > 0, got {}",
                self.current_limit_a
            ));
        }
        Ok(())
    }
}

/// Source actuator (move plugin) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    /// Instrument connection
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// SMU channel letter
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Enable measurement autorange when the channel is created
    #[serde(default = "default_true")]
    pub autorange: bool,
    /// "Voltage" or "Current"
    #[serde(default = "default_source_type")]
    pub source_type: String,
    /// Optional `[min, max]` clamp for setpoints
    #[serde(default)]
    pub bounds: Option<[f64; 2]>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            channel: default_channel(),
            autorange: true,
            source_type: default_source_type(),
            bounds: None,
        }
    }
}

impl SourceSettings {
    /// Validate source settings
    pub fn validate(&self) -> Result<(), String> {
        self.connection.validate()?;
        validate_channel(&self.channel)?;
        self.source_type
            .parse::<SourceMode>()
            .map_err(|e| e.to_string())?;
        if let Some([min, max]) = self.bounds {
            if !(min <= max) {
                return Err(format!("bounds must satisfy min <= max, got [{}, {}]", min, max));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_app_name() -> String {
    "Keithley DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_channel() -> String {
    "A".to_string()
}

fn default_true() -> bool {
    true
}

fn default_stop_v() -> f64 {
    1.0
}

fn default_stabilization_s() -> f64 {
    1e-3
}

fn default_points() -> u32 {
    101
}

fn default_current_limit() -> f64 {
    0.1
}

fn default_source_type() -> String {
    "Voltage".to_string()
}

fn validate_channel(channel: &str) -> Result<(), String> {
    let mut chars = channel.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Ok(()),
        _ => Err(format!(
            "Invalid channel '{}'. Must be a single letter such as A or B",
            channel
        )),
    }
}

impl AppConfig {
    /// Load configuration from `config/keithley.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("KEITHLEY_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if let Some(sweep) = &self.sweep {
            sweep.validate().map_err(|e| format!("[sweep] {}", e))?;
        }
        if let Some(source) = &self.source {
            source.validate().map_err(|e| format!("[source] {}", e))?;
        }

        Ok(())
    }
}

//! Configuration for the silo monitor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Serial line settings for the RTU bus
    pub serial: SerialConfig,

    /// Explicit silo entries
    #[serde(default)]
    pub silos: Vec<SiloEntry>,

    /// Contiguous unit id range, expanded at load
    #[serde(default)]
    pub silo_range: Option<SiloRange>,

    /// Capacity applied to silos that do not set their own
    #[serde(default = "default_capacity")]
    pub default_capacity: u32,

    /// Poll cycle settings
    #[serde(default)]
    pub polling: PollingConfig,

    /// HTTP API settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Offline alert settings
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial line configuration.
///
/// Defaults match the deployed bus: 9600 baud, 8 data bits, even parity,
/// one stop bit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM5")
    pub port: String,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Parity: "none", "even", or "odd" (default: "even")
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "even".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_capacity() -> u32 {
    28000
}

/// An explicitly configured silo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiloEntry {
    /// Modbus unit id (1-247)
    pub id: u8,

    /// Calibration capacity; falls back to `default_capacity`
    #[serde(default)]
    pub capacity: Option<u32>,

    /// Display code used by the dashboard and in alerts (default: "S<id>")
    #[serde(default)]
    pub code: Option<String>,
}

/// A contiguous range of unit ids sharing one capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiloRange {
    /// First unit id (inclusive)
    pub start: u8,

    /// Last unit id (inclusive)
    pub end: u8,

    /// Capacity for all silos in the range; falls back to `default_capacity`
    #[serde(default)]
    pub capacity: Option<u32>,
}

/// A fully resolved silo: range expansion applied, capacity and display
/// code filled in. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiloConfig {
    /// Modbus unit id
    pub id: u8,
    /// Calibration capacity (raw register value at 100%)
    pub capacity: u32,
    /// Display code
    pub code: String,
}

/// Poll cycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Poll cycle interval in seconds, counted from cycle start
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Pause after every request, giving the bus and the attached
    /// hardware time to recover
    #[serde(default = "default_inter_request_delay_ms")]
    pub inter_request_delay_ms: u64,

    /// Holding register address read from every silo
    #[serde(default = "default_register_address")]
    pub register_address: u16,

    /// Cycles without a successful read before a silo derives to offline
    /// (must be at least 2)
    #[serde(default = "default_staleness_cycles")]
    pub staleness_cycles: u32,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_request_timeout_ms() -> u64 {
    1000
}

fn default_inter_request_delay_ms() -> u64 {
    50
}

fn default_register_address() -> u16 {
    10
}

fn default_staleness_cycles() -> u32 {
    3
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            inter_request_delay_ms: default_inter_request_delay_ms(),
            register_address: default_register_address(),
            staleness_cycles: default_staleness_cycles(),
        }
    }
}

impl PollingConfig {
    /// Poll cycle interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Pause inserted after every bus request.
    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }

    /// Age beyond which a reading derives to offline.
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.interval_secs * u64::from(self.staleness_cycles))
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address (default: "0.0.0.0:5000")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Offline alert configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Enable the alert task (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Minimum minutes between repeated alerts for the same silo
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,

    /// How often the alert task re-evaluates the store
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Telegram delivery settings
    #[serde(default)]
    pub telegram: TelegramConfig,
}

fn default_cooldown_minutes() -> u64 {
    15
}

fn default_check_interval_secs() -> u64 {
    60
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cooldown_minutes: default_cooldown_minutes(),
            check_interval_secs: default_check_interval_secs(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl AlertConfig {
    /// Minimum time between repeated alerts for the same silo.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }

    /// Store re-evaluation interval.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Telegram credentials are read from the environment, never from the
/// config file itself; the config only names the variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Environment variable holding the bot token
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,

    /// Environment variable holding the chat id
    #[serde(default = "default_chat_id_env")]
    pub chat_id_env: String,
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

fn default_chat_id_env() -> String {
    "TELEGRAM_CHAT_ID".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token_env: default_bot_token_env(),
            chat_id_env: default_chat_id_env(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text (default)
    #[default]
    Text,
    /// Structured JSON for log aggregation
    Json,
}

impl MonitorConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: MonitorConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand the range, apply explicit entries on top, and fill in
    /// capacities and display codes. Result is sorted by ascending unit id.
    pub fn resolved_silos(&self) -> Vec<SiloConfig> {
        let mut resolved: BTreeMap<u8, SiloConfig> = BTreeMap::new();

        if let Some(range) = &self.silo_range {
            let capacity = range.capacity.unwrap_or(self.default_capacity);
            for id in range.start..=range.end {
                resolved.insert(
                    id,
                    SiloConfig {
                        id,
                        capacity,
                        code: default_code(id),
                    },
                );
            }
        }

        for entry in &self.silos {
            resolved.insert(
                entry.id,
                SiloConfig {
                    id: entry.id,
                    capacity: entry.capacity.unwrap_or(self.default_capacity),
                    code: entry.code.clone().unwrap_or_else(|| default_code(entry.id)),
                },
            );
        }

        resolved.into_values().collect()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.is_empty() {
            return Err(ConfigError::Validation(
                "Serial port path cannot be empty".to_string(),
            ));
        }

        match self.serial.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "Invalid parity '{}' (use none, even, or odd)",
                    other
                )));
            }
        }

        if self.silos.is_empty() && self.silo_range.is_none() {
            return Err(ConfigError::Validation(
                "At least one silo must be configured (silos or silo_range)".to_string(),
            ));
        }

        if let Some(range) = &self.silo_range {
            if range.start == 0 || range.start > range.end {
                return Err(ConfigError::Validation(format!(
                    "Invalid silo_range {}..={} (unit ids are 1-247, start <= end)",
                    range.start, range.end
                )));
            }
            if range.end > 247 {
                return Err(ConfigError::Validation(format!(
                    "silo_range end {} exceeds the RTU unit id limit of 247",
                    range.end
                )));
            }
        }

        let mut seen = BTreeMap::new();
        for entry in &self.silos {
            if entry.id == 0 || entry.id > 247 {
                return Err(ConfigError::Validation(format!(
                    "Silo id {} out of range (unit ids are 1-247)",
                    entry.id
                )));
            }
            if seen.insert(entry.id, ()).is_some() {
                return Err(ConfigError::Validation(format!(
                    "Duplicate silo id {}",
                    entry.id
                )));
            }
        }

        if self.polling.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "polling.interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.polling.staleness_cycles < 2 {
            return Err(ConfigError::Validation(format!(
                "polling.staleness_cycles must be at least 2 (got {})",
                self.polling.staleness_cycles
            )));
        }

        if self.http.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid http.listen address '{}'",
                self.http.listen
            )));
        }

        Ok(())
    }

    /// Non-fatal findings, logged by the caller once tracing is up.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for silo in self.resolved_silos() {
            if silo.capacity == 0 {
                warnings.push(format!(
                    "Silo {} has capacity 0; readings will clamp to 0%",
                    silo.id
                ));
            }
        }
        warnings
    }
}

fn default_code(id: u8) -> String {
    format!("S{:02}", id)
}

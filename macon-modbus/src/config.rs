//! Configuration for the Macon Modbus driver.

use macon_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportSettings;

/// Baud rate of the Macon protocol.
pub const MACON_BAUD_RATE: u32 = 2400;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] macon_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete driver configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaconConfig {
    /// Serial link settings
    #[serde(default)]
    pub serial: SerialConfig,

    /// Polling settings
    #[serde(default)]
    pub poll: PollConfig,

    /// Setpoint control settings
    #[serde(default)]
    pub control: ControlConfig,

    /// Record sink settings
    #[serde(default)]
    pub sink: SinkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial link and transaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyAMA0")
    #[serde(default = "default_port")]
    pub port: String,
    /// Baud rate (the device only speaks 2400)
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
    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Response timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts for reads after bus noise
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Pause before a retry in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Inter-frame silence in milliseconds (default: 3.5 character times)
    #[serde(default)]
    pub frame_gap_ms: Option<u64>,
}

fn default_port() -> String {
    "/dev/ttyAMA0".to_string()
}

fn default_baud_rate() -> u32 {
    MACON_BAUD_RATE
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

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            unit_id: default_unit_id(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            frame_gap_ms: None,
        }
    }
}

impl SerialConfig {
    pub fn serial_parity(&self) -> tokio_serial::Parity {
        match self.parity.to_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        }
    }

    pub fn serial_stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    pub fn serial_data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    /// Transaction timing derived from these settings.
    pub fn transport_settings(&self) -> TransportSettings {
        let frame_gap = match self.frame_gap_ms {
            Some(ms) => Duration::from_millis(ms),
            None => TransportSettings::frame_gap_for_baud(self.baud_rate),
        };

        TransportSettings {
            slave: self.unit_id,
            response_timeout: Duration::from_millis(self.timeout_ms),
            frame_gap,
            retries: self.retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// Poll cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Largest hole between polled registers read through in one request
    #[serde(default = "default_max_register_gap")]
    pub max_register_gap: u16,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_register_gap() -> u16 {
    8
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            max_register_gap: default_max_register_gap(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Setpoint, host control and reset settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Seconds the unit stays off during a soft reset
    #[serde(default = "default_settle_secs")]
    pub settle_secs: f64,
    /// Pause between consecutive control writes in milliseconds
    #[serde(default = "default_write_delay_ms")]
    pub write_delay_ms: u64,
    /// Hot water tank delta T in °C
    #[serde(default)]
    pub hot_water_delta_t: Option<f64>,
    /// Domestic hot water setpoint in °C
    #[serde(default)]
    pub hot_water_setpoint: Option<f64>,
    /// Compressor frequency target in Hz, applied under host control
    #[serde(default)]
    pub compressor_frequency: Option<f64>,
    /// Read back every written register
    #[serde(default = "default_verify")]
    pub verify: bool,
}

/// Longest soft reset pause accepted, in seconds.
pub const MAX_SETTLE_SECS: f64 = 600.0;

fn default_settle_secs() -> f64 {
    2.0
}

fn default_write_delay_ms() -> u64 {
    200
}

fn default_verify() -> bool {
    true
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            settle_secs: default_settle_secs(),
            write_delay_ms: default_write_delay_ms(),
            hot_water_delta_t: None,
            hot_water_setpoint: None,
            compressor_frequency: None,
            verify: default_verify(),
        }
    }
}

impl ControlConfig {
    /// Soft reset pause, capped at [`MAX_SETTLE_SECS`].
    pub fn settle(&self) -> Duration {
        Duration::try_from_secs_f64(self.settle_secs.min(MAX_SETTLE_SECS)).unwrap_or_default()
    }

    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }
}

/// Where records go besides the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Append-only JSON-lines file
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl MaconConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: MaconConfig = macon_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: MaconConfig = macon_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let serial = &self.serial;

        if serial.port.is_empty() {
            return Err(ConfigError::Validation(
                "Serial port cannot be empty".to_string(),
            ));
        }

        if serial.baud_rate != MACON_BAUD_RATE {
            return Err(ConfigError::Validation(format!(
                "baud_rate must be {} for the Macon protocol, got {}",
                MACON_BAUD_RATE, serial.baud_rate
            )));
        }

        if serial.unit_id == 0 || serial.unit_id > 247 {
            return Err(ConfigError::Validation(format!(
                "unit_id must be 1-247, got {}",
                serial.unit_id
            )));
        }

        match serial.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "invalid parity '{}' (use none, even, or odd)",
                    serial.parity
                )));
            }
        }

        if !(5..=8).contains(&serial.data_bits) {
            return Err(ConfigError::Validation(format!(
                "data_bits must be 5-8, got {}",
                serial.data_bits
            )));
        }

        if !(1..=2).contains(&serial.stop_bits) {
            return Err(ConfigError::Validation(format!(
                "stop_bits must be 1 or 2, got {}",
                serial.stop_bits
            )));
        }

        if serial.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }

        if serial.retries > 5 {
            return Err(ConfigError::Validation(format!(
                "retries must be at most 5, got {}",
                serial.retries
            )));
        }

        if self.poll.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "poll interval_secs must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=MAX_SETTLE_SECS).contains(&self.control.settle_secs) {
            return Err(ConfigError::Validation(format!(
                "settle_secs must be between 0 and {}, got {}",
                MAX_SETTLE_SECS, self.control.settle_secs
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MaconConfig::parse("{}").unwrap();

        assert_eq!(config.serial.port, "/dev/ttyAMA0");
        assert_eq!(config.serial.baud_rate, 2400);
        assert_eq!(config.serial.parity, "even");
        assert_eq!(config.serial.unit_id, 1);
        assert_eq!(config.poll.interval_secs, 60);
        assert_eq!(config.control.settle(), Duration::from_secs(2));
        assert_eq!(config.control.write_delay(), Duration::from_millis(200));
        assert!(config.control.verify);
        assert!(config.sink.path.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            serial: {
                port: "/dev/ttyUSB0",
                parity: "none",
                timeout_ms: 500,
                retries: 3,
                frame_gap_ms: 20,
            },
            poll: { interval_secs: 30, max_register_gap: 0 },
            control: {
                settle_secs: 5,
                hot_water_delta_t: 4,
                hot_water_setpoint: 46,
                compressor_frequency: 70,
                verify: false,
            },
            sink: { path: "/var/lib/macon/records.jsonl" },
            logging: { level: "debug", format: "json" },
        }"#;

        let config = MaconConfig::parse(json).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.serial_parity(), tokio_serial::Parity::None);
        assert_eq!(config.poll.max_register_gap, 0);
        assert_eq!(config.control.hot_water_setpoint, Some(46.0));
        assert_eq!(config.control.compressor_frequency, Some(70.0));
        assert!(!config.control.verify);
        assert_eq!(
            config.sink.path.as_deref(),
            Some(Path::new("/var/lib/macon/records.jsonl"))
        );

        let settings = config.serial.transport_settings();
        assert_eq!(settings.slave, 1);
        assert_eq!(settings.response_timeout, Duration::from_millis(500));
        assert_eq!(settings.frame_gap, Duration::from_millis(20));
        assert_eq!(settings.retries, 3);
    }

    #[test]
    fn test_default_frame_gap_follows_baud() {
        let settings = SerialConfig::default().transport_settings();
        assert_eq!(settings.frame_gap, TransportSettings::frame_gap_for_baud(2400));
    }

    #[test]
    fn test_validate_rejects_other_baud_rates() {
        let result = MaconConfig::parse(r#"{ serial: { baud_rate: 9600 } }"#);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_unit_id() {
        assert!(MaconConfig::parse(r#"{ serial: { unit_id: 0 } }"#).is_err());
        assert!(MaconConfig::parse(r#"{ serial: { unit_id: 248 } }"#).is_err());
        assert!(MaconConfig::parse(r#"{ serial: { unit_id: 247 } }"#).is_ok());
    }

    #[test]
    fn test_validate_parity() {
        let result = MaconConfig::parse(r#"{ serial: { parity: "mark" } }"#);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_poll_interval() {
        assert!(MaconConfig::parse(r#"{ poll: { interval_secs: 0 } }"#).is_err());
    }

    #[test]
    fn test_validate_retries() {
        assert!(MaconConfig::parse(r#"{ serial: { retries: 6 } }"#).is_err());
    }

    #[test]
    fn test_validate_settle_secs() {
        assert!(MaconConfig::parse(r#"{ control: { settle_secs: -1 } }"#).is_err());
        assert!(MaconConfig::parse(r#"{ control: { settle_secs: 601 } }"#).is_err());
        assert!(MaconConfig::parse(r#"{ control: { settle_secs: 1e300 } }"#).is_err());
        assert!(MaconConfig::parse(r#"{ control: { settle_secs: 600 } }"#).is_ok());
        assert!(MaconConfig::parse(r#"{ control: { settle_secs: 0 } }"#).is_ok());
    }

    #[test]
    fn test_settle_never_panics() {
        let settle = |secs: f64| {
            ControlConfig {
                settle_secs: secs,
                ..ControlConfig::default()
            }
            .settle()
        };
        assert_eq!(settle(1.5), Duration::from_millis(1500));
        assert_eq!(settle(1e300), Duration::from_secs(600));
        assert_eq!(settle(f64::INFINITY), Duration::from_secs(600));
        assert_eq!(settle(-3.0), Duration::ZERO);
    }

    #[test]
    fn test_parse_error() {
        let result = MaconConfig::parse("{ serial: ");
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_sample_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("macon.json5");
        let config = MaconConfig::load_from_file(path).unwrap();
        assert_eq!(config.serial.baud_rate, MACON_BAUD_RATE);
        assert_eq!(config.control.hot_water_delta_t, Some(4.0));
        assert!(config.sink.path.is_some());
    }
}

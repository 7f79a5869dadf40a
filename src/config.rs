use once_cell::sync::Lazy;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::LinkError;

#[derive(Debug)]
pub struct Config {
    pub log_payloads: bool,
    pub dump_on_error: bool,
    /// Period of the "link became idle" check. `None` means use the device timeout.
    pub tick_interval_ms: Option<u64>,
}

impl Config {
    fn from_env() -> Self {
        let log_payloads = std::env::var("AVLINK_LOG_PAYLOADS")
            .map(|v| v == "1")
            .unwrap_or(false);
        let dump_on_error = std::env::var("AVLINK_DUMP_ON_ERROR")
            .map(|v| v == "1")
            .unwrap_or(false);
        let tick_interval_ms = std::env::var("AVLINK_TICK_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|ms: &u64| *ms > 0);
        Self {
            log_payloads,
            dump_on_error,
            tick_interval_ms,
        }
    }
}

/// Global config loaded once from environment at first access.
pub static GLOBAL_CONFIG: Lazy<Config> = Lazy::new(Config::from_env);

/// Convenience accessor
pub fn config() -> &'static Config {
    &GLOBAL_CONFIG
}

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_MESSAGE_END: &str = "\r\n";
/// Seconds to wait for a reply before the link is freed again.
pub const DEFAULT_TIMEOUT_SECS: f64 = 0.5;
/// Longest reply timeout accepted; anything above is a configuration mistake.
pub const MAX_TIMEOUT_SECS: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial line settings for one device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    /// Line terminator for text protocols; ignored by binary drivers.
    pub message_end: String,
    pub timeout_secs: f64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            message_end: DEFAULT_MESSAGE_END.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl SerialSettings {
    #[must_use]
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }
    #[must_use]
    pub const fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
    #[must_use]
    pub fn with_message_end(mut self, message_end: impl Into<String>) -> Self {
        self.message_end = message_end.into();
        self
    }
    #[must_use]
    pub const fn with_timeout_secs(mut self, timeout_secs: f64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Reply timeout, or a config error if `timeout_secs` is not in
    /// `(0, MAX_TIMEOUT_SECS]`.
    pub fn timeout(&self) -> Result<Duration, LinkError> {
        let secs = self.timeout_secs;
        if !(secs > 0.0 && secs <= MAX_TIMEOUT_SECS) {
            return Err(LinkError::Config(format!(
                "timeout_secs must be in (0, {MAX_TIMEOUT_SECS}], got {secs}"
            )));
        }
        match Duration::try_from_secs_f64(secs) {
            Ok(d) if !d.is_zero() => Ok(d),
            _ => Err(LinkError::Config(format!(
                "timeout_secs too small: {secs}"
            ))),
        }
    }

    /// Check everything that can be checked without touching the port.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.port.trim().is_empty() {
            return Err(LinkError::Config("serial port must be set".into()));
        }
        self.validate_line()
    }

    /// Like [`validate`](Self::validate) but without requiring a port name,
    /// for links that are not opened from these settings.
    pub fn validate_line(&self) -> Result<(), LinkError> {
        if self.baud_rate == 0 {
            return Err(LinkError::Config("baud_rate must be positive".into()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(LinkError::Config(format!(
                "unsupported data_bits: {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(LinkError::Config(format!(
                "unsupported stop_bits: {}",
                self.stop_bits
            )));
        }
        self.timeout().map(|_| ())
    }
}

/// One `[device]` entry of a device TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Driver name, e.g. `"extron_video_switcher"` or `"nec_projector"`.
    pub driver: String,
    #[serde(default)]
    pub serial: SerialSettings,
}

#[derive(Debug, Deserialize)]
struct DeviceFile {
    device: DeviceConfig,
}

impl DeviceConfig {
    /// Parse and validate a device definition.
    ///
    /// ```toml
    /// [device]
    /// name = "switcher"
    /// driver = "extron_video_switcher"
    ///
    /// [device.serial]
    /// port = "/dev/ttyUSB0"
    /// baud_rate = 9600
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self, LinkError> {
        let parsed: DeviceFile = toml::from_str(s)
            .map_err(|e| LinkError::Config(format!("device config parse error: {e}")))?;
        let cfg = parsed.device;
        if cfg.name.trim().is_empty() {
            return Err(LinkError::Config("device name must be set".into()));
        }
        cfg.serial.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self, LinkError> {
        let s = fs::read_to_string(path).map_err(|e| {
            LinkError::Config(format!("read device config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&s)
    }
}

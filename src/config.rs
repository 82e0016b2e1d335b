//! Configuration for the controller and its serial link.
//!
//! Loaded from TOML, with every field except the port path optional:
//!
//! ```toml
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! timeout = "10s"
//!
//! [auto_range]
//! low_threshold = 0.09
//! high_threshold = 0.95
//! ```
//!
//! The defaults match the instrument's shipped serial settings (9600 baud,
//! 10 s command timeout) and the stock auto-range thresholds.

use crate::autorange::{Thresholds, DEFAULT_HIGH_THRESHOLD, DEFAULT_LOW_THRESHOLD};
use crate::error::{CryoconError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Connection and behavior settings for one controller.
#[derive(Debug, Clone, Deserialize)]
pub struct CryoconConfig {
    /// Serial port path (e.g. `/dev/ttyUSB0`, `COM3`).
    pub port: String,

    /// Baud rate; the 22C ships at 9600.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Round-trip timeout per query, in humantime form (`"10s"`, `"500ms"`).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Auto-range pass thresholds.
    #[serde(default)]
    pub auto_range: AutoRangeConfig,
}

/// Power-fraction thresholds for the auto-range pass.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AutoRangeConfig {
    /// Step the range down below this output fraction.
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,

    /// Step the range up above this output fraction.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
}

impl AutoRangeConfig {
    /// Validate and convert into [`Thresholds`].
    pub fn thresholds(&self) -> Result<Thresholds> {
        Thresholds::new(self.low_threshold, self.high_threshold)
    }
}

impl Default for AutoRangeConfig {
    fn default() -> Self {
        Self {
            low_threshold: DEFAULT_LOW_THRESHOLD,
            high_threshold: DEFAULT_HIGH_THRESHOLD,
        }
    }
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_low_threshold() -> f64 {
    DEFAULT_LOW_THRESHOLD
}

fn default_high_threshold() -> f64 {
    DEFAULT_HIGH_THRESHOLD
}

impl CryoconConfig {
    /// Config for the given port with the instrument's factory settings
    /// (9600 baud, 10 s timeout, default auto-range thresholds).
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            timeout: default_timeout(),
            auto_range: AutoRangeConfig::default(),
        }
    }

    /// Parse a config from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CryoconConfig = toml::from_str(text)
            .map_err(|e| CryoconError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CryoconError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("loaded config from '{}'", path.display());
        Ok(config)
    }

    /// Check settings that parse fine but are semantically invalid.
    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(CryoconError::Config("port must not be empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(CryoconError::Config("baud_rate must be positive".into()));
        }
        if self.timeout.is_zero() {
            return Err(CryoconError::Config("timeout must be positive".into()));
        }
        self.auto_range.thresholds()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = CryoconConfig::from_toml_str(r#"port = "/dev/ttyUSB0""#).unwrap();
        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.auto_range.low_threshold, DEFAULT_LOW_THRESHOLD);
        assert_eq!(config.auto_range.high_threshold, DEFAULT_HIGH_THRESHOLD);
    }

    #[test]
    fn full_config_parses() {
        let config = CryoconConfig::from_toml_str(
            r#"
            port = "COM3"
            baud_rate = 19200
            timeout = "500ms"

            [auto_range]
            low_threshold = 0.2
            high_threshold = 0.8
            "#,
        )
        .unwrap();
        assert_eq!(config.port, "COM3");
        assert_eq!(config.baud_rate, 19200);
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.auto_range.low_threshold, 0.2);
        assert_eq!(config.auto_range.high_threshold, 0.8);
    }

    #[test]
    fn missing_port_is_rejected() {
        assert!(matches!(
            CryoconConfig::from_toml_str("baud_rate = 9600"),
            Err(CryoconError::Config(_))
        ));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let result = CryoconConfig::from_toml_str(
            r#"
            port = "/dev/ttyUSB0"

            [auto_range]
            low_threshold = 0.9
            high_threshold = 0.1
            "#,
        );
        assert!(matches!(result, Err(CryoconError::InvalidThresholds { .. })));
    }

    #[test]
    fn loads_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"/dev/ttyS1\"").unwrap();
        writeln!(file, "timeout = \"2s\"").unwrap();

        let config = CryoconConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, "/dev/ttyS1");
        assert_eq!(config.timeout, Duration::from_secs(2));
    }

    #[test]
    fn unreadable_file_is_a_config_error() {
        assert!(matches!(
            CryoconConfig::from_file("/nonexistent/cryocon.toml"),
            Err(CryoconError::Config(_))
        ));
    }
}

//! Configuration for the encoder bridge
//!
//! YAML file with one section per concern. Every field has a default, so an
//! empty (or missing) file yields a working configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::led_throttle::{ThrottleSettings, DEFAULT_MIN_DELTA, DEFAULT_THROTTLE_INTERVAL_MS};
use crate::protocol::DeviceScript;
use crate::state::{ChannelId, CHANNEL_COUNT, DEFAULT_CHANNEL_VALUE};
use crate::transport::{PortFilter, DEFAULT_BAUD_RATE};

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

/// Serial link configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    /// Exact port name, e.g. `/dev/ttyACM0` or `COM4`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Case-insensitive substring matched against port names and descriptions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_pattern: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Connect to the first authorized port at startup
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

/// LED feedback and device script configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_throttle_interval")]
    pub throttle_interval_ms: u64,
    #[serde(default = "default_min_delta")]
    pub min_delta: f64,
    /// Pause between init commands
    #[serde(default = "default_init_pacing")]
    pub init_pacing_ms: u64,
    #[serde(default = "default_leds_per_channel")]
    pub leds_per_channel: u8,
    /// Normalized change per encoder detent
    #[serde(default = "default_encoder_step")]
    pub encoder_step: f64,
}

/// Automatic reconnect configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconnect_delay")]
    pub delay_ms: u64,
}

/// Initial channel values, keyed by channel name
///
/// ```yaml
/// channels:
///   initial:
///     volume: 0.8
///     reverb: 0.2
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub initial: BTreeMap<String, f64>,
}

impl BridgeConfig {
    /// Load configuration from file with validation
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_yaml(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Parse and validate YAML text
    pub fn from_yaml(contents: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map
        let config: BridgeConfig = if contents.trim().is_empty() {
            BridgeConfig::default()
        } else {
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.serial.baud_rate == 0 {
            anyhow::bail!("serial.baud_rate must be greater than 0");
        }
        if self.serial.write_timeout_ms == 0 {
            anyhow::bail!("serial.write_timeout_ms must be greater than 0");
        }
        if let Some(port) = &self.serial.port {
            if port.trim().is_empty() {
                anyhow::bail!("serial.port cannot be empty when set");
            }
        }

        let fb = &self.feedback;
        if !(0.0..1.0).contains(&fb.min_delta) {
            anyhow::bail!("feedback.min_delta must be in [0, 1), got {}", fb.min_delta);
        }
        if fb.leds_per_channel == 0 {
            anyhow::bail!("feedback.leds_per_channel must be greater than 0");
        }
        if !(fb.encoder_step > 0.0 && fb.encoder_step <= 1.0) {
            anyhow::bail!("feedback.encoder_step must be in (0, 1], got {}", fb.encoder_step);
        }

        if self.reconnect.enabled && self.reconnect.delay_ms == 0 {
            anyhow::bail!("reconnect.delay_ms must be greater than 0");
        }

        self.initial_values()?;

        Ok(())
    }

    /// Initial channel values in channel order
    pub fn initial_values(&self) -> Result<[f64; CHANNEL_COUNT]> {
        let mut values = [DEFAULT_CHANNEL_VALUE; CHANNEL_COUNT];

        for (name, value) in &self.channels.initial {
            let channel = ChannelId::from_name(name)
                .with_context(|| format!("Unknown channel '{}' in channels.initial", name))?;
            if !(0.0..=1.0).contains(value) {
                anyhow::bail!("Initial value for '{}' must be in [0, 1], got {}", name, value);
            }
            values[channel.index()] = *value;
        }

        Ok(values)
    }

    pub fn port_filter(&self) -> PortFilter {
        PortFilter {
            port: self.serial.port.clone(),
            pattern: self.serial.port_pattern.clone(),
        }
    }

    pub fn throttle_settings(&self) -> ThrottleSettings {
        ThrottleSettings {
            interval: Duration::from_millis(self.feedback.throttle_interval_ms),
            min_delta: self.feedback.min_delta,
        }
    }

    pub fn device_script(&self) -> DeviceScript {
        DeviceScript {
            leds_per_channel: self.feedback.leds_per_channel,
            encoder_step: self.feedback.encoder_step,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            port_pattern: None,
            baud_rate: default_baud_rate(),
            write_timeout_ms: default_write_timeout(),
            auto_connect: true,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            throttle_interval_ms: default_throttle_interval(),
            min_delta: default_min_delta(),
            init_pacing_ms: default_init_pacing(),
            leds_per_channel: default_leds_per_channel(),
            encoder_step: default_encoder_step(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: default_reconnect_delay(),
        }
    }
}

fn default_true() -> bool { true }
fn default_baud_rate() -> u32 { DEFAULT_BAUD_RATE }
fn default_write_timeout() -> u64 { 1000 }
fn default_throttle_interval() -> u64 { DEFAULT_THROTTLE_INTERVAL_MS }
fn default_min_delta() -> f64 { DEFAULT_MIN_DELTA }
fn default_init_pacing() -> u64 { 100 }
fn default_leds_per_channel() -> u8 { DeviceScript::default().leds_per_channel }
fn default_encoder_step() -> f64 { DeviceScript::default().encoder_step }
fn default_reconnect_delay() -> u64 { 3000 }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config = BridgeConfig::from_yaml("").unwrap();
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.feedback.throttle_interval_ms, 50);
        assert_eq!(config.feedback.init_pacing_ms, 100);
        assert_eq!(config.reconnect.delay_ms, 3000);
        assert!(config.reconnect.enabled);
        assert_eq!(config.initial_values().unwrap(), [0.5; CHANNEL_COUNT]);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let yaml = r#"
serial:
  port_pattern: espruino
feedback:
  min_delta: 0.05
channels:
  initial:
    Reverb: 0.25
"#;
        let config = BridgeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.serial.port_pattern.as_deref(), Some("espruino"));
        assert_eq!(config.serial.write_timeout_ms, 1000);
        assert_eq!(config.feedback.min_delta, 0.05);
        assert_eq!(config.feedback.leds_per_channel, 12);
        assert_eq!(config.initial_values().unwrap(), [0.5, 0.5, 0.5, 0.25]);
    }

    #[test]
    fn test_rejects_unknown_channel() {
        let yaml = "channels:\n  initial:\n    bass: 0.3\n";
        let err = BridgeConfig::from_yaml(yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("bass"));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(BridgeConfig::from_yaml("channels:\n  initial:\n    volume: 1.5\n").is_err());
        assert!(BridgeConfig::from_yaml("feedback:\n  encoder_step: 0\n").is_err());
        assert!(BridgeConfig::from_yaml("serial:\n  baud_rate: 0\n").is_err());
        assert!(BridgeConfig::from_yaml("reconnect:\n  delay_ms: 0\n").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "serial:\n  port: /dev/ttyACM0\n  baud_rate: 9600").unwrap();

        let config = BridgeConfig::load(file.path()).await.unwrap();
        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(config.port_filter().port.is_some());
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load_or_default(dir.path().join("absent.yaml"))
            .await
            .unwrap();
        assert!(config.serial.port.is_none());

        assert!(BridgeConfig::load(dir.path().join("absent.yaml")).await.is_err());
    }
}

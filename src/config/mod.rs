use crate::metering_sml::meter_definitions::{get_meter_profile, MeterProfile};
use crate::metering_sml::structs::{MeterModel, OffsetSpec, StartMatchPolicy, SML_CHECKSUM_LEN, SML_START_SEQUENCE};
use crate::metering_sml::utils::MAX_FIELD_DIGITS;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Environment variable pointing to the configuration file
pub const CONFIG_ENV: &str = "S2M_CONFIG";
const CONFIG_PATHS: [&str; 2] = ["config/sml2mqtt.yaml", "sml2mqtt.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No configuration found, tried {0:?}")]
    NotFound(Vec<String>),
    #[error("Unable to read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Unable to parse configuration: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn serial_device_default() -> String { return "/dev/ttyAMA0".to_string() }
fn serial_baud_rate_default() -> u32 { return 9600 }
fn serial_timeout_ms_default() -> u64 { return 2000 }
fn serial_reopen_delay_secs_default() -> u64 { return 5 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SerialConfig {
    #[serde(default="serial_device_default")]
    pub device: String,
    #[serde(default="serial_baud_rate_default")]
    pub baud_rate: u32,
    #[serde(default="serial_timeout_ms_default")]
    pub timeout_ms: u64,
    #[serde(default="serial_reopen_delay_secs_default")]
    pub reopen_delay_secs: u64,
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reopen_delay(&self) -> Duration {
        Duration::from_secs(self.reopen_delay_secs)
    }
}

fn meter_model_default() -> MeterModel { return MeterModel::IskraMt681 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MeterConfig {
    #[serde(default="meter_model_default")]
    pub model: MeterModel,
    /// Used in topics and log lines, defaults to the model name
    pub name: Option<String>,
    /// Overrides the telegram length of the model
    pub total_length: Option<usize>,
    /// Replaces the built-in offset table, mandatory for `custom`
    pub channels: Option<Vec<OffsetSpec>>,
    #[serde(default)]
    pub start_match: StartMatchPolicy,
    /// Bytes to inspect for a start sequence before giving up, defaults to 4 telegrams
    pub max_sync_bytes: Option<usize>,
}

impl MeterConfig {
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.model.name().to_string())
    }
}

fn mqtt_enabled_default() -> bool { return true }
fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_client_name_default() -> String { return "sml2mqtt".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MqttConfig {
    #[serde(default="mqtt_enabled_default")]
    pub enabled: bool,
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    pub base_topic: Option<String>,
    #[serde(default)]
    pub retain: bool,
}

fn storage_consumption_path_default() -> String { return "bezug.csv".to_string() }
fn storage_feed_in_path_default() -> String { return "einspeisung.csv".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default="storage_consumption_path_default")]
    pub consumption_path: String,
    #[serde(default="storage_feed_in_path_default")]
    pub feed_in_path: String,
}

fn serial_default() -> SerialConfig {
    return SerialConfig {
        device: serial_device_default(),
        baud_rate: serial_baud_rate_default(),
        timeout_ms: serial_timeout_ms_default(),
        reopen_delay_secs: serial_reopen_delay_secs_default(),
    }
}
fn meter_default() -> MeterConfig {
    return MeterConfig {
        model: meter_model_default(),
        name: None,
        total_length: None,
        channels: None,
        start_match: StartMatchPolicy::default(),
        max_sync_bytes: None,
    }
}
fn storage_default() -> StorageConfig {
    return StorageConfig {
        enabled: false,
        consumption_path: storage_consumption_path_default(),
        feed_in_path: storage_feed_in_path_default(),
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default="serial_default")]
    pub serial: SerialConfig,
    #[serde(default="meter_default")]
    pub meter: MeterConfig,
    pub mqtt: MqttConfig,
    #[serde(default="storage_default")]
    pub storage: StorageConfig,
}

impl Config {
    /// Loads `$S2M_CONFIG`, `config/sml2mqtt.yaml` or `sml2mqtt.yaml`, first match wins.
    pub fn load() -> Result<Self, ConfigError> {
        let mut candidates: Vec<String> = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            candidates.push(path);
        }
        candidates.extend(CONFIG_PATHS.iter().map(|p| p.to_string()));

        for path in &candidates {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    info!("Using configuration {}", path);
                    return Self::from_yaml(&contents);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(ConfigError::Io { path: path.clone(), source }),
            }
        }

        Err(ConfigError::NotFound(candidates))
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)?;
        config.max_sync_bytes()?;
        Ok(config)
    }

    pub fn base_topic(&self) -> String {
        match &self.mqtt.base_topic {
            Some(topic) => topic.trim_end_matches('/').to_string(),
            None => format!("sml2mqtt/{}", self.meter.name()),
        }
    }

    pub fn max_sync_bytes(&self) -> Result<usize, ConfigError> {
        let total_length = self.meter_profile()?.total_length;
        match self.meter.max_sync_bytes {
            None => Ok(4 * total_length),
            // less than one telegram would never get past a telegram in progress
            Some(limit) if limit < total_length => Err(ConfigError::Invalid(format!(
                "max_sync_bytes must be at least the telegram length of {} bytes", total_length))),
            Some(limit) => Ok(limit),
        }
    }

    /// Resolves the built-in table of the model, applies the overrides and checks the result.
    pub fn meter_profile(&self) -> Result<MeterProfile, ConfigError> {
        let mut profile = match get_meter_profile(&self.meter.model) {
            Some(profile) => profile,
            None => MeterProfile {
                model: MeterModel::Custom,
                total_length: self.meter.total_length
                    .ok_or(ConfigError::Invalid("custom meters need a total_length".to_string()))?,
                channels: Vec::new(),
            },
        };

        if let Some(total_length) = self.meter.total_length {
            profile.total_length = total_length;
        }
        if let Some(channels) = &self.meter.channels {
            profile.channels = channels.clone();
        }
        for channel in profile.channels.iter_mut() {
            channel.obis_pattern = channel.obis_pattern.to_lowercase();
        }

        validate_profile(&profile)?;
        Ok(profile)
    }
}

fn validate_profile(profile: &MeterProfile) -> Result<(), ConfigError> {
    let min_length = SML_START_SEQUENCE.len() + SML_CHECKSUM_LEN;
    if profile.total_length <= min_length {
        return Err(ConfigError::Invalid(format!(
            "total_length must be larger than {} bytes", min_length)));
    }

    if profile.channels.is_empty() {
        return Err(ConfigError::Invalid("no channels configured".to_string()));
    }

    let mut names = HashSet::new();
    for channel in &profile.channels {
        if !names.insert(channel.channel.as_str()) {
            return Err(ConfigError::Invalid(format!("channel {} is defined twice", channel.channel)));
        }
        if channel.obis_pattern.is_empty() || hex::decode(&channel.obis_pattern).is_err() {
            return Err(ConfigError::Invalid(format!(
                "OBIS pattern '{}' of {} is not a hex byte string", channel.obis_pattern, channel.channel)));
        }
        if channel.byte_offset > 2 * profile.total_length {
            return Err(ConfigError::Invalid(format!(
                "byte_offset of {} lies beyond the {} hex digits of a telegram", channel.channel, 2 * profile.total_length)));
        }
        if channel.digit_length == 0 || channel.digit_length > MAX_FIELD_DIGITS {
            return Err(ConfigError::Invalid(format!(
                "digit_length of {} must be between 1 and {}", channel.channel, MAX_FIELD_DIGITS)));
        }
        if channel.divisor == 0.0 || !channel.divisor.is_finite() {
            return Err(ConfigError::Invalid(format!("divisor of {} must be a non-zero number", channel.channel)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_sml::structs::ChannelRole;

    const MINIMAL: &str = "mqtt:\n  host: 10.9.11.60\n";

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.serial.device, "/dev/ttyAMA0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.read_timeout(), Duration::from_secs(2));
        assert_eq!(config.meter.model, MeterModel::IskraMt681);
        assert_eq!(config.meter.start_match, StartMatchPolicy::TreatAsAbsent);
        assert!(config.mqtt.enabled);
        assert_eq!(config.mqtt.port, 1883);
        assert!(!config.storage.enabled);
        assert_eq!(config.base_topic(), "sml2mqtt/iskra_mt681");
        assert_eq!(config.max_sync_bytes().unwrap(), 4 * 456);
    }

    #[test]
    fn test_emh_with_overrides() {
        let yaml = "\
serial:
  device: /dev/ttyUSB0
  timeout_ms: 1000
meter:
  model: emh_ehzb
  name: stromzaehler
  total_length: 762
  start_match: accept
mqtt:
  host: broker
  base_topic: home/strom/
storage:
  enabled: true
  consumption_path: /var/lib/sml/bezug.csv
";
        let config = Config::from_yaml(yaml).unwrap();
        let profile = config.meter_profile().unwrap();
        assert_eq!(profile.model, MeterModel::EmhEhzb);
        assert_eq!(profile.total_length, 762);
        assert_eq!(profile.channels[0].digit_length, 16);
        assert_eq!(config.meter.start_match, StartMatchPolicy::Accept);
        assert_eq!(config.base_topic(), "home/strom");
        assert_eq!(config.storage.feed_in_path, "einspeisung.csv");
    }

    #[test]
    fn test_custom_table() {
        let yaml = "\
meter:
  model: custom
  name: garage
  total_length: 300
  channels:
    - channel: energy
      obis_pattern: 070100010800FF
      byte_offset: 40
      digit_length: 10
      divisor: 10000
      role: consumption
    - channel: power
      obis_pattern: 070100100700ff
      byte_offset: 28
      digit_length: 8
      role: power
mqtt:
  host: broker
";
        let profile = Config::from_yaml(yaml).unwrap().meter_profile().unwrap();
        assert_eq!(profile.total_length, 300);
        assert_eq!(profile.channels.len(), 2);
        assert_eq!(profile.channels[0].obis_pattern, "070100010800ff");
        assert_eq!(profile.channels[0].role, ChannelRole::Consumption);
        assert_eq!(profile.channels[1].divisor, 1.0);
    }

    #[test]
    fn test_invalid_profiles_are_rejected() {
        let cases = [
            "meter:\n  model: custom\nmqtt:\n  host: b\n",
            "meter:\n  total_length: 10\nmqtt:\n  host: b\n",
            "meter:\n  channels: []\nmqtt:\n  host: b\n",
            "meter:\n  channels:\n    - {channel: a, obis_pattern: '0701zz', byte_offset: 1, digit_length: 8}\nmqtt:\n  host: b\n",
            "meter:\n  channels:\n    - {channel: a, obis_pattern: '07010', byte_offset: 1, digit_length: 8}\nmqtt:\n  host: b\n",
            "meter:\n  channels:\n    - {channel: a, obis_pattern: '0701', byte_offset: 1, digit_length: 17}\nmqtt:\n  host: b\n",
            "meter:\n  channels:\n    - {channel: a, obis_pattern: '0701', byte_offset: 1, digit_length: 8, divisor: 0}\nmqtt:\n  host: b\n",
            "meter:\n  channels:\n    - {channel: a, obis_pattern: '0701', byte_offset: 1, digit_length: 8}\n    - {channel: a, obis_pattern: '0702', byte_offset: 1, digit_length: 8}\nmqtt:\n  host: b\n",
            "meter:\n  channels:\n    - {channel: a, obis_pattern: '0701', byte_offset: 18446744073709551615, digit_length: 8}\nmqtt:\n  host: b\n",
            "meter:\n  channels:\n    - {channel: a, obis_pattern: '0701', byte_offset: 913, digit_length: 8}\nmqtt:\n  host: b\n",
            "meter:\n  max_sync_bytes: 0\nmqtt:\n  host: b\n",
            "meter:\n  max_sync_bytes: 4\nmqtt:\n  host: b\n",
            "meter:\n  max_sync_bytes: 455\nmqtt:\n  host: b\n",
        ];
        for yaml in cases {
            assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))), "accepted: {yaml}");
        }
    }

    #[test]
    fn test_sync_limit_bounds() {
        let config = Config::from_yaml("meter:\n  max_sync_bytes: 456\nmqtt:\n  host: b\n").unwrap();
        assert_eq!(config.max_sync_bytes().unwrap(), 456);

        let yaml = "meter:\n  channels:\n    - {channel: a, obis_pattern: '0701', byte_offset: 912, digit_length: 8}\nmqtt:\n  host: b\n";
        assert!(Config::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_missing_mqtt_section() {
        assert!(matches!(Config::from_yaml("serial:\n  baud_rate: 9600\n"), Err(ConfigError::Parse(_))));
    }
}

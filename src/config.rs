//! YAML configuration for both broker connections.
//!
//! Everything here is validated once at startup; the rest of the bridge
//! trusts the values it is handed.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use rumqttc::QoS;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ── Top level ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub device_bus: DeviceBusConfig,
    pub homeassistant: HassConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub loglevel: LogLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Directive for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Connection settings shared by both sides.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub broker_host: String,
    #[serde(default = "default_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceBusConfig {
    #[serde(flatten)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub topic_prefix: String,
}

/// Home Assistant side: broker plus discovery and publication policy.
#[derive(Debug, Clone, Deserialize)]
pub struct HassConfig {
    #[serde(flatten)]
    pub broker: BrokerConfig,
    /// Prepended verbatim to state, availability and command topics. Required,
    /// though it may be empty.
    pub topic_prefix: String,
    #[serde(default)]
    pub entity_prefix: String,
    #[serde(default = "default_discovery_topic")]
    pub discovery_topic: String,
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
    #[serde(default = "default_online")]
    pub status_payload_online: String,
    #[serde(default = "default_offline")]
    pub status_payload_offline: String,
    /// Minimum interval in milliseconds between state publishes, per component kind.
    #[serde(default = "default_debounce")]
    pub debounce: HashMap<String, u64>,
    #[serde(default = "default_subscribe_qos")]
    pub subscribe_qos: Qos,
    #[serde(default)]
    pub availability_qos: Qos,
    #[serde(default = "default_true")]
    pub availability_retain: bool,
    #[serde(default = "default_delay")]
    pub availability_publish_delay: f64,
    #[serde(default)]
    pub state_qos: Qos,
    #[serde(default = "default_true")]
    pub state_retain: bool,
    #[serde(default)]
    pub config_qos: Qos,
    #[serde(default)]
    pub config_retain: bool,
    /// Seconds to wait for the remaining meta topics before publishing discovery.
    #[serde(default = "default_delay")]
    pub config_publish_delay: f64,
    #[serde(default)]
    pub inverse: HashSet<String>,
    #[serde(default)]
    pub split_devices: HashSet<String>,
    #[serde(default)]
    pub split_entities: HashSet<String>,
}

impl HassConfig {
    pub fn config_delay(&self) -> Duration {
        Duration::from_secs_f64(self.config_publish_delay)
    }

    pub fn availability_delay(&self) -> Duration {
        Duration::from_secs_f64(self.availability_publish_delay)
    }

    /// Debounce interval configured for a component kind, if any.
    pub fn debounce_for(&self, component: &str) -> Option<Duration> {
        self.debounce
            .get(component)
            .map(|ms| Duration::from_millis(*ms))
    }
}

/// MQTT QoS as it appears in YAML (`0`, `1` or `2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub struct Qos(pub QoS);

impl Default for Qos {
    fn default() -> Self {
        Qos(QoS::AtMostOnce)
    }
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos(QoS::AtMostOnce)),
            1 => Ok(Qos(QoS::AtLeastOnce)),
            2 => Ok(Qos(QoS::ExactlyOnce)),
            other => Err(format!("qos must be 0, 1 or 2, got {}", other)),
        }
    }
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "busbridge".to_string()
}

fn default_discovery_topic() -> String {
    "homeassistant".to_string()
}

fn default_status_topic() -> String {
    "hass/status".to_string()
}

fn default_online() -> String {
    "online".to_string()
}

fn default_offline() -> String {
    "offline".to_string()
}

fn default_debounce() -> HashMap<String, u64> {
    HashMap::from([("sensor".to_string(), 1000)])
}

fn default_subscribe_qos() -> Qos {
    Qos(QoS::AtLeastOnce)
}

fn default_true() -> bool {
    true
}

fn default_delay() -> f64 {
    1.0
}

// ── Loading ──────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        for (side, host) in [
            ("device_bus", &self.device_bus.broker.broker_host),
            ("homeassistant", &self.homeassistant.broker.broker_host),
        ] {
            if host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{}.broker_host is empty", side)));
            }
        }

        let hass = &self.homeassistant;
        if hass.status_payload_online == hass.status_payload_offline {
            return Err(ConfigError::Invalid(
                "status_payload_online and status_payload_offline must differ".to_string(),
            ));
        }
        for (name, delay) in [
            ("config_publish_delay", hass.config_publish_delay),
            ("availability_publish_delay", hass.availability_publish_delay),
        ] {
            if Duration::try_from_secs_f64(delay).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a non-negative number of seconds",
                    name
                )));
            }
        }
        if hass.discovery_topic.is_empty() {
            return Err(ConfigError::Invalid("discovery_topic is empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
device_bus:
  broker_host: wb.local
homeassistant:
  broker_host: hass.local
  topic_prefix: "wb/"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.general.loglevel, LogLevel::Info);
        assert_eq!(config.device_bus.broker.broker_port, 1883);
        assert_eq!(config.device_bus.topic_prefix, "");
        assert_eq!(config.device_bus.broker.client_id, "busbridge");

        let hass = &config.homeassistant;
        assert_eq!(hass.topic_prefix, "wb/");
        assert_eq!(hass.discovery_topic, "homeassistant");
        assert_eq!(hass.status_topic, "hass/status");
        assert_eq!(hass.subscribe_qos, Qos(QoS::AtLeastOnce));
        assert_eq!(hass.config_qos, Qos(QoS::AtMostOnce));
        assert!(hass.availability_retain);
        assert!(!hass.config_retain);
        assert_eq!(hass.config_delay(), Duration::from_secs(1));
        assert_eq!(hass.debounce_for("sensor"), Some(Duration::from_millis(1000)));
        assert_eq!(hass.debounce_for("switch"), None);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
general:
  loglevel: WARNING
device_bus:
  broker_host: wb.local
  broker_port: 1884
  username: user
  password: secret
  topic_prefix: site1
homeassistant:
  broker_host: hass.local
  topic_prefix: ""
  entity_prefix: Home Lab
  discovery_topic: ha
  debounce:
    sensor: 250
    binary_sensor: 100
  state_qos: 1
  config_retain: true
  config_publish_delay: 0.5
  inverse: [home_lab_relay1_k2]
  split_devices: [home_lab_wirenboard]
  split_entities: []
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.general.loglevel.as_filter(), "warn");
        assert_eq!(config.device_bus.broker.username.as_deref(), Some("user"));
        assert_eq!(config.device_bus.topic_prefix, "site1");

        let hass = &config.homeassistant;
        assert_eq!(hass.entity_prefix, "Home Lab");
        assert_eq!(hass.state_qos, Qos(QoS::AtLeastOnce));
        assert!(hass.config_retain);
        assert_eq!(hass.config_delay(), Duration::from_millis(500));
        assert_eq!(hass.debounce_for("binary_sensor"), Some(Duration::from_millis(100)));
        assert!(hass.inverse.contains("home_lab_relay1_k2"));
        assert!(hass.split_devices.contains("home_lab_wirenboard"));
    }

    #[test]
    fn test_rejects_bad_qos() {
        let yaml = format!("{}  config_qos: 3\n", MINIMAL);
        assert!(matches!(parse_config(&yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_rejects_identical_status_payloads() {
        let yaml = format!(
            "{}  status_payload_online: up\n  status_payload_offline: up\n",
            MINIMAL
        );
        assert!(matches!(parse_config(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_negative_delay() {
        let yaml = format!("{}  availability_publish_delay: -1\n", MINIMAL);
        assert!(matches!(parse_config(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_unrepresentable_delay() {
        for delay in ["1e20", ".nan", ".inf"] {
            let yaml = format!("{}  config_publish_delay: {}\n", MINIMAL, delay);
            assert!(
                matches!(parse_config(&yaml), Err(ConfigError::Invalid(_))),
                "config_publish_delay {} accepted",
                delay
            );
        }
        let yaml = format!("{}  config_publish_delay: 0\n", MINIMAL);
        assert_eq!(parse_config(&yaml).unwrap().homeassistant.config_delay(), Duration::ZERO);
    }

    #[test]
    fn test_hass_topic_prefix_is_required() {
        let yaml = "device_bus:\n  broker_host: wb.local\nhomeassistant:\n  broker_host: hass.local\n";
        assert!(matches!(parse_config(yaml), Err(ConfigError::Parse(_))));

        // The bus prefix stays optional.
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.device_bus.topic_prefix, "");
    }

    #[test]
    fn test_missing_section_is_parse_error() {
        let yaml = "device_bus:\n  broker_host: wb.local\n";
        assert!(matches!(parse_config(yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.homeassistant.broker.broker_host, "hass.local");

        let missing = load_config(Path::new("/nonexistent/busbridge.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}

//! Application configuration loading and validation.
//!
//! The adapter reads a single TOML file with two sections:
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [protocol]
//! ControllerName = "rsp-controller"
//! MqttHost = "mosquitto-server"
//! # ...
//! ```
//!
//! `[protocol]` is the flat property map the host platform hands to protocol
//! drivers. It stays a string map here and is turned into a typed
//! `DriverConfig` by `properties::DriverConfig::from_properties`.
//!
//! The configuration is loaded once at startup and is immutable afterwards.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{logger::LoggerConfig, properties::DriverConfig};

pub mod logger;
pub mod properties;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "RSP_MQTT_CONFIG";

/// Used when `RSP_MQTT_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rsp-mqtt-adapter/config.toml";

/// Current UTC time for the pre-logger `print_*` macros.
pub fn early_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Prints a timestamped line before the tracing subscriber is installed.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors raised while locating, reading or interpreting configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A required protocol property is absent.
    #[error("config is missing property '{0}'")]
    MissingKey(String),

    /// A protocol property could not be converted to its type.
    #[error("invalid value '{value}' for property '{key}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Top-level adapter configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Protocol properties keyed by their platform names.
    pub protocol: BTreeMap<String, String>,
}

impl AppConfig {
    /// Locates and loads the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// `RSP_MQTT_CONFIG` if set, otherwise the default path if it exists.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found; set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}"
        )))
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::parse(&config_str)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }

    /// Typed driver settings from the `[protocol]` section.
    pub fn driver_config(&self) -> Result<DriverConfig, ConfigError> {
        DriverConfig::from_properties(&self.protocol)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const SAMPLE: &str = r#"
[logger]
level = "debug"

[logger.console]
format = "pretty"

[protocol]
ControllerName = "rsp-controller"
MaxWaitTimeForReq = "10"
MaxReconnectWaitSeconds = "600"
TlsInsecureSkipVerify = "false"
IncomingTopics = "rfid/controller/alerts,rfid/controller/events"
CommandTopic = "rfid/controller/command"
ResponseTopic = "rfid/controller/response"
RspControllerNotifications = "inventory_data,heartbeat"
MqttScheme = "tcp"
MqttHost = "mosquitto-server"
MqttPort = "1883"
MqttUser = ""
MqttPassword = ""
MqttKeepAlive = "60"
MqttClientId = "MqttDeviceService"
CommandQos = "1"
ResponseQos = "1"
IncomingQos = "1"
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.protocol["MqttHost"], "mosquitto-server");

        let driver = config.driver_config().unwrap();
        assert_eq!(driver.controller_name, "rsp-controller");
        assert_eq!(driver.mqtt.incoming_topics.len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let result = AppConfig::load(Path::new("/nonexistent/rsp-mqtt-adapter.toml"));
        assert!(matches!(result, Err(ConfigError::Config(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = AppConfig::parse("[logger\nlevel = ");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_invalid_logger_section() {
        let result = AppConfig::parse("[logger]\nlevel = \"loud\"\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.logger.level, "info");
        assert!(config.protocol.is_empty());
        assert!(matches!(
            config.driver_config(),
            Err(ConfigError::MissingKey(_))
        ));
    }
}

//! Typed configuration for the managed MQTT session.
//!
//! `MqttConfig` is an immutable snapshot built once at startup (the adapter
//! fills it from the host platform's protocol properties, tests build it
//! directly). Every constraint is declared with `validator` attributes so an
//! invalid snapshot is rejected before any connection is attempted.
//!
//! # Examples
//!
//! ```ignore
//! let config = MqttConfig {
//!     host: "mosquitto-server".into(),
//!     command_topic: "rfid/controller/command".into(),
//!     response_topic: "rfid/controller/response".into(),
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use std::{path::Path, time::Duration};

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::error::TransferError;

/// Connection, topic and timing settings of the session.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MqttConfig {
    /// URI scheme of the broker: `tcp`/`mqtt` for plain TCP, `ssl`/`tls`/`mqtts`
    /// for TLS.
    #[validate(custom(function = "validate_scheme"))]
    pub scheme: String,

    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Broker user; credentials are only sent when this is non-empty.
    pub user: String,

    pub password: String,

    /// Client identifier, already expanded from its template.
    #[validate(length(
        min = 1,
        max = 256,
        message = "Client ID must be between 1 and 256 characters"
    ))]
    pub client_id: String,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    pub clean_session: bool,

    #[validate(range(min = 1, max = 1000, message = "Max inflight must be between 1 and 1000"))]
    pub max_inflight: u16,

    /// Capacity of the client's request channel towards the event loop.
    #[validate(range(
        min = 1,
        max = 4096,
        message = "Request channel capacity must be between 1 and 4096"
    ))]
    pub request_channel_capacity: usize,

    #[validate(nested)]
    pub tls: TlsConfig,

    /// Failed initial connect attempts tolerated before giving up.
    #[validate(range(min = 1, message = "Connect retries must be at least 1"))]
    pub connect_retries: u32,

    /// Fixed delay between initial connect attempts, in seconds.
    pub connect_retry_delay: u64,

    /// Delay between subscribe attempts for a topic that failed, in seconds.
    pub subscribe_retry_delay: u64,

    /// Longest tolerated reconnect, in seconds, before the session fails.
    #[validate(range(
        min = 1,
        max = 86400,
        message = "Max reconnect wait must be between 1 second and 1 day"
    ))]
    pub max_reconnect_wait: u64,

    /// Per-command response deadline, in seconds.
    #[validate(range(min = 1, message = "Max wait time for requests must be at least 1 second"))]
    pub request_timeout: u64,

    #[validate(length(min = 1, message = "Command topic must not be empty"))]
    pub command_topic: String,

    #[validate(length(min = 1, message = "Response topic must not be empty"))]
    pub response_topic: String,

    /// Data topic filters; wildcards allowed.
    #[validate(custom(function = "validate_topic_filters"))]
    pub incoming_topics: Vec<String>,

    #[validate(range(max = 2, message = "QoS must be 0, 1 or 2"))]
    pub command_qos: u8,

    #[validate(range(max = 2, message = "QoS must be 0, 1 or 2"))]
    pub response_qos: u8,

    #[validate(range(max = 2, message = "QoS must be 0, 1 or 2"))]
    pub incoming_qos: u8,

    /// Notification types announced to the controller after every connect.
    pub controller_notifications: Vec<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            scheme: "tcp".into(),
            host: "localhost".into(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            client_id: "MqttDeviceService".into(),
            keep_alive: 120,
            clean_session: true,
            max_inflight: 100,
            request_channel_capacity: 64,
            tls: TlsConfig::default(),
            connect_retries: 10,
            connect_retry_delay: 5,
            subscribe_retry_delay: 5,
            max_reconnect_wait: 600,
            request_timeout: 10,
            command_topic: "rfid/controller/command".into(),
            response_topic: "rfid/controller/response".into(),
            incoming_topics: Vec::new(),
            command_qos: 1,
            response_qos: 1,
            incoming_qos: 1,
            controller_notifications: Vec::new(),
        }
    }
}

impl MqttConfig {
    /// True when the scheme asks for an encrypted connection.
    pub fn uses_tls(&self) -> bool {
        matches!(
            self.scheme.to_ascii_lowercase().as_str(),
            "ssl" | "tls" | "mqtts"
        )
    }

    pub fn broker_uri(&self) -> String {
        format!("{}://{}:{}", self.scheme.to_ascii_lowercase(), self.host, self.port)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay)
    }

    pub fn subscribe_retry_delay(&self) -> Duration {
        Duration::from_secs(self.subscribe_retry_delay)
    }

    pub fn max_reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_wait)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// TLS policy. Only consulted when the scheme asks for TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// Accept any server certificate.
    pub insecure_skip_verify: bool,

    /// PEM CA bundle. When absent, the system root certificates are used.
    #[validate(custom(
        function = "validate_file_path",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,
}

/// Maps a numeric QoS from configuration to the rumqttc level.
pub fn qos_from_u8(value: u8) -> Result<QoS, TransferError> {
    match value {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransferError::ClientSetup(format!(
            "invalid QoS value {other}, must be 0, 1 or 2"
        ))),
    }
}

fn validate_scheme(scheme: &str) -> Result<(), ValidationError> {
    match scheme.to_ascii_lowercase().as_str() {
        "tcp" | "mqtt" | "ssl" | "tls" | "mqtts" => Ok(()),
        _ => Err(ValidationError::new("invalid_scheme")
            .with_message(format!("Unsupported MQTT scheme: {scheme}").into())),
    }
}

fn validate_topic_filters(filters: &[String]) -> Result<(), ValidationError> {
    for filter in filters {
        if !crate::topic::is_valid_filter(filter) {
            return Err(ValidationError::new("invalid_topic_filter")
                .with_message(format!("Invalid topic filter: '{filter}'").into()));
        }
    }
    Ok(())
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);
    if !path_obj.is_file() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    Ok(())
}

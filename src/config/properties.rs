//! Typed driver settings from the platform's protocol property map.
//!
//! Every property arrives as a string. Each key is read with an explicit
//! parser for its type; a required key that is absent is reported by name.
//! List values are comma separated, with surrounding whitespace and empty
//! entries dropped.

use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use rsp_mqtt::{MqttConfig, TlsConfig};
use uuid::Uuid;
use validator::Validate;

use super::ConfigError;

pub const CONTROLLER_NAME: &str = "ControllerName";
pub const MAX_WAIT_TIME_FOR_REQ: &str = "MaxWaitTimeForReq";
pub const MAX_RECONNECT_WAIT_SECONDS: &str = "MaxReconnectWaitSeconds";
pub const TLS_INSECURE_SKIP_VERIFY: &str = "TlsInsecureSkipVerify";
pub const INCOMING_TOPICS: &str = "IncomingTopics";
pub const COMMAND_TOPIC: &str = "CommandTopic";
pub const RESPONSE_TOPIC: &str = "ResponseTopic";
pub const RSP_CONTROLLER_NOTIFICATIONS: &str = "RspControllerNotifications";
pub const MQTT_SCHEME: &str = "MqttScheme";
pub const MQTT_HOST: &str = "MqttHost";
pub const MQTT_PORT: &str = "MqttPort";
pub const MQTT_USER: &str = "MqttUser";
pub const MQTT_PASSWORD: &str = "MqttPassword";
pub const MQTT_KEEP_ALIVE: &str = "MqttKeepAlive";
pub const MQTT_CLIENT_ID: &str = "MqttClientId";
pub const MQTT_CONNECT_RETRIES: &str = "MqttConnectRetries";
pub const MQTT_CA_CERT_FILE: &str = "MqttCaCertFile";
pub const COMMAND_QOS: &str = "CommandQos";
pub const RESPONSE_QOS: &str = "ResponseQos";
pub const INCOMING_QOS: &str = "IncomingQos";
pub const TAG_FORMATS: &str = "TagFormats";
pub const TAG_BIT_BOUNDARY: &str = "TagBitBoundary";
pub const TAG_PRODUCT_FIELD: &str = "TagProductField";
pub const TAG_URI_AUTHORITY_NAME: &str = "TagURIAuthorityName";
pub const TAG_URI_AUTHORITY_DATE: &str = "TagURIAuthorityDate";
pub const SGTIN_STRICT_DECODING: &str = "SGTINStrictDecoding";

const DEFAULT_CONNECT_RETRIES: u32 = 10;

/// Tag data formats the decoder ring can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFormat {
    Sgtin,
    BitTag,
}

impl FromStr for TagFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sgtin" => Ok(TagFormat::Sgtin),
            "bittag" => Ok(TagFormat::BitTag),
            other => Err(format!("unknown tag format '{other}', expected sgtin or bittag")),
        }
    }
}

impl fmt::Display for TagFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagFormat::Sgtin => f.write_str("sgtin"),
            TagFormat::BitTag => f.write_str("bittag"),
        }
    }
}

/// Settings of the tag decoder ring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagConfig {
    /// Decoders, in the order they are tried.
    pub formats: Vec<TagFormat>,
    /// Field widths in bits of the bit-packed tag format.
    pub bit_boundary: Vec<u32>,
    /// Index of the product field in `bit_boundary`.
    pub product_field: Option<usize>,
    pub authority_name: String,
    pub authority_date: String,
    pub sgtin_strict: bool,
}

/// Everything the driver needs, typed and validated.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Device name under which incoming data is reported.
    pub controller_name: String,
    pub mqtt: MqttConfig,
    pub tags: TagConfig,
}

impl DriverConfig {
    /// Builds the typed configuration from protocol properties.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let p = Properties(props);

        let tls = TlsConfig {
            insecure_skip_verify: p.required(TLS_INSECURE_SKIP_VERIFY, parse_bool)?,
            ca_cert_path: p.optional(MQTT_CA_CERT_FILE, parse_string)?,
        };

        let mqtt = MqttConfig {
            scheme: p.required(MQTT_SCHEME, parse_string)?,
            host: p.required(MQTT_HOST, parse_string)?,
            port: p.required(MQTT_PORT, parse_int)?,
            user: p.required(MQTT_USER, parse_string)?,
            password: p.required(MQTT_PASSWORD, parse_string)?,
            client_id: expand_client_id(&p.required(MQTT_CLIENT_ID, parse_string)?)?,
            keep_alive: p.required(MQTT_KEEP_ALIVE, parse_int)?,
            tls,
            connect_retries: p
                .optional(MQTT_CONNECT_RETRIES, parse_int)?
                .unwrap_or(DEFAULT_CONNECT_RETRIES),
            max_reconnect_wait: p.required(MAX_RECONNECT_WAIT_SECONDS, parse_int)?,
            request_timeout: p.required(MAX_WAIT_TIME_FOR_REQ, parse_int)?,
            command_topic: p.required(COMMAND_TOPIC, parse_string)?,
            response_topic: p.required(RESPONSE_TOPIC, parse_string)?,
            incoming_topics: p.required(INCOMING_TOPICS, parse_string_list)?,
            command_qos: p.required(COMMAND_QOS, parse_int)?,
            response_qos: p.required(RESPONSE_QOS, parse_int)?,
            incoming_qos: p.required(INCOMING_QOS, parse_int)?,
            controller_notifications: p.required(RSP_CONTROLLER_NOTIFICATIONS, parse_string_list)?,
            ..Default::default()
        };
        mqtt.validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        let tags = TagConfig {
            formats: p.optional(TAG_FORMATS, parse_list)?.unwrap_or_default(),
            bit_boundary: p.optional(TAG_BIT_BOUNDARY, parse_list)?.unwrap_or_default(),
            product_field: p.optional(TAG_PRODUCT_FIELD, parse_int)?,
            authority_name: p.optional(TAG_URI_AUTHORITY_NAME, parse_string)?.unwrap_or_default(),
            authority_date: p.optional(TAG_URI_AUTHORITY_DATE, parse_string)?.unwrap_or_default(),
            sgtin_strict: p.optional(SGTIN_STRICT_DECODING, parse_bool)?.unwrap_or(false),
        };
        validate_tags(&tags)?;

        Ok(Self {
            controller_name: p.required(CONTROLLER_NAME, parse_string)?,
            mqtt,
            tags,
        })
    }
}

fn validate_tags(tags: &TagConfig) -> Result<(), ConfigError> {
    if !tags.formats.contains(&TagFormat::BitTag) {
        return Ok(());
    }

    for (key, value) in [
        (TAG_URI_AUTHORITY_NAME, &tags.authority_name),
        (TAG_URI_AUTHORITY_DATE, &tags.authority_date),
    ] {
        if value.is_empty() {
            return Err(ConfigError::MissingKey(key.to_string()));
        }
    }
    if tags.bit_boundary.is_empty() {
        return Err(ConfigError::MissingKey(TAG_BIT_BOUNDARY.to_string()));
    }
    if let Some(index) = tags.product_field {
        if index >= tags.bit_boundary.len() {
            return Err(ConfigError::InvalidValue {
                key: TAG_PRODUCT_FIELD.to_string(),
                value: index.to_string(),
                reason: format!("only {} bit fields are defined", tags.bit_boundary.len()),
            });
        }
    }
    Ok(())
}

type Parser<T> = fn(&str) -> Result<T, String>;

struct Properties<'a>(&'a BTreeMap<String, String>);

impl Properties<'_> {
    fn required<T>(&self, key: &str, parse: Parser<T>) -> Result<T, ConfigError> {
        self.optional(key, parse)?
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    fn optional<T>(&self, key: &str, parse: Parser<T>) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.0.get(key) else {
            return Ok(None);
        };
        parse(value)
            .map(Some)
            .map_err(|reason| ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.clone(),
                reason,
            })
    }
}

fn parse_string(value: &str) -> Result<String, String> {
    Ok(value.to_string())
}

fn parse_int<T>(value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| e.to_string())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(format!("'{other}' is not a boolean")),
    }
}

fn parse_string_list(value: &str) -> Result<Vec<String>, String> {
    parse_list(value)
}

fn parse_list<T>(value: &str) -> Result<Vec<T>, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse().map_err(|e: T::Err| format!("'{item}': {e}")))
        .collect()
}

/// Expands the `{{token}}` and `{{token:N}}` placeholders of a client id.
///
/// Tokens: `uuid`, `random` (hex), `epoch` (seconds), `millis`, `nanos`.
/// `N` keeps the first `N` characters of `uuid` and `random` and the last
/// `N` digits of the time tokens.
pub fn expand_client_id(template: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: MQTT_CLIENT_ID.to_string(),
        value: template.to_string(),
        reason,
    };

    let mut expanded = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| invalid("unterminated '{{' placeholder".into()))?;

        let token = after[..end].trim();
        let (name, limit) = match token.split_once(':') {
            Some((name, limit)) => {
                let limit: usize = limit
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("invalid length in '{{{{{token}}}}}'")))?;
                (name.trim(), Some(limit))
            }
            None => (token, None),
        };

        let value = token_value(name).ok_or_else(|| invalid(format!("unknown token '{name}'")))?;
        expanded.push_str(&truncate(name, value, limit));
        rest = &after[end + 2..];
    }
    expanded.push_str(rest);
    Ok(expanded)
}

fn token_value(name: &str) -> Option<String> {
    let since_epoch = || SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    match name {
        "uuid" => Some(Uuid::new_v4().to_string()),
        "random" => Some(hex::encode(Uuid::new_v4().as_bytes())),
        "epoch" => Some(since_epoch().as_secs().to_string()),
        "millis" => Some(since_epoch().as_millis().to_string()),
        "nanos" => Some(since_epoch().as_nanos().to_string()),
        _ => None,
    }
}

fn truncate(name: &str, value: String, limit: Option<usize>) -> String {
    match limit {
        Some(limit) if limit < value.len() => match name {
            "uuid" | "random" => value[..limit].to_string(),
            _ => value[value.len() - limit..].to_string(),
        },
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> BTreeMap<String, String> {
        [
            (CONTROLLER_NAME, "rsp-controller"),
            (MAX_WAIT_TIME_FOR_REQ, "10"),
            (MAX_RECONNECT_WAIT_SECONDS, "600"),
            (TLS_INSECURE_SKIP_VERIFY, "false"),
            (INCOMING_TOPICS, "rfid/controller/alerts, rfid/controller/events"),
            (COMMAND_TOPIC, "rfid/controller/command"),
            (RESPONSE_TOPIC, "rfid/controller/response"),
            (RSP_CONTROLLER_NOTIFICATIONS, "inventory_data,heartbeat"),
            (MQTT_SCHEME, "tcp"),
            (MQTT_HOST, "mosquitto-server"),
            (MQTT_PORT, "1883"),
            (MQTT_USER, ""),
            (MQTT_PASSWORD, ""),
            (MQTT_KEEP_ALIVE, "60"),
            (MQTT_CLIENT_ID, "MqttDeviceService"),
            (COMMAND_QOS, "1"),
            (RESPONSE_QOS, "1"),
            (INCOMING_QOS, "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_complete_properties() {
        let config = DriverConfig::from_properties(&props()).unwrap();

        assert_eq!(config.controller_name, "rsp-controller");
        assert_eq!(config.mqtt.host, "mosquitto-server");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keep_alive, 60);
        assert_eq!(config.mqtt.request_timeout, 10);
        assert_eq!(config.mqtt.max_reconnect_wait, 600);
        assert_eq!(config.mqtt.connect_retries, DEFAULT_CONNECT_RETRIES);
        assert_eq!(
            config.mqtt.incoming_topics,
            vec!["rfid/controller/alerts", "rfid/controller/events"]
        );
        assert_eq!(
            config.mqtt.controller_notifications,
            vec!["inventory_data", "heartbeat"]
        );
        assert_eq!(config.mqtt.incoming_qos, 0);
        assert!(!config.mqtt.tls.insecure_skip_verify);
        assert_eq!(config.tags, TagConfig::default());
    }

    #[test]
    fn test_missing_required_key_is_named() {
        let mut props = props();
        props.remove(MQTT_HOST);

        let err = DriverConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(ref key) if key == MQTT_HOST));
        assert_eq!(err.to_string(), "config is missing property 'MqttHost'");
    }

    #[test]
    fn test_invalid_int() {
        let mut props = props();
        props.insert(MQTT_PORT.into(), "eighteen".into());

        let err = DriverConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == MQTT_PORT));
    }

    #[test]
    fn test_out_of_range_values_fail_validation() {
        for (key, value) in [(COMMAND_QOS, "3"), (MAX_RECONNECT_WAIT_SECONDS, "0")] {
            let mut invalid = props();
            invalid.insert(key.into(), value.into());
            assert!(
                matches!(
                    DriverConfig::from_properties(&invalid),
                    Err(ConfigError::ValidationError(_))
                ),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_tag_settings() {
        let mut props = props();
        props.insert(TAG_FORMATS.into(), "sgtin,bittag".into());
        props.insert(TAG_BIT_BOUNDARY.into(), "8,48,40".into());
        props.insert(TAG_PRODUCT_FIELD.into(), "1".into());
        props.insert(TAG_URI_AUTHORITY_NAME.into(), "test.com".into());
        props.insert(TAG_URI_AUTHORITY_DATE.into(), "2019-01-01".into());
        props.insert(SGTIN_STRICT_DECODING.into(), "true".into());

        let tags = DriverConfig::from_properties(&props).unwrap().tags;
        assert_eq!(tags.formats, vec![TagFormat::Sgtin, TagFormat::BitTag]);
        assert_eq!(tags.bit_boundary, vec![8, 48, 40]);
        assert_eq!(tags.product_field, Some(1));
        assert!(tags.sgtin_strict);
    }

    #[test]
    fn test_bittag_requires_authority() {
        let mut props = props();
        props.insert(TAG_FORMATS.into(), "bittag".into());
        props.insert(TAG_BIT_BOUNDARY.into(), "8,48,40".into());

        let err = DriverConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(ref key) if key == TAG_URI_AUTHORITY_NAME));
    }

    #[test]
    fn test_unknown_tag_format() {
        let mut props = props();
        props.insert(TAG_FORMATS.into(), "sgtin,qr".into());

        let err = DriverConfig::from_properties(&props).unwrap_err();
        assert!(err.to_string().contains("unknown tag format 'qr'"));
    }

    #[test]
    fn test_bool_parser() {
        assert_eq!(parse_bool("TRUE"), Ok(true));
        assert_eq!(parse_bool(" 0 "), Ok(false));
        assert!(parse_bool("yes").is_err());
    }

    #[test]
    fn test_client_id_without_tokens() {
        assert_eq!(expand_client_id("MqttDeviceService").unwrap(), "MqttDeviceService");
    }

    #[test]
    fn test_client_id_tokens() {
        let id = expand_client_id("adapter-{{uuid}}").unwrap();
        assert_eq!(id.len(), "adapter-".len() + 36);

        let id = expand_client_id("adapter-{{random:8}}").unwrap();
        let suffix = id.strip_prefix("adapter-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));

        let id = expand_client_id("{{epoch}}-{{millis:4}}").unwrap();
        let (epoch, millis) = id.split_once('-').unwrap();
        assert!(epoch.parse::<u64>().unwrap() > 1_500_000_000);
        assert_eq!(millis.len(), 4);

        assert!(expand_client_id("{{nanos}}").unwrap().parse::<u128>().is_ok());
    }

    #[test]
    fn test_client_id_errors() {
        assert!(expand_client_id("adapter-{{hostname}}").is_err());
        assert!(expand_client_id("adapter-{{uuid").is_err());
        assert!(expand_client_id("adapter-{{uuid:x}}").is_err());
    }
}

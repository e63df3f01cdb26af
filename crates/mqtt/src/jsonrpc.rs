//! JSON-RPC 2.0 envelopes exchanged with the RSP controller.
//!
//! Requests go out on the command topic, responses come back on the response
//! topic, and notifications arrive on the data topics. Response payloads are
//! kept as raw JSON; interpreting `result`/`error` is up to the caller.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{value::RawValue, Map, Value};
use thiserror::Error;

/// Protocol version carried in every envelope.
pub const VERSION: &str = "2.0";

/// Method used to tell the controller which notifications to publish.
pub const SUBSCRIBE_METHOD: &str = "subscribe";

/// Outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// New request with a fresh v4 UUID as correlation id.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params<P: Serialize>(mut self, params: &P) -> Result<Self, serde_json::Error> {
        self.params = Some(serde_json::to_value(params)?);
        Ok(self)
    }

    /// Request asking the controller to publish the given notification types.
    pub fn controller_subscribe(notifications: &[String]) -> Result<Self, serde_json::Error> {
        Self::new(SUBSCRIBE_METHOD).with_params(&notifications)
    }
}

/// Parameters addressing a single sensor behind a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdParams {
    pub device_id: String,
}

/// Inbound response. Missing members decode as empty.
#[derive(Debug, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub result: Option<Box<RawValue>>,
    #[serde(default)]
    pub error: Option<Box<RawValue>>,
}

impl Response {
    /// The reading carried by the response: `result` first, then `error`.
    ///
    /// JSON strings are unwrapped; any other value is returned as raw JSON.
    pub fn reading(&self) -> Option<String> {
        self.result
            .as_deref()
            .or(self.error.as_deref())
            .map(raw_to_reading)
    }
}

fn raw_to_reading(raw: &RawValue) -> String {
    match serde_json::from_str::<String>(raw.get()) {
        Ok(text) => text,
        Err(_) => raw.get().to_string(),
    }
}

/// Errors from reading or writing notification parameters.
#[derive(Debug, Error)]
pub enum ParamError {
    #[error("notification has no parameters")]
    NoParams,

    #[error("no such parameter {0:?}")]
    Missing(String),

    #[error("failed to unmarshal {key:?}: {source}")]
    Invalid {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to marshal parameter value: {0}")]
    Marshal(#[source] serde_json::Error),
}

/// Inbound notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
}

impl Notification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params: None,
        }
    }

    /// Decodes parameter `key` into `T`.
    pub fn get_param<T: DeserializeOwned>(&self, key: &str) -> Result<T, ParamError> {
        let params = match &self.params {
            Some(params) if !params.is_empty() => params,
            _ => return Err(ParamError::NoParams),
        };
        let value = params
            .get(key)
            .ok_or_else(|| ParamError::Missing(key.to_string()))?;
        T::deserialize(value).map_err(|source| ParamError::Invalid {
            key: key.to_string(),
            source,
        })
    }

    /// Inserts or replaces parameter `key`, creating the map if needed.
    pub fn set_param<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), ParamError> {
        let value = serde_json::to_value(value).map_err(ParamError::Marshal)?;
        self.params
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        Ok(())
    }
}

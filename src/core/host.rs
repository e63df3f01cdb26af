//! Interfaces to the hosting device-management platform.
//!
//! The adapter pushes readings into an `AsyncReadingSink` and registers
//! newly seen sensors through a `DeviceRegistry`. Both are traits so the
//! platform binding stays outside this crate; channel and in-memory
//! implementations are provided for the binary and for tests.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use rsp_mqtt::Reading;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

pub const SENSOR_DESCRIPTION: &str = "Gateway Device MQTT Broker Connection";
pub const SENSOR_PROFILE: &str = "Gateway.Device.MQTT.Profile";
pub const SENSOR_SERVICE: &str = "mqtt-device-service";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("reading sink is closed")]
    SinkClosed,

    #[error("unable to register device '{name}': {reason}")]
    Registration { name: String, reason: String },
}

/// Readings of one device, delivered together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncValues {
    pub device_name: String,
    pub readings: Vec<Reading>,
}

/// Destination of asynchronously produced readings.
#[async_trait]
pub trait AsyncReadingSink: Send + Sync + 'static {
    async fn push(&self, values: AsyncValues) -> Result<(), HostError>;

    /// Stops accepting readings. Later pushes fail with `SinkClosed`.
    async fn close(&self);
}

/// Sink backed by a bounded mpsc channel.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<AsyncValues>>>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AsyncValues>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<AsyncValues>>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AsyncReadingSink for ChannelSink {
    async fn push(&self, values: AsyncValues) -> Result<(), HostError> {
        let tx = self.sender().clone().ok_or(HostError::SinkClosed)?;
        tx.send(values).await.map_err(|_| HostError::SinkClosed)
    }

    async fn close(&self) {
        if self.sender().take().is_some() {
            debug!("Reading sink closed");
        }
    }
}

/// A sensor device as registered with the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorDevice {
    pub name: String,
    pub description: String,
    pub profile: String,
    pub service: String,
    pub admin_state: String,
    pub operating_state: String,
}

impl SensorDevice {
    /// A sensor reached through the RSP controller's MQTT connection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: SENSOR_DESCRIPTION.to_string(),
            profile: SENSOR_PROFILE.to_string(),
            service: SENSOR_SERVICE.to_string(),
            admin_state: "unlocked".to_string(),
            operating_state: "enabled".to_string(),
        }
    }
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync + 'static {
    async fn contains(&self, name: &str) -> bool;

    async fn register(&self, device: SensorDevice) -> Result<(), HostError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    devices: RwLock<BTreeMap<String, SensorDevice>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn devices(&self) -> Vec<SensorDevice> {
        self.devices.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn contains(&self, name: &str) -> bool {
        self.devices.read().await.contains_key(name)
    }

    async fn register(&self, device: SensorDevice) -> Result<(), HostError> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.name) {
            return Err(HostError::Registration {
                name: device.name,
                reason: "already registered".into(),
            });
        }
        debug!(device = %device.name, "Device registered");
        devices.insert(device.name.clone(), device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_until_closed() {
        let (sink, mut rx) = ChannelSink::new(4);
        let values = AsyncValues {
            device_name: "rsp-controller".into(),
            readings: vec![Reading::new("heartbeat", "{}")],
        };

        sink.push(values.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(values.clone()));

        sink.close().await;
        assert_eq!(sink.push(values).await, Err(HostError::SinkClosed));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = InMemoryRegistry::new();
        assert!(!registry.contains("RSP-150000").await);

        registry.register(SensorDevice::new("RSP-150000")).await.unwrap();
        assert!(registry.contains("RSP-150000").await);
        assert!(registry
            .register(SensorDevice::new("RSP-150000"))
            .await
            .is_err());

        let devices = registry.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].profile, SENSOR_PROFILE);
    }

    #[test]
    fn test_sensor_device_serialization() {
        let json = serde_json::to_value(SensorDevice::new("RSP-150000")).unwrap();
        assert_eq!(json["description"], SENSOR_DESCRIPTION);
        assert_eq!(json["adminState"], "unlocked");
        assert_eq!(json["operatingState"], "enabled");
    }
}

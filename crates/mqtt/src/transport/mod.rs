//! The capability interface the session needs from an MQTT client.
//!
//! Production code uses `BrokerTransport`, a thin wrapper over
//! `rumqttc::AsyncClient` that remembers which filter each SUBSCRIBE carried.
//! Tests use `MemoryTransport` (behind the `test-util` feature), which
//! records every call and can be told to fail, so that the connection state
//! machine, subscription retries and request correlation run without a
//! broker.

mod broker;
#[cfg(any(test, feature = "test-util"))]
mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;

use super::error::TransferError;

pub use broker::{BrokerTransport, SubscribeTracker};
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryTransport, Published};

/// Publish/subscribe operations used by the session.
///
/// Implementations must be safe for concurrent use; the session does not add
/// its own serialization around these calls.
#[async_trait]
pub trait MqttTransport: Send + Sync + 'static {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), TransferError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransferError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransferError>;

    async fn disconnect(&self) -> Result<(), TransferError>;
}

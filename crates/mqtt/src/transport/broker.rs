use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, QoS};
use tracing::debug;

use super::MqttTransport;
use crate::error::TransferError;

#[derive(Debug, Default)]
struct TrackerState {
    // Filters handed to the client, not yet seen leaving the event loop
    queued: VecDeque<String>,
    inflight: HashMap<u16, String>,
}

/// Remembers which filter each outgoing SUBSCRIBE carried.
///
/// rumqttc only reports packet ids, both when a SUBSCRIBE leaves the event
/// loop and when its SUBACK arrives. The event loop takes requests in the
/// order they were queued, so pairing the queue front with each
/// `Outgoing::Subscribe` recovers the filter of a rejected SUBACK.
#[derive(Debug, Clone, Default)]
pub struct SubscribeTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl SubscribeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queued(&self, filter: &str) {
        self.state().queued.push_back(filter.to_string());
    }

    /// Drops the newest queued filter after the client refused the request.
    fn withdraw(&self) {
        self.state().queued.pop_back();
    }

    /// Pairs the oldest queued filter with the packet id it left with.
    pub fn sent(&self, pkid: u16) {
        let mut state = self.state();
        match state.queued.pop_front() {
            Some(filter) => {
                state.inflight.insert(pkid, filter);
            }
            None => debug!(pkid, "Subscribe sent without a queued filter"),
        }
    }

    /// Returns the filter acknowledged by the SUBACK for `pkid`.
    pub fn acknowledged(&self, pkid: u16) -> Option<String> {
        self.state().inflight.remove(&pkid)
    }

    /// Forgets in-flight packet ids; their SUBACKs died with the connection.
    pub fn connection_reset(&self) {
        self.state().inflight.clear();
    }

    pub fn pending(&self) -> usize {
        let state = self.state();
        state.queued.len() + state.inflight.len()
    }
}

/// `MqttTransport` over a rumqttc client.
pub struct BrokerTransport {
    client: AsyncClient,
    subscribes: SubscribeTracker,
    // Keeps tracker order equal to request channel order
    gate: tokio::sync::Mutex<()>,
}

impl BrokerTransport {
    pub fn new(client: AsyncClient, subscribes: SubscribeTracker) -> Self {
        Self {
            client,
            subscribes,
            gate: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl MqttTransport for BrokerTransport {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), TransferError> {
        self.client.publish_bytes(topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransferError> {
        let _gate = self.gate.lock().await;
        self.subscribes.queued(topic);
        if let Err(e) = self.client.subscribe(topic, qos).await {
            self.subscribes.withdraw();
            return Err(e.into());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransferError> {
        self.client.unsubscribe(topic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransferError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

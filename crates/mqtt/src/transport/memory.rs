use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::Notify;

use super::MqttTransport;
use crate::error::TransferError;

/// A message handed to `MemoryTransport::publish`.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct MemoryState {
    published: Vec<Published>,
    subscribe_calls: Vec<(String, QoS)>,
    unsubscribe_calls: Vec<String>,
    failing_subscribes: usize,
    failing_publishes: bool,
    disconnected: bool,
}

/// In-memory transport that records calls instead of talking to a broker.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    changed: Notify,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.state().failing_subscribes = count;
    }

    /// Makes every publish fail until switched off again.
    pub fn fail_publishes(&self, fail: bool) {
        self.state().failing_publishes = fail;
    }

    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    /// Every subscribe call in order, including failed ones.
    pub fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        self.state().subscribe_calls.clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.state().unsubscribe_calls.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state().disconnected
    }

    /// Waits until at least `count` messages have been published.
    pub async fn wait_for_publishes(&self, count: usize) -> Vec<Published> {
        loop {
            let notified = self.changed.notified();
            {
                let state = self.state();
                if state.published.len() >= count {
                    return state.published.clone();
                }
            }
            notified.await;
        }
    }

    /// Waits until at least `count` subscribe calls have been made.
    pub async fn wait_for_subscribe_calls(&self, count: usize) -> Vec<(String, QoS)> {
        loop {
            let notified = self.changed.notified();
            {
                let state = self.state();
                if state.subscribe_calls.len() >= count {
                    return state.subscribe_calls.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MqttTransport for MemoryTransport {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), TransferError> {
        let result = {
            let mut state = self.state();
            if state.failing_publishes {
                Err(TransferError::Transport(format!("publish to {topic} rejected")))
            } else {
                state.published.push(Published {
                    topic: topic.to_string(),
                    qos,
                    retain,
                    payload,
                });
                Ok(())
            }
        };
        self.changed.notify_waiters();
        result
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransferError> {
        let result = {
            let mut state = self.state();
            state.subscribe_calls.push((topic.to_string(), qos));
            if state.failing_subscribes > 0 {
                state.failing_subscribes -= 1;
                Err(TransferError::Transport(format!("subscribe to {topic} rejected")))
            } else {
                Ok(())
            }
        };
        self.changed.notify_waiters();
        result
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransferError> {
        self.state().unsubscribe_calls.push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransferError> {
        self.state().disconnected = true;
        self.changed.notify_waiters();
        Ok(())
    }
}

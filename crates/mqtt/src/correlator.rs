//! Request/response correlation over the command and response topics.
//!
//! Every outbound request registers a one-shot channel under its id in
//! `PendingRequests` before it is published. The response listener resolves
//! the channel when a response with the same id arrives. The waiting side
//! holds a `PendingGuard` that removes the entry on every exit path, so the
//! table never outlives the calls that populated it.
//!
//! ```text
//! send_command ──register──► PendingRequests ◄──resolve── ResponseListener
//!      │                          ▲
//!      └──publish(cmd)──► broker ─┴─(resp topic)──► ConnectionManager
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rumqttc::QoS;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    error::TransferError,
    jsonrpc::{DeviceIdParams, Request, Response},
    transport::MqttTransport,
};

/// A value read from a controller, stamped with its capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub resource_name: String,
    /// Milliseconds since the Unix epoch.
    pub origin_ms: i64,
    pub value: String,
}

impl Reading {
    /// Creates a reading stamped with the current time.
    pub fn new(resource_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            origin_ms: now_millis(),
            value: value.into(),
        }
    }
}

/// Milliseconds since the Unix epoch, 0 if the clock is before it.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

type Waiters = HashMap<String, oneshot::Sender<Response>>;

/// Concurrent table of requests awaiting a response, keyed by id.
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: Mutex<Waiters>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a waiter for `id`.
    ///
    /// Fails if `id` is already pending. The entry lives as long as the
    /// returned guard.
    pub fn register(
        self: &Arc<Self>,
        id: &str,
    ) -> Result<(PendingGuard, oneshot::Receiver<Response>), TransferError> {
        let mut waiters = self.lock();
        if waiters.contains_key(id) {
            return Err(TransferError::DuplicateRequestId(id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        waiters.insert(id.to_string(), tx);
        Ok((
            PendingGuard {
                table: Arc::clone(self),
                id: id.to_string(),
            },
            rx,
        ))
    }

    /// Hands `response` to the waiter registered under its id.
    ///
    /// Never blocks. Returns false when nobody is waiting for that id, for
    /// example because the request already timed out.
    pub fn resolve(&self, response: Response) -> bool {
        let Some(tx) = self.lock().remove(&response.id) else {
            return false;
        };
        tx.send(response).is_ok()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, id: &str) {
        self.lock().remove(id);
    }
}

/// Removes its pending entry when dropped.
#[derive(Debug)]
pub struct PendingGuard {
    table: Arc<PendingRequests>,
    id: String,
}

impl PendingGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Publishes JSON-RPC requests and waits for their correlated responses.
#[derive(Clone)]
pub struct CommandDispatcher {
    transport: Arc<dyn MqttTransport>,
    pending: Arc<PendingRequests>,
    command_topic: String,
    qos: QoS,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<dyn MqttTransport>,
        pending: Arc<PendingRequests>,
        command_topic: impl Into<String>,
        qos: QoS,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            pending,
            command_topic: command_topic.into(),
            qos,
            timeout,
            cancel,
        }
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Sends `resource_name` as a command and returns the controller's reading.
    ///
    /// `target_device` is embedded as `{"device_id": ..}` when present. An
    /// application-level `error` member in the response is returned as the
    /// reading, not as an error.
    pub async fn send_command(
        &self,
        resource_name: &str,
        target_device: Option<&str>,
    ) -> Result<Reading, TransferError> {
        let mut request = Request::new(resource_name);
        if let Some(device_id) = target_device {
            request = request.with_params(&DeviceIdParams {
                device_id: device_id.to_string(),
            })?;
        }

        let id = request.id.clone();
        let response = self.request(request).await?;
        let value = response.reading().ok_or_else(|| {
            TransferError::InvalidResponse(format!(
                "method={resource_name} id={id}: neither result nor error present"
            ))
        })?;

        info!(method = resource_name, id = %id, "Command finished");
        Ok(Reading::new(resource_name, value))
    }

    /// Publishes `request` and waits for the response with the same id.
    ///
    /// Resolves on the first of: the response, the request timeout, or the
    /// shutdown signal. The pending entry is removed in every case.
    pub async fn request(&self, request: Request) -> Result<Response, TransferError> {
        let (_guard, response_rx) = self.pending.register(&request.id)?;

        let payload = serde_json::to_vec(&request)?;
        info!(
            method = %request.method,
            id = %request.id,
            topic = %self.command_topic,
            "Publish command"
        );
        self.transport
            .publish(&self.command_topic, self.qos, false, payload.into())
            .await?;

        tokio::select! {
            biased;

            response = response_rx => response.map_err(|_| {
                TransferError::InvalidResponse(format!(
                    "response channel closed: method={} id={}",
                    request.method, request.id
                ))
            }),

            _ = self.cancel.cancelled() => {
                debug!(method = %request.method, id = %request.id, "Request cancelled by shutdown");
                Err(TransferError::Cancelled {
                    method: request.method,
                    id: request.id,
                })
            }

            _ = tokio::time::sleep(self.timeout) => {
                warn!(
                    method = %request.method,
                    id = %request.id,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Request timed out"
                );
                Err(TransferError::Timeout {
                    method: request.method,
                    id: request.id,
                })
            }
        }
    }

    /// Publishes `request` without waiting for a response.
    pub async fn notify(&self, request: &Request) -> Result<(), TransferError> {
        let payload = serde_json::to_vec(request)?;
        self.transport
            .publish(&self.command_topic, self.qos, false, payload.into())
            .await
    }

    /// Asks the controller to publish the given notification types.
    pub async fn announce(&self, notifications: &[String]) -> Result<(), TransferError> {
        let request = Request::controller_subscribe(notifications)?;
        info!(
            id = %request.id,
            notifications = ?notifications,
            "Announcing controller notification subscriptions"
        );
        self.notify(&request).await
    }
}

//! Handler for the incoming data topics.
//!
//! Every JSON-RPC notification published by the controller on a data topic
//! becomes one reading of the controller device, with the method as resource
//! name and the (possibly rewritten) message as value. Some methods have side
//! effects first:
//!
//! - `heartbeat` registers the reporting sensor if the platform does not
//!   know it yet
//! - `inventory_data` gains a decoded `uri` next to every `epc`
//! - `rsp_controller_status` with status `ready` re-sends the notification
//!   subscription, since a restarted controller has forgotten it

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rsp_mqtt::{
    jsonrpc::{ParamError, VERSION},
    Announcer, MessageHandler, Notification, Reading,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{
    decoder::DecoderRing,
    host::{AsyncReadingSink, AsyncValues, DeviceRegistry, SensorDevice},
};

pub const HEARTBEAT: &str = "heartbeat";
pub const INVENTORY_DATA: &str = "inventory_data";
pub const CONTROLLER_STATUS: &str = "rsp_controller_status";

const DEVICE_ID_PARAM: &str = "device_id";
const DATA_PARAM: &str = "data";
const STATUS_PARAM: &str = "status";
const STATUS_READY: &str = "ready";
const EPC_KEY: &str = "epc";
const URI_KEY: &str = "uri";

pub struct IncomingListener {
    controller_name: String,
    decoders: Arc<DecoderRing>,
    registry: Arc<dyn DeviceRegistry>,
    sink: Arc<dyn AsyncReadingSink>,
    announcer: Announcer,
}

impl IncomingListener {
    pub fn new(
        controller_name: impl Into<String>,
        decoders: Arc<DecoderRing>,
        registry: Arc<dyn DeviceRegistry>,
        sink: Arc<dyn AsyncReadingSink>,
        announcer: Announcer,
    ) -> Self {
        Self {
            controller_name: controller_name.into(),
            decoders,
            registry,
            sink,
            announcer,
        }
    }

    pub async fn on_incoming(&self, topic: &str, payload: &[u8]) {
        let mut notification: Notification = match serde_json::from_slice(payload) {
            Ok(notification) => notification,
            Err(e) => {
                error!(topic, error = %e, "Unmarshal of incoming message failed");
                return;
            }
        };

        if notification.jsonrpc != VERSION {
            error!(topic, version = %notification.jsonrpc, "Invalid JSON-RPC version");
            return;
        }

        if notification.method.is_empty() {
            warn!(
                topic,
                msg = %String::from_utf8_lossy(payload),
                "Incoming reading ignored, no method field in message"
            );
            return;
        }

        let mut value = None;
        match notification.method.as_str() {
            HEARTBEAT => self.on_heartbeat(&notification),
            INVENTORY_DATA if !self.decoders.is_empty() => {
                match self.decode_tags(&mut notification) {
                    Ok(rewritten) => value = Some(rewritten),
                    Err(e) => warn!(topic, error = %e, "Unable to add tag URIs to inventory data"),
                }
            }
            CONTROLLER_STATUS => self.on_controller_status(&notification),
            _ => {}
        }

        let value = value.unwrap_or_else(|| String::from_utf8_lossy(payload).into_owned());
        info!(
            topic,
            method = %notification.method,
            msg_len = payload.len(),
            "Incoming reading received"
        );

        let values = AsyncValues {
            device_name: self.controller_name.clone(),
            readings: vec![Reading::new(notification.method, value)],
        };
        if let Err(e) = self.sink.push(values).await {
            warn!(topic, error = %e, "Unable to forward incoming reading");
        }
    }

    /// Registers the sensor in the background if it is new.
    fn on_heartbeat(&self, notification: &Notification) {
        let device_id: String = match notification.get_param(DEVICE_ID_PARAM) {
            Ok(device_id) => device_id,
            Err(e) => {
                error!(error = %e, "Unable to read device id of sensor heartbeat");
                return;
            }
        };

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            if registry.contains(&device_id).await {
                return;
            }
            info!(device = %device_id, "Registering new sensor device");
            if let Err(e) = registry.register(SensorDevice::new(device_id)).await {
                warn!(error = %e, "Sensor registration failed");
            }
        });
    }

    /// Re-announces the notification subscription in the background.
    fn on_controller_status(&self, notification: &Notification) {
        match notification.get_param::<String>(STATUS_PARAM) {
            Ok(status) if status == STATUS_READY => {
                info!("RSP controller is ready, re-sending notification subscription");
                let announcer = self.announcer.clone();
                tokio::spawn(async move { announcer.announce().await });
            }
            Ok(status) => debug!(%status, "RSP controller status"),
            Err(e) => warn!(error = %e, "Unable to read RSP controller status"),
        }
    }

    /// Adds a `uri` member to every tag read that decodes, and returns the
    /// re-serialized notification.
    fn decode_tags(&self, notification: &mut Notification) -> Result<String, ParamError> {
        let mut data: Vec<Value> = notification.get_param(DATA_PARAM)?;

        for read in data.iter_mut().filter_map(Value::as_object_mut) {
            let Some(epc) = read.get(EPC_KEY).and_then(Value::as_str) else {
                continue;
            };
            match self.decoders.tag_data_to_uri(epc) {
                Ok(uri) => {
                    read.insert(URI_KEY.to_string(), Value::String(uri));
                }
                Err(e) => debug!(%epc, error = %e, "Unable to decode tag data"),
            }
        }

        notification.set_param(DATA_PARAM, &data)?;
        serde_json::to_string(notification).map_err(ParamError::Marshal)
    }
}

#[async_trait]
impl MessageHandler for IncomingListener {
    async fn handle(&self, topic: &str, payload: Bytes) {
        self.on_incoming(topic, &payload).await;
    }
}

//! Handler for the response topic.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, trace};

use super::{
    correlator::PendingRequests,
    jsonrpc::{Response, VERSION},
    subscription::MessageHandler,
};

/// Decodes responses and hands them to the matching pending request.
///
/// Undecodable frames, frames of another JSON-RPC version and frames without
/// an id are logged and dropped.
/// Responses nobody is waiting for (late, or meant for another client) are
/// dropped silently.
pub struct ResponseListener {
    pending: Arc<PendingRequests>,
}

impl ResponseListener {
    pub fn new(pending: Arc<PendingRequests>) -> Self {
        Self { pending }
    }

    pub fn on_response(&self, topic: &str, payload: &[u8]) {
        let response: Response = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => {
                error!(topic, error = %e, "Failed to decode command response");
                return;
            }
        };

        if response.jsonrpc != VERSION {
            error!(
                topic,
                id = %response.id,
                version = %response.jsonrpc,
                "Invalid JSON-RPC version in command response"
            );
            return;
        }

        if response.id.is_empty() {
            debug!(
                topic,
                msg = %String::from_utf8_lossy(payload),
                "Command response ignored, no id in message"
            );
            return;
        }

        let id = response.id.clone();
        if self.pending.resolve(response) {
            debug!(topic, id = %id, msg_len = payload.len(), "Command response received");
        } else {
            trace!(topic, id = %id, "No pending request for response");
        }
    }
}

#[async_trait]
impl MessageHandler for ResponseListener {
    async fn handle(&self, topic: &str, payload: Bytes) {
        self.on_response(topic, &payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_matching_response_is_delivered() {
        let pending = Arc::new(PendingRequests::new());
        let (_guard, rx) = pending.register("42").unwrap();
        let listener = ResponseListener::new(pending.clone());

        listener
            .handle(
                "resp",
                Bytes::from_static(br#"{"jsonrpc":"2.0","id":"42","result":"72.5"}"#),
            )
            .await;

        let response = rx.await.unwrap();
        assert_eq!(response.reading().as_deref(), Some("72.5"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let pending = Arc::new(PendingRequests::new());
        let (_guard, mut rx) = pending.register("42").unwrap();
        let listener = ResponseListener::new(pending.clone());

        listener.on_response("resp", b"not json");
        listener.on_response("resp", br#"{"jsonrpc":"2.0","result":"x"}"#);
        listener.on_response("resp", br#"{"jsonrpc":"2.0","id":"","result":"x"}"#);
        listener.on_response("resp", br#"{"jsonrpc":"2.0","id":"7","result":"x"}"#);

        assert!(rx.try_recv().is_err());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_wrong_version_does_not_resolve_request() {
        let pending = Arc::new(PendingRequests::new());
        let (_guard, mut rx) = pending.register("42").unwrap();
        let listener = ResponseListener::new(pending.clone());

        listener.on_response("resp", br#"{"jsonrpc":"1.0","id":"42","result":"72.5"}"#);
        listener.on_response("resp", br#"{"id":"42","result":"72.5"}"#);

        assert!(rx.try_recv().is_err());
        assert_eq!(pending.len(), 1);

        listener.on_response("resp", br#"{"jsonrpc":"2.0","id":"42","result":"72.5"}"#);
        assert_eq!(rx.try_recv().unwrap().reading().as_deref(), Some("72.5"));
    }
}

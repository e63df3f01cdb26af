//! Topic registry, broker subscriptions and message routing.
//!
//! Every topic of interest is registered once with its QoS and handler. The
//! connection manager calls `subscribe_all` after every CONNACK, because the
//! broker forgets subscriptions of a clean session. Each topic retries on its
//! own schedule until it succeeds or shutdown is signalled, so one failing
//! filter does not hold up the others.
//!
//! Routing is keyed by filter: registering the same filter twice replaces the
//! handler, and re-subscribing never duplicates delivery.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::{sync::RwLock, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{error::TransferError, topic::topic_matches, transport::MqttTransport};

/// Receives messages published on a registered filter.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, topic: &str, payload: Bytes);
}

#[derive(Clone)]
struct Route {
    filter: String,
    qos: QoS,
    handler: Arc<dyn MessageHandler>,
}

/// Tracks topic filters, keeps them subscribed and dispatches messages.
#[derive(Clone)]
pub struct SubscriptionManager {
    routes: Arc<RwLock<Vec<Route>>>,
    transport: Arc<dyn MqttTransport>,
    retry_delay: Duration,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn MqttTransport>, retry_delay: Duration) -> Self {
        Self {
            routes: Arc::new(RwLock::new(Vec::new())),
            transport,
            retry_delay,
        }
    }

    /// Registers `filter` for the next `subscribe_all`.
    ///
    /// Does not talk to the broker.
    pub async fn register(&self, filter: &str, qos: QoS, handler: Arc<dyn MessageHandler>) {
        let mut routes = self.routes.write().await;
        match routes.iter_mut().find(|route| route.filter == filter) {
            Some(route) => {
                debug!(topic = filter, "Replacing handler of registered topic");
                route.qos = qos;
                route.handler = handler;
            }
            None => routes.push(Route {
                filter: filter.to_string(),
                qos,
                handler,
            }),
        }
    }

    /// Forgets `filter` and unsubscribes it at the broker.
    ///
    /// The filter is removed locally even if the broker request fails.
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), TransferError> {
        self.routes
            .write()
            .await
            .retain(|route| route.filter != filter);

        self.transport.unsubscribe(filter).await?;
        info!(topic = filter, "Unsubscribed from topic");
        Ok(())
    }

    pub async fn topics(&self) -> Vec<String> {
        self.routes
            .read()
            .await
            .iter()
            .map(|route| route.filter.clone())
            .collect()
    }

    pub async fn is_registered(&self, filter: &str) -> bool {
        self.routes
            .read()
            .await
            .iter()
            .any(|route| route.filter == filter)
    }

    /// Subscribes every registered filter, concurrently.
    ///
    /// A failing filter is retried every `retry_delay`. Returns true once all
    /// filters are subscribed, false if `cancel` fired first.
    pub async fn subscribe_all(&self, cancel: &CancellationToken) -> bool {
        let routes = self.routes.read().await.clone();
        if routes.is_empty() {
            debug!("No topics to subscribe to");
            return true;
        }

        info!(count = routes.len(), "Subscribing to registered topics");

        let mut tasks = JoinSet::new();
        for route in routes {
            let transport = Arc::clone(&self.transport);
            let cancel = cancel.clone();
            let retry_delay = self.retry_delay;
            tasks.spawn(async move {
                subscribe_with_retry(
                    transport.as_ref(),
                    &route.filter,
                    route.qos,
                    retry_delay,
                    &cancel,
                )
                .await
            });
        }

        let mut all_subscribed = true;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(subscribed) => all_subscribed &= subscribed,
                Err(e) => {
                    warn!(error = %e, "Subscribe task failed");
                    all_subscribed = false;
                }
            }
        }
        all_subscribed
    }

    /// Subscribes `filter` again after the broker rejected it.
    ///
    /// Waits `retry_delay` first, then retries like `subscribe_all`. Returns
    /// false if the filter is no longer registered or `cancel` fired.
    pub async fn resubscribe(&self, filter: &str, cancel: &CancellationToken) -> bool {
        let qos = self
            .routes
            .read()
            .await
            .iter()
            .find(|route| route.filter == filter)
            .map(|route| route.qos);
        let Some(qos) = qos else {
            debug!(topic = filter, "Rejected topic is no longer registered");
            return false;
        };

        warn!(
            topic = filter,
            retry_secs = self.retry_delay.as_secs(),
            "Subscription rejected by broker, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(topic = filter, "Subscribe abandoned by shutdown");
                return false;
            }
            _ = tokio::time::sleep(self.retry_delay) => {}
        }

        subscribe_with_retry(self.transport.as_ref(), filter, qos, self.retry_delay, cancel).await
    }

    /// Hands a message to every handler whose filter matches `topic`.
    ///
    /// Returns the number of handlers invoked.
    pub async fn route(&self, topic: &str, payload: Bytes) -> usize {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .routes
            .read()
            .await
            .iter()
            .filter(|route| topic_matches(&route.filter, topic))
            .map(|route| Arc::clone(&route.handler))
            .collect();

        if handlers.is_empty() {
            debug!(topic, "No handler for message");
        }

        for handler in &handlers {
            handler.handle(topic, payload.clone()).await;
        }
        handlers.len()
    }
}

async fn subscribe_with_retry(
    transport: &dyn MqttTransport,
    filter: &str,
    qos: QoS,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> bool {
    loop {
        if cancel.is_cancelled() {
            debug!(topic = filter, "Subscribe abandoned by shutdown");
            return false;
        }

        match transport.subscribe(filter, qos).await {
            Ok(()) => {
                info!(topic = filter, ?qos, "Subscribed to topic");
                return true;
            }
            Err(e) => {
                warn!(
                    topic = filter,
                    error = %e,
                    retry_secs = retry_delay.as_secs(),
                    "Subscribe failed, retrying"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(topic = filter, "Subscribe abandoned by shutdown");
                return false;
            }
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::transport::MemoryTransport;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, Bytes)>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<(String, Bytes)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, topic: &str, payload: Bytes) {
            self.seen.lock().unwrap().push((topic.to_string(), payload));
        }
    }

    fn manager(transport: Arc<MemoryTransport>) -> SubscriptionManager {
        SubscriptionManager::new(transport, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_register_is_keyed_by_filter() {
        let transport = Arc::new(MemoryTransport::new());
        let subscriptions = manager(transport);
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        subscriptions
            .register("rfid/controller/response", QoS::AtLeastOnce, first.clone())
            .await;
        subscriptions
            .register("rfid/controller/response", QoS::AtMostOnce, second.clone())
            .await;

        assert_eq!(subscriptions.topics().await.len(), 1);
        subscriptions
            .route("rfid/controller/response", Bytes::from_static(b"x"))
            .await;
        assert!(first.seen().is_empty());
        assert_eq!(second.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_all_subscribes_every_topic() {
        let transport = Arc::new(MemoryTransport::new());
        let subscriptions = manager(transport.clone());
        let handler = Arc::new(Recorder::default());
        subscriptions
            .register("rfid/controller/response", QoS::AtLeastOnce, handler.clone())
            .await;
        subscriptions
            .register("rfid/rsp/data/+", QoS::AtMostOnce, handler.clone())
            .await;

        assert!(subscriptions.subscribe_all(&CancellationToken::new()).await);

        let mut calls = transport.subscribe_calls();
        calls.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            calls,
            vec![
                ("rfid/controller/response".to_string(), QoS::AtLeastOnce),
                ("rfid/rsp/data/+".to_string(), QoS::AtMostOnce),
            ]
        );
    }

    #[tokio::test]
    async fn test_resubscribe_does_not_duplicate_delivery() {
        let transport = Arc::new(MemoryTransport::new());
        let subscriptions = manager(transport.clone());
        let handler = Arc::new(Recorder::default());
        subscriptions
            .register("rfid/controller/alerts", QoS::AtLeastOnce, handler.clone())
            .await;

        let cancel = CancellationToken::new();
        assert!(subscriptions.subscribe_all(&cancel).await);
        assert!(subscriptions.subscribe_all(&cancel).await);

        assert_eq!(transport.subscribe_calls().len(), 2);
        assert_eq!(subscriptions.topics().await, vec!["rfid/controller/alerts"]);

        let invoked = subscriptions
            .route("rfid/controller/alerts", Bytes::from_static(b"{}"))
            .await;
        assert_eq!(invoked, 1);
        assert_eq!(handler.seen().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscribe_is_retried() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_subscribes(2);
        let subscriptions = manager(transport.clone());
        subscriptions
            .register("rfid/controller/alerts", QoS::AtLeastOnce, Arc::new(Recorder::default()))
            .await;

        let start = tokio::time::Instant::now();
        assert!(subscriptions.subscribe_all(&CancellationToken::new()).await);

        assert_eq!(transport.subscribe_calls().len(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_retry_loop() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_subscribes(usize::MAX);
        let subscriptions = manager(transport.clone());
        subscriptions
            .register("rfid/controller/alerts", QoS::AtLeastOnce, Arc::new(Recorder::default()))
            .await;

        let cancel = CancellationToken::new();
        let task = {
            let subscriptions = subscriptions.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { subscriptions.subscribe_all(&cancel).await })
        };

        transport.wait_for_subscribe_calls(1).await;
        cancel.cancel();

        assert!(!task.await.unwrap());
        assert_eq!(transport.subscribe_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_topic_is_subscribed_again_after_delay() {
        let transport = Arc::new(MemoryTransport::new());
        let subscriptions = manager(transport.clone());
        subscriptions
            .register("rfid/controller/alerts", QoS::AtLeastOnce, Arc::new(Recorder::default()))
            .await;

        let start = tokio::time::Instant::now();
        assert!(
            subscriptions
                .resubscribe("rfid/controller/alerts", &CancellationToken::new())
                .await
        );

        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(
            transport.subscribe_calls(),
            vec![("rfid/controller/alerts".to_string(), QoS::AtLeastOnce)]
        );
    }

    #[tokio::test]
    async fn test_rejected_unregistered_topic_is_dropped() {
        let transport = Arc::new(MemoryTransport::new());
        let subscriptions = manager(transport.clone());

        assert!(
            !subscriptions
                .resubscribe("rfid/controller/alerts", &CancellationToken::new())
                .await
        );
        assert!(transport.subscribe_calls().is_empty());
    }

    #[tokio::test]
    async fn test_route_uses_wildcards() {
        let transport = Arc::new(MemoryTransport::new());
        let subscriptions = manager(transport);
        let data = Arc::new(Recorder::default());
        let everything = Arc::new(Recorder::default());
        subscriptions
            .register("rfid/rsp/data/+", QoS::AtLeastOnce, data.clone())
            .await;
        subscriptions
            .register("rfid/#", QoS::AtLeastOnce, everything.clone())
            .await;

        assert_eq!(
            subscriptions
                .route("rfid/rsp/data/RSP-150000", Bytes::from_static(b"1"))
                .await,
            2
        );
        assert_eq!(
            subscriptions
                .route("rfid/controller/alerts", Bytes::from_static(b"2"))
                .await,
            1
        );
        assert_eq!(subscriptions.route("other/topic", Bytes::new()).await, 0);

        assert_eq!(data.seen().len(), 1);
        assert_eq!(everything.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_forgets_topic() {
        let transport = Arc::new(MemoryTransport::new());
        let subscriptions = manager(transport.clone());
        subscriptions
            .register("rfid/controller/alerts", QoS::AtLeastOnce, Arc::new(Recorder::default()))
            .await;

        subscriptions.unsubscribe("rfid/controller/alerts").await.unwrap();

        assert!(!subscriptions.is_registered("rfid/controller/alerts").await);
        assert_eq!(transport.unsubscribe_calls(), vec!["rfid/controller/alerts"]);
    }
}

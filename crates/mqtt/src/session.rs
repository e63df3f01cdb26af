//! Wiring of one managed session.
//!
//! `Session` assembles the pieces around a transport: the subscription
//! registry with the response listener on the response topic, the request
//! correlator, the connection manager and, for a real broker, the connection
//! kernel. Nothing runs until `spawn`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::Validate;

use super::{
    client::ClientBuilder,
    config::{qos_from_u8, MqttConfig},
    connection::{ConnectionEvent, ConnectionKernel},
    correlator::{CommandDispatcher, PendingRequests},
    error::{FatalError, TransferError},
    manager::{ConnectionManager, SessionHook},
    readiness::Readiness,
    response::ResponseListener,
    state::ConnectionState,
    subscription::{MessageHandler, SubscriptionManager},
    transport::{BrokerTransport, MqttTransport, SubscribeTracker},
};

/// Announces the configured notification types to the controller.
///
/// Runs as a session hook after every (re)connect and can be triggered
/// directly, for example when a controller reports that it came back.
#[derive(Clone)]
pub struct Announcer {
    dispatcher: CommandDispatcher,
    notifications: Arc<[String]>,
}

impl Announcer {
    pub fn new(dispatcher: CommandDispatcher, notifications: Vec<String>) -> Self {
        Self {
            dispatcher,
            notifications: notifications.into(),
        }
    }

    /// Publishes the subscribe request. Failures are logged, not returned.
    pub async fn announce(&self) {
        if self.notifications.is_empty() {
            return;
        }
        if let Err(e) = self.dispatcher.announce(&self.notifications).await {
            warn!(error = %e, "Unable to announce notification subscriptions");
        }
    }
}

#[async_trait]
impl SessionHook for Announcer {
    async fn on_session(&self, _first: bool) {
        self.announce().await;
    }
}

/// A configured, not yet running session.
pub struct Session {
    config: MqttConfig,
    dispatcher: CommandDispatcher,
    subscriptions: SubscriptionManager,
    readiness: Readiness,
    announcer: Announcer,
    manager: ConnectionManager,
    kernel: Option<ConnectionKernel>,
    kernel_cancel: CancellationToken,
}

impl Session {
    /// Builds a session against the broker described by `config`.
    pub async fn connect(
        config: MqttConfig,
        cancel: CancellationToken,
    ) -> Result<Self, TransferError> {
        let (client, event_loop) = ClientBuilder::from_config(&config)?.build()?;
        let (events_tx, events_rx) = mpsc::channel(config.request_channel_capacity);
        let kernel_cancel = cancel.child_token();
        let subscribes = SubscribeTracker::new();
        let kernel = ConnectionKernel::new(
            client.clone(),
            event_loop,
            events_tx,
            subscribes.clone(),
            &config,
            kernel_cancel.clone(),
        );

        let transport = Arc::new(BrokerTransport::new(client, subscribes));
        let mut session = Self::with_transport(config, transport, events_rx, cancel).await?;
        session.kernel = Some(kernel);
        session.kernel_cancel = kernel_cancel;
        Ok(session)
    }

    /// Builds a session on top of an existing transport and event source.
    pub async fn with_transport(
        config: MqttConfig,
        transport: Arc<dyn MqttTransport>,
        events: mpsc::Receiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, TransferError> {
        config.validate()?;

        let pending = Arc::new(PendingRequests::new());
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&transport),
            Arc::clone(&pending),
            config.command_topic.clone(),
            qos_from_u8(config.command_qos)?,
            config.request_timeout(),
            cancel.clone(),
        );

        let subscriptions = SubscriptionManager::new(transport, config.subscribe_retry_delay());
        subscriptions
            .register(
                &config.response_topic,
                qos_from_u8(config.response_qos)?,
                Arc::new(ResponseListener::new(pending)),
            )
            .await;

        let readiness = Readiness::new();
        let announcer = Announcer::new(dispatcher.clone(), config.controller_notifications.clone());
        let mut manager = ConnectionManager::new(
            events,
            &config,
            subscriptions.clone(),
            readiness.clone(),
            cancel.clone(),
        );
        manager.add_hook(Arc::new(announcer.clone()));

        Ok(Self {
            config,
            dispatcher,
            subscriptions,
            readiness,
            announcer,
            manager,
            kernel: None,
            kernel_cancel: cancel.child_token(),
        })
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> CommandDispatcher {
        self.dispatcher.clone()
    }

    pub fn subscriptions(&self) -> SubscriptionManager {
        self.subscriptions.clone()
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    pub fn announcer(&self) -> Announcer {
        self.announcer.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    /// Registers `handler` for every configured incoming topic filter.
    pub async fn register_incoming(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransferError> {
        let qos = qos_from_u8(self.config.incoming_qos)?;
        for filter in &self.config.incoming_topics {
            self.subscriptions
                .register(filter, qos, Arc::clone(&handler))
                .await;
        }
        Ok(())
    }

    /// Adds a hook run after the announcer on every bring-up.
    pub fn add_hook(&mut self, hook: Arc<dyn SessionHook>) {
        self.manager.add_hook(hook);
    }

    /// Starts the manager and, if present, the kernel.
    pub fn spawn(self) -> SessionHandle {
        info!(
            broker = %self.config.broker_uri(),
            client_id = %self.config.client_id,
            "Starting MQTT session"
        );
        let manager = tokio::spawn(self.manager.run());
        let kernel = self.kernel.map(|kernel| tokio::spawn(kernel.run()));
        SessionHandle {
            manager,
            kernel,
            kernel_cancel: self.kernel_cancel,
        }
    }
}

/// Join handles of a running session.
pub struct SessionHandle {
    manager: JoinHandle<Result<(), FatalError>>,
    kernel: Option<JoinHandle<Result<(), TransferError>>>,
    kernel_cancel: CancellationToken,
}

impl SessionHandle {
    /// Waits for the manager to stop, then stops the kernel.
    ///
    /// Returns the manager's fatal error, if any.
    pub async fn join(self) -> Result<(), FatalError> {
        let outcome = match self.manager.await {
            Ok(outcome) => outcome,
            Err(e) => Err(FatalError::ConnectionAbandoned {
                reason: format!("connection manager task failed: {e}"),
            }),
        };

        self.kernel_cancel.cancel();
        if let Some(kernel) = self.kernel {
            match kernel.await {
                Ok(Ok(())) => debug!("Connection kernel stopped"),
                Ok(Err(e)) => debug!(error = %e, "Connection kernel stopped with error"),
                Err(e) => warn!(error = %e, "Connection kernel task failed"),
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use serde_json::Value;

    use super::*;
    use crate::transport::MemoryTransport;

    fn config() -> MqttConfig {
        MqttConfig {
            command_topic: "cmd".into(),
            response_topic: "resp".into(),
            controller_notifications: vec!["inventory_data".into(), "rsp_status".into()],
            ..Default::default()
        }
    }

    async fn session(
        config: MqttConfig,
    ) -> (
        Session,
        Arc<MemoryTransport>,
        mpsc::Sender<ConnectionEvent>,
        CancellationToken,
    ) {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let session = Session::with_transport(config, transport.clone(), rx, cancel.clone())
            .await
            .unwrap();
        (session, transport, tx, cancel)
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let (_tx, rx) = mpsc::channel(1);
        let config = MqttConfig {
            command_topic: String::new(),
            ..config()
        };
        let result = Session::with_transport(config, transport, rx, CancellationToken::new()).await;
        assert!(matches!(result, Err(TransferError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_connect_subscribes_and_announces() {
        let (session, transport, events, cancel) = session(config()).await;
        let readiness = session.readiness();
        let handle = session.spawn();

        events.send(ConnectionEvent::Connected).await.unwrap();
        readiness.wait().await.unwrap();

        assert_eq!(transport.subscribe_calls()[0].0, "resp");
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "cmd");
        let announce: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(announce["method"], "subscribe");
        assert_eq!(announce["params"][0], "inventory_data");

        cancel.cancel();
        assert!(handle.join().await.is_ok());
    }

    #[tokio::test]
    async fn test_command_round_trip_through_session() {
        let config = MqttConfig {
            controller_notifications: Vec::new(),
            ..config()
        };
        let (session, transport, events, cancel) = session(config).await;
        let dispatcher = session.dispatcher();
        let readiness = session.readiness();
        let handle = session.spawn();

        events.send(ConnectionEvent::Connected).await.unwrap();
        readiness.wait().await.unwrap();

        let call = tokio::spawn(async move { dispatcher.send_command("temperature", None).await });

        let published = transport.wait_for_publishes(1).await;
        let request: Value = serde_json::from_slice(&published[0].payload).unwrap();
        let id = request["id"].as_str().unwrap().to_string();
        events
            .send(ConnectionEvent::Message {
                topic: "resp".into(),
                payload: Bytes::from(format!(
                    r#"{{"jsonrpc":"2.0","id":"{id}","result":"72.5"}}"#
                )),
            })
            .await
            .unwrap();

        let reading = call.await.unwrap().unwrap();
        assert_eq!(reading.resource_name, "temperature");
        assert_eq!(reading.value, "72.5");

        cancel.cancel();
        assert!(handle.join().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_reconnect_surfaces_from_join() {
        let config = MqttConfig {
            max_reconnect_wait: 1,
            ..config()
        };
        let (session, _transport, events, _cancel) = session(config).await;
        let mut state = session.state();
        let handle = session.spawn();

        events.send(ConnectionEvent::Connected).await.unwrap();
        events
            .send(ConnectionEvent::ConnectionLost {
                reason: "connection reset by peer".into(),
                retrying: true,
            })
            .await
            .unwrap();

        let err = handle.join().await.unwrap_err();
        assert_eq!(
            err,
            FatalError::ReconnectTimeout {
                waited: Duration::from_secs(1)
            }
        );
        assert!(state.borrow_and_update().is_fatal());
    }

    #[tokio::test]
    async fn test_incoming_topics_are_registered() {
        struct Ignore;

        #[async_trait]
        impl MessageHandler for Ignore {
            async fn handle(&self, _topic: &str, _payload: Bytes) {}
        }

        let config = MqttConfig {
            incoming_topics: vec!["rfid/controller/notification/#".into()],
            ..config()
        };
        let (session, _transport, _events, _cancel) = session(config).await;
        session.register_incoming(Arc::new(Ignore)).await.unwrap();

        let subscriptions = session.subscriptions();
        assert!(subscriptions.is_registered("resp").await);
        assert!(
            subscriptions
                .is_registered("rfid/controller/notification/#")
                .await
        );
    }
}

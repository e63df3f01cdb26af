//! Connection kernel: drives the rumqttc event loop.
//!
//! The kernel owns the `EventLoop` and turns everything it produces into
//! `ConnectionEvent`s on a channel. It makes no lifecycle decisions; the
//! connection manager consumes the events and owns the state machine.
//!
//! ```text
//! EventLoop::poll ──► ConnectionKernel ──(mpsc)──► ConnectionManager
//!                        │                             │
//!                        └── sleeps between attempts   └── state, watchdog,
//!                                                          bring-up, routing
//! ```
//!
//! Before the first session the kernel waits a fixed delay between attempts.
//! Once a session has existed, it backs off exponentially; the manager's
//! reconnect watchdog bounds the total time spent.

use std::time::Duration;

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet,
    SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    backoff::Backoff, config::MqttConfig, error::TransferError, transport::SubscribeTracker,
};

/// What the event loop reported, in the terms the manager cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// CONNACK with success.
    Connected,

    /// An attempt failed before any session existed.
    ConnectFailed { reason: String, retrying: bool },

    /// The connection failed after a session existed.
    ///
    /// Sent for the drop itself and for every failed reconnect attempt.
    ConnectionLost { reason: String, retrying: bool },

    /// An application message arrived.
    Message { topic: String, payload: Bytes },

    /// The broker answered a SUBSCRIBE with a failure return code.
    SubscribeRejected { filter: String },
}

/// Runs the MQTT event loop until shutdown or a fatal error.
pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    events: mpsc::Sender<ConnectionEvent>,
    subscribes: SubscribeTracker,
    broker: String,
    connect_retry_delay: Duration,
    backoff: Backoff,
    had_session: bool,
    cancel: CancellationToken,
}

impl ConnectionKernel {
    pub fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        events: mpsc::Sender<ConnectionEvent>,
        subscribes: SubscribeTracker,
        config: &MqttConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            event_loop,
            events,
            subscribes,
            broker: config.broker_uri(),
            connect_retry_delay: config.connect_retry_delay(),
            backoff: Backoff::default(),
            had_session: false,
            cancel,
        }
    }

    /// Pumps the event loop.
    ///
    /// Returns `Ok(())` on shutdown or when the event receiver is gone, and
    /// the connection error when it was classified fatal. In the fatal case
    /// a `retrying: false` event has already been sent.
    pub async fn run(mut self) -> Result<(), TransferError> {
        info!(broker = %self.broker, "Starting connection event loop");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, disconnecting from broker");
                    self.disconnect().await;
                    return Ok(());
                }

                polled = self.event_loop.poll() => match polled {
                    Ok(event) => {
                        if !self.handle_event(event).await {
                            debug!("Connection event receiver closed, stopping kernel");
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        let retrying = !is_fatal_error(&e);
                        let reason = get_error_message(&e);

                        let event = if self.had_session {
                            ConnectionEvent::ConnectionLost { reason: reason.clone(), retrying }
                        } else {
                            ConnectionEvent::ConnectFailed { reason: reason.clone(), retrying }
                        };
                        if !self.emit(event).await {
                            return Ok(());
                        }

                        if !retrying {
                            error!(error = %reason, "Fatal connection error, not reconnecting");
                            return Err(TransferError::from(e));
                        }

                        let delay = self.next_retry_delay();
                        warn!(
                            error = %reason,
                            retry_secs = delay.as_secs_f64(),
                            "Connection attempt failed, retrying"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                info!("Shutdown signal received while waiting to reconnect");
                                return Ok(());
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    /// Returns false when the manager stopped listening.
    async fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                if conn_ack.code == ConnectReturnCode::Success {
                    info!(session_present = conn_ack.session_present, "Connection established");
                    self.had_session = true;
                    self.backoff.reset();
                    self.subscribes.connection_reset();
                    return self.emit(ConnectionEvent::Connected).await;
                }
                warn!(code = ?conn_ack.code, "Connection refused by broker");
            }
            Event::Incoming(Packet::Publish(publish)) => {
                trace!(topic = %publish.topic, msg_len = publish.payload.len(), "Received publish");
                return self
                    .emit(ConnectionEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload,
                    })
                    .await;
            }
            Event::Incoming(Packet::SubAck(sub_ack)) => {
                let filter = self.subscribes.acknowledged(sub_ack.pkid);
                let rejected = sub_ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                match (rejected, filter) {
                    (true, Some(filter)) => {
                        warn!(topic = %filter, pkid = sub_ack.pkid, "Broker rejected subscription");
                        return self
                            .emit(ConnectionEvent::SubscribeRejected { filter })
                            .await;
                    }
                    (true, None) => {
                        warn!(pkid = sub_ack.pkid, "Broker rejected an untracked subscription");
                    }
                    (false, _) => {}
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
            }
            Event::Incoming(Packet::PingResp | Packet::PingReq) => {}
            Event::Incoming(packet) => {
                trace!(?packet, "Incoming packet");
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                trace!(pkid, "Subscribe sent");
                self.subscribes.sent(pkid);
            }
            Event::Outgoing(outgoing) => {
                trace!(?outgoing, "Outgoing packet");
            }
        }
        true
    }

    async fn emit(&mut self, event: ConnectionEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Sends DISCONNECT. Best effort; the socket closes either way.
    async fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "Error sending disconnect packet");
        }
    }

    fn next_retry_delay(&mut self) -> Duration {
        if self.had_session {
            self.backoff.next_sleep()
        } else {
            self.connect_retry_delay
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    // Retrying cannot help
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        // Invalid certificates or incompatible crypto setup
        ConnectionError::Tls(_) => Fatal,

        ConnectionError::MqttState(_) => Fatal,

        ConnectionError::NotConnAck(_) => Fatal,

        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            // Local misconfiguration
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            ConnectReturnCode::ServiceUnavailable => Reconnect,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

/// True when the event loop will not recover from `err` by retrying.
pub fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Innermost message of an error chain, without surrounding quotes.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use std::io;

    use rumqttc::{QoS, SubAck};

    use super::*;
    use crate::{
        client::ClientBuilder,
        transport::{BrokerTransport, MqttTransport},
    };

    #[test]
    fn test_is_fatal_error_detection() {
        let refused = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(!is_fatal_error(&refused));

        let addr_in_use = ConnectionError::Io(io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        assert!(is_fatal_error(&addr_in_use));

        assert!(!is_fatal_error(&ConnectionError::NetworkTimeout));
        assert!(is_fatal_error(&ConnectionError::RequestsDone));
    }

    #[test]
    fn test_refusal_codes() {
        assert!(is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword
        )));
        assert!(is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized
        )));
        assert!(!is_fatal_error(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable
        )));
    }

    #[test]
    fn test_error_message_strips_quotes() {
        let err = io::Error::new(io::ErrorKind::Other, "\"broker gone\"");
        assert_eq!(get_error_message(&err), "broker gone");
    }

    fn kernel(
        config: &MqttConfig,
        subscribes: SubscribeTracker,
    ) -> (ConnectionKernel, mpsc::Receiver<ConnectionEvent>, CancellationToken) {
        let (client, event_loop) = ClientBuilder::from_config(config).unwrap().build().unwrap();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let kernel =
            ConnectionKernel::new(client, event_loop, tx, subscribes, config, cancel.clone());
        (kernel, rx, cancel)
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_run_future_is_send() {
        let (kernel, _rx, _cancel) = kernel(&MqttConfig::default(), SubscribeTracker::new());
        let run = kernel.run();
        assert_send(&run);
    }

    #[tokio::test]
    async fn test_rejected_suback_names_the_filter() {
        let subscribes = SubscribeTracker::new();
        let (mut kernel, mut rx, _cancel) = kernel(&MqttConfig::default(), subscribes.clone());
        let transport = BrokerTransport::new(kernel.client.clone(), subscribes);
        transport
            .subscribe("rfid/controller/response", QoS::AtLeastOnce)
            .await
            .unwrap();
        transport
            .subscribe("rfid/controller/alerts", QoS::AtLeastOnce)
            .await
            .unwrap();

        assert!(kernel.handle_event(Event::Outgoing(Outgoing::Subscribe(1))).await);
        assert!(kernel.handle_event(Event::Outgoing(Outgoing::Subscribe(2))).await);
        let accepted = SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        assert!(kernel.handle_event(Event::Incoming(Packet::SubAck(accepted))).await);
        let refused = SubAck::new(2, vec![SubscribeReasonCode::Failure]);
        assert!(kernel.handle_event(Event::Incoming(Packet::SubAck(refused))).await);

        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::SubscribeRejected {
                filter: "rfid/controller/alerts".into()
            })
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_retrying_failure() {
        let config = MqttConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..Default::default()
        };
        let (kernel, mut rx, cancel) = kernel(&config, SubscribeTracker::new());
        let task = tokio::spawn(kernel.run());

        match rx.recv().await {
            Some(ConnectionEvent::ConnectFailed { retrying, .. }) => assert!(retrying),
            other => panic!("unexpected event: {other:?}"),
        }

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}

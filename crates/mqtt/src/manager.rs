//! Connection manager: the session's state machine.
//!
//! The manager is the only consumer of `ConnectionEvent`s and the only writer
//! of `ConnectionState`. It decides when a failure is fatal, arms and disarms
//! the reconnect watchdog, restarts the bring-up on every CONNACK and routes
//! application messages to their handlers.
//!
//! # Transitions
//!
//! | State          | Event                              | Next state     |
//! |----------------|------------------------------------|----------------|
//! | Connecting     | `Connected`                        | Connected      |
//! | Connecting     | `ConnectFailed` within budget      | Connecting     |
//! | Connecting     | `ConnectFailed`, budget exhausted  | FailedFatal    |
//! | Connected      | `ConnectionLost { retrying }`      | Reconnecting   |
//! | Reconnecting   | `Connected`                        | Connected      |
//! | Reconnecting   | watchdog expired                   | FailedFatal    |
//! | any            | failure with `retrying: false`     | FailedFatal    |
//! | any            | shutdown                           | Disconnected   |

use std::sync::{atomic::AtomicBool, Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    config::MqttConfig,
    connection::ConnectionEvent,
    error::FatalError,
    readiness::{Readiness, ReadinessState},
    state::ConnectionState,
    subscription::SubscriptionManager,
    watchdog::Watchdog,
};

/// Side effects run after the subscriptions of a new session are in place.
///
/// `first` is true until the session has signalled readiness once.
#[async_trait]
pub trait SessionHook: Send + Sync + 'static {
    async fn on_session(&self, first: bool);
}

/// Owns the connection lifecycle of the single MQTT session.
pub struct ConnectionManager {
    events: mpsc::Receiver<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: SubscriptionManager,
    hooks: Vec<Arc<dyn SessionHook>>,
    readiness: Readiness,
    watchdog: Watchdog,
    connect_retries: u32,
    failed_attempts: u32,
    bring_up: Option<CancellationToken>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        events: mpsc::Receiver<ConnectionEvent>,
        config: &MqttConfig,
        subscriptions: SubscriptionManager,
        readiness: Readiness,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            events,
            state_tx,
            subscriptions,
            hooks: Vec::new(),
            readiness,
            watchdog: Watchdog::new(config.max_reconnect_wait()),
            connect_retries: config.connect_retries,
            failed_attempts: 0,
            bring_up: None,
            cancel,
        }
    }

    /// Adds a hook run at the end of every bring-up, in registration order.
    pub fn add_hook(&mut self, hook: Arc<dyn SessionHook>) {
        self.hooks.push(hook);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// True while a reconnect is being waited for.
    pub fn watchdog_active(&self) -> Arc<AtomicBool> {
        self.watchdog.active_flag()
    }

    /// Consumes events until shutdown or a fatal failure.
    ///
    /// Returns `Ok(())` on shutdown or when the event source is gone.
    pub async fn run(mut self) -> Result<(), FatalError> {
        self.set_state(ConnectionState::Connecting(0));

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.shutdown("shutdown requested");
                    return Ok(());
                }

                waited = self.watchdog.expired(), if self.watchdog.is_armed() => {
                    return Err(self.fail(FatalError::ReconnectTimeout { waited }));
                }

                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await?,
                    None => {
                        self.shutdown("connection event source closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: ConnectionEvent) -> Result<(), FatalError> {
        match event {
            ConnectionEvent::Connected => self.on_connected(),

            ConnectionEvent::ConnectFailed { reason, retrying } => {
                if !retrying {
                    return Err(self.fail(FatalError::ConnectionAbandoned { reason }));
                }

                self.failed_attempts += 1;
                if self.failed_attempts >= self.connect_retries {
                    return Err(self.fail(FatalError::ConnectRetriesExhausted {
                        attempts: self.failed_attempts,
                        reason,
                    }));
                }

                warn!(
                    attempt = self.failed_attempts,
                    max_attempts = self.connect_retries,
                    error = %reason,
                    "Unable to connect to MQTT broker"
                );
                self.set_state(ConnectionState::Connecting(self.failed_attempts));
            }

            ConnectionEvent::ConnectionLost { reason, retrying } => {
                if !retrying {
                    return Err(self.fail(FatalError::ConnectionAbandoned { reason }));
                }

                if matches!(*self.state_tx.borrow(), ConnectionState::Reconnecting(_)) {
                    debug!(error = %reason, "Reconnect attempt failed");
                    return Ok(());
                }

                warn!(error = %reason, "MQTT connection lost, waiting for automatic reconnect");
                self.cancel_bring_up();
                self.set_state(ConnectionState::Reconnecting(reason));
                self.watchdog.arm();
            }

            ConnectionEvent::Message { topic, payload } => {
                self.subscriptions.route(&topic, payload).await;
            }

            ConnectionEvent::SubscribeRejected { filter } => self.on_subscribe_rejected(filter),
        }
        Ok(())
    }

    /// Disarms the watchdog and restarts the bring-up for the new session.
    fn on_connected(&mut self) {
        if let Some(waited) = self.watchdog.disarm() {
            info!(waited_secs = waited.as_secs_f64(), "Reconnected to MQTT broker");
        }
        self.failed_attempts = 0;
        self.set_state(ConnectionState::Connected);

        self.cancel_bring_up();
        let token = self.cancel.child_token();
        self.bring_up = Some(token.clone());

        let subscriptions = self.subscriptions.clone();
        let hooks = self.hooks.clone();
        let readiness = self.readiness.clone();
        tokio::spawn(async move {
            if !subscriptions.subscribe_all(&token).await {
                debug!("Bring-up abandoned before subscriptions completed");
                return;
            }

            let first = readiness.current_state() == ReadinessState::Unknown;
            for hook in &hooks {
                if token.is_cancelled() {
                    debug!("Bring-up abandoned before session hooks completed");
                    return;
                }
                hook.on_session(first).await;
            }

            if !token.is_cancelled() && readiness.mark_ready() {
                info!("MQTT session ready");
            }
        });
    }

    /// Retries a rejected filter for as long as the current session lives.
    fn on_subscribe_rejected(&self, filter: String) {
        let Some(session) = self.bring_up.clone() else {
            debug!(topic = %filter, "Ignoring rejection outside of a session");
            return;
        };

        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            if !subscriptions.resubscribe(&filter, &session).await {
                debug!(topic = %filter, "Resubscribe abandoned");
            }
        });
    }

    fn cancel_bring_up(&mut self) {
        if let Some(previous) = self.bring_up.take() {
            previous.cancel();
        }
    }

    fn fail(&mut self, err: FatalError) -> FatalError {
        error!(error = %err, "MQTT session failed");
        self.cancel_bring_up();
        self.watchdog.disarm();
        self.set_state(ConnectionState::FailedFatal(err.to_string()));
        self.readiness.mark_failed(err.to_string());
        err
    }

    fn shutdown(&mut self, reason: &str) {
        info!(reason, "Connection manager stopping");
        self.cancel_bring_up();
        self.watchdog.disarm();
        self.set_state(ConnectionState::Disconnected(reason.to_string()));
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            info!(state = %state, "Connection state changed");
        }
    }
}

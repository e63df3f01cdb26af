//! Lifecycle of the adapter.
//!
//! `Driver` owns one MQTT session. `initialize` builds the decoder ring,
//! registers the incoming data listener, starts the session and waits for the
//! first bring-up. A supervisor task waits on the session and publishes its
//! fatal error, if any, through `fatal`. `stop` cancels the shared shutdown
//! token and closes the reading sink.

use std::sync::Arc;

use rsp_mqtt::{CommandDispatcher, FatalError, Reading, Session, TransferError};
use thiserror::Error;
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    decoder::{DecodeError, DecoderRing},
    host::{AsyncReadingSink, DeviceRegistry},
    incoming::IncomingListener,
};
use crate::config::properties::DriverConfig;

/// Device names with this prefix are sensors behind the controller.
const SENSOR_PREFIX: &str = "RSP";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver is not initialized")]
    NotInitialized,

    #[error("driver is already initialized")]
    AlreadyInitialized,

    #[error("MQTT error: {0}")]
    Transfer(#[from] TransferError),

    #[error("tag decoder configuration error: {0}")]
    Decoder(#[from] DecodeError),

    #[error("MQTT session failed: {0}")]
    Fatal(#[from] FatalError),

    #[error("MQTT session stopped before it was ready: {0}")]
    NotReady(String),

    #[error("session supervisor failed: {0}")]
    Supervisor(#[from] JoinError),
}

struct Started {
    dispatcher: CommandDispatcher,
    sink: Arc<dyn AsyncReadingSink>,
    supervisor: JoinHandle<()>,
    fatal_rx: watch::Receiver<Option<FatalError>>,
}

pub struct Driver {
    config: DriverConfig,
    registry: Arc<dyn DeviceRegistry>,
    cancel: CancellationToken,
    started: Option<Started>,
}

impl Driver {
    pub fn new(config: DriverConfig, registry: Arc<dyn DeviceRegistry>) -> Self {
        Self {
            config,
            registry,
            cancel: CancellationToken::new(),
            started: None,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Connects to the configured broker and waits until the session is ready.
    pub async fn initialize(&mut self, sink: Arc<dyn AsyncReadingSink>) -> Result<(), DriverError> {
        if self.started.is_some() {
            return Err(DriverError::AlreadyInitialized);
        }
        let session = Session::connect(self.config.mqtt.clone(), self.cancel.clone()).await?;
        self.start(session, sink).await
    }

    /// Same as `initialize`, on a session built by the caller.
    ///
    /// The session must have been created with `shutdown_token` so that
    /// `stop` reaches it.
    pub async fn initialize_with(
        &mut self,
        session: Session,
        sink: Arc<dyn AsyncReadingSink>,
    ) -> Result<(), DriverError> {
        if self.started.is_some() {
            return Err(DriverError::AlreadyInitialized);
        }
        self.start(session, sink).await
    }

    /// Token cancelled by `stop`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn start(
        &mut self,
        session: Session,
        sink: Arc<dyn AsyncReadingSink>,
    ) -> Result<(), DriverError> {
        let decoders = DecoderRing::from_config(&self.config.tags)?;
        if decoders.is_empty() {
            debug!("No tag decoders configured");
        } else {
            info!(decoders = decoders.len(), "Tag decoder ring ready");
        }

        let listener = IncomingListener::new(
            self.config.controller_name.clone(),
            Arc::new(decoders),
            Arc::clone(&self.registry),
            Arc::clone(&sink),
            session.announcer(),
        );
        session.register_incoming(Arc::new(listener)).await?;

        let readiness = session.readiness();
        let dispatcher = session.dispatcher();
        let handle = session.spawn();

        let (fatal_tx, fatal_rx) = watch::channel(None);
        let supervisor = tokio::spawn(async move {
            match handle.join().await {
                Ok(()) => debug!("MQTT session stopped"),
                Err(e) => {
                    error!(error = %e, "MQTT session failed");
                    fatal_tx.send_replace(Some(e));
                }
            }
        });

        self.started = Some(Started {
            dispatcher,
            sink,
            supervisor,
            fatal_rx,
        });

        match readiness.wait().await {
            Ok(()) => {
                info!(controller = %self.config.controller_name, "Driver initialized");
                Ok(())
            }
            Err(reason) => Err(match self.fatal().await {
                Some(fatal) => DriverError::Fatal(fatal),
                None => DriverError::NotReady(reason),
            }),
        }
    }

    /// Resolves with the session's fatal error.
    ///
    /// Returns `None` if the session stopped without one, or if the driver was
    /// never started.
    pub async fn fatal(&self) -> Option<FatalError> {
        let mut fatal_rx = self.started.as_ref()?.fatal_rx.clone();
        let fatal = fatal_rx.wait_for(Option::is_some).await.ok()?;
        fatal.clone()
    }

    /// Reads `resource` from the controller, or from sensor `device_name`
    /// when it names one.
    pub async fn handle_read_command(
        &self,
        resource: &str,
        device_name: &str,
    ) -> Result<Reading, DriverError> {
        let started = self.started.as_ref().ok_or(DriverError::NotInitialized)?;
        let target = device_name.starts_with(SENSOR_PREFIX).then_some(device_name);
        debug!(resource, device = device_name, "Handling read command");

        started
            .dispatcher
            .send_command(resource, target)
            .await
            .map_err(DriverError::from)
    }

    /// Stops the session and closes the reading sink.
    ///
    /// Unless `force` is set, waits for the session to shut down first and
    /// returns `DriverError::Supervisor` if the supervisor task panicked. The
    /// sink is closed in every case.
    pub async fn stop(&mut self, force: bool) -> Result<(), DriverError> {
        info!(force, "Stopping driver");
        self.cancel.cancel();

        let Some(started) = self.started.take() else {
            return Ok(());
        };
        let joined = if force {
            started.supervisor.abort();
            Ok(())
        } else {
            started.supervisor.await
        };
        started.sink.close().await;

        joined.map_err(|e| {
            warn!(error = %e, "Session supervisor failed");
            DriverError::from(e)
        })
    }
}

//! # rsp-mqtt: managed MQTT session with JSON-RPC request correlation
//!
//! An async MQTT session for talking to RSP controllers over a broker. Built
//! on top of `rumqttc`, this crate adds:
//!
//! - **Bounded initial connect** with a fixed retry delay and attempt budget
//! - **Reconnect watchdog** that fails the session when a lost connection is
//!   not restored in time
//! - **Subscription registry** restored on every (re)connect, with per-topic
//!   retry and wildcard routing to handlers
//! - **Request/response correlation** over a command and a response topic,
//!   with per-request deadlines and cancellation on shutdown
//! - **Readiness signal** raised once, after the first bring-up
//! - **Subscription rejections** from the broker retried per filter
//! - **TLS** verified against a CA bundle or the system roots, or unverified
//!
//! # Quick Start
//!
//! ```ignore
//! use rsp_mqtt::{MqttConfig, Session};
//! use tokio_util::sync::CancellationToken;
//!
//! let cancel = CancellationToken::new();
//! let session = Session::connect(MqttConfig::default(), cancel.clone()).await?;
//! let dispatcher = session.dispatcher();
//! let readiness = session.readiness();
//! let handle = session.spawn();
//!
//! readiness.wait().await?;
//! let reading = dispatcher.send_command("temperature", Some("RSP-150000")).await?;
//! println!("{} = {}", reading.resource_name, reading.value);
//!
//! cancel.cancel();
//! handle.join().await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Session / SessionHandle              │
//! │ CommandDispatcher, Announcer         │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │ ConnectionManager                    │
//! │ state, Watchdog, bring-up, Readiness │
//! │ SubscriptionManager ─► handlers      │
//! └────────────┬─────────────────────────┘
//!              │ ConnectionEvent (mpsc)
//! ┌────────────▼─────────────────────────┐
//! │ ConnectionKernel                     │
//! │ EventLoop::poll, retry delays        │
//! └────────────┬─────────────────────────┘
//!              │
//! ┌────────────▼─────────────────────────┐
//! │ rumqttc (TCP/TLS)                    │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! ```text
//! Connecting(n) ──(CONNACK)──► Connected ──(lost)──► Reconnecting
//!      │                           ▲                      │
//!  (budget spent)                  └──────(CONNACK)───────┤
//!      │                                                  │
//!      ▼                                          (watchdog expired)
//! FailedFatal ◄───────────────────────────────────────────┘
//! ```
//!
//! A `FatalError` returned from `SessionHandle::join` means the session is
//! gone for good; the hosting process is expected to exit.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod jsonrpc;
pub mod manager;
pub mod readiness;
pub mod response;
pub mod session;
pub mod state;
pub mod subscription;
pub mod topic;
pub mod transport;
pub mod watchdog;

// Re-exports: Configuration
pub use config::{MqttConfig, TlsConfig};
// Re-exports: Connection management
pub use connection::{ConnectionEvent, ConnectionKernel};
pub use manager::{ConnectionManager, SessionHook};
pub use session::{Announcer, Session, SessionHandle};
// Re-exports: Requests
pub use correlator::{CommandDispatcher, PendingRequests, Reading};
pub use jsonrpc::{Notification, Request, Response};
// Re-exports: Error handling
pub use error::{FatalError, TransferError};
// Re-exports: State monitoring
pub use readiness::{Readiness, ReadinessState};
pub use state::ConnectionState;
// Re-exports: Subscriptions
pub use subscription::{MessageHandler, SubscriptionManager};
pub use transport::{BrokerTransport, MqttTransport, SubscribeTracker};
#[cfg(any(test, feature = "test-util"))]
pub use transport::MemoryTransport;

pub use rumqttc::QoS;

/// Result type for MQTT operations.
pub type Result<T> = std::result::Result<T, TransferError>;

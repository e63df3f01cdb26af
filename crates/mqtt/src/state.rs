//! Connection state of the managed MQTT session.
//!
//! The connection manager is the only writer; everything else observes the
//! state through a `watch` channel.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting
//!                     |                           |
//!                     +-------> FailedFatal <-----+
//! ```
//!
//! Any state moves to `Disconnected` on shutdown.

use std::fmt;

/// Represents the current state of the managed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet, or shut down. The string is the reason.
    Disconnected(String),

    /// Initial connect in progress (including retries within the budget).
    ///
    /// The field counts failed attempts so far.
    Connecting(u32),

    /// CONNACK received; subscriptions are being (or have been) restored.
    Connected,

    /// The session was lost and the transport is reconnecting on its own.
    ///
    /// The reconnect watchdog is armed in this state.
    Reconnecting(String),

    /// Unrecoverable. The process is expected to exit.
    FailedFatal(String),
}

impl ConnectionState {
    /// Returns a short identifier for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Connecting(_) => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::FailedFatal(_) => "FailedFatal",
        }
    }

    /// Returns contextual details, empty when there are none.
    pub fn details(&self) -> String {
        match self {
            ConnectionState::Disconnected(reason)
            | ConnectionState::Reconnecting(reason)
            | ConnectionState::FailedFatal(reason) => reason.clone(),
            ConnectionState::Connecting(0) | ConnectionState::Connected => String::new(),
            ConnectionState::Connecting(failed) => format!("{failed} failed attempts"),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting(_) | ConnectionState::Reconnecting(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionState::FailedFatal(_))
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected("not started".into())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

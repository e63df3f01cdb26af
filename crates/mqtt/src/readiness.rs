//! Readiness signal of the managed session.
//!
//! The session becomes `Ready` once, after the first bring-up (subscriptions
//! restored, controller announced). Later reconnects do not signal again.
//! A fatal session failure moves it to `Failed`, which is terminal as well.

use std::fmt;

use tokio::sync::watch;
use tracing::debug;

/// Represents the current readiness state of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    /// No bring-up has completed yet.
    Unknown,
    /// The first bring-up completed.
    Ready,
    /// The session failed before or after becoming ready.
    Failed(String),
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReadinessState::Unknown => "Unknown",
            ReadinessState::Ready => "Ready",
            ReadinessState::Failed(_) => "Failed",
        }
    }

    /// Returns the failure reason, empty for other states.
    pub fn reason(&self) -> &str {
        match self {
            ReadinessState::Failed(reason) => reason,
            _ => "",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::Failed(reason) => write!(f, "Failed: {}", reason),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Shared readiness tracker. Clones observe and update the same state.
#[derive(Debug, Clone)]
pub struct Readiness {
    state_tx: watch::Sender<ReadinessState>,
}

impl Readiness {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ReadinessState::Unknown);
        Self { state_tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ReadinessState {
        self.state_tx.borrow().clone()
    }

    /// Moves `Unknown` to `Ready`. Returns false if the state had already left
    /// `Unknown`.
    pub fn mark_ready(&self) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == ReadinessState::Unknown {
                *state = ReadinessState::Ready;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("The readiness status has changed: Unknown -> Ready");
        }
        changed
    }

    /// Records a terminal failure. The first failure wins.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state_tx.send_if_modified(|state| {
            if matches!(state, ReadinessState::Failed(_)) {
                false
            } else {
                debug!("The readiness status has changed: {} -> Failed", state);
                *state = ReadinessState::Failed(reason);
                true
            }
        });
    }

    /// Waits until the state leaves `Unknown`.
    ///
    /// Returns `Ok(())` for `Ready` and the reason for `Failed`.
    pub async fn wait(&self) -> Result<(), String> {
        let mut state_rx = self.subscribe();
        let state = state_rx
            .wait_for(|state| *state != ReadinessState::Unknown)
            .await
            .map(|state| state.clone())
            .map_err(|_| "readiness tracker dropped".to_string())?;

        match state {
            ReadinessState::Failed(reason) => Err(reason),
            _ => Ok(()),
        }
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_state_as_str() {
        assert_eq!(ReadinessState::Ready.as_str(), "Ready");
        assert_eq!(ReadinessState::Unknown.as_str(), "Unknown");
        assert_eq!(ReadinessState::Failed("x".into()).as_str(), "Failed");
    }

    #[test]
    fn test_readiness_state_display() {
        assert_eq!(ReadinessState::Ready.to_string(), "Ready");
        assert_eq!(
            ReadinessState::Failed("watchdog".into()).to_string(),
            "Failed: watchdog"
        );
        assert_eq!(ReadinessState::Failed("watchdog".into()).reason(), "watchdog");
    }

    #[test]
    fn test_mark_ready_only_once() {
        let readiness = Readiness::new();
        assert!(readiness.mark_ready());
        assert!(!readiness.mark_ready());
        assert!(readiness.current_state().is_ready());
    }

    #[test]
    fn test_failure_is_terminal() {
        let readiness = Readiness::new();
        readiness.mark_failed("first");
        readiness.mark_failed("second");
        assert!(!readiness.mark_ready());
        assert_eq!(readiness.current_state(), ReadinessState::Failed("first".into()));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_ready() {
        let readiness = Readiness::new();
        let waiter = {
            let readiness = readiness.clone();
            tokio::spawn(async move { readiness.wait().await })
        };
        readiness.mark_ready();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_reports_failure() {
        let readiness = Readiness::new();
        readiness.mark_failed("unable to connect");
        assert_eq!(readiness.wait().await, Err("unable to connect".to_string()));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let readiness = Readiness::new();
        let mut rx1 = readiness.subscribe();
        let mut rx2 = readiness.subscribe();
        readiness.mark_ready();
        rx1.changed().await.unwrap();
        rx2.changed().await.unwrap();
        assert_eq!(*rx1.borrow(), ReadinessState::Ready);
        assert_eq!(*rx2.borrow(), ReadinessState::Ready);
    }
}

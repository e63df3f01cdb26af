//! Reconnect watchdog.
//!
//! Armed when an established session is lost, disarmed on the next CONNACK.
//! If it is still armed after `max_wait`, the connection manager fails the
//! session. While armed, a ticker at a tenth of `max_wait` logs that the
//! reconnect is still in progress.
//!
//! The watchdog is polled from the manager's `select!` loop rather than from
//! its own task, so arming and disarming never race with expiry.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{info, warn};

/// Upper bound of the progress ticker period.
const MAX_TICK: Duration = Duration::from_secs(3600);

/// Single-shot reconnect deadline with a progress ticker.
#[derive(Debug)]
pub struct Watchdog {
    max_wait: Duration,
    armed: Option<Armed>,
    active: Arc<AtomicBool>,
}

#[derive(Debug)]
struct Armed {
    since: Instant,
    // None when max_wait is beyond what the clock can represent
    deadline: Option<Instant>,
    ticker: Interval,
}

impl Watchdog {
    /// Creates a disarmed watchdog.
    pub fn new(max_wait: Duration) -> Self {
        Self {
            max_wait,
            armed: None,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Starts the countdown. Re-arming an armed watchdog keeps its deadline.
    pub fn arm(&mut self) {
        if self.armed.is_some() {
            return;
        }

        let since = Instant::now();
        let period = (self.max_wait / 10).clamp(Duration::from_millis(1), MAX_TICK);
        let mut ticker = time::interval_at(since + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = since.checked_add(self.max_wait);
        if deadline.is_none() {
            warn!(
                max_wait_secs = self.max_wait.as_secs(),
                "Reconnect wait out of range, watchdog will not expire"
            );
        }

        self.armed = Some(Armed {
            since,
            deadline,
            ticker,
        });
        self.active.store(true, Ordering::Release);
        warn!(
            max_wait_secs = self.max_wait.as_secs(),
            "Reconnect watchdog armed"
        );
    }

    /// Stops the countdown. Returns how long it was armed.
    pub fn disarm(&mut self) -> Option<Duration> {
        let armed = self.armed.take()?;
        self.active.store(false, Ordering::Release);
        let waited = armed.since.elapsed();
        info!(
            waited_secs = waited.as_secs_f64(),
            "Reconnect watchdog disarmed"
        );
        Some(waited)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Shared flag mirroring `is_armed`, readable from other tasks.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    /// Resolves when the deadline passes, logging progress until then.
    ///
    /// Pending forever while disarmed. Cancel-safe: dropping the future
    /// keeps the deadline.
    pub async fn expired(&mut self) -> Duration {
        let Some(armed) = self.armed.as_mut() else {
            return std::future::pending().await;
        };

        let Some(deadline) = armed.deadline else {
            loop {
                armed.ticker.tick().await;
                warn!(
                    waited_secs = armed.since.elapsed().as_secs(),
                    "Still waiting for MQTT reconnection"
                );
            }
        };

        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    return armed.since.elapsed();
                }
                _ = armed.ticker.tick() => {
                    let waited = armed.since.elapsed();
                    warn!(
                        waited_secs = waited.as_secs(),
                        max_wait_secs = self.max_wait.as_secs(),
                        "Still waiting for MQTT reconnection"
                    );
                }
            }
        }
    }
}

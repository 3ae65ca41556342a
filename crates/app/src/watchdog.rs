//! Driver liveness monitoring and restart signalling.
//!
//! The driver heartbeats once per cycle, including cycles that end in
//! `Unavailable`. Every blocking step in a cycle is individually bounded, so
//! a heartbeat older than the stale threshold means the loop is genuinely
//! wedged and the supervisor should recycle it. The same [`RestartState`]
//! also carries operator-requested restarts from the HTTP surface.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::error;

pub const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
pub const WATCHDOG_STALE_THRESHOLD_MS: u64 = 15_000;
pub const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

pub struct DriverHealth {
    last_beat: AtomicU64,
}

impl DriverHealth {
    pub fn new() -> Self {
        let grace_deadline = current_millis().saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            last_beat: AtomicU64::new(grace_deadline),
        }
    }

    pub fn beat(&self) {
        self.last_beat.store(current_millis(), Ordering::Relaxed);
    }

    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.last_beat.load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS
    }
}

impl Default for DriverHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot restart request consumed by the supervision loop.
pub struct RestartState {
    triggered: AtomicBool,
    reason: Mutex<Option<&'static str>>,
}

impl RestartState {
    pub fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    pub fn arm(&self, reason: &'static str) {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Consume the request, returning its reason.
    pub fn take(&self) -> Option<&'static str> {
        if self.triggered.swap(false, Ordering::SeqCst) {
            self.reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .or(Some("restart"))
        } else {
            None
        }
    }
}

impl Default for RestartState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn spawn_watchdog(
    health: Arc<DriverHealth>,
    restart: Arc<RestartState>,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("sitewatch-watchdog".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
                if health.is_stale(current_millis()) && !restart.is_triggered() {
                    error!("Watchdog detected a stalled pipeline; requesting restart");
                    metrics::counter!("sitewatch_watchdog_restarts_total").increment(1);
                    restart.arm("driver stalled");
                    health.beat();
                }
            }
        })
        .expect("failed to spawn watchdog thread")
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_request_is_consumed_exactly_once() {
        let restart = RestartState::new();
        assert!(restart.take().is_none());

        restart.arm("restart requested");
        assert!(restart.is_triggered());
        assert_eq!(restart.take(), Some("restart requested"));
        assert!(restart.take().is_none());
        assert!(!restart.is_triggered());
    }

    #[test]
    fn heartbeat_keeps_the_driver_fresh() {
        let health = DriverHealth::new();
        health.beat();
        assert!(!health.is_stale(current_millis()));
        assert!(health.is_stale(current_millis() + WATCHDOG_STALE_THRESHOLD_MS + 1));
    }
}

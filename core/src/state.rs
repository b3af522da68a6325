//! Published lifecycle state and the single-writer status stream.
//!
//! The supervisor is the only writer. Consumers receive read-only
//! [`ServiceSnapshot`] values through a `watch` channel and human-readable
//! log lines through a `broadcast` channel.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::watch;

use crate::config::RuntimeConfig;
use crate::config::StrategyKind;

const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Error => "error",
        }
    }

    /// A transition is in flight; new transitions must queue or no-op.
    pub fn is_transitioning(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Stopping)
    }

    pub fn is_active(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Running)
    }
}

/// Read-only view of the supervised service, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSnapshot {
    pub state: ServiceState,
    pub last_error: Option<String>,
    /// Only meaningful under the privileged strategy.
    pub pid: Option<u32>,
    /// Set only while `Running`; cleared on every transition away.
    pub started_at: Option<DateTime<Utc>>,
    pub port: u16,
    pub strategy: StrategyKind,
    pub urls: Vec<String>,
}

impl ServiceSnapshot {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            state: ServiceState::Stopped,
            last_error: None,
            pid: None,
            started_at: None,
            port: config.port,
            strategy: config.strategy,
            urls: Vec::new(),
        }
    }

    /// Applies a state change while maintaining the uptime invariant.
    pub(crate) fn set_state(&mut self, state: ServiceState) {
        if state == ServiceState::Running {
            if self.state != ServiceState::Running {
                self.started_at = Some(Utc::now());
            }
        } else {
            self.started_at = None;
        }
        self.state = state;
    }

    pub(crate) fn refresh_urls(&mut self, token: &str) {
        self.urls = reachable_urls(self.port, token);
    }
}

pub fn reachable_urls(port: u16, token: &str) -> Vec<String> {
    let base = format!("http://127.0.0.1:{port}/");
    if token.is_empty() {
        vec![base]
    } else {
        vec![format!("{base}?token={token}"), base]
    }
}

/// Shared between the supervisor, its strategies, and background monitors.
///
/// Carries the generation counter and the generation-guarded mutation helper
/// that keeps stale asynchronous callbacks from touching published state.
#[derive(Debug)]
pub(crate) struct Shared {
    generation: AtomicU64,
    tx: watch::Sender<ServiceSnapshot>,
    log_tx: broadcast::Sender<String>,
}

impl Shared {
    pub(crate) fn new(initial: ServiceSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        let (log_tx, _log_rx) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            generation: AtomicU64::new(0),
            tx,
            log_tx,
        }
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Increments the generation, invalidating every callback captured before.
    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn snapshot(&self) -> ServiceSnapshot {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ServiceSnapshot> {
        self.tx.subscribe()
    }

    pub(crate) fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.log_tx.subscribe()
    }

    pub(crate) fn update(&self, mutate: impl FnOnce(&mut ServiceSnapshot)) {
        self.tx.send_modify(mutate);
    }

    /// Applies `mutate` only if `generation` is still current. Returns whether
    /// the mutation ran. The check happens inside the watch critical section
    /// so a concurrent `next_generation` cannot slip between check and write.
    pub(crate) fn update_if_current(
        &self,
        generation: u64,
        mutate: impl FnOnce(&mut ServiceSnapshot),
    ) -> bool {
        let mut applied = false;
        self.tx.send_modify(|snapshot| {
            if self.generation.load(Ordering::SeqCst) == generation {
                mutate(snapshot);
                applied = true;
            }
        });
        applied
    }

    pub(crate) fn push_log(&self, line: impl Into<String>) {
        // Nobody listening is fine.
        let _ = self.log_tx.send(line.into());
    }
}

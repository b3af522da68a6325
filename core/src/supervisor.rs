//! The lifecycle supervisor: owns the state machine, the single transition
//! lock, the generation counter, and the hot-reload policy.
//!
//! Every lifecycle operation (`start`, `stop`, `restart`,
//! `apply_configuration`, `switch_strategy`) serializes on one mutex, so
//! transitions are totally ordered and requests queue instead of racing.
//! Background monitors only read published state and re-enter through the
//! public operations.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::command::PrivilegedRunner;
use crate::config::ConfigStore;
use crate::config::RuntimeConfig;
use crate::config::StrategyKind;
use crate::config::validate_port;
use crate::error::Result;
use crate::error::SupervisorError;
use crate::health;
use crate::state::ServiceSnapshot;
use crate::state::ServiceState;
use crate::state::Shared;
use crate::strategy::ExecutionStrategy;
use crate::strategy::LaunchSpec;
use crate::strategy::ProcessStrategy;
use crate::strategy::ServiceEntry;
use crate::strategy::StartContext;
use crate::strategy::ThreadStrategy;
use crate::watcher::WorkDirChange;
use crate::watcher::WorkDirWatcher;
use crate::workdir;
use crate::workdir::ReleaseProvider;
use crate::workdir::WorkDirLayout;
use crate::workdir::WorkDirSync;

const DEFAULT_PID_FILE: &str = "berth.pid";

/// Every wait in a lifecycle transition is bounded by one of these.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimeouts {
    pub poll_interval: Duration,
    /// Primary readiness deadline after a start is dispatched.
    pub start_primary: Duration,
    /// One extension granted after the primary deadline, with a warning.
    pub start_extension: Duration,
    pub stop: Duration,
    /// Window in which several hot-reload requests collapse into one.
    pub reload_debounce: Duration,
    /// Minimum spacing between two accepted hot reloads.
    pub reload_min_interval: Duration,
    /// Suppression window set immediately after a reload is issued.
    pub reload_suppress: Duration,
}

impl Default for SupervisorTimeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            start_primary: Duration::from_secs(30),
            start_extension: Duration::from_secs(15),
            stop: Duration::from_secs(15),
            reload_debounce: Duration::from_millis(400),
            reload_min_interval: Duration::from_secs(5),
            reload_suppress: Duration::from_secs(3),
        }
    }
}

/// Everything the privileged strategy needs to exist.
pub struct PrivilegedSettings {
    pub runner: PrivilegedRunner,
    /// User-editable work directory.
    pub user_workdir: PathBuf,
    /// Privileged-owned mirror the service actually runs from.
    pub system_workdir: PathBuf,
    /// Defaults to `<system_workdir>/berth.pid`.
    pub pid_file: Option<PathBuf>,
    /// Owner for the permission normalization pass, e.g. `root:root`.
    pub owner: Option<String>,
    pub launch: LaunchSpec,
}

#[derive(Default)]
struct ReloadState {
    last_reload: Option<Instant>,
    suppress_until: Option<Instant>,
    /// A debounced reload is already scheduled; new requests collapse into it.
    pending: bool,
}

struct Inner {
    shared: Arc<Shared>,
    transition: Mutex<()>,
    store: Arc<dyn ConfigStore>,
    release: Arc<dyn ReleaseProvider>,
    unprivileged: Option<Arc<dyn ExecutionStrategy>>,
    privileged: Option<Arc<dyn ExecutionStrategy>>,
    timeouts: SupervisorTimeouts,
    config: StdMutex<RuntimeConfig>,
    reload: StdMutex<ReloadState>,
    /// Set for the stop half of a restart so a stop timeout is suppressed:
    /// the caller starts again immediately and its readiness probe decides.
    restart_in_flight: AtomicBool,
}

pub struct SupervisorBuilder {
    store: Arc<dyn ConfigStore>,
    release: Arc<dyn ReleaseProvider>,
    timeouts: SupervisorTimeouts,
    entry: Option<Arc<dyn ServiceEntry>>,
    privileged: Option<PrivilegedSettings>,
    override_unprivileged: Option<Arc<dyn ExecutionStrategy>>,
    override_privileged: Option<Arc<dyn ExecutionStrategy>>,
}

impl SupervisorBuilder {
    pub fn new(store: Arc<dyn ConfigStore>, release: Arc<dyn ReleaseProvider>) -> Self {
        Self {
            store,
            release,
            timeouts: SupervisorTimeouts::default(),
            entry: None,
            privileged: None,
            override_unprivileged: None,
            override_privileged: None,
        }
    }

    pub fn timeouts(mut self, timeouts: SupervisorTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The in-process service body for the unprivileged strategy.
    pub fn service_entry(mut self, entry: Arc<dyn ServiceEntry>) -> Self {
        self.entry = Some(entry);
        self
    }

    pub fn privileged(mut self, settings: PrivilegedSettings) -> Self {
        self.privileged = Some(settings);
        self
    }

    /// Replaces a strategy wholesale; used by embedders and tests.
    pub fn override_strategy(
        mut self,
        kind: StrategyKind,
        strategy: Arc<dyn ExecutionStrategy>,
    ) -> Self {
        match kind {
            StrategyKind::Unprivileged => self.override_unprivileged = Some(strategy),
            StrategyKind::Privileged => self.override_privileged = Some(strategy),
        }
        self
    }

    /// Builds the supervisor, reconstructing the initial state by probing
    /// whether the configured port is already reachable. That covers service
    /// survival across supervisor restarts.
    pub async fn build(self) -> Supervisor {
        let config = self.store.load_runtime_config();
        let mut snapshot = ServiceSnapshot::new(&config);
        snapshot.refresh_urls(&config.token);
        if health::probe(config.port).await {
            info!(
                port = config.port,
                "port already reachable at boot; restoring Running state"
            );
            snapshot.state = ServiceState::Running;
            snapshot.started_at = self
                .store
                .last_started_at()
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|t| t.with_timezone(&Utc))
                .or_else(|| Some(Utc::now()));
        }
        let shared = Arc::new(Shared::new(snapshot));

        let unprivileged: Option<Arc<dyn ExecutionStrategy>> =
            self.override_unprivileged.or_else(|| {
                self.entry.map(|entry| {
                    Arc::new(ThreadStrategy::new(entry, Arc::clone(&shared)))
                        as Arc<dyn ExecutionStrategy>
                })
            });
        let privileged: Option<Arc<dyn ExecutionStrategy>> =
            self.override_privileged.or_else(|| {
                self.privileged.map(|settings| {
                    let pid_file = settings
                        .pid_file
                        .unwrap_or_else(|| settings.system_workdir.join(DEFAULT_PID_FILE));
                    let sync = WorkDirSync::new(
                        settings.runner.clone(),
                        WorkDirLayout::new(settings.user_workdir),
                        WorkDirLayout::new(settings.system_workdir),
                        settings.owner,
                    );
                    Arc::new(ProcessStrategy::new(
                        settings.runner,
                        sync,
                        pid_file,
                        settings.launch,
                        Arc::clone(&shared),
                    )) as Arc<dyn ExecutionStrategy>
                })
            });

        Supervisor {
            inner: Arc::new(Inner {
                shared,
                transition: Mutex::new(()),
                store: self.store,
                release: self.release,
                unprivileged,
                privileged,
                timeouts: self.timeouts,
                config: StdMutex::new(config),
                reload: StdMutex::new(ReloadState::default()),
                restart_in_flight: AtomicBool::new(false),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn snapshot(&self) -> ServiceSnapshot {
        self.inner.shared.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceSnapshot> {
        self.inner.shared.subscribe()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<String> {
        self.inner.shared.subscribe_logs()
    }

    pub fn config(&self) -> RuntimeConfig {
        self.current_config()
    }

    pub async fn start(&self) -> Result<()> {
        let _gate = self.inner.transition.lock().await;
        self.start_locked().await
    }

    pub async fn stop(&self) -> Result<()> {
        let _gate = self.inner.transition.lock().await;
        self.stop_locked().await
    }

    /// Disallowed while a transition is already in flight (no-op); otherwise
    /// stop-then-start with phase-distinct errors.
    pub async fn restart(&self) -> Result<()> {
        let _gate = self.inner.transition.lock().await;
        let state = self.inner.shared.snapshot().state;
        if state.is_transitioning() {
            debug!("restart ignored while {state:?}");
            return Ok(());
        }
        if matches!(state, ServiceState::Stopped | ServiceState::Error) {
            return self.start_locked().await;
        }

        self.inner.restart_in_flight.store(true, Ordering::SeqCst);
        let stop_result = self.stop_locked().await;
        self.inner.restart_in_flight.store(false, Ordering::SeqCst);
        stop_result?;
        self.start_locked().await
    }

    /// No-op when nothing changed. When active and `restart_if_active`, runs
    /// an atomic stop→persist→start; a stop failure aborts the whole
    /// operation without persisting, so the running configuration is kept.
    pub async fn apply_configuration(
        &self,
        port: u16,
        token: &str,
        restart_if_active: bool,
    ) -> Result<()> {
        let _gate = self.inner.transition.lock().await;
        let current = self.current_config();
        if current.port == port && current.token == token {
            return Ok(());
        }
        validate_port(port, current.strategy)?;
        let updated = RuntimeConfig {
            port,
            token: token.to_string(),
            ..current
        };

        let active = self.inner.shared.snapshot().state.is_active();
        if !active {
            self.persist_config(&updated)?;
            self.inner.shared.update(|snapshot| {
                snapshot.port = port;
                snapshot.refresh_urls(token);
            });
            return Ok(());
        }
        if !restart_if_active {
            self.persist_config(&updated)?;
            self.inner
                .shared
                .push_log("configuration saved; takes effect on next restart".to_string());
            return Ok(());
        }

        self.stop_locked().await?;
        self.persist_config(&updated)?;
        self.inner.shared.update(|snapshot| {
            snapshot.port = port;
            snapshot.refresh_urls(token);
        });
        self.start_locked().await
    }

    /// Stop-wait-switch, then start again if the service had been active.
    pub async fn switch_strategy(&self, kind: StrategyKind) -> Result<()> {
        let _gate = self.inner.transition.lock().await;
        let current = self.current_config();
        if current.strategy == kind {
            return Ok(());
        }
        validate_port(current.port, kind)?;

        let was_active = self.inner.shared.snapshot().state.is_active();
        if was_active {
            self.stop_locked().await?;
        }
        let updated = RuntimeConfig {
            strategy: kind,
            ..current
        };
        self.persist_config(&updated)?;
        self.inner.shared.update(|snapshot| snapshot.strategy = kind);
        self.inner
            .shared
            .push_log(format!("execution strategy switched to {kind}"));
        if was_active {
            self.start_locked().await
        } else {
            Ok(())
        }
    }

    /// Rate-limited, debounced entry point for the filesystem watcher and the
    /// fingerprint monitor. Accepted requests run as `restart()` after the
    /// debounce window.
    pub fn request_hot_reload(&self, reason: &str) {
        if self.inner.shared.snapshot().state != ServiceState::Running {
            debug!("hot reload ignored; service not running ({reason})");
            return;
        }
        let timeouts = self.inner.timeouts;
        let now = Instant::now();
        {
            let Ok(mut reload) = self.inner.reload.lock() else {
                return;
            };
            if let Some(until) = reload.suppress_until
                && now < until
            {
                debug!("hot reload suppressed; post-reload window active ({reason})");
                return;
            }
            if let Some(last) = reload.last_reload
                && now.duration_since(last) < timeouts.reload_min_interval
            {
                debug!("hot reload suppressed; minimum interval not elapsed ({reason})");
                return;
            }
            if reload.pending {
                debug!("hot reload collapsed into pending reload ({reason})");
                return;
            }
            reload.pending = true;
        }

        info!("hot reload scheduled: {reason}");
        self.inner
            .shared
            .push_log(format!("hot reload scheduled: {reason}"));
        let this = self.clone();
        tokio::spawn(async move {
            sleep(timeouts.reload_debounce).await;
            {
                if let Ok(mut reload) = this.inner.reload.lock() {
                    reload.pending = false;
                    let now = Instant::now();
                    reload.last_reload = Some(now);
                    reload.suppress_until = Some(now + timeouts.reload_suppress);
                }
            }
            if let Err(err) = this.restart().await {
                warn!("hot reload restart failed: {err}");
            }
        });
    }

    /// Re-probes while Running and reports an unexpected exit. Reads first,
    /// then conditionally mutates under a generation guard.
    pub fn spawn_liveness_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if this.inner.shared.snapshot().state != ServiceState::Running {
                    continue;
                }
                let generation = this.inner.shared.current_generation();
                let config = this.current_config();
                if health::probe(config.port).await {
                    continue;
                }
                let Ok(strategy) = this.strategy_for(config.strategy) else {
                    continue;
                };
                if strategy.is_running(&config).await {
                    continue;
                }
                let applied = this.inner.shared.update_if_current(generation, |snapshot| {
                    snapshot.set_state(ServiceState::Error);
                    snapshot.last_error = Some("service exited unexpectedly".to_string());
                });
                if applied {
                    warn!("service exited unexpectedly");
                    this.inner
                        .shared
                        .push_log("service exited unexpectedly".to_string());
                    this.persist_last_state();
                }
            }
        })
    }

    /// Detects out-of-band changes to the privileged mirror, which the
    /// filesystem watcher cannot see. `interval` doubles as the minimum
    /// recomputation spacing.
    pub fn spawn_fingerprint_monitor(
        &self,
        workdir: PathBuf,
        interval: Duration,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut last: Option<String> = None;
            loop {
                sleep(interval).await;
                if this.inner.shared.snapshot().state != ServiceState::Running {
                    last = None;
                    continue;
                }
                let dir = workdir.clone();
                let computed =
                    tokio::task::spawn_blocking(move || workdir::fingerprint(&dir)).await;
                let Ok(Ok(current)) = computed else {
                    continue;
                };
                if let Some(previous) = &last
                    && *previous != current
                {
                    this.request_hot_reload("work directory fingerprint changed");
                }
                last = Some(current);
            }
        })
    }

    /// Consumes watcher events: extends the watch to new subdirectories and
    /// funnels changes into the hot-reload policy.
    pub fn attach_watcher(
        &self,
        watcher: WorkDirWatcher,
        mut changes: mpsc::UnboundedReceiver<WorkDirChange>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let absolute = watcher.root().join(&change.relative_path);
                if absolute.is_dir() {
                    watcher.track_subdirectory(&absolute);
                }
                this.request_hot_reload(&format!("changed: {}", change.relative_path));
            }
            watcher.stop();
        })
    }

    fn current_config(&self) -> RuntimeConfig {
        self.inner
            .config
            .lock()
            .map(|config| config.clone())
            .unwrap_or_default()
    }

    fn strategy_for(&self, kind: StrategyKind) -> Result<Arc<dyn ExecutionStrategy>> {
        let strategy = match kind {
            StrategyKind::Unprivileged => self.inner.unprivileged.as_ref(),
            StrategyKind::Privileged => self.inner.privileged.as_ref(),
        };
        strategy
            .cloned()
            .ok_or(SupervisorError::StrategyUnavailable { kind })
    }

    fn persist_config(&self, updated: &RuntimeConfig) -> Result<()> {
        self.inner.store.save_runtime_config(updated)?;
        if let Ok(mut config) = self.inner.config.lock() {
            *config = updated.clone();
        }
        Ok(())
    }

    fn persist_last_state(&self) {
        let snapshot = self.inner.shared.snapshot();
        let started_at = snapshot.started_at.map(|t| t.to_rfc3339());
        if let Err(err) = self
            .inner
            .store
            .save_last_state(snapshot.state.as_str(), started_at.as_deref())
        {
            warn!("failed to persist last known state: {err}");
        }
    }

    /// Converts a failure into the Error state plus message. With a
    /// generation, the mutation is discarded if a newer attempt has begun.
    fn fail(&self, generation: Option<u64>, err: &SupervisorError) {
        let message = err.to_string();
        let applied = match generation {
            Some(generation) => {
                let msg = message.clone();
                self.inner.shared.update_if_current(generation, |snapshot| {
                    snapshot.set_state(ServiceState::Error);
                    snapshot.last_error = Some(msg);
                })
            }
            None => {
                let msg = message.clone();
                self.inner.shared.update(|snapshot| {
                    snapshot.set_state(ServiceState::Error);
                    snapshot.last_error = Some(msg);
                });
                true
            }
        };
        if applied {
            self.inner.shared.push_log(format!("error: {message}"));
            self.persist_last_state();
        }
    }

    async fn start_locked(&self) -> Result<()> {
        let state = self.inner.shared.snapshot().state;
        if matches!(state, ServiceState::Running | ServiceState::Starting) {
            debug!("start ignored; already {state:?}");
            return Ok(());
        }

        let config = self.current_config();
        // Configuration errors are rejected synchronously with no state
        // change; the message is still surfaced for the UI.
        if let Err(err) = config.validate() {
            let message = err.to_string();
            self.inner.shared.update(|snapshot| {
                snapshot.last_error = Some(message.clone());
            });
            self.inner.shared.push_log(format!("error: {message}"));
            return Err(err);
        }
        if !self.inner.release.payload_valid(config.channel) {
            let err = SupervisorError::InvalidPayload {
                channel: config.channel.to_string(),
                detail: "entry file not found".to_string(),
            };
            self.fail(None, &err);
            return Err(err);
        }
        let strategy = self.strategy_for(config.strategy)?;

        let generation = self.inner.shared.next_generation();
        self.inner.shared.update(|snapshot| {
            snapshot.last_error = None;
            snapshot.pid = None;
            snapshot.port = config.port;
            snapshot.strategy = config.strategy;
            snapshot.refresh_urls(&config.token);
            snapshot.set_state(ServiceState::Starting);
        });
        self.inner.shared.push_log(format!(
            "starting service on port {} ({} strategy)",
            config.port, config.strategy
        ));

        if let Err(err) = strategy
            .start(StartContext {
                config: config.clone(),
                generation,
            })
            .await
        {
            self.fail(Some(generation), &err);
            return Err(err);
        }

        self.wait_ready(generation, &config, strategy.as_ref()).await
    }

    /// Readiness loop: fixed-interval health probes up to the primary
    /// deadline, extended exactly once, evaluated only while `generation` is
    /// still current.
    async fn wait_ready(
        &self,
        generation: u64,
        config: &RuntimeConfig,
        strategy: &dyn ExecutionStrategy,
    ) -> Result<()> {
        let timeouts = &self.inner.timeouts;
        let started = Instant::now();
        let mut deadline = started + timeouts.start_primary;
        let mut extended = false;

        loop {
            if self.inner.shared.current_generation() != generation {
                // A newer attempt owns the state now.
                return Ok(());
            }
            let snapshot = self.inner.shared.snapshot();
            match snapshot.state {
                ServiceState::Starting => {}
                // The strategy reported a crash while we were waiting.
                ServiceState::Error => {
                    let detail = snapshot
                        .last_error
                        .unwrap_or_else(|| "service failed during startup".to_string());
                    return Err(SupervisorError::crash(detail));
                }
                ServiceState::Stopped => {
                    return Err(SupervisorError::crash(
                        "service exited before becoming ready",
                    ));
                }
                ServiceState::Running | ServiceState::Stopping => return Ok(()),
            }

            if health::probe(config.port).await {
                let pid = strategy.pid();
                let applied = self.inner.shared.update_if_current(generation, |snapshot| {
                    snapshot.set_state(ServiceState::Running);
                    if pid.is_some() {
                        snapshot.pid = pid;
                    }
                });
                if applied {
                    info!(port = config.port, "service is running");
                    self.inner.shared.push_log("service is running".to_string());
                    self.persist_last_state();
                }
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                if !extended {
                    extended = true;
                    deadline = now + timeouts.start_extension;
                    warn!(
                        "service not ready after {:?}; extending the deadline once",
                        timeouts.start_primary
                    );
                } else {
                    let err = SupervisorError::StartTimeout {
                        port: config.port,
                        waited_ms: started.elapsed().as_millis() as u64,
                    };
                    self.fail(Some(generation), &err);
                    return Err(err);
                }
            }
            sleep(timeouts.poll_interval).await;
        }
    }

    async fn stop_locked(&self) -> Result<()> {
        let state = self.inner.shared.snapshot().state;
        if matches!(state, ServiceState::Stopped | ServiceState::Stopping) {
            debug!("stop ignored; already {state:?}");
            return Ok(());
        }
        let config = self.current_config();
        let strategy = self.strategy_for(config.strategy)?;

        self.inner
            .shared
            .update(|snapshot| snapshot.set_state(ServiceState::Stopping));
        self.inner.shared.push_log("stopping service".to_string());

        if let Err(err) = strategy.stop(&config).await {
            self.fail(None, &err);
            return Err(err);
        }

        let timeouts = &self.inner.timeouts;
        let started = Instant::now();
        loop {
            let strategy_stopped = !strategy.is_running(&config).await;
            let port_closed = !health::probe(config.port).await;
            if strategy_stopped && port_closed {
                self.inner.shared.update(|snapshot| {
                    snapshot.set_state(ServiceState::Stopped);
                    snapshot.pid = None;
                });
                self.inner.shared.push_log("service stopped".to_string());
                self.persist_last_state();
                return Ok(());
            }
            if started.elapsed() >= timeouts.stop {
                if self.inner.restart_in_flight.load(Ordering::SeqCst) {
                    // The caller starts again immediately; its readiness
                    // probe decides the outcome instead of this timeout.
                    debug!("stop timeout suppressed; restart in flight");
                    return Ok(());
                }
                let err = SupervisorError::StopTimeout {
                    port: config.port,
                    waited_ms: started.elapsed().as_millis() as u64,
                };
                self.fail(None, &err);
                return Err(err);
            }
            sleep(timeouts.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct MemStore {
        values: StdMutex<BTreeMap<String, String>>,
    }

    impl ConfigStore for MemStore {
        fn get(&self, key: &str) -> Option<String> {
            self.values.lock().ok()?.get(key).cloned()
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            if let Ok(mut values) = self.values.lock() {
                values.insert(key.to_string(), value.to_string());
            }
            Ok(())
        }
    }

    struct AlwaysValid;

    impl ReleaseProvider for AlwaysValid {
        fn payload_dir(&self, _channel: crate::config::ReleaseChannel) -> PathBuf {
            PathBuf::from("/nonexistent")
        }

        fn payload_valid(&self, _channel: crate::config::ReleaseChannel) -> bool {
            true
        }
    }

    /// Becomes "ready" by binding the configured port after `ready_delay`,
    /// unless `bind` is false (a service that never comes up).
    struct StubStrategy {
        kind: StrategyKind,
        starts: AtomicU32,
        stops: AtomicU32,
        bind: AtomicBool,
        /// When false the strategy ignores `stop` and keeps the port bound,
        /// emulating a service that is unresponsive to shutdown.
        release_on_stop: bool,
        ready_delay: Duration,
        listener: Arc<Mutex<Option<TcpListener>>>,
    }

    impl StubStrategy {
        fn new(kind: StrategyKind, bind: bool, ready_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                kind,
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                bind: AtomicBool::new(bind),
                release_on_stop: true,
                ready_delay,
                listener: Arc::new(Mutex::new(None)),
            })
        }

        fn unstoppable(kind: StrategyKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                bind: AtomicBool::new(true),
                release_on_stop: false,
                ready_delay: Duration::ZERO,
                listener: Arc::new(Mutex::new(None)),
            })
        }

        async fn simulate_crash(&self) {
            self.listener.lock().await.take();
        }
    }

    #[async_trait]
    impl ExecutionStrategy for StubStrategy {
        fn kind(&self) -> StrategyKind {
            self.kind
        }

        async fn start(&self, ctx: StartContext) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.bind.load(Ordering::SeqCst) {
                let slot = Arc::clone(&self.listener);
                let delay = self.ready_delay;
                let port = ctx.config.port;
                tokio::spawn(async move {
                    sleep(delay).await;
                    if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
                        *slot.lock().await = Some(listener);
                    }
                });
            }
            Ok(())
        }

        async fn stop(&self, _config: &RuntimeConfig) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.release_on_stop {
                self.listener.lock().await.take();
            }
            Ok(())
        }

        async fn is_running(&self, _config: &RuntimeConfig) -> bool {
            self.listener.lock().await.is_some()
        }
    }

    fn fast_timeouts() -> SupervisorTimeouts {
        SupervisorTimeouts {
            poll_interval: Duration::from_millis(20),
            start_primary: Duration::from_millis(400),
            start_extension: Duration::from_millis(200),
            stop: Duration::from_millis(500),
            reload_debounce: Duration::from_millis(100),
            reload_min_interval: Duration::from_millis(600),
            reload_suppress: Duration::from_millis(250),
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr").port()
    }

    async fn build_supervisor(
        port: u16,
        stub: Arc<StubStrategy>,
    ) -> (Supervisor, Arc<MemStore>) {
        let store = Arc::new(MemStore::default());
        store.set("port", &port.to_string()).expect("seed port");
        let supervisor = SupervisorBuilder::new(store.clone(), Arc::new(AlwaysValid))
            .timeouts(fast_timeouts())
            .override_strategy(StrategyKind::Unprivileged, stub)
            .build()
            .await;
        (supervisor, store)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_transitions_to_running_when_the_probe_succeeds() {
        let port = free_port().await;
        let stub = StubStrategy::new(
            StrategyKind::Unprivileged,
            true,
            Duration::from_millis(100),
        );
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        supervisor.start().await.expect("start");

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, ServiceState::Running);
        assert!(snapshot.started_at.is_some());
        assert_eq!(snapshot.last_error, None);
        assert_eq!(stub.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_is_idempotent_while_running() {
        let port = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        supervisor.start().await.expect("first start");
        let before = supervisor.snapshot();
        supervisor.start().await.expect("second start");

        assert_eq!(supervisor.snapshot(), before);
        assert_eq!(stub.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_starts_dispatch_the_strategy_once() {
        let port = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let sup = supervisor.clone();
            handles.push(tokio::spawn(async move { sup.start().await }));
        }
        for handle in handles {
            handle.await.expect("join").expect("start");
        }

        assert_eq!(supervisor.snapshot().state, ServiceState::Running);
        assert_eq!(stub.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_is_idempotent_while_stopped() {
        let port = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        supervisor.stop().await.expect("stop while stopped");
        assert_eq!(supervisor.snapshot().state, ServiceState::Stopped);
        assert_eq!(stub.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn privileged_port_fails_fast_without_invoking_the_strategy() {
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(443, stub.clone()).await;

        let err = supervisor.start().await.expect_err("must fail fast");
        assert!(matches!(
            err,
            SupervisorError::PrivilegedPort { port: 443, .. }
        ));

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, ServiceState::Stopped, "no state change");
        assert!(snapshot.last_error.is_some());
        assert_eq!(stub.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_timeout_is_deterministic() {
        let port = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, false, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        let timeouts = fast_timeouts();
        let started = std::time::Instant::now();
        let err = supervisor.start().await.expect_err("must time out");
        let elapsed = started.elapsed();

        assert!(matches!(err, SupervisorError::StartTimeout { .. }));
        assert_eq!(supervisor.snapshot().state, ServiceState::Error);
        // primary + one extension + scheduling slack, never an indefinite hang
        let budget = timeouts.start_primary + timeouts.start_extension + Duration::from_secs(2);
        assert!(elapsed < budget, "took {elapsed:?}, budget {budget:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_recovers_from_error() {
        let port = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, false, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        supervisor.start().await.expect_err("first start times out");
        assert_eq!(supervisor.snapshot().state, ServiceState::Error);

        stub.bind.store(true, Ordering::SeqCst);
        supervisor.restart().await.expect("restart from error");
        assert_eq!(supervisor.snapshot().state, ServiceState::Running);
        assert_eq!(supervisor.snapshot().last_error, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_timeout_is_suppressed_while_a_restart_is_in_flight() {
        let port = free_port().await;
        let stub = StubStrategy::unstoppable(StrategyKind::Unprivileged);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        supervisor.start().await.expect("start");

        // The service ignores the stop request and keeps the port bound. The
        // restart must not surface the stop timeout; the new attempt's
        // readiness probe decides the outcome instead.
        supervisor.restart().await.expect("restart");
        assert_eq!(supervisor.snapshot().state, ServiceState::Running);
        assert_eq!(stub.starts.load(Ordering::SeqCst), 2, "re-dispatched");
        assert_eq!(stub.stops.load(Ordering::SeqCst), 1);

        // Outside a restart the same stuck stop is an error.
        let err = supervisor.stop().await.expect_err("stop must time out");
        assert!(matches!(err, SupervisorError::StopTimeout { .. }));
        assert_eq!(supervisor.snapshot().state, ServiceState::Error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn apply_configuration_restarts_with_the_new_port() {
        let port_a = free_port().await;
        let port_b = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, store) = build_supervisor(port_a, stub.clone()).await;

        supervisor.start().await.expect("start");
        supervisor
            .apply_configuration(port_b, "abc", true)
            .await
            .expect("apply configuration");

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, ServiceState::Running);
        assert_eq!(snapshot.port, port_b);
        assert_eq!(snapshot.urls[0], format!("http://127.0.0.1:{port_b}/?token=abc"));
        assert_eq!(stub.stops.load(Ordering::SeqCst), 1);
        assert_eq!(stub.starts.load(Ordering::SeqCst), 2);
        assert_eq!(store.get("port").as_deref(), Some(port_b.to_string().as_str()));
        assert_eq!(store.get("token").as_deref(), Some("abc"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn apply_configuration_without_restart_persists_only() {
        let port_a = free_port().await;
        let port_b = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, store) = build_supervisor(port_a, stub.clone()).await;

        supervisor.start().await.expect("start");
        supervisor
            .apply_configuration(port_b, "", false)
            .await
            .expect("apply configuration");

        // Still running on the old port; the new one takes effect later.
        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, ServiceState::Running);
        assert_eq!(snapshot.port, port_a);
        assert_eq!(store.get("port").as_deref(), Some(port_b.to_string().as_str()));
        assert_eq!(stub.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unchanged_configuration_is_a_no_op() {
        let port = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        supervisor.start().await.expect("start");
        supervisor
            .apply_configuration(port, "", true)
            .await
            .expect("no-op apply");
        assert_eq!(stub.starts.load(Ordering::SeqCst), 1);
        assert_eq!(stub.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn switch_strategy_stops_then_starts_under_the_new_one() {
        let port = free_port().await;
        let unpriv = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let priv_stub = StubStrategy::new(StrategyKind::Privileged, true, Duration::ZERO);

        let store = Arc::new(MemStore::default());
        store.set("port", &port.to_string()).expect("seed port");
        let supervisor = SupervisorBuilder::new(store.clone(), Arc::new(AlwaysValid))
            .timeouts(fast_timeouts())
            .override_strategy(StrategyKind::Unprivileged, unpriv.clone())
            .override_strategy(StrategyKind::Privileged, priv_stub.clone())
            .build()
            .await;

        supervisor.start().await.expect("start");
        supervisor
            .switch_strategy(StrategyKind::Privileged)
            .await
            .expect("switch");

        assert_eq!(unpriv.stops.load(Ordering::SeqCst), 1);
        assert_eq!(priv_stub.starts.load(Ordering::SeqCst), 1);
        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, ServiceState::Running);
        assert_eq!(snapshot.strategy, StrategyKind::Privileged);
        assert_eq!(store.get("strategy").as_deref(), Some("privileged"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn switch_strategy_to_same_kind_is_a_no_op() {
        let port = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        supervisor.start().await.expect("start");
        supervisor
            .switch_strategy(StrategyKind::Unprivileged)
            .await
            .expect("no-op switch");
        assert_eq!(stub.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rapid_hot_reload_requests_collapse_into_one_restart() {
        let port = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        supervisor.start().await.expect("start");
        assert_eq!(stub.starts.load(Ordering::SeqCst), 1);

        // Two changes within the debounce window must yield one restart.
        supervisor.request_hot_reload("main.js changed");
        sleep(Duration::from_millis(30)).await;
        supervisor.request_hot_reload("main.js changed again");

        sleep(Duration::from_millis(400)).await;
        assert_eq!(stub.starts.load(Ordering::SeqCst), 2);
        assert_eq!(stub.stops.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.snapshot().state, ServiceState::Running);

        // Still inside the minimum-interval window; must be rejected, not
        // queued.
        supervisor.request_hot_reload("too soon");
        sleep(Duration::from_millis(150)).await;
        assert_eq!(stub.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hot_reload_is_ignored_unless_running() {
        let port = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        supervisor.request_hot_reload("while stopped");
        sleep(Duration::from_millis(300)).await;
        assert_eq!(stub.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn boot_restores_running_state_when_the_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();

        let store = Arc::new(MemStore::default());
        store.set("port", &port.to_string()).expect("seed port");
        let supervisor = SupervisorBuilder::new(store, Arc::new(AlwaysValid))
            .timeouts(fast_timeouts())
            .build()
            .await;

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.state, ServiceState::Running);
        assert!(snapshot.started_at.is_some());
        drop(listener);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn liveness_monitor_reports_an_unexpected_exit() {
        let port = free_port().await;
        let stub = StubStrategy::new(StrategyKind::Unprivileged, true, Duration::ZERO);
        let (supervisor, _store) = build_supervisor(port, stub.clone()).await;

        supervisor.start().await.expect("start");
        let monitor = supervisor.spawn_liveness_monitor(Duration::from_millis(50));

        stub.simulate_crash().await;

        let mut rx = supervisor.subscribe();
        let saw_error = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if rx.borrow().state == ServiceState::Error {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(saw_error.is_ok(), "monitor never reported the exit");
        assert_eq!(
            supervisor.snapshot().last_error.as_deref(),
            Some("service exited unexpectedly")
        );
        monitor.abort();
    }
}

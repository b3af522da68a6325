//! Unprivileged execution: the service runs on a worker thread inside the
//! host process.

use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tracing::info;
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::config::StrategyKind;
use crate::error::Result;
use crate::error::SupervisorError;
use crate::state::ServiceState;
use crate::state::Shared;
use crate::strategy::ExecutionStrategy;
use crate::strategy::ServiceEntry;
use crate::strategy::StartContext;

const MAX_ERROR_DETAIL: usize = 300;

pub(crate) struct ThreadStrategy {
    entry: Arc<dyn ServiceEntry>,
    shared: Arc<Shared>,
    alive: Arc<AtomicBool>,
}

impl ThreadStrategy {
    pub(crate) fn new(entry: Arc<dyn ServiceEntry>, shared: Arc<Shared>) -> Self {
        Self {
            entry,
            shared,
            alive: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for ThreadStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Unprivileged
    }

    async fn start(&self, ctx: StartContext) -> Result<()> {
        // The supervisor rejects a second start while one is alive before it
        // reaches the strategy; this is the backstop.
        if self.alive.load(Ordering::SeqCst) {
            return Err(SupervisorError::crash(
                "a service worker thread is already alive",
            ));
        }

        let StartContext { config, generation } = ctx;
        let entry = Arc::clone(&self.entry);
        let shared = Arc::clone(&self.shared);
        let alive = Arc::clone(&self.alive);
        alive.store(true, Ordering::SeqCst);

        let spawned = std::thread::Builder::new()
            .name("berth-service".to_string())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| entry.run(&config)));
                alive.store(false, Ordering::SeqCst);

                let fault = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(sanitize(&err.to_string())),
                    Err(panic) => Some(sanitize(&panic_detail(panic.as_ref()))),
                };

                // Exits for a stale generation belong to a superseded start
                // attempt and are silently ignored.
                match fault {
                    None => {
                        let applied = shared.update_if_current(generation, |snapshot| {
                            snapshot.set_state(ServiceState::Stopped);
                        });
                        if applied {
                            info!("service worker thread exited cleanly");
                            shared.push_log("service exited".to_string());
                        }
                    }
                    Some(detail) => {
                        let applied = shared.update_if_current(generation, |snapshot| {
                            snapshot.set_state(ServiceState::Error);
                            snapshot.last_error = Some(detail.clone());
                        });
                        if applied {
                            warn!("service worker thread crashed: {detail}");
                            shared.push_log(format!("service crashed: {detail}"));
                        }
                    }
                }
            });

        if let Err(error) = spawned {
            self.alive.store(false, Ordering::SeqCst);
            return Err(SupervisorError::Io(error));
        }
        Ok(())
    }

    async fn stop(&self, _config: &RuntimeConfig) -> Result<()> {
        // Rust threads cannot be interrupted; the entry's shutdown hook is
        // the mechanism, and the supervisor's polling decides success.
        self.entry.request_shutdown();
        Ok(())
    }

    async fn is_running(&self, _config: &RuntimeConfig) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn sanitize(detail: &str) -> String {
    let first_line = detail.lines().next().unwrap_or("unknown failure").trim();
    let mut out: String = first_line.chars().take(MAX_ERROR_DETAIL).collect();
    if out.is_empty() {
        out.push_str("unknown failure");
    }
    out
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic in service worker thread".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServiceSnapshot;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct BlockingEntry {
        stop_requested: Arc<AtomicBool>,
        runs: AtomicU32,
    }

    impl BlockingEntry {
        fn new() -> Self {
            Self {
                stop_requested: Arc::new(AtomicBool::new(false)),
                runs: AtomicU32::new(0),
            }
        }
    }

    impl ServiceEntry for BlockingEntry {
        fn run(
            &self,
            _config: &RuntimeConfig,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            while !self.stop_requested.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        }

        fn request_shutdown(&self) {
            self.stop_requested.store(true, Ordering::SeqCst);
        }
    }

    struct FailingEntry {
        gate: Arc<AtomicBool>,
    }

    impl FailingEntry {
        fn immediate() -> Self {
            Self {
                gate: Arc::new(AtomicBool::new(true)),
            }
        }

        fn gated() -> (Self, Arc<AtomicBool>) {
            let gate = Arc::new(AtomicBool::new(false));
            (
                Self {
                    gate: Arc::clone(&gate),
                },
                gate,
            )
        }
    }

    impl ServiceEntry for FailingEntry {
        fn run(
            &self,
            _config: &RuntimeConfig,
        ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            while !self.gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err("boom\nsecret stack frame".into())
        }

        fn request_shutdown(&self) {}
    }

    fn shared() -> Arc<Shared> {
        Arc::new(Shared::new(ServiceSnapshot::new(&RuntimeConfig::default())))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clean_exit_reports_stopped_for_the_current_generation() {
        let shared = shared();
        let entry = Arc::new(BlockingEntry::new());
        let strategy = ThreadStrategy::new(entry.clone(), Arc::clone(&shared));

        let generation = shared.next_generation();
        let config = RuntimeConfig::default();
        strategy
            .start(StartContext {
                config: config.clone(),
                generation,
            })
            .await
            .expect("start");
        wait_for(|| entry.runs.load(Ordering::SeqCst) == 1).await;

        strategy.stop(&config).await.expect("stop");
        wait_for(|| shared.snapshot().state == ServiceState::Stopped).await;
        assert_eq!(shared.snapshot().last_error, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crash_publishes_a_sanitized_error() {
        let shared = shared();
        let strategy = ThreadStrategy::new(Arc::new(FailingEntry::immediate()), Arc::clone(&shared));

        let generation = shared.next_generation();
        strategy
            .start(StartContext {
                config: RuntimeConfig::default(),
                generation,
            })
            .await
            .expect("start");

        wait_for(|| shared.snapshot().state == ServiceState::Error).await;
        let snapshot = shared.snapshot();
        assert_eq!(snapshot.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_generation_exit_is_ignored() {
        let shared = shared();
        let (entry, gate) = FailingEntry::gated();
        let strategy = ThreadStrategy::new(Arc::new(entry), Arc::clone(&shared));

        let stale = shared.next_generation();
        strategy
            .start(StartContext {
                config: RuntimeConfig::default(),
                generation: stale,
            })
            .await
            .expect("start");
        // A newer start attempt supersedes the one above before it crashes.
        let _current = shared.next_generation();
        gate.store(true, Ordering::SeqCst);

        wait_for(|| !strategy.alive.load(Ordering::SeqCst)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shared.snapshot().state, ServiceState::Stopped);
        assert_eq!(shared.snapshot().last_error, None);
    }
}

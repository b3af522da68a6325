//! Privileged execution: the service runs as a separate OS process, launched
//! through the privileged command executor and tracked by PID file.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::command::PrivilegedRunner;
use crate::command::ShellCommand;
use crate::command::Signal;
use crate::config::RuntimeConfig;
use crate::config::StrategyKind;
use crate::error::Result;
use crate::error::SupervisorError;
use crate::health;
use crate::state::Shared;
use crate::strategy::ExecutionStrategy;
use crate::strategy::SHUTDOWN_PATH;
use crate::strategy::StartContext;
use crate::workdir::WorkDirSync;
use std::sync::Arc;

const LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);
const PID_FILE_WAIT: Duration = Duration::from_secs(3);
const PID_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PID_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Wait after the graceful shutdown request before escalating to SIGTERM.
const GRACEFUL_WAIT: Duration = Duration::from_secs(2);
/// Wait after SIGTERM before escalating to SIGKILL.
const TERM_WAIT: Duration = Duration::from_secs(2);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How the secondary entry point is launched. With no override the strategy
/// re-enters the application's own executable.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: Option<PathBuf>,
}

pub(crate) struct ProcessStrategy {
    runner: PrivilegedRunner,
    sync: WorkDirSync,
    pid_file: PathBuf,
    launch: LaunchSpec,
    shared: Arc<Shared>,
    /// Resolved launch program, cached after the first successful lookup.
    program: OnceLock<PathBuf>,
    /// Last PID observed from the pid file; 0 means none.
    last_pid: AtomicU32,
}

impl ProcessStrategy {
    pub(crate) fn new(
        runner: PrivilegedRunner,
        sync: WorkDirSync,
        pid_file: PathBuf,
        launch: LaunchSpec,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            runner,
            sync,
            pid_file,
            launch,
            shared,
            program: OnceLock::new(),
            last_pid: AtomicU32::new(0),
        }
    }

    fn resolve_program(&self) -> Result<PathBuf> {
        if let Some(program) = self.program.get() {
            return Ok(program.clone());
        }
        let resolved = match &self.launch.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|error| SupervisorError::LaunchProgram { error })?,
        };
        let _ = self.program.set(resolved.clone());
        Ok(resolved)
    }

    async fn read_pid(&self) -> Option<u32> {
        let output = self
            .runner
            .run(&ShellCommand::cat(&self.pid_file), PID_COMMAND_TIMEOUT)
            .await
            .ok()?;
        if !output.ok() {
            // Missing or unreadable pid file means "not running".
            return None;
        }
        output.stdout.text.trim().parse().ok()
    }

    async fn pid_alive(&self, pid: u32) -> bool {
        match self
            .runner
            .run(&ShellCommand::pid_alive(pid), PID_COMMAND_TIMEOUT)
            .await
        {
            Ok(output) => output.ok(),
            Err(_) => false,
        }
    }

    /// PID-reuse defense: the process is only ours if its command line still
    /// names our pid file.
    async fn pid_matches_entry(&self, pid: u32) -> bool {
        match self
            .runner
            .run(&ShellCommand::read_cmdline(pid), PID_COMMAND_TIMEOUT)
            .await
        {
            Ok(output) if output.ok() => cmdline_matches(
                &output.stdout.text,
                &self.pid_file.to_string_lossy(),
            ),
            _ => false,
        }
    }

    async fn graceful_shutdown_request(&self, config: &RuntimeConfig) {
        let url = format!("http://127.0.0.1:{}{}", config.port, SHUTDOWN_PATH);
        let client = reqwest::Client::new();
        let mut request = client.get(&url).timeout(SHUTDOWN_REQUEST_TIMEOUT);
        if !config.token.is_empty() {
            request = request.query(&[("token", config.token.as_str())]);
        }
        match request.send().await {
            Ok(response) => debug!("shutdown request returned {}", response.status()),
            Err(err) => debug!("shutdown request failed: {err}"),
        }
    }

    async fn signal(&self, pid: u32, signal: Signal) {
        match self
            .runner
            .run(&ShellCommand::kill(signal, pid), PID_COMMAND_TIMEOUT)
            .await
        {
            Ok(output) if !output.ok() => {
                // Most likely the process is already gone.
                debug!(pid, "kill command exited with {}", output.exit_code);
            }
            Ok(_) => {}
            Err(err) => warn!(pid, "failed to signal process: {err}"),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for ProcessStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Privileged
    }

    async fn start(&self, ctx: StartContext) -> Result<()> {
        let StartContext { config, generation } = ctx;

        // Surface privilege problems before anything destructive happens.
        self.runner.check_elevated_access().await?;
        self.sync.sync_for_start().await?;

        let program = self.resolve_program()?;
        let entry = self.sync.system_layout().entry_path();
        let mut args = vec![
            "serve".to_string(),
            "--entry".to_string(),
            entry.to_string_lossy().into_owned(),
            "--pid-file".to_string(),
            self.pid_file.to_string_lossy().into_owned(),
            "--port".to_string(),
            config.port.to_string(),
        ];
        if !config.token.is_empty() {
            args.push("--token".to_string());
            args.push(config.token.clone());
        }

        let command = ShellCommand::launch_detached(&program, &args);
        let output = self.runner.run(&command, LAUNCH_TIMEOUT).await?;
        if !output.ok() {
            let stderr = output.stderr.text.trim().to_string();
            return Err(SupervisorError::crash(if stderr.is_empty() {
                format!("launch command exited with code {}", output.exit_code)
            } else {
                format!("launch failed: {stderr}")
            }));
        }
        info!(port = config.port, "service process dispatched");

        // The spawned process writes its own PID; poll briefly for it. A
        // missing pid file is not fatal here, the health probe still decides
        // readiness.
        let mut waited = Duration::ZERO;
        while waited < PID_FILE_WAIT {
            if let Some(pid) = self.read_pid().await {
                self.last_pid.store(pid, Ordering::SeqCst);
                self.shared.update_if_current(generation, |snapshot| {
                    snapshot.pid = Some(pid);
                });
                return Ok(());
            }
            sleep(PID_POLL_INTERVAL).await;
            waited += PID_POLL_INTERVAL;
        }
        warn!("pid file did not appear within {PID_FILE_WAIT:?}");
        Ok(())
    }

    async fn stop(&self, config: &RuntimeConfig) -> Result<()> {
        self.graceful_shutdown_request(config).await;
        if health::wait_unreachable(config.port, GRACEFUL_WAIT, STOP_POLL_INTERVAL).await {
            self.last_pid.store(0, Ordering::SeqCst);
            return Ok(());
        }

        let Some(pid) = self.read_pid().await else {
            // Unresponsive but no pid to signal; the supervisor's polling
            // will report the stop timeout.
            return Ok(());
        };

        info!(pid, "service unresponsive to shutdown request; sending SIGTERM");
        self.signal(pid, Signal::Term).await;
        if health::wait_unreachable(config.port, TERM_WAIT, STOP_POLL_INTERVAL).await {
            self.last_pid.store(0, Ordering::SeqCst);
            return Ok(());
        }

        warn!(pid, "service survived SIGTERM; sending SIGKILL");
        self.signal(pid, Signal::Kill).await;
        self.last_pid.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn is_running(&self, config: &RuntimeConfig) -> bool {
        // Fast path: the liveness signal both strategies share.
        if health::probe(config.port).await {
            return true;
        }
        // Slow path, e.g. right after a crash: the pid file's process must be
        // alive and still be our entry point.
        let Some(pid) = self.read_pid().await else {
            return false;
        };
        self.pid_alive(pid).await && self.pid_matches_entry(pid).await
    }

    fn pid(&self) -> Option<u32> {
        match self.last_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

fn cmdline_matches(cmdline: &str, pid_file: &str) -> bool {
    cmdline.contains(pid_file) && cmdline.contains("serve")
}

//! `berth run`: the long-lived supervisor process.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
use berth_core::DirectoryReleaseProvider;
use berth_core::Elevation;
use berth_core::LaunchSpec;
use berth_core::PrivilegedRunner;
use berth_core::PrivilegedSettings;
use berth_core::StrategyKind;
use berth_core::Supervisor;
use berth_core::SupervisorBuilder;
use berth_core::TomlConfigStore;
use berth_core::WorkDirWatcher;
use berth_core::workdir::ENTRY_FILE;
use clap::Parser;
use tracing::error;
use tracing::info;

use crate::service::DemoService;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
const FINGERPRINT_INTERVAL: Duration = Duration::from_secs(10);

const PLACEHOLDER_PAYLOAD: &str = "// placeholder payload; replace with a real release\n";

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Override the configured port before starting.
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the configured access token before starting.
    #[arg(long)]
    pub token: Option<String>,

    /// Elevation wrapper for the privileged strategy: none, su or sudo.
    #[arg(long, default_value = "su", value_parser = parse_elevation)]
    pub elevation: Elevation,
}

pub fn parse_elevation(value: &str) -> Result<Elevation, String> {
    match value {
        "none" => Ok(Elevation::None),
        "su" => Ok(Elevation::Su),
        "sudo" => Ok(Elevation::Sudo),
        other => Err(format!("unknown elevation {other:?}; expected none, su or sudo")),
    }
}

/// Filesystem layout under the state directory.
pub struct HomeLayout {
    pub config: PathBuf,
    pub user_workdir: PathBuf,
    pub system_workdir: PathBuf,
    pub releases: PathBuf,
}

impl HomeLayout {
    pub fn new(home: &Path) -> Self {
        Self {
            config: home.join("config.toml"),
            user_workdir: home.join("workdir"),
            system_workdir: home.join("system"),
            releases: home.join("releases"),
        }
    }
}

/// Creates the state directories and seeds a placeholder payload so a fresh
/// installation starts out of the box.
fn prepare_home(layout: &HomeLayout) -> anyhow::Result<()> {
    std::fs::create_dir_all(&layout.user_workdir)?;
    let stable = layout.releases.join("stable");
    std::fs::create_dir_all(&stable)?;

    let payload_entry = stable.join(ENTRY_FILE);
    if !payload_entry.is_file() {
        std::fs::write(&payload_entry, PLACEHOLDER_PAYLOAD)?;
    }
    let workdir_entry = layout.user_workdir.join(ENTRY_FILE);
    if !workdir_entry.is_file() {
        std::fs::copy(&payload_entry, &workdir_entry)?;
    }
    Ok(())
}

/// Supervisor without execution strategies, enough for read-only commands
/// that only need boot-time state reconstruction.
pub async fn bare_supervisor(home: &Path) -> anyhow::Result<Supervisor> {
    let layout = HomeLayout::new(home);
    let store = Arc::new(
        TomlConfigStore::open(&layout.config)
            .with_context(|| format!("failed to open {}", layout.config.display()))?,
    );
    let release = Arc::new(DirectoryReleaseProvider::new(&layout.releases));
    Ok(SupervisorBuilder::new(store, release).build().await)
}

/// Supervisor with only the privileged strategy, for controlling a detached
/// service process from a second `berth` invocation. The unprivileged
/// service lives inside `berth run` and cannot be driven from here.
pub async fn control_supervisor(home: &Path, elevation: Elevation) -> anyhow::Result<Supervisor> {
    let layout = HomeLayout::new(home);
    let store = Arc::new(
        TomlConfigStore::open(&layout.config)
            .with_context(|| format!("failed to open {}", layout.config.display()))?,
    );
    let release = Arc::new(DirectoryReleaseProvider::new(&layout.releases));
    let supervisor = SupervisorBuilder::new(store, release)
        .privileged(PrivilegedSettings {
            runner: PrivilegedRunner::new(elevation),
            user_workdir: layout.user_workdir,
            system_workdir: layout.system_workdir,
            pid_file: None,
            owner: None,
            launch: LaunchSpec::default(),
        })
        .build()
        .await;
    if supervisor.config().strategy != StrategyKind::Privileged {
        bail!(
            "the configured strategy is unprivileged; the service runs inside \
             'berth run' and must be stopped there"
        );
    }
    Ok(supervisor)
}

pub async fn run(home: &Path, args: RunArgs) -> anyhow::Result<()> {
    let layout = HomeLayout::new(home);
    prepare_home(&layout).with_context(|| format!("failed to prepare {}", home.display()))?;

    let store = Arc::new(
        TomlConfigStore::open(&layout.config)
            .with_context(|| format!("failed to open {}", layout.config.display()))?,
    );
    let release = Arc::new(DirectoryReleaseProvider::new(&layout.releases));
    let entry = Arc::new(DemoService::new(layout.user_workdir.join(ENTRY_FILE)));

    let supervisor = SupervisorBuilder::new(store, release)
        .service_entry(entry)
        .privileged(PrivilegedSettings {
            runner: PrivilegedRunner::new(args.elevation),
            user_workdir: layout.user_workdir.clone(),
            system_workdir: layout.system_workdir.clone(),
            pid_file: None,
            owner: None,
            launch: LaunchSpec::default(),
        })
        .build()
        .await;

    if args.port.is_some() || args.token.is_some() {
        let current = supervisor.config();
        let port = args.port.unwrap_or(current.port);
        let token = args.token.unwrap_or(current.token);
        supervisor
            .apply_configuration(port, &token, false)
            .await
            .context("failed to apply configuration overrides")?;
    }

    let (watcher, changes) = WorkDirWatcher::start(&layout.user_workdir)
        .context("failed to watch the work directory")?;
    let watcher_task = supervisor.attach_watcher(watcher, changes);
    let liveness = supervisor.spawn_liveness_monitor(LIVENESS_INTERVAL);
    let fingerprint = (supervisor.config().strategy == StrategyKind::Privileged).then(|| {
        supervisor.spawn_fingerprint_monitor(layout.system_workdir.clone(), FINGERPRINT_INTERVAL)
    });

    if let Err(err) = supervisor.start().await {
        if err.is_privilege_error() {
            bail!("{err}\ncheck that the configured elevation command works non-interactively");
        }
        return Err(err).context("failed to start the service");
    }
    for url in &supervisor.snapshot().urls {
        info!("service available at {url}");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    if let Err(err) = supervisor.stop().await {
        error!("stop failed: {err}");
    }
    liveness.abort();
    if let Some(task) = fingerprint {
        task.abort();
    }
    watcher_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn prepare_home_seeds_payload_and_workdir() {
        let home = TempDir::new().expect("tempdir");
        let layout = HomeLayout::new(home.path());
        prepare_home(&layout).expect("prepare");

        assert!(layout.releases.join("stable").join(ENTRY_FILE).is_file());
        assert!(layout.user_workdir.join(ENTRY_FILE).is_file());

        // A second run must not clobber user edits.
        let entry = layout.user_workdir.join(ENTRY_FILE);
        std::fs::write(&entry, "// edited").expect("write");
        prepare_home(&layout).expect("prepare again");
        let text = std::fs::read_to_string(&entry).expect("read");
        assert_eq!(text, "// edited");
    }

    #[test]
    fn elevation_values_parse() {
        assert_eq!(parse_elevation("none"), Ok(Elevation::None));
        assert_eq!(parse_elevation("su"), Ok(Elevation::Su));
        assert_eq!(parse_elevation("sudo"), Ok(Elevation::Sudo));
        assert!(parse_elevation("doas").is_err());
    }
}

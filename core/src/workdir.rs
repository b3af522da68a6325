//! Work-directory layout, the privileged mirror sync, and the fingerprint
//! used to detect out-of-band changes the filesystem watcher cannot see.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::UNIX_EPOCH;

use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::info;
use walkdir::WalkDir;

use crate::command::CommandOutput;
use crate::command::PrivilegedRunner;
use crate::command::ShellCommand;
use crate::config::ReleaseChannel;
use crate::error::Result;
use crate::error::SupervisorError;

/// Entry script the managed service is started from.
pub const ENTRY_FILE: &str = "main.js";
/// The service's own key-value configuration file.
pub const CONFIG_FILE: &str = "config.json";
/// Variant-specific payload subtree, installed per release channel.
pub const PAYLOAD_DIR: &str = "dist";
/// Dependency payload; written by the service's own tooling.
pub const MODULES_DIR: &str = "node_modules";
pub const LOGS_DIR: &str = "logs";
pub const CACHE_DIR: &str = "cache";
/// Version marker maintained by the update installer.
pub const VERSION_MARKER: &str = ".release-version";

const SYNC_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Housekeeping paths the watcher and fingerprint skip to avoid feedback
/// loops from the service's own log/cache writes.
pub fn is_housekeeping_path(relative: &Path) -> bool {
    let Some(first) = relative.components().next() else {
        return false;
    };
    let first = first.as_os_str();
    first == VERSION_MARKER || first == LOGS_DIR || first == CACHE_DIR || first == MODULES_DIR
}

#[derive(Debug, Clone)]
pub struct WorkDirLayout {
    root: PathBuf,
}

impl WorkDirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self) -> PathBuf {
        self.root.join(ENTRY_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn payload_path(&self) -> PathBuf {
        self.root.join(PAYLOAD_DIR)
    }
}

/// Supplies the installed service payload per channel. The supervisor only
/// reads this before a start; installing or removing payload is someone
/// else's job.
pub trait ReleaseProvider: Send + Sync {
    fn payload_dir(&self, channel: ReleaseChannel) -> PathBuf;

    /// Structural validity: the entry file must be present.
    fn payload_valid(&self, channel: ReleaseChannel) -> bool {
        self.payload_dir(channel).join(ENTRY_FILE).is_file()
    }
}

/// Payload trees laid out as `<base>/<channel>/`.
#[derive(Debug, Clone)]
pub struct DirectoryReleaseProvider {
    base: PathBuf,
}

impl DirectoryReleaseProvider {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl ReleaseProvider for DirectoryReleaseProvider {
    fn payload_dir(&self, channel: ReleaseChannel) -> PathBuf {
        self.base.join(channel.as_str())
    }
}

/// Aggregate fingerprint of a directory tree: SHA-256 over every file's
/// relative path, mtime, and size, in sorted order. Housekeeping paths are
/// skipped. Two trees with identical fingerprints have seen no relevant
/// out-of-band edits.
pub fn fingerprint(root: &Path) -> std::io::Result<String> {
    let mut entries: Vec<(String, u64, u64)> = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(std::io::Error::other)?;
        if is_housekeeping_path(relative) {
            continue;
        }
        let metadata = entry.metadata().map_err(std::io::Error::other)?;
        let mtime = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        entries.push((
            relative.to_string_lossy().into_owned(),
            mtime.as_nanos() as u64,
            metadata.len(),
        ));
    }
    entries.sort();

    let mut hasher = Sha256::new();
    for (path, mtime, size) in entries {
        hasher.update(path.as_bytes());
        hasher.update(mtime.to_le_bytes());
        hasher.update(size.to_le_bytes());
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Mirrors the user-editable work directory into the privileged-owned tree.
///
/// First bootstrap is a full copy. Afterwards the copy is incremental and
/// deliberately leaves the payload subtree and the local configuration file
/// alone, then syncs just the configuration file explicitly and backfills the
/// payload subtree if it is missing. Ownership and read/execute bits are
/// normalized after every sync so a privilege-dropped supervisor can still
/// read and launch the mirror.
pub struct WorkDirSync {
    runner: PrivilegedRunner,
    user: WorkDirLayout,
    system: WorkDirLayout,
    owner: Option<String>,
}

impl WorkDirSync {
    pub fn new(
        runner: PrivilegedRunner,
        user: WorkDirLayout,
        system: WorkDirLayout,
        owner: Option<String>,
    ) -> Self {
        Self {
            runner,
            user,
            system,
            owner,
        }
    }

    pub fn system_layout(&self) -> &WorkDirLayout {
        &self.system
    }

    pub async fn sync_for_start(&self) -> Result<()> {
        let bootstrapped = self.system_entry_exists().await?;
        if bootstrapped {
            debug!("incremental work directory sync");
            self.run_sync(&ShellCommand::copy_tree_excluding(
                self.user.root(),
                self.system.root(),
                &[PAYLOAD_DIR, CONFIG_FILE],
            ))
            .await?;
            self.run_sync(&ShellCommand::copy_file(
                &self.user.config_path(),
                &self.system.config_path(),
            ))
            .await?;
            if !self.system_payload_exists().await? {
                info!("payload subtree missing in mirror; backfilling");
                self.run_sync(&ShellCommand::copy_tree(
                    &self.user.payload_path(),
                    &self.system.payload_path(),
                ))
                .await?;
            }
        } else {
            info!("bootstrapping privileged work directory mirror");
            self.run_sync(&ShellCommand::copy_tree(
                self.user.root(),
                self.system.root(),
            ))
            .await?;
        }
        self.normalize_permissions().await
    }

    async fn normalize_permissions(&self) -> Result<()> {
        if let Some(owner) = &self.owner {
            self.run_sync(&ShellCommand::chown_recursive(owner, self.system.root()))
                .await?;
        }
        self.run_sync(&ShellCommand::chmod_recursive("a+rX", self.system.root()))
            .await
    }

    async fn system_entry_exists(&self) -> Result<bool> {
        self.probe(&format!(
            "test -f {}",
            shell_quote(&self.system.entry_path())
        ))
        .await
    }

    async fn system_payload_exists(&self) -> Result<bool> {
        self.probe(&format!(
            "test -d {}",
            shell_quote(&self.system.payload_path())
        ))
        .await
    }

    async fn probe(&self, command: &str) -> Result<bool> {
        let output = self.runner.run(command, SYNC_COMMAND_TIMEOUT).await?;
        Ok(output.ok())
    }

    async fn run_sync(&self, command: &str) -> Result<()> {
        let output = self.runner.run(command, SYNC_COMMAND_TIMEOUT).await?;
        if output.ok() {
            Ok(())
        } else {
            Err(sync_failure(command, &output))
        }
    }
}

fn sync_failure(command: &str, output: &CommandOutput) -> SupervisorError {
    let stderr = output.stderr.text.trim();
    let detail = if output.timed_out {
        format!("'{command}' timed out")
    } else if stderr.is_empty() {
        format!("'{command}' exited with code {}", output.exit_code)
    } else {
        format!("'{command}' failed: {stderr}")
    };
    SupervisorError::sync(detail)
}

fn shell_quote(path: &Path) -> String {
    match shlex::try_quote(&path.to_string_lossy()) {
        Ok(quoted) => quoted.into_owned(),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}

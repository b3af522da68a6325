//! Executes a single shell command under privilege elevation, with bounded
//! output capture and a hard timeout.
//!
//! This is the primitive the privileged execution strategy is built on. The
//! elevation prefix is injectable so the same code path runs unelevated in
//! tests and on hosts without `su`.

use std::borrow::Cow;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::warn;

use crate::error::Result;
use crate::error::SupervisorError;

/// Byte ceiling per captured stream; bytes beyond it are discarded and the
/// stream is marked truncated.
pub const MAX_CAPTURE_BYTES: usize = 64 * 1024;

const READ_CHUNK_SIZE: usize = 8192;

// Conventional shell exit codes; hardcoded rather than pulling them from libc.
const EXEC_TIMEOUT_EXIT_CODE: i32 = 124;
const EXIT_CODE_SIGNAL_BASE: i32 = 128;

/// Grace period between the polite termination signal and the forced kill.
const KILL_GRACE: Duration = Duration::from_millis(500);

const PRIVILEGE_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn ok(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// How a command line is wrapped before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elevation {
    /// `sh -c <command>`; no elevation. Used in tests and by the
    /// access check fallback.
    None,
    /// `su -c <command>`, the default on the target platform.
    Su,
    /// `sudo sh -c <command>`.
    Sudo,
}

#[derive(Debug, Clone)]
pub struct PrivilegedRunner {
    elevation: Elevation,
}

impl Default for PrivilegedRunner {
    fn default() -> Self {
        Self {
            elevation: Elevation::Su,
        }
    }
}

impl PrivilegedRunner {
    pub fn new(elevation: Elevation) -> Self {
        Self { elevation }
    }

    /// Runs one shell command to completion, or until `deadline` expires.
    ///
    /// On timeout the child gets a polite termination signal, a short grace
    /// period, and then a forced kill, so no shell invocation can block the
    /// supervisor forever even under elevated-access stalls.
    pub async fn run(&self, command: &str, deadline: Duration) -> Result<CommandOutput> {
        // Defensive, not a security boundary: a command with embedded NUL or
        // CR bytes was assembled incorrectly and must not reach the shell.
        if command.contains('\0') || command.contains('\r') {
            return Err(SupervisorError::CommandRejected {
                reason: "command contains NUL or CR bytes".to_string(),
            });
        }

        let mut cmd = match &self.elevation {
            Elevation::None => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(command);
                c
            }
            Elevation::Su => {
                let mut c = Command::new("su");
                c.arg("-c").arg(command);
                c
            }
            Elevation::Sudo => {
                let mut c = Command::new("sudo");
                c.arg("sh").arg("-c").arg(command);
                c
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|error| SupervisorError::Spawn { error })?;

        // Both pipes were configured above, so `take()` should return `Some`;
        // anything else is an exceptional I/O failure.
        let stdout_reader = child.stdout.take().ok_or_else(|| {
            SupervisorError::Io(std::io::Error::other(
                "stdout pipe was unexpectedly not available",
            ))
        })?;
        let stderr_reader = child.stderr.take().ok_or_else(|| {
            SupervisorError::Io(std::io::Error::other(
                "stderr pipe was unexpectedly not available",
            ))
        })?;

        let stdout_handle: JoinHandle<std::io::Result<CapturedStream>> =
            tokio::spawn(read_capped(BufReader::new(stdout_reader)));
        let stderr_handle: JoinHandle<std::io::Result<CapturedStream>> =
            tokio::spawn(read_capped(BufReader::new(stderr_reader)));

        let (exit_code, timed_out) = match timeout(deadline, child.wait()).await {
            Ok(status) => {
                let status = status?;
                let code = status.code().unwrap_or_else(|| {
                    #[cfg(unix)]
                    {
                        use std::os::unix::process::ExitStatusExt;
                        if let Some(signal) = status.signal() {
                            return EXIT_CODE_SIGNAL_BASE + signal;
                        }
                    }
                    -1
                });
                (code, false)
            }
            Err(_) => {
                warn!(command, deadline_ms = deadline.as_millis() as u64, "command timed out");
                terminate(&mut child).await;
                (EXEC_TIMEOUT_EXIT_CODE, true)
            }
        };

        let stdout = stdout_handle.await.map_err(std::io::Error::other)??;
        let stderr = stderr_handle.await.map_err(std::io::Error::other)??;

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }

    /// Trivial identity command with a short timeout, used to decide whether
    /// elevated access is available before anything destructive is attempted.
    pub async fn check_elevated_access(&self) -> Result<()> {
        let output = match self.run("id -u", PRIVILEGE_CHECK_TIMEOUT).await {
            Ok(output) => output,
            Err(SupervisorError::Spawn { error }) => {
                return Err(SupervisorError::PrivilegeUnavailable {
                    detail: format!("elevation binary could not be spawned: {error}"),
                });
            }
            Err(err) => return Err(err),
        };

        if output.timed_out {
            return Err(SupervisorError::PrivilegeCheckTimeout {
                waited_ms: PRIVILEGE_CHECK_TIMEOUT.as_millis() as u64,
            });
        }
        if output.ok() && output.stdout.text.trim() == "0" {
            return Ok(());
        }
        Err(classify_privilege_failure(&output))
    }
}

/// Maps a failed access check onto the privilege error taxonomy by
/// inspecting recognizable stderr substrings.
fn classify_privilege_failure(output: &CommandOutput) -> SupervisorError {
    let stderr = output.stderr.text.to_lowercase();
    if stderr.contains("denied") || stderr.contains("not allowed") {
        SupervisorError::PrivilegeDenied {
            detail: output.stderr.text.trim().to_string(),
        }
    } else {
        let detail = if output.stderr.text.trim().is_empty() {
            format!(
                "identity check returned uid '{}' with exit code {}",
                output.stdout.text.trim(),
                output.exit_code
            )
        } else {
            output.stderr.text.trim().to_string()
        };
        SupervisorError::PrivilegeUnavailable { detail }
    }
}

async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    if let Err(err) = child.start_kill() {
        warn!("failed to force-kill timed out command: {err}");
    }
    let _ = child.wait().await;
}

/// Reads a stream to EOF, keeping at most [`MAX_CAPTURE_BYTES`]. Bytes past
/// the ceiling are discarded (the stream keeps draining to avoid
/// back-pressure on the child) and the capture is marked truncated.
async fn read_capped<R: AsyncRead + Unpin + Send + 'static>(
    mut reader: R,
) -> std::io::Result<CapturedStream> {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut truncated = false;
    let mut tmp = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        let remaining = MAX_CAPTURE_BYTES.saturating_sub(buf.len());
        if remaining == 0 {
            truncated = true;
            continue;
        }
        let take = n.min(remaining);
        buf.extend_from_slice(&tmp[..take]);
        if take < n {
            truncated = true;
        }
    }

    Ok(CapturedStream {
        text: String::from_utf8_lossy(&buf).to_string(),
        truncated,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn flag(self) -> &'static str {
        match self {
            Signal::Term => "-TERM",
            Signal::Kill => "-KILL",
        }
    }
}

/// Typed builder for the leaf shell operations the privileged strategy
/// needs. Path resolution, retry counts, and sequencing stay in Rust; only
/// these quoted one-liners cross the shell boundary.
pub struct ShellCommand;

impl ShellCommand {
    pub fn mkdir_p(path: &Path) -> String {
        format!("mkdir -p {}", quote_path(path))
    }

    /// Full copy of `src`'s contents into `dst`, creating `dst` as needed.
    pub fn copy_tree(src: &Path, dst: &Path) -> String {
        format!(
            "mkdir -p {dst} && cp -a {src}/. {dst}/",
            src = quote_path(src),
            dst = quote_path(dst),
        )
    }

    /// Incremental copy that leaves the named top-level entries alone, so
    /// in-place edits under them are not clobbered.
    pub fn copy_tree_excluding(src: &Path, dst: &Path, excludes: &[&str]) -> String {
        let excludes = excludes
            .iter()
            .map(|name| format!("--exclude=./{}", quote(name)))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "mkdir -p {dst} && (cd {src} && tar -cf - {excludes} .) | (cd {dst} && tar -xf -)",
            src = quote_path(src),
            dst = quote_path(dst),
        )
    }

    pub fn copy_file(src: &Path, dst: &Path) -> String {
        format!("cp {} {}", quote_path(src), quote_path(dst))
    }

    pub fn chown_recursive(owner: &str, path: &Path) -> String {
        format!("chown -R {} {}", quote(owner), quote_path(path))
    }

    pub fn chmod_recursive(mode: &str, path: &Path) -> String {
        format!("chmod -R {} {}", quote(mode), quote_path(path))
    }

    pub fn kill(signal: Signal, pid: u32) -> String {
        format!("kill {} {pid}", signal.flag())
    }

    pub fn pid_alive(pid: u32) -> String {
        format!("kill -0 {pid}")
    }

    pub fn cat(path: &Path) -> String {
        format!("cat {}", quote_path(path))
    }

    /// Command line of a live process, NUL bytes flattened to spaces.
    pub fn read_cmdline(pid: u32) -> String {
        format!("tr '\\0' ' ' < /proc/{pid}/cmdline")
    }

    /// Detached launch of `program args...`; the launched process is expected
    /// to write its own PID file, so the shell only forks and returns.
    pub fn launch_detached(program: &Path, args: &[String]) -> String {
        let mut line = quote_path(program);
        for arg in args {
            line.push(' ');
            line.push_str(&quote(arg));
        }
        format!("nohup {line} >/dev/null 2>&1 &")
    }
}

fn quote(value: &str) -> String {
    match shlex::try_quote(value) {
        Ok(quoted) => quoted.into_owned(),
        // Only fails on embedded NUL, which `run` rejects anyway.
        Err(_) => Cow::Borrowed(value).into_owned(),
    }
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

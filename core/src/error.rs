use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::StrategyKind;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Rejected synchronously before any state change.
    #[error("port {port} requires elevated privileges; the {strategy} strategy cannot bind it")]
    PrivilegedPort { port: u16, strategy: StrategyKind },

    #[error("invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u32 },

    #[error("service payload for channel {channel} is missing or invalid: {detail}")]
    InvalidPayload { channel: String, detail: String },

    /// The service did not become reachable before the extended deadline.
    #[error("start timeout: service did not open port {port} within {waited_ms} ms")]
    StartTimeout { port: u16, waited_ms: u64 },

    /// The service did not release the port before the deadline.
    #[error("stop timeout: service still reachable on port {port} after {waited_ms} ms")]
    StopTimeout { port: u16, waited_ms: u64 },

    #[error("no {kind} execution strategy is configured")]
    StrategyUnavailable { kind: StrategyKind },

    #[error("elevated access is not available: {detail}")]
    PrivilegeUnavailable { detail: String },

    #[error("elevated access was denied: {detail}")]
    PrivilegeDenied { detail: String },

    #[error("privilege check timed out after {waited_ms} ms")]
    PrivilegeCheckTimeout { waited_ms: u64 },

    /// The worker thread or spawned process exited while it was expected to run.
    #[error("service crashed: {detail}")]
    Crash { detail: String },

    #[error("work directory sync failed: {detail}")]
    Sync { detail: String },

    #[error("failed to persist configuration: {0}")]
    ConfigStore(String),

    #[error("command rejected: {reason}")]
    CommandRejected { reason: String },

    #[error("failed to spawn command: {error}")]
    Spawn {
        #[source]
        error: io::Error,
    },

    #[error("failed to resolve launch program: {error}")]
    LaunchProgram {
        #[source]
        error: io::Error,
    },

    #[error("failed to read {path}: {error}")]
    ReadFile {
        path: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SupervisorError {
    pub(crate) fn sync(detail: impl Into<String>) -> Self {
        Self::Sync {
            detail: detail.into(),
        }
    }

    pub(crate) fn crash(detail: impl Into<String>) -> Self {
        Self::Crash {
            detail: detail.into(),
        }
    }

    /// True for failures that should be presented with a privilege hint.
    pub fn is_privilege_error(&self) -> bool {
        matches!(
            self,
            Self::PrivilegeUnavailable { .. }
                | Self::PrivilegeDenied { .. }
                | Self::PrivilegeCheckTimeout { .. }
        )
    }
}

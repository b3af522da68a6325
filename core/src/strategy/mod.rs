//! The two interchangeable ways to actually run the managed service.

use std::error::Error;

use async_trait::async_trait;

use crate::config::RuntimeConfig;
use crate::config::StrategyKind;
use crate::error::Result;

mod process;
mod thread;

pub use process::LaunchSpec;
pub(crate) use process::ProcessStrategy;
pub(crate) use thread::ThreadStrategy;

/// Well-known path the managed service exposes for graceful shutdown.
pub const SHUTDOWN_PATH: &str = "/-/shutdown";

/// Context captured at dispatch time. The generation lets strategy callbacks
/// detect that a later start has superseded them.
#[derive(Debug, Clone)]
pub struct StartContext {
    pub config: RuntimeConfig,
    pub generation: u64,
}

/// Contract shared by both strategies. `start` only dispatches; readiness is
/// confirmed by the supervisor's health polling. `stop` only initiates
/// shutdown; the supervisor polls `is_running` plus the port to decide
/// completion.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn start(&self, ctx: StartContext) -> Result<()>;

    async fn stop(&self, config: &RuntimeConfig) -> Result<()>;

    async fn is_running(&self, config: &RuntimeConfig) -> bool;

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// The in-process service body the unprivileged strategy runs on its worker
/// thread. Provided by the embedder; `run` blocks for the lifetime of the
/// service.
pub trait ServiceEntry: Send + Sync + 'static {
    fn run(&self, config: &RuntimeConfig) -> std::result::Result<(), Box<dyn Error + Send + Sync>>;

    /// Graceful-shutdown hook; `run` is expected to return soon after.
    fn request_shutdown(&self);
}

//! Runtime supervisor for a locally hosted network service.
//!
//! The supervisor owns the service lifecycle (start, stop, restart,
//! reconfigure, strategy switch), publishes state snapshots over a watch
//! channel, and keeps the service alive through background liveness and
//! hot-reload monitors. The service itself runs either on a worker thread
//! inside this process or as a separate privileged process, behind the
//! [`strategy::ExecutionStrategy`] seam.

pub mod command;
pub mod config;
pub mod error;
pub mod health;
pub mod state;
pub mod strategy;
pub mod supervisor;
pub mod watcher;
pub mod workdir;

pub use command::CommandOutput;
pub use command::Elevation;
pub use command::PrivilegedRunner;
pub use config::ConfigStore;
pub use config::ReleaseChannel;
pub use config::RuntimeConfig;
pub use config::StrategyKind;
pub use config::TomlConfigStore;
pub use error::Result;
pub use error::SupervisorError;
pub use state::ServiceSnapshot;
pub use state::ServiceState;
pub use strategy::LaunchSpec;
pub use strategy::ServiceEntry;
pub use supervisor::PrivilegedSettings;
pub use supervisor::Supervisor;
pub use supervisor::SupervisorBuilder;
pub use supervisor::SupervisorTimeouts;
pub use watcher::WorkDirChange;
pub use watcher::WorkDirWatcher;
pub use workdir::DirectoryReleaseProvider;
pub use workdir::ReleaseProvider;
pub use workdir::WorkDirLayout;
pub use workdir::WorkDirSync;

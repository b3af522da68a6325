//! Secondary entry point: the body of the privileged service process.
//!
//! The supervisor launches `berth serve ...` detached under elevation; this
//! process records its own PID and serves until the shutdown endpoint fires.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::service::serve_blocking;

#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Payload entry file inside the work directory.
    #[arg(long)]
    pub entry: PathBuf,

    /// File this process writes its own PID into.
    #[arg(long)]
    pub pid_file: PathBuf,

    #[arg(long)]
    pub port: u16,

    #[arg(long, default_value = "")]
    pub token: String,
}

pub fn run(args: ServeArgs) -> anyhow::Result<()> {
    fs::write(&args.pid_file, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write pid file {}", args.pid_file.display()))?;

    let shutdown = AtomicBool::new(false);
    let result = serve_blocking(&args.entry, args.port, &args.token, &shutdown);
    // Best effort; a stale pid file is handled by the command-line check on
    // the supervisor side.
    let _ = fs::remove_file(&args.pid_file);
    result.context("service loop failed")?;
    info!("service exited");
    Ok(())
}

mod run_cmd;
mod serve_cmd;
mod service;

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;

#[derive(Debug, Parser)]
#[command(name = "berth", about = "Supervisor for a locally hosted service", version)]
struct Cli {
    /// State directory; defaults to ~/.berth.
    #[arg(long, global = true, env = "BERTH_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the supervisor in the foreground until Ctrl-C.
    Run(run_cmd::RunArgs),
    /// Print the current service snapshot as JSON.
    Status,
    /// Persist configuration; takes effect on the next start.
    Config(ConfigArgs),
    /// Stop a detached privileged service.
    Stop(ControlArgs),
    /// Restart a detached privileged service.
    Restart(ControlArgs),
    /// Service process entry point used by the privileged strategy.
    #[command(hide = true)]
    Serve(serve_cmd::ServeArgs),
}

#[derive(Debug, Parser)]
struct ConfigArgs {
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    token: Option<String>,
}

#[derive(Debug, Parser)]
struct ControlArgs {
    /// Elevation wrapper: none, su or sudo.
    #[arg(long, default_value = "su", value_parser = run_cmd::parse_elevation)]
    elevation: berth_core::Elevation,
}

fn main() -> anyhow::Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let home = resolve_home(cli.home)?;
    match cli.command {
        // Serve is fully synchronous; no runtime needed.
        Command::Serve(args) => serve_cmd::run(args),
        Command::Run(args) => runtime()?.block_on(run_cmd::run(&home, args)),
        Command::Status => runtime()?.block_on(status(&home)),
        Command::Config(args) => runtime()?.block_on(apply_config(&home, args)),
        Command::Stop(args) => runtime()?.block_on(control(&home, args, false)),
        Command::Restart(args) => runtime()?.block_on(control(&home, args, true)),
    }
}

async fn control(home: &Path, args: ControlArgs, restart: bool) -> anyhow::Result<()> {
    let supervisor = run_cmd::control_supervisor(home, args.elevation).await?;
    if restart {
        supervisor.restart().await.context("restart failed")?;
        println!("service restarted");
    } else {
        supervisor.stop().await.context("stop failed")?;
        println!("service stopped");
    }
    Ok(())
}

async fn status(home: &Path) -> anyhow::Result<()> {
    let supervisor = run_cmd::bare_supervisor(home).await?;
    let snapshot = supervisor.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn apply_config(home: &Path, args: ConfigArgs) -> anyhow::Result<()> {
    let supervisor = run_cmd::bare_supervisor(home).await?;
    let current = supervisor.config();
    let port = args.port.unwrap_or(current.port);
    let token = args.token.unwrap_or(current.token);
    supervisor
        .apply_configuration(port, &token, false)
        .await
        .context("failed to persist configuration")?;
    println!("configuration saved; takes effect on the next start");
    Ok(())
}

fn resolve_home(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(home) = flag {
        return Ok(home);
    }
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .context("HOME is not set; pass --home")?;
    Ok(home.join(".berth"))
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")
}

fn setup_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

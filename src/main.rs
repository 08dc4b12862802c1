//! Hive hub binary.
//!
//! Thin entry point: parse flags, build the [`Hub`], serve until a signal
//! or operator shutdown. The real surface lives in the `hive` library.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use hive::{Config, Hub};
use mimalloc::MiMalloc;

/// mimalloc performs better than the system allocator under the hub's
/// multi-threaded request + spawn load.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Local orchestrator hub for worktree-isolated coding drones.
#[derive(Debug, Parser)]
#[command(name = "hive", version, about)]
struct Cli {
    /// Host repository agents branch from (falls back to HIVE_REPO).
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Port the hub API listens on.
    #[arg(long)]
    port: Option<u16>,

    /// First port probed when allocating drone ports.
    #[arg(long)]
    base_port: Option<u16>,

    /// Directory to keep agent worktrees in.
    #[arg(long)]
    worktrees_dir: Option<PathBuf>,

    /// Run drones under the sandbox wrapper.
    #[arg(long)]
    sandbox: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = Config::from_env(cli.repo)?;
    if let Some(port) = cli.port {
        config.hub_port = port;
    }
    if let Some(base_port) = cli.base_port {
        config.base_port = base_port;
    }
    if let Some(dir) = cli.worktrees_dir {
        config.worktrees_dir = dir;
    }
    if cli.sandbox {
        config.sandbox = true;
    }

    let hub = Arc::new(Hub::new(config)?);

    let signal_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        shutdown_signal().await;
        log::info!("shutdown signal received");
        signal_hub.stop().await;
    });

    hub.run().await
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(err) => {
            log::error!("failed to install SIGTERM handler: {err}");
            let _ = ctrl_c.await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
}

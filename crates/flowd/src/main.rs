//! flowd - workflow orchestration daemon.
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use flow_core::Config;
use flowd::Daemon;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Workflow orchestration daemon for AI coding agents.
#[derive(Debug, Parser)]
#[command(name = "flowd", version)]
struct Cli {
    /// HTTP port to listen on (127.0.0.1 only).
    #[arg(long, env = "FLOWD_PORT")]
    port: Option<u16>,

    /// Data directory for the database and daemon state.
    #[arg(long, env = "FLOWD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Workspace root (git repository) workflows operate on.
    #[arg(long, env = "FLOWD_WORKSPACE", default_value = ".")]
    workspace_root: PathBuf,

    /// Config file (key=value format). Defaults to .flow/config under
    /// the workspace root when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent executable to spawn for steps and orchestrator follow-ups.
    #[arg(long)]
    agent_bin: Option<PathBuf>,

    /// Maximum steps running concurrently per daemon.
    #[arg(long)]
    max_concurrent_steps: Option<usize>,
}

fn load_config(cli: &Cli) -> Result<Config, flow_core::config::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let default_path = cli.workspace_root.join(".flow/config");
            if default_path.exists() {
                Config::from_file(&default_path)?
            } else {
                Config::default()
            }
        }
    };

    // CLI flags override file values.
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(agent_bin) = &cli.agent_bin {
        config.agent_bin = agent_bin.clone();
    }
    if let Some(max) = cli.max_concurrent_steps {
        config.max_concurrent_steps = max;
    }
    Ok(config)
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let workspace_root = cli
        .workspace_root
        .canonicalize()
        .unwrap_or(cli.workspace_root);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        match Daemon::new(config, workspace_root).await {
            Ok(daemon) => {
                if let Err(e) = daemon.run().await {
                    error!("daemon error: {e}");
                    std::process::exit(1);
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        }
    });
}

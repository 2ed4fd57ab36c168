//! flow-merge - git merge driver for JSONL entity stores.
//!
//! Driver mode: `flow-merge --base=<path> --ours=<path> --theirs=<path>`
//! writes the merged result to the ours path and exits 0, or exits 1
//! when the merge needs human attention (leaving the inputs untouched).
//! Resolver mode: `flow-merge --resolve <file>` reads a conflicted file
//! in place, preferring the git index stages for a true three-way.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Git merge driver and conflict resolver for JSONL entity stores.
#[derive(Debug, Parser)]
#[command(name = "flow-merge", version)]
struct Cli {
    /// Common ancestor version (driver mode).
    #[arg(long)]
    base: Option<PathBuf>,

    /// Our version; the merge result is written here (driver mode).
    #[arg(long)]
    ours: Option<PathBuf>,

    /// Their version (driver mode).
    #[arg(long)]
    theirs: Option<PathBuf>,

    /// Resolve a conflicted file in place instead of running as a
    /// driver.
    #[arg(long, conflicts_with_all = ["base", "ours", "theirs"])]
    resolve: Option<PathBuf>,

    /// Repository root used for reading git index stages.
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,

    /// Driver failure log file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let log_path = cli
        .log_file
        .clone()
        .unwrap_or_else(flow_merge::driver::default_log_path);

    if let Some(target) = &cli.resolve {
        match flow_merge::resolve_file(target, &cli.repo_root) {
            Ok(Some(resolution)) => {
                info!(
                    path = %target.display(),
                    three_way = resolution.three_way,
                    renames = resolution.conflicts.len(),
                    "conflicts resolved"
                );
                std::process::exit(0);
            }
            Ok(None) => {
                info!(path = %target.display(), "no conflict markers found");
                std::process::exit(0);
            }
            Err(e) => {
                error!(path = %target.display(), "resolve failed: {e}");
                std::process::exit(1);
            }
        }
    }

    let (Some(base), Some(ours), Some(theirs)) = (&cli.base, &cli.ours, &cli.theirs) else {
        error!("driver mode requires --base, --ours, and --theirs");
        std::process::exit(1);
    };

    match flow_merge::run_merge(base, ours, theirs) {
        Ok(summary) => {
            info!(
                entities = summary.entities,
                renames = summary.conflicts.len(),
                "merged"
            );
            std::process::exit(0);
        }
        Err(e) => {
            flow_merge::append_log(&log_path, ours, base, ours, theirs, &e.to_string());
            error!("merge failed: {e}");
            std::process::exit(1);
        }
    }
}

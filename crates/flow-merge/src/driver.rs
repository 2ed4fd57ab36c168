//! Git merge driver entry points.
//!
//! Invoked by git as `flow-merge --base=<path> --ours=<path>
//! --theirs=<path>`. Exit 0 means the merged result was written to the
//! ours path; exit 1 means the merge needs human attention, in which
//! case the conflict is left untouched and a line is appended to the
//! driver log.

use crate::merge::{self, ConflictRecord};
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("conflict error: {0}")]
    Conflict(#[from] crate::conflict::ConflictError),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Default driver log location under the user's home directory.
pub fn default_log_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".flow-merge.log")
}

/// Summary of a successful driver run.
#[derive(Debug)]
pub struct MergeSummary {
    pub entities: usize,
    pub conflicts: Vec<ConflictRecord>,
}

/// Run the three-way merge over the driver's temp files and write the
/// result to the ours path.
pub fn run_merge(base_path: &Path, ours_path: &Path, theirs_path: &Path) -> Result<MergeSummary> {
    let base = std::fs::read_to_string(base_path)?;
    let ours = std::fs::read_to_string(ours_path)?;
    let theirs = std::fs::read_to_string(theirs_path)?;

    let outcome = merge::merge_entities(
        &merge::parse_lines(&base),
        &merge::parse_lines(&ours),
        &merge::parse_lines(&theirs),
    );

    std::fs::write(ours_path, merge::render_lines(&outcome.entities))?;

    for conflict in &outcome.conflicts {
        info!(
            uuid = %conflict.uuid,
            action = %conflict.action,
            "id collision resolved"
        );
    }

    Ok(MergeSummary {
        entities: outcome.entities.len(),
        conflicts: outcome.conflicts,
    })
}

/// Append a failure line to the driver log. Logging must never panic;
/// failures to log are themselves only warned about.
pub fn append_log(
    log_path: &Path,
    target: &Path,
    base: &Path,
    ours: &Path,
    theirs: &Path,
    error: &str,
) {
    let line = format!(
        "{}\t{}\tbase={}\tours={}\ttheirs={}\t{}\n",
        Utc::now().to_rfc3339(),
        target.display(),
        base.display(),
        ours.display(),
        theirs.display(),
        error
    );

    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .and_then(|mut file| file.write_all(line.as_bytes()));
    if let Err(e) = result {
        warn!(log = %log_path.display(), error = %e, "failed to append driver log");
    }
}

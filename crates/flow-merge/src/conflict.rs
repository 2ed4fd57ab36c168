//! Conflict-marker parsing and in-place resolution of conflicted JSONL
//! files.
//!
//! The resolver prefers a true three-way merge by reading the git index
//! stages (1 = base, 2 = ours, 3 = theirs); when the stages are not
//! available it falls back to two-way latest-`updated_at`-wins. Lines in
//! clean sections are kept as raw strings; only entities inside conflict
//! hunks are parsed. When the clean lines are already sorted they are
//! woven back in with a linear merge of sorted runs, otherwise the whole
//! file is re-parsed and sorted.

use crate::merge::{self, line_sort_key, merge_entities, ConflictRecord};
use flow_core::entity::Entity;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("nested conflict markers at line {0}")]
    NestedMarkers(usize),
    #[error("unterminated conflict hunk starting at line {0}")]
    Unterminated(usize),
    #[error("separator outside a conflict hunk at line {0}")]
    StraySeparator(usize),
}

pub type Result<T> = std::result::Result<T, ConflictError>;

/// One region of a conflicted file.
#[derive(Debug, Clone, PartialEq)]
pub enum Piece {
    /// A line outside any conflict hunk, preserved byte-for-byte.
    Clean(String),
    /// One conflict hunk: our lines and their lines.
    Conflict {
        ours: Vec<String>,
        theirs: Vec<String>,
    },
}

/// Parse git conflict markers. Marker tails (branch names, whitespace)
/// are ignored; nested markers are a parse error.
pub fn parse_markers(content: &str) -> Result<Vec<Piece>> {
    #[derive(PartialEq)]
    enum State {
        Clean,
        Ours,
        Theirs,
    }

    let mut pieces = Vec::new();
    let mut state = State::Clean;
    let mut ours: Vec<String> = Vec::new();
    let mut theirs: Vec<String> = Vec::new();
    let mut hunk_start = 0;

    for (index, line) in content.lines().enumerate() {
        let number = index + 1;
        if line.starts_with("<<<<<<<") {
            if state != State::Clean {
                return Err(ConflictError::NestedMarkers(number));
            }
            state = State::Ours;
            hunk_start = number;
        } else if line.starts_with("=======") && state != State::Clean {
            if state == State::Theirs {
                return Err(ConflictError::NestedMarkers(number));
            }
            state = State::Theirs;
        } else if line.starts_with(">>>>>>>") {
            if state != State::Theirs {
                return Err(ConflictError::StraySeparator(number));
            }
            pieces.push(Piece::Conflict {
                ours: std::mem::take(&mut ours),
                theirs: std::mem::take(&mut theirs),
            });
            state = State::Clean;
        } else {
            match state {
                State::Clean => pieces.push(Piece::Clean(line.to_string())),
                State::Ours => ours.push(line.to_string()),
                State::Theirs => theirs.push(line.to_string()),
            }
        }
    }

    if state != State::Clean {
        return Err(ConflictError::Unterminated(hunk_start));
    }
    Ok(pieces)
}

/// Whether a file contains conflict markers at all.
pub fn has_markers(content: &str) -> bool {
    content
        .lines()
        .any(|line| line.starts_with("<<<<<<<") || line.starts_with(">>>>>>>"))
}

/// Read one git index stage of a conflicted path (1 = base, 2 = ours,
/// 3 = theirs). `None` when the stage cannot be read.
pub fn read_index_stage(repo_root: &Path, relative_path: &Path, stage: u8) -> Option<String> {
    let spec = format!(":{}:{}", stage, relative_path.display());
    let output = Command::new("git")
        .args(["show", &spec])
        .current_dir(repo_root)
        .output()
        .ok()?;
    if output.status.success() {
        String::from_utf8(output.stdout).ok()
    } else {
        None
    }
}

/// Outcome of resolving one conflicted file.
#[derive(Debug)]
pub struct Resolution {
    pub content: String,
    pub conflicts: Vec<ConflictRecord>,
    /// Whether the index stages were available for a true three-way.
    pub three_way: bool,
}

/// Resolve the conflict hunks of a file's content.
///
/// `stages` supplies `(base, ours, theirs)` full-file contents when the
/// caller could read the git index; otherwise hunks are merged two-way
/// with latest `updated_at` winning and ties going to ours.
pub fn resolve_content(content: &str, stages: Option<(&str, &str, &str)>) -> Result<Resolution> {
    let pieces = parse_markers(content)?;

    let mut clean_lines: Vec<String> = Vec::new();
    let mut hunk_ours: Vec<Entity> = Vec::new();
    let mut hunk_theirs: Vec<Entity> = Vec::new();
    for piece in &pieces {
        match piece {
            Piece::Clean(line) => {
                if !line.trim().is_empty() {
                    clean_lines.push(line.clone());
                }
            }
            Piece::Conflict { ours, theirs } => {
                hunk_ours.extend(merge::parse_lines(&ours.join("\n")));
                hunk_theirs.extend(merge::parse_lines(&theirs.join("\n")));
            }
        }
    }

    let (merged, conflicts, three_way) = match stages {
        Some((base, ours, theirs)) => {
            // Full three-way over the staged file contents. The staged
            // sides already include the clean lines, so the result is
            // complete on its own.
            let outcome = merge_entities(
                &merge::parse_lines(base),
                &merge::parse_lines(ours),
                &merge::parse_lines(theirs),
            );
            return Ok(Resolution {
                content: merge::render_lines(&outcome.entities),
                conflicts: outcome.conflicts,
                three_way: true,
            });
        }
        None => {
            let outcome = two_way_merge(hunk_ours, hunk_theirs);
            (outcome.0, outcome.1, false)
        }
    };

    let content = weave(&clean_lines, &merged);
    Ok(Resolution {
        content,
        conflicts,
        three_way,
    })
}

/// Two-way fallback: group hunk entities by uuid and keep the side with
/// the newer `updated_at` (ties favor ours).
fn two_way_merge(ours: Vec<Entity>, theirs: Vec<Entity>) -> (Vec<Entity>, Vec<ConflictRecord>) {
    let mut by_uuid: HashMap<String, Entity> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for entity in ours {
        if !by_uuid.contains_key(&entity.uuid) {
            order.push(entity.uuid.clone());
        }
        by_uuid.insert(entity.uuid.clone(), entity);
    }
    for entity in theirs {
        match by_uuid.get(&entity.uuid) {
            Some(existing) if existing.updated_at() >= entity.updated_at() => {}
            _ => {
                if !by_uuid.contains_key(&entity.uuid) {
                    order.push(entity.uuid.clone());
                }
                by_uuid.insert(entity.uuid.clone(), entity);
            }
        }
    }

    let mut merged: Vec<Entity> = order
        .into_iter()
        .filter_map(|uuid| by_uuid.remove(&uuid))
        .collect();
    merged.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id.cmp(&b.id))
    });
    (merged, Vec::new())
}

/// Weave merged hunk entities back between the clean lines.
///
/// When every clean line yields a sort key and the run is already
/// ordered, a linear merge of the two sorted runs keeps clean lines
/// untouched. Otherwise everything is parsed and fully re-sorted.
fn weave(clean_lines: &[String], merged: &[Entity]) -> String {
    let keys: Option<Vec<_>> = clean_lines.iter().map(|line| line_sort_key(line)).collect();
    let sorted_clean = keys
        .as_ref()
        .is_some_and(|keys| keys.windows(2).all(|pair| pair[0] <= pair[1]));

    if let (Some(keys), true) = (keys, sorted_clean) {
        // Linear merge of two sorted runs; clean lines stay raw.
        let mut out = String::new();
        let mut clean_iter = clean_lines.iter().zip(keys).peekable();
        let mut merged_iter = merged.iter().peekable();

        loop {
            match (clean_iter.peek(), merged_iter.peek()) {
                (Some((_, clean_key)), Some(entity)) => {
                    if *clean_key <= merge::sort_key(entity) {
                        let (line, _) = clean_iter.next().unwrap();
                        out.push_str(line);
                        out.push('\n');
                    } else {
                        let entity = merged_iter.next().unwrap();
                        if let Ok(line) = entity.to_line() {
                            out.push_str(&line);
                            out.push('\n');
                        }
                    }
                }
                (Some(_), None) => {
                    let (line, _) = clean_iter.next().unwrap();
                    out.push_str(line);
                    out.push('\n');
                }
                (None, Some(_)) => {
                    let entity = merged_iter.next().unwrap();
                    if let Ok(line) = entity.to_line() {
                        out.push_str(&line);
                        out.push('\n');
                    }
                }
                (None, None) => break,
            }
        }
        return out;
    }

    // Fallback: parse everything and re-sort the whole file.
    warn!("clean lines unsorted or unparseable, re-sorting whole file");
    let mut all = merge::parse_lines(&clean_lines.join("\n"));
    all.extend(merged.iter().cloned());
    all.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id.cmp(&b.id))
    });
    merge::render_lines(&all)
}

/// Resolve a conflicted file in place. Reads the git index stages when
/// `repo_root` contains them, falling back to two-way otherwise.
pub fn resolve_file(path: &Path, repo_root: &Path) -> Result<Option<Resolution>> {
    let content = std::fs::read_to_string(path)?;
    if !has_markers(&content) {
        return Ok(None);
    }

    let relative = path.strip_prefix(repo_root).unwrap_or(path);
    let base = read_index_stage(repo_root, relative, 1);
    let ours = read_index_stage(repo_root, relative, 2);
    let theirs = read_index_stage(repo_root, relative, 3);

    let resolution = match (&base, &ours, &theirs) {
        (Some(base), Some(ours), Some(theirs)) => {
            info!(path = %path.display(), "resolving with index stages");
            resolve_content(&content, Some((base, ours, theirs)))?
        }
        _ => {
            info!(path = %path.display(), "index stages unavailable, two-way fallback");
            resolve_content(&content, None)?
        }
    };

    std::fs::write(path, &resolution.content)?;
    Ok(Some(resolution))
}

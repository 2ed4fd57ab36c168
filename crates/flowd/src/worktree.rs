//! Worktree allocation for workflows.
//!
//! Every workflow owns exactly one worktree; all of its steps run there
//! so each step sees the file changes of the ones before it. Operators
//! can opt out by pre-provisioning a directory and setting
//! `reuse_worktree_path` on the workflow config.

use flow_core::Config;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// A worktree allocated (or adopted) for a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowWorktree {
    pub path: PathBuf,
    pub branch: String,
    /// False when the caller supplied the directory via
    /// `reuse_worktree_path`; reused worktrees are never cleaned up.
    pub created: bool,
}

/// Detect the default branch for a repository.
///
/// Tries the remote HEAD reference first, then local `main`, then
/// `master`, defaulting to `main`.
pub fn detect_default_branch(workspace_root: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
        .current_dir(workspace_root)
        .output()?;

    if output.status.success() {
        let full_ref = String::from_utf8(output.stdout)
            .map_err(|_| WorktreeError::InvalidUtf8)?
            .trim()
            .to_string();
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        let check = Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{candidate}")])
            .current_dir(workspace_root)
            .output()?;
        if check.status.success() {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

/// Check if a branch exists locally.
pub fn branch_exists(workspace_root: &Path, branch: &str) -> Result<bool> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", &format!("refs/heads/{branch}")])
        .current_dir(workspace_root)
        .output()?;
    Ok(output.status.success())
}

/// Create a new branch from base without checking it out.
pub fn create_branch(workspace_root: &Path, branch: &str, base: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["branch", branch, base])
        .current_dir(workspace_root)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorktreeError::CommandFailed(format!(
            "git branch {branch} {base}: {stderr}"
        )));
    }
    Ok(())
}

/// Expand the worktree path template.
///
/// Template variables:
/// - `{{ repo }}`: repository directory name
/// - `{{ branch }}`: full branch name
/// - `{{ branch | sanitize }}`: filesystem-safe branch (slashes replaced)
pub fn expand_template(template: &str, workspace_root: &Path, branch: &str) -> String {
    let repo = workspace_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo");
    let sanitized = branch.replace('/', "-");

    template
        .replace("{{ repo }}", repo)
        .replace("{{repo}}", repo)
        .replace("{{ branch | sanitize }}", &sanitized)
        .replace("{{branch | sanitize}}", &sanitized)
        .replace("{{ branch }}", branch)
        .replace("{{branch}}", branch)
}

/// Create a slug from a workflow title (lowercase, alphanumeric, hyphens).
pub fn slugify(title: &str) -> String {
    title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Resolve a template expansion to an absolute path.
fn resolve_path(expanded: &str, workspace_root: &Path) -> PathBuf {
    let path = Path::new(expanded);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        normalize_path(&workspace_root.join(expanded))
    }
}

/// Normalize a path by resolving `.` and `..` components.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                components.pop();
            }
            std::path::Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}

/// Allocate the worktree for a workflow.
///
/// With `reuse_worktree_path` set, the directory is adopted as-is and
/// no branch or worktree is created. Otherwise a branch is created from
/// `base_branch` (if missing) and `git worktree add` checks it out at
/// the templated path.
pub fn allocate(
    config: &Config,
    workspace_root: &Path,
    workflow_title: &str,
    base_branch: &str,
    reuse_worktree_path: Option<&str>,
) -> Result<WorkflowWorktree> {
    if let Some(reuse) = reuse_worktree_path {
        let path = resolve_path(reuse, workspace_root);
        info!(path = %path.display(), "reusing pre-provisioned worktree");
        return Ok(WorkflowWorktree {
            path,
            branch: base_branch.to_string(),
            created: false,
        });
    }

    let branch = format!("{}{}", config.branch_prefix, slugify(workflow_title));
    let expanded = expand_template(&config.worktree_path_template, workspace_root, &branch);
    let path = resolve_path(&expanded, workspace_root);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| WorktreeError::CommandFailed(format!("create parent dir: {e}")))?;
    }

    if !branch_exists(workspace_root, &branch)? {
        create_branch(workspace_root, &branch, base_branch)?;
    }

    let output = Command::new("git")
        .args(["worktree", "add", path.to_string_lossy().as_ref(), &branch])
        .current_dir(workspace_root)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorktreeError::CommandFailed(format!(
            "git worktree add: {stderr}"
        )));
    }

    info!(path = %path.display(), branch = %branch, "worktree created");
    Ok(WorkflowWorktree {
        path,
        branch,
        created: true,
    })
}

/// Current HEAD commit of a worktree.
pub fn head_commit(worktree_path: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(worktree_path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorktreeError::CommandFailed(format!(
            "git rev-parse HEAD: {stderr}"
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| WorktreeError::InvalidUtf8)
}

/// Remove a worktree created by [`allocate`]. Reused worktrees are left
/// untouched.
pub fn remove(workspace_root: &Path, worktree: &WorkflowWorktree) -> Result<()> {
    if !worktree.created {
        return Ok(());
    }

    let output = Command::new("git")
        .args([
            "worktree",
            "remove",
            "--force",
            worktree.path.to_string_lossy().as_ref(),
        ])
        .current_dir(workspace_root)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorktreeError::CommandFailed(format!(
            "git worktree remove: {stderr}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Create a test git repository with one commit.
    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    #[test]
    fn slugify_normalizes_titles() {
        assert_eq!(slugify("My Feature"), "my-feature");
        assert_eq!(slugify("Fix Bug #123"), "fix-bug-123");
        assert_eq!(slugify("  spaces  "), "spaces");
    }

    #[test]
    fn expand_template_substitutes_variables() {
        let expanded = expand_template(
            "../{{ repo }}.{{ branch | sanitize }}",
            Path::new("/home/user/my-project"),
            "flow/feature-x",
        );
        assert_eq!(expanded, "../my-project.flow-feature-x");
    }

    #[test]
    fn expand_template_unsanitized_branch() {
        let expanded = expand_template(
            "/worktrees/{{ branch }}",
            Path::new("/home/user/my-project"),
            "flow/feature-x",
        );
        assert_eq!(expanded, "/worktrees/flow/feature-x");
    }

    #[test]
    fn normalize_path_resolves_dots() {
        assert_eq!(
            normalize_path(Path::new("/home/user/project/../other")),
            PathBuf::from("/home/user/other")
        );
        assert_eq!(
            normalize_path(Path::new("/home/user/./project")),
            PathBuf::from("/home/user/project")
        );
    }

    #[test]
    fn detect_default_branch_finds_main() {
        let dir = setup_test_repo();
        assert_eq!(detect_default_branch(dir.path()).unwrap(), "main");
    }

    #[test]
    fn allocate_creates_branch_and_worktree() {
        let dir = setup_test_repo();
        let mut config = Config::default();
        config.worktree_path_template = "wt/{{ branch | sanitize }}".to_string();

        let worktree = allocate(&config, dir.path(), "Add login", "main", None).unwrap();
        assert!(worktree.created);
        assert_eq!(worktree.branch, "flow/add-login");
        assert!(worktree.path.exists());
        assert!(branch_exists(dir.path(), "flow/add-login").unwrap());
        // The checkout carries the base branch's content.
        assert!(worktree.path.join("README.md").exists());
    }

    #[test]
    fn allocate_reuses_provided_path() {
        let dir = setup_test_repo();
        let config = Config::default();
        let reuse = dir.path().join("pre-provisioned");
        std::fs::create_dir_all(&reuse).unwrap();

        let worktree = allocate(
            &config,
            dir.path(),
            "Anything",
            "main",
            Some(reuse.to_str().unwrap()),
        )
        .unwrap();
        assert!(!worktree.created);
        assert_eq!(worktree.path, reuse);
        assert_eq!(worktree.branch, "main");
    }

    #[test]
    fn remove_deletes_created_worktrees_only() {
        let dir = setup_test_repo();
        let mut config = Config::default();
        config.worktree_path_template = "wt/{{ branch | sanitize }}".to_string();

        let worktree = allocate(&config, dir.path(), "Cleanup me", "main", None).unwrap();
        assert!(worktree.path.exists());
        remove(dir.path(), &worktree).unwrap();
        assert!(!worktree.path.exists());

        // Reused worktrees survive removal.
        let reuse = dir.path().join("keep-me");
        std::fs::create_dir_all(&reuse).unwrap();
        let adopted = WorkflowWorktree {
            path: reuse.clone(),
            branch: "main".to_string(),
            created: false,
        };
        remove(dir.path(), &adopted).unwrap();
        assert!(reuse.exists());
    }
}

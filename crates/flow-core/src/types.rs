//! Core types for the orchestration daemon.
//!
//! Workflows, steps, and executions are the three layers of the run model:
//! a workflow owns an ordered set of steps, and each step is backed by at
//! most one execution of an agent process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for workflows, steps, executions, events, and
/// checkpoints. Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses that accept no further scheduling. `failed` can be
    /// re-entered through retry_step and `paused` through resume.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Paused
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Step execution status.
///
/// A step is `ready` only when every dependency is `completed` (or
/// `skipped`, which counts as completed for dependency purposes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether this status satisfies downstream dependency checks.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Preparing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Stopped
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preparing" => Some(Self::Preparing),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Managed process status, owned exclusively by the process manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Busy,
    Terminating,
    Crashed,
    Exited,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Terminating => "terminating",
            Self::Crashed => "crashed",
            Self::Exited => "exited",
        }
    }
}

// --- Core Types ---

/// Where a workflow's issue set comes from.
///
/// `goal` workflows start empty; the orchestrator populates them
/// dynamically as it plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowSource {
    Spec { spec_id: String },
    Issues { ids: Vec<String> },
    RootIssue { issue_id: String },
    Goal { text: String },
}

/// Per-workflow configuration, merged from daemon defaults and caller
/// overrides at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Checkpoint every N completed steps (1 = every step).
    pub checkpoint_interval: u32,
    /// Keep scheduling remaining steps after a step failure.
    pub continue_on_step_failure: bool,
    /// Per-step execution timeout in milliseconds (0 = no timeout).
    pub step_timeout_ms: u64,
    /// Reuse a pre-provisioned worktree instead of creating one.
    pub reuse_worktree_path: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 1,
            continue_on_step_failure: false,
            step_timeout_ms: 0,
            reuse_worktree_path: None,
        }
    }
}

/// One node of a workflow, backed by a single execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: Id,
    /// The issue this step implements.
    pub issue_id: String,
    /// Position in the workflow's step list.
    pub index: u32,
    /// Step ids that must complete before this step becomes ready.
    pub dependencies: Vec<Id>,
    pub status: StepStatus,
    /// Execution backing this step, set when the step starts running.
    pub execution_id: Option<Id>,
    /// Error message from the last failed attempt.
    pub error: Option<String>,
}

/// An ordered execution of one or more steps toward a development goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Id,
    pub title: String,
    pub source: WorkflowSource,
    pub status: WorkflowStatus,
    pub steps: Vec<WorkflowStep>,
    /// Branch the workflow worktree is created from.
    pub base_branch: String,
    /// Worktree shared by every step of this workflow.
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    /// Number of steps that have reached a settled status.
    pub current_step_index: u32,
    /// Latest orchestrator follow-up execution, if any.
    pub orchestrator_execution_id: Option<Id>,
    /// Agent session id of the orchestrator, threaded into follow-ups.
    pub orchestrator_session_id: Option<String>,
    pub config: WorkflowConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Look up a step by id.
    pub fn step(&self, step_id: &Id) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    /// Whether every step has settled as completed or skipped.
    pub fn all_steps_done(&self) -> bool {
        self.steps.iter().all(|s| s.status.satisfies_dependency())
    }
}

/// Progress counters reported by an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub done: u32,
    pub total: u32,
}

/// One run of an agent process against a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Id,
    pub workflow_id: Option<Id>,
    pub step_id: Option<Id>,
    pub issue_id: Option<String>,
    pub status: ExecutionStatus,
    pub worktree_path: String,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    pub agent_id: String,
    pub progress: Progress,
    pub exit_code: Option<i32>,
    /// Commit hash recorded after the agent finished, if any.
    pub after_commit: Option<String>,
    pub files_changed: Option<Vec<String>>,
    pub error_message: Option<String>,
}

/// Result of one settled step, carried inside checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: Id,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Resumable workflow state captured inside a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub status: WorkflowStatus,
    pub current_step_index: u32,
    /// Free-form orchestrator context carried across pause/resume.
    pub context: serde_json::Value,
    pub step_results: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub resumed_at: Option<DateTime<Utc>>,
}

/// A persisted snapshot of workflow state sufficient to resume execution.
///
/// A later checkpoint for the same workflow fully supersedes earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workflow_id: Id,
    pub execution_id: Id,
    /// Snapshot of the workflow definition (steps, source, config).
    pub definition: serde_json::Value,
    pub state: CheckpointState,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn workflow_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&WorkflowStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&WorkflowStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }

    #[test]
    fn step_status_dependency_satisfaction() {
        assert!(StepStatus::Completed.satisfies_dependency());
        assert!(StepStatus::Skipped.satisfies_dependency());
        assert!(!StepStatus::Ready.satisfies_dependency());
        assert!(!StepStatus::Failed.satisfies_dependency());
    }

    #[test]
    fn workflow_source_round_trips() {
        let source = WorkflowSource::RootIssue {
            issue_id: "i-42".to_string(),
        };
        let json = serde_json::to_string(&source).unwrap();
        assert!(json.contains("root_issue"));
        let parsed: WorkflowSource = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, source);
    }

    #[test]
    fn workflow_config_defaults() {
        let config = WorkflowConfig::default();
        assert_eq!(config.checkpoint_interval, 1);
        assert!(!config.continue_on_step_failure);
        assert_eq!(config.step_timeout_ms, 0);
        assert!(config.reuse_worktree_path.is_none());
    }

    #[test]
    fn execution_status_terminal_states() {
        assert!(ExecutionStatus::Stopped.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Preparing.is_terminal());
    }

    #[test]
    fn all_steps_done_counts_skipped() {
        let now = Utc::now();
        let step = |status| WorkflowStep {
            id: Id::new(),
            issue_id: "i-1".to_string(),
            index: 0,
            dependencies: Vec::new(),
            status,
            execution_id: None,
            error: None,
        };
        let workflow = Workflow {
            id: Id::new(),
            title: "test".to_string(),
            source: WorkflowSource::Goal {
                text: "goal".to_string(),
            },
            status: WorkflowStatus::Running,
            steps: vec![step(StepStatus::Completed), step(StepStatus::Skipped)],
            base_branch: "main".to_string(),
            worktree_path: None,
            branch_name: None,
            current_step_index: 2,
            orchestrator_execution_id: None,
            orchestrator_session_id: None,
            config: WorkflowConfig::default(),
            created_at: now,
            updated_at: now,
        };
        assert!(workflow.all_steps_done());
    }
}

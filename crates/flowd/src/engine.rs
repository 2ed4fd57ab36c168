//! Workflow engine: create workflows from a source, schedule ready
//! steps, and drive the lifecycle state machine.
//!
//! One worktree is allocated per workflow and shared by every step, so
//! steps see the file changes of the steps before them. Scheduling is
//! event-driven: the per-workflow loop sleeps on a notifier and is woken
//! by step completions and lifecycle operations, never by polling.

use crate::checkpoint::CheckpointStore;
use crate::deps;
use crate::executor::{ExecutorError, Task, TaskExecutor, TaskResult};
use crate::storage::{Storage, StorageError, WorkflowFilter};
use crate::wakeup::WakeupService;
use crate::worktree::{self, WorkflowWorktree, WorktreeError};
use chrono::Utc;
use dashmap::DashMap;
use flow_core::entity::{Entity, EntityKind, RELATION_BLOCKS, RELATION_DEPENDS_ON, RELATION_IMPLEMENTS};
use flow_core::events::WorkflowEventType;
use flow_core::{
    Config, Id, StepResult, StepStatus, Workflow, WorkflowConfig, WorkflowSource, WorkflowStatus,
    WorkflowStep,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("wakeup error: {0}")]
    Wakeup(#[from] crate::wakeup::WakeupError),
    #[error("invalid workflow source: dependency cycle through {0:?}")]
    DependencyCycle(Vec<Vec<String>>),
    #[error("operation {operation} not allowed while workflow is {status}")]
    InvalidState {
        operation: &'static str,
        status: &'static str,
    },
    #[error("operation {operation} not allowed while step is {status}")]
    InvalidStepState {
        operation: &'static str,
        status: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Caller-supplied overrides, overlaid on the daemon defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkflowConfigOverrides {
    pub checkpoint_interval: Option<u32>,
    pub continue_on_step_failure: Option<bool>,
    pub step_timeout_ms: Option<u64>,
    pub reuse_worktree_path: Option<String>,
}

impl WorkflowConfigOverrides {
    fn merge_into(&self, defaults: WorkflowConfig) -> WorkflowConfig {
        WorkflowConfig {
            checkpoint_interval: self.checkpoint_interval.unwrap_or(defaults.checkpoint_interval),
            continue_on_step_failure: self
                .continue_on_step_failure
                .unwrap_or(defaults.continue_on_step_failure),
            step_timeout_ms: self.step_timeout_ms.unwrap_or(defaults.step_timeout_ms),
            reuse_worktree_path: self
                .reuse_worktree_path
                .clone()
                .or(defaults.reuse_worktree_path),
        }
    }
}

/// Request to create a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkflowRequest {
    pub title: String,
    pub source: WorkflowSource,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub config: WorkflowConfigOverrides,
}

/// Engine lifecycle events delivered to listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    WorkflowStarted { workflow_id: Id },
    WorkflowCompleted { workflow_id: Id },
    WorkflowFailed { workflow_id: Id, error: String },
    WorkflowPaused { workflow_id: Id },
    WorkflowResumed { workflow_id: Id },
    WorkflowCancelled { workflow_id: Id },
    StepStarted { workflow_id: Id, step_id: Id },
    StepCompleted { workflow_id: Id, step_id: Id },
    StepFailed {
        workflow_id: Id,
        step_id: Id,
        error: String,
    },
    StepSkipped {
        workflow_id: Id,
        step_id: Id,
        reason: Option<String>,
    },
}

/// The workflow engine. Public operations are safe to call concurrently;
/// state for one workflow is serialized behind a per-workflow lock.
#[derive(Debug)]
pub struct WorkflowEngine {
    storage: Arc<Storage>,
    executor: Arc<TaskExecutor>,
    wakeup: Arc<WakeupService>,
    checkpoints: CheckpointStore,
    config: Config,
    workspace_root: PathBuf,
    events_tx: broadcast::Sender<EngineEvent>,
    locks: DashMap<Id, Arc<Mutex<()>>>,
    notifiers: DashMap<Id, Arc<Notify>>,
    step_results: DashMap<Id, Vec<StepResult>>,
    worktrees: DashMap<Id, WorkflowWorktree>,
}

impl WorkflowEngine {
    pub fn new(
        storage: Arc<Storage>,
        executor: Arc<TaskExecutor>,
        wakeup: Arc<WakeupService>,
        config: Config,
        workspace_root: PathBuf,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            checkpoints: CheckpointStore::new(Arc::clone(&storage)),
            storage,
            executor,
            wakeup,
            config,
            workspace_root,
            events_tx,
            locks: DashMap::new(),
            notifiers: DashMap::new(),
            step_results: DashMap::new(),
            worktrees: DashMap::new(),
        }
    }

    /// Subscribe to engine events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    fn lock_for(&self, workflow_id: &Id) -> Arc<Mutex<()>> {
        self.locks
            .entry(workflow_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn notifier_for(&self, workflow_id: &Id) -> Arc<Notify> {
        self.notifiers
            .entry(workflow_id.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    // --- Creation ---

    /// Create a workflow: resolve the source to issues, analyze their
    /// dependencies, and persist the step graph.
    pub async fn create_workflow(&self, request: CreateWorkflowRequest) -> Result<Workflow> {
        let issues = self.storage.list_entities(EntityKind::Issue).await?;
        let issues_by_id: HashMap<String, Entity> =
            issues.into_iter().map(|i| (i.id.clone(), i)).collect();

        let issue_ids = resolve_source(&request.source, &issues_by_id);
        let analysis = deps::analyze(&issue_ids, &issues_by_id);
        if let Some(cycles) = analysis.cycles {
            return Err(EngineError::DependencyCycle(cycles));
        }

        // One step per issue, in topological order. Dependencies map the
        // DAG's in-edges onto step ids.
        let mut step_ids: HashMap<&str, Id> = HashMap::new();
        for issue_id in &analysis.topological_order {
            step_ids.insert(issue_id.as_str(), Id::new());
        }

        let mut steps = Vec::with_capacity(analysis.topological_order.len());
        for (index, issue_id) in analysis.topological_order.iter().enumerate() {
            let dependencies: Vec<Id> = analysis
                .edges
                .iter()
                .filter(|(_, to)| to == issue_id)
                .filter_map(|(from, _)| step_ids.get(from.as_str()).cloned())
                .collect();

            // An issue already closed at creation time needs no work.
            let closed = issues_by_id
                .get(issue_id)
                .is_some_and(issue_is_closed);
            let dep_issues_closed = |deps: &[Id]| {
                deps.iter().all(|dep_id| {
                    analysis.topological_order.iter().any(|other| {
                        step_ids.get(other.as_str()) == Some(dep_id)
                            && issues_by_id.get(other).is_some_and(issue_is_closed)
                    })
                })
            };
            let status = if closed {
                StepStatus::Completed
            } else if dependencies.is_empty() || dep_issues_closed(&dependencies) {
                StepStatus::Ready
            } else {
                StepStatus::Pending
            };

            steps.push(WorkflowStep {
                id: step_ids[issue_id.as_str()].clone(),
                issue_id: issue_id.clone(),
                index: index as u32,
                dependencies,
                status,
                execution_id: None,
                error: None,
            });
        }

        let base_branch = match request.base_branch {
            Some(branch) => branch,
            None => self
                .config
                .base_branch
                .clone()
                .unwrap_or_else(|| "main".to_string()),
        };

        let defaults = WorkflowConfig {
            checkpoint_interval: self.config.checkpoint_interval,
            continue_on_step_failure: self.config.continue_on_step_failure,
            step_timeout_ms: self.config.step_timeout_ms,
            reuse_worktree_path: None,
        };
        let now = Utc::now();
        let workflow = Workflow {
            id: Id::new(),
            title: request.title,
            source: request.source,
            status: WorkflowStatus::Pending,
            steps,
            base_branch,
            worktree_path: None,
            branch_name: None,
            current_step_index: 0,
            orchestrator_execution_id: None,
            orchestrator_session_id: None,
            config: request.config.merge_into(defaults),
            created_at: now,
            updated_at: now,
        };

        self.storage.insert_workflow(&workflow).await?;
        info!(
            workflow_id = %workflow.id,
            title = %workflow.title,
            steps = workflow.steps.len(),
            "workflow created"
        );
        Ok(workflow)
    }

    // --- Lifecycle ---

    /// Start a pending workflow: allocate its worktree and begin
    /// scheduling.
    pub async fn start_workflow(self: &Arc<Self>, workflow_id: &Id) -> Result<()> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let workflow = self.storage.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Pending {
            return Err(EngineError::InvalidState {
                operation: "start",
                status: workflow.status.as_str(),
            });
        }

        let allocated = worktree::allocate(
            &self.config,
            &self.workspace_root,
            &workflow.title,
            &workflow.base_branch,
            workflow.config.reuse_worktree_path.as_deref(),
        )?;
        self.storage
            .update_workflow_worktree(
                workflow_id,
                &allocated.path.display().to_string(),
                &allocated.branch,
            )
            .await?;
        self.worktrees.insert(workflow_id.clone(), allocated);

        self.storage
            .update_workflow_status(workflow_id, WorkflowStatus::Running)
            .await?;
        self.emit(EngineEvent::WorkflowStarted {
            workflow_id: workflow_id.clone(),
        });
        info!(workflow_id = %workflow_id, "workflow started");

        self.spawn_scheduling_loop(workflow_id.clone());
        Ok(())
    }

    /// Pause a running workflow. In-flight steps run to completion; no
    /// new steps are scheduled. A checkpoint captures the current state.
    pub async fn pause_workflow(&self, workflow_id: &Id) -> Result<()> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let workflow = self.storage.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Running {
            return Err(EngineError::InvalidState {
                operation: "pause",
                status: workflow.status.as_str(),
            });
        }

        self.storage
            .update_workflow_status(workflow_id, WorkflowStatus::Paused)
            .await?;
        let mut paused = workflow;
        paused.status = WorkflowStatus::Paused;
        self.write_checkpoint(&paused, None).await;

        self.emit(EngineEvent::WorkflowPaused {
            workflow_id: workflow_id.clone(),
        });
        self.notifier_for(workflow_id).notify_one();
        info!(workflow_id = %workflow_id, "workflow paused");
        Ok(())
    }

    /// Resume a paused workflow from its latest checkpoint. Completed
    /// steps are not re-executed. An optional message is recorded as a
    /// `user_response` event for the orchestrator.
    pub async fn resume_workflow(
        self: &Arc<Self>,
        workflow_id: &Id,
        message: Option<String>,
    ) -> Result<()> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let workflow = self.storage.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Paused {
            return Err(EngineError::InvalidState {
                operation: "resume",
                status: workflow.status.as_str(),
            });
        }

        // Rebuild in-memory results from the checkpoint after a restart.
        if self.step_results.get(workflow_id).is_none() {
            if let Ok(Some(checkpoint)) = self.checkpoints.latest_for_workflow(workflow_id).await {
                self.step_results
                    .insert(workflow_id.clone(), checkpoint.state.step_results);
            }
        }

        self.storage
            .update_workflow_status(workflow_id, WorkflowStatus::Running)
            .await?;

        drop(_guard);
        if let Some(message) = message {
            self.wakeup
                .record_event(
                    workflow_id,
                    WorkflowEventType::UserResponse,
                    None,
                    None,
                    serde_json::json!({ "message": message }),
                )
                .await?;
        }

        self.emit(EngineEvent::WorkflowResumed {
            workflow_id: workflow_id.clone(),
        });
        info!(workflow_id = %workflow_id, "workflow resumed");
        self.spawn_scheduling_loop(workflow_id.clone());
        Ok(())
    }

    /// Cancel a workflow: terminate in-flight executions, mark the
    /// workflow cancelled, and write a final checkpoint. Partial results
    /// are retained.
    pub async fn cancel_workflow(&self, workflow_id: &Id) -> Result<()> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let workflow = self.storage.get_workflow(workflow_id).await?;
        if matches!(
            workflow.status,
            WorkflowStatus::Completed | WorkflowStatus::Cancelled
        ) {
            return Err(EngineError::InvalidState {
                operation: "cancel",
                status: workflow.status.as_str(),
            });
        }

        for step in &workflow.steps {
            if step.status == StepStatus::Running {
                if let Some(execution_id) = &step.execution_id {
                    self.executor.cancel(execution_id);
                }
            }
        }

        self.storage
            .update_workflow_status(workflow_id, WorkflowStatus::Cancelled)
            .await?;
        let mut cancelled = workflow;
        cancelled.status = WorkflowStatus::Cancelled;
        self.write_checkpoint(&cancelled, None).await;
        self.wakeup.clear_workflow(workflow_id).await;

        self.emit(EngineEvent::WorkflowCancelled {
            workflow_id: workflow_id.clone(),
        });
        self.notifier_for(workflow_id).notify_one();
        info!(workflow_id = %workflow_id, "workflow cancelled");
        Ok(())
    }

    /// Reset a failed step so it can run again. `fresh_start` clears the
    /// prior execution's results from checkpoint context.
    pub async fn retry_step(
        self: &Arc<Self>,
        step_id: &Id,
        fresh_start: bool,
    ) -> Result<()> {
        let workflow_id = self.storage.find_step_workflow(step_id).await?;
        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;

        let workflow = self.storage.get_workflow(&workflow_id).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| StorageError::StepNotFound(step_id.to_string()))?;
        if step.status != StepStatus::Failed {
            return Err(EngineError::InvalidStepState {
                operation: "retry",
                status: step.status.as_str(),
            });
        }

        let deps_met = step.dependencies.iter().all(|dep| {
            workflow
                .step(dep)
                .is_some_and(|d| d.status.satisfies_dependency())
        });
        let status = if deps_met {
            StepStatus::Ready
        } else {
            StepStatus::Pending
        };
        self.storage.reset_step(step_id, status).await?;

        if fresh_start {
            if let Some(mut results) = self.step_results.get_mut(&workflow_id) {
                results.retain(|r| &r.step_id != step_id);
            }
        }

        let was_failed = workflow.status == WorkflowStatus::Failed;
        if was_failed {
            self.storage
                .update_workflow_status(&workflow_id, WorkflowStatus::Running)
                .await?;
        }
        drop(_guard);

        info!(workflow_id = %workflow_id, step_id = %step_id, fresh_start, "step reset for retry");
        if was_failed {
            self.spawn_scheduling_loop(workflow_id);
        } else {
            self.notifier_for(&workflow_id).notify_one();
        }
        Ok(())
    }

    /// Mark a step skipped. Skipped steps satisfy downstream dependency
    /// checks exactly like completed ones.
    pub async fn skip_step(self: &Arc<Self>, step_id: &Id, reason: Option<String>) -> Result<()> {
        let workflow_id = self.storage.find_step_workflow(step_id).await?;
        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;

        let workflow = self.storage.get_workflow(&workflow_id).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| StorageError::StepNotFound(step_id.to_string()))?;
        if matches!(step.status, StepStatus::Completed | StepStatus::Running) {
            return Err(EngineError::InvalidStepState {
                operation: "skip",
                status: step.status.as_str(),
            });
        }

        self.storage
            .update_step(step_id, StepStatus::Skipped, None, reason.as_deref())
            .await?;
        self.update_progress(&workflow_id).await;

        let was_failed = workflow.status == WorkflowStatus::Failed;
        if was_failed {
            self.storage
                .update_workflow_status(&workflow_id, WorkflowStatus::Running)
                .await?;
        }
        drop(_guard);

        self.wakeup
            .record_event(
                &workflow_id,
                WorkflowEventType::StepCompleted,
                None,
                Some(step_id),
                serde_json::json!({ "skipped": true, "reason": reason.clone() }),
            )
            .await?;
        self.emit(EngineEvent::StepSkipped {
            workflow_id: workflow_id.clone(),
            step_id: step_id.clone(),
            reason,
        });

        if was_failed {
            self.spawn_scheduling_loop(workflow_id);
        } else {
            self.notifier_for(&workflow_id).notify_one();
        }
        Ok(())
    }

    // --- Queries ---

    pub async fn get_workflow(&self, workflow_id: &Id) -> Result<Workflow> {
        Ok(self.storage.get_workflow(workflow_id).await?)
    }

    pub async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        Ok(self.storage.list_workflows(filter).await?)
    }

    /// Steps that are ready to run right now.
    pub async fn get_ready_steps(&self, workflow_id: &Id) -> Result<Vec<WorkflowStep>> {
        let workflow = self.storage.get_workflow(workflow_id).await?;
        Ok(ready_steps(&workflow))
    }

    // --- Recovery ---

    /// Re-adopt workflows left `running` by a previous daemon process.
    /// Their in-flight steps are reset to ready and scheduling resumes
    /// from the persisted step statuses.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let running = self
            .storage
            .list_workflows(&WorkflowFilter {
                status: Some(WorkflowStatus::Running),
                ..WorkflowFilter::default()
            })
            .await?;

        for workflow in &running {
            for step in &workflow.steps {
                if step.status == StepStatus::Running {
                    self.storage.reset_step(&step.id, StepStatus::Ready).await?;
                }
            }
            if let Ok(Some(checkpoint)) =
                self.checkpoints.latest_for_workflow(&workflow.id).await
            {
                self.step_results
                    .insert(workflow.id.clone(), checkpoint.state.step_results);
            }
            info!(workflow_id = %workflow.id, "resuming interrupted workflow");
            self.spawn_scheduling_loop(workflow.id.clone());
        }
        Ok(running.len())
    }

    // --- Scheduling internals ---

    fn spawn_scheduling_loop(self: &Arc<Self>, workflow_id: Id) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.scheduling_loop(workflow_id).await;
        });
    }

    async fn scheduling_loop(self: Arc<Self>, workflow_id: Id) {
        let notifier = self.notifier_for(&workflow_id);
        loop {
            let launched = {
                let lock = self.lock_for(&workflow_id);
                let _guard = lock.lock().await;

                let workflow = match self.storage.get_workflow(&workflow_id).await {
                    Ok(workflow) => workflow,
                    Err(e) => {
                        error!(workflow_id = %workflow_id, error = %e, "scheduling: load failed");
                        break;
                    }
                };
                if workflow.status != WorkflowStatus::Running {
                    break;
                }

                let running = workflow
                    .steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Running)
                    .count();
                let ready = ready_steps(&workflow);

                if ready.is_empty() && running == 0 {
                    self.finalize(&workflow).await;
                    break;
                }

                let capacity = self.config.max_concurrent_steps.saturating_sub(running);
                let mut launched = 0;
                for step in ready.into_iter().take(capacity) {
                    if let Err(e) = self.launch_step(&workflow, &step).await {
                        error!(
                            workflow_id = %workflow_id,
                            step_id = %step.id,
                            error = %e,
                            "step launch failed"
                        );
                        // Do not leave the step stranded in running.
                        let _ = self
                            .storage
                            .update_step(
                                &step.id,
                                StepStatus::Failed,
                                None,
                                Some(&e.to_string()),
                            )
                            .await;
                    }
                    launched += 1;
                }
                launched
            };

            if launched == 0 {
                // Sleep until a completion or lifecycle operation wakes us.
                notifier.notified().await;
            }
        }
    }

    async fn launch_step(self: &Arc<Self>, workflow: &Workflow, step: &WorkflowStep) -> Result<()> {
        let execution_id = Id::new();
        self.storage
            .update_step(&step.id, StepStatus::Running, Some(&execution_id), None)
            .await?;

        self.wakeup
            .record_event(
                &workflow.id,
                WorkflowEventType::StepStarted,
                Some(&execution_id),
                Some(&step.id),
                serde_json::json!({ "issue_id": step.issue_id }),
            )
            .await?;
        self.emit(EngineEvent::StepStarted {
            workflow_id: workflow.id.clone(),
            step_id: step.id.clone(),
        });

        if workflow.config.step_timeout_ms > 0 {
            self.wakeup.start_execution_timeout(
                execution_id.clone(),
                workflow.id.clone(),
                step.id.clone(),
                Duration::from_millis(workflow.config.step_timeout_ms),
            );
        }

        let work_dir = workflow
            .worktree_path
            .as_ref()
            .map_or_else(|| self.workspace_root.clone(), PathBuf::from);
        let mut args = self.config.agent_args.clone();
        args.push(step.issue_id.clone());

        let task = Task {
            id: step.id.clone(),
            workflow_id: Some(workflow.id.clone()),
            step_id: Some(step.id.clone()),
            issue_id: Some(step.issue_id.clone()),
            family: format!("step:{}", workflow.id),
            executable: self.config.agent_bin.clone(),
            args,
            work_dir,
            env: vec![
                ("FLOW_WORKFLOW_ID".to_string(), workflow.id.to_string()),
                ("FLOW_STEP_ID".to_string(), step.id.to_string()),
                ("FLOW_ISSUE_ID".to_string(), step.issue_id.clone()),
            ],
            branch: workflow
                .branch_name
                .clone()
                .unwrap_or_else(|| workflow.base_branch.clone()),
            agent_id: "step".to_string(),
        };

        let engine = Arc::clone(self);
        let policy = self.config.retry_policy();
        let workflow_id = workflow.id.clone();
        let step_id = step.id.clone();
        tokio::spawn(async move {
            let result = engine
                .executor
                .execute_task(execution_id.clone(), task, &policy)
                .await;
            engine
                .on_step_settled(workflow_id, step_id, execution_id, result)
                .await;
        });

        Ok(())
    }

    async fn on_step_settled(
        self: &Arc<Self>,
        workflow_id: Id,
        step_id: Id,
        execution_id: Id,
        result: std::result::Result<TaskResult, ExecutorError>,
    ) {
        self.wakeup.cancel_execution_timeout(&execution_id);

        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;

        let workflow = match self.storage.get_workflow(&workflow_id).await {
            Ok(workflow) => workflow,
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "settle: load failed");
                return;
            }
        };

        let (step_status, step_result, error) = match &result {
            Ok(task_result) if task_result.success => (
                StepStatus::Completed,
                StepResult {
                    step_id: step_id.clone(),
                    success: true,
                    exit_code: task_result.exit_code,
                    error: None,
                    duration_ms: task_result.duration_ms,
                },
                None,
            ),
            Ok(task_result) => (
                StepStatus::Failed,
                StepResult {
                    step_id: step_id.clone(),
                    success: false,
                    exit_code: task_result.exit_code,
                    error: task_result.error.clone(),
                    duration_ms: task_result.duration_ms,
                },
                Some(
                    task_result
                        .error
                        .clone()
                        .unwrap_or_else(|| "step failed".to_string()),
                ),
            ),
            Err(e) => (
                StepStatus::Failed,
                StepResult {
                    step_id: step_id.clone(),
                    success: false,
                    exit_code: None,
                    error: Some(e.to_string()),
                    duration_ms: 0,
                },
                Some(e.to_string()),
            ),
        };
        let stopped = matches!(
            &result,
            Ok(task_result) if task_result.status == flow_core::ExecutionStatus::Stopped
        );

        if let Err(e) = self
            .storage
            .update_step(&step_id, step_status, None, error.as_deref())
            .await
        {
            error!(step_id = %step_id, error = %e, "settle: step update failed");
        }

        self.step_results
            .entry(workflow_id.clone())
            .or_default()
            .push(step_result);
        let settled = self.update_progress(&workflow_id).await;

        if step_status == StepStatus::Completed {
            // Stamp the worktree's resulting commit onto the execution.
            if let Some(worktree_path) = &workflow.worktree_path {
                if let Ok(commit) = worktree::head_commit(std::path::Path::new(worktree_path)) {
                    let _ = self
                        .storage
                        .record_execution_commit(&execution_id, &commit)
                        .await;
                }
            }

            let _ = self
                .wakeup
                .record_event(
                    &workflow_id,
                    WorkflowEventType::StepCompleted,
                    Some(&execution_id),
                    Some(&step_id),
                    serde_json::Value::Null,
                )
                .await;
            self.emit(EngineEvent::StepCompleted {
                workflow_id: workflow_id.clone(),
                step_id: step_id.clone(),
            });
        } else if !stopped {
            let _ = self
                .wakeup
                .record_event(
                    &workflow_id,
                    WorkflowEventType::StepFailed,
                    Some(&execution_id),
                    Some(&step_id),
                    serde_json::json!({ "error": error.clone() }),
                )
                .await;
            self.emit(EngineEvent::StepFailed {
                workflow_id: workflow_id.clone(),
                step_id: step_id.clone(),
                error: error.clone().unwrap_or_default(),
            });
        }

        // Checkpoint cadence: every `checkpoint_interval` settled steps,
        // plus always on failure.
        let interval = workflow.config.checkpoint_interval.max(1);
        let failure = step_status == StepStatus::Failed && !stopped;
        if failure || settled % interval == 0 {
            let mut current = workflow.clone();
            if let Ok(reloaded) = self.storage.get_workflow(&workflow_id).await {
                current = reloaded;
            }
            self.write_checkpoint(&current, Some(&execution_id)).await;
        }

        // Fatal failure unless the workflow is configured to continue.
        if failure
            && !workflow.config.continue_on_step_failure
            && workflow.status == WorkflowStatus::Running
        {
            let message = error.unwrap_or_else(|| "step failed".to_string());
            if let Err(e) = self
                .storage
                .update_workflow_status(&workflow_id, WorkflowStatus::Failed)
                .await
            {
                error!(workflow_id = %workflow_id, error = %e, "settle: fail transition failed");
            }
            self.emit(EngineEvent::WorkflowFailed {
                workflow_id: workflow_id.clone(),
                error: message,
            });
            warn!(workflow_id = %workflow_id, step_id = %step_id, "workflow failed");
        }

        drop(_guard);
        self.notifier_for(&workflow_id).notify_one();
    }

    /// Recount settled steps and persist the counter. Returns the count.
    async fn update_progress(&self, workflow_id: &Id) -> u32 {
        let Ok(workflow) = self.storage.get_workflow(workflow_id).await else {
            return 0;
        };
        let settled = workflow
            .steps
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
                )
            })
            .count() as u32;
        let _ = self
            .storage
            .update_workflow_progress(workflow_id, settled)
            .await;
        settled
    }

    /// Called with no ready and no running steps: either everything is
    /// done, or pending steps are permanently blocked.
    async fn finalize(&self, workflow: &Workflow) {
        let Ok(current) = self.storage.get_workflow(&workflow.id).await else {
            return;
        };
        if current.status != WorkflowStatus::Running {
            return;
        }

        // Recount here too: steps born completed never pass through the
        // settle path.
        self.update_progress(&current.id).await;

        if current.all_steps_done() {
            if let Err(e) = self
                .storage
                .update_workflow_status(&current.id, WorkflowStatus::Completed)
                .await
            {
                error!(workflow_id = %current.id, error = %e, "complete transition failed");
                return;
            }
            let mut completed = current.clone();
            completed.status = WorkflowStatus::Completed;
            self.write_checkpoint(&completed, None).await;
            self.emit(EngineEvent::WorkflowCompleted {
                workflow_id: current.id.clone(),
            });
            info!(workflow_id = %current.id, "workflow completed");

            if self.config.worktree_cleanup {
                if let Some((_, allocated)) = self.worktrees.remove(&current.id) {
                    if let Err(e) = worktree::remove(&self.workspace_root, &allocated) {
                        warn!(workflow_id = %current.id, error = %e, "worktree cleanup failed");
                    }
                }
            }
        } else {
            let failed = current
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .count();
            let blocked = current
                .steps
                .iter()
                .any(|s| matches!(s.status, StepStatus::Pending | StepStatus::Ready));
            let message = if blocked {
                "remaining steps are blocked by failed dependencies".to_string()
            } else {
                format!("{failed} step(s) failed")
            };
            let _ = self
                .storage
                .update_workflow_status(&current.id, WorkflowStatus::Failed)
                .await;
            self.emit(EngineEvent::WorkflowFailed {
                workflow_id: current.id.clone(),
                error: message,
            });
            warn!(workflow_id = %current.id, failed, "workflow failed");
        }
    }

    async fn write_checkpoint(&self, workflow: &Workflow, execution_id: Option<&Id>) {
        let results = self
            .step_results
            .get(&workflow.id)
            .map(|r| r.clone())
            .unwrap_or_default();
        let execution_id = execution_id.cloned().unwrap_or_else(|| workflow.id.clone());
        let checkpoint =
            CheckpointStore::build(workflow, &execution_id, results, serde_json::Value::Null);
        // Persistence failures are logged inside the store and retried on
        // the next trigger.
        let _ = self.checkpoints.save(&checkpoint).await;
    }
}

/// Steps that may start now: explicitly ready, or pending with every
/// dependency settled as completed/skipped. Ordered by step index.
fn ready_steps(workflow: &Workflow) -> Vec<WorkflowStep> {
    let mut ready: Vec<WorkflowStep> = workflow
        .steps
        .iter()
        .filter(|step| match step.status {
            StepStatus::Ready => true,
            StepStatus::Pending => step.dependencies.iter().all(|dep| {
                workflow
                    .step(dep)
                    .is_some_and(|d| d.status.satisfies_dependency())
            }),
            _ => false,
        })
        .cloned()
        .collect();
    ready.sort_by_key(|s| s.index);
    ready
}

/// Resolve a workflow source to its concrete issue id set.
fn resolve_source(
    source: &WorkflowSource,
    issues_by_id: &HashMap<String, Entity>,
) -> Vec<String> {
    match source {
        WorkflowSource::Issues { ids } => ids
            .iter()
            .filter(|id| issues_by_id.contains_key(*id))
            .cloned()
            .collect(),
        WorkflowSource::Spec { spec_id } => {
            let mut ids: Vec<String> = issues_by_id
                .values()
                .filter(|issue| {
                    issue
                        .relation_targets(RELATION_IMPLEMENTS)
                        .any(|target| target == spec_id)
                })
                .map(|issue| issue.id.clone())
                .collect();
            ids.sort();
            ids
        }
        WorkflowSource::RootIssue { issue_id } => {
            // The root plus everything it transitively needs: issues that
            // block it, and issues it declares dependencies on.
            let mut collected: Vec<String> = Vec::new();
            let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
            let mut frontier = vec![issue_id.clone()];
            while let Some(current) = frontier.pop() {
                if !seen.insert(current.clone()) {
                    continue;
                }
                if !issues_by_id.contains_key(&current) {
                    continue;
                }
                collected.push(current.clone());

                if let Some(issue) = issues_by_id.get(&current) {
                    for target in issue.relation_targets(RELATION_DEPENDS_ON) {
                        frontier.push(target.to_string());
                    }
                }
                for other in issues_by_id.values() {
                    if other
                        .relation_targets(RELATION_BLOCKS)
                        .any(|target| target == current)
                    {
                        frontier.push(other.id.clone());
                    }
                }
            }
            collected.sort();
            collected
        }
        WorkflowSource::Goal { .. } => Vec::new(),
    }
}

fn issue_is_closed(issue: &Entity) -> bool {
    issue
        .extra
        .get("status")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|status| status == "closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::broadcast::SessionBroadcaster;
    use crate::process::ProcessManager;
    use flow_core::entity::Relationship;
    use tempfile::TempDir;

    struct Harness {
        engine: Arc<WorkflowEngine>,
        storage: Arc<Storage>,
        _dir: TempDir,
        _repo: TempDir,
    }

    /// Create a test git repository with one commit.
    fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            std::process::Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        std::process::Command::new("git")
            .args(["add", "."])
            .current_dir(dir.path())
            .output()
            .unwrap();
        std::process::Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    /// Engine wired to `/bin/sh -c <script>`; the issue id arrives as $0.
    async fn create_harness(script: &str, overrides: impl FnOnce(&mut Config)) -> Harness {
        let dir = TempDir::new().unwrap();
        let repo = setup_test_repo();
        let storage = Arc::new(Storage::new(&dir.path().join("test.db")).await.unwrap());
        storage.migrate().await.unwrap();

        let mut config = Config::default();
        config.agent_bin = PathBuf::from("/bin/sh");
        config.agent_args = vec!["-c".to_string(), script.to_string()];
        config.retry_max_attempts = 1;
        config.batch_window_ms = 50;
        config.worktree_path_template = "wt/{{ branch | sanitize }}".to_string();
        config.worktree_cleanup = false;
        overrides(&mut config);

        let processes = Arc::new(ProcessManager::new(Duration::from_secs(2)));
        let breaker = Arc::new(CircuitBreaker::new(100, Duration::from_secs(60)));
        let broadcaster = Arc::new(SessionBroadcaster::new(64));
        let executor = Arc::new(TaskExecutor::new(
            processes,
            breaker,
            broadcaster,
            Arc::clone(&storage),
            "proj".to_string(),
        ));
        let wakeup = Arc::new(WakeupService::new(
            Arc::clone(&storage),
            Arc::clone(&executor),
            &config,
            repo.path().to_path_buf(),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&storage),
            executor,
            wakeup,
            config,
            repo.path().to_path_buf(),
        ));

        Harness {
            engine,
            storage,
            _dir: dir,
            _repo: repo,
        }
    }

    async fn insert_issue(storage: &Storage, id: &str, relationships: Vec<Relationship>) {
        let entity = Entity {
            id: id.to_string(),
            uuid: format!("uuid-{id}"),
            title: format!("Issue {id}"),
            content: "do the thing".to_string(),
            created_at: Some("2025-01-01T00:00:00Z".to_string()),
            updated_at: Some("2025-01-01T00:00:00Z".to_string()),
            relationships,
            tags: Vec::new(),
            extra: serde_json::Map::new(),
        };
        storage.upsert_entity(EntityKind::Issue, &entity).await.unwrap();
    }

    async fn insert_closed_issue(storage: &Storage, id: &str) {
        let mut extra = serde_json::Map::new();
        extra.insert("status".to_string(), serde_json::json!("closed"));
        let entity = Entity {
            id: id.to_string(),
            uuid: format!("uuid-{id}"),
            title: format!("Issue {id}"),
            content: String::new(),
            created_at: None,
            updated_at: None,
            relationships: Vec::new(),
            tags: Vec::new(),
            extra,
        };
        storage.upsert_entity(EntityKind::Issue, &entity).await.unwrap();
    }

    fn issues_request(ids: &[&str]) -> CreateWorkflowRequest {
        CreateWorkflowRequest {
            title: "test workflow".to_string(),
            source: WorkflowSource::Issues {
                ids: ids.iter().map(|s| (*s).to_string()).collect(),
            },
            base_branch: Some("main".to_string()),
            config: WorkflowConfigOverrides::default(),
        }
    }

    async fn wait_for_status(
        storage: &Storage,
        workflow_id: &Id,
        status: WorkflowStatus,
        timeout: Duration,
    ) -> Workflow {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let workflow = storage.get_workflow(workflow_id).await.unwrap();
            if workflow.status == status {
                return workflow;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {status:?}; last: {:?}",
                workflow.status
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn step_execution_count(storage: &Storage, workflow_id: &Id) -> usize {
        storage
            .list_executions(workflow_id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.agent_id == "step")
            .count()
    }

    #[tokio::test]
    async fn sequential_three_step_workflow_completes() {
        let harness = create_harness("echo ok", |_| {}).await;
        for id in ["i-1", "i-2", "i-3"] {
            insert_issue(&harness.storage, id, vec![]).await;
        }

        let workflow = harness
            .engine
            .create_workflow(issues_request(&["i-1", "i-2", "i-3"]))
            .await
            .unwrap();
        assert_eq!(workflow.steps.len(), 3);
        assert_eq!(workflow.status, WorkflowStatus::Pending);

        harness.engine.start_workflow(&workflow.id).await.unwrap();
        let done = wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Completed,
            Duration::from_secs(10),
        )
        .await;

        assert!(done.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(done.current_step_index, 3);
        assert!(done.worktree_path.is_some());
        assert_eq!(step_execution_count(&harness.storage, &workflow.id).await, 3);

        // Exactly one worktree was created for the whole workflow.
        let worktree_path = PathBuf::from(done.worktree_path.unwrap());
        assert!(worktree_path.exists());
        let results = harness.engine.step_results.get(&workflow.id).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn pause_then_resume_without_reexecution() {
        let harness = create_harness("sleep 0.2; echo ok", |config| {
            config.max_concurrent_steps = 1;
        })
        .await;
        for id in ["i-1", "i-2", "i-3", "i-4"] {
            insert_issue(&harness.storage, id, vec![]).await;
        }

        let workflow = harness
            .engine
            .create_workflow(issues_request(&["i-1", "i-2", "i-3", "i-4"]))
            .await
            .unwrap();
        harness.engine.start_workflow(&workflow.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(550)).await;
        harness.engine.pause_workflow(&workflow.id).await.unwrap();
        let paused = wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Paused,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(paused.status, WorkflowStatus::Paused);

        // At least one checkpoint with two or more settled steps.
        let checkpoints = harness
            .engine
            .checkpoints
            .list(Some(&workflow.id))
            .await
            .unwrap();
        assert!(!checkpoints.is_empty());
        let latest = harness
            .engine
            .checkpoints
            .latest_for_workflow(&workflow.id)
            .await
            .unwrap()
            .unwrap();
        assert!(
            latest.state.step_results.len() >= 2,
            "expected >= 2 settled steps, got {}",
            latest.state.step_results.len()
        );

        // Let the in-flight step drain before resuming.
        tokio::time::sleep(Duration::from_millis(400)).await;
        harness
            .engine
            .resume_workflow(&workflow.id, None)
            .await
            .unwrap();
        wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Completed,
            Duration::from_secs(10),
        )
        .await;

        // No completed step ran twice.
        assert_eq!(step_execution_count(&harness.storage, &workflow.id).await, 4);
    }

    #[tokio::test]
    async fn step_failure_fails_the_workflow() {
        let script = r#"case "$0" in i-2) echo boom 1>&2; exit 1;; *) echo ok;; esac"#;
        let harness = create_harness(script, |config| {
            config.max_concurrent_steps = 1;
        })
        .await;
        for id in ["i-1", "i-2", "i-3"] {
            insert_issue(&harness.storage, id, vec![]).await;
        }

        let mut events = harness.engine.subscribe();
        let workflow = harness
            .engine
            .create_workflow(issues_request(&["i-1", "i-2", "i-3"]))
            .await
            .unwrap();
        harness.engine.start_workflow(&workflow.id).await.unwrap();

        let failed = wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Failed,
            Duration::from_secs(10),
        )
        .await;

        // Two step results: success then failure; the third never ran.
        let results = harness.engine.step_results.get(&workflow.id).unwrap().clone();
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(step_execution_count(&harness.storage, &workflow.id).await, 2);

        let failed_step = failed
            .steps
            .iter()
            .find(|s| s.issue_id == "i-2")
            .unwrap();
        assert_eq!(failed_step.status, StepStatus::Failed);
        assert!(failed_step.error.as_deref().unwrap_or("").contains("boom"));

        // Engine emitted both the step failure and the workflow failure.
        let mut saw_step_failed = false;
        let mut saw_workflow_failed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::StepFailed { .. } => saw_step_failed = true,
                EngineEvent::WorkflowFailed { .. } => saw_workflow_failed = true,
                _ => {}
            }
        }
        assert!(saw_step_failed);
        assert!(saw_workflow_failed);
    }

    #[tokio::test]
    async fn continue_on_failure_schedules_remaining_steps() {
        let script = r#"case "$0" in i-2) exit 1;; *) echo ok;; esac"#;
        let harness = create_harness(script, |config| {
            config.max_concurrent_steps = 1;
            config.continue_on_step_failure = true;
        })
        .await;
        for id in ["i-1", "i-2", "i-3"] {
            insert_issue(&harness.storage, id, vec![]).await;
        }

        let workflow = harness
            .engine
            .create_workflow(issues_request(&["i-1", "i-2", "i-3"]))
            .await
            .unwrap();
        harness.engine.start_workflow(&workflow.id).await.unwrap();

        // All three run; the workflow ends failed because i-2 never
        // completed, but i-3 still executed.
        let settled = wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Failed,
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(step_execution_count(&harness.storage, &workflow.id).await, 3);
        let statuses: Vec<StepStatus> = settled.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Completed]
        );
    }

    #[tokio::test]
    async fn dependency_cycle_rejects_creation() {
        let harness = create_harness("echo ok", |_| {}).await;
        insert_issue(
            &harness.storage,
            "a",
            vec![Relationship::new(RELATION_BLOCKS, "b")],
        )
        .await;
        insert_issue(
            &harness.storage,
            "b",
            vec![Relationship::new(RELATION_BLOCKS, "a")],
        )
        .await;

        let result = harness.engine.create_workflow(issues_request(&["a", "b"])).await;
        match result {
            Err(EngineError::DependencyCycle(cycles)) => {
                assert_eq!(cycles.len(), 1);
                assert_eq!(cycles[0].first(), cycles[0].last());
            }
            other => panic!("expected cycle rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dependencies_order_steps() {
        let harness = create_harness("echo ok", |config| {
            config.max_concurrent_steps = 2;
        })
        .await;
        // b depends on a: a must complete first even with spare capacity.
        insert_issue(&harness.storage, "a", vec![]).await;
        insert_issue(
            &harness.storage,
            "b",
            vec![Relationship::new(RELATION_DEPENDS_ON, "a")],
        )
        .await;

        let workflow = harness
            .engine
            .create_workflow(issues_request(&["a", "b"]))
            .await
            .unwrap();
        let step_a = workflow.steps.iter().find(|s| s.issue_id == "a").unwrap();
        let step_b = workflow.steps.iter().find(|s| s.issue_id == "b").unwrap();
        assert_eq!(step_a.status, StepStatus::Ready);
        assert_eq!(step_b.status, StepStatus::Pending);
        assert_eq!(step_b.dependencies, vec![step_a.id.clone()]);

        harness.engine.start_workflow(&workflow.id).await.unwrap();
        wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Completed,
            Duration::from_secs(10),
        )
        .await;
    }

    #[tokio::test]
    async fn closed_issue_step_is_born_completed() {
        let harness = create_harness("echo ok", |_| {}).await;
        insert_closed_issue(&harness.storage, "done-issue").await;
        insert_issue(&harness.storage, "open-issue", vec![]).await;

        let workflow = harness
            .engine
            .create_workflow(issues_request(&["done-issue", "open-issue"]))
            .await
            .unwrap();
        let closed_step = workflow
            .steps
            .iter()
            .find(|s| s.issue_id == "done-issue")
            .unwrap();
        assert_eq!(closed_step.status, StepStatus::Completed);

        harness.engine.start_workflow(&workflow.id).await.unwrap();
        wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Completed,
            Duration::from_secs(10),
        )
        .await;
        // Only the open issue spawned an execution.
        assert_eq!(step_execution_count(&harness.storage, &workflow.id).await, 1);
    }

    #[tokio::test]
    async fn skip_step_unblocks_dependents() {
        let script = r#"case "$0" in bad) exit 1;; *) echo ok;; esac"#;
        let harness = create_harness(script, |config| {
            config.max_concurrent_steps = 1;
        })
        .await;
        insert_issue(&harness.storage, "bad", vec![]).await;
        insert_issue(
            &harness.storage,
            "after",
            vec![Relationship::new(RELATION_DEPENDS_ON, "bad")],
        )
        .await;

        let workflow = harness
            .engine
            .create_workflow(issues_request(&["bad", "after"]))
            .await
            .unwrap();
        harness.engine.start_workflow(&workflow.id).await.unwrap();
        let failed = wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Failed,
            Duration::from_secs(10),
        )
        .await;

        let bad_step = failed.steps.iter().find(|s| s.issue_id == "bad").unwrap();
        harness
            .engine
            .skip_step(&bad_step.id, Some("not needed".to_string()))
            .await
            .unwrap();

        let done = wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Completed,
            Duration::from_secs(10),
        )
        .await;
        let statuses: HashMap<&str, StepStatus> = done
            .steps
            .iter()
            .map(|s| (s.issue_id.as_str(), s.status))
            .collect();
        assert_eq!(statuses["bad"], StepStatus::Skipped);
        assert_eq!(statuses["after"], StepStatus::Completed);
    }

    #[tokio::test]
    async fn retry_step_reruns_a_failed_step() {
        // Fails until the marker file exists in the shared worktree.
        let script = r#"if [ -f fixed ]; then echo ok; else exit 1; fi"#;
        let harness = create_harness(script, |config| {
            config.max_concurrent_steps = 1;
        })
        .await;
        insert_issue(&harness.storage, "flaky", vec![]).await;

        let workflow = harness
            .engine
            .create_workflow(issues_request(&["flaky"]))
            .await
            .unwrap();
        harness.engine.start_workflow(&workflow.id).await.unwrap();
        let failed = wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Failed,
            Duration::from_secs(10),
        )
        .await;

        // Fix the precondition inside the workflow's worktree, then retry.
        let worktree = PathBuf::from(failed.worktree_path.clone().unwrap());
        std::fs::write(worktree.join("fixed"), "yes").unwrap();
        let step_id = failed.steps[0].id.clone();
        harness.engine.retry_step(&step_id, true).await.unwrap();

        wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Completed,
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(step_execution_count(&harness.storage, &workflow.id).await, 2);
    }

    #[tokio::test]
    async fn cancel_terminates_in_flight_steps() {
        let harness = create_harness("sleep 30", |config| {
            config.max_concurrent_steps = 1;
        })
        .await;
        insert_issue(&harness.storage, "slow", vec![]).await;

        let workflow = harness
            .engine
            .create_workflow(issues_request(&["slow"]))
            .await
            .unwrap();
        harness.engine.start_workflow(&workflow.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        harness.engine.cancel_workflow(&workflow.id).await.unwrap();
        let cancelled = wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Cancelled,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(cancelled.status, WorkflowStatus::Cancelled);

        // A final checkpoint exists.
        let checkpoints = harness
            .engine
            .checkpoints
            .list(Some(&workflow.id))
            .await
            .unwrap();
        assert!(!checkpoints.is_empty());

        // Cancelling a cancelled workflow is an invalid transition.
        let again = harness.engine.cancel_workflow(&workflow.id).await;
        assert!(matches!(again, Err(EngineError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn goal_source_creates_empty_workflow() {
        let harness = create_harness("echo ok", |_| {}).await;
        let workflow = harness
            .engine
            .create_workflow(CreateWorkflowRequest {
                title: "open ended".to_string(),
                source: WorkflowSource::Goal {
                    text: "improve the test suite".to_string(),
                },
                base_branch: Some("main".to_string()),
                config: WorkflowConfigOverrides::default(),
            })
            .await
            .unwrap();
        assert!(workflow.steps.is_empty());

        harness.engine.start_workflow(&workflow.id).await.unwrap();
        wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Completed,
            Duration::from_secs(5),
        )
        .await;
    }

    #[tokio::test]
    async fn spec_source_selects_implementing_issues() {
        let harness = create_harness("echo ok", |_| {}).await;
        insert_issue(
            &harness.storage,
            "impl-1",
            vec![Relationship::new(RELATION_IMPLEMENTS, "spec-9")],
        )
        .await;
        insert_issue(
            &harness.storage,
            "impl-2",
            vec![Relationship::new(RELATION_IMPLEMENTS, "spec-9")],
        )
        .await;
        insert_issue(&harness.storage, "unrelated", vec![]).await;

        let workflow = harness
            .engine
            .create_workflow(CreateWorkflowRequest {
                title: "from spec".to_string(),
                source: WorkflowSource::Spec {
                    spec_id: "spec-9".to_string(),
                },
                base_branch: Some("main".to_string()),
                config: WorkflowConfigOverrides::default(),
            })
            .await
            .unwrap();

        let mut issue_ids: Vec<&str> =
            workflow.steps.iter().map(|s| s.issue_id.as_str()).collect();
        issue_ids.sort_unstable();
        assert_eq!(issue_ids, vec!["impl-1", "impl-2"]);
    }

    #[tokio::test]
    async fn root_issue_source_collects_transitive_needs() {
        let harness = create_harness("echo ok", |_| {}).await;
        // root depends on lib; blocker blocks root; lib depends on base.
        insert_issue(
            &harness.storage,
            "root",
            vec![Relationship::new(RELATION_DEPENDS_ON, "lib")],
        )
        .await;
        insert_issue(
            &harness.storage,
            "lib",
            vec![Relationship::new(RELATION_DEPENDS_ON, "base")],
        )
        .await;
        insert_issue(&harness.storage, "base", vec![]).await;
        insert_issue(
            &harness.storage,
            "blocker",
            vec![Relationship::new(RELATION_BLOCKS, "root")],
        )
        .await;
        insert_issue(&harness.storage, "bystander", vec![]).await;

        let workflow = harness
            .engine
            .create_workflow(CreateWorkflowRequest {
                title: "from root".to_string(),
                source: WorkflowSource::RootIssue {
                    issue_id: "root".to_string(),
                },
                base_branch: Some("main".to_string()),
                config: WorkflowConfigOverrides::default(),
            })
            .await
            .unwrap();

        let mut issue_ids: Vec<&str> =
            workflow.steps.iter().map(|s| s.issue_id.as_str()).collect();
        issue_ids.sort_unstable();
        assert_eq!(issue_ids, vec!["base", "blocker", "lib", "root"]);
    }

    #[tokio::test]
    async fn start_requires_pending_status() {
        let harness = create_harness("echo ok", |_| {}).await;
        insert_issue(&harness.storage, "i-1", vec![]).await;
        let workflow = harness
            .engine
            .create_workflow(issues_request(&["i-1"]))
            .await
            .unwrap();

        harness.engine.start_workflow(&workflow.id).await.unwrap();
        wait_for_status(
            &harness.storage,
            &workflow.id,
            WorkflowStatus::Completed,
            Duration::from_secs(10),
        )
        .await;

        let again = harness.engine.start_workflow(&workflow.id).await;
        assert!(matches!(again, Err(EngineError::InvalidState { .. })));
    }
}

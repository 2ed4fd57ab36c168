//! Resilient task executor: drive one task through the process manager
//! under a retry policy.
//!
//! Each attempt spawns a fresh process; nothing is reused across
//! attempts. Failures are classified against the policy and either
//! retried after a backoff sleep or surfaced as fatal. External
//! cancellation terminates the live process, marks the execution
//! `stopped`, and suppresses any further retries, including one that
//! would otherwise start after the current backoff sleep.

use crate::breaker::CircuitBreaker;
use crate::broadcast::SessionBroadcaster;
use crate::normalizer::OutputNormalizer;
use crate::process::{OutputSource, ProcessConfig, ProcessError, ProcessManager};
use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Utc};
use flow_core::{Execution, ExecutionStatus, Id, Progress, RetryPolicy};
use dashmap::DashMap;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("circuit breaker open for task family: {0}")]
    CircuitOpen(String),
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// One unit of work handed to the executor.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Id,
    pub workflow_id: Option<Id>,
    pub step_id: Option<Id>,
    pub issue_id: Option<String>,
    /// Circuit breaker key.
    pub family: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub branch: String,
    pub agent_id: String,
}

/// Record of a single attempt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Final result of one task across all attempts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskResult {
    pub task_id: Id,
    pub execution_id: Id,
    pub success: bool,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub attempts: Vec<AttemptRecord>,
    pub total_attempts: u32,
    pub final_attempt: u32,
}

/// Outcome of one attempt, before classification.
struct AttemptOutcome {
    exit_code: Option<i32>,
    stopped: bool,
    output: String,
    stderr: String,
}

/// Executor wiring: process manager for attempts, breaker for family
/// health, broadcaster for live updates, storage for execution rows.
#[derive(Debug)]
pub struct TaskExecutor {
    processes: Arc<ProcessManager>,
    breaker: Arc<CircuitBreaker>,
    broadcaster: Arc<SessionBroadcaster>,
    storage: Arc<Storage>,
    project_id: String,
    cancellations: DashMap<Id, CancellationToken>,
}

impl TaskExecutor {
    pub fn new(
        processes: Arc<ProcessManager>,
        breaker: Arc<CircuitBreaker>,
        broadcaster: Arc<SessionBroadcaster>,
        storage: Arc<Storage>,
        project_id: String,
    ) -> Self {
        Self {
            processes,
            breaker,
            broadcaster,
            storage,
            project_id,
            cancellations: DashMap::new(),
        }
    }

    /// Cancel a live execution. The running process is terminated and no
    /// further retries start.
    pub fn cancel(&self, execution_id: &Id) -> bool {
        if let Some(token) = self.cancellations.get(execution_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Whether an execution is still being driven by this executor.
    pub fn is_live(&self, execution_id: &Id) -> bool {
        self.cancellations.contains_key(execution_id)
    }

    /// Execute a task to completion under the given policy. The caller
    /// supplies the execution id so it can wire up step records and
    /// timeout watchdogs before the task settles.
    pub async fn execute_task(
        &self,
        execution_id: Id,
        task: Task,
        policy: &RetryPolicy,
    ) -> Result<TaskResult> {
        if !self.breaker.allow(&task.family) {
            return Err(ExecutorError::CircuitOpen(task.family));
        }

        let started_at = Utc::now();
        let cancel_token = CancellationToken::new();
        self.cancellations
            .insert(execution_id.clone(), cancel_token.clone());

        let execution = Execution {
            id: execution_id.clone(),
            workflow_id: task.workflow_id.clone(),
            step_id: task.step_id.clone(),
            issue_id: task.issue_id.clone(),
            status: ExecutionStatus::Preparing,
            worktree_path: task.work_dir.display().to_string(),
            branch: task.branch.clone(),
            started_at,
            completed_at: None,
            last_heartbeat: started_at,
            agent_id: task.agent_id.clone(),
            progress: Progress::default(),
            exit_code: None,
            after_commit: None,
            files_changed: None,
            error_message: None,
        };
        self.storage.insert_execution(&execution).await?;

        let result = self
            .drive_attempts(&task, policy, &execution_id, started_at, &cancel_token)
            .await;

        self.cancellations.remove(&execution_id);
        result
    }

    async fn drive_attempts(
        &self,
        task: &Task,
        policy: &RetryPolicy,
        execution_id: &Id,
        started_at: DateTime<Utc>,
        cancel_token: &CancellationToken,
    ) -> Result<TaskResult> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut output = String::new();
        let mut final_status = ExecutionStatus::Failed;
        let mut final_exit = None;
        let mut final_error: Option<String> = None;

        self.broadcaster
            .broadcast_lifecycle(&self.project_id, execution_id, ExecutionStatus::Running);

        for attempt in 1..=max_attempts {
            info!(
                task_id = %task.id,
                execution_id = %execution_id,
                attempt,
                max_attempts,
                "starting attempt"
            );

            let attempt_started = Utc::now();
            let outcome = self.run_attempt(task, execution_id, cancel_token).await;
            let attempt_finished = Utc::now();
            let duration_ms = (attempt_finished - attempt_started).num_milliseconds().max(0) as u64;

            match outcome {
                Ok(outcome) => {
                    output = outcome.output;
                    let success = outcome.exit_code == Some(0) && !outcome.stopped;
                    let error = if success {
                        None
                    } else if outcome.stopped {
                        Some("cancelled".to_string())
                    } else if outcome.stderr.is_empty() {
                        Some(format!(
                            "exit code {}",
                            outcome.exit_code.map_or(-1, |c| c)
                        ))
                    } else {
                        Some(outcome.stderr.trim_end().to_string())
                    };

                    attempts.push(AttemptRecord {
                        attempt,
                        success,
                        exit_code: outcome.exit_code,
                        error: error.clone(),
                        started_at: attempt_started,
                        completed_at: attempt_finished,
                        duration_ms,
                    });

                    if success {
                        final_status = ExecutionStatus::Completed;
                        final_exit = outcome.exit_code;
                        final_error = None;
                        break;
                    }

                    if outcome.stopped {
                        final_status = ExecutionStatus::Stopped;
                        final_exit = outcome.exit_code;
                        final_error = error;
                        break;
                    }

                    final_exit = outcome.exit_code;
                    final_error = error.clone();

                    let retryable =
                        policy.is_retryable(outcome.exit_code, error.as_deref());
                    if !retryable || !policy.has_attempts_left(attempt) {
                        final_status = ExecutionStatus::Failed;
                        break;
                    }
                }
                Err(e) => {
                    // Spawn failures are retry candidates too.
                    let message = e.to_string();
                    attempts.push(AttemptRecord {
                        attempt,
                        success: false,
                        exit_code: None,
                        error: Some(message.clone()),
                        started_at: attempt_started,
                        completed_at: attempt_finished,
                        duration_ms,
                    });
                    final_exit = None;
                    final_error = Some(message.clone());

                    let retryable = policy.is_retryable(None, Some(&message));
                    if !retryable || !policy.has_attempts_left(attempt) {
                        final_status = ExecutionStatus::Failed;
                        break;
                    }
                }
            }

            // Backoff sleep before the next attempt. Cancellation during
            // the sleep stops the task without a new attempt.
            let jitter_factor = rand::thread_rng().gen_range(0.9..=1.1);
            let delay = policy.backoff.jittered_delay(attempt, jitter_factor);
            warn!(
                task_id = %task.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, backing off"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel_token.cancelled() => {
                    final_status = ExecutionStatus::Stopped;
                    final_error = Some("cancelled".to_string());
                    break;
                }
            }
        }

        let completed_at = Utc::now();
        let total_attempts = attempts.len() as u32;
        let success = final_status == ExecutionStatus::Completed;

        self.storage
            .finish_execution(
                execution_id,
                final_status,
                final_exit,
                final_error.as_deref(),
            )
            .await?;
        self.broadcaster
            .broadcast_lifecycle(&self.project_id, execution_id, final_status);

        if success {
            self.breaker.record_success(&task.family);
        } else if final_status == ExecutionStatus::Failed {
            self.breaker.record_failure(&task.family);
        }

        Ok(TaskResult {
            task_id: task.id.clone(),
            execution_id: execution_id.clone(),
            success,
            status: final_status,
            exit_code: final_exit,
            output,
            error: final_error,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
            attempts,
            total_attempts,
            final_attempt: total_attempts,
        })
    }

    /// One attempt: spawn, stream output through the normalizer, await
    /// exit. Returns the raw outcome for classification.
    async fn run_attempt(
        &self,
        task: &Task,
        execution_id: &Id,
        cancel_token: &CancellationToken,
    ) -> Result<AttemptOutcome> {
        let config = ProcessConfig {
            executable: task.executable.clone(),
            args: task.args.clone(),
            work_dir: task.work_dir.clone(),
            env: task.env.clone(),
        };

        let spawned = self.processes.acquire(config).await?;
        let process_id = spawned.id.clone();
        let mut rx = spawned.output;
        let _ = self.storage.heartbeat_execution(execution_id).await;

        let mut normalizer = OutputNormalizer::new();
        let mut stdout_accum = String::new();
        let mut stderr_accum = String::new();
        let mut stopped = false;
        let mut cancel_requested = false;

        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Ok(chunk) => {
                        match chunk.source {
                            OutputSource::Stdout => {
                                stdout_accum.push_str(&chunk.data);
                                let normalized = normalizer.push_chunk(&chunk.data);
                                for update in &normalized.updates {
                                    self.broadcaster.broadcast_session_update(
                                        &self.project_id,
                                        execution_id,
                                        update,
                                    );
                                }
                            }
                            OutputSource::Stderr => stderr_accum.push_str(&chunk.data),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(execution_id = %execution_id, skipped, "output receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                () = cancel_token.cancelled(), if !cancel_requested => {
                    cancel_requested = true;
                    stopped = true;
                    self.processes.terminate(&process_id, None).await?;
                }
            }
        }

        // Flush whatever the collapse heuristic was holding.
        let flushed = normalizer.finish();
        for update in &flushed.updates {
            self.broadcaster
                .broadcast_session_update(&self.project_id, execution_id, update);
        }

        let exit = self.processes.wait(&process_id).await?;
        self.processes.release(&process_id).await?;

        Ok(AttemptOutcome {
            exit_code: exit.code,
            stopped: stopped || (cancel_requested && exit.signal.is_some()),
            output: stdout_accum,
            stderr: stderr_accum,
        })
    }
}

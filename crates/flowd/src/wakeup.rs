//! Wakeup service: workflow event recording, debounced orchestrator
//! wakeups, await conditions, and execution timeout watchdogs.
//!
//! Recording an event either satisfies a pending await (immediate
//! wakeup) or schedules a debounced wakeup; events landing inside the
//! batch window coalesce into a single orchestrator follow-up. The
//! follow-up always spawns a fresh agent process, passing the stored
//! orchestrator session id along as an argument.

use crate::executor::{Task, TaskExecutor};
use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flow_core::events::{WorkflowEvent, WorkflowEventType};
use flow_core::{Config, Id, RetryPolicy, WorkflowStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WakeupError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, WakeupError>;

/// An in-memory guard pausing the orchestrator until matching events
/// arrive or a timeout fires. At most one per workflow.
#[derive(Debug, Clone)]
pub struct PendingAwait {
    pub id: Id,
    pub workflow_id: Id,
    pub event_types: Vec<WorkflowEventType>,
    pub execution_ids: Option<Vec<Id>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// How an await condition resolved.
#[derive(Debug, Clone)]
pub struct ResolvedAwait {
    pub await_id: Id,
    pub resolved_by: String,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
struct WakeupState {
    awaits: HashMap<Id, PendingAwait>,
    /// Debounce generation per workflow; a scheduled wakeup only fires
    /// if its generation is still current.
    debounce_generation: HashMap<Id, u64>,
    /// Await generation per workflow, bumped on replace/clear so stale
    /// timeout tasks become no-ops.
    await_generation: HashMap<Id, u64>,
}

/// Wakeup service wiring.
#[derive(Debug)]
pub struct WakeupService {
    storage: Arc<Storage>,
    executor: Arc<TaskExecutor>,
    agent_bin: PathBuf,
    agent_args: Vec<String>,
    workspace_root: PathBuf,
    batch_window: Duration,
    state: Mutex<WakeupState>,
    timeouts: dashmap::DashMap<Id, CancellationToken>,
}

impl WakeupService {
    pub fn new(
        storage: Arc<Storage>,
        executor: Arc<TaskExecutor>,
        config: &Config,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            storage,
            executor,
            agent_bin: config.agent_bin.clone(),
            agent_args: config.agent_args.clone(),
            workspace_root,
            batch_window: Duration::from_millis(config.batch_window_ms),
            state: Mutex::new(WakeupState::default()),
            timeouts: dashmap::DashMap::new(),
        }
    }

    /// Record a workflow event. A matching pending await triggers an
    /// immediate wakeup; otherwise a debounced wakeup is scheduled so
    /// bursts coalesce into one orchestrator follow-up.
    pub async fn record_event(
        self: &Arc<Self>,
        workflow_id: &Id,
        event_type: WorkflowEventType,
        execution_id: Option<&Id>,
        step_id: Option<&Id>,
        payload: serde_json::Value,
    ) -> Result<WorkflowEvent> {
        let event = self
            .storage
            .append_event(workflow_id, event_type, execution_id, step_id, payload)
            .await?;

        let resolved = {
            let mut state = self.state.lock().await;
            let matches = state.awaits.get(workflow_id).is_some_and(|pending| {
                pending.event_types.contains(&event_type)
                    && match (&pending.execution_ids, execution_id) {
                        (Some(ids), Some(exec)) => ids.contains(exec),
                        (Some(_), None) => false,
                        (None, _) => true,
                    }
            });
            if matches {
                let pending = state.awaits.remove(workflow_id);
                *state.await_generation.entry(workflow_id.clone()).or_insert(0) += 1;
                pending.map(|p| ResolvedAwait {
                    await_id: p.id,
                    resolved_by: "event".to_string(),
                    message: p.message,
                })
            } else {
                None
            }
        };

        if let Some(resolved) = resolved {
            info!(workflow_id = %workflow_id, await_id = %resolved.await_id, "await resolved");
            let service = Arc::clone(self);
            let workflow_id = workflow_id.clone();
            tokio::spawn(async move {
                service.perform_wakeup(&workflow_id, Some(resolved)).await;
            });
        } else {
            self.schedule_debounced(workflow_id).await;
        }

        Ok(event)
    }

    async fn schedule_debounced(self: &Arc<Self>, workflow_id: &Id) {
        let generation = {
            let mut state = self.state.lock().await;
            let entry = state
                .debounce_generation
                .entry(workflow_id.clone())
                .or_insert(0);
            *entry += 1;
            *entry
        };

        let service = Arc::clone(self);
        let workflow_id = workflow_id.clone();
        let window = self.batch_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let still_current = {
                let state = service.state.lock().await;
                state.debounce_generation.get(&workflow_id) == Some(&generation)
            };
            if still_current {
                service.perform_wakeup(&workflow_id, None).await;
            } else {
                debug!(workflow_id = %workflow_id, "debounced wakeup superseded");
            }
        });
    }

    /// Register an await condition, replacing any prior one for the
    /// workflow.
    pub async fn register_await(
        self: &Arc<Self>,
        workflow_id: &Id,
        event_types: Vec<WorkflowEventType>,
        execution_ids: Option<Vec<Id>>,
        timeout_seconds: Option<u64>,
        message: Option<String>,
    ) -> PendingAwait {
        let pending = PendingAwait {
            id: Id::new(),
            workflow_id: workflow_id.clone(),
            event_types,
            execution_ids,
            timeout_at: timeout_seconds
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs as i64)),
            message,
        };

        let generation = {
            let mut state = self.state.lock().await;
            let counter = state
                .await_generation
                .entry(workflow_id.clone())
                .or_insert(0);
            *counter += 1;
            let generation = *counter;
            state.awaits.insert(workflow_id.clone(), pending.clone());
            generation
        };

        if let Some(timeout_secs) = timeout_seconds {
            let service = Arc::clone(self);
            let workflow_id = workflow_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
                let resolved = {
                    let mut state = service.state.lock().await;
                    if state.await_generation.get(&workflow_id) == Some(&generation) {
                        state.awaits.remove(&workflow_id).map(|p| ResolvedAwait {
                            await_id: p.id,
                            resolved_by: "timeout".to_string(),
                            message: p.message,
                        })
                    } else {
                        None
                    }
                };
                if let Some(resolved) = resolved {
                    warn!(workflow_id = %workflow_id, "await timed out");
                    service.perform_wakeup(&workflow_id, Some(resolved)).await;
                }
            });
        }

        pending
    }

    /// The currently registered await for a workflow, if any.
    pub async fn pending_await(&self, workflow_id: &Id) -> Option<PendingAwait> {
        self.state.lock().await.awaits.get(workflow_id).cloned()
    }

    /// Drop all in-memory state for a workflow (awaits and any pending
    /// debounced wakeup).
    pub async fn clear_workflow(&self, workflow_id: &Id) {
        let mut state = self.state.lock().await;
        state.awaits.remove(workflow_id);
        *state.await_generation.entry(workflow_id.clone()).or_insert(0) += 1;
        *state
            .debounce_generation
            .entry(workflow_id.clone())
            .or_insert(0) += 1;
    }

    /// Arm an execution timeout watchdog. On fire, the execution is
    /// cancelled and a `step_failed{reason:"timeout"}` event is
    /// recorded, which itself schedules a wakeup.
    pub fn start_execution_timeout(
        self: &Arc<Self>,
        execution_id: Id,
        workflow_id: Id,
        step_id: Id,
        timeout: Duration,
    ) {
        let token = CancellationToken::new();
        self.timeouts.insert(execution_id.clone(), token.clone());

        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    warn!(
                        execution_id = %execution_id,
                        workflow_id = %workflow_id,
                        "execution timed out"
                    );
                    service.executor.cancel(&execution_id);
                    let _ = service
                        .record_event(
                            &workflow_id,
                            WorkflowEventType::StepFailed,
                            Some(&execution_id),
                            Some(&step_id),
                            serde_json::json!({"reason": "timeout"}),
                        )
                        .await;
                }
            }
            service.timeouts.remove(&execution_id);
        });
    }

    /// Disarm a watchdog after the execution settled on its own.
    pub fn cancel_execution_timeout(&self, execution_id: &Id) {
        if let Some((_, token)) = self.timeouts.remove(execution_id) {
            token.cancel();
        }
    }

    /// Run one wakeup: gather unprocessed events, build the orchestrator
    /// prompt, create a follow-up execution, and stamp the events.
    async fn perform_wakeup(self: &Arc<Self>, workflow_id: &Id, resolved: Option<ResolvedAwait>) {
        let workflow = match self.storage.get_workflow(workflow_id).await {
            Ok(workflow) => workflow,
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "wakeup: workflow load failed");
                return;
            }
        };

        if workflow.status != WorkflowStatus::Running {
            debug!(
                workflow_id = %workflow_id,
                status = workflow.status.as_str(),
                "wakeup skipped: workflow not running"
            );
            return;
        }

        let events = match self.storage.unprocessed_events(workflow_id).await {
            Ok(events) => events,
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "wakeup: event query failed");
                return;
            }
        };

        if events.is_empty() && resolved.is_none() {
            debug!(workflow_id = %workflow_id, "wakeup skipped: nothing to report");
            return;
        }

        let prompt = self.build_prompt(&workflow.title, &events, resolved.as_ref()).await;
        let execution_id = Id::new();

        let event_ids: Vec<Id> = events.iter().map(|e| e.id.clone()).collect();
        if let Err(e) = self.storage.mark_events_processed(&event_ids).await {
            warn!(workflow_id = %workflow_id, error = %e, "wakeup: failed to stamp events");
            return;
        }
        if let Err(e) = self
            .storage
            .update_workflow_orchestrator(workflow_id, &execution_id, None)
            .await
        {
            warn!(workflow_id = %workflow_id, error = %e, "wakeup: orchestrator update failed");
        }

        // The wakeup record is consumed by this very wakeup.
        match self
            .storage
            .append_event(
                workflow_id,
                WorkflowEventType::OrchestratorWakeup,
                Some(&execution_id),
                None,
                serde_json::json!({ "event_count": events.len() }),
            )
            .await
        {
            Ok(event) => {
                let _ = self.storage.mark_events_processed(&[event.id]).await;
            }
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "wakeup: event append failed");
            }
        }

        info!(
            workflow_id = %workflow_id,
            execution_id = %execution_id,
            events = events.len(),
            "orchestrator wakeup"
        );

        // Fresh spawn every time; the session id rides along as an
        // argument for agents that support transcript resumption.
        let mut args = self.agent_args.clone();
        if let Some(session) = &workflow.orchestrator_session_id {
            args.push("--session-id".to_string());
            args.push(session.clone());
        }
        args.push(prompt);

        let work_dir = workflow
            .worktree_path
            .as_ref()
            .map_or_else(|| self.workspace_root.clone(), PathBuf::from);
        let task = Task {
            id: Id::new(),
            workflow_id: Some(workflow_id.clone()),
            step_id: None,
            issue_id: None,
            family: "orchestrator".to_string(),
            executable: self.agent_bin.clone(),
            args,
            work_dir,
            env: Vec::new(),
            branch: workflow.branch_name.clone().unwrap_or(workflow.base_branch),
            agent_id: "orchestrator".to_string(),
        };

        let executor = Arc::clone(&self.executor);
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let wakeup_workflow = workflow_id.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.execute_task(execution_id, task, &policy).await {
                warn!(
                    workflow_id = %wakeup_workflow,
                    error = %e,
                    "orchestrator follow-up failed"
                );
            }
        });
    }

    /// Summarize a batch of events for the orchestrator prompt, in
    /// `created_at` order.
    async fn build_prompt(
        &self,
        workflow_title: &str,
        events: &[WorkflowEvent],
        resolved: Option<&ResolvedAwait>,
    ) -> String {
        let mut prompt = format!(
            "You are the orchestrator for workflow \"{workflow_title}\". \
             Events since your last wakeup:\n"
        );

        if events.is_empty() {
            prompt.push_str("(no new events)\n");
        }
        for event in events {
            let mut line = format!("- {}", event.event_type.as_str());
            if let Some(step_id) = &event.step_id {
                line.push_str(&format!(" step={step_id}"));
            }
            if let Some(execution_id) = &event.execution_id {
                // Enrich with the execution's final state when we have it.
                if let Ok(execution) = self.storage.get_execution(execution_id).await {
                    line.push_str(&format!(
                        " execution={} status={}",
                        execution_id,
                        execution.status.as_str()
                    ));
                    if let Some(error) = &execution.error_message {
                        line.push_str(&format!(" error={error}"));
                    }
                } else {
                    line.push_str(&format!(" execution={execution_id}"));
                }
            }
            if !event.payload.is_null() {
                line.push_str(&format!(" payload={}", event.payload));
            }
            line.push('\n');
            prompt.push_str(&line);
        }

        if let Some(resolved) = resolved {
            prompt.push_str(&format!(
                "\nYour await condition resolved by {}.",
                resolved.resolved_by
            ));
            if let Some(message) = &resolved.message {
                prompt.push_str(&format!(" Context: {message}"));
            }
            prompt.push('\n');
        }

        prompt.push_str("\nReview the events and decide the next action.");
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::broadcast::SessionBroadcaster;
    use crate::process::ProcessManager;
    use flow_core::{Workflow, WorkflowConfig, WorkflowSource};
    use tempfile::TempDir;

    struct Harness {
        service: Arc<WakeupService>,
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    async fn create_harness(batch_window_ms: u64) -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(&dir.path().join("test.db")).await.unwrap());
        storage.migrate().await.unwrap();

        let processes = Arc::new(ProcessManager::new(Duration::from_secs(2)));
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)));
        let broadcaster = Arc::new(SessionBroadcaster::new(64));
        let executor = Arc::new(TaskExecutor::new(
            processes,
            breaker,
            broadcaster,
            Arc::clone(&storage),
            "proj".to_string(),
        ));

        let mut config = Config::default();
        config.agent_bin = PathBuf::from("/bin/echo");
        config.agent_args = vec!["orchestrated".to_string()];
        config.batch_window_ms = batch_window_ms;

        let service = Arc::new(WakeupService::new(
            Arc::clone(&storage),
            executor,
            &config,
            dir.path().to_path_buf(),
        ));
        Harness {
            service,
            storage,
            _dir: dir,
        }
    }

    async fn insert_running_workflow(storage: &Storage, id: &str) -> Id {
        let now = Utc::now();
        let workflow = Workflow {
            id: Id::from_string(id),
            title: format!("workflow {id}"),
            source: WorkflowSource::Goal {
                text: "orchestrate".to_string(),
            },
            status: WorkflowStatus::Pending,
            steps: Vec::new(),
            base_branch: "main".to_string(),
            worktree_path: None,
            branch_name: None,
            current_step_index: 0,
            orchestrator_execution_id: None,
            orchestrator_session_id: None,
            config: WorkflowConfig::default(),
            created_at: now,
            updated_at: now,
        };
        storage.insert_workflow(&workflow).await.unwrap();
        storage
            .update_workflow_status(&workflow.id, WorkflowStatus::Running)
            .await
            .unwrap();
        workflow.id
    }

    /// Count orchestrator follow-up executions for a workflow.
    async fn follow_up_count(storage: &Storage, workflow_id: &Id) -> usize {
        storage
            .list_executions(workflow_id)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.agent_id == "orchestrator")
            .count()
    }

    #[tokio::test]
    async fn events_within_window_coalesce_into_one_wakeup() {
        let harness = create_harness(150).await;
        let wf_id = insert_running_workflow(&harness.storage, "wf-1").await;

        for i in 0..3 {
            harness
                .service
                .record_event(
                    &wf_id,
                    WorkflowEventType::StepCompleted,
                    None,
                    None,
                    serde_json::json!({ "i": i }),
                )
                .await
                .unwrap();
        }

        // Let the window elapse and the follow-up spawn.
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(follow_up_count(&harness.storage, &wf_id).await, 1);

        // All three step events are stamped; only no orchestrator_wakeup
        // or step event remains unprocessed.
        let unprocessed = harness.storage.unprocessed_events(&wf_id).await.unwrap();
        assert!(unprocessed.is_empty(), "unprocessed: {unprocessed:?}");

        let events = harness.storage.list_events(&wf_id).await.unwrap();
        let wakeups = events
            .iter()
            .filter(|e| e.event_type == WorkflowEventType::OrchestratorWakeup)
            .count();
        assert_eq!(wakeups, 1);
    }

    #[tokio::test]
    async fn wakeup_skipped_for_paused_workflow() {
        let harness = create_harness(50).await;
        let wf_id = insert_running_workflow(&harness.storage, "wf-1").await;
        harness
            .storage
            .update_workflow_status(&wf_id, WorkflowStatus::Paused)
            .await
            .unwrap();

        harness
            .service
            .record_event(
                &wf_id,
                WorkflowEventType::StepCompleted,
                None,
                None,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(follow_up_count(&harness.storage, &wf_id).await, 0);
    }

    #[tokio::test]
    async fn matching_event_resolves_await_immediately() {
        let harness = create_harness(60_000).await;
        let wf_id = insert_running_workflow(&harness.storage, "wf-1").await;

        harness
            .service
            .register_await(
                &wf_id,
                vec![WorkflowEventType::StepCompleted],
                None,
                None,
                Some("waiting for the build step".to_string()),
            )
            .await;
        assert!(harness.service.pending_await(&wf_id).await.is_some());

        harness
            .service
            .record_event(
                &wf_id,
                WorkflowEventType::StepCompleted,
                None,
                None,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        // Immediate wakeup, not gated on the (huge) batch window.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(follow_up_count(&harness.storage, &wf_id).await, 1);
        assert!(harness.service.pending_await(&wf_id).await.is_none());
    }

    #[tokio::test]
    async fn await_filters_by_execution_id() {
        let harness = create_harness(60_000).await;
        let wf_id = insert_running_workflow(&harness.storage, "wf-1").await;

        harness
            .service
            .register_await(
                &wf_id,
                vec![WorkflowEventType::StepCompleted],
                Some(vec![Id::from_string("exec-wanted")]),
                None,
                None,
            )
            .await;

        harness
            .service
            .record_event(
                &wf_id,
                WorkflowEventType::StepCompleted,
                Some(&Id::from_string("exec-other")),
                None,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        assert!(harness.service.pending_await(&wf_id).await.is_some());

        harness
            .service
            .record_event(
                &wf_id,
                WorkflowEventType::StepCompleted,
                Some(&Id::from_string("exec-wanted")),
                None,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        assert!(harness.service.pending_await(&wf_id).await.is_none());
    }

    #[tokio::test]
    async fn registering_a_new_await_replaces_the_old() {
        let harness = create_harness(60_000).await;
        let wf_id = insert_running_workflow(&harness.storage, "wf-1").await;

        let first = harness
            .service
            .register_await(
                &wf_id,
                vec![WorkflowEventType::StepCompleted],
                None,
                None,
                None,
            )
            .await;
        let second = harness
            .service
            .register_await(
                &wf_id,
                vec![WorkflowEventType::StepFailed],
                None,
                None,
                None,
            )
            .await;

        let pending = harness.service.pending_await(&wf_id).await.unwrap();
        assert_ne!(pending.id, first.id);
        assert_eq!(pending.id, second.id);
        assert_eq!(pending.event_types, vec![WorkflowEventType::StepFailed]);
    }

    #[tokio::test]
    async fn await_timeout_resolves_and_wakes() {
        let harness = create_harness(60_000).await;
        let wf_id = insert_running_workflow(&harness.storage, "wf-1").await;

        harness
            .service
            .register_await(
                &wf_id,
                vec![WorkflowEventType::UserResponse],
                None,
                Some(1),
                Some("asked the user".to_string()),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(harness.service.pending_await(&wf_id).await.is_none());
        // Timed-out await wakes even with no unprocessed events.
        assert_eq!(follow_up_count(&harness.storage, &wf_id).await, 1);
    }

    #[tokio::test]
    async fn clear_workflow_drops_awaits() {
        let harness = create_harness(60_000).await;
        let wf_id = insert_running_workflow(&harness.storage, "wf-1").await;

        harness
            .service
            .register_await(
                &wf_id,
                vec![WorkflowEventType::UserResponse],
                None,
                None,
                None,
            )
            .await;
        harness.service.clear_workflow(&wf_id).await;
        assert!(harness.service.pending_await(&wf_id).await.is_none());
    }

    #[tokio::test]
    async fn execution_timeout_records_step_failed() {
        let harness = create_harness(50).await;
        let wf_id = insert_running_workflow(&harness.storage, "wf-1").await;

        let execution_id = Id::from_string("exec-1");
        let step_id = Id::from_string("step-1");
        harness.service.start_execution_timeout(
            execution_id.clone(),
            wf_id.clone(),
            step_id.clone(),
            Duration::from_millis(50),
        );

        tokio::time::sleep(Duration::from_millis(300)).await;

        let events = harness.storage.list_events(&wf_id).await.unwrap();
        let timeout_event = events
            .iter()
            .find(|e| e.event_type == WorkflowEventType::StepFailed)
            .expect("step_failed event");
        assert_eq!(timeout_event.payload["reason"], "timeout");
        assert_eq!(timeout_event.step_id, Some(step_id));
    }

    #[tokio::test]
    async fn cancelled_watchdog_never_fires() {
        let harness = create_harness(50).await;
        let wf_id = insert_running_workflow(&harness.storage, "wf-1").await;

        let execution_id = Id::from_string("exec-1");
        harness.service.start_execution_timeout(
            execution_id.clone(),
            wf_id.clone(),
            Id::from_string("step-1"),
            Duration::from_millis(100),
        );
        harness.service.cancel_execution_timeout(&execution_id);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let events = harness.storage.list_events(&wf_id).await.unwrap();
        assert!(events.is_empty());
    }
}

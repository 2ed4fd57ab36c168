//! Checkpoint store: persisted workflow snapshots for pause/resume.
//!
//! Checkpoints for a workflow are totally ordered by creation time; the
//! latest one fully supersedes earlier ones when resuming. Saving is
//! atomic from the reader's perspective (single-statement upsert).

use crate::storage::{Storage, StorageError};
use chrono::Utc;
use flow_core::{Checkpoint, CheckpointState, Id, StepResult, Workflow};
use std::sync::Arc;
use tracing::warn;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    storage: Arc<Storage>,
}

impl CheckpointStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Build a checkpoint from live workflow state.
    pub fn build(
        workflow: &Workflow,
        execution_id: &Id,
        step_results: Vec<StepResult>,
        context: serde_json::Value,
    ) -> Checkpoint {
        Checkpoint {
            workflow_id: workflow.id.clone(),
            execution_id: execution_id.clone(),
            definition: serde_json::json!({
                "title": workflow.title,
                "source": workflow.source,
                "steps": workflow.steps,
                "config": workflow.config,
                "base_branch": workflow.base_branch,
            }),
            state: CheckpointState {
                status: workflow.status,
                current_step_index: workflow.current_step_index,
                context,
                step_results,
                started_at: workflow.created_at,
                resumed_at: None,
            },
            created_at: Utc::now(),
        }
    }

    /// Persist a checkpoint. Failures are logged and surfaced; callers
    /// retry on the next trigger rather than crashing.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if let Err(e) = self.storage.save_checkpoint(checkpoint).await {
            warn!(
                workflow_id = %checkpoint.workflow_id,
                execution_id = %checkpoint.execution_id,
                error = %e,
                "checkpoint save failed"
            );
            return Err(e);
        }
        Ok(())
    }

    pub async fn load(&self, execution_id: &Id) -> Result<Option<Checkpoint>> {
        self.storage.load_checkpoint(execution_id).await
    }

    pub async fn list(&self, workflow_id: Option<&Id>) -> Result<Vec<Checkpoint>> {
        self.storage.list_checkpoints(workflow_id).await
    }

    pub async fn delete(&self, execution_id: &Id) -> Result<()> {
        self.storage.delete_checkpoint(execution_id).await
    }

    /// The checkpoint to resume from: the newest one for the workflow.
    pub async fn latest_for_workflow(&self, workflow_id: &Id) -> Result<Option<Checkpoint>> {
        let mut checkpoints = self.storage.list_checkpoints(Some(workflow_id)).await?;
        Ok(if checkpoints.is_empty() {
            None
        } else {
            Some(checkpoints.remove(0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::{
        StepStatus, WorkflowConfig, WorkflowSource, WorkflowStatus, WorkflowStep,
    };
    use tempfile::TempDir;

    async fn create_store() -> (CheckpointStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(&dir.path().join("test.db")).await.unwrap());
        storage.migrate().await.unwrap();
        (CheckpointStore::new(storage), dir)
    }

    fn test_workflow() -> Workflow {
        let now = Utc::now();
        Workflow {
            id: Id::from_string("wf-1"),
            title: "checkpointed".to_string(),
            source: WorkflowSource::Goal {
                text: "ship it".to_string(),
            },
            status: WorkflowStatus::Running,
            steps: vec![WorkflowStep {
                id: Id::from_string("s-1"),
                issue_id: "i-1".to_string(),
                index: 0,
                dependencies: Vec::new(),
                status: StepStatus::Completed,
                execution_id: None,
                error: None,
            }],
            base_branch: "main".to_string(),
            worktree_path: None,
            branch_name: None,
            current_step_index: 1,
            orchestrator_execution_id: None,
            orchestrator_session_id: None,
            config: WorkflowConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_then_load_returns_equal_state() {
        let (store, _dir) = create_store().await;
        let workflow = test_workflow();
        let execution_id = Id::from_string("exec-1");
        let checkpoint = CheckpointStore::build(
            &workflow,
            &execution_id,
            vec![StepResult {
                step_id: Id::from_string("s-1"),
                success: true,
                exit_code: Some(0),
                error: None,
                duration_ms: 200,
            }],
            serde_json::json!({"phase": "implementation"}),
        );

        store.save(&checkpoint).await.unwrap();
        let loaded = store.load(&execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, checkpoint.state);
        assert_eq!(loaded.definition, checkpoint.definition);
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let (store, _dir) = create_store().await;
        assert!(store
            .load(&Id::from_string("ghost"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn latest_for_workflow_picks_newest() {
        let (store, _dir) = create_store().await;
        let workflow = test_workflow();

        let mut first = CheckpointStore::build(
            &workflow,
            &Id::from_string("exec-1"),
            Vec::new(),
            serde_json::Value::Null,
        );
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        store.save(&first).await.unwrap();

        let mut second = CheckpointStore::build(
            &workflow,
            &Id::from_string("exec-2"),
            Vec::new(),
            serde_json::Value::Null,
        );
        second.state.current_step_index = 3;
        store.save(&second).await.unwrap();

        let latest = store
            .latest_for_workflow(&workflow.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.execution_id.as_ref(), "exec-2");
        assert_eq!(latest.state.current_step_index, 3);
    }

    #[tokio::test]
    async fn list_scopes_by_workflow() {
        let (store, _dir) = create_store().await;
        let workflow = test_workflow();
        let checkpoint = CheckpointStore::build(
            &workflow,
            &Id::from_string("exec-1"),
            Vec::new(),
            serde_json::Value::Null,
        );
        store.save(&checkpoint).await.unwrap();

        assert_eq!(store.list(Some(&workflow.id)).await.unwrap().len(), 1);
        assert_eq!(
            store
                .list(Some(&Id::from_string("other")))
                .await
                .unwrap()
                .len(),
            0
        );
        assert_eq!(store.list(None).await.unwrap().len(), 1);

        store.delete(&checkpoint.execution_id).await.unwrap();
        assert!(store.list(None).await.unwrap().is_empty());
    }
}

//! SQLite storage for the orchestration daemon.
//!
//! Persists workflows, steps, executions, workflow events, entities, and
//! checkpoints. The schema is an internal detail; every public accessor
//! speaks in the typed model from `flow-core`.

use chrono::{DateTime, TimeZone, Utc};
use flow_core::entity::{Entity, EntityKind};
use flow_core::events::{WorkflowEvent, WorkflowEventType};
use flow_core::{
    Checkpoint, CheckpointState, Execution, ExecutionStatus, Id, Progress, StepStatus, Workflow,
    WorkflowConfig, WorkflowSource, WorkflowStatus, WorkflowStep,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for workflow queries. Explicit columns keep row
/// mapping stable across ALTER TABLE migrations.
const WORKFLOW_COLUMNS: &str = "id, title, source_json, status, base_branch, worktree_path, \
    branch_name, current_step_index, orchestrator_execution_id, orchestrator_session_id, \
    config_json, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, workflow_id, step_id, issue_id, status, worktree_path, \
    branch, started_at, completed_at, last_heartbeat, agent_id, progress_done, progress_total, \
    exit_code, after_commit, files_changed_json, error_message";

/// Embedded migrations, applied in order at startup.
const MIGRATIONS: &[&str] = &[
    // 0001: initial schema
    r"
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        source_json TEXT NOT NULL,
        status TEXT NOT NULL,
        base_branch TEXT NOT NULL,
        worktree_path TEXT,
        branch_name TEXT,
        current_step_index INTEGER NOT NULL DEFAULT 0,
        orchestrator_execution_id TEXT,
        orchestrator_session_id TEXT,
        config_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS steps (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL REFERENCES workflows(id),
        issue_id TEXT NOT NULL,
        idx INTEGER NOT NULL,
        dependencies_json TEXT NOT NULL,
        status TEXT NOT NULL,
        execution_id TEXT,
        error TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_steps_workflow ON steps(workflow_id, idx);
    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT,
        step_id TEXT,
        issue_id TEXT,
        status TEXT NOT NULL,
        worktree_path TEXT NOT NULL,
        branch TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        last_heartbeat INTEGER NOT NULL,
        agent_id TEXT NOT NULL,
        progress_done INTEGER NOT NULL DEFAULT 0,
        progress_total INTEGER NOT NULL DEFAULT 0,
        exit_code INTEGER,
        after_commit TEXT,
        files_changed_json TEXT,
        error_message TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        type TEXT NOT NULL,
        execution_id TEXT,
        step_id TEXT,
        payload_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        processed_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_events_workflow ON events(workflow_id, created_at);
    CREATE TABLE IF NOT EXISTS entities (
        kind TEXT NOT NULL,
        uuid TEXT NOT NULL,
        body_json TEXT NOT NULL,
        PRIMARY KEY (kind, uuid)
    );
    CREATE TABLE IF NOT EXISTS checkpoints (
        execution_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        definition_json TEXT NOT NULL,
        state_json TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_checkpoints_workflow ON checkpoints(workflow_id, created_at);
    ",
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("step not found: {0}")]
    StepNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Filter for `list_workflows`.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (or create) the database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // Enable WAL mode
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations in order, tolerating idempotent errors.
    pub async fn migrate(&self) -> Result<()> {
        for migration_sql in MIGRATIONS {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match sqlx::query(trimmed).execute(&self.pool).await {
                    Ok(_) => {}
                    Err(e) => {
                        let msg = e.to_string();
                        if !msg.contains("duplicate column") && !msg.contains("already exists") {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Workflow operations ---

    /// Insert a workflow and its steps in a single transaction.
    pub async fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO workflows (id, title, source_json, status, base_branch, worktree_path,
                                   branch_name, current_step_index, orchestrator_execution_id,
                                   orchestrator_session_id, config_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ",
        )
        .bind(workflow.id.as_ref())
        .bind(&workflow.title)
        .bind(serde_json::to_string(&workflow.source)?)
        .bind(workflow.status.as_str())
        .bind(&workflow.base_branch)
        .bind(&workflow.worktree_path)
        .bind(&workflow.branch_name)
        .bind(i64::from(workflow.current_step_index))
        .bind(workflow.orchestrator_execution_id.as_ref().map(Id::as_ref))
        .bind(&workflow.orchestrator_session_id)
        .bind(serde_json::to_string(&workflow.config)?)
        .bind(workflow.created_at.timestamp_millis())
        .bind(workflow.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for step in &workflow.steps {
            sqlx::query(
                r"
                INSERT INTO steps (id, workflow_id, issue_id, idx, dependencies_json, status,
                                   execution_id, error)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )
            .bind(step.id.as_ref())
            .bind(workflow.id.as_ref())
            .bind(&step.issue_id)
            .bind(i64::from(step.index))
            .bind(serde_json::to_string(&step.dependencies)?)
            .bind(step.status.as_str())
            .bind(step.execution_id.as_ref().map(Id::as_ref))
            .bind(&step.error)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Get a workflow with its steps.
    pub async fn get_workflow(&self, id: &Id) -> Result<Workflow> {
        let query = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1");
        let row = sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::WorkflowNotFound(id.to_string()))?;

        let steps = self.list_steps(id).await?;
        row.into_workflow(steps)
    }

    /// List workflows, newest first.
    pub async fn list_workflows(&self, filter: &WorkflowFilter) -> Result<Vec<Workflow>> {
        let limit = i64::from(filter.limit.unwrap_or(100));
        let offset = i64::from(filter.offset.unwrap_or(0));

        let rows = match filter.status {
            Some(status) => {
                let query = format!(
                    "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE status = ?1 \
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                );
                sqlx::query_as::<_, WorkflowRow>(&query)
                    .bind(status.as_str())
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {WORKFLOW_COLUMNS} FROM workflows \
                     ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                );
                sqlx::query_as::<_, WorkflowRow>(&query)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            let id = Id::from_string(row.id.clone());
            let steps = self.list_steps(&id).await?;
            workflows.push(row.into_workflow(steps)?);
        }
        Ok(workflows)
    }

    /// Update workflow status.
    pub async fn update_workflow_status(&self, id: &Id, status: WorkflowStatus) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result =
            sqlx::query("UPDATE workflows SET status = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(status.as_str())
                .bind(now)
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::WorkflowNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Update workflow worktree allocation.
    pub async fn update_workflow_worktree(
        &self,
        id: &Id,
        worktree_path: &str,
        branch_name: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE workflows SET worktree_path = ?1, branch_name = ?2, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(worktree_path)
        .bind(branch_name)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::WorkflowNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Update the settled-step counter.
    pub async fn update_workflow_progress(&self, id: &Id, current_step_index: u32) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE workflows SET current_step_index = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(i64::from(current_step_index))
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::WorkflowNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record the orchestrator follow-up execution and session.
    pub async fn update_workflow_orchestrator(
        &self,
        id: &Id,
        execution_id: &Id,
        session_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE workflows SET orchestrator_execution_id = ?1, \
             orchestrator_session_id = COALESCE(?2, orchestrator_session_id), updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(execution_id.as_ref())
        .bind(session_id)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::WorkflowNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Step operations ---

    /// Get a step by id.
    pub async fn get_step(&self, id: &Id) -> Result<WorkflowStep> {
        let row = sqlx::query_as::<_, StepRow>(
            "SELECT id, issue_id, idx, dependencies_json, status, execution_id, error \
             FROM steps WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::StepNotFound(id.to_string()))?;

        row.into_step()
    }

    /// List a workflow's steps in index order.
    pub async fn list_steps(&self, workflow_id: &Id) -> Result<Vec<WorkflowStep>> {
        let rows = sqlx::query_as::<_, StepRow>(
            "SELECT id, issue_id, idx, dependencies_json, status, execution_id, error \
             FROM steps WHERE workflow_id = ?1 ORDER BY idx ASC",
        )
        .bind(workflow_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRow::into_step).collect()
    }

    /// Find the workflow a step belongs to.
    pub async fn find_step_workflow(&self, step_id: &Id) -> Result<Id> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT workflow_id FROM steps WHERE id = ?1")
                .bind(step_id.as_ref())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(workflow_id,)| Id::from_string(workflow_id))
            .ok_or_else(|| StorageError::StepNotFound(step_id.to_string()))
    }

    /// Update step status, backing execution, and error message.
    pub async fn update_step(
        &self,
        id: &Id,
        status: StepStatus,
        execution_id: Option<&Id>,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE steps SET status = ?1, \
             execution_id = COALESCE(?2, execution_id), error = ?3 WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(execution_id.map(Id::as_ref))
        .bind(error)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::StepNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Reset a step for another run: status back to ready/pending, prior
    /// execution and error cleared.
    pub async fn reset_step(&self, id: &Id, status: StepStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE steps SET status = ?1, execution_id = NULL, error = NULL WHERE id = ?2",
        )
        .bind(status.as_str())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::StepNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Execution operations ---

    pub async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO executions (id, workflow_id, step_id, issue_id, status, worktree_path,
                                    branch, started_at, completed_at, last_heartbeat, agent_id,
                                    progress_done, progress_total, exit_code, after_commit,
                                    files_changed_json, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ",
        )
        .bind(execution.id.as_ref())
        .bind(execution.workflow_id.as_ref().map(Id::as_ref))
        .bind(execution.step_id.as_ref().map(Id::as_ref))
        .bind(&execution.issue_id)
        .bind(execution.status.as_str())
        .bind(&execution.worktree_path)
        .bind(&execution.branch)
        .bind(execution.started_at.timestamp_millis())
        .bind(execution.completed_at.map(|t| t.timestamp_millis()))
        .bind(execution.last_heartbeat.timestamp_millis())
        .bind(&execution.agent_id)
        .bind(i64::from(execution.progress.done))
        .bind(i64::from(execution.progress.total))
        .bind(execution.exit_code)
        .bind(&execution.after_commit)
        .bind(
            execution
                .files_changed
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&execution.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_execution(&self, id: &Id) -> Result<Execution> {
        let query = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1");
        let row = sqlx::query_as::<_, ExecutionRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ExecutionNotFound(id.to_string()))?;

        row.into_execution()
    }

    /// Settle an execution with its final status.
    pub async fn finish_execution(
        &self,
        id: &Id,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE executions SET status = ?1, completed_at = ?2, exit_code = ?3, \
             error_message = ?4 WHERE id = ?5",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(exit_code)
        .bind(error_message)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record the worktree's HEAD commit after an execution finished.
    pub async fn record_execution_commit(&self, id: &Id, commit: &str) -> Result<()> {
        sqlx::query("UPDATE executions SET after_commit = ?1 WHERE id = ?2")
            .bind(commit)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn heartbeat_execution(&self, id: &Id) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query("UPDATE executions SET last_heartbeat = ?1 WHERE id = ?2")
            .bind(now)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_executions(&self, workflow_id: &Id) -> Result<Vec<Execution>> {
        let query = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE workflow_id = ?1 \
             ORDER BY started_at ASC"
        );
        let rows = sqlx::query_as::<_, ExecutionRow>(&query)
            .bind(workflow_id.as_ref())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    // --- Event operations ---

    /// Append a workflow event to the audit log.
    pub async fn append_event(
        &self,
        workflow_id: &Id,
        event_type: WorkflowEventType,
        execution_id: Option<&Id>,
        step_id: Option<&Id>,
        payload: serde_json::Value,
    ) -> Result<WorkflowEvent> {
        let id = Id::new();
        let now = Utc::now();
        let payload_json = serde_json::to_string(&payload)?;

        sqlx::query(
            "INSERT INTO events (id, workflow_id, type, execution_id, step_id, payload_json, \
             created_at, processed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
        )
        .bind(id.as_ref())
        .bind(workflow_id.as_ref())
        .bind(event_type.as_str())
        .bind(execution_id.map(Id::as_ref))
        .bind(step_id.map(Id::as_ref))
        .bind(&payload_json)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(WorkflowEvent {
            id,
            workflow_id: workflow_id.clone(),
            event_type,
            execution_id: execution_id.cloned(),
            step_id: step_id.cloned(),
            payload,
            created_at: now,
            processed_at: None,
        })
    }

    /// List all events for a workflow in creation order.
    pub async fn list_events(&self, workflow_id: &Id) -> Result<Vec<WorkflowEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, workflow_id, type, execution_id, step_id, payload_json, created_at, \
             processed_at FROM events WHERE workflow_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(workflow_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Events not yet consumed by a wakeup, in creation order.
    pub async fn unprocessed_events(&self, workflow_id: &Id) -> Result<Vec<WorkflowEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, workflow_id, type, execution_id, step_id, payload_json, created_at, \
             processed_at FROM events WHERE workflow_id = ?1 AND processed_at IS NULL \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(workflow_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Stamp `processed_at` on the given events. Monotone: already
    /// processed events keep their original stamp.
    pub async fn mark_events_processed(&self, event_ids: &[Id]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        for id in event_ids {
            sqlx::query(
                "UPDATE events SET processed_at = ?1 WHERE id = ?2 AND processed_at IS NULL",
            )
            .bind(now)
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // --- Entity operations ---

    /// Upsert one entity into its store.
    pub async fn upsert_entity(&self, kind: EntityKind, entity: &Entity) -> Result<()> {
        sqlx::query(
            "INSERT INTO entities (kind, uuid, body_json) VALUES (?1, ?2, ?3) \
             ON CONFLICT(kind, uuid) DO UPDATE SET body_json = excluded.body_json",
        )
        .bind(kind.as_str())
        .bind(&entity.uuid)
        .bind(entity.to_line()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert a batch of entities across stores in one transaction.
    pub async fn upsert_entities(&self, batch: &[(EntityKind, Entity)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (kind, entity) in batch {
            sqlx::query(
                "INSERT INTO entities (kind, uuid, body_json) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(kind, uuid) DO UPDATE SET body_json = excluded.body_json",
            )
            .bind(kind.as_str())
            .bind(&entity.uuid)
            .bind(entity.to_line()?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_entity(&self, kind: EntityKind, uuid: &str) -> Result<Option<Entity>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body_json FROM entities WHERE kind = ?1 AND uuid = ?2")
                .bind(kind.as_str())
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((body,)) => Ok(Some(Entity::from_line(&body)?)),
            None => Ok(None),
        }
    }

    pub async fn list_entities(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body_json FROM entities WHERE kind = ?1")
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|(body,)| Entity::from_line(body).map_err(StorageError::from))
            .collect()
    }

    // --- Checkpoint operations ---

    /// Save a checkpoint. The upsert runs in one statement, so a reader
    /// sees either the old snapshot or the new one, never a mix.
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        sqlx::query(
            "INSERT INTO checkpoints (execution_id, workflow_id, definition_json, state_json, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(execution_id) DO UPDATE SET definition_json = excluded.definition_json, \
             state_json = excluded.state_json, created_at = excluded.created_at",
        )
        .bind(checkpoint.execution_id.as_ref())
        .bind(checkpoint.workflow_id.as_ref())
        .bind(serde_json::to_string(&checkpoint.definition)?)
        .bind(serde_json::to_string(&checkpoint.state)?)
        .bind(checkpoint.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_checkpoint(&self, execution_id: &Id) -> Result<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT execution_id, workflow_id, definition_json, state_json, created_at \
             FROM checkpoints WHERE execution_id = ?1",
        )
        .bind(execution_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// List checkpoints, newest first, optionally scoped to a workflow.
    pub async fn list_checkpoints(&self, workflow_id: Option<&Id>) -> Result<Vec<Checkpoint>> {
        let rows = match workflow_id {
            Some(id) => {
                sqlx::query_as::<_, CheckpointRow>(
                    "SELECT execution_id, workflow_id, definition_json, state_json, created_at \
                     FROM checkpoints WHERE workflow_id = ?1 ORDER BY created_at DESC",
                )
                .bind(id.as_ref())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, CheckpointRow>(
                    "SELECT execution_id, workflow_id, definition_json, state_json, created_at \
                     FROM checkpoints ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(CheckpointRow::into_checkpoint)
            .collect()
    }

    pub async fn delete_checkpoint(&self, execution_id: &Id) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE execution_id = ?1")
            .bind(execution_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// --- Row types ---

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    title: String,
    source_json: String,
    status: String,
    base_branch: String,
    worktree_path: Option<String>,
    branch_name: Option<String>,
    current_step_index: i64,
    orchestrator_execution_id: Option<String>,
    orchestrator_session_id: Option<String>,
    config_json: String,
    created_at: i64,
    updated_at: i64,
}

impl WorkflowRow {
    fn into_workflow(self, steps: Vec<WorkflowStep>) -> Result<Workflow> {
        let source: WorkflowSource = serde_json::from_str(&self.source_json)?;
        let config: WorkflowConfig = serde_json::from_str(&self.config_json)?;
        let status = WorkflowStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("workflow status: {}", self.status)))?;

        Ok(Workflow {
            id: Id::from_string(self.id),
            title: self.title,
            source,
            status,
            steps,
            base_branch: self.base_branch,
            worktree_path: self.worktree_path,
            branch_name: self.branch_name,
            current_step_index: self.current_step_index as u32,
            orchestrator_execution_id: self.orchestrator_execution_id.map(Id::from_string),
            orchestrator_session_id: self.orchestrator_session_id,
            config,
            created_at: millis_to_datetime(self.created_at),
            updated_at: millis_to_datetime(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: String,
    issue_id: String,
    idx: i64,
    dependencies_json: String,
    status: String,
    execution_id: Option<String>,
    error: Option<String>,
}

impl StepRow {
    fn into_step(self) -> Result<WorkflowStep> {
        let dependencies: Vec<Id> = serde_json::from_str(&self.dependencies_json)?;
        let status = StepStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("step status: {}", self.status)))?;

        Ok(WorkflowStep {
            id: Id::from_string(self.id),
            issue_id: self.issue_id,
            index: self.idx as u32,
            dependencies,
            status,
            execution_id: self.execution_id.map(Id::from_string),
            error: self.error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    workflow_id: Option<String>,
    step_id: Option<String>,
    issue_id: Option<String>,
    status: String,
    worktree_path: String,
    branch: String,
    started_at: i64,
    completed_at: Option<i64>,
    last_heartbeat: i64,
    agent_id: String,
    progress_done: i64,
    progress_total: i64,
    exit_code: Option<i32>,
    after_commit: Option<String>,
    files_changed_json: Option<String>,
    error_message: Option<String>,
}

impl ExecutionRow {
    fn into_execution(self) -> Result<Execution> {
        let status = ExecutionStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Corrupt(format!("execution status: {}", self.status)))?;
        let files_changed = self
            .files_changed_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Execution {
            id: Id::from_string(self.id),
            workflow_id: self.workflow_id.map(Id::from_string),
            step_id: self.step_id.map(Id::from_string),
            issue_id: self.issue_id,
            status,
            worktree_path: self.worktree_path,
            branch: self.branch,
            started_at: millis_to_datetime(self.started_at),
            completed_at: self.completed_at.map(millis_to_datetime),
            last_heartbeat: millis_to_datetime(self.last_heartbeat),
            agent_id: self.agent_id,
            progress: Progress {
                done: self.progress_done as u32,
                total: self.progress_total as u32,
            },
            exit_code: self.exit_code,
            after_commit: self.after_commit,
            files_changed,
            error_message: self.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    workflow_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    execution_id: Option<String>,
    step_id: Option<String>,
    payload_json: String,
    created_at: i64,
    processed_at: Option<i64>,
}

impl EventRow {
    fn into_event(self) -> Result<WorkflowEvent> {
        let event_type = WorkflowEventType::parse(&self.event_type)
            .ok_or_else(|| StorageError::Corrupt(format!("event type: {}", self.event_type)))?;
        let payload = serde_json::from_str(&self.payload_json)?;

        Ok(WorkflowEvent {
            id: Id::from_string(self.id),
            workflow_id: Id::from_string(self.workflow_id),
            event_type,
            execution_id: self.execution_id.map(Id::from_string),
            step_id: self.step_id.map(Id::from_string),
            payload,
            created_at: millis_to_datetime(self.created_at),
            processed_at: self.processed_at.map(millis_to_datetime),
        })
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    execution_id: String,
    workflow_id: String,
    definition_json: String,
    state_json: String,
    created_at: i64,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let definition = serde_json::from_str(&self.definition_json)?;
        let state: CheckpointState = serde_json::from_str(&self.state_json)?;

        Ok(Checkpoint {
            workflow_id: Id::from_string(self.workflow_id),
            execution_id: Id::from_string(self.execution_id),
            definition,
            state,
            created_at: millis_to_datetime(self.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_storage() -> (Storage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate().await.unwrap();
        (storage, dir)
    }

    fn create_test_workflow(id: &str, step_count: usize) -> Workflow {
        let now = Utc::now();
        let steps = (0..step_count)
            .map(|i| WorkflowStep {
                id: Id::from_string(format!("{id}-step-{i}")),
                issue_id: format!("i-{i}"),
                index: i as u32,
                dependencies: Vec::new(),
                status: StepStatus::Ready,
                execution_id: None,
                error: None,
            })
            .collect();

        Workflow {
            id: Id::from_string(id),
            title: format!("workflow {id}"),
            source: WorkflowSource::Issues {
                ids: vec!["i-0".to_string()],
            },
            status: WorkflowStatus::Pending,
            steps,
            base_branch: "main".to_string(),
            worktree_path: None,
            branch_name: None,
            current_step_index: 0,
            orchestrator_execution_id: None,
            orchestrator_session_id: None,
            config: WorkflowConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn workflow_round_trips_with_steps() {
        let (storage, _dir) = create_test_storage().await;
        let workflow = create_test_workflow("wf-1", 3);
        storage.insert_workflow(&workflow).await.unwrap();

        let loaded = storage.get_workflow(&workflow.id).await.unwrap();
        assert_eq!(loaded.title, workflow.title);
        assert_eq!(loaded.steps.len(), 3);
        assert_eq!(loaded.steps[1].issue_id, "i-1");
        assert_eq!(loaded.status, WorkflowStatus::Pending);
    }

    #[tokio::test]
    async fn get_missing_workflow_is_not_found() {
        let (storage, _dir) = create_test_storage().await;
        let result = storage.get_workflow(&Id::from_string("nope")).await;
        assert!(matches!(result, Err(StorageError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn list_workflows_filters_by_status() {
        let (storage, _dir) = create_test_storage().await;
        storage
            .insert_workflow(&create_test_workflow("wf-1", 1))
            .await
            .unwrap();
        storage
            .insert_workflow(&create_test_workflow("wf-2", 1))
            .await
            .unwrap();
        storage
            .update_workflow_status(&Id::from_string("wf-2"), WorkflowStatus::Running)
            .await
            .unwrap();

        let running = storage
            .list_workflows(&WorkflowFilter {
                status: Some(WorkflowStatus::Running),
                ..WorkflowFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id.as_ref(), "wf-2");
    }

    #[tokio::test]
    async fn update_step_preserves_execution_id() {
        let (storage, _dir) = create_test_storage().await;
        let workflow = create_test_workflow("wf-1", 1);
        storage.insert_workflow(&workflow).await.unwrap();

        let step_id = workflow.steps[0].id.clone();
        let exec_id = Id::from_string("exec-1");
        storage
            .update_step(&step_id, StepStatus::Running, Some(&exec_id), None)
            .await
            .unwrap();
        // A later status update without an execution id keeps the old one.
        storage
            .update_step(&step_id, StepStatus::Completed, None, None)
            .await
            .unwrap();

        let step = storage.get_step(&step_id).await.unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.execution_id, Some(exec_id));
    }

    #[tokio::test]
    async fn events_track_processed_at() {
        let (storage, _dir) = create_test_storage().await;
        let wf_id = Id::from_string("wf-1");

        let e1 = storage
            .append_event(
                &wf_id,
                WorkflowEventType::StepCompleted,
                None,
                None,
                serde_json::json!({"step": 1}),
            )
            .await
            .unwrap();
        let _e2 = storage
            .append_event(
                &wf_id,
                WorkflowEventType::StepFailed,
                None,
                None,
                serde_json::json!({"step": 2}),
            )
            .await
            .unwrap();

        let unprocessed = storage.unprocessed_events(&wf_id).await.unwrap();
        assert_eq!(unprocessed.len(), 2);

        storage
            .mark_events_processed(&[e1.id.clone()])
            .await
            .unwrap();
        let unprocessed = storage.unprocessed_events(&wf_id).await.unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].event_type, WorkflowEventType::StepFailed);
    }

    #[tokio::test]
    async fn events_are_listed_in_created_order() {
        let (storage, _dir) = create_test_storage().await;
        let wf_id = Id::from_string("wf-1");
        for i in 0..5 {
            storage
                .append_event(
                    &wf_id,
                    WorkflowEventType::StepCompleted,
                    None,
                    None,
                    serde_json::json!({ "i": i }),
                )
                .await
                .unwrap();
        }
        let events = storage.list_events(&wf_id).await.unwrap();
        let order: Vec<i64> = events
            .iter()
            .map(|e| e.payload.get("i").and_then(serde_json::Value::as_i64).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn entity_upsert_round_trips() {
        let (storage, _dir) = create_test_storage().await;
        let entity = Entity::from_line(
            r#"{"id":"i-1","uuid":"u-1","title":"T","content":"c","created_at":"2025-01-01T00:00:00Z","updated_at":"2025-01-01T00:00:00Z","relationships":[],"tags":[],"custom":true}"#,
        )
        .unwrap();

        storage
            .upsert_entity(EntityKind::Issue, &entity)
            .await
            .unwrap();
        let loaded = storage
            .get_entity(EntityKind::Issue, "u-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, entity);

        // Upserting again replaces, not duplicates.
        storage
            .upsert_entity(EntityKind::Issue, &entity)
            .await
            .unwrap();
        assert_eq!(storage.list_entities(EntityKind::Issue).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_save_load_round_trips() {
        let (storage, _dir) = create_test_storage().await;
        let checkpoint = Checkpoint {
            workflow_id: Id::from_string("wf-1"),
            execution_id: Id::from_string("exec-1"),
            definition: serde_json::json!({"steps": 3}),
            state: CheckpointState {
                status: WorkflowStatus::Paused,
                current_step_index: 2,
                context: serde_json::json!({"note": "mid-flight"}),
                step_results: vec![flow_core::StepResult {
                    step_id: Id::from_string("s-1"),
                    success: true,
                    exit_code: Some(0),
                    error: None,
                    duration_ms: 210,
                }],
                started_at: millis_to_datetime(1_700_000_000_000),
                resumed_at: None,
            },
            created_at: millis_to_datetime(1_700_000_100_000),
        };

        storage.save_checkpoint(&checkpoint).await.unwrap();
        let loaded = storage
            .load_checkpoint(&checkpoint.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, checkpoint);

        // A second save for the same execution supersedes the first.
        let mut superseding = checkpoint.clone();
        superseding.state.current_step_index = 3;
        storage.save_checkpoint(&superseding).await.unwrap();
        let loaded = storage
            .load_checkpoint(&checkpoint.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.state.current_step_index, 3);

        storage
            .delete_checkpoint(&checkpoint.execution_id)
            .await
            .unwrap();
        assert!(storage
            .load_checkpoint(&checkpoint.execution_id)
            .await
            .unwrap()
            .is_none());
    }
}

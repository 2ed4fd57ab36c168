//! flowd - workflow orchestration daemon for AI coding agents.
//!
//! Library components for the daemon process: storage, process
//! management, resilient execution, output normalization, session
//! broadcast, dependency analysis, the workflow engine, wakeups,
//! checkpoints, and the replicated-document coordinator.

pub mod breaker;
pub mod broadcast;
pub mod checkpoint;
pub mod coordinator;
pub mod deps;
pub mod engine;
pub mod executor;
pub mod normalizer;
pub mod process;
pub mod server;
pub mod storage;
pub mod wakeup;
pub mod worktree;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreaker;
use crate::broadcast::SessionBroadcaster;
use crate::coordinator::Coordinator;
use crate::engine::WorkflowEngine;
use crate::executor::TaskExecutor;
use crate::process::ProcessManager;
use crate::server::AppState;
use crate::storage::Storage;
use crate::wakeup::WakeupService;
use flow_core::Config;
use tracing::{error, info, warn};

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// The assembled daemon: storage, execution subsystem, engine,
/// coordinator, and the HTTP/WS control plane.
#[derive(Debug)]
pub struct Daemon {
    config: Config,
    storage: Arc<Storage>,
    processes: Arc<ProcessManager>,
    broadcaster: Arc<SessionBroadcaster>,
    wakeup: Arc<WakeupService>,
    engine: Arc<WorkflowEngine>,
    coordinator: Arc<Coordinator>,
}

impl Daemon {
    /// Wire up all components against the configured data directory and
    /// workspace root.
    pub async fn new(config: Config, workspace_root: PathBuf) -> AppResult<Self> {
        let storage = Arc::new(Storage::new(&config.db_path()).await?);
        storage.migrate().await?;

        let processes = Arc::new(ProcessManager::with_capacity(
            Duration::from_millis(config.termination_grace_ms),
            config.max_processes,
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_threshold,
            Duration::from_millis(config.breaker_cooldown_ms),
        ));
        let broadcaster = Arc::new(SessionBroadcaster::new(config.subscriber_queue_size));
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&processes),
            breaker,
            Arc::clone(&broadcaster),
            Arc::clone(&storage),
            config.project_id.clone(),
        ));
        let wakeup = Arc::new(WakeupService::new(
            Arc::clone(&storage),
            Arc::clone(&executor),
            &config,
            workspace_root.clone(),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&storage),
            executor,
            Arc::clone(&wakeup),
            config.clone(),
            workspace_root,
        ));
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&storage), &config));

        Ok(Self {
            config,
            storage,
            processes,
            broadcaster,
            wakeup,
            engine,
            coordinator,
        })
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Run the daemon: load state, recover interrupted workflows, and
    /// serve the control plane until shutdown.
    pub async fn run(&self) -> AppResult<()> {
        info!("flowd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path().display());
        info!(
            "agent: {} {:?}",
            self.config.agent_bin.display(),
            self.config.agent_args
        );

        self.coordinator.load_initial_state().await?;
        self.coordinator.start();

        match self.engine.recover().await {
            Ok(0) => {}
            Ok(count) => info!("resumed {count} interrupted workflow(s)"),
            Err(e) => warn!("recovery failed: {e}"),
        }

        // Mirror engine events onto each workflow's broadcast channel.
        let mut engine_events = self.engine.subscribe();
        let broadcaster = Arc::clone(&self.broadcaster);
        let project_id = self.config.project_id.clone();
        tokio::spawn(async move {
            loop {
                match engine_events.recv().await {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_value(&event) else {
                            continue;
                        };
                        if let Some(workflow_id) =
                            payload.get("workflow_id").and_then(serde_json::Value::as_str)
                        {
                            let id = flow_core::Id::from_string(workflow_id);
                            broadcaster.broadcast_workflow(&project_id, &id, &payload);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let state = Arc::new(AppState {
            engine: Arc::clone(&self.engine),
            coordinator: Arc::clone(&self.coordinator),
            broadcaster: Arc::clone(&self.broadcaster),
            storage: Arc::clone(&self.storage),
            wakeup: Arc::clone(&self.wakeup),
            project_id: self.config.project_id.clone(),
        });

        tokio::select! {
            result = server::start_server(state, self.config.port) => {
                if let Err(e) = result {
                    error!("HTTP server error: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Drain and close: terminate agent processes, flush the
    /// coordinator. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("flowd shutting down");
        self.processes.shutdown().await;
        self.coordinator.shutdown().await;
    }
}

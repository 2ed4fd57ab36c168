//! Process manager: spawn, track, stream, and terminate agent processes.
//!
//! Every agent subprocess is owned exclusively by this manager. Output is
//! fanned out through a per-process broadcast channel tagged by stream;
//! termination follows the SIGTERM → grace → SIGKILL protocol and is
//! idempotent.

use flow_core::{Id, ProcessStatus};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Broadcast capacity per process. Slow subscribers observe `Lagged`
/// rather than backpressuring the reader tasks.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Default pool bound when none is configured.
const DEFAULT_MAX_PROCESSES: usize = 8;

/// Read buffer size for stdout/stderr pumps.
const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process not found: {0}")]
    NotFound(String),
    #[error("stdin closed for process {0}")]
    Closed(String),
    #[error("failed to spawn {executable}: {source}")]
    SpawnFailed {
        executable: String,
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Which stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One chunk of process output.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub source: OutputSource,
    pub data: String,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// Spawn parameters for a managed process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Handle returned from [`ProcessManager::acquire`]. The receiver is
/// created before the reader pumps start, so the caller sees output from
/// the first byte.
#[derive(Debug)]
pub struct Spawned {
    pub id: Id,
    pub pid: u32,
    pub output: broadcast::Receiver<OutputChunk>,
}

struct ManagedProcess {
    pid: u32,
    status: Mutex<ProcessStatus>,
    /// Dropped once both reader pumps hit EOF, so subscribers observe a
    /// clean channel close after the last chunk.
    output_tx: Mutex<Option<broadcast::Sender<OutputChunk>>>,
    stdin: Mutex<Option<ChildStdin>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    /// Pool slot, returned when the process is released.
    permit: Mutex<Option<tokio::sync::OwnedSemaphorePermit>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Process-wide singleton owning all agent subprocess lifetimes. The
/// pool is bounded: `acquire` waits for a free slot, `release` frees it.
#[derive(Debug)]
pub struct ProcessManager {
    processes: Mutex<HashMap<Id, Arc<ManagedProcess>>>,
    pool: Arc<Semaphore>,
    /// SIGTERM → SIGKILL grace window.
    termination_grace: Duration,
}

impl ProcessManager {
    pub fn new(termination_grace: Duration) -> Self {
        Self::with_capacity(termination_grace, DEFAULT_MAX_PROCESSES)
    }

    pub fn with_capacity(termination_grace: Duration, max_processes: usize) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            pool: Arc::new(Semaphore::new(max_processes.max(1))),
            termination_grace,
        }
    }

    /// Free pool slots right now.
    pub fn available_capacity(&self) -> usize {
        self.pool.available_permits()
    }

    /// Spawn a process and start streaming its output. Blocks while the
    /// pool is at capacity.
    pub async fn acquire(&self, config: ProcessConfig) -> Result<Spawned> {
        let permit = match Arc::clone(&self.pool).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(ProcessError::Closed("process pool".to_string())),
        };

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .current_dir(&config.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            executable: config.executable.display().to_string(),
            source,
        })?;

        let id = Id::new();
        let pid = child.id().unwrap_or_default();
        let (output_tx, output_rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        debug!(
            process_id = %id,
            pid,
            executable = %config.executable.display(),
            work_dir = %config.work_dir.display(),
            "spawned process"
        );

        let managed = Arc::new(ManagedProcess {
            pid,
            status: Mutex::new(ProcessStatus::Busy),
            output_tx: Mutex::new(Some(output_tx.clone())),
            stdin: Mutex::new(stdin),
            exit_rx,
            permit: Mutex::new(Some(permit)),
        });

        // Reader pumps forward chunks until EOF; once both finish, the
        // stored sender is dropped and the channel closes.
        let stdout_pump = stdout.map(|stream| {
            tokio::spawn(pump_output(stream, OutputSource::Stdout, output_tx.clone()))
        });
        let stderr_pump = stderr
            .map(|stream| tokio::spawn(pump_output(stream, OutputSource::Stderr, output_tx.clone())));
        drop(output_tx);
        let closer_managed = Arc::clone(&managed);
        tokio::spawn(async move {
            if let Some(handle) = stdout_pump {
                let _ = handle.await;
            }
            if let Some(handle) = stderr_pump {
                let _ = handle.await;
            }
            closer_managed.output_tx.lock().await.take();
        });

        // Waiter task owns the child and records the exit.
        let waiter_managed = Arc::clone(&managed);
        let waiter_id = id.clone();
        tokio::spawn(async move {
            let info = wait_for_exit(&mut child).await;
            {
                let mut status = waiter_managed.status.lock().await;
                *status = if info.signal.is_some() {
                    ProcessStatus::Crashed
                } else {
                    ProcessStatus::Exited
                };
            }
            // Drop stdin so writers observe Closed.
            waiter_managed.stdin.lock().await.take();
            debug!(
                process_id = %waiter_id,
                code = ?info.code,
                signal = ?info.signal,
                "process exited"
            );
            let _ = exit_tx.send(Some(info));
        });

        self.processes.lock().await.insert(id.clone(), managed);

        Ok(Spawned {
            id,
            pid,
            output: output_rx,
        })
    }

    /// Current status, if the process is known.
    pub async fn status(&self, id: &Id) -> Result<ProcessStatus> {
        let managed = self.get(id).await?;
        let status = *managed.status.lock().await;
        Ok(status)
    }

    /// Attach an additional output subscriber. After the process's
    /// streams are drained, the returned receiver is already closed.
    pub async fn subscribe_output(&self, id: &Id) -> Result<broadcast::Receiver<OutputChunk>> {
        let managed = self.get(id).await?;
        let guard = managed.output_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => Ok(tx.subscribe()),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                Ok(rx)
            }
        }
    }

    /// Write bytes to the process's stdin.
    pub async fn send_input(&self, id: &Id, bytes: &[u8]) -> Result<()> {
        let managed = self.get(id).await?;
        let mut guard = managed.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| ProcessError::Closed(id.to_string()))?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Wait for the process to exit and return how it ended.
    pub async fn wait(&self, id: &Id) -> Result<ExitInfo> {
        let managed = self.get(id).await?;
        let mut rx = managed.exit_rx.clone();
        loop {
            if let Some(info) = *rx.borrow() {
                return Ok(info);
            }
            if rx.changed().await.is_err() {
                // Sender dropped without recording an exit.
                return Ok(ExitInfo {
                    code: None,
                    signal: None,
                });
            }
        }
    }

    /// Terminate a process: SIGTERM (or the caller's signal), wait for
    /// the grace period, then SIGKILL. Idempotent; unknown or
    /// already-exited processes return immediately.
    pub async fn terminate(&self, id: &Id, signal: Option<Signal>) -> Result<()> {
        let Some(managed) = self.processes.lock().await.get(id).cloned() else {
            return Ok(());
        };

        {
            let mut status = managed.status.lock().await;
            if matches!(*status, ProcessStatus::Exited | ProcessStatus::Crashed) {
                return Ok(());
            }
            *status = ProcessStatus::Terminating;
        }

        let pid = Pid::from_raw(managed.pid as i32);
        let sig = signal.unwrap_or(Signal::SIGTERM);
        info!(process_id = %id, pid = managed.pid, signal = ?sig, "terminating process");
        if let Err(e) = kill(pid, sig) {
            // Already gone between the status check and the signal.
            debug!(process_id = %id, error = %e, "signal delivery failed");
        }

        let mut rx = managed.exit_rx.clone();
        let exited = tokio::time::timeout(self.termination_grace, async {
            loop {
                if rx.borrow().is_some() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok();

        if !exited {
            warn!(process_id = %id, pid = managed.pid, "grace period elapsed, sending SIGKILL");
            let _ = kill(pid, Signal::SIGKILL);
            // SIGKILL cannot be ignored; wait for the waiter to record it.
            let mut rx = managed.exit_rx.clone();
            loop {
                if rx.borrow().is_some() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Terminate (if needed), forget the process, and free its pool
    /// slot.
    pub async fn release(&self, id: &Id) -> Result<()> {
        self.terminate(id, None).await?;
        if let Some(managed) = self.processes.lock().await.remove(id) {
            managed.permit.lock().await.take();
        }
        Ok(())
    }

    /// Terminate all active processes in parallel. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        let ids: Vec<Id> = self.processes.lock().await.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "shutting down process manager");

        let mut handles = Vec::with_capacity(ids.len());
        for id in &ids {
            handles.push(self.terminate(id, None));
        }
        futures_util::future::join_all(handles).await;
        self.processes.lock().await.clear();
    }

    /// Number of tracked processes.
    pub async fn active_count(&self) -> usize {
        self.processes.lock().await.len()
    }

    async fn get(&self, id: &Id) -> Result<Arc<ManagedProcess>> {
        self.processes
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))
    }
}

/// Forward one stdio stream into the broadcast channel until EOF.
async fn pump_output(
    mut stream: impl tokio::io::AsyncRead + Unpin,
    source: OutputSource,
    tx: broadcast::Sender<OutputChunk>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    source,
                    data: String::from_utf8_lossy(&buf[..n]).into_owned(),
                };
                // No subscribers is fine; the chunk is simply dropped.
                let _ = tx.send(chunk);
            }
        }
    }
}

async fn wait_for_exit(child: &mut Child) -> ExitInfo {
    match child.wait().await {
        Ok(status) => {
            use std::os::unix::process::ExitStatusExt;
            ExitInfo {
                code: status.code(),
                signal: status.signal(),
            }
        }
        Err(_) => ExitInfo {
            code: None,
            signal: None,
        },
    }
}

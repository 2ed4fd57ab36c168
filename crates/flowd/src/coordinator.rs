//! Replicated document coordinator.
//!
//! The daemon hosts the authoritative copy of a versioned key-value
//! document with one named map per concern (entity updates per kind,
//! execution state, agent metadata). Clients receive the full encoded
//! state on connect and exchange incremental updates afterwards; every
//! accepted update is re-broadcast to the other clients.
//!
//! Conflict resolution is last-writer-wins per key: each entry carries a
//! Lamport clock and an actor id, and a replica accepts an incoming
//! entry only if it is strictly newer (clock, then actor as the tie
//! break). Applying the same update twice is a no-op, which is what
//! makes at-least-once delivery safe.

use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flow_core::entity::{Entity, EntityKind};
use flow_core::Config;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Outbound queue depth per connected client.
const CLIENT_QUEUE_SIZE: usize = 256;

/// How long shutdown waits for clients to drain before force-clearing.
const SHUTDOWN_QUIESCENCE: Duration = Duration::from_secs(2);

/// The named maps of the replicated document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocMap {
    IssueUpdates,
    SpecUpdates,
    FeedbackUpdates,
    ExecutionState,
    AgentMetadata,
}

impl DocMap {
    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            Self::IssueUpdates => Some(EntityKind::Issue),
            Self::SpecUpdates => Some(EntityKind::Spec),
            Self::FeedbackUpdates => Some(EntityKind::Feedback),
            Self::ExecutionState | Self::AgentMetadata => None,
        }
    }

    fn for_entity_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Issue => Self::IssueUpdates,
            EntityKind::Spec => Self::SpecUpdates,
            EntityKind::Feedback => Self::FeedbackUpdates,
        }
    }
}

/// One versioned cell. `value: None` is a tombstone left behind by
/// deletion so late replicas converge instead of resurrecting the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Option<Value>,
    pub clock: u64,
    pub actor: String,
}

impl VersionedValue {
    fn supersedes(&self, other: &VersionedValue) -> bool {
        self.clock > other.clock || (self.clock == other.clock && self.actor > other.actor)
    }
}

/// One key change inside an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntry {
    pub map: DocMap,
    pub key: String,
    #[serde(flatten)]
    pub versioned: VersionedValue,
}

/// An incremental update: a batch of key changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocUpdate {
    pub entries: Vec<UpdateEntry>,
}

/// The authoritative document: named maps of versioned cells plus the
/// server's Lamport clock.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DocumentState {
    maps: HashMap<DocMap, HashMap<String, VersionedValue>>,
    clock: u64,
}

impl DocumentState {
    /// Apply an update. Returns the entries that actually changed state
    /// (stale entries are dropped).
    fn apply(&mut self, update: &DocUpdate) -> Vec<UpdateEntry> {
        let mut accepted = Vec::new();
        for entry in &update.entries {
            self.clock = self.clock.max(entry.versioned.clock);
            let map = self.maps.entry(entry.map).or_default();
            let is_new = match map.get(&entry.key) {
                Some(existing) => entry.versioned.supersedes(existing),
                None => true,
            };
            if is_new {
                map.insert(entry.key.clone(), entry.versioned.clone());
                accepted.push(entry.clone());
            }
        }
        accepted
    }

    /// Live (non-tombstone) values of one map.
    fn live_entries(&self, map: DocMap) -> Vec<(String, Value)> {
        self.maps
            .get(&map)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(key, versioned)| {
                        versioned
                            .value
                            .as_ref()
                            .map(|value| (key.clone(), value.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn next_clock(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Process-wide coordinator with explicit init and shutdown.
#[derive(Debug)]
pub struct Coordinator {
    doc: Mutex<DocumentState>,
    clients: DashMap<u64, mpsc::Sender<Vec<u8>>>,
    next_client_id: AtomicU64,
    storage: Arc<Storage>,
    actor: String,
    persist_interval: Duration,
    gc_interval: Duration,
    execution_gc_age: chrono::Duration,
    heartbeat_timeout: chrono::Duration,
    dirty: Notify,
    last_persist: Mutex<Option<DateTime<Utc>>>,
    shutdown_token: CancellationToken,
    shut_down: AtomicBool,
}

impl Coordinator {
    pub fn new(storage: Arc<Storage>, config: &Config) -> Self {
        Self {
            doc: Mutex::new(DocumentState::default()),
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            storage,
            actor: "server".to_string(),
            persist_interval: Duration::from_millis(config.persist_interval_ms),
            gc_interval: Duration::from_millis(config.gc_interval_ms),
            execution_gc_age: chrono::Duration::milliseconds(config.execution_gc_age_ms as i64),
            heartbeat_timeout: chrono::Duration::milliseconds(
                config.agent_heartbeat_timeout_ms as i64,
            ),
            dirty: Notify::new(),
            last_persist: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Load the initial document from the entity store.
    pub async fn load_initial_state(&self) -> Result<()> {
        let mut doc = self.doc.lock().await;
        for kind in [EntityKind::Issue, EntityKind::Spec, EntityKind::Feedback] {
            let entities = self.storage.list_entities(kind).await?;
            let clock = doc.next_clock();
            let map = doc.maps.entry(DocMap::for_entity_kind(kind)).or_default();
            for entity in entities {
                map.insert(
                    entity.uuid.clone(),
                    VersionedValue {
                        value: Some(serde_json::to_value(&entity)?),
                        clock,
                        actor: "server".to_string(),
                    },
                );
            }
        }
        info!("coordinator initial state loaded");
        Ok(())
    }

    /// Spawn the background persister and GC tasks.
    pub fn start(self: &Arc<Self>) {
        let persister = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = persister.dirty.notified() => {}
                    () = persister.shutdown_token.cancelled() => break,
                }
                // Debounce: batch all changes landing inside the window.
                tokio::time::sleep(persister.persist_interval).await;
                if let Err(e) = persister.persist().await {
                    warn!(error = %e, "persist failed, will retry on next change");
                }
            }
        });

        let collector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(collector.gc_interval) => {}
                    () = collector.shutdown_token.cancelled() => break,
                }
                collector.run_gc_once(Utc::now()).await;
            }
        });
    }

    /// Register a client: returns its id, the full encoded state for the
    /// `sync-init` frame, and the stream of updates to forward.
    pub async fn connect(&self) -> Result<(u64, Vec<u8>, mpsc::Receiver<Vec<u8>>)> {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_SIZE);
        self.clients.insert(client_id, tx);

        let doc = self.doc.lock().await;
        let state = serde_json::to_vec(&*doc)?;
        debug!(client_id, clients = self.clients.len(), "client connected");
        Ok((client_id, state, rx))
    }

    pub fn disconnect(&self, client_id: u64) {
        self.clients.remove(&client_id);
        debug!(client_id, clients = self.clients.len(), "client disconnected");
    }

    /// Apply an encoded update from a client and re-broadcast the
    /// accepted entries to every other client.
    pub async fn apply_update(&self, origin: Option<u64>, bytes: &[u8]) -> Result<()> {
        let update: DocUpdate = serde_json::from_slice(bytes)?;
        let accepted = {
            let mut doc = self.doc.lock().await;
            doc.apply(&update)
        };
        if accepted.is_empty() {
            return Ok(());
        }

        self.broadcast(origin, &DocUpdate { entries: accepted })
            .await?;
        self.dirty.notify_one();
        Ok(())
    }

    /// Server-side mutation: assign the next clock and broadcast to all
    /// clients. `value: None` deletes the key.
    pub async fn local_update(
        &self,
        map: DocMap,
        key: impl Into<String>,
        value: Option<Value>,
    ) -> Result<()> {
        let entry = {
            let mut doc = self.doc.lock().await;
            let clock = doc.next_clock();
            let entry = UpdateEntry {
                map,
                key: key.into(),
                versioned: VersionedValue {
                    value,
                    clock,
                    actor: self.actor.clone(),
                },
            };
            doc.apply(&DocUpdate {
                entries: vec![entry.clone()],
            });
            entry
        };

        self.broadcast(None, &DocUpdate {
            entries: vec![entry],
        })
        .await?;
        self.dirty.notify_one();
        Ok(())
    }

    /// Current live value of a key.
    pub async fn get(&self, map: DocMap, key: &str) -> Option<Value> {
        let doc = self.doc.lock().await;
        doc.maps
            .get(&map)
            .and_then(|entries| entries.get(key))
            .and_then(|versioned| versioned.value.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub async fn last_persist_time(&self) -> Option<DateTime<Utc>> {
        *self.last_persist.lock().await
    }

    async fn broadcast(&self, origin: Option<u64>, update: &DocUpdate) -> Result<()> {
        let bytes = serde_json::to_vec(update)?;
        let mut dead = Vec::new();
        for entry in &self.clients {
            if Some(*entry.key()) == origin {
                continue;
            }
            if entry.value().try_send(bytes.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for client_id in dead {
            warn!(client_id, "dropping unresponsive sync client");
            self.clients.remove(&client_id);
        }
        Ok(())
    }

    /// Write the three entity maps through to the store in a single
    /// transaction.
    pub async fn persist(&self) -> Result<()> {
        let batch = {
            let doc = self.doc.lock().await;
            let mut batch: Vec<(EntityKind, Entity)> = Vec::new();
            for kind in [EntityKind::Issue, EntityKind::Spec, EntityKind::Feedback] {
                for (uuid, value) in doc.live_entries(DocMap::for_entity_kind(kind)) {
                    match serde_json::from_value::<Entity>(value) {
                        Ok(entity) => batch.push((kind, entity)),
                        Err(e) => {
                            warn!(uuid = %uuid, error = %e, "skipping malformed entity in doc");
                        }
                    }
                }
            }
            batch
        };

        self.storage.upsert_entities(&batch).await?;
        *self.last_persist.lock().await = Some(Utc::now());
        debug!(entities = batch.len(), "document persisted");
        Ok(())
    }

    /// One garbage collection pass: drop settled executions older than
    /// the age limit and agents whose heartbeat went silent.
    pub async fn run_gc_once(&self, now: DateTime<Utc>) {
        let mut doomed: Vec<(DocMap, String)> = Vec::new();
        {
            let doc = self.doc.lock().await;
            for (key, value) in doc.live_entries(DocMap::ExecutionState) {
                let status = value.get("status").and_then(Value::as_str).unwrap_or("");
                let settled = matches!(status, "completed" | "failed");
                let old = parse_instant(value.get("completed_at"))
                    .is_some_and(|at| now - at > self.execution_gc_age);
                if settled && old {
                    doomed.push((DocMap::ExecutionState, key));
                }
            }
            for (key, value) in doc.live_entries(DocMap::AgentMetadata) {
                let silent = match parse_instant(value.get("last_heartbeat")) {
                    Some(at) => now - at > self.heartbeat_timeout,
                    None => true,
                };
                if silent {
                    doomed.push((DocMap::AgentMetadata, key));
                }
            }
        }

        if doomed.is_empty() {
            return;
        }
        info!(count = doomed.len(), "garbage collecting stale doc entries");
        for (map, key) in doomed {
            if let Err(e) = self.local_update(map, key, None).await {
                warn!(error = %e, "gc deletion failed");
            }
        }
    }

    /// Final flush, then close every client and stop background tasks.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("coordinator shutting down");
        if let Err(e) = self.persist().await {
            warn!(error = %e, "final persist failed");
        }
        self.shutdown_token.cancel();
        self.clients.clear();

        // Give in-flight sockets a moment to observe the closed queues.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_QUIESCENCE;
        while self.client_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.clients.clear();
    }
}

/// Parse a timestamp cell: epoch milliseconds or an RFC 3339 string.
fn parse_instant(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| chrono::TimeZone::timestamp_millis_opt(&Utc, ms).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

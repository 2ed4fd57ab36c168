//! Session broadcaster: fan out session updates and execution lifecycle
//! transitions to subscribers keyed by channel.
//!
//! Delivery is best-effort. A subscriber whose queue is full is
//! disconnected rather than allowed to backpressure producers. Updates
//! for an execution go only to that execution's channel; they are never
//! fanned out to the owning issue channel in parallel, which is what
//! keeps clients from seeing every update twice.

use dashmap::DashMap;
use flow_core::events::SessionUpdate;
use flow_core::{ExecutionStatus, Id};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Subscription scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelScope {
    Execution,
    Workflow,
    Issue,
}

impl ChannelScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Workflow => "workflow",
            Self::Issue => "issue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execution" => Some(Self::Execution),
            "workflow" => Some(Self::Workflow),
            "issue" => Some(Self::Issue),
            _ => None,
        }
    }
}

/// Channel tuple a subscriber registers for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub project_id: String,
    pub scope: ChannelScope,
    pub id: String,
}

impl ChannelKey {
    pub fn execution(project_id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            scope: ChannelScope::Execution,
            id: execution_id.into(),
        }
    }

    pub fn workflow(project_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            scope: ChannelScope::Workflow,
            id: workflow_id.into(),
        }
    }
}

#[derive(Serialize)]
struct SessionUpdateMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    data: SessionUpdateData<'a>,
}

#[derive(Serialize)]
struct SessionUpdateData<'a> {
    update: &'a SessionUpdate,
    #[serde(rename = "executionId")]
    execution_id: &'a str,
}

#[derive(Serialize)]
struct LifecycleMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    data: LifecycleData<'a>,
}

#[derive(Serialize)]
struct LifecycleData<'a> {
    #[serde(rename = "executionId")]
    execution_id: &'a str,
    status: &'a str,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// Fan-out hub for live session traffic.
#[derive(Debug)]
pub struct SessionBroadcaster {
    queue_size: usize,
    subscribers: DashMap<ChannelKey, Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
}

impl SessionBroadcaster {
    pub fn new(queue_size: usize) -> Self {
        Self {
            queue_size: queue_size.max(1),
            subscribers: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber on a channel. Returns the subscriber id
    /// (for unsubscribe) and the message stream.
    pub fn subscribe(&self, key: ChannelKey) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(key)
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Remove a subscriber from a channel.
    pub fn unsubscribe(&self, key: &ChannelKey, subscriber_id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(key) {
            entry.retain(|s| s.id != subscriber_id);
        }
        self.subscribers.remove_if(key, |_, subs| subs.is_empty());
    }

    /// Deliver a session update to the execution channel.
    pub fn broadcast_session_update(
        &self,
        project_id: &str,
        execution_id: &Id,
        update: &SessionUpdate,
    ) {
        let message = SessionUpdateMessage {
            message_type: "session_update",
            data: SessionUpdateData {
                update,
                execution_id: execution_id.as_ref(),
            },
        };
        let Ok(serialized) = serde_json::to_string(&message) else {
            return;
        };
        let key = ChannelKey::execution(project_id, execution_id.as_ref());
        self.deliver(&key, &serialized);
    }

    /// Deliver an execution lifecycle transition to the execution channel.
    pub fn broadcast_lifecycle(
        &self,
        project_id: &str,
        execution_id: &Id,
        status: ExecutionStatus,
    ) {
        let message = LifecycleMessage {
            message_type: "execution_status",
            data: LifecycleData {
                execution_id: execution_id.as_ref(),
                status: status.as_str(),
            },
        };
        let Ok(serialized) = serde_json::to_string(&message) else {
            return;
        };
        let key = ChannelKey::execution(project_id, execution_id.as_ref());
        self.deliver(&key, &serialized);
    }

    /// Deliver an arbitrary JSON message to the workflow channel.
    pub fn broadcast_workflow(&self, project_id: &str, workflow_id: &Id, payload: &serde_json::Value) {
        let Ok(serialized) = serde_json::to_string(payload) else {
            return;
        };
        let key = ChannelKey::workflow(project_id, workflow_id.as_ref());
        self.deliver(&key, &serialized);
    }

    /// Subscribers currently registered on a channel.
    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.subscribers.get(key).map_or(0, |subs| subs.len())
    }

    fn deliver(&self, key: &ChannelKey, serialized: &str) {
        let Some(mut entry) = self.subscribers.get_mut(key) else {
            return;
        };

        entry.retain(|subscriber| {
            match subscriber.tx.try_send(serialized.to_string()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: disconnect instead of blocking.
                    warn!(
                        scope = key.scope.as_str(),
                        channel = %key.id,
                        subscriber = subscriber.id,
                        "subscriber queue full, disconnecting"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(
                        scope = key.scope.as_str(),
                        channel = %key.id,
                        subscriber = subscriber.id,
                        "subscriber gone"
                    );
                    false
                }
            }
        });
        drop(entry);
        self.subscribers.remove_if(key, |_, subs| subs.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::events::ToolCallStatus;

    fn update() -> SessionUpdate {
        SessionUpdate::AgentMessageComplete {
            message_id: "m-1".to_string(),
            text: "done".to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_to_matching_execution_channel() {
        let broadcaster = SessionBroadcaster::new(8);
        let exec_id = Id::from_string("exec-1");
        let (_sub, mut rx) = broadcaster.subscribe(ChannelKey::execution("proj", "exec-1"));

        broadcaster.broadcast_session_update("proj", &exec_id, &update());

        let message = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(parsed["type"], "session_update");
        assert_eq!(parsed["data"]["executionId"], "exec-1");
        assert_eq!(parsed["data"]["update"]["type"], "agent_message_complete");
    }

    #[tokio::test]
    async fn does_not_fan_out_to_issue_channel() {
        let broadcaster = SessionBroadcaster::new(8);
        let exec_id = Id::from_string("exec-1");
        let (_sub, mut issue_rx) = broadcaster.subscribe(ChannelKey {
            project_id: "proj".to_string(),
            scope: ChannelScope::Issue,
            id: "i-1".to_string(),
        });

        broadcaster.broadcast_session_update("proj", &exec_id, &update());
        assert!(issue_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn other_executions_do_not_receive() {
        let broadcaster = SessionBroadcaster::new(8);
        let (_sub, mut other_rx) = broadcaster.subscribe(ChannelKey::execution("proj", "exec-2"));
        broadcaster.broadcast_session_update("proj", &Id::from_string("exec-1"), &update());
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn project_is_part_of_the_key() {
        let broadcaster = SessionBroadcaster::new(8);
        let (_sub, mut rx) = broadcaster.subscribe(ChannelKey::execution("other-proj", "exec-1"));
        broadcaster.broadcast_session_update("proj", &Id::from_string("exec-1"), &update());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected() {
        let broadcaster = SessionBroadcaster::new(1);
        let exec_id = Id::from_string("exec-1");
        let key = ChannelKey::execution("proj", "exec-1");
        let (_sub, _rx) = broadcaster.subscribe(key.clone());

        // First fills the queue; second overflows and disconnects.
        broadcaster.broadcast_session_update("proj", &exec_id, &update());
        assert_eq!(broadcaster.subscriber_count(&key), 1);
        broadcaster.broadcast_session_update("proj", &exec_id, &update());
        assert_eq!(broadcaster.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_delivery() {
        let broadcaster = SessionBroadcaster::new(8);
        let exec_id = Id::from_string("exec-1");
        let key = ChannelKey::execution("proj", "exec-1");
        let (_sub, rx) = broadcaster.subscribe(key.clone());
        drop(rx);

        broadcaster.broadcast_session_update("proj", &exec_id, &update());
        assert_eq!(broadcaster.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_subscriber() {
        let broadcaster = SessionBroadcaster::new(8);
        let key = ChannelKey::execution("proj", "exec-1");
        let (sub_a, _rx_a) = broadcaster.subscribe(key.clone());
        let (_sub_b, _rx_b) = broadcaster.subscribe(key.clone());

        broadcaster.unsubscribe(&key, sub_a);
        assert_eq!(broadcaster.subscriber_count(&key), 1);
    }

    #[tokio::test]
    async fn lifecycle_transitions_reach_execution_subscribers() {
        let broadcaster = SessionBroadcaster::new(8);
        let exec_id = Id::from_string("exec-1");
        let (_sub, mut rx) = broadcaster.subscribe(ChannelKey::execution("proj", "exec-1"));

        broadcaster.broadcast_lifecycle("proj", &exec_id, ExecutionStatus::Completed);

        let message = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(parsed["type"], "execution_status");
        assert_eq!(parsed["data"]["status"], "completed");
    }

    #[tokio::test]
    async fn tool_call_updates_serialize_with_status() {
        let broadcaster = SessionBroadcaster::new(8);
        let exec_id = Id::from_string("exec-1");
        let (_sub, mut rx) = broadcaster.subscribe(ChannelKey::execution("proj", "exec-1"));

        let update = SessionUpdate::ToolCallComplete {
            tool_call_id: "tc-1".to_string(),
            tool_name: "bash".to_string(),
            status: ToolCallStatus::Failed,
        };
        broadcaster.broadcast_session_update("proj", &exec_id, &update);

        let message = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(parsed["data"]["update"]["status"], "failed");
    }
}

//! Event types: workflow events for the audit log, normalized entries
//! produced from raw agent output, and the coalesced session updates fed
//! to subscribers.

use crate::types::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Workflow events ---

/// Workflow event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventType {
    StepStarted,
    StepCompleted,
    StepFailed,
    EscalationRequested,
    EscalationResolved,
    UserResponse,
    OrchestratorWakeup,
}

impl WorkflowEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::EscalationRequested => "escalation_requested",
            Self::EscalationResolved => "escalation_resolved",
            Self::UserResponse => "user_response",
            Self::OrchestratorWakeup => "orchestrator_wakeup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "step_started" => Some(Self::StepStarted),
            "step_completed" => Some(Self::StepCompleted),
            "step_failed" => Some(Self::StepFailed),
            "escalation_requested" => Some(Self::EscalationRequested),
            "escalation_resolved" => Some(Self::EscalationResolved),
            "user_response" => Some(Self::UserResponse),
            "orchestrator_wakeup" => Some(Self::OrchestratorWakeup),
            _ => None,
        }
    }
}

/// An append-only record of something that happened to a workflow.
///
/// `processed_at` is set once, when a wakeup consumes the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: Id,
    pub workflow_id: Id,
    pub event_type: WorkflowEventType,
    pub execution_id: Option<Id>,
    pub step_id: Option<Id>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

// --- Normalized entries ---

/// Status of a tool invocation as reported in the agent's transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Only terminal statuses produce `tool_call_complete` updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// A tool invocation embedded in a `tool_use` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    /// Tool arguments / action description, kept as raw JSON.
    #[serde(default)]
    pub action: Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Payload of a normalized entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEntryKind {
    AssistantMessage {
        text: String,
    },
    Thinking {
        reasoning: String,
    },
    ToolUse {
        tool: ToolInvocation,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    SystemMessage {
        text: String,
    },
    UserMessage {
        text: String,
    },
}

impl NormalizedEntryKind {
    /// Discriminator used in `(index, kind)` dedup keys.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::AssistantMessage { .. } => "assistant_message",
            Self::Thinking { .. } => "thinking",
            Self::ToolUse { .. } => "tool_use",
            Self::Error { .. } => "error",
            Self::SystemMessage { .. } => "system_message",
            Self::UserMessage { .. } => "user_message",
        }
    }
}

/// A typed structured event derived from raw agent stdout.
///
/// Entries form an append-only sequence per execution; the same
/// `(index, kind)` may recur with cumulatively larger content when the
/// agent streams "replace" patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEntry {
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: NormalizedEntryKind,
}

// --- Session updates ---

/// Terminal status carried on a `tool_call_complete` update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Working,
    Completed,
    Failed,
    Incomplete,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Incomplete => "incomplete",
        }
    }
}

/// A coalesced, completion-style event fed to UI subscribers.
///
/// `message_id` is stable across cumulative updates of the same streaming
/// message so consumers can update in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    AgentMessageComplete {
        message_id: String,
        text: String,
    },
    AgentThoughtComplete {
        message_id: String,
        text: String,
    },
    ToolCallComplete {
        tool_call_id: String,
        tool_name: String,
        status: ToolCallStatus,
    },
    UserMessageComplete {
        message_id: String,
        text: String,
    },
}

impl SessionUpdate {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::AgentMessageComplete { .. } => "agent_message_complete",
            Self::AgentThoughtComplete { .. } => "agent_thought_complete",
            Self::ToolCallComplete { .. } => "tool_call_complete",
            Self::UserMessageComplete { .. } => "user_message_complete",
        }
    }
}

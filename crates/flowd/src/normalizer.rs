//! Output normalizer: raw agent stdout → normalized entries → session
//! updates.
//!
//! Agents speaking plain-text protocols stream cumulative "replace"
//! patches: every chunk for the same logical message repeats the prior
//! text plus a little more. The normalizer absorbs those patches and
//! only lets through updates that are worth delivering:
//!
//! - exact repeats per `(index, kind)` are dropped (content hash),
//! - small prefix extensions are held back until enough new text
//!   accumulates (50 chars while the message is short, 100 after),
//! - cumulative updates keep a stable `message_id`; divergent content
//!   starts a fresh one,
//! - tool calls get a stable `tool_call_id` keyed by name + arguments,
//!   and only terminal statuses produce a `tool_call_complete`.
//!
//! `finish` flushes whatever the collapse heuristic was still holding,
//! so the final delivered text always equals the final agent text.

use chrono::Utc;
use flow_core::events::{
    NormalizedEntry, NormalizedEntryKind, SessionUpdate, ToolCallStatus, ToolStatus,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Prefix-extension threshold: additions smaller than this are held back.
fn collapse_threshold(last_emitted_len: usize) -> usize {
    if last_emitted_len < 200 {
        50
    } else {
        100
    }
}

fn content_hash(content: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.finalize().into()
}

/// A raw transcript line as emitted by structured agents. `index` ties
/// cumulative replaces for the same logical message together.
#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(default)]
    index: Option<u64>,
    #[serde(flatten)]
    kind: NormalizedEntryKind,
}

/// Entries plus session updates produced by one push.
#[derive(Debug, Default)]
pub struct NormalizerOutput {
    pub entries: Vec<NormalizedEntry>,
    pub updates: Vec<SessionUpdate>,
}

impl NormalizerOutput {
    fn merge(&mut self, other: NormalizerOutput) {
        self.entries.extend(other.entries);
        self.updates.extend(other.updates);
    }
}

#[derive(Debug)]
struct TextState {
    /// Latest content seen, emitted or not.
    last_seen: String,
    last_seen_hash: [u8; 32],
    /// Latest content actually delivered downstream.
    last_emitted: String,
    message_id: String,
}

/// Streaming normalizer for one execution's output.
#[derive(Debug)]
pub struct OutputNormalizer {
    line_buf: String,
    /// Next index handed to lines that don't carry one.
    auto_index: u64,
    /// Index of the current plain-text (non-JSON) message stream.
    plain_index: Option<u64>,
    plain_accum: String,
    text_states: HashMap<(u64, &'static str), TextState>,
    /// Non-text `(index, kind)` dedup hashes (tool calls, errors).
    seen_hashes: HashMap<(u64, &'static str), [u8; 32]>,
    /// `(tool name, stringified args)` → stable tool call id.
    tool_ids: HashMap<String, String>,
    /// Tool call ids that already produced a terminal update.
    completed_tools: std::collections::HashSet<String>,
    error_count: u64,
}

impl Default for OutputNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputNormalizer {
    pub fn new() -> Self {
        Self {
            line_buf: String::new(),
            auto_index: 0,
            plain_index: None,
            plain_accum: String::new(),
            text_states: HashMap::new(),
            seen_hashes: HashMap::new(),
            tool_ids: HashMap::new(),
            completed_tools: std::collections::HashSet::new(),
            error_count: 0,
        }
    }

    /// Feed one chunk of stdout. Complete lines are processed; a trailing
    /// partial line is buffered until the next chunk or `finish`.
    pub fn push_chunk(&mut self, data: &str) -> NormalizerOutput {
        let mut output = NormalizerOutput::default();
        self.line_buf.push_str(data);

        while let Some(newline) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            output.merge(self.process_line(line));
        }

        output
    }

    /// Flush buffered state: the partial line, then every message the
    /// collapse heuristic was still holding back.
    pub fn finish(&mut self) -> NormalizerOutput {
        let mut output = NormalizerOutput::default();

        if !self.line_buf.is_empty() {
            let line = std::mem::take(&mut self.line_buf);
            output.merge(self.process_line(line.trim_end_matches(['\n', '\r'])));
        }

        let mut pending: Vec<(u64, &'static str)> = self
            .text_states
            .iter()
            .filter(|(_, state)| state.last_seen != state.last_emitted)
            .map(|(key, _)| *key)
            .collect();
        pending.sort_unstable();

        for key in pending {
            if let Some(state) = self.text_states.get_mut(&key) {
                state.last_emitted = state.last_seen.clone();
                let (index, kind) = key;
                let content = state.last_seen.clone();
                let message_id = state.message_id.clone();
                output.merge(emit_text(index, kind, &content, &message_id));
            }
        }

        output
    }

    fn process_line(&mut self, line: &str) -> NormalizerOutput {
        if line.trim().is_empty() {
            return NormalizerOutput::default();
        }

        match serde_json::from_str::<RawLine>(line) {
            Ok(raw) => {
                let index = raw.index.unwrap_or_else(|| {
                    let idx = self.auto_index;
                    self.auto_index = self.auto_index.max(idx + 1);
                    idx
                });
                self.auto_index = self.auto_index.max(index + 1);
                self.process_entry(index, raw.kind)
            }
            Err(_) => self.process_plain_line(line),
        }
    }

    /// Plain-text lines accumulate into one cumulative assistant message.
    fn process_plain_line(&mut self, line: &str) -> NormalizerOutput {
        let index = *self.plain_index.get_or_insert_with(|| {
            let idx = self.auto_index;
            self.auto_index += 1;
            idx
        });

        if !self.plain_accum.is_empty() {
            self.plain_accum.push('\n');
        }
        self.plain_accum.push_str(line);

        let text = self.plain_accum.clone();
        self.process_entry(index, NormalizedEntryKind::AssistantMessage { text })
    }

    fn process_entry(&mut self, index: u64, kind: NormalizedEntryKind) -> NormalizerOutput {
        match kind {
            NormalizedEntryKind::AssistantMessage { text } => {
                self.process_text(index, "assistant_message", &text)
            }
            NormalizedEntryKind::Thinking { reasoning } => {
                self.process_text(index, "thinking", &reasoning)
            }
            NormalizedEntryKind::SystemMessage { text } => {
                self.process_text(index, "system_message", &text)
            }
            NormalizedEntryKind::UserMessage { text } => {
                self.process_text(index, "user_message", &text)
            }
            NormalizedEntryKind::ToolUse { tool } => self.process_tool(index, tool),
            NormalizedEntryKind::Error {
                code,
                message,
                stack,
            } => self.process_error(index, code, message, stack),
        }
    }

    fn process_text(&mut self, index: u64, kind: &'static str, content: &str) -> NormalizerOutput {
        let hash = content_hash(content);
        let key = (index, kind);

        let Some(state) = self.text_states.get_mut(&key) else {
            // First content for this key always goes out.
            let message_id = flow_core::Id::new().to_string();
            self.text_states.insert(
                key,
                TextState {
                    last_seen: content.to_string(),
                    last_seen_hash: hash,
                    last_emitted: content.to_string(),
                    message_id: message_id.clone(),
                },
            );
            return emit_text(index, kind, content, &message_id);
        };

        // Exact repeat of the latest content: drop.
        if state.last_seen_hash == hash {
            return NormalizerOutput::default();
        }

        let diverged =
            !content.starts_with(&state.last_seen) && !state.last_seen.starts_with(content);
        state.last_seen = content.to_string();
        state.last_seen_hash = hash;

        if diverged {
            // A new logical message replaced the old stream.
            state.message_id = flow_core::Id::new().to_string();
            state.last_emitted = content.to_string();
            let message_id = state.message_id.clone();
            return emit_text(index, kind, content, &message_id);
        }

        if content.starts_with(&state.last_emitted) {
            let addition = content.len() - state.last_emitted.len();
            if addition < collapse_threshold(state.last_emitted.len()) {
                // Hold back keystroke-sized additions; finish() flushes.
                return NormalizerOutput::default();
            }
            state.last_emitted = content.to_string();
            let message_id = state.message_id.clone();
            return emit_text(index, kind, content, &message_id);
        }

        // Content shrank below what we already delivered: stale replay.
        NormalizerOutput::default()
    }

    fn process_tool(
        &mut self,
        index: u64,
        tool: flow_core::events::ToolInvocation,
    ) -> NormalizerOutput {
        let serialized = serde_json::to_string(&tool).unwrap_or_default();
        let hash = content_hash(&serialized);
        let key = (index, "tool_use");
        if self.seen_hashes.get(&key) == Some(&hash) {
            return NormalizerOutput::default();
        }
        self.seen_hashes.insert(key, hash);

        let args = serde_json::to_string(&tool.action).unwrap_or_default();
        let call_key = format!("{}\u{1f}{}", tool.name, args);
        let tool_call_id = self
            .tool_ids
            .entry(call_key)
            .or_insert_with(|| flow_core::Id::new().to_string())
            .clone();

        let mut output = NormalizerOutput::default();
        let status = tool.status;
        let tool_name = tool.name.clone();
        output.entries.push(NormalizedEntry {
            index,
            timestamp: Utc::now(),
            kind: NormalizedEntryKind::ToolUse { tool },
        });

        if status.is_terminal() && self.completed_tools.insert(tool_call_id.clone()) {
            output.updates.push(SessionUpdate::ToolCallComplete {
                tool_call_id,
                tool_name,
                status: match status {
                    ToolStatus::Success => ToolCallStatus::Completed,
                    _ => ToolCallStatus::Failed,
                },
            });
        }

        output
    }

    fn process_error(
        &mut self,
        index: u64,
        code: Option<String>,
        message: String,
        stack: Option<String>,
    ) -> NormalizerOutput {
        let hash = content_hash(&message);
        let key = (index, "error");
        if self.seen_hashes.get(&key) == Some(&hash) {
            return NormalizerOutput::default();
        }
        self.seen_hashes.insert(key, hash);

        self.error_count += 1;
        let tool_call_id = format!("error-{}", self.error_count);

        let mut output = NormalizerOutput::default();
        output.entries.push(NormalizedEntry {
            index,
            timestamp: Utc::now(),
            kind: NormalizedEntryKind::Error {
                code,
                message,
                stack,
            },
        });
        output.updates.push(SessionUpdate::ToolCallComplete {
            tool_call_id,
            tool_name: "error".to_string(),
            status: ToolCallStatus::Failed,
        });
        output
    }
}

fn emit_text(
    index: u64,
    kind: &'static str,
    content: &str,
    message_id: &str,
) -> NormalizerOutput {
    let mut output = NormalizerOutput::default();
    let timestamp = Utc::now();

    let (entry_kind, update) = match kind {
        "thinking" => (
            NormalizedEntryKind::Thinking {
                reasoning: content.to_string(),
            },
            SessionUpdate::AgentThoughtComplete {
                message_id: message_id.to_string(),
                text: content.to_string(),
            },
        ),
        "system_message" => (
            NormalizedEntryKind::SystemMessage {
                text: content.to_string(),
            },
            SessionUpdate::AgentMessageComplete {
                message_id: message_id.to_string(),
                text: format!("[System] {content}"),
            },
        ),
        "user_message" => (
            NormalizedEntryKind::UserMessage {
                text: content.to_string(),
            },
            SessionUpdate::UserMessageComplete {
                message_id: message_id.to_string(),
                text: content.to_string(),
            },
        ),
        _ => (
            NormalizedEntryKind::AssistantMessage {
                text: content.to_string(),
            },
            SessionUpdate::AgentMessageComplete {
                message_id: message_id.to_string(),
                text: content.to_string(),
            },
        ),
    };

    output.entries.push(NormalizedEntry {
        index,
        timestamp,
        kind: entry_kind,
    });
    output.updates.push(update);
    output
}

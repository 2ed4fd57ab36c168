//! Entity model for the JSONL store.
//!
//! Entities (issues, specs, feedback) live in newline-delimited JSON files,
//! one minified object per line. The `uuid` field is the stable identity
//! across forks; `id` is the human-readable handle and may be renamed when
//! merges collide. Unknown fields round-trip untouched.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Relationship kind: an entity may block another, depend on another, or
/// implement a spec. Kinds outside this set are carried but ignored by the
/// dependency analyzer.
pub const RELATION_BLOCKS: &str = "blocks";
pub const RELATION_DEPENDS_ON: &str = "depends-on";
pub const RELATION_IMPLEMENTS: &str = "implements";

/// A typed link from one entity to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Relationship {
    pub fn new(kind: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
            extra: Map::new(),
        }
    }

    pub fn is_blocks(&self) -> bool {
        self.kind == RELATION_BLOCKS
    }

    pub fn is_depends_on(&self) -> bool {
        self.kind == RELATION_DEPENDS_ON
    }

    pub fn is_implements(&self) -> bool {
        self.kind == RELATION_IMPLEMENTS
    }
}

/// Which of the three entity stores a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Issue,
    Spec,
    Feedback,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Spec => "spec",
            Self::Feedback => "feedback",
        }
    }
}

/// One row of the entity store.
///
/// Timestamps are kept as the raw strings found on disk so that merge
/// output preserves whatever format the writer used; [`Entity::created_at`]
/// and [`Entity::updated_at`] parse on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub uuid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Kind-specific and unknown fields (status, priority, parent, anchor,
    /// anything a newer writer added), preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity {
    /// Parse one JSONL line into an entity.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Serialize to a single minified JSON line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Full field map of this entity, used for field-wise merging.
    pub fn to_value(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Rebuild an entity from a field map produced by [`Entity::to_value`].
    pub fn from_value(map: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        parse_timestamp(self.created_at.as_deref())
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        parse_timestamp(self.updated_at.as_deref())
    }

    /// Targets of relationships of the given kind.
    pub fn relation_targets<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a str> {
        self.relationships
            .iter()
            .filter(move |r| r.kind == kind)
            .map(|r| r.target.as_str())
    }
}

/// Parse an entity timestamp.
///
/// Accepts ISO-8601 (`2025-01-01T00:00:00Z`, with or without fractional
/// seconds or offset) and the space-separated form some writers emit
/// (`2025-01-01 00:00:00`). Missing or unparseable values sort as the
/// oldest possible instant so a real timestamp always wins a merge.
pub fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return DateTime::<Utc>::MIN_UTC;
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DateTime::<Utc>::MIN_UTC;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return dt.with_timezone(&Utc);
    }

    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return naive.and_utc();
        }
    }

    DateTime::<Utc>::MIN_UTC
}

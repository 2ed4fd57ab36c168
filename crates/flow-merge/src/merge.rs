//! Per-entity three-way merge for the JSONL store.
//!
//! Entities are reconciled by `uuid`, then field by field against the
//! common ancestor. A field changed on one side only takes the change;
//! a field changed on both takes the side with the newer `updated_at`
//! (ties favor ours). An entity present in base but missing on one side
//! is a tombstone and stays deleted. After the uuid-level merge, human
//! ids that collided across distinct uuids are renamed with `.1`, `.2`,
//! … suffixes and reported as conflict records.

use flow_core::entity::{parse_timestamp, Entity};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// A recorded id rename caused by distinct uuids sharing one human id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub uuid: String,
    pub original_ids: Vec<String>,
    pub resolved_ids: Vec<String>,
    pub action: String,
}

/// Result of merging three entity sets.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Merged entities, sorted by `(created_at, id)`.
    pub entities: Vec<Entity>,
    pub conflicts: Vec<ConflictRecord>,
}

/// Merge two divergent entity sets against their common ancestor.
pub fn merge_entities(base: &[Entity], ours: &[Entity], theirs: &[Entity]) -> MergeOutcome {
    let base_by_uuid: HashMap<&str, &Entity> =
        base.iter().map(|e| (e.uuid.as_str(), e)).collect();
    let ours_by_uuid: HashMap<&str, &Entity> =
        ours.iter().map(|e| (e.uuid.as_str(), e)).collect();
    let theirs_by_uuid: HashMap<&str, &Entity> =
        theirs.iter().map(|e| (e.uuid.as_str(), e)).collect();

    // Union of uuids in a deterministic order: ours first, then
    // theirs-only, then base-only (the latter only produce tombstones).
    let mut uuids: Vec<&str> = Vec::new();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for entity in ours.iter().chain(theirs.iter()).chain(base.iter()) {
        if seen.insert(entity.uuid.as_str()) {
            uuids.push(entity.uuid.as_str());
        }
    }

    let mut merged: Vec<Entity> = Vec::new();
    for uuid in uuids {
        let in_base = base_by_uuid.get(uuid).copied();
        let in_ours = ours_by_uuid.get(uuid).copied();
        let in_theirs = theirs_by_uuid.get(uuid).copied();

        let result = match (in_base, in_ours, in_theirs) {
            // Added on one side only.
            (None, Some(entity), None) | (None, None, Some(entity)) => Some(entity.clone()),
            // Added independently on both sides: merge against nothing.
            (None, Some(our), Some(their)) => merge_fields(None, our, their),
            // Deleted on at least one side: tombstone wins.
            (Some(_), None, _) | (Some(_), _, None) => None,
            // The ordinary three-way case.
            (Some(base_entity), Some(our), Some(their)) => {
                merge_fields(Some(base_entity), our, their)
            }
            (None, None, None) => None,
        };

        if let Some(entity) = result {
            merged.push(entity);
        }
    }

    let conflicts = resolve_id_collisions(&mut merged);

    merged.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id.cmp(&b.id))
    });

    MergeOutcome {
        entities: merged,
        conflicts,
    }
}

/// Field-wise three-way merge of one entity. `base = None` treats every
/// side's field as an independent addition.
fn merge_fields(base: Option<&Entity>, ours: &Entity, theirs: &Entity) -> Option<Entity> {
    let base_map = base.map(Entity::to_value).unwrap_or_default();
    let ours_map = ours.to_value();
    let theirs_map = theirs.to_value();

    // The conflict winner is fixed per entity: newer updated_at, ties
    // favor ours.
    let ours_wins = ours.updated_at() >= theirs.updated_at();

    let mut keys: BTreeSet<&String> = BTreeSet::new();
    keys.extend(base_map.keys());
    keys.extend(ours_map.keys());
    keys.extend(theirs_map.keys());

    let mut result: Map<String, Value> = Map::new();
    for key in keys {
        let base_value = base_map.get(key);
        let our_value = ours_map.get(key);
        let their_value = theirs_map.get(key);

        let winner = if our_value == their_value {
            our_value
        } else if our_value == base_value {
            their_value
        } else if their_value == base_value {
            our_value
        } else if ours_wins {
            our_value
        } else {
            their_value
        };

        if let Some(value) = winner {
            result.insert(key.clone(), value.clone());
        }
    }

    // updated_at always converges to the maximum of the two sides.
    let max_updated = if ours.updated_at() >= theirs.updated_at() {
        ours.updated_at.clone()
    } else {
        theirs.updated_at.clone()
    };
    match max_updated {
        Some(raw) => {
            result.insert("updated_at".to_string(), Value::String(raw));
        }
        None => {
            result.remove("updated_at");
        }
    }

    match Entity::from_value(result) {
        Ok(entity) => Some(entity),
        Err(e) => {
            warn!(uuid = %ours.uuid, error = %e, "merged entity failed to rebuild, keeping ours");
            Some(ours.clone())
        }
    }
}

/// Rename entities whose human ids collide across distinct uuids. The
/// first arrival keeps the id; later ones get `.1`, `.2`, … suffixes.
fn resolve_id_collisions(entities: &mut [Entity]) -> Vec<ConflictRecord> {
    let mut taken: HashMap<String, usize> = HashMap::new();
    let mut conflicts = Vec::new();

    for index in 0..entities.len() {
        let id = entities[index].id.clone();
        let first = taken.get(&id).copied();
        match first {
            None => {
                taken.insert(id, index);
            }
            Some(first) if entities[first].uuid == entities[index].uuid => {
                // Same uuid twice should not survive the uuid merge, but
                // never rename an entity against itself.
            }
            Some(_) => {
                let mut suffix = 1;
                let renamed = loop {
                    let candidate = format!("{id}.{suffix}");
                    if !taken.contains_key(&candidate) {
                        break candidate;
                    }
                    suffix += 1;
                };
                conflicts.push(ConflictRecord {
                    record_type: "different-uuids".to_string(),
                    uuid: entities[index].uuid.clone(),
                    original_ids: vec![id.clone()],
                    resolved_ids: vec![renamed.clone()],
                    action: format!("renamed {id} to {renamed}"),
                });
                taken.insert(renamed.clone(), index);
                entities[index].id = renamed;
            }
        }
    }

    conflicts
}

/// Parse JSONL content into entities. Malformed lines are logged and
/// skipped, never fatal.
pub fn parse_lines(content: &str) -> Vec<Entity> {
    let mut entities = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match Entity::from_line(line) {
            Ok(entity) => entities.push(entity),
            Err(e) => {
                warn!(line = number + 1, error = %e, "skipping unparseable line");
            }
        }
    }
    entities
}

/// Serialize entities back to JSONL: one minified object per line with a
/// trailing newline.
pub fn render_lines(entities: &[Entity]) -> String {
    let mut out = String::new();
    for entity in entities {
        match entity.to_line() {
            Ok(line) => {
                out.push_str(&line);
                out.push('\n');
            }
            Err(e) => warn!(uuid = %entity.uuid, error = %e, "skipping unserializable entity"),
        }
    }
    out
}

/// Sort key used by the on-disk order: `(created_at, id)`.
pub fn sort_key(entity: &Entity) -> (chrono::DateTime<chrono::Utc>, String) {
    (entity.created_at(), entity.id.clone())
}

/// Cheap key probe for raw lines: parses only the fields the sort needs.
pub fn line_sort_key(line: &str) -> Option<(chrono::DateTime<chrono::Utc>, String)> {
    #[derive(serde::Deserialize)]
    struct KeyProbe {
        id: String,
        #[serde(default)]
        created_at: Option<String>,
    }
    let probe: KeyProbe = serde_json::from_str(line).ok()?;
    Some((parse_timestamp(probe.created_at.as_deref()), probe.id))
}

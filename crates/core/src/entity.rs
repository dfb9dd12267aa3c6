//! Entity records synchronized by the engine (meeting sessions and tasks).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Error, Result};

/// Entity collections known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    Task,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Task => "task",
        }
    }

    /// Collection path segment used by the network collaborator.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Session => "sessions",
            Self::Task => "tasks",
        }
    }

    pub fn from_collection(collection: &str) -> Option<Self> {
        match collection {
            "sessions" => Some(Self::Session),
            "tasks" => Some(Self::Task),
            _ => None,
        }
    }
}

/// Unique key of an entity (`session_id` / `task_id` scoped by kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn session(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Session, id)
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Task, id)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Lifecycle status shared by sessions and tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Scheduled,
    Live,
    InProgress,
    Completed,
    Cancelled,
    Archived,
}

impl EntityStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Live | Self::InProgress)
    }

    pub fn is_archived(&self) -> bool {
        matches!(self, Self::Archived | Self::Cancelled)
    }
}

/// Field names that callers may not overwrite through payloads.
const READ_ONLY_FIELDS: [&str; 5] = ["kind", "id", "etag", "created_at", "updated_at"];

/// A server-owned record. The state store holds the authoritative copy; cache
/// snapshots and queued operations only ever hold clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(flatten)]
    pub key: EntityKey,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Server-issued version token.
    #[serde(default)]
    pub etag: Option<String>,
    /// Domain fields (title, labels, description, category, ...).
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl EntityRecord {
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            status: EntityStatus::default(),
            priority: 0,
            starts_at: None,
            created_at: None,
            updated_at: None,
            etag: None,
            fields: BTreeMap::new(),
        }
    }

    /// Time used for grouping and date-range filtering.
    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        self.starts_at.or(self.updated_at).or(self.created_at)
    }

    /// Read a field by name. Typed columns (`status`, `priority`, `starts_at`) are
    /// exposed as JSON alongside the free-form domain fields.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "status" => serde_json::to_value(self.status).ok(),
            "priority" => Some(Value::from(self.priority)),
            "starts_at" => self.starts_at.map(|ts| Value::String(ts.to_rfc3339())),
            _ => self.fields.get(name).cloned(),
        }
    }

    /// Write a field by name. A JSON null clears optional fields.
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        if READ_ONLY_FIELDS.contains(&name) {
            return Err(Error::invalid_request(format!(
                "Field '{}' is read-only on {}",
                name, self.key
            )));
        }
        match name {
            "status" => self.status = serde_json::from_value(value)?,
            "priority" => {
                self.priority = value
                    .as_i64()
                    .and_then(|p| i32::try_from(p).ok())
                    .ok_or_else(|| {
                        Error::invalid_request(format!("Invalid priority value {}", value))
                    })?;
            }
            "starts_at" => {
                self.starts_at = if value.is_null() {
                    None
                } else {
                    Some(serde_json::from_value(value)?)
                };
            }
            _ => {
                if value.is_null() {
                    self.fields.remove(name);
                } else {
                    self.fields.insert(name.to_string(), value);
                }
            }
        }
        Ok(())
    }

    /// Apply a partial update payload field by field.
    pub fn merge_payload(&mut self, payload: &serde_json::Map<String, Value>) -> Result<()> {
        for (name, value) in payload {
            self.set_field(name, value.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_record_wire_format_is_flat() {
        let raw = json!({
            "kind": "session",
            "id": "s-1",
            "status": "live",
            "priority": 3,
            "updated_at": "2026-01-05T10:00:00Z",
            "etag": "v7",
            "fields": { "title": "Standup" }
        });
        let record: EntityRecord = serde_json::from_value(raw).expect("decode record");
        assert_eq!(record.key, EntityKey::session("s-1"));
        assert_eq!(record.status, EntityStatus::Live);
        assert_eq!(record.field("title"), Some(json!("Standup")));
        assert_eq!(record.field("status"), Some(json!("live")));
    }

    #[test]
    fn set_field_rejects_read_only_columns() {
        let mut record = EntityRecord::new(EntityKey::task("t-1"));
        let err = record.set_field("etag", json!("forged")).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn merge_payload_updates_typed_and_domain_fields() {
        let mut record = EntityRecord::new(EntityKey::task("t-1"));
        record.fields.insert("notes".to_string(), json!("old"));
        let payload = json!({ "priority": 5, "labels": ["a"], "notes": null });
        record
            .merge_payload(payload.as_object().expect("object"))
            .expect("merge");
        assert_eq!(record.priority, 5);
        assert_eq!(record.field("labels"), Some(json!(["a"])));
        assert!(record.field("notes").is_none());
    }

    #[test]
    fn key_display_is_kind_prefixed() {
        assert_eq!(EntityKey::session("abc").to_string(), "session:abc");
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    context::Actor,
    error::Result,
    schema::Definition,
    store::{Event, NewEvent},
    value::{FieldMap, FieldValue},
};

pub const EVENT_CREATED: &str = "created";
pub const EVENT_UPDATED: &str = "updated";
pub const EVENT_DELETED: &str = "deleted";
pub const EVENT_INDEXED: &str = "indexed";

pub fn record_stream_id(entity: &str, id: &str) -> String {
    format!("{entity}/{id}")
}

/// Stream naming used before the `/` separator was introduced.
pub fn legacy_stream_id(entity: &str, id: &str) -> String {
    format!("{entity}-{id}")
}

/// The closed set of event types the fold understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Indexed,
    Unknown(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            EVENT_CREATED => EventKind::Created,
            EVENT_UPDATED => EventKind::Updated,
            EVENT_DELETED => EventKind::Deleted,
            EVENT_INDEXED => EventKind::Indexed,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Created => EVENT_CREATED,
            EventKind::Updated => EVENT_UPDATED,
            EventKind::Deleted => EVENT_DELETED,
            EventKind::Indexed => EVENT_INDEXED,
            EventKind::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default)]
    pub actor: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new(actor: &Actor, recorded_at: DateTime<Utc>) -> Self {
        Self {
            actor: Some(actor.id().to_string()),
            recorded_at,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DataPayload {
    #[serde(default)]
    data: Map<String, Value>,
}

fn encode_data(data: &FieldMap) -> Result<Vec<u8>> {
    let payload = DataPayload {
        data: data
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    };
    Ok(serde_json::to_vec(&payload)?)
}

fn decode_data(bytes: &[u8]) -> Result<Map<String, Value>> {
    if bytes.is_empty() {
        return Ok(Map::new());
    }
    let payload: DataPayload = serde_json::from_slice(bytes)?;
    Ok(payload.data)
}

pub fn created_event(
    entity: &str,
    data: &FieldMap,
    metadata: &EventMetadata,
) -> Result<NewEvent> {
    Ok(NewEvent {
        aggregate_type: entity.to_string(),
        event_type: EVENT_CREATED.to_string(),
        payload: encode_data(data)?,
        metadata: metadata.encode()?,
    })
}

pub fn updated_event(
    entity: &str,
    patch: &FieldMap,
    metadata: &EventMetadata,
) -> Result<NewEvent> {
    Ok(NewEvent {
        aggregate_type: entity.to_string(),
        event_type: EVENT_UPDATED.to_string(),
        payload: encode_data(patch)?,
        metadata: metadata.encode()?,
    })
}

pub fn deleted_event(entity: &str, metadata: &EventMetadata) -> Result<NewEvent> {
    Ok(NewEvent {
        aggregate_type: entity.to_string(),
        event_type: EVENT_DELETED.to_string(),
        payload: b"{}".to_vec(),
        metadata: metadata.encode()?,
    })
}

/// Current state of a record, derived from its event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub entity: String,
    pub id: String,
    pub data: FieldMap,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub version: u64,
    pub deleted: bool,
}

impl Record {
    pub fn new(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
            data: FieldMap::new(),
            created_at: None,
            updated_at: None,
            created_by: None,
            updated_by: None,
            version: 0,
            deleted: false,
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.data.get(field)
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.data.insert(field.into(), value.into());
        self
    }

    /// Value used for filtering, sorting and grouping. Audit attributes are
    /// addressable alongside data fields.
    pub fn lookup(&self, field: &str) -> Option<FieldValue> {
        if let Some(value) = self.data.get(field) {
            return Some(value.clone());
        }
        match field {
            "createdAt" => self.created_at.map(FieldValue::DateTime),
            "updatedAt" => self.updated_at.map(FieldValue::DateTime),
            "createdBy" => self.created_by.clone().map(FieldValue::String),
            "updatedBy" => self.updated_by.clone().map(FieldValue::String),
            "version" => Some(FieldValue::Number(self.version as f64)),
            _ => None,
        }
    }

    /// Applies one event. Returns `false` when the event does not affect
    /// record state (index markers and unknown types).
    pub fn apply(&mut self, definition: &Definition, event: &Event) -> Result<bool> {
        let kind = EventKind::parse(&event.event_type);
        let metadata = match kind {
            EventKind::Created | EventKind::Updated | EventKind::Deleted => {
                EventMetadata::decode(&event.metadata)?
            }
            EventKind::Indexed | EventKind::Unknown(_) => return Ok(false),
        };

        match kind {
            EventKind::Created => {
                self.data = decode_data(&event.payload)?
                    .iter()
                    .filter(|(_, raw)| !raw.is_null())
                    .map(|(key, raw)| (key.clone(), FieldValue::decode(definition.field(key), raw)))
                    .collect();
                self.created_at = Some(metadata.recorded_at);
                self.created_by = metadata.actor.clone();
                self.deleted = false;
            }
            EventKind::Updated => {
                for (key, raw) in decode_data(&event.payload)? {
                    if raw.is_null() {
                        self.data.remove(&key);
                    } else {
                        let value = FieldValue::decode(definition.field(&key), &raw);
                        self.data.insert(key, value);
                    }
                }
            }
            EventKind::Deleted => {
                self.deleted = true;
            }
            EventKind::Indexed | EventKind::Unknown(_) => {}
        }

        if self.created_at.is_none() {
            self.created_at = Some(metadata.recorded_at);
            self.created_by = metadata.actor.clone();
        }
        self.updated_at = Some(metadata.recorded_at);
        self.updated_by = metadata.actor;
        self.version = event.version;
        Ok(true)
    }

    pub fn exists(&self) -> bool {
        self.version > 0
    }
}

/// Folds a record stream. `None` when no event applied.
pub fn fold(
    definition: &Definition,
    id: &str,
    events: &[Event],
) -> Result<Option<Record>> {
    let mut record = Record::new(definition.id.clone(), id);
    for event in events {
        record.apply(definition, event)?;
    }
    Ok(record.exists().then_some(record))
}

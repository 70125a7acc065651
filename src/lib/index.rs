use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    context::Context,
    error::Result,
    record::{EVENT_INDEXED, EventKind, EventMetadata},
    store::{Event, EventStore, ExpectedVersion, NewEvent},
};

pub fn index_stream_id(entity: &str) -> String {
    format!("{entity}/_index")
}

pub fn index_aggregate_type(entity: &str) -> String {
    format!("{entity}_index")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub record_id: String,
    pub deleted: bool,
}

impl IndexEntry {
    pub fn new(record_id: impl Into<String>, deleted: bool) -> Self {
        Self {
            record_id: record_id.into(),
            deleted,
        }
    }

    pub fn to_event(&self, entity: &str, metadata: &EventMetadata) -> Result<NewEvent> {
        Ok(NewEvent {
            aggregate_type: index_aggregate_type(entity),
            event_type: EVENT_INDEXED.to_string(),
            payload: serde_json::to_vec(self)?,
            metadata: metadata.encode()?,
        })
    }
}

/// Replays index events into the live member set. Later entries for the same
/// id replace earlier ones; the result is sorted by record id.
pub fn fold_index(events: &[Event]) -> Result<Vec<String>> {
    let mut members: BTreeMap<String, bool> = BTreeMap::new();
    for event in events {
        if EventKind::parse(&event.event_type) != EventKind::Indexed {
            continue;
        }
        let entry: IndexEntry = serde_json::from_slice(&event.payload)?;
        members.insert(entry.record_id, entry.deleted);
    }
    Ok(members
        .into_iter()
        .filter_map(|(id, deleted)| (!deleted).then_some(id))
        .collect())
}

const INDEX_APPEND_ATTEMPTS: usize = 3;

/// Appends one membership marker. Index appends carry no version check, so a
/// conflict only means another writer took the same slot and is retried.
pub fn append_entry(
    store: &dyn EventStore,
    ctx: &Context,
    entity: &str,
    entry: &IndexEntry,
    metadata: &EventMetadata,
) -> Result<u64> {
    let event = entry.to_event(entity, metadata)?;
    let stream_id = index_stream_id(entity);
    let mut attempt = 1;
    loop {
        match store.append(ctx, &stream_id, ExpectedVersion::Any, std::slice::from_ref(&event)) {
            Ok(version) => {
                debug!(
                    entity,
                    record_id = %entry.record_id,
                    deleted = entry.deleted,
                    version,
                    "indexed record"
                );
                return Ok(version);
            }
            Err(err) if err.is_retryable() && attempt < INDEX_APPEND_ATTEMPTS => {
                debug!(entity, attempt, "retrying index append");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn load_members(store: &dyn EventStore, ctx: &Context, entity: &str) -> Result<Vec<String>> {
    let events = store.load(ctx, &index_stream_id(entity), 1)?;
    fold_index(&events)
}

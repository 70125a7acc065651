use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    query::{Page, PageSettings, paginate, parse_page_token},
    record::{EventKind, Record},
    schema::Definition,
    store::Event,
    value::FieldMap,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryOptions {
    pub page_size: usize,
    pub page_token: Option<String>,
}

impl HistoryOptions {
    pub fn page(page_size: usize, page_token: Option<String>) -> Self {
        Self {
            page_size,
            page_token,
        }
    }
}

/// State of a record immediately after one event was applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub version: u64,
    pub event_type: String,
    pub recorded_at: Option<DateTime<Utc>>,
    pub actor: Option<String>,
    pub data: FieldMap,
    pub deleted: bool,
}

/// Replays `events` into one snapshot per applied event, oldest first.
/// Snapshots only carry declared fields.
pub fn reconstruct(
    definition: &Definition,
    id: &str,
    events: &[Event],
) -> Result<Vec<HistoryEntry>> {
    let mut record = Record::new(definition.id.clone(), id);
    let mut entries = Vec::new();
    for event in events {
        if !record.apply(definition, event)? {
            continue;
        }
        entries.push(HistoryEntry {
            version: record.version,
            event_type: EventKind::parse(&event.event_type).as_str().to_string(),
            recorded_at: record.updated_at,
            actor: record.updated_by.clone(),
            data: record
                .data
                .iter()
                .filter(|(field, _)| {
                    definition.is_declared(field) || **field == definition.primary_key
                })
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect(),
            deleted: record.deleted,
        });
    }
    Ok(entries)
}

/// Newest-first page of history.
pub fn page(
    mut entries: Vec<HistoryEntry>,
    options: &HistoryOptions,
    settings: &PageSettings,
) -> Result<Page<HistoryEntry>> {
    let offset = parse_page_token(options.page_token.as_deref())?;
    entries.reverse();
    Ok(paginate(entries, offset, settings.clamp(options.page_size)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        record::tests::stored,
        schema::{FieldDefinition, FieldType},
    };
    use serde_json::json;

    fn definition() -> Definition {
        Definition::new(
            "user",
            "id",
            vec![
                FieldDefinition::new("id", FieldType::String),
                FieldDefinition::new("email", FieldType::String),
            ],
        )
    }

    fn events() -> Vec<Event> {
        vec![
            stored(
                1,
                "created",
                json!({"data": {"id": "1", "email": "a@x.com", "legacy": 1}}),
                "ann",
                0,
            ),
            stored(2, "archived", json!({}), "ann", 1),
            stored(3, "updated", json!({"data": {"email": "b@x.com"}}), "bob", 2),
            stored(4, "deleted", json!({}), "cid", 3),
        ]
    }

    #[test]
    fn one_entry_per_applied_event() {
        let entries = reconstruct(&definition(), "1", &events()).unwrap();
        assert_eq!(entries.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1, 3, 4]);
        assert_eq!(entries[0].data.get("email").map(|v| v.key()), Some("a@x.com".into()));
        assert!(!entries[0].data.contains_key("legacy"));
        assert_eq!(entries[1].actor.as_deref(), Some("bob"));
        assert!(entries[2].deleted);
        assert_eq!(entries[2].data.get("email").map(|v| v.key()), Some("b@x.com".into()));
    }

    #[test]
    fn pages_are_newest_first() {
        let entries = reconstruct(&definition(), "1", &events()).unwrap();
        let settings = PageSettings::default();
        let first = page(entries.clone(), &HistoryOptions::page(2, None), &settings).unwrap();
        assert_eq!(first.items.iter().map(|e| e.version).collect::<Vec<_>>(), vec![4, 3]);
        let token = first.next_page_token.clone();
        assert_eq!(token.as_deref(), Some("2"));
        let second = page(entries, &HistoryOptions::page(2, token), &settings).unwrap();
        assert_eq!(second.items.iter().map(|e| e.version).collect::<Vec<_>>(), vec![1]);
        assert!(second.next_page_token.is_none());
    }
}

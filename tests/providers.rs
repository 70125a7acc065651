use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use chrono::Utc;
use entitydbx::{
    Actor, Context, Definition, EngineError, EntityService, FieldDefinition, FieldMap, FieldType,
    FieldValue, Filter, HistoryOptions, ListOptions, ListQuery, Page, PivotOptions, Provider,
    Record, SchemaRegistry, query, store::SqliteEventStore,
};
use parking_lot::Mutex;
use serde_json::json;

/// Keeps records in memory and reuses the engine's list pipeline.
#[derive(Default)]
struct MemoryProvider {
    records: Mutex<BTreeMap<String, Record>>,
}

impl Provider for MemoryProvider {
    fn list(
        &self,
        ctx: &Context,
        definition: &Definition,
        query: &ListQuery,
    ) -> entitydbx::Result<Page<Record>> {
        ctx.check()?;
        let records = self
            .records
            .lock()
            .values()
            .filter(|record| !record.deleted)
            .cloned()
            .collect();
        Ok(query::apply(definition, records, query))
    }

    fn get(&self, _ctx: &Context, definition: &Definition, id: &str) -> entitydbx::Result<Record> {
        match self.records.lock().get(id) {
            Some(record) if record.deleted => Err(EngineError::RecordDeleted {
                entity: definition.id.clone(),
                id: id.to_string(),
            }),
            Some(record) => Ok(record.clone()),
            None => Err(EngineError::RecordNotFound {
                entity: definition.id.clone(),
                id: id.to_string(),
            }),
        }
    }

    fn create(
        &self,
        _ctx: &Context,
        definition: &Definition,
        actor: &Actor,
        data: FieldMap,
    ) -> entitydbx::Result<Record> {
        let id = data
            .get(&definition.primary_key)
            .map(FieldValue::key)
            .unwrap_or_default();
        let now = Utc::now();
        let record = Record {
            data,
            created_at: Some(now),
            updated_at: Some(now),
            created_by: Some(actor.id().to_string()),
            updated_by: Some(actor.id().to_string()),
            version: 1,
            ..Record::new(definition.id.clone(), id.clone())
        };
        self.records.lock().insert(id, record.clone());
        Ok(record)
    }

    fn update(
        &self,
        _ctx: &Context,
        definition: &Definition,
        actor: &Actor,
        id: &str,
        patch: FieldMap,
        expected_version: Option<u64>,
    ) -> entitydbx::Result<Record> {
        let mut records = self.records.lock();
        let record = records.get_mut(id).ok_or_else(|| EngineError::RecordNotFound {
            entity: definition.id.clone(),
            id: id.to_string(),
        })?;
        if let Some(expected) = expected_version {
            if expected != record.version {
                return Err(EngineError::ConcurrencyConflict {
                    stream_id: id.to_string(),
                    expected,
                    actual: record.version,
                });
            }
        }
        for (field, value) in patch {
            if value.is_null() {
                record.data.remove(&field);
            } else {
                record.data.insert(field, value);
            }
        }
        record.version += 1;
        record.updated_at = Some(Utc::now());
        record.updated_by = Some(actor.id().to_string());
        Ok(record.clone())
    }

    fn delete(
        &self,
        _ctx: &Context,
        definition: &Definition,
        _actor: &Actor,
        id: &str,
    ) -> entitydbx::Result<()> {
        let mut records = self.records.lock();
        let record = records.get_mut(id).ok_or_else(|| EngineError::RecordNotFound {
            entity: definition.id.clone(),
            id: id.to_string(),
        })?;
        record.deleted = true;
        Ok(())
    }
}

fn registry() -> SchemaRegistry {
    let team = Definition::new(
        "team",
        "id",
        vec![
            FieldDefinition::new("id", FieldType::String),
            FieldDefinition::new("name", FieldType::String).required(),
            FieldDefinition::new("tier", FieldType::Enum).with_values(&["gold", "silver"]),
        ],
    );
    let player = Definition::new(
        "player",
        "id",
        vec![
            FieldDefinition::new("id", FieldType::String),
            FieldDefinition::new("name", FieldType::String),
            FieldDefinition::new("teamId", FieldType::String).references("team"),
        ],
    );
    SchemaRegistry::from_definitions(vec![team, player]).expect("registry")
}

fn service(provider: Arc<MemoryProvider>) -> Result<EntityService> {
    Ok(EntityService::builder(Arc::new(registry()), Arc::new(SqliteEventStore::open_in_memory()?))
        .provider("Team", provider)
        .build()?)
}

#[test]
fn provider_receives_sanitised_mutations() -> Result<()> {
    let provider = Arc::new(MemoryProvider::default());
    let service = service(provider.clone())?;
    let ctx = Context::background();
    let ann = Actor::new("ann")?;

    let created = service.create_record(
        &ctx,
        "team",
        Some(&ann),
        &json!({"id": "t1", "name": "Reds", "tier": "GOLD"}),
    )?;
    assert_eq!(created.get("tier"), Some(&FieldValue::Enum("gold".into())));
    assert!(provider.records.lock().contains_key("t1"));

    assert!(matches!(
        service.create_record(
            &ctx,
            "team",
            Some(&ann),
            &json!({"id": "t2", "name": "Blues", "tier": "bronze"}),
        ),
        Err(EngineError::Validation(_))
    ));
    assert_eq!(provider.records.lock().len(), 1);

    let updated = service.update_record_at(
        &ctx,
        "team",
        Some(&ann),
        "t1",
        &json!({"tier": null}),
        Some(1),
    )?;
    assert_eq!(updated.version, 2);
    assert!(updated.get("tier").is_none());

    service.delete_record(&ctx, "team", Some(&ann), "t1")?;
    assert!(matches!(
        service.get_record(&ctx, "team", "t1"),
        Err(EngineError::RecordDeleted { .. })
    ));
    Ok(())
}

#[test]
fn nested_filters_reach_provider_entities() -> Result<()> {
    let provider = Arc::new(MemoryProvider::default());
    let service = service(provider)?;
    let ctx = Context::background();
    let ann = Actor::new("ann")?;
    service.create_record(
        &ctx,
        "team",
        Some(&ann),
        &json!({"id": "t1", "name": "Reds", "tier": "gold"}),
    )?;
    service.create_record(
        &ctx,
        "team",
        Some(&ann),
        &json!({"id": "t2", "name": "Blues", "tier": "silver"}),
    )?;
    for (id, team) in [("a", "t1"), ("b", "t2"), ("c", "t1")] {
        service.create_record(&ctx, "player", Some(&ann), &json!({"id": id, "teamId": team}))?;
    }

    let options = ListOptions::new().filter(Filter::eq("team.tier", json!("gold")));
    let page = service.list_records(&ctx, "player", &options)?;
    assert_eq!(page.items.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["a", "c"]);

    let teams = service.list_records(&ctx, "team", &ListOptions::new().search("blue"))?;
    assert_eq!(teams.items.len(), 1);

    let pivot = service.pivot_records(&ctx, "team", &PivotOptions::rows("tier"))?;
    assert_eq!(pivot.grand_total, 2);
    Ok(())
}

#[test]
fn provider_history_defaults_to_unsupported() -> Result<()> {
    let service = service(Arc::new(MemoryProvider::default()))?;
    let err = service
        .record_history(&Context::background(), "team", "t1", &HistoryOptions::default())
        .unwrap_err();
    assert!(matches!(err, EngineError::Unsupported { operation: "record history", .. }));
    Ok(())
}

#[test]
fn providers_must_name_declared_entities() -> Result<()> {
    let store = SqliteEventStore::open_in_memory()?;
    let result = EntityService::builder(Arc::new(registry()), Arc::new(store))
        .provider("coach", Arc::new(MemoryProvider::default()))
        .build();
    assert!(matches!(result, Err(EngineError::UnknownEntity(entity)) if entity == "coach"));
    Ok(())
}

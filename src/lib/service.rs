use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    cache::{CachedRecord, RecordCache},
    config::{DEFAULT_PIVOT_BATCH_SIZE, DEFAULT_RECORD_CACHE_CAPACITY, EngineConfig},
    context::{Actor, Context},
    error::{EngineError, Result, ValidationErrors},
    filter::{NormalizedFilter, normalize},
    history::{self, HistoryEntry, HistoryOptions},
    index::{self, IndexEntry},
    pivot::{PivotOptions, PivotResult, PivotTally},
    provider::Provider,
    query::{self, ListOptions, ListQuery, Page, PageSettings, parse_page_token},
    record::{
        EventMetadata, Record, created_event, deleted_event, legacy_stream_id, record_stream_id,
        updated_event,
    },
    reference::{Resolution, resolve_nested},
    schema::{Definition, FieldType, SchemaRegistry},
    store::{EventStore, ExpectedVersion},
    validation::{canonical_record_id, sanitize_create, sanitize_update},
    value::FieldValue,
};

/// Public facade over schema, store, query engine and providers.
pub struct EntityService {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn EventStore>,
    providers: HashMap<String, Arc<dyn Provider>>,
    cache: Option<RecordCache>,
    page_settings: PageSettings,
    pivot_batch_size: usize,
}

pub struct EntityServiceBuilder {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn EventStore>,
    providers: HashMap<String, Arc<dyn Provider>>,
    cache_capacity: usize,
    page_settings: PageSettings,
    pivot_batch_size: usize,
}

impl EntityServiceBuilder {
    pub fn provider(mut self, entity: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers
            .insert(entity.into().trim().to_ascii_lowercase(), provider);
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn page_settings(mut self, settings: PageSettings) -> Self {
        self.page_settings = settings;
        self
    }

    pub fn pivot_batch_size(mut self, size: usize) -> Self {
        self.pivot_batch_size = size;
        self
    }

    pub fn build(self) -> Result<EntityService> {
        self.page_settings.validate()?;
        if self.pivot_batch_size == 0 {
            return Err(EngineError::Config("pivot batch size must be at least 1".into()));
        }
        for entity in self.providers.keys() {
            if !self.registry.contains(entity) {
                return Err(EngineError::UnknownEntity(entity.clone()));
            }
        }
        Ok(EntityService {
            registry: self.registry,
            store: self.store,
            providers: self.providers,
            cache: RecordCache::new(self.cache_capacity),
            page_settings: self.page_settings,
            pivot_batch_size: self.pivot_batch_size.min(self.page_settings.max_page_size),
        })
    }
}

/// A record as read from storage together with the stream holding it.
struct Loaded {
    stream_id: String,
    record: Record,
    stream_version: u64,
}

impl EntityService {
    pub fn builder(
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn EventStore>,
    ) -> EntityServiceBuilder {
        EntityServiceBuilder {
            registry,
            store,
            providers: HashMap::new(),
            cache_capacity: DEFAULT_RECORD_CACHE_CAPACITY,
            page_settings: PageSettings::default(),
            pivot_batch_size: DEFAULT_PIVOT_BATCH_SIZE,
        }
    }

    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn EventStore>) -> Result<Self> {
        Self::builder(registry, store).build()
    }

    /// Loads schemas, opens the configured store and applies paging and
    /// cache settings.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(config.load_registry()?);
        let store = config.open_store()?;
        info!(
            entities = registry.len(),
            schema_dir = %config.schema_dir.display(),
            "entity service ready"
        );
        Self::builder(registry, store)
            .page_settings(config.page_settings())
            .pivot_batch_size(config.pivot_batch_size)
            .cache_capacity(config.record_cache_capacity)
            .build()
    }

    pub fn registry(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store)
    }

    pub fn close(&self) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.store.close()
    }

    pub fn list_entities(&self) -> Vec<Arc<Definition>> {
        self.registry.list()
    }

    pub fn definition(&self, entity: &str) -> Result<Arc<Definition>> {
        self.registry.get(entity)
    }

    fn provider(&self, entity: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(entity)
    }

    pub fn list_records(
        &self,
        ctx: &Context,
        entity: &str,
        options: &ListOptions,
    ) -> Result<Page<Record>> {
        ctx.check()?;
        let definition = self.definition(entity)?;
        match self.prepare_query(ctx, &definition, options)? {
            Some(query) => self.run_query(ctx, &definition, &query),
            None => Ok(Page::empty()),
        }
    }

    /// Validates `options` and resolves nested filters. `None` means no record
    /// can match.
    fn prepare_query(
        &self,
        ctx: &Context,
        definition: &Definition,
        options: &ListOptions,
    ) -> Result<Option<ListQuery>> {
        let query = ListQuery::new(definition, options, &self.page_settings)?;
        let filters = options
            .filters
            .iter()
            .map(|filter| normalize(&self.registry, definition, filter))
            .collect::<Result<Vec<_>>>()?;
        let resolution = resolve_nested(&self.registry, filters, |target, filters| {
            self.collect_matching(ctx, target, filters)
        })?;
        Ok(match resolution {
            Resolution::Filters(filters) => Some(query.with_filters(filters)),
            Resolution::Empty => None,
        })
    }

    fn run_query(
        &self,
        ctx: &Context,
        definition: &Definition,
        query: &ListQuery,
    ) -> Result<Page<Record>> {
        ctx.check()?;
        if let Some(provider) = self.provider(&definition.id) {
            return provider.list(ctx, definition, query);
        }
        let members = index::load_members(self.store.as_ref(), ctx, &definition.id)?;
        let mut records = Vec::with_capacity(members.len());
        for id in members {
            match self.load_record(ctx, definition, &id)? {
                Some(loaded) if !loaded.record.deleted => records.push(loaded.record),
                Some(_) => debug!(
                    entity = %definition.id,
                    record_id = %id,
                    "skipping deleted index member"
                ),
                None => debug!(
                    entity = %definition.id,
                    record_id = %id,
                    "skipping index member without stream"
                ),
            }
        }
        Ok(query::apply(definition, records, query))
    }

    /// Every record of `entity` matching single-step `filters`, across pages.
    fn collect_matching(
        &self,
        ctx: &Context,
        entity: &str,
        filters: Vec<NormalizedFilter>,
    ) -> Result<Vec<Record>> {
        let definition = self.definition(entity)?;
        let mut records = Vec::new();
        let mut offset = 0;
        loop {
            let query =
                ListQuery::all(&definition, filters.clone(), self.page_settings.max_page_size)
                    .with_offset(offset);
            let page = self.run_query(ctx, &definition, &query)?;
            records.extend(page.items);
            let Some(token) = page.next_page_token else {
                break;
            };
            let next = parse_page_token(Some(&token))?;
            if next <= offset {
                break;
            }
            offset = next;
        }
        Ok(records)
    }

    pub fn get_record(&self, ctx: &Context, entity: &str, id: &str) -> Result<Record> {
        ctx.check()?;
        let definition = self.definition(entity)?;
        let id = canonical_record_id(&definition, id);
        let id = id.as_str();
        if let Some(provider) = self.provider(&definition.id) {
            return provider.get(ctx, &definition, id);
        }
        let loaded = self
            .load_record(ctx, &definition, id)?
            .ok_or_else(|| EngineError::not_found(&definition.id, id))?;
        if loaded.record.deleted {
            return Err(EngineError::deleted(&definition.id, id));
        }
        Ok(loaded.record)
    }

    pub fn create_record(
        &self,
        ctx: &Context,
        entity: &str,
        actor: Option<&Actor>,
        payload: &Value,
    ) -> Result<Record> {
        let actor = Actor::require(actor)?;
        ctx.check()?;
        let definition = self.definition(entity)?;
        let mut data = sanitize_create(&definition, payload)?;
        let id = match data.get(&definition.primary_key) {
            Some(value) => value.key(),
            None => {
                let value = generate_id(&definition)?;
                let id = value.key();
                data.insert(definition.primary_key.clone(), value);
                id
            }
        };

        if let Some(provider) = self.provider(&definition.id) {
            let record = provider.create(ctx, &definition, actor, data)?;
            info!(
                entity = %definition.id,
                record_id = %record.id,
                actor = %actor,
                "created record via provider"
            );
            return Ok(record);
        }

        let legacy = legacy_stream_id(&definition.id, &id);
        let legacy_version = self.store.current_version(ctx, &legacy)?;
        if legacy_version > 0 {
            return Err(EngineError::ConcurrencyConflict {
                stream_id: legacy,
                expected: 0,
                actual: legacy_version,
            });
        }

        let stream_id = record_stream_id(&definition.id, &id);
        let metadata = EventMetadata::new(actor, Utc::now());
        let event = created_event(&definition.id, &data, &metadata)?;
        let version = self
            .store
            .append(ctx, &stream_id, ExpectedVersion::Exact(0), &[event])?;
        index::append_entry(
            self.store.as_ref(),
            ctx,
            &definition.id,
            &IndexEntry::new(id.clone(), false),
            &metadata,
        )?;
        info!(entity = %definition.id, record_id = %id, version, actor = %actor, "created record");
        self.reload(ctx, &definition, &stream_id, &id)
    }

    pub fn update_record(
        &self,
        ctx: &Context,
        entity: &str,
        actor: Option<&Actor>,
        id: &str,
        payload: &Value,
    ) -> Result<Record> {
        self.update_record_at(ctx, entity, actor, id, payload, None)
    }

    /// Updates a record only if its version still equals `expected_version`.
    /// Without an expected version the update is checked against the version
    /// read just before appending.
    pub fn update_record_at(
        &self,
        ctx: &Context,
        entity: &str,
        actor: Option<&Actor>,
        id: &str,
        payload: &Value,
        expected_version: Option<u64>,
    ) -> Result<Record> {
        let actor = Actor::require(actor)?;
        ctx.check()?;
        let definition = self.definition(entity)?;
        let id = canonical_record_id(&definition, id);
        let id = id.as_str();
        let patch = sanitize_update(&definition, payload)?;
        if patch.is_empty() {
            return self.get_record(ctx, &definition.id, id);
        }

        if let Some(provider) = self.provider(&definition.id) {
            let record = provider.update(ctx, &definition, actor, id, patch, expected_version)?;
            info!(
                entity = %definition.id,
                record_id = %id,
                actor = %actor,
                "updated record via provider"
            );
            return Ok(record);
        }

        let loaded = self.load_live(ctx, &definition, id)?;
        if let Some(expected) = expected_version {
            if expected != loaded.record.version {
                return Err(EngineError::ConcurrencyConflict {
                    stream_id: loaded.stream_id,
                    expected,
                    actual: loaded.record.version,
                });
            }
        }

        let metadata = EventMetadata::new(actor, Utc::now());
        let event = updated_event(&definition.id, &patch, &metadata)?;
        let version = self.store.append(
            ctx,
            &loaded.stream_id,
            ExpectedVersion::Exact(loaded.stream_version),
            &[event],
        )?;
        index::append_entry(
            self.store.as_ref(),
            ctx,
            &definition.id,
            &IndexEntry::new(id, false),
            &metadata,
        )?;
        info!(entity = %definition.id, record_id = %id, version, actor = %actor, "updated record");
        self.reload(ctx, &definition, &loaded.stream_id, id)
    }

    pub fn delete_record(
        &self,
        ctx: &Context,
        entity: &str,
        actor: Option<&Actor>,
        id: &str,
    ) -> Result<()> {
        let actor = Actor::require(actor)?;
        ctx.check()?;
        let definition = self.definition(entity)?;
        let id = canonical_record_id(&definition, id);
        let id = id.as_str();
        if let Some(provider) = self.provider(&definition.id) {
            provider.delete(ctx, &definition, actor, id)?;
            info!(
                entity = %definition.id,
                record_id = %id,
                actor = %actor,
                "deleted record via provider"
            );
            return Ok(());
        }

        let loaded = self.load_live(ctx, &definition, id)?;
        let metadata = EventMetadata::new(actor, Utc::now());
        let event = deleted_event(&definition.id, &metadata)?;
        let version = self.store.append(
            ctx,
            &loaded.stream_id,
            ExpectedVersion::Exact(loaded.stream_version),
            &[event],
        )?;
        index::append_entry(
            self.store.as_ref(),
            ctx,
            &definition.id,
            &IndexEntry::new(id, true),
            &metadata,
        )?;
        info!(entity = %definition.id, record_id = %id, version, actor = %actor, "deleted record");
        Ok(())
    }

    pub fn record_history(
        &self,
        ctx: &Context,
        entity: &str,
        id: &str,
        options: &HistoryOptions,
    ) -> Result<Page<HistoryEntry>> {
        ctx.check()?;
        let definition = self.definition(entity)?;
        let id = canonical_record_id(&definition, id);
        let id = id.as_str();
        if let Some(provider) = self.provider(&definition.id) {
            return provider.history(ctx, &definition, id, options);
        }

        let mut events = self
            .store
            .load(ctx, &record_stream_id(&definition.id, id), 1)?;
        if events.is_empty() {
            events = self
                .store
                .load(ctx, &legacy_stream_id(&definition.id, id), 1)?;
        }
        let entries = history::reconstruct(&definition, id, &events)?;
        if entries.is_empty() {
            return Err(EngineError::not_found(&definition.id, id));
        }
        history::page(entries, options, &self.page_settings)
    }

    pub fn pivot_records(
        &self,
        ctx: &Context,
        entity: &str,
        options: &PivotOptions,
    ) -> Result<PivotResult> {
        ctx.check()?;
        let definition = self.definition(entity)?;
        let mut tally = PivotTally::new(&definition, options)?;
        let list = ListOptions {
            filters: options.filters.clone(),
            search: options.search.clone(),
            page_size: self.pivot_batch_size,
            ..ListOptions::default()
        };
        let Some(query) = self.prepare_query(ctx, &definition, &list)? else {
            return Ok(tally.finish());
        };

        let mut offset = 0;
        loop {
            let page = self.run_query(ctx, &definition, &query.clone().with_offset(offset))?;
            for record in &page.items {
                tally.add(record);
            }
            let Some(token) = page.next_page_token else {
                break;
            };
            let next = parse_page_token(Some(&token))?;
            if next <= offset {
                break;
            }
            offset = next;
        }
        Ok(tally.finish())
    }

    fn load_live(&self, ctx: &Context, definition: &Definition, id: &str) -> Result<Loaded> {
        let loaded = self
            .load_record(ctx, definition, id)?
            .ok_or_else(|| EngineError::not_found(&definition.id, id))?;
        if loaded.record.deleted {
            return Err(EngineError::deleted(&definition.id, id));
        }
        Ok(loaded)
    }

    fn reload(
        &self,
        ctx: &Context,
        definition: &Definition,
        stream_id: &str,
        id: &str,
    ) -> Result<Record> {
        self.load_stream(ctx, definition, stream_id, id)?
            .map(|loaded| loaded.record)
            .ok_or_else(|| EngineError::not_found(&definition.id, id))
    }

    /// Reads a record from its current stream, falling back to the legacy
    /// stream name.
    fn load_record(
        &self,
        ctx: &Context,
        definition: &Definition,
        id: &str,
    ) -> Result<Option<Loaded>> {
        let primary = record_stream_id(&definition.id, id);
        if let Some(loaded) = self.load_stream(ctx, definition, &primary, id)? {
            return Ok(Some(loaded));
        }
        self.load_stream(ctx, definition, &legacy_stream_id(&definition.id, id), id)
    }

    /// Folds one stream, resuming from the cached state when present.
    fn load_stream(
        &self,
        ctx: &Context,
        definition: &Definition,
        stream_id: &str,
        id: &str,
    ) -> Result<Option<Loaded>> {
        let cached = self.cache.as_ref().and_then(|cache| cache.get(stream_id));
        let hit = cached.is_some();
        let (mut record, mut stream_version) = match cached {
            Some(entry) => (entry.record, entry.stream_version),
            None => (Record::new(definition.id.clone(), id), 0),
        };

        let events = self.store.load(ctx, stream_id, stream_version + 1)?;
        if hit {
            debug!(
                stream_id,
                cached_version = stream_version,
                new_events = events.len(),
                "record cache hit"
            );
        }
        for event in &events {
            record.apply(definition, event)?;
            stream_version = event.version;
        }
        if !record.exists() {
            return Ok(None);
        }

        if let Some(cache) = &self.cache {
            if !hit || !events.is_empty() {
                cache.put(
                    stream_id,
                    CachedRecord {
                        record: record.clone(),
                        stream_version,
                    },
                );
            }
        }
        Ok(Some(Loaded {
            stream_id: stream_id.to_string(),
            record,
            stream_version,
        }))
    }
}

/// Generated keys are uuid v4, which only string and uuid keys can hold.
fn generate_id(definition: &Definition) -> Result<FieldValue> {
    let id = Uuid::new_v4();
    match definition.primary_key_field().map(|field| field.field_type) {
        Some(FieldType::Uuid) => Ok(FieldValue::Uuid(id)),
        Some(FieldType::String | FieldType::Unspecified) | None => {
            Ok(FieldValue::String(id.to_string()))
        }
        Some(other) => {
            let mut errors = ValidationErrors::new();
            errors.push(
                definition.primary_key.clone(),
                format!("is required; {other} keys cannot be generated"),
            );
            Err(EngineError::Validation(errors))
        }
    }
}

use crate::{
    context::{Actor, Context},
    error::{EngineError, Result},
    history::{HistoryEntry, HistoryOptions},
    query::{ListQuery, Page},
    record::Record,
    schema::Definition,
    value::FieldMap,
};

/// Replaces storage-backed behaviour for one entity.
///
/// The service authenticates and sanitises every mutation before calling in;
/// a provider receives coerced field values and owns persistence. Nested
/// filters are resolved before `list` is called, so `query.filters` only
/// address the provider's own fields. Implementations can delegate to
/// [`crate::query::apply`] to honour the same filter, sort and paging rules as
/// stored entities.
pub trait Provider: Send + Sync {
    fn list(
        &self,
        ctx: &Context,
        definition: &Definition,
        query: &ListQuery,
    ) -> Result<Page<Record>>;

    fn get(&self, ctx: &Context, definition: &Definition, id: &str) -> Result<Record>;

    /// `data` already carries the primary key.
    fn create(
        &self,
        ctx: &Context,
        definition: &Definition,
        actor: &Actor,
        data: FieldMap,
    ) -> Result<Record>;

    /// A `Null` value in `patch` removes the field. `expected_version`, when
    /// set, is the version the caller last observed.
    fn update(
        &self,
        ctx: &Context,
        definition: &Definition,
        actor: &Actor,
        id: &str,
        patch: FieldMap,
        expected_version: Option<u64>,
    ) -> Result<Record>;

    fn delete(&self, ctx: &Context, definition: &Definition, actor: &Actor, id: &str) -> Result<()>;

    fn history(
        &self,
        _ctx: &Context,
        definition: &Definition,
        _id: &str,
        _options: &HistoryOptions,
    ) -> Result<Page<HistoryEntry>> {
        Err(EngineError::Unsupported {
            entity: definition.id.clone(),
            operation: "record history",
        })
    }
}

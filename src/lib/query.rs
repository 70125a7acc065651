use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{EngineError, Result},
    filter::{Filter, NormalizedFilter},
    record::Record,
    schema::Definition,
    value::{FieldValue, compare_text},
};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// Audit attributes accepted as sort keys.
pub const AUDIT_SORT_FIELDS: [&str; 3] = ["createdAt", "updatedAt", "version"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortDirection {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "asc" | "ascending" => Ok(SortDirection::Asc),
            "desc" | "descending" => Ok(SortDirection::Desc),
            other => Err(EngineError::InvalidSort(format!(
                "unknown sort direction '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        })
    }
}

/// Page-size bounds applied to list and history requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSettings {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

impl PageSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_page_size == 0 || self.default_page_size == 0 {
            return Err(EngineError::Config("page sizes must be at least 1".into()));
        }
        if self.default_page_size > self.max_page_size {
            return Err(EngineError::Config(format!(
                "default page size {} exceeds max page size {}",
                self.default_page_size, self.max_page_size
            )));
        }
        Ok(())
    }

    /// Zero selects the default; anything larger than the maximum is capped.
    pub fn clamp(&self, requested: usize) -> usize {
        if requested == 0 {
            self.default_page_size
        } else {
            requested.min(self.max_page_size)
        }
    }
}

/// Caller-facing list request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListOptions {
    pub filters: Vec<Filter>,
    pub sort_field: Option<String>,
    pub sort_dir: SortDirection,
    pub page_size: usize,
    pub page_token: Option<String>,
    pub search: Option<String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, dir: SortDirection) -> Self {
        self.sort_field = Some(field.into());
        self.sort_dir = dir;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn page_token(mut self, token: Option<String>) -> Self {
        self.page_token = token;
        self
    }

    pub fn search(mut self, term: impl Into<String>) -> Self {
        self.search = Some(term.into());
        self
    }
}

/// A validated list request whose filters all address root-entity fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub filters: Vec<NormalizedFilter>,
    pub sort_field: String,
    pub sort_dir: SortDirection,
    pub page_size: usize,
    pub offset: usize,
    pub search: Option<String>,
}

impl ListQuery {
    /// Validates sort, paging and search. Filters are attached by the caller
    /// once nested paths have been resolved.
    pub fn new(
        definition: &Definition,
        options: &ListOptions,
        settings: &PageSettings,
    ) -> Result<Self> {
        let sort_field = resolve_sort_field(definition, options.sort_field.as_deref())?;
        Ok(Self {
            filters: Vec::new(),
            sort_field,
            sort_dir: options.sort_dir,
            page_size: settings.clamp(options.page_size),
            offset: parse_page_token(options.page_token.as_deref())?,
            search: options
                .search
                .as_deref()
                .map(str::trim)
                .filter(|term| !term.is_empty())
                .map(str::to_string),
        })
    }

    /// An unpaginated query over `filters`, used to collect every match.
    pub fn all(definition: &Definition, filters: Vec<NormalizedFilter>, page_size: usize) -> Self {
        Self {
            filters,
            sort_field: definition.primary_key.clone(),
            sort_dir: SortDirection::Asc,
            page_size,
            offset: 0,
            search: None,
        }
    }

    pub fn with_filters(mut self, filters: Vec<NormalizedFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_page_token: None,
        }
    }
}

pub fn parse_page_token(token: Option<&str>) -> Result<usize> {
    match token.map(str::trim) {
        None | Some("") => Ok(0),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| EngineError::InvalidPayload(format!("invalid page token '{raw}'"))),
    }
}

pub fn resolve_sort_field(definition: &Definition, requested: Option<&str>) -> Result<String> {
    let Some(field) = requested.map(str::trim).filter(|field| !field.is_empty()) else {
        return Ok(definition.primary_key.clone());
    };
    if definition.is_declared(field) || AUDIT_SORT_FIELDS.contains(&field) {
        Ok(field.to_string())
    } else {
        Err(EngineError::InvalidSort(format!(
            "unknown sort field '{field}' on entity '{}'",
            definition.id
        )))
    }
}

/// Slices one page starting at `offset`; the next token points past it.
pub fn paginate<T>(items: Vec<T>, offset: usize, page_size: usize) -> Page<T> {
    let total = items.len();
    let end = offset.saturating_add(page_size).min(total);
    let next_page_token = (end < total).then(|| end.to_string());
    let items = if offset >= total {
        Vec::new()
    } else {
        items.into_iter().skip(offset).take(page_size).collect()
    };
    Page {
        items,
        next_page_token,
    }
}

/// Case-insensitive substring match over searchable fields and the primary key.
pub fn search_matches(definition: &Definition, record: &Record, term: &str) -> bool {
    let needle = term.to_lowercase();
    if record.id.to_lowercase().contains(&needle) {
        return true;
    }
    definition
        .fields
        .iter()
        .filter(|field| field.field_type.is_searchable() || field.id == definition.primary_key)
        .filter_map(|field| record.get(&field.id))
        .any(|value| value.key().to_lowercase().contains(&needle))
}

fn sort_value(definition: &Definition, record: &Record, field: &str) -> Option<FieldValue> {
    record
        .lookup(field)
        .filter(|value| !value.is_null())
        .or_else(|| {
            (field == definition.primary_key).then(|| FieldValue::String(record.id.clone()))
        })
}

/// Stable sort. Missing values order before present ones, values of
/// different types order by type rank and ties fall back to the record id.
pub fn sort_records(
    definition: &Definition,
    records: &mut [Record],
    field: &str,
    dir: SortDirection,
) {
    records.sort_by_cached_key(|record| SortKey {
        value: sort_value(definition, record, field),
        id: record.id.clone(),
        dir,
    });
}

struct SortKey {
    value: Option<FieldValue>,
    id: String,
    dir: SortDirection,
}

impl SortKey {
    fn value_ordering(&self, other: &Self) -> Ordering {
        match (&self.value, &other.value) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(lhs), Some(rhs)) => lhs.total_cmp(rhs),
        }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let ordering = match self.dir {
            SortDirection::Asc => self.value_ordering(other),
            SortDirection::Desc => other.value_ordering(self),
        };
        ordering.then_with(|| {
            compare_text(&self.id, &other.id).then_with(|| self.id.cmp(&other.id))
        })
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

/// Runs search, filters, sort and pagination over an in-memory record set.
/// Filters must already be single-step.
pub fn apply(definition: &Definition, records: Vec<Record>, query: &ListQuery) -> Page<Record> {
    let mut matched: Vec<Record> = records
        .into_iter()
        .filter(|record| match &query.search {
            Some(term) => search_matches(definition, record, term),
            None => true,
        })
        .filter(|record| query.filters.iter().all(|filter| filter.matches(definition, record)))
        .collect();
    sort_records(definition, &mut matched, &query.sort_field, query.sort_dir);
    paginate(matched, query.offset, query.page_size)
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{EngineError, Result},
    filter::Filter,
    record::Record,
    schema::Definition,
    value::FieldValue,
};

/// Grouping key for records whose grouping value is missing or empty.
pub const NONE_KEY: &str = "(none)";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PivotOptions {
    pub row_field: String,
    pub column_field: Option<String>,
    pub filters: Vec<Filter>,
    pub search: Option<String>,
}

impl PivotOptions {
    pub fn rows(field: impl Into<String>) -> Self {
        Self {
            row_field: field.into(),
            ..Self::default()
        }
    }

    pub fn columns(mut self, field: impl Into<String>) -> Self {
        self.column_field = Some(field.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotEntry {
    pub row_key: String,
    pub column_key: Option<String>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotResult {
    pub row_field: String,
    pub column_field: Option<String>,
    pub entries: Vec<PivotEntry>,
    pub row_totals: BTreeMap<String, u64>,
    pub column_totals: BTreeMap<String, u64>,
    pub grand_total: u64,
}

pub fn group_key(value: Option<&FieldValue>) -> String {
    match value {
        Some(value) if !value.is_empty() => value.key(),
        _ => NONE_KEY.to_string(),
    }
}

/// Accumulates counts per `(row, column)` pair.
#[derive(Debug)]
pub struct PivotTally {
    row_field: String,
    column_field: Option<String>,
    counts: BTreeMap<(String, Option<String>), u64>,
    row_totals: BTreeMap<String, u64>,
    column_totals: BTreeMap<String, u64>,
    grand_total: u64,
}

impl PivotTally {
    pub fn new(definition: &Definition, options: &PivotOptions) -> Result<Self> {
        let row_field = options.row_field.trim();
        if row_field.is_empty() {
            return Err(EngineError::InvalidPayload("pivot row field is required".into()));
        }
        ensure_declared(definition, row_field)?;
        let column_field = options
            .column_field
            .as_deref()
            .map(str::trim)
            .filter(|field| !field.is_empty());
        if let Some(column) = column_field {
            ensure_declared(definition, column)?;
        }
        Ok(Self {
            row_field: row_field.to_string(),
            column_field: column_field.map(str::to_string),
            counts: BTreeMap::new(),
            row_totals: BTreeMap::new(),
            column_totals: BTreeMap::new(),
            grand_total: 0,
        })
    }

    pub fn add(&mut self, record: &Record) {
        let row = group_key(record.get(&self.row_field));
        let column = self
            .column_field
            .as_ref()
            .map(|field| group_key(record.get(field)));

        *self.counts.entry((row.clone(), column.clone())).or_default() += 1;
        *self.row_totals.entry(row).or_default() += 1;
        if let Some(column) = column {
            *self.column_totals.entry(column).or_default() += 1;
        }
        self.grand_total += 1;
    }

    pub fn finish(self) -> PivotResult {
        PivotResult {
            row_field: self.row_field,
            column_field: self.column_field,
            entries: self
                .counts
                .into_iter()
                .map(|((row_key, column_key), count)| PivotEntry {
                    row_key,
                    column_key,
                    count,
                })
                .collect(),
            row_totals: self.row_totals,
            column_totals: self.column_totals,
            grand_total: self.grand_total,
        }
    }
}

fn ensure_declared(definition: &Definition, field: &str) -> Result<()> {
    if definition.is_declared(field) {
        Ok(())
    } else {
        Err(EngineError::InvalidPayload(format!(
            "unknown pivot field '{field}' on entity '{}'",
            definition.id
        )))
    }
}

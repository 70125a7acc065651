use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{EngineError, Result},
    record::Record,
    schema::{
        Definition, FieldDefinition, FieldType, FilterOperator, ReferenceDefinition, SchemaRegistry,
    },
    value::FieldValue,
};

/// A declarative condition as supplied by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    /// Dot-separated path; segments after the first traverse references.
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<FilterOperator>,
    #[serde(default)]
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator: Some(operator),
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            operator: None,
            value,
        }
    }

    /// Builds a filter from a textual operator such as `">="` or `"not_in"`.
    pub fn parse(field: impl Into<String>, operator: &str, value: Value) -> Result<Self> {
        Ok(Self::new(field, operator.parse()?, value))
    }
}

/// One hop along a filter path: the field on `entity`, with the reference it
/// traverses when it is not the last hop.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterStep {
    pub entity: String,
    pub field: String,
    pub field_type: FieldType,
    pub reference: Option<ReferenceDefinition>,
}

/// A filter whose path has been resolved against the schema and whose value
/// has been coerced to the leaf field's type.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFilter {
    pub steps: Vec<FilterStep>,
    pub operator: FilterOperator,
    pub value: FieldValue,
}

const AUDIT_FILTER_FIELDS: [(&str, FieldType); 5] = [
    ("createdAt", FieldType::Datetime),
    ("updatedAt", FieldType::Datetime),
    ("createdBy", FieldType::String),
    ("updatedBy", FieldType::String),
    ("version", FieldType::Number),
];

fn trim_id_suffix(id: &str) -> Option<&str> {
    ["_id", "Id", "ID"]
        .iter()
        .find_map(|suffix| id.strip_suffix(suffix))
        .filter(|trimmed| !trimmed.is_empty())
}

/// Finds the field a path segment names: by id, by id without an
/// `Id`/`ID`/`_id` suffix, or by a reference alias.
pub fn resolve_segment<'a>(
    definition: &'a Definition,
    segment: &str,
) -> Option<&'a FieldDefinition> {
    if let Some(field) = definition.field(segment) {
        return Some(field);
    }
    if let Some(field) = definition
        .fields
        .iter()
        .find(|field| trim_id_suffix(&field.id) == Some(segment))
    {
        return Some(field);
    }
    if let Some(field) = trim_id_suffix(segment).and_then(|trimmed| definition.field(trimmed)) {
        return Some(field);
    }
    definition.fields.iter().find(|field| {
        field
            .reference
            .as_ref()
            .is_some_and(|reference| reference.aliases().contains(&segment))
    })
}

impl NormalizedFilter {
    /// Single-step filter on a field of `entity`, used when feeding resolved
    /// reference values back up a path.
    pub fn on_field(step: FilterStep, operator: FilterOperator, value: FieldValue) -> Self {
        Self {
            steps: vec![step],
            operator,
            value,
        }
    }

    pub fn is_nested(&self) -> bool {
        self.steps.len() > 1
    }

    pub fn root(&self) -> &FilterStep {
        &self.steps[0]
    }

    pub fn leaf(&self) -> &FilterStep {
        &self.steps[self.steps.len() - 1]
    }

    /// Evaluates a single-step filter against a record.
    pub fn matches(&self, definition: &Definition, record: &Record) -> bool {
        let field = &self.leaf().field;
        let value = record.lookup(field).or_else(|| {
            (*field == definition.primary_key).then(|| FieldValue::String(record.id.clone()))
        });
        evaluate(self.operator, value.as_ref(), &self.value)
    }
}

pub fn normalize(
    registry: &SchemaRegistry,
    definition: &Definition,
    filter: &Filter,
) -> Result<NormalizedFilter> {
    let path = filter.field.trim();
    if path.is_empty() {
        return Err(EngineError::InvalidFilter("filter field is required".into()));
    }
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(EngineError::InvalidFilter(format!(
            "filter path '{path}' contains an empty segment"
        )));
    }

    let mut steps = Vec::with_capacity(segments.len());
    let mut current = registry.get(&definition.id)?;
    let mut leaf: Option<FieldDefinition> = None;

    for (idx, segment) in segments.iter().enumerate() {
        let last = idx + 1 == segments.len();
        let field = match resolve_segment(&current, segment) {
            Some(field) => field.clone(),
            None if last && steps.is_empty() => audit_field(segment).ok_or_else(|| {
                unknown_segment(segment, &current.id)
            })?,
            None => return Err(unknown_segment(segment, &current.id)),
        };

        steps.push(FilterStep {
            entity: current.id.clone(),
            field: field.id.clone(),
            field_type: field.field_type,
            reference: field.reference.clone(),
        });

        if last {
            leaf = Some(field);
        } else {
            let Some(reference) = field.reference.as_ref() else {
                return Err(EngineError::InvalidFilter(format!(
                    "field '{}' on entity '{}' is not a reference and cannot be traversed",
                    field.id, current.id
                )));
            };
            current = registry.get(&reference.entity).map_err(|_| {
                EngineError::InvalidFilter(format!(
                    "field '{}' references unknown entity '{}'",
                    field.id, reference.entity
                ))
            })?;
        }
    }

    let Some(leaf) = leaf else {
        return Err(EngineError::InvalidFilter(format!("invalid filter path '{path}'")));
    };
    let operator = filter.operator.unwrap_or(FilterOperator::Eq);
    if !leaf.allows(operator) {
        return Err(EngineError::InvalidFilter(format!(
            "operator '{operator}' is not allowed on field '{}'",
            leaf.id
        )));
    }
    let value = coerce_filter_value(&leaf, operator, &filter.value)?;

    Ok(NormalizedFilter {
        steps,
        operator,
        value,
    })
}

fn unknown_segment(segment: &str, entity: &str) -> EngineError {
    EngineError::InvalidFilter(format!("unknown field '{segment}' on entity '{entity}'"))
}

fn audit_field(segment: &str) -> Option<FieldDefinition> {
    AUDIT_FILTER_FIELDS
        .iter()
        .find(|(id, _)| *id == segment)
        .map(|(id, field_type)| FieldDefinition::new(*id, *field_type))
}

fn coerce_filter_value(
    field: &FieldDefinition,
    operator: FilterOperator,
    raw: &Value,
) -> Result<FieldValue> {
    let invalid = |message: String| {
        EngineError::InvalidFilter(format!("field '{}': {message}", field.id))
    };
    match operator {
        FilterOperator::Exists => match raw {
            Value::Null => Ok(FieldValue::Boolean(true)),
            other => FieldValue::coerce_scalar(FieldType::Boolean, &[], other)
                .map(|value| if value.is_null() { FieldValue::Boolean(true) } else { value })
                .map_err(invalid),
        },
        FilterOperator::Contains | FilterOperator::StartsWith | FilterOperator::EndsWith => {
            match raw {
                Value::String(text) => Ok(FieldValue::String(text.trim().to_string())),
                Value::Number(number) => Ok(FieldValue::String(number.to_string())),
                Value::Bool(flag) => Ok(FieldValue::String(flag.to_string())),
                _ => Err(invalid(format!("operator '{operator}' expects a text value"))),
            }
        }
        FilterOperator::In | FilterOperator::NotIn => {
            let items: Vec<Value> = match raw {
                Value::Array(items) => items.clone(),
                Value::String(text) => text
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| Value::String(item.to_string()))
                    .collect(),
                Value::Null => Vec::new(),
                other => vec![other.clone()],
            };
            let mut values = Vec::with_capacity(items.len());
            for item in &items {
                let value = FieldValue::coerce_scalar(field.field_type, &field.values, item)
                    .map_err(invalid)?;
                values.push(value);
            }
            Ok(FieldValue::List(values))
        }
        _ => FieldValue::coerce_scalar(field.field_type, &field.values, raw).map_err(invalid),
    }
}

fn evaluate(operator: FilterOperator, actual: Option<&FieldValue>, expected: &FieldValue) -> bool {
    let actual = actual.filter(|value| !value.is_null());
    match operator {
        FilterOperator::Eq => match actual {
            Some(value) => value.matches(expected),
            None => expected.is_null(),
        },
        FilterOperator::Neq => !evaluate(FilterOperator::Eq, actual, expected),
        FilterOperator::Lt | FilterOperator::Lte | FilterOperator::Gt | FilterOperator::Gte => {
            let Some(ordering) = actual.and_then(|value| value.compare(expected)) else {
                return false;
            };
            match operator {
                FilterOperator::Lt => ordering.is_lt(),
                FilterOperator::Lte => ordering.is_le(),
                FilterOperator::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }
        }
        FilterOperator::In => {
            let (Some(value), FieldValue::List(candidates)) = (actual, expected) else {
                return false;
            };
            candidates.iter().any(|candidate| value.matches(candidate))
        }
        FilterOperator::NotIn => !evaluate(FilterOperator::In, actual, expected),
        FilterOperator::Contains | FilterOperator::StartsWith | FilterOperator::EndsWith => {
            let Some(value) = actual else {
                return false;
            };
            let needle = expected.key().to_lowercase();
            let test = |text: String| {
                let text = text.to_lowercase();
                match operator {
                    FilterOperator::Contains => text.contains(&needle),
                    FilterOperator::StartsWith => text.starts_with(&needle),
                    _ => text.ends_with(&needle),
                }
            };
            match value {
                FieldValue::List(items) => items.iter().any(|item| test(item.key())),
                other => test(other.key()),
            }
        }
        FilterOperator::Exists => {
            let present = actual.is_some_and(|value| !value.is_empty());
            match expected {
                FieldValue::Boolean(wanted) => present == *wanted,
                _ => present,
            }
        }
    }
}

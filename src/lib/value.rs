use std::{cmp::Ordering, collections::BTreeMap, fmt};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::schema::{FieldDefinition, FieldType};

/// Field id to value, iterated in field-id order.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A record field value, typed according to the field's declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    String(String),
    Number(f64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
    Enum(String),
    Object(Map<String, Value>),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Coerces a raw payload value to the type declared by `field`.
    pub fn coerce(field: &FieldDefinition, raw: &Value) -> Result<Self, String> {
        if raw.is_null() {
            return Ok(FieldValue::Null);
        }
        if field.repeated {
            let items = match raw {
                Value::Array(items) => items.as_slice(),
                other => std::slice::from_ref(other),
            };
            let mut values = Vec::with_capacity(items.len());
            for (idx, item) in items.iter().enumerate() {
                let value = Self::coerce_scalar(field.field_type, &field.values, item)
                    .map_err(|message| format!("item {idx}: {message}"))?;
                if !value.is_null() {
                    values.push(value);
                }
            }
            return Ok(FieldValue::List(values));
        }
        Self::coerce_scalar(field.field_type, &field.values, raw)
    }

    pub fn coerce_scalar(
        field_type: FieldType,
        allowed: &[String],
        raw: &Value,
    ) -> Result<Self, String> {
        if raw.is_null() {
            return Ok(FieldValue::Null);
        }
        if let Value::String(text) = raw {
            if text.trim().is_empty()
                && !matches!(
                    field_type,
                    FieldType::String | FieldType::Unspecified | FieldType::Array
                )
            {
                return Ok(FieldValue::Null);
            }
        }

        match field_type {
            FieldType::String => match raw {
                Value::String(text) => Ok(FieldValue::String(text.trim().to_string())),
                Value::Number(number) => Ok(FieldValue::String(number.to_string())),
                Value::Bool(flag) => Ok(FieldValue::String(flag.to_string())),
                _ => Err("expected a string".into()),
            },
            FieldType::Number => match raw {
                Value::Number(number) => number
                    .as_f64()
                    .map(FieldValue::Number)
                    .ok_or_else(|| "number is out of range".to_string()),
                Value::String(text) => text
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|number| number.is_finite())
                    .map(FieldValue::Number)
                    .ok_or_else(|| format!("'{}' is not a number", text.trim())),
                _ => Err("expected a number".into()),
            },
            FieldType::Boolean => match raw {
                Value::Bool(flag) => Ok(FieldValue::Boolean(*flag)),
                Value::String(text) => parse_bool(text)
                    .map(FieldValue::Boolean)
                    .ok_or_else(|| format!("'{}' is not a boolean", text.trim())),
                Value::Number(number) => match number.as_f64() {
                    Some(n) if n == 1.0 => Ok(FieldValue::Boolean(true)),
                    Some(n) if n == 0.0 => Ok(FieldValue::Boolean(false)),
                    _ => Err("expected a boolean".into()),
                },
                _ => Err("expected a boolean".into()),
            },
            FieldType::Datetime => match raw {
                Value::String(text) => parse_datetime(text)
                    .map(FieldValue::DateTime)
                    .ok_or_else(|| format!("'{}' is not an RFC 3339 timestamp", text.trim())),
                _ => Err("expected an RFC 3339 timestamp string".into()),
            },
            FieldType::Uuid => match raw {
                Value::String(text) => Uuid::parse_str(text.trim())
                    .map(FieldValue::Uuid)
                    .map_err(|_| format!("'{}' is not a uuid", text.trim())),
                _ => Err("expected a uuid string".into()),
            },
            FieldType::Enum => {
                let text = match raw {
                    Value::String(text) => text.trim().to_string(),
                    Value::Number(number) => number.to_string(),
                    _ => return Err("expected an enum value".into()),
                };
                if allowed.is_empty() {
                    return Ok(FieldValue::Enum(text));
                }
                allowed
                    .iter()
                    .find(|candidate| candidate.eq_ignore_ascii_case(&text))
                    .map(|candidate| FieldValue::Enum(candidate.clone()))
                    .ok_or_else(|| format!("'{text}' must be one of {}", allowed.join(", ")))
            }
            FieldType::Object => match raw {
                Value::Object(object) => Ok(FieldValue::Object(object.clone())),
                _ => Err("expected an object".into()),
            },
            FieldType::Array => match raw {
                Value::Array(items) => Ok(FieldValue::List(
                    items.iter().map(FieldValue::from_json).collect(),
                )),
                _ => Err("expected an array".into()),
            },
            FieldType::Unspecified => Ok(FieldValue::from_json(raw)),
        }
    }

    /// Untyped conversion used when no declaration is available.
    pub fn from_json(raw: &Value) -> Self {
        match raw {
            Value::Null => FieldValue::Null,
            Value::Bool(flag) => FieldValue::Boolean(*flag),
            Value::Number(number) => number
                .as_f64()
                .map(FieldValue::Number)
                .unwrap_or(FieldValue::Null),
            Value::String(text) => FieldValue::String(text.clone()),
            Value::Array(items) => {
                FieldValue::List(items.iter().map(FieldValue::from_json).collect())
            }
            Value::Object(object) => FieldValue::Object(object.clone()),
        }
    }

    /// Decodes a stored value, preferring the declared type and falling back
    /// to untyped conversion when the stored shape no longer matches.
    pub fn decode(field: Option<&FieldDefinition>, raw: &Value) -> Self {
        match field {
            Some(field) => Self::coerce(field, raw).unwrap_or_else(|_| Self::from_json(raw)),
            None => Self::from_json(raw),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::String(text) | FieldValue::Enum(text) => Value::String(text.clone()),
            FieldValue::Number(number) => number_to_json(*number),
            FieldValue::Boolean(flag) => Value::Bool(*flag),
            FieldValue::DateTime(at) => Value::String(format_datetime(at)),
            FieldValue::Uuid(id) => Value::String(id.to_string()),
            FieldValue::Object(object) => Value::Object(object.clone()),
            FieldValue::List(items) => {
                Value::Array(items.iter().map(FieldValue::to_json).collect())
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Null, blank text and empty lists carry no value.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::String(text) | FieldValue::Enum(text) => text.trim().is_empty(),
            FieldValue::List(items) => items.is_empty(),
            FieldValue::Object(object) => object.is_empty(),
            _ => false,
        }
    }

    /// Canonical textual form, used for search, set membership and grouping.
    pub fn key(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::String(text) | FieldValue::Enum(text) => text.clone(),
            FieldValue::Number(number) => format_number(*number),
            FieldValue::Boolean(flag) => flag.to_string(),
            FieldValue::DateTime(at) => format_datetime(at),
            FieldValue::Uuid(id) => id.to_string(),
            FieldValue::Object(object) => Value::Object(object.clone()).to_string(),
            FieldValue::List(items) => items
                .iter()
                .map(FieldValue::key)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(text) | FieldValue::Enum(text) => Some(text),
            _ => None,
        }
    }

    /// Typed ordering between two values. Text compares case-insensitively;
    /// values of unrelated types are not comparable.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Number(lhs), FieldValue::Number(rhs)) => lhs.partial_cmp(rhs),
            (FieldValue::Boolean(lhs), FieldValue::Boolean(rhs)) => Some(lhs.cmp(rhs)),
            (FieldValue::DateTime(lhs), FieldValue::DateTime(rhs)) => Some(lhs.cmp(rhs)),
            (FieldValue::Uuid(lhs), FieldValue::Uuid(rhs)) => Some(lhs.cmp(rhs)),
            (FieldValue::Null, FieldValue::Null) => Some(Ordering::Equal),
            (FieldValue::List(lhs), FieldValue::List(rhs)) => Some(
                lhs.iter()
                    .zip(rhs.iter())
                    .map(|(l, r)| l.compare(r).unwrap_or(Ordering::Equal))
                    .find(|ordering| *ordering != Ordering::Equal)
                    .unwrap_or_else(|| lhs.len().cmp(&rhs.len())),
            ),
            (lhs, rhs) => match (lhs.as_str(), rhs.as_str()) {
                (Some(lhs), Some(rhs)) => Some(compare_text(lhs, rhs)),
                _ => None,
            },
        }
    }

    /// Total order for sorting. Same-typed values use `compare`; values of
    /// different types order by type rank.
    pub fn total_cmp(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::Number(lhs), FieldValue::Number(rhs)) => lhs.total_cmp(rhs),
            (FieldValue::Object(_), FieldValue::Object(_)) => self.key().cmp(&other.key()),
            (FieldValue::List(lhs), FieldValue::List(rhs)) => lhs
                .iter()
                .zip(rhs.iter())
                .map(|(l, r)| l.total_cmp(r))
                .find(|ordering| ordering.is_ne())
                .unwrap_or_else(|| lhs.len().cmp(&rhs.len())),
            (lhs, rhs) => lhs
                .compare(rhs)
                .unwrap_or_else(|| lhs.type_rank().cmp(&rhs.type_rank())),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Boolean(_) => 1,
            FieldValue::Number(_) => 2,
            FieldValue::DateTime(_) => 3,
            FieldValue::Uuid(_) => 4,
            FieldValue::String(_) | FieldValue::Enum(_) => 5,
            FieldValue::Object(_) => 6,
            FieldValue::List(_) => 7,
        }
    }

    /// Equality used by filters: typed when both sides share a type, by
    /// canonical key otherwise. A list matches when any element matches.
    pub fn matches(&self, expected: &FieldValue) -> bool {
        match (self, expected) {
            (FieldValue::List(_), FieldValue::List(_)) => self.key() == expected.key(),
            (FieldValue::List(items), scalar) => items.iter().any(|item| item.matches(scalar)),
            (FieldValue::Number(lhs), FieldValue::Number(rhs)) => (lhs - rhs).abs() < f64::EPSILON,
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Null, _) | (_, FieldValue::Null) => false,
            (lhs, rhs) => lhs.key() == rhs.key(),
        }
    }
}

pub(crate) fn compare_text(lhs: &str, rhs: &str) -> Ordering {
    lhs.to_lowercase().cmp(&rhs.to_lowercase())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub(crate) fn format_datetime(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn is_integral(number: f64) -> bool {
    number.fract() == 0.0 && number.abs() < 9.0e15
}

fn format_number(number: f64) -> String {
    if is_integral(number) {
        format!("{}", number as i64)
    } else {
        number.to_string()
    }
}

fn number_to_json(number: f64) -> Value {
    if is_integral(number) {
        Value::Number(Number::from(number as i64))
    } else {
        Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(FieldValue::from_json(&raw))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(field_type: FieldType) -> FieldDefinition {
        FieldDefinition::new("f", field_type)
    }

    #[test]
    fn coerces_numbers_from_strings() {
        let value = FieldValue::coerce(&field(FieldType::Number), &json!(" 42.5 ")).unwrap();
        assert_eq!(value, FieldValue::Number(42.5));
        assert!(FieldValue::coerce(&field(FieldType::Number), &json!("abc")).is_err());
        assert!(FieldValue::coerce(&field(FieldType::Number), &json!(true)).is_err());
    }

    #[test]
    fn trims_strings() {
        let value = FieldValue::coerce(&field(FieldType::String), &json!("  hello ")).unwrap();
        assert_eq!(value, FieldValue::String("hello".into()));
    }

    #[test]
    fn booleans_accept_canonical_strings() {
        let boolean = field(FieldType::Boolean);
        assert_eq!(
            FieldValue::coerce(&boolean, &json!("TRUE")).unwrap(),
            FieldValue::Boolean(true)
        );
        assert_eq!(
            FieldValue::coerce(&boolean, &json!("0")).unwrap(),
            FieldValue::Boolean(false)
        );
        assert!(FieldValue::coerce(&boolean, &json!("maybe")).is_err());
    }

    #[test]
    fn datetimes_normalize_to_utc() {
        let value =
            FieldValue::coerce(&field(FieldType::Datetime), &json!("2024-03-01T10:00:00+02:00"))
                .unwrap();
        assert_eq!(value.key(), "2024-03-01T08:00:00Z");

        let date = FieldValue::coerce(&field(FieldType::Datetime), &json!("2024-03-01")).unwrap();
        assert_eq!(date.key(), "2024-03-01T00:00:00Z");
    }

    #[test]
    fn enums_use_canonical_values() {
        let status = field(FieldType::Enum).with_values(&["Open", "Closed"]);
        assert_eq!(
            FieldValue::coerce(&status, &json!("open")).unwrap(),
            FieldValue::Enum("Open".into())
        );
        let err = FieldValue::coerce(&status, &json!("pending")).unwrap_err();
        assert!(err.contains("Open, Closed"));
    }

    #[test]
    fn repeated_fields_coerce_each_item() {
        let tags = field(FieldType::Number).repeated();
        let value = FieldValue::coerce(&tags, &json!(["1", 2])).unwrap();
        assert_eq!(
            value,
            FieldValue::List(vec![FieldValue::Number(1.0), FieldValue::Number(2.0)])
        );
        let err = FieldValue::coerce(&tags, &json!([1, "x"])).unwrap_err();
        assert!(err.starts_with("item 1"));
    }

    #[test]
    fn json_keeps_integers_integral() {
        assert_eq!(FieldValue::Number(3.0).to_json(), json!(3));
        assert_eq!(FieldValue::Number(3.25).to_json(), json!(3.25));
    }

    #[test]
    fn text_comparison_ignores_case() {
        let lhs = FieldValue::String("apple".into());
        let rhs = FieldValue::String("Banana".into());
        assert_eq!(lhs.compare(&rhs), Some(Ordering::Less));
        assert_eq!(FieldValue::Number(1.0).compare(&lhs), None);
    }

    #[test]
    fn mixed_types_order_by_rank() {
        let number = FieldValue::Number(5.0);
        let text = FieldValue::String("5".into());
        let flag = FieldValue::Boolean(true);
        assert_eq!(number.total_cmp(&text), Ordering::Less);
        assert_eq!(text.total_cmp(&number), Ordering::Greater);
        assert_eq!(flag.total_cmp(&number), Ordering::Less);
        assert_eq!(
            FieldValue::String("a".into()).total_cmp(&FieldValue::Enum("B".into())),
            Ordering::Less
        );
        let mixed = FieldValue::List(vec![FieldValue::Number(1.0), "x".into()]);
        let texts = FieldValue::List(vec!["x".into()]);
        assert_eq!(mixed.total_cmp(&texts), Ordering::Less);
    }

    #[test]
    fn list_matches_any_element() {
        let list = FieldValue::List(vec!["a".into(), "b".into()]);
        assert!(list.matches(&"b".into()));
        assert!(!list.matches(&"c".into()));
    }

    #[test]
    fn blank_strings_are_null_for_typed_fields() {
        assert_eq!(
            FieldValue::coerce(&field(FieldType::Uuid), &json!("  ")).unwrap(),
            FieldValue::Null
        );
    }
}

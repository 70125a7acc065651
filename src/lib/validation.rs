use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::{
    error::{EngineError, Result, ValidationErrors},
    schema::Definition,
    value::{FieldMap, FieldValue},
};

pub const MAX_RECORD_ID_LENGTH: usize = 128;

/// Fields maintained by the engine; payloads may echo them back but they are
/// never written from input.
pub const AUDIT_FIELDS: [&str; 6] = [
    "createdAt",
    "updatedAt",
    "createdBy",
    "updatedBy",
    "version",
    "deleted",
];

static ENTITY_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid entity id regex"));
static RECORD_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9_.@-]{0,127})?$").expect("valid record id regex")
});

pub fn ensure_entity_id(value: &str) -> Result<()> {
    if ENTITY_ID_RE.is_match(value) {
        Ok(())
    } else {
        Err(EngineError::InvalidSchema(format!(
            "entity id '{value}' must be lowercase snake_case"
        )))
    }
}

pub fn ensure_record_id(value: &str) -> Result<()> {
    if value.trim() != value {
        return Err(EngineError::InvalidPayload(
            "record id cannot include leading or trailing whitespace".into(),
        ));
    }
    if value.is_empty() {
        return Err(EngineError::InvalidPayload(
            "record id must not be empty".into(),
        ));
    }
    if value.len() > MAX_RECORD_ID_LENGTH {
        return Err(EngineError::InvalidPayload(format!(
            "record id cannot exceed {MAX_RECORD_ID_LENGTH} characters"
        )));
    }
    if !RECORD_ID_RE.is_match(value) {
        return Err(EngineError::InvalidPayload(format!(
            "record id '{value}' may only contain letters, numbers, '_', '-', '.' or '@'"
        )));
    }
    Ok(())
}

/// Maps a caller-supplied id onto the form the primary key is stored under,
/// e.g. lowercase hyphenated uuids. Ids that do not coerce pass unchanged.
pub fn canonical_record_id(definition: &Definition, id: &str) -> String {
    definition
        .primary_key_field()
        .and_then(|field| {
            let raw = Value::String(id.to_string());
            FieldValue::coerce_scalar(field.field_type, &field.values, &raw).ok()
        })
        .filter(|value| !value.is_null())
        .map(|value| value.key())
        .unwrap_or_else(|| id.to_string())
}

pub fn is_audit_field(field: &str) -> bool {
    AUDIT_FIELDS.contains(&field)
}

fn payload_object(payload: &Value) -> Result<&Map<String, Value>> {
    payload
        .as_object()
        .ok_or_else(|| EngineError::InvalidPayload("payload must be a JSON object".into()))
}

/// Sanitises a create payload: every declared field is coerced, unknown
/// fields and missing required fields are reported together. The primary key
/// may be absent; the caller generates one.
pub fn sanitize_create(definition: &Definition, payload: &Value) -> Result<FieldMap> {
    let object = payload_object(payload)?;
    let mut errors = ValidationErrors::new();
    let mut data = FieldMap::new();

    for (key, raw) in object {
        if is_audit_field(key) {
            continue;
        }
        let Some(field) = definition.field(key) else {
            errors.push(key.clone(), "is not declared on this entity");
            continue;
        };
        match FieldValue::coerce(field, raw) {
            Ok(value) if value.is_null() => {}
            Ok(value) => {
                data.insert(field.id.clone(), value);
            }
            Err(message) => errors.push(key.clone(), message),
        }
    }

    if let Some(value) = data.get(&definition.primary_key) {
        if let Err(err) = ensure_record_id(&value.key()) {
            errors.push(definition.primary_key.clone(), err.to_string());
        }
    }

    for field in &definition.fields {
        if field.required
            && field.id != definition.primary_key
            && !errors.contains_field(&field.id)
            && data.get(&field.id).is_none_or(FieldValue::is_empty)
        {
            errors.push(field.id.clone(), "is required");
        }
    }

    errors.into_result()?;
    Ok(data)
}

/// Sanitises an update patch. The primary key and audit fields are stripped;
/// a `Null` value in the result removes that field from the record.
pub fn sanitize_update(definition: &Definition, payload: &Value) -> Result<FieldMap> {
    let object = payload_object(payload)?;
    let mut errors = ValidationErrors::new();
    let mut patch = FieldMap::new();

    for (key, raw) in object {
        if is_audit_field(key) || *key == definition.primary_key {
            continue;
        }
        let Some(field) = definition.field(key) else {
            errors.push(key.clone(), "is not declared on this entity");
            continue;
        };
        match FieldValue::coerce(field, raw) {
            Ok(value) if field.required && value.is_empty() => {
                errors.push(key.clone(), "is required and cannot be cleared");
            }
            Ok(value) => {
                patch.insert(field.id.clone(), value);
            }
            Err(message) => errors.push(key.clone(), message),
        }
    }

    errors.into_result()?;
    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDefinition, FieldType};
    use serde_json::json;

    fn user() -> Definition {
        Definition::new(
            "user",
            "id",
            vec![
                FieldDefinition::new("id", FieldType::Uuid).required(),
                FieldDefinition::new("email", FieldType::String).required(),
                FieldDefinition::new("age", FieldType::Number),
                FieldDefinition::new("active", FieldType::Boolean),
            ],
        )
    }

    #[test]
    fn entity_ids_are_snake_case() {
        ensure_entity_id("purchase_order").expect("valid entity id");
        let err = ensure_entity_id("PurchaseOrder").unwrap_err();
        assert!(matches!(err, EngineError::InvalidSchema(_)));
    }

    #[test]
    fn record_ids_reject_separators_and_whitespace() {
        ensure_record_id("order-1.a@b").expect("valid record id");
        for bad in [" bad", "", "a/b", "_index", &"x".repeat(129)] {
            let err = ensure_record_id(bad).unwrap_err();
            assert!(matches!(err, EngineError::InvalidPayload(_)), "{bad}");
        }
    }

    #[test]
    fn uuid_ids_are_canonicalised() {
        let id = "6F9619FF-8B86-D011-B42D-00C04FC964FF";
        assert_eq!(
            canonical_record_id(&user(), id),
            "6f9619ff-8b86-d011-b42d-00c04fc964ff"
        );
        assert_eq!(canonical_record_id(&user(), "not-a-uuid"), "not-a-uuid");
        let tag = Definition::new("tag", "id", vec![FieldDefinition::new("id", FieldType::String)]);
        assert_eq!(canonical_record_id(&tag, "MiXeD"), "MiXeD");
    }

    #[test]
    fn create_aggregates_every_field_error() {
        let err = sanitize_create(&user(), &json!({"age": "old", "nickname": "x"})).unwrap_err();
        let EngineError::Validation(errors) = err else {
            panic!("expected validation error");
        };
        assert_eq!(errors.len(), 3);
        assert!(errors.contains_field("age"));
        assert!(errors.contains_field("nickname"));
        assert!(errors.contains_field("email"));
    }

    #[test]
    fn create_coerces_and_skips_audit_fields() {
        let data = sanitize_create(
            &user(),
            &json!({"email": " a@x.com ", "age": "30", "version": 9, "active": null}),
        )
        .expect("valid payload");
        assert_eq!(data.get("email"), Some(&FieldValue::String("a@x.com".into())));
        assert_eq!(data.get("age"), Some(&FieldValue::Number(30.0)));
        assert!(!data.contains_key("version"));
        assert!(!data.contains_key("active"));
    }

    #[test]
    fn create_rejects_invalid_primary_key() {
        let err = sanitize_create(&user(), &json!({"id": "nope", "email": "a@x.com"})).unwrap_err();
        assert!(matches!(err, EngineError::Validation(errors) if errors.contains_field("id")));
    }

    #[test]
    fn update_keeps_nulls_and_strips_primary_key() {
        let patch = sanitize_update(&user(), &json!({"id": "x", "age": null, "active": "yes"}))
            .expect("valid patch");
        assert_eq!(patch.get("age"), Some(&FieldValue::Null));
        assert_eq!(patch.get("active"), Some(&FieldValue::Boolean(true)));
        assert!(!patch.contains_key("id"));
    }

    #[test]
    fn update_cannot_clear_required_fields() {
        let err = sanitize_update(&user(), &json!({"email": null})).unwrap_err();
        assert!(matches!(err, EngineError::Validation(errors) if errors.contains_field("email")));
    }

    #[test]
    fn non_object_payload_is_invalid() {
        let err = sanitize_update(&user(), &json!([1, 2])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPayload(_)));
    }
}

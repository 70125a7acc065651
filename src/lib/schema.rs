use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    error::{EngineError, Result},
    validation::ensure_entity_id,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Datetime,
    Uuid,
    Enum,
    Object,
    Array,
    #[default]
    Unspecified,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Datetime => "datetime",
            FieldType::Uuid => "uuid",
            FieldType::Enum => "enum",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Unspecified => "unspecified",
        }
    }

    /// Types whose values take part in free-text search.
    pub fn is_searchable(self) -> bool {
        matches!(
            self,
            FieldType::String | FieldType::Uuid | FieldType::Enum | FieldType::Datetime
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[serde(alias = "=", alias = "==", alias = "equals")]
    Eq,
    #[serde(alias = "!=", alias = "<>", alias = "not_equals")]
    Neq,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    Exists,
}

impl FilterOperator {
    pub const ALL: [FilterOperator; 12] = [
        FilterOperator::Eq,
        FilterOperator::Neq,
        FilterOperator::Lt,
        FilterOperator::Lte,
        FilterOperator::Gt,
        FilterOperator::Gte,
        FilterOperator::In,
        FilterOperator::NotIn,
        FilterOperator::Contains,
        FilterOperator::StartsWith,
        FilterOperator::EndsWith,
        FilterOperator::Exists,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not_in",
            FilterOperator::Contains => "contains",
            FilterOperator::StartsWith => "starts_with",
            FilterOperator::EndsWith => "ends_with",
            FilterOperator::Exists => "exists",
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOperator {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        let operator = match normalized.as_str() {
            "" | "eq" | "=" | "==" | "equals" => FilterOperator::Eq,
            "neq" | "ne" | "!=" | "<>" | "not_equals" => FilterOperator::Neq,
            "lt" | "<" => FilterOperator::Lt,
            "lte" | "le" | "<=" => FilterOperator::Lte,
            "gt" | ">" => FilterOperator::Gt,
            "gte" | "ge" | ">=" => FilterOperator::Gte,
            "in" => FilterOperator::In,
            "not_in" | "nin" => FilterOperator::NotIn,
            "contains" | "like" => FilterOperator::Contains,
            "starts_with" | "startswith" => FilterOperator::StartsWith,
            "ends_with" | "endswith" => FilterOperator::EndsWith,
            "exists" => FilterOperator::Exists,
            _ => {
                return Err(EngineError::InvalidFilter(format!(
                    "unsupported filter operator '{value}'"
                )));
            }
        };
        Ok(operator)
    }
}

/// Weak, lookup-only link from a field to a record in another entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceDefinition {
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ReferenceDefinition {
    /// Extra path segment names declared under `metadata.alias`.
    pub fn aliases(&self) -> Vec<&str> {
        match self.metadata.get("alias") {
            Some(Value::String(alias)) => vec![alias.as_str()],
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub repeated: bool,
    #[serde(default)]
    pub sortable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_operators: Vec<FilterOperator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl FieldDefinition {
    pub fn new(id: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            display_name: String::new(),
            field_type,
            required: false,
            repeated: false,
            sortable: false,
            filter_operators: Vec::new(),
            reference: None,
            values: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }

    pub fn sortable(mut self) -> Self {
        self.sortable = true;
        self
    }

    pub fn with_operators(mut self, operators: &[FilterOperator]) -> Self {
        self.filter_operators = operators.to_vec();
        self
    }

    pub fn with_values(mut self, values: &[&str]) -> Self {
        self.values = values.iter().map(|value| value.to_string()).collect();
        self
    }

    pub fn references(mut self, entity: impl Into<String>) -> Self {
        self.reference = Some(ReferenceDefinition {
            entity: entity.into(),
            field: None,
            label: None,
            metadata: BTreeMap::new(),
        });
        self
    }

    /// An empty operator list allows every operator.
    pub fn allows(&self, operator: FilterOperator) -> bool {
        self.filter_operators.is_empty() || self.filter_operators.contains(&operator)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub primary_key: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Definition {
    pub fn new(
        id: impl Into<String>,
        primary_key: impl Into<String>,
        fields: Vec<FieldDefinition>,
    ) -> Self {
        let mut definition = Self {
            id: id.into(),
            display_name: String::new(),
            description: String::new(),
            primary_key: primary_key.into(),
            fields,
            metadata: BTreeMap::new(),
        };
        definition.ensure_sorted();
        definition
    }

    pub fn field(&self, id: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|field| field.id == id)
    }

    pub fn primary_key_field(&self) -> Option<&FieldDefinition> {
        self.field(&self.primary_key)
    }

    pub fn is_declared(&self, id: &str) -> bool {
        self.field(id).is_some()
    }

    fn ensure_sorted(&mut self) {
        self.fields.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));
    }

    fn normalize(&mut self) -> Result<()> {
        self.id = self.id.trim().to_ascii_lowercase();
        self.primary_key = self.primary_key.trim().to_string();
        if self.id.is_empty() {
            return Err(EngineError::InvalidSchema(
                "entity id must be provided".into(),
            ));
        }
        ensure_entity_id(&self.id)?;
        if self.primary_key.is_empty() {
            return Err(EngineError::InvalidSchema(format!(
                "entity {} must declare a primary key",
                self.id
            )));
        }
        if self.display_name.trim().is_empty() {
            self.display_name = self.id.clone();
        }

        let mut seen = BTreeSet::new();
        for field in &mut self.fields {
            field.id = field.id.trim().to_string();
            if field.id.is_empty() {
                return Err(EngineError::InvalidSchema(format!(
                    "entity {} declares a field without an id",
                    self.id
                )));
            }
            if !seen.insert(field.id.clone()) {
                return Err(EngineError::InvalidSchema(format!(
                    "entity {} declares field {} more than once",
                    self.id, field.id
                )));
            }
            if field.display_name.trim().is_empty() {
                field.display_name = field.id.clone();
            }
            if let Some(reference) = field.reference.as_mut() {
                reference.entity = reference.entity.trim().to_ascii_lowercase();
                if reference.entity.is_empty() {
                    return Err(EngineError::InvalidSchema(format!(
                        "field {}.{} references an empty entity",
                        self.id, field.id
                    )));
                }
            }
            if field.field_type == FieldType::Enum
                && field.values.iter().any(|v| v.trim().is_empty())
            {
                return Err(EngineError::InvalidSchema(format!(
                    "enum field {}.{} declares an empty value",
                    self.id, field.id
                )));
            }
        }
        self.ensure_sorted();

        if !self.is_declared(&self.primary_key) {
            return Err(EngineError::InvalidSchema(format!(
                "primary key {} is not a declared field of entity {}",
                self.primary_key, self.id
            )));
        }
        Ok(())
    }
}

/// Read-only set of entity definitions loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    items: BTreeMap<String, Arc<Definition>>,
}

impl SchemaRegistry {
    pub fn from_definitions(definitions: Vec<Definition>) -> Result<Self> {
        let mut items = BTreeMap::new();
        for mut definition in definitions {
            definition.normalize()?;
            if items.contains_key(&definition.id) {
                return Err(EngineError::InvalidSchema(format!(
                    "entity {} is defined more than once",
                    definition.id
                )));
            }
            items.insert(definition.id.clone(), Arc::new(definition));
        }

        let registry = Self { items };
        registry.validate_references()?;
        Ok(registry)
    }

    /// Loads one definition per `.json` or `.toml` file in `dir`.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|err| {
                EngineError::Config(format!(
                    "unable to read schema directory {}: {err}",
                    dir.display()
                ))
            })?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && definition_format(path).is_some())
            .collect();
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in &paths {
            definitions.push(load_definition_file(path)?);
            debug!(path = %path.display(), "loaded entity definition");
        }

        let registry = Self::from_definitions(definitions)?;
        info!(
            dir = %dir.display(),
            entities = registry.items.len(),
            "schema registry loaded"
        );
        Ok(registry)
    }

    pub fn list(&self) -> Vec<Arc<Definition>> {
        self.items.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<Arc<Definition>> {
        self.items
            .get(id)
            .or_else(|| self.items.get(&id.trim().to_ascii_lowercase()))
            .cloned()
            .ok_or_else(|| EngineError::UnknownEntity(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn validate_references(&self) -> Result<()> {
        for definition in self.items.values() {
            for field in &definition.fields {
                let Some(reference) = field.reference.as_ref() else {
                    continue;
                };
                let target = self.items.get(&reference.entity).ok_or_else(|| {
                    EngineError::InvalidSchema(format!(
                        "field {}.{} references unknown entity {}",
                        definition.id, field.id, reference.entity
                    ))
                })?;
                if let Some(target_field) = reference.field.as_deref() {
                    if !target.is_declared(target_field) {
                        return Err(EngineError::InvalidSchema(format!(
                            "field {}.{} references unknown field {}.{}",
                            definition.id, field.id, target.id, target_field
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum DefinitionFormat {
    Json,
    Toml,
}

fn definition_format(path: &Path) -> Option<DefinitionFormat> {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => Some(DefinitionFormat::Json),
        Some("toml") => Some(DefinitionFormat::Toml),
        _ => None,
    }
}

fn load_definition_file(path: &Path) -> Result<Definition> {
    let contents = fs::read_to_string(path)?;
    let parsed = match definition_format(path) {
        Some(DefinitionFormat::Json) => {
            serde_json::from_str::<Definition>(&contents).map_err(|err| err.to_string())
        }
        Some(DefinitionFormat::Toml) => {
            toml::from_str::<Definition>(&contents).map_err(|err| err.to_string())
        }
        None => Err("unsupported definition format".to_string()),
    };
    parsed.map_err(|message| {
        EngineError::InvalidSchema(format!("{}: {message}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Definition {
        Definition::new(
            "User",
            "id",
            vec![
                FieldDefinition::new("id", FieldType::Uuid),
                FieldDefinition::new("email", FieldType::String).required(),
                FieldDefinition::new("active", FieldType::Boolean),
            ],
        )
    }

    #[test]
    fn normalizes_ids_and_sorts_fields() {
        let registry = SchemaRegistry::from_definitions(vec![user()]).unwrap();
        let definition = registry.get("user").unwrap();
        assert_eq!(definition.id, "user");
        let ids: Vec<&str> = definition.fields.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["active", "email", "id"]);
        assert_eq!(definition.primary_key_field().unwrap().field_type, FieldType::Uuid);
    }

    #[test]
    fn unknown_entity_is_reported() {
        let registry = SchemaRegistry::from_definitions(vec![user()]).unwrap();
        let err = registry.get("order").unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntity(id) if id == "order"));
    }

    #[test]
    fn rejects_undeclared_primary_key() {
        let definition = Definition::new(
            "order",
            "code",
            vec![FieldDefinition::new("total", FieldType::Number)],
        );
        let err = SchemaRegistry::from_definitions(vec![definition]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSchema(_)));
    }

    #[test]
    fn rejects_dangling_references() {
        let order = Definition::new(
            "order",
            "id",
            vec![
                FieldDefinition::new("id", FieldType::String),
                FieldDefinition::new("customerId", FieldType::String).references("customer"),
            ],
        );
        let err = SchemaRegistry::from_definitions(vec![order]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSchema(message) if message.contains("customer")));
    }

    #[test]
    fn operator_restrictions() {
        let open = FieldDefinition::new("name", FieldType::String);
        assert!(open.allows(FilterOperator::Contains));

        let restricted = FieldDefinition::new("name", FieldType::String)
            .with_operators(&[FilterOperator::Eq, FilterOperator::In]);
        assert!(restricted.allows(FilterOperator::In));
        assert!(!restricted.allows(FilterOperator::Gt));
    }

    #[test]
    fn parses_operator_aliases() {
        assert_eq!("=".parse::<FilterOperator>().unwrap(), FilterOperator::Eq);
        assert_eq!(">=".parse::<FilterOperator>().unwrap(), FilterOperator::Gte);
        assert_eq!("not-in".parse::<FilterOperator>().unwrap(), FilterOperator::NotIn);
        assert!(matches!(
            "between".parse::<FilterOperator>(),
            Err(EngineError::InvalidFilter(_))
        ));
        for operator in FilterOperator::ALL {
            assert_eq!(operator.as_str().parse::<FilterOperator>().unwrap(), operator);
        }
    }

    #[test]
    fn loads_json_and_toml_definitions_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("company.json"),
            r#"{
                "id": "company",
                "displayName": "Company",
                "primaryKey": "id",
                "fields": [
                    {"id": "id", "type": "uuid"},
                    {"id": "name", "type": "string", "required": true, "sortable": true}
                ]
            }"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("person.toml"),
            r#"
id = "person"
primaryKey = "id"

[[fields]]
id = "id"
type = "uuid"

[[fields]]
id = "companyId"
type = "uuid"
filterOperators = ["eq", "in"]

[fields.reference]
entity = "company"
label = "Employer"
metadata = { alias = "employer" }
"#,
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), "ignored").unwrap();

        let registry = SchemaRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 2);

        let person = registry.get("person").unwrap();
        let reference = person.field("companyId").unwrap().reference.clone().unwrap();
        assert_eq!(reference.entity, "company");
        assert_eq!(reference.aliases(), vec!["employer"]);
    }

    #[test]
    fn rejects_unknown_field_type() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("thing.json"),
            r#"{"id": "thing", "primaryKey": "id", "fields": [{"id": "id", "type": "blob"}]}"#,
        )
        .unwrap();
        let err = SchemaRegistry::load_dir(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidSchema(message) if message.contains("thing.json")
        ));
    }
}

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::{
    error::{EngineError, Result},
    filter::{FilterStep, NormalizedFilter},
    record::Record,
    schema::{FilterOperator, SchemaRegistry},
    value::FieldValue,
};

/// Outcome of resolving the nested filters of one query.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Every remaining filter addresses a field of the root entity.
    Filters(Vec<NormalizedFilter>),
    /// Some nested condition cannot match; the query result is empty.
    Empty,
}

/// Rewrites nested filters into `IN` filters on the root entity.
///
/// Each nested path is evaluated from its deepest entity upwards: `fetcher`
/// lists the records of an entity matching single-step filters, the values of
/// the traversed reference's target field are collected and become an `IN`
/// condition one level up. Sets produced for the same root field are
/// intersected, and an empty set stops resolution without further fetches.
pub fn resolve_nested<F>(
    registry: &SchemaRegistry,
    filters: Vec<NormalizedFilter>,
    mut fetcher: F,
) -> Result<Resolution>
where
    F: FnMut(&str, Vec<NormalizedFilter>) -> Result<Vec<Record>>,
{
    let (nested, mut flat): (Vec<_>, Vec<_>) =
        filters.into_iter().partition(NormalizedFilter::is_nested);
    if nested.is_empty() {
        return Ok(Resolution::Filters(flat));
    }

    let mut root_sets: BTreeMap<String, (FilterStep, BTreeMap<String, FieldValue>)> =
        BTreeMap::new();

    for filter in nested {
        let values = resolve_path(registry, &filter, &mut fetcher)?;
        let root = filter.root().clone();
        let merged = match root_sets.remove(&root.field) {
            Some((step, existing)) => {
                let keys: BTreeSet<String> = values.keys().cloned().collect();
                let intersected: BTreeMap<String, FieldValue> = existing
                    .into_iter()
                    .filter(|(key, _)| keys.contains(key))
                    .collect();
                (step, intersected)
            }
            None => (root, values),
        };
        if merged.1.is_empty() {
            debug!(field = %merged.0.field, "nested filter resolved to an empty set");
            return Ok(Resolution::Empty);
        }
        root_sets.insert(merged.0.field.clone(), merged);
    }

    for (_, (step, values)) in root_sets {
        flat.push(NormalizedFilter::on_field(
            FilterStep {
                reference: None,
                ..step
            },
            FilterOperator::In,
            FieldValue::List(values.into_values().collect()),
        ));
    }
    Ok(Resolution::Filters(flat))
}

/// Values the root reference field must take for `filter` to hold, keyed by
/// their canonical form.
fn resolve_path<F>(
    registry: &SchemaRegistry,
    filter: &NormalizedFilter,
    fetcher: &mut F,
) -> Result<BTreeMap<String, FieldValue>>
where
    F: FnMut(&str, Vec<NormalizedFilter>) -> Result<Vec<Record>>,
{
    let leaf = filter.leaf().clone();
    let mut condition = NormalizedFilter::on_field(
        FilterStep {
            reference: None,
            ..leaf
        },
        filter.operator,
        filter.value.clone(),
    );

    let mut values = BTreeMap::new();
    for idx in (0..filter.steps.len() - 1).rev() {
        let step = &filter.steps[idx];
        let reference = step.reference.as_ref().ok_or_else(|| {
            EngineError::InvalidFilter(format!(
                "field '{}' on entity '{}' is not a reference",
                step.field, step.entity
            ))
        })?;
        let target = registry.get(&reference.entity)?;
        let target_field = reference
            .field
            .clone()
            .unwrap_or_else(|| target.primary_key.clone());

        let records = fetcher(&target.id, vec![condition])?;
        values = BTreeMap::new();
        for record in &records {
            let value = record.lookup(&target_field).or_else(|| {
                (target_field == target.primary_key).then(|| FieldValue::String(record.id.clone()))
            });
            match value {
                Some(FieldValue::List(items)) => {
                    for item in items {
                        values.insert(item.key(), item);
                    }
                }
                Some(value) if !value.is_null() => {
                    values.insert(value.key(), value);
                }
                _ => {}
            }
        }
        debug!(
            entity = %target.id,
            field = %target_field,
            matches = values.len(),
            "resolved nested filter step"
        );
        if values.is_empty() {
            break;
        }

        condition = NormalizedFilter::on_field(
            FilterStep {
                entity: step.entity.clone(),
                field: step.field.clone(),
                field_type: step.field_type,
                reference: None,
            },
            FilterOperator::In,
            FieldValue::List(values.values().cloned().collect()),
        );
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::{Filter, normalize},
        schema::{Definition, FieldDefinition, FieldType},
    };
    use serde_json::json;
    use std::cell::RefCell;

    fn registry() -> SchemaRegistry {
        let country = Definition::new(
            "country",
            "code",
            vec![
                FieldDefinition::new("code", FieldType::String),
                FieldDefinition::new("region", FieldType::String),
            ],
        );
        let company = Definition::new(
            "company",
            "id",
            vec![
                FieldDefinition::new("id", FieldType::String),
                FieldDefinition::new("name", FieldType::String),
                FieldDefinition::new("countryCode", FieldType::String).references("country"),
            ],
        );
        let person = Definition::new(
            "person",
            "id",
            vec![
                FieldDefinition::new("id", FieldType::String),
                FieldDefinition::new("companyId", FieldType::String).references("company"),
            ],
        );
        SchemaRegistry::from_definitions(vec![country, company, person]).unwrap()
    }

    fn company(id: &str, name: &str, country: &str) -> Record {
        Record::new("company", id)
            .with_field("id", id)
            .with_field("name", name)
            .with_field("countryCode", country)
    }

    fn data() -> Vec<Record> {
        vec![
            Record::new("country", "NL").with_field("code", "NL").with_field("region", "EU"),
            Record::new("country", "US").with_field("code", "US").with_field("region", "NA"),
            company("c1", "Acme", "NL"),
            company("c2", "Globex", "US"),
            company("c3", "Acme", "US"),
        ]
    }

    fn fetch_from<'a>(
        registry: &'a SchemaRegistry,
        calls: &'a RefCell<Vec<String>>,
    ) -> impl FnMut(&str, Vec<NormalizedFilter>) -> Result<Vec<Record>> + 'a {
        move |entity, filters| {
            calls.borrow_mut().push(entity.to_string());
            let definition = registry.get(entity)?;
            Ok(data()
                .into_iter()
                .filter(|record| record.entity == entity)
                .filter(|record| filters.iter().all(|f| f.matches(&definition, record)))
                .collect())
        }
    }

    fn person_filter(registry: &SchemaRegistry, filter: Filter) -> NormalizedFilter {
        let person = registry.get("person").unwrap();
        normalize(registry, &person, &filter).unwrap()
    }

    fn in_values(resolution: Resolution) -> Vec<String> {
        let Resolution::Filters(filters) = resolution else {
            panic!("expected filters");
        };
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].operator, FilterOperator::In);
        let FieldValue::List(items) = &filters[0].value else {
            panic!("expected list");
        };
        items.iter().map(FieldValue::key).collect()
    }

    #[test]
    fn single_hop_becomes_in_filter_on_root() {
        let registry = registry();
        let calls = RefCell::new(Vec::new());
        let filter = person_filter(&registry, Filter::eq("company.name", json!("Acme")));
        let resolution =
            resolve_nested(&registry, vec![filter], fetch_from(&registry, &calls)).unwrap();
        assert_eq!(in_values(resolution), vec!["c1", "c3"]);
        assert_eq!(calls.borrow().as_slice(), ["company"]);
    }

    #[test]
    fn two_hops_are_resolved_deepest_first() {
        let registry = registry();
        let calls = RefCell::new(Vec::new());
        let filter =
            person_filter(&registry, Filter::eq("company.countryCode.region", json!("NA")));
        let resolution =
            resolve_nested(&registry, vec![filter], fetch_from(&registry, &calls)).unwrap();
        assert_eq!(in_values(resolution), vec!["c2", "c3"]);
        assert_eq!(calls.borrow().as_slice(), ["country", "company"]);
    }

    #[test]
    fn same_root_field_sets_are_intersected() {
        let registry = registry();
        let calls = RefCell::new(Vec::new());
        let filters = vec![
            person_filter(&registry, Filter::eq("company.name", json!("Acme"))),
            person_filter(&registry, Filter::eq("company.countryCode", json!("US"))),
        ];
        let resolution = resolve_nested(&registry, filters, fetch_from(&registry, &calls)).unwrap();
        assert_eq!(in_values(resolution), vec!["c3"]);
    }

    #[test]
    fn empty_match_short_circuits() {
        let registry = registry();
        let calls = RefCell::new(Vec::new());
        let filters = vec![
            person_filter(&registry, Filter::eq("company.name", json!("Initech"))),
            person_filter(&registry, Filter::eq("company.countryCode", json!("US"))),
        ];
        let resolution = resolve_nested(&registry, filters, fetch_from(&registry, &calls)).unwrap();
        assert_eq!(resolution, Resolution::Empty);
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn flat_filters_pass_through_untouched() {
        let registry = registry();
        let calls = RefCell::new(Vec::new());
        let filter = person_filter(&registry, Filter::eq("id", json!("p1")));
        let resolution =
            resolve_nested(&registry, vec![filter.clone()], fetch_from(&registry, &calls)).unwrap();
        assert_eq!(resolution, Resolution::Filters(vec![filter]));
        assert!(calls.borrow().is_empty());
    }
}

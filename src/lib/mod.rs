//! Metadata-driven entity engine backed by an append-only event log.
//!
//! Entities are declared as JSON [`schema::Definition`]s. Records are folded
//! from per-record event streams, listed through a filter, sort and paging
//! pipeline, and can be summarised with pivots or replayed as history.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod history;
pub mod index;
pub mod logging;
pub mod pivot;
pub mod provider;
pub mod query;
pub mod record;
pub mod reference;
pub mod schema;
pub mod service;
pub mod store;
pub mod validation;
pub mod value;

pub use config::{EngineConfig, StoreConfig};
pub use context::{Actor, Context};
pub use error::{EngineError, ErrorClass, FieldError, Result, ValidationErrors};
pub use filter::Filter;
pub use history::{HistoryEntry, HistoryOptions};
pub use pivot::{PivotEntry, PivotOptions, PivotResult};
pub use provider::Provider;
pub use query::{ListOptions, ListQuery, Page, PageSettings, SortDirection};
pub use record::Record;
pub use schema::{
    Definition, FieldDefinition, FieldType, FilterOperator, ReferenceDefinition, SchemaRegistry,
};
pub use service::{EntityService, EntityServiceBuilder};
pub use store::{EventStore, ExpectedVersion};
pub use value::{FieldMap, FieldValue};

use std::{fmt, io};

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("record '{id}' not found in entity '{entity}'")]
    RecordNotFound { entity: String, id: String },
    #[error("record '{id}' in entity '{entity}' has been deleted")]
    RecordDeleted { entity: String, id: String },
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid sort: {0}")]
    InvalidSort(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    #[error("unauthenticated: an acting identity is required")]
    Unauthenticated,
    #[error("version conflict on '{stream_id}': expected {expected}, found {actual}")]
    ConcurrencyConflict {
        stream_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
    #[error("{operation} is not supported for entity '{entity}'")]
    Unsupported {
        entity: String,
        operation: &'static str,
    },
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse outcome a transport layer maps onto its own status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NotFound,
    BadRequest,
    Unauthorized,
    Conflict,
    Cancelled,
    Internal,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UnknownEntity(_) | Self::RecordNotFound { .. } | Self::RecordDeleted { .. } => {
                ErrorClass::NotFound
            }
            Self::InvalidFilter(_)
            | Self::InvalidSort(_)
            | Self::InvalidPayload(_)
            | Self::Validation(_)
            | Self::Unsupported { .. } => ErrorClass::BadRequest,
            Self::Unauthenticated => ErrorClass::Unauthorized,
            Self::ConcurrencyConflict { .. } => ErrorClass::Conflict,
            Self::Cancelled | Self::DeadlineExceeded => ErrorClass::Cancelled,
            Self::InvalidSchema(_)
            | Self::Config(_)
            | Self::Storage(_)
            | Self::Io(_)
            | Self::Serialization(_) => ErrorClass::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    pub(crate) fn not_found(entity: &str, id: &str) -> Self {
        Self::RecordNotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn deleted(entity: &str, id: &str) -> Self {
        Self::RecordDeleted {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every field-level failure found while sanitising one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError::new(field, message));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.0.iter().any(|error| error.field == field)
    }

    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
            first = false;
        }
        Ok(())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<postgres::Error> for EngineError {
    fn from(err: postgres::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{EngineError, Result},
    query::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, PageSettings},
    schema::SchemaRegistry,
    store::{EventStore, PostgresEventStore, SqliteEventStore},
};

pub const DEFAULT_PIVOT_BATCH_SIZE: usize = 200;
pub const DEFAULT_RECORD_CACHE_CAPACITY: usize = 1024;

fn default_schema_dir() -> PathBuf {
    PathBuf::from("schemas")
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_max_page_size() -> usize {
    MAX_PAGE_SIZE
}

fn default_pivot_batch_size() -> usize {
    DEFAULT_PIVOT_BATCH_SIZE
}

fn default_record_cache_capacity() -> usize {
    DEFAULT_RECORD_CACHE_CAPACITY
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Sqlite { path: PathBuf },
    Postgres { url: String },
    /// In-process SQLite database that lives as long as the store.
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite {
            path: PathBuf::from("data").join("entitydbx.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_schema_dir")]
    pub schema_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    #[serde(default = "default_pivot_batch_size")]
    pub pivot_batch_size: usize,
    /// Zero disables the record cache.
    #[serde(default = "default_record_cache_capacity")]
    pub record_cache_capacity: usize,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema_dir: default_schema_dir(),
            store: StoreConfig::default(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            pivot_batch_size: default_pivot_batch_size(),
            record_cache_capacity: default_record_cache_capacity(),
            log_filter: default_log_filter(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        let config: EngineConfig = toml::from_str(&contents)
            .map_err(|err| EngineError::Config(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, writing the default configuration there first when it
    /// does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let config = Self::default();
        config.save(path)?;
        info!(path = %path.display(), "wrote default configuration");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn page_settings(&self) -> PageSettings {
        PageSettings {
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.page_settings().validate()?;
        if self.pivot_batch_size == 0 || self.pivot_batch_size > self.max_page_size {
            return Err(EngineError::Config(format!(
                "pivot_batch_size must be between 1 and max_page_size ({})",
                self.max_page_size
            )));
        }
        match &self.store {
            StoreConfig::Sqlite { path } if path.as_os_str().is_empty() => {
                Err(EngineError::Config("store.path must not be empty".into()))
            }
            StoreConfig::Postgres { url } if url.trim().is_empty() => {
                Err(EngineError::Config("store.url must not be empty".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn open_store(&self) -> Result<Arc<dyn EventStore>> {
        let store: Arc<dyn EventStore> = match &self.store {
            StoreConfig::Sqlite { path } => Arc::new(SqliteEventStore::open(path)?),
            StoreConfig::Postgres { url } => Arc::new(PostgresEventStore::connect(url)?),
            StoreConfig::Memory => Arc::new(SqliteEventStore::open_in_memory()?),
        };
        Ok(store)
    }

    pub fn load_registry(&self) -> Result<SchemaRegistry> {
        SchemaRegistry::load_dir(&self.schema_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_keys() {
        let config: EngineConfig = toml::from_str("schema_dir = \"defs\"").unwrap();
        assert_eq!(config.schema_dir, PathBuf::from("defs"));
        assert_eq!(config.default_page_size, 50);
        assert_eq!(config.max_page_size, 200);
        assert_eq!(config.record_cache_capacity, 1024);
        assert!(matches!(config.store, StoreConfig::Sqlite { .. }));
    }

    #[test]
    fn store_kinds_parse() {
        let raw = "[store]\nkind = \"postgres\"\nurl = \"postgres://localhost/app\"";
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Postgres {
                url: "postgres://localhost/app".into()
            }
        );
        let config: EngineConfig = toml::from_str("[store]\nkind = \"memory\"").unwrap();
        assert_eq!(config.store, StoreConfig::Memory);
    }

    #[test]
    fn invalid_page_sizes_are_rejected() {
        let config = EngineConfig {
            default_page_size: 500,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig {
            pivot_batch_size: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_or_default_writes_then_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("entitydbx.toml");
        let written = EngineConfig::load_or_default(&path).unwrap();
        assert!(path.exists());

        let mut changed = written.clone();
        changed.store = StoreConfig::Memory;
        changed.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), changed);
    }

    #[test]
    fn memory_store_opens() {
        let config = EngineConfig {
            store: StoreConfig::Memory,
            ..EngineConfig::default()
        };
        let store = config.open_store().unwrap();
        store.close().unwrap();
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

pub const EVENTS_TABLE: &str = "entity_events";

/// SQL dialects the event table can be created in. Behaviour is identical
/// across dialects; only column types, auto-increment syntax and bind
/// placeholders differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Sqlite,
    Postgres,
    Mysql,
}

struct ColumnTypes {
    id: &'static str,
    text: &'static str,
    event_type: &'static str,
    version: &'static str,
    bytes: &'static str,
}

impl Dialect {
    fn column_types(self) -> ColumnTypes {
        match self {
            Dialect::Sqlite => ColumnTypes {
                id: "INTEGER PRIMARY KEY AUTOINCREMENT",
                text: "TEXT",
                event_type: "TEXT",
                version: "INTEGER",
                bytes: "BLOB",
            },
            Dialect::Postgres => ColumnTypes {
                id: "BIGSERIAL PRIMARY KEY",
                text: "TEXT",
                event_type: "TEXT",
                version: "BIGINT",
                bytes: "BYTEA",
            },
            Dialect::Mysql => ColumnTypes {
                id: "BIGINT AUTO_INCREMENT PRIMARY KEY",
                text: "VARCHAR(255)",
                event_type: "VARCHAR(64)",
                version: "BIGINT",
                bytes: "LONGBLOB",
            },
        }
    }

    /// Bind placeholder for the 1-based parameter `index`.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite | Dialect::Mysql => "?".to_string(),
        }
    }

    pub fn create_table_sql(self) -> String {
        let types = self.column_types();
        let unique = match self {
            Dialect::Mysql => "UNIQUE KEY uq_entity_events_stream_version (stream_id, version)",
            Dialect::Sqlite | Dialect::Postgres => "UNIQUE (stream_id, version)",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {EVENTS_TABLE} (
                id {id},
                stream_id {text} NOT NULL,
                aggregate_type {text} NOT NULL,
                version {version} NOT NULL,
                event_type {event_type} NOT NULL,
                payload {bytes} NOT NULL,
                metadata {bytes} NOT NULL,
                {unique}
            )",
            id = types.id,
            text = types.text,
            version = types.version,
            event_type = types.event_type,
            bytes = types.bytes,
        )
    }

    pub fn max_version_sql(self) -> String {
        format!(
            "SELECT COALESCE(MAX(version), 0) FROM {EVENTS_TABLE} WHERE stream_id = {}",
            self.placeholder(1)
        )
    }

    pub fn insert_sql(self) -> String {
        let params: Vec<String> = (1..=6).map(|index| self.placeholder(index)).collect();
        format!(
            "INSERT INTO {EVENTS_TABLE} \
             (stream_id, aggregate_type, version, event_type, payload, metadata) \
             VALUES ({})",
            params.join(", ")
        )
    }

    pub fn load_sql(self) -> String {
        format!(
            "SELECT stream_id, aggregate_type, version, event_type, payload, metadata \
             FROM {EVENTS_TABLE} WHERE stream_id = {} AND version >= {} ORDER BY version ASC",
            self.placeholder(1),
            self.placeholder(2)
        )
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_dialect_declares_the_stream_version_constraint() {
        for dialect in [Dialect::Sqlite, Dialect::Postgres, Dialect::Mysql] {
            let ddl = dialect.create_table_sql();
            assert!(ddl.contains("entity_events"), "{dialect}");
            assert!(ddl.contains("(stream_id, version)"), "{dialect}");
        }
    }

    #[test]
    fn column_types_follow_dialect() {
        assert!(Dialect::Sqlite.create_table_sql().contains("INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(Dialect::Postgres.create_table_sql().contains("payload BYTEA"));
        let mysql = Dialect::Mysql.create_table_sql();
        assert!(mysql.contains("stream_id VARCHAR(255)"));
        assert!(mysql.contains("event_type VARCHAR(64)"));
        assert!(mysql.contains("metadata LONGBLOB"));
    }

    #[test]
    fn placeholders_are_positional_for_postgres() {
        assert!(Dialect::Postgres.insert_sql().ends_with("VALUES ($1, $2, $3, $4, $5, $6)"));
        assert!(Dialect::Sqlite.load_sql().contains("stream_id = ? AND version >= ?"));
    }
}

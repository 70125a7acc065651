use std::{fs, panic::AssertUnwindSafe, path::Path, time::Duration};

use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, TransactionBehavior, ffi, params};
use tracing::{debug, warn};

use crate::{
    context::Context,
    error::{EngineError, Result},
};

use super::{Dialect, Event, EventStore, ExpectedVersion, NewEvent, timed};

const DIALECT: Dialect = Dialect::Sqlite;
const PROGRESS_OPS: i32 = 1_000;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Event store backed by a single SQLite connection.
pub struct SqliteEventStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteEventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(&DIALECT.create_table_sql())?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        ctx: &Context,
        op: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        ctx.check()?;
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| EngineError::Storage("event store is closed".into()))?;

        let interrupt = AssertUnwindSafe(ctx.clone());
        conn.progress_handler(PROGRESS_OPS, Some(move || interrupt.is_done()));
        let result = op(conn);
        conn.progress_handler(0, None::<fn() -> bool>);
        result.map_err(|err| map_error(ctx, err))
    }
}

fn map_error(ctx: &Context, err: rusqlite::Error) -> EngineError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &err {
        if inner.code == ErrorCode::OperationInterrupted {
            return ctx.check().err().unwrap_or(EngineError::Cancelled);
        }
    }
    EngineError::from(err)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn max_version(conn: &Connection, stream_id: &str) -> rusqlite::Result<u64> {
    let version: i64 =
        conn.query_row(&DIALECT.max_version_sql(), params![stream_id], |row| row.get(0))?;
    Ok(version.max(0) as u64)
}

enum AppendOutcome {
    Appended(u64),
    Conflict { expected: u64, actual: u64 },
}

impl EventStore for SqliteEventStore {
    fn append(
        &self,
        ctx: &Context,
        stream_id: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
    ) -> Result<u64> {
        timed("append", || {
            let outcome = self.with_conn(ctx, |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current = max_version(&tx, stream_id)?;
                if let ExpectedVersion::Exact(wanted) = expected {
                    if wanted != current {
                        return Ok(AppendOutcome::Conflict {
                            expected: wanted,
                            actual: current,
                        });
                    }
                }

                let mut version = current;
                {
                    let mut insert = tx.prepare_cached(&DIALECT.insert_sql())?;
                    for event in events {
                        version += 1;
                        let inserted = insert.execute(params![
                            stream_id,
                            event.aggregate_type,
                            version as i64,
                            event.event_type,
                            event.payload,
                            event.metadata,
                        ]);
                        match inserted {
                            Ok(_) => {}
                            Err(err) if is_unique_violation(&err) => {
                                return Ok(AppendOutcome::Conflict {
                                    expected: current,
                                    actual: version,
                                });
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
                tx.commit()?;
                Ok(AppendOutcome::Appended(version))
            })?;

            match outcome {
                AppendOutcome::Appended(version) => {
                    debug!(stream_id, version, count = events.len(), "appended events");
                    Ok(version)
                }
                AppendOutcome::Conflict { expected, actual } => {
                    warn!(stream_id, expected, actual, "append rejected by version check");
                    Err(EngineError::ConcurrencyConflict {
                        stream_id: stream_id.to_string(),
                        expected,
                        actual,
                    })
                }
            }
        })
    }

    fn load(&self, ctx: &Context, stream_id: &str, from_version: u64) -> Result<Vec<Event>> {
        timed("load", || {
            self.with_conn(ctx, |conn| {
                let mut stmt = conn.prepare_cached(&DIALECT.load_sql())?;
                let rows = stmt.query_map(params![stream_id, from_version as i64], |row| {
                    Ok(Event {
                        stream_id: row.get(0)?,
                        aggregate_type: row.get(1)?,
                        version: row.get::<_, i64>(2)?.max(0) as u64,
                        event_type: row.get(3)?,
                        payload: row.get(4)?,
                        metadata: row.get(5)?,
                    })
                })?;
                rows.collect()
            })
        })
    }

    fn current_version(&self, ctx: &Context, stream_id: &str) -> Result<u64> {
        timed("current_version", || {
            self.with_conn(ctx, |conn| max_version(conn, stream_id))
        })
    }

    fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, err)| EngineError::from(err))?;
        }
        Ok(())
    }
}

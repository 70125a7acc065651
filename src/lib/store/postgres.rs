use ::postgres::{Client, NoTls, Transaction, error::SqlState};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    context::Context,
    error::{EngineError, Result},
};

use super::{Dialect, Event, EventStore, ExpectedVersion, NewEvent, timed};

const DIALECT: Dialect = Dialect::Postgres;

/// Event store backed by a PostgreSQL connection.
pub struct PostgresEventStore {
    client: Mutex<Option<Client>>,
}

impl PostgresEventStore {
    pub fn connect(url: &str) -> Result<Self> {
        let mut client = Client::connect(url, NoTls)?;
        client.batch_execute(&DIALECT.create_table_sql())?;
        Ok(Self {
            client: Mutex::new(Some(client)),
        })
    }

    fn with_client<T>(
        &self,
        ctx: &Context,
        op: impl FnOnce(&mut Client) -> std::result::Result<T, ::postgres::Error>,
    ) -> Result<T> {
        ctx.check()?;
        let mut guard = self.client.lock();
        let client = guard
            .as_mut()
            .ok_or_else(|| EngineError::Storage("event store is closed".into()))?;
        op(client).map_err(|err| map_error(ctx, err))
    }
}

/// Opens a transaction bounded by the context's remaining deadline.
fn begin<'a>(
    client: &'a mut Client,
    ctx: &Context,
) -> std::result::Result<Transaction<'a>, ::postgres::Error> {
    let mut tx = client.transaction()?;
    if let Some(remaining) = ctx.remaining() {
        let millis = remaining.as_millis().max(1);
        tx.batch_execute(&format!("SET LOCAL statement_timeout = {millis}"))?;
    }
    Ok(tx)
}

fn map_error(ctx: &Context, err: ::postgres::Error) -> EngineError {
    if err.code() == Some(&SqlState::QUERY_CANCELED) {
        return ctx.check().err().unwrap_or(EngineError::Cancelled);
    }
    EngineError::from(err)
}

fn max_version(
    tx: &mut Transaction<'_>,
    stream_id: &str,
) -> std::result::Result<u64, ::postgres::Error> {
    let row = tx.query_one(&DIALECT.max_version_sql(), &[&stream_id])?;
    let version: i64 = row.get(0);
    Ok(version.max(0) as u64)
}

enum AppendOutcome {
    Appended(u64),
    Conflict { expected: u64, actual: u64 },
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        ctx: &Context,
        stream_id: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
    ) -> Result<u64> {
        timed("append", || {
            let outcome = self.with_client(ctx, |client| {
                let mut tx = begin(client, ctx)?;
                let current = max_version(&mut tx, stream_id)?;
                if let ExpectedVersion::Exact(wanted) = expected {
                    if wanted != current {
                        return Ok(AppendOutcome::Conflict {
                            expected: wanted,
                            actual: current,
                        });
                    }
                }
                let insert = tx.prepare(&DIALECT.insert_sql())?;
                let mut version = current;
                for event in events {
                    version += 1;
                    let version_param = version as i64;
                    let inserted = tx.execute(
                        &insert,
                        &[
                            &stream_id,
                            &event.aggregate_type,
                            &version_param,
                            &event.event_type,
                            &event.payload,
                            &event.metadata,
                        ],
                    );
                    match inserted {
                        Ok(_) => {}
                        Err(err) if err.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                            return Ok(AppendOutcome::Conflict {
                                expected: current,
                                actual: version,
                            });
                        }
                        Err(err) => return Err(err),
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
            self.with_client(ctx, |client| {
                let mut tx = begin(client, ctx)?;
                let from = from_version as i64;
                let rows = tx.query(&DIALECT.load_sql(), &[&stream_id, &from])?;
                tx.commit()?;
                Ok(rows
                    .iter()
                    .map(|row| Event {
                        stream_id: row.get(0),
                        aggregate_type: row.get(1),
                        version: row.get::<_, i64>(2).max(0) as u64,
                        event_type: row.get(3),
                        payload: row.get(4),
                        metadata: row.get(5),
                    })
                    .collect())
            })
        })
    }

    fn current_version(&self, ctx: &Context, stream_id: &str) -> Result<u64> {
        timed("current_version", || {
            self.with_client(ctx, |client| {
                let mut tx = begin(client, ctx)?;
                let version = max_version(&mut tx, stream_id)?;
                tx.commit()?;
                Ok(version)
            })
        })
    }

    fn close(&self) -> Result<()> {
        if let Some(client) = self.client.lock().take() {
            client.close()?;
        }
        Ok(())
    }
}

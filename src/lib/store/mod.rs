mod dialect;
mod postgres;
mod sqlite;

use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};

use crate::{context::Context, error::Result};

pub use self::{
    dialect::{Dialect, EVENTS_TABLE},
    postgres::PostgresEventStore,
    sqlite::SqliteEventStore,
};

/// A persisted, immutable event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub stream_id: String,
    pub aggregate_type: String,
    pub version: u64,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// An event waiting to be appended; the store assigns stream id and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub metadata: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append without an optimistic check.
    Any,
    /// The stream's current version must equal this value; `0` requires the
    /// stream not to exist yet.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn admits(self, current: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(expected) => expected == current,
        }
    }
}

/// Append-only, versioned event log keyed by stream id.
pub trait EventStore: Send + Sync {
    /// Appends `events` in order and returns the stream's new version.
    fn append(
        &self,
        ctx: &Context,
        stream_id: &str,
        expected: ExpectedVersion,
        events: &[NewEvent],
    ) -> Result<u64>;

    /// Events with `version >= from_version`, ascending. A missing stream
    /// yields an empty list.
    fn load(&self, ctx: &Context, stream_id: &str, from_version: u64) -> Result<Vec<Event>>;

    /// Highest version in the stream, `0` when it does not exist.
    fn current_version(&self, ctx: &Context, stream_id: &str) -> Result<u64>;

    fn close(&self) -> Result<()>;
}

pub(crate) fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("entitydbx_store_operations_total", &labels).increment(1);
    histogram!("entitydbx_store_operation_duration_seconds", &labels).record(duration);
}

pub(crate) fn timed<T>(operation: &'static str, op: impl FnOnce() -> Result<T>) -> Result<T> {
    let start = Instant::now();
    let result = op();
    let status = match &result {
        Ok(_) => "ok",
        Err(err) if err.class() == crate::error::ErrorClass::Conflict => "conflict",
        Err(_) => "err",
    };
    record_store_op(operation, status, start.elapsed().as_secs_f64());
    result
}

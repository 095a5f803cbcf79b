//! Concurrent metric storage.
//!
//! Two interchangeable backends sit behind the `Store` contract: a
//! mutex-guarded in-memory map and a SQLite-backed relational table. Both
//! enforce the same accumulation rules -- counters add to the previously
//! stored delta, gauges overwrite -- so callers never need to know which one
//! is active. The backend is chosen once at startup.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::metric::{Metric, MetricKind};

mod memory;
mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// Error surface of the storage contract.
#[derive(PartialEq, Debug, Clone)]
pub enum StoreError {
    /// The metric kind is not one the store understands. State is untouched.
    Unsupported,
    /// The metric's fields do not match its kind (e.g. a counter without a
    /// delta). State is untouched.
    Malformed(String),
    /// No metric is stored under the requested id.
    NotFound,
    /// The backend failed.
    Internal(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StoreError::Unsupported => f.write_str("unsupported metric type"),
            StoreError::Malformed(ref what) => {
                write!(f, "malformed metric: {}", what)
            }
            StoreError::NotFound => f.write_str("no value found"),
            StoreError::Internal(ref what) => write!(f, "storage error: {}", what),
        }
    }
}

/// The storage contract shared by every backend.
///
/// Implementations serialize their own access internally, so a store can be
/// shared between listener threads behind an `Arc`.
pub trait Store: Send + Sync {
    /// Prepare the backend. Failure here is fatal to the process.
    fn init(&self) -> Result<(), StoreError>;
    /// Lightweight liveness probe of the backend.
    fn check(&self) -> Result<(), StoreError>;
    /// Write one metric, applying its kind's accumulation rule.
    fn set(&self, metric: &Metric) -> Result<(), StoreError>;
    /// Write a batch. The whole batch is applied as a unit; see each
    /// backend for its atomicity guarantee.
    fn set_bulk(&self, metrics: &[Metric]) -> Result<(), StoreError>;
    /// Read the metric stored under `id`.
    fn get(&self, id: &str) -> Result<Metric, StoreError>;
    /// Snapshot every stored metric. The result is isolated from later
    /// mutation of the store.
    fn get_all(&self) -> Result<HashMap<String, Metric>, StoreError>;
    /// Release backend resources.
    fn close(&self);
}

/// Open the backend selected by configuration: a database path means the
/// relational store, its absence means the in-memory store.
pub fn open(database: Option<&Path>) -> Result<Box<dyn Store>, StoreError> {
    match database {
        Some(path) => Ok(Box::new(SqliteStore::open(path)?)),
        None => Ok(Box::new(MemoryStore::new())),
    }
}

// Shape check shared by the backends: the kind must be supported and the
// field matching the kind must be present.
fn validate(metric: &Metric) -> Result<MetricKind, StoreError> {
    let kind = metric.metric_kind().ok_or(StoreError::Unsupported)?;
    match kind {
        MetricKind::Gauge if metric.value.is_none() => Err(StoreError::Malformed(
            format!("gauge {} carries no value", metric.id),
        )),
        MetricKind::Counter if metric.delta.is_none() => Err(StoreError::Malformed(
            format!("counter {} carries no delta", metric.id),
        )),
        kind => Ok(kind),
    }
}

//! The relational storage backend.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::{validate, Store, StoreError};
use crate::metric::{Metric, MetricKind};

const BOOTSTRAP: &str = "CREATE TABLE IF NOT EXISTS metrics ( \
                         id TEXT PRIMARY KEY, \
                         kind TEXT NOT NULL, \
                         delta INTEGER, \
                         value REAL)";

// Accumulation is pushed into the statement itself so concurrent connections
// cannot interleave a read-modify-write.
const UPSERT_COUNTER: &str = "INSERT INTO metrics (id, kind, delta) \
                              VALUES (?1, 'counter', ?2) \
                              ON CONFLICT(id) DO UPDATE SET \
                              kind = excluded.kind, \
                              delta = COALESCE(metrics.delta, 0) + excluded.delta, \
                              value = NULL";

const UPSERT_GAUGE: &str = "INSERT INTO metrics (id, kind, value) \
                            VALUES (?1, 'gauge', ?2) \
                            ON CONFLICT(id) DO UPDATE SET \
                            kind = excluded.kind, \
                            value = excluded.value, \
                            delta = NULL";

const SELECT_ONE: &str = "SELECT id, kind, delta, value FROM metrics WHERE id = ?1";

const SELECT_ALL: &str = "SELECT id, kind, delta, value FROM metrics";

/// SQLite-backed store.
///
/// A single guarded connection serves all callers. Bulk writes run inside
/// one transaction and either fully commit or fully roll back.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn internal<E>(err: E) -> StoreError
where
    E: ::std::fmt::Display,
{
    StoreError::Internal(err.to_string())
}

fn row_to_metric(row: &Row) -> rusqlite::Result<Metric> {
    Ok(Metric {
        id: row.get(0)?,
        kind: row.get(1)?,
        delta: row.get(2)?,
        value: row.get(3)?,
        hash: None,
    })
}

fn exec_upsert(conn: &Connection, metric: &Metric) -> Result<(), StoreError> {
    match validate(metric)? {
        MetricKind::Counter => conn
            .execute(UPSERT_COUNTER, params![metric.id, metric.delta])
            .map(|_| ())
            .map_err(internal),
        MetricKind::Gauge => conn
            .execute(UPSERT_GAUGE, params![metric.id, metric.value])
            .map(|_| ())
            .map_err(internal),
    }
}

impl SqliteStore {
    /// Open, or create, the database file at `path`.
    pub fn open<P>(path: P) -> Result<SqliteStore, StoreError>
    where
        P: AsRef<Path>,
    {
        let conn = Connection::open(path).map_err(internal)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

impl Store for SqliteStore {
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(BOOTSTRAP, params![]).map_err(internal)?;
        info!("relational store initialized");
        Ok(())
    }

    fn check(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", params![], |_| Ok(()))
            .map_err(internal)
    }

    fn set(&self, metric: &Metric) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        exec_upsert(&conn, metric)
    }

    fn set_bulk(&self, metrics: &[Metric]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(internal)?;
        for metric in metrics {
            // any failure drops the transaction, rolling the batch back
            exec_upsert(&tx, metric)?;
        }
        tx.commit().map_err(internal)
    }

    fn get(&self, id: &str) -> Result<Metric, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(SELECT_ONE, params![id], row_to_metric)
            .optional()
            .map_err(internal)?
            .ok_or(StoreError::NotFound)
    }

    fn get_all(&self) -> Result<HashMap<String, Metric>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(SELECT_ALL).map_err(internal)?;
        let rows = stmt
            .query_map(params![], row_to_metric)
            .map_err(internal)?;

        let mut all = HashMap::new();
        for row in rows {
            let metric = row.map_err(internal)?;
            all.insert(metric.id.clone(), metric);
        }
        Ok(all)
    }

    fn close(&self) {
        debug!("relational store connection dropped on close");
    }
}

// Tests
//
#[cfg(test)]
mod test {
    extern crate tempdir;

    use self::tempdir::TempDir;
    use super::*;

    fn fresh() -> (TempDir, SqliteStore) {
        let dir = TempDir::new("stafford-sqlite").unwrap();
        let store = SqliteStore::open(dir.path().join("metrics.db")).unwrap();
        store.init().unwrap();
        (dir, store)
    }

    #[test]
    fn test_check_after_init() {
        let (_dir, store) = fresh();
        store.check().unwrap();
    }

    #[test]
    fn test_counter_accumulates_in_statement() {
        let (_dir, store) = fresh();
        store.set(&Metric::counter("hits", 10)).unwrap();
        store.set(&Metric::counter("hits", 5)).unwrap();

        assert_eq!(store.get("hits").unwrap().delta, Some(15));
    }

    #[test]
    fn test_gauge_overwrites() {
        let (_dir, store) = fresh();
        store.set(&Metric::gauge("cpu", 10.0)).unwrap();
        store.set(&Metric::gauge("cpu", 15.0)).unwrap();

        let stored = store.get("cpu").unwrap();
        assert_eq!(stored.value, Some(15.0));
        assert_eq!(stored.delta, None);
    }

    #[test]
    fn test_bulk_rolls_back_wholesale() {
        let (_dir, store) = fresh();
        store.set(&Metric::counter("hits", 3)).unwrap();

        let poisoned = vec![
            Metric::counter("hits", 10),
            Metric {
                id: "weird".to_string(),
                kind: "histogram".to_string(),
                value: Some(1.0),
                delta: None,
                hash: None,
            },
        ];
        assert!(store.set_bulk(&poisoned).is_err());

        // neither element of the failed batch persisted
        assert_eq!(store.get("hits").unwrap().delta, Some(3));
        assert_eq!(store.get("weird"), Err(StoreError::NotFound));
    }

    #[test]
    fn test_get_missing() {
        let (_dir, store) = fresh();
        assert_eq!(store.get("nope"), Err(StoreError::NotFound));
    }

    #[test]
    fn test_get_all() {
        let (_dir, store) = fresh();
        store.set(&Metric::counter("hits", 1)).unwrap();
        store.set(&Metric::gauge("cpu", 0.5)).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["hits"].delta, Some(1));
        assert_eq!(all["cpu"].value, Some(0.5));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new("stafford-sqlite").unwrap();
        let path = dir.path().join("metrics.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.init().unwrap();
            store.set(&Metric::counter("hits", 21)).unwrap();
            store.close();
        }
        let store = SqliteStore::open(&path).unwrap();
        store.init().unwrap();
        assert_eq!(store.get("hits").unwrap().delta, Some(21));
    }
}

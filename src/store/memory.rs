//! The in-memory storage backend.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{validate, Store, StoreError};
use crate::metric::{Metric, MetricKind};

/// A mutex-guarded map of metrics.
///
/// Counter accumulation -- read the prior delta, add, write back -- happens
/// inside a single lock hold, so concurrent writers can never observe a
/// partial update. Durability across restarts is the `backup` module's job.
pub struct MemoryStore {
    db: Mutex<HashMap<String, Metric>>,
}

impl MemoryStore {
    /// Create an empty in-memory store.
    pub fn new() -> MemoryStore {
        MemoryStore {
            db: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new()
    }
}

fn apply(db: &mut HashMap<String, Metric>, metric: &Metric) -> Result<(), StoreError> {
    match validate(metric)? {
        MetricKind::Counter => {
            if let Some(prior) = db.get_mut(&metric.id) {
                if let (Some(old), Some(new)) = (prior.delta, metric.delta) {
                    prior.delta = Some(old.wrapping_add(new));
                    // the carried signature no longer covers the summed delta
                    prior.hash = None;
                    return Ok(());
                }
            }
            db.insert(metric.id.clone(), metric.clone());
            Ok(())
        }
        MetricKind::Gauge => {
            db.insert(metric.id.clone(), metric.clone());
            Ok(())
        }
    }
}

impl Store for MemoryStore {
    fn init(&self) -> Result<(), StoreError> {
        info!("memory store initialized");
        Ok(())
    }

    fn check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn set(&self, metric: &Metric) -> Result<(), StoreError> {
        let mut db = self.db.lock().unwrap();
        apply(&mut db, metric)
    }

    fn set_bulk(&self, metrics: &[Metric]) -> Result<(), StoreError> {
        // one lock acquisition for the whole batch
        let mut db = self.db.lock().unwrap();
        for metric in metrics {
            apply(&mut db, metric)?;
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Metric, StoreError> {
        let db = self.db.lock().unwrap();
        db.get(id).cloned().ok_or(StoreError::NotFound)
    }

    fn get_all(&self) -> Result<HashMap<String, Metric>, StoreError> {
        let db = self.db.lock().unwrap();
        Ok(db.clone())
    }

    fn close(&self) {}
}

// Tests
//
#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};

    #[test]
    fn test_counter_accumulates() {
        let store = MemoryStore::new();
        store.set(&Metric::counter("hits", 10)).unwrap();
        store.set(&Metric::counter("hits", 5)).unwrap();

        let stored = store.get("hits").unwrap();
        assert_eq!(stored.delta, Some(15));
    }

    #[test]
    fn test_gauge_overwrites() {
        let store = MemoryStore::new();
        store.set(&Metric::gauge("cpu", 10.0)).unwrap();
        store.set(&Metric::gauge("cpu", 15.0)).unwrap();

        let stored = store.get("cpu").unwrap();
        assert_eq!(stored.value, Some(15.0));
    }

    #[test]
    fn test_bulk_applies_element_rules() {
        let store = MemoryStore::new();
        let batch = vec![
            Metric::counter("hits", 10),
            Metric::gauge("cpu", 1.0),
            Metric::counter("hits", 7),
            Metric::gauge("cpu", 2.0),
        ];
        store.set_bulk(&batch).unwrap();
        store.set_bulk(&batch).unwrap();

        assert_eq!(store.get("hits").unwrap().delta, Some(34));
        assert_eq!(store.get("cpu").unwrap().value, Some(2.0));
    }

    #[test]
    fn test_unknown_kind_rejected_without_mutation() {
        let store = MemoryStore::new();
        let odd = Metric {
            id: "weird".to_string(),
            kind: "histogram".to_string(),
            value: Some(1.0),
            delta: None,
            hash: None,
        };
        assert_eq!(store.set(&odd), Err(StoreError::Unsupported));
        assert_eq!(store.get("weird"), Err(StoreError::NotFound));
    }

    #[test]
    fn test_counter_without_delta_rejected() {
        let store = MemoryStore::new();
        let hollow = Metric {
            id: "hollow".to_string(),
            kind: "counter".to_string(),
            value: None,
            delta: None,
            hash: None,
        };
        match store.set(&hollow) {
            Err(StoreError::Malformed(_)) => {}
            other => panic!("expected malformed, got {:?}", other),
        }
        assert_eq!(store.get("hollow"), Err(StoreError::NotFound));
    }

    #[test]
    fn test_get_all_is_isolated() {
        let store = MemoryStore::new();
        store.set(&Metric::counter("hits", 1)).unwrap();

        let mut snapshot = store.get_all().unwrap();
        snapshot.insert("ghost".to_string(), Metric::gauge("ghost", 0.0));
        snapshot.get_mut("hits").unwrap().delta = Some(999);

        assert_eq!(store.get("ghost"), Err(StoreError::NotFound));
        assert_eq!(store.get("hits").unwrap().delta, Some(1));
    }

    #[test]
    fn test_accumulation_is_order_insensitive() {
        fn inner(deltas: Vec<i32>) -> TestResult {
            let total: i64 = deltas.iter().map(|d| i64::from(*d)).sum();

            let forward = MemoryStore::new();
            for d in &deltas {
                forward.set(&Metric::counter("acc", i64::from(*d))).unwrap();
            }

            let backward = MemoryStore::new();
            let mut batch: Vec<Metric> = deltas
                .iter()
                .map(|d| Metric::counter("acc", i64::from(*d)))
                .collect();
            batch.reverse();
            backward.set_bulk(&batch).unwrap();

            if deltas.is_empty() {
                assert_eq!(forward.get("acc"), Err(StoreError::NotFound));
                assert_eq!(backward.get("acc"), Err(StoreError::NotFound));
            } else {
                assert_eq!(forward.get("acc").unwrap().delta, Some(total));
                assert_eq!(backward.get("acc").unwrap().delta, Some(total));
            }
            TestResult::passed()
        }
        QuickCheck::new().quickcheck(inner as fn(Vec<i32>) -> TestResult);
    }
}

//! File backups for the in-memory store.
//!
//! The whole store snapshot is serialized as one JSON array of metrics,
//! fully rewriting the file on every dump. At startup the server can replay
//! the file through the normal storage write path. None of this is used when
//! the relational backend is active; persistence is its own job then.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use crate::metric::Metric;

/// Reads and writes the backup file.
pub struct Backuper {
    path: PathBuf,
}

impl Backuper {
    /// Create a backuper bound to `path`. The file is only touched on use.
    pub fn new<P>(path: P) -> Backuper
    where
        P: Into<PathBuf>,
    {
        Backuper { path: path.into() }
    }

    /// Overwrite the backup file with the given metrics.
    pub fn write_metrics(&self, metrics: &[Metric]) -> Result<(), String> {
        let file = File::create(&self.path).map_err(|e| {
            format!("failed to open backup {}: {}", self.path.display(), e)
        })?;
        serde_json::to_writer(BufWriter::new(file), metrics).map_err(|e| {
            format!("failed to write backup {}: {}", self.path.display(), e)
        })
    }

    /// Read the backup file back into a list of metrics.
    pub fn read_metrics(&self) -> Result<Vec<Metric>, String> {
        let file = File::open(&self.path).map_err(|e| {
            format!("failed to open backup {}: {}", self.path.display(), e)
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            format!("failed to parse backup {}: {}", self.path.display(), e)
        })
    }
}

// Tests
//
#[cfg(test)]
mod test {
    extern crate tempdir;

    use self::tempdir::TempDir;
    use super::*;
    use crate::store::{MemoryStore, Store};

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new("stafford-backup").unwrap();
        let backuper = Backuper::new(dir.path().join("metrics.json"));

        let metrics = vec![
            Metric::counter("hits", 15),
            Metric::gauge("cpu", 0.5),
        ];
        backuper.write_metrics(&metrics).unwrap();

        let restored = backuper.read_metrics().unwrap();
        assert_eq!(restored, metrics);
    }

    #[test]
    fn test_dump_fully_rewrites() {
        let dir = TempDir::new("stafford-backup").unwrap();
        let backuper = Backuper::new(dir.path().join("metrics.json"));

        backuper
            .write_metrics(&[Metric::counter("old", 1), Metric::counter("hits", 2)])
            .unwrap();
        backuper.write_metrics(&[Metric::counter("hits", 3)]).unwrap();

        let restored = backuper.read_metrics().unwrap();
        assert_eq!(restored, vec![Metric::counter("hits", 3)]);
    }

    #[test]
    fn test_restore_into_empty_store_is_value_for_value() {
        let dir = TempDir::new("stafford-backup").unwrap();
        let backuper = Backuper::new(dir.path().join("metrics.json"));

        let first = MemoryStore::new();
        first.set(&Metric::counter("hits", 15)).unwrap();
        first.set(&Metric::gauge("cpu", 0.5)).unwrap();

        let snapshot: Vec<Metric> =
            first.get_all().unwrap().into_iter().map(|(_, m)| m).collect();
        backuper.write_metrics(&snapshot).unwrap();

        // replay through the normal write path, cold start
        let second = MemoryStore::new();
        for metric in backuper.read_metrics().unwrap() {
            second.set(&metric).unwrap();
        }

        assert_eq!(second.get("hits").unwrap().delta, Some(15));
        assert_eq!(second.get("cpu").unwrap().value, Some(0.5));
    }

    #[test]
    fn test_restore_accumulates_against_existing_counters() {
        let dir = TempDir::new("stafford-backup").unwrap();
        let backuper = Backuper::new(dir.path().join("metrics.json"));
        backuper.write_metrics(&[Metric::counter("hits", 10)]).unwrap();

        let store = MemoryStore::new();
        store.set(&Metric::counter("hits", 5)).unwrap();
        for metric in backuper.read_metrics().unwrap() {
            store.set(&metric).unwrap();
        }

        assert_eq!(store.get("hits").unwrap().delta, Some(15));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new("stafford-backup").unwrap();
        let backuper = Backuper::new(dir.path().join("absent.json"));
        assert!(backuper.read_metrics().is_err());
    }
}

//! Append-only SQLite history of snapshots.

pub mod csv;

use crate::sensors::HardwareSnapshot;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stored timestamp {value:?} is not RFC 3339: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub cpu_temp: f64,
    pub cpu_usage: f64,
    pub gpu_temp: f64,
    pub gpu_usage: f64,
    pub mem_usage: f64,
    pub total_power: f64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    cpu_temp REAL NOT NULL,
    cpu_usage REAL NOT NULL,
    gpu_temp REAL NOT NULL,
    gpu_usage REAL NOT NULL,
    mem_usage REAL NOT NULL,
    total_power REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON snapshots(timestamp);
";

/// Timestamps are stored as fixed-width RFC 3339 UTC text, so string order in
/// SQLite equals time order.
pub struct StorageEngine {
    conn: Mutex<Connection>,
}

impl StorageEngine {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn save_snapshot(&self, snap: &HardwareSnapshot) -> Result<i64, StorageError> {
        self.save_snapshot_at(snap, Utc::now())
    }

    pub fn save_snapshot_at(&self, snap: &HardwareSnapshot, at: DateTime<Utc>) -> Result<i64, StorageError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO snapshots (timestamp, cpu_temp, cpu_usage, gpu_temp, gpu_usage, mem_usage, total_power)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                csv::format_timestamp(&at),
                snap.cpu.temperature_celsius,
                snap.cpu.usage_percent,
                snap.gpu.temperature_celsius,
                snap.gpu.usage_percent,
                snap.memory.usage_percent,
                snap.total_power_watts(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Inclusive on both ends, oldest first.
    pub fn query<Tz: TimeZone>(
        &self,
        from: DateTime<Tz>,
        to: DateTime<Tz>,
    ) -> Result<Vec<SnapshotRecord>, StorageError> {
        let from = csv::format_timestamp(&from.with_timezone(&Utc));
        let to = csv::format_timestamp(&to.with_timezone(&Utc));

        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, cpu_temp, cpu_usage, gpu_temp, gpu_usage, mem_usage, total_power
             FROM snapshots
             WHERE timestamp BETWEEN ?1 AND ?2
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![from, to], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                [
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                ],
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, ts, [cpu_temp, cpu_usage, gpu_temp, gpu_usage, mem_usage, total_power]) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .map_err(|source| StorageError::Timestamp {
                    value: ts.clone(),
                    source,
                })?
                .with_timezone(&Utc);
            records.push(SnapshotRecord {
                id,
                timestamp,
                cpu_temp,
                cpu_usage,
                gpu_temp,
                gpu_usage,
                mem_usage,
                total_power,
            });
        }
        Ok(records)
    }

    /// Writes the range as CSV and returns the number of data rows.
    pub fn export_csv<Tz: TimeZone>(
        &self,
        from: DateTime<Tz>,
        to: DateTime<Tz>,
        path: impl AsRef<Path>,
    ) -> Result<usize, StorageError> {
        let records = self.query(from, to)?;
        let path = path.as_ref();
        fs::write(path, csv::serialize(&records)).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(records.len())
    }

    /// Deletes rows older than `retention_days` and returns how many went.
    pub fn cleanup_old_data(&self, retention_days: u32) -> Result<usize, StorageError> {
        self.cleanup_before(Utc::now() - chrono::Duration::days(i64::from(retention_days)))
    }

    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let conn = self.conn();
        let deleted = conn.execute(
            "DELETE FROM snapshots WHERE timestamp < ?1",
            params![csv::format_timestamp(&cutoff)],
        )?;
        Ok(deleted)
    }
}

/// Named look-back windows offered by the history view.
pub const HISTORY_RANGES: [&str; 4] = ["1h", "24h", "7d", "30d"];

/// `(now - range, now)`; anything other than the named windows means 1h.
pub fn time_range(range: &str, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let window = HISTORY_RANGES
        .contains(&range)
        .then(|| humantime::parse_duration(range).ok())
        .flatten()
        .unwrap_or(Duration::from_secs(3600));
    let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));
    (now - window, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use tempfile::tempdir;

    fn snap(cpu_temp: f64) -> HardwareSnapshot {
        let mut s = HardwareSnapshot::default();
        s.cpu.temperature_celsius = cpu_temp;
        s.cpu.usage_percent = 12.5;
        s.cpu.power_watts = 65.0;
        s.gpu.power_watts = 180.0;
        s.memory.usage_percent = 48.0;
        s
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    #[test]
    fn store_keeps_working_after_a_panicking_writer() {
        let store = StorageEngine::open_in_memory().unwrap();
        let crashed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _conn = store.conn();
            panic!("writer crashed");
        }));
        assert!(crashed.is_err());
        assert!(store.conn.is_poisoned());

        store.save_snapshot_at(&snap(4.0), at(9, 0)).unwrap();
        assert_eq!(store.query(at(9, 0), at(9, 0)).unwrap().len(), 1);
    }

    #[test]
    fn query_is_inclusive_and_ordered() {
        let store = StorageEngine::open_in_memory().unwrap();
        store.save_snapshot_at(&snap(3.0), at(10, 30)).unwrap();
        store.save_snapshot_at(&snap(1.0), at(10, 0)).unwrap();
        store.save_snapshot_at(&snap(2.0), at(10, 15)).unwrap();
        store.save_snapshot_at(&snap(9.0), at(11, 0)).unwrap();

        let rows = store.query(at(10, 0), at(10, 30)).unwrap();
        let temps: Vec<f64> = rows.iter().map(|r| r.cpu_temp).collect();
        assert_eq!(temps, vec![1.0, 2.0, 3.0]);
        assert_eq!(rows[0].total_power, 245.0);
        assert_eq!(rows[0].mem_usage, 48.0);
        assert_eq!(rows[0].timestamp, at(10, 0));
    }

    #[test]
    fn bounds_in_other_zones_are_converted() {
        let store = StorageEngine::open_in_memory().unwrap();
        store.save_snapshot_at(&snap(1.0), at(10, 0)).unwrap();

        let plus2 = FixedOffset::east_opt(2 * 3600).unwrap();
        let from = plus2.with_ymd_and_hms(2024, 5, 1, 11, 59, 0).unwrap();
        let to = plus2.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap();
        assert_eq!(store.query(from, to).unwrap().len(), 1);
    }

    #[test]
    fn cleanup_removes_only_older_rows() {
        let store = StorageEngine::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .save_snapshot_at(&snap(1.0), now - chrono::Duration::days(31))
            .unwrap();
        store
            .save_snapshot_at(&snap(2.0), now - chrono::Duration::days(2))
            .unwrap();
        store.save_snapshot(&snap(3.0)).unwrap();

        assert_eq!(store.cleanup_old_data(30).unwrap(), 1);
        let left = store
            .query(now - chrono::Duration::days(40), now + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(left.len(), 2);
    }

    #[test]
    fn export_writes_csv_file() {
        let dir = tempdir().unwrap();
        let store = StorageEngine::open(dir.path().join("data").join("monitor.db")).unwrap();
        store.save_snapshot_at(&snap(40.0), at(9, 0)).unwrap();
        store.save_snapshot_at(&snap(41.0), at(9, 1)).unwrap();

        let out = dir.path().join("export.csv");
        assert_eq!(store.export_csv(at(0, 0), at(23, 59), &out).unwrap(), 2);

        let text = std::fs::read_to_string(&out).unwrap();
        let back = csv::deserialize(&text);
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].cpu_temp, 41.0);
        assert_eq!(back[1].timestamp, at(9, 1));
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("monitor.db");
        {
            let store = StorageEngine::open(&path).unwrap();
            store.save_snapshot_at(&snap(40.0), at(9, 0)).unwrap();
        }
        let store = StorageEngine::open(&path).unwrap();
        assert_eq!(store.query(at(0, 0), at(23, 0)).unwrap().len(), 1);
    }

    #[test]
    fn history_ranges() {
        let now = at(12, 0);
        assert_eq!(time_range("24h", now).0, now - chrono::Duration::hours(24));
        assert_eq!(time_range("7d", now).0, now - chrono::Duration::days(7));
        assert_eq!(time_range("30d", now).0, now - chrono::Duration::days(30));
        assert_eq!(time_range("bogus", now).0, now - chrono::Duration::hours(1));
        assert_eq!(time_range("2h", now).0, now - chrono::Duration::hours(1));
        assert_eq!(time_range("1h", now).1, now);
    }
}

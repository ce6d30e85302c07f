//! SQLite metadata store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;
use crate::metrics::{ActivityMetrics, SystemMetrics};
use crate::storage::ArtifactKind;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe metadata store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Artifact metadata ---

    /// Record a persisted artifact and return its row ID.
    pub fn add_artifact(
        &self,
        kind: ArtifactKind,
        user_id: &str,
        captured_at: DateTime<Utc>,
        object_path: &str,
        size_bytes: i64,
    ) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "INSERT INTO {} (user_id, captured_at, object_path, size_bytes) VALUES (?1, ?2, ?3, ?4)",
            kind.table()
        );
        conn.execute(
            &sql,
            params![
                user_id,
                format_db_time(captured_at),
                object_path,
                size_bytes,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List a user's artifacts captured before `cutoff`, oldest first.
    pub fn list_artifacts_before(
        &self,
        kind: ArtifactKind,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ArtifactRow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT id, user_id, captured_at, object_path, size_bytes FROM {} \
             WHERE user_id = ?1 AND captured_at < ?2 ORDER BY captured_at ASC",
            kind.table()
        );
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt
            .query_map(params![user_id, format_db_time(cutoff)], |row| {
                let time_str: String = row.get(2)?;
                Ok(ArtifactRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    captured_at: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    object_path: row.get(3)?,
                    size_bytes: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    /// Delete an artifact metadata row.
    pub fn delete_artifact(&self, kind: ArtifactKind, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("DELETE FROM {} WHERE id = ?1", kind.table());
        conn.execute(&sql, params![id])?;
        Ok(())
    }

    // --- Activity samples ---

    /// Append one activity snapshot to a user's history.
    pub fn add_activity_sample(
        &self,
        user_id: &str,
        metrics: &ActivityMetrics,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO activity_samples \
             (user_id, last_active, mouse_movements, keyboard_events, scroll_events, \
              network_requests, total_active_time, idle_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id,
                metrics.last_active,
                metrics.mouse_movements,
                metrics.keyboard_events,
                metrics.scroll_events,
                metrics.network_requests,
                metrics.total_active_time,
                metrics.idle_time,
            ],
        )?;
        Ok(())
    }

    /// Activity snapshots with `last_active` inside `[start_ms, end_ms]`.
    pub fn get_activity_samples(
        &self,
        user_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<ActivityMetrics>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT last_active, mouse_movements, keyboard_events, scroll_events, \
                    network_requests, total_active_time, idle_time \
             FROM activity_samples \
             WHERE user_id = ?1 AND last_active >= ?2 AND last_active <= ?3 \
             ORDER BY last_active ASC",
        )?;

        let samples = stmt
            .query_map(params![user_id, start_ms, end_ms], |row| {
                Ok(ActivityMetrics {
                    last_active: row.get(0)?,
                    mouse_movements: row.get(1)?,
                    keyboard_events: row.get(2)?,
                    scroll_events: row.get(3)?,
                    network_requests: row.get(4)?,
                    total_active_time: row.get(5)?,
                    idle_time: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// Delete activity samples older than `cutoff_ms`.
    pub fn delete_activity_samples_before(
        &self,
        user_id: &str,
        cutoff_ms: i64,
    ) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM activity_samples WHERE user_id = ?1 AND last_active < ?2",
            params![user_id, cutoff_ms],
        )?;
        Ok(n)
    }

    // --- System samples ---

    /// Append one system sample to a user's history.
    pub fn add_system_sample(
        &self,
        user_id: &str,
        sample: &SystemMetrics,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO system_samples \
             (user_id, timestamp, cpu_usage, memory_usage, memory_total, memory_free) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                sample.timestamp,
                sample.cpu_usage,
                sample.memory_usage,
                sample.memory_total,
                sample.memory_free,
            ],
        )?;
        Ok(())
    }

    /// System samples with `timestamp` inside `[start_ms, end_ms]`.
    pub fn get_system_samples(
        &self,
        user_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<SystemMetrics>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT timestamp, cpu_usage, memory_usage, memory_total, memory_free \
             FROM system_samples \
             WHERE user_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3 \
             ORDER BY timestamp ASC",
        )?;

        let samples = stmt
            .query_map(params![user_id, start_ms, end_ms], |row| {
                Ok(SystemMetrics {
                    timestamp: row.get(0)?,
                    cpu_usage: row.get(1)?,
                    memory_usage: row.get(2)?,
                    memory_total: row.get(3)?,
                    memory_free: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// Delete system samples older than `cutoff_ms`.
    pub fn delete_system_samples_before(
        &self,
        user_id: &str,
        cutoff_ms: i64,
    ) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM system_samples WHERE user_id = ?1 AND timestamp < ?2",
            params![user_id, cutoff_ms],
        )?;
        Ok(n)
    }

    // --- Usage aggregate ---

    /// Upsert the rolling usage aggregate for a user.
    pub fn upsert_app_usage(
        &self,
        user_id: &str,
        metrics: &ActivityMetrics,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO app_usage \
             (user_id, last_active, mouse_movements, keyboard_events, scroll_events, \
              network_requests, total_active_time, total_idle_time) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(user_id) DO UPDATE SET \
             last_active=excluded.last_active, \
             mouse_movements=excluded.mouse_movements, \
             keyboard_events=excluded.keyboard_events, \
             scroll_events=excluded.scroll_events, \
             network_requests=excluded.network_requests, \
             total_active_time=excluded.total_active_time, \
             total_idle_time=excluded.total_idle_time",
            params![
                user_id,
                format_db_time(Utc::now()),
                metrics.mouse_movements,
                metrics.keyboard_events,
                metrics.scroll_events,
                metrics.network_requests,
                metrics.total_active_time,
                metrics.idle_time,
            ],
        )?;
        Ok(())
    }

    // --- Diagnostics ---

    /// Storage statistics for startup logging and the status surface.
    pub fn get_stats(&self) -> Result<DbStats, DbError> {
        let conn = self.conn.lock().unwrap();
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let screenshot_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM screenshots", [], |r| r.get(0))?;
        let recording_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM recordings", [], |r| r.get(0))?;
        let activity_sample_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM activity_samples", [], |r| r.get(0))?;
        Ok(DbStats {
            total_bytes: page_count * page_size,
            screenshot_count,
            recording_count,
            activity_sample_count,
        })
    }
}

fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn test_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn test_artifact_roundtrip() {
        let (_tmp, store) = test_store();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        let id = store
            .add_artifact(ArtifactKind::Screenshot, "u1", t, "u1/screenshot/x", 1024)
            .unwrap();
        assert!(id > 0);

        let cutoff = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let rows = store
            .list_artifacts_before(ArtifactKind::Screenshot, "u1", cutoff)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].object_path, "u1/screenshot/x");
        assert_eq!(rows[0].captured_at, t);

        // Other kind and other user see nothing.
        assert!(store
            .list_artifacts_before(ArtifactKind::Video, "u1", cutoff)
            .unwrap()
            .is_empty());
        assert!(store
            .list_artifacts_before(ArtifactKind::Screenshot, "u2", cutoff)
            .unwrap()
            .is_empty());

        store.delete_artifact(ArtifactKind::Screenshot, id).unwrap();
        assert!(store
            .list_artifacts_before(ArtifactKind::Screenshot, "u1", cutoff)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_list_artifacts_oldest_first() {
        let (_tmp, store) = test_store();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        store
            .add_artifact(ArtifactKind::Video, "u1", t1, "u1/video/b", 10)
            .unwrap();
        store
            .add_artifact(ArtifactKind::Video, "u1", t2, "u1/video/a", 10)
            .unwrap();

        let cutoff = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let rows = store
            .list_artifacts_before(ArtifactKind::Video, "u1", cutoff)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].object_path, "u1/video/a");
    }

    #[test]
    fn test_activity_sample_range_inclusive() {
        let (_tmp, store) = test_store();
        for t in [1000, 2000, 3000] {
            let mut m = ActivityMetrics::new(t);
            m.mouse_movements = t as u64;
            store.add_activity_sample("u1", &m).unwrap();
        }

        let samples = store.get_activity_samples("u1", 1000, 2000).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].last_active, 1000);
        assert_eq!(samples[1].last_active, 2000);

        let n = store.delete_activity_samples_before("u1", 2500).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_system_sample_range_inclusive() {
        let (_tmp, store) = test_store();
        for t in [500, 1500] {
            let s = SystemMetrics {
                cpu_usage: 12.5,
                memory_usage: 100,
                memory_total: 200,
                memory_free: 100,
                timestamp: t,
            };
            store.add_system_sample("u1", &s).unwrap();
        }

        let samples = store.get_system_samples("u1", 500, 1500).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].cpu_usage, 12.5);
    }

    #[test]
    fn test_app_usage_upsert_is_idempotent() {
        let (_tmp, store) = test_store();
        let mut m = ActivityMetrics::new(1000);
        m.keyboard_events = 5;
        store.upsert_app_usage("u1", &m).unwrap();
        m.keyboard_events = 9;
        store.upsert_app_usage("u1", &m).unwrap();

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.screenshot_count, 0);
        // Single row survives both upserts.
        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM app_usage", [], |r| r.get(0))
            .unwrap();
        let kb: i64 = conn
            .query_row("SELECT keyboard_events FROM app_usage WHERE user_id='u1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(kb, 9);
    }
}

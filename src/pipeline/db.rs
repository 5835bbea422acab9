//! SQLite backend shared by cooperating aggregator processes
//!
//! One database file holds the inbound/dead-letter queues, the aggregation
//! buffer and the durable stats records, so any number of daemons pointed at
//! the same file coordinate purely through single-statement atomicity:
//!
//! - queue pop: delete-returning of the oldest row in an IMMEDIATE transaction
//! - buffer increment: `INSERT .. ON CONFLICT DO UPDATE`, saturating at the i64 bounds
//! - durable create: `INSERT .. ON CONFLICT DO NOTHING`, created iff 1 row changed
//! - durable CAS: `UPDATE .. WHERE last_id = ?`, swapped iff 1 row changed
//!
//! Schema lives in `/sql/*.sql` (embedded at build time, all `IF NOT EXISTS`).

use super::backend::{AggregationBuffer, BackendError, BufferedEntry, FacetWrite, RecordQueue, StatsStore};
use super::types::{CounterMap, Facet, FacetId, StatsRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Schema files in execution order
const SCHEMA: &[(&str, &str)] = &[
    ("00_queue.sql", include_str!("../../sql/00_queue.sql")),
    ("01_buffer.sql", include_str!("../../sql/01_buffer.sql")),
    ("02_stats.sql", include_str!("../../sql/02_stats.sql")),
];

/// Counter upsert that clamps at the i64 bounds
///
/// Plain `value + excluded.value` would overflow into a REAL and make the
/// row unreadable as an integer.
const INCREMENT_COUNTER: &str = "INSERT INTO buffer_counters (facet_id, name, value) VALUES (?1, ?2, ?3)
     ON CONFLICT(facet_id, name) DO UPDATE SET value = CASE
         WHEN excluded.value > 0 AND value > 9223372036854775807 - excluded.value
             THEN 9223372036854775807
         WHEN excluded.value < 0 AND value < -9223372036854775807 - 1 - excluded.value
             THEN -9223372036854775807 - 1
         ELSE value + excluded.value
     END";

/// How long writers wait on a locked database before reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply journal and locking pragmas
///
/// WAL lets readers proceed while another process writes.
pub fn apply_pragmas(conn: &Connection) -> Result<(), BackendError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    log::debug!("📊 SQLite journal mode: {}", mode);
    Ok(())
}

/// Run the embedded schema migrations (idempotent)
pub fn run_schema_migrations(conn: &Connection) -> Result<(), BackendError> {
    log::debug!("🔧 Running schema migrations");
    for (name, sql) in SCHEMA {
        conn.execute_batch(sql)?;
        log::debug!("   ├─ ✅ {}", name);
    }
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn decode_values(raw: &str) -> Result<CounterMap, BackendError> {
    serde_json::from_str(raw).map_err(|e| BackendError::Corrupt(format!("stats values: {}", e)))
}

fn row_to_stats(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_stats((facet_parent_id, facet, lineage_token, vals): (String, String, String, String)) -> Result<StatsRecord, BackendError> {
    Ok(StatsRecord {
        facet_parent_id,
        facet,
        lineage_token,
        values: decode_values(&vals)?,
    })
}

/// SQLite implementation of `RecordQueue`, `AggregationBuffer` and `StatsStore`
///
/// Clones share one connection; separate processes open their own.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    bucket: String,
    poll_interval: Duration,
}

impl SqliteBackend {
    /// Open (creating if needed) the database and apply schema
    ///
    /// Arguments:
    /// - `db_path`: database file, parent directories are created
    /// - `bucket`: durable stats namespace this handle reads and writes
    pub fn open(db_path: impl AsRef<Path>, bucket: &str) -> Result<Self, BackendError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BackendError::Unavailable(format!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        apply_pragmas(&conn)?;
        run_schema_migrations(&conn)?;

        log::info!("✅ SQLite backend ready: {} (bucket: {})", db_path.as_ref().display(), bucket);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            bucket: bucket.to_string(),
            poll_interval: Duration::from_millis(50),
        })
    }

    /// Override how often a blocking pop re-checks an empty queue
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn try_pop(&self, queue: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(i64, Vec<u8>)> = tx
            .query_row(
                "SELECT id, payload FROM queue_items WHERE queue = ?1 ORDER BY id LIMIT 1",
                params![queue],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((id, payload)) => {
                tx.execute("DELETE FROM queue_items WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RecordQueue for SqliteBackend {
    async fn push(&self, queue: &str, payload: Vec<u8>) -> Result<(), BackendError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO queue_items (queue, payload, enqueued_at) VALUES (?1, ?2, ?3)",
            params![queue, payload, now_millis()],
        )?;
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_pop(queue)? {
                return Ok(Some(payload));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn depth(&self, queue: &str) -> Result<usize, BackendError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE queue = ?1",
            params![queue],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn mark_complete(&self, record_id: &str, ttl: Duration) -> Result<(), BackendError> {
        let now = now_millis();
        let expires_at = now + ttl.as_millis() as i64;
        let conn = self.conn.lock();
        conn.execute("DELETE FROM completion_markers WHERE expires_at <= ?1", params![now])?;
        conn.execute(
            "INSERT INTO completion_markers (record_id, completed_at, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(record_id) DO UPDATE SET completed_at = excluded.completed_at, expires_at = excluded.expires_at",
            params![record_id, now, expires_at],
        )?;
        Ok(())
    }

    async fn is_complete(&self, record_id: &str) -> Result<bool, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM completion_markers WHERE record_id = ?1 AND expires_at > ?2",
        )?;
        Ok(stmt.exists(params![record_id, now_millis()])?)
    }
}

#[async_trait]
impl AggregationBuffer for SqliteBackend {
    async fn increment(&self, facet_id: &str, deltas: &CounterMap) -> Result<(), BackendError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (name, delta) in deltas {
            tx.execute(INCREMENT_COUNTER, params![facet_id, name, delta])?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn set_metadata_if_absent(&self, facet: &Facet) -> Result<bool, BackendError> {
        let encoded = serde_json::to_string(facet)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO buffer_meta (facet_id, facet) VALUES (?1, ?2)",
            params![facet.id, encoded],
        )?;
        Ok(changed == 1)
    }

    async fn mark_dirty(&self, facet_id: &str) -> Result<(), BackendError> {
        let conn = self.conn.lock();
        conn.execute("INSERT OR IGNORE INTO buffer_dirty (facet_id) VALUES (?1)", params![facet_id])?;
        Ok(())
    }

    async fn list_dirty(&self) -> Result<Vec<FacetId>, BackendError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT facet_id FROM buffer_dirty ORDER BY facet_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    async fn dirty_count(&self) -> Result<usize, BackendError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM buffer_dirty", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn read_and_clear(&self, facet_id: &str) -> Result<BufferedEntry, BackendError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let deltas = {
            let mut stmt = tx.prepare("SELECT name, value FROM buffer_counters WHERE facet_id = ?1")?;
            let rows = stmt.query_map(params![facet_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            rows.collect::<Result<CounterMap, _>>()?
        };
        let encoded: Option<String> = tx
            .query_row("SELECT facet FROM buffer_meta WHERE facet_id = ?1", params![facet_id], |row| row.get(0))
            .optional()?;

        // Decode before deleting: an error drops the transaction and the
        // counters stay buffered
        let facet = match encoded {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| BackendError::Corrupt(format!("facet metadata for {}: {}", facet_id, e)))?,
            ),
            None => None,
        };

        tx.execute("DELETE FROM buffer_counters WHERE facet_id = ?1", params![facet_id])?;
        tx.execute("DELETE FROM buffer_dirty WHERE facet_id = ?1", params![facet_id])?;
        tx.commit()?;

        Ok(BufferedEntry { facet, deltas })
    }

    async fn apply(&self, writes: &[FacetWrite]) -> Result<(), BackendError> {
        let encoded = writes
            .iter()
            .map(|w| serde_json::to_string(&w.facet))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (write, facet_json) in writes.iter().zip(&encoded) {
            for (name, delta) in &write.deltas {
                tx.execute(INCREMENT_COUNTER, params![write.facet.id, name, delta])?;
            }
            tx.execute(
                "INSERT OR IGNORE INTO buffer_meta (facet_id, facet) VALUES (?1, ?2)",
                params![write.facet.id, facet_json],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO buffer_dirty (facet_id) VALUES (?1)",
                params![write.facet.id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl StatsStore for SqliteBackend {
    async fn create_if_absent(&self, facet_id: &str, record: &StatsRecord) -> Result<bool, BackendError> {
        let vals = serde_json::to_string(&record.values)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO stats (bucket, facet_id, facet_parent_id, facet, last_id, vals)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(bucket, facet_id) DO NOTHING",
            params![self.bucket, facet_id, record.facet_parent_id, record.facet, record.lineage_token, vals],
        )?;
        Ok(changed == 1)
    }

    async fn get(&self, facet_id: &str) -> Result<Option<StatsRecord>, BackendError> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT facet_parent_id, facet, last_id, vals FROM stats WHERE bucket = ?1 AND facet_id = ?2",
                params![self.bucket, facet_id],
                row_to_stats,
            )
            .optional()?
        };
        row.map(into_stats).transpose()
    }

    async fn update_if(
        &self,
        facet_id: &str,
        expected_lineage: &str,
        lineage_token: &str,
        values: &CounterMap,
    ) -> Result<bool, BackendError> {
        let vals = serde_json::to_string(values)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE stats SET last_id = ?1, vals = ?2
             WHERE bucket = ?3 AND facet_id = ?4 AND last_id = ?5",
            params![lineage_token, vals, self.bucket, facet_id, expected_lineage],
        )?;
        Ok(changed == 1)
    }

    async fn scan_children(
        &self,
        parent_id: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StatsRecord>, BackendError> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT facet_parent_id, facet, last_id, vals FROM stats
                 WHERE bucket = ?1 AND facet_parent_id = ?2 AND (?3 IS NULL OR facet > ?3)
                 ORDER BY facet LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![self.bucket, parent_id, start_after, limit as i64],
                row_to_stats,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        rows.into_iter().map(into_stats).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn counters(pairs: &[(&str, i64)]) -> CounterMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn facet(id: &str) -> Facet {
        Facet {
            id: id.to_string(),
            parent_id: "root".to_string(),
            child: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_schema_and_wal() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("stats.db");
        let _backend = SqliteBackend::open(&db_path, "stats").unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        // Test: migrations are idempotent
        run_schema_migrations(&conn).unwrap();
    }

    #[tokio::test]
    async fn test_queue_roundtrip_across_handles() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("stats.db");
        let producer = SqliteBackend::open(&db_path, "stats").unwrap();
        let consumer = SqliteBackend::open(&db_path, "stats").unwrap().with_poll_interval(Duration::from_millis(5));

        producer.push("aggqueue", b"first".to_vec()).await.unwrap();
        producer.push("aggqueue", b"second".to_vec()).await.unwrap();
        producer.push("other", b"elsewhere".to_vec()).await.unwrap();

        assert_eq!(consumer.depth("aggqueue").await.unwrap(), 2);
        assert_eq!(consumer.pop("aggqueue", Duration::from_millis(10)).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(consumer.pop("aggqueue", Duration::from_millis(10)).await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(consumer.pop("aggqueue", Duration::from_millis(20)).await.unwrap(), None);
        assert_eq!(consumer.depth("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_completion_markers() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::open(dir.path().join("stats.db"), "stats").unwrap();

        backend.mark_complete("r1", Duration::from_secs(60)).await.unwrap();
        backend.mark_complete("r2", Duration::from_millis(0)).await.unwrap();

        assert!(backend.is_complete("r1").await.unwrap());
        assert!(!backend.is_complete("r2").await.unwrap());
        assert!(!backend.is_complete("r3").await.unwrap());
    }

    #[tokio::test]
    async fn test_buffer_read_and_clear() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::open(dir.path().join("stats.db"), "stats").unwrap();
        let f = facet("f1");

        backend
            .apply(&[FacetWrite { facet: f.clone(), deltas: counters(&[("views", 1), ("revenue", 4)]) }])
            .await
            .unwrap();
        backend
            .apply(&[FacetWrite { facet: f.clone(), deltas: counters(&[("views", 2)]) }])
            .await
            .unwrap();
        backend.increment("f2", &counters(&[("views", 7)])).await.unwrap();

        assert_eq!(backend.dirty_count().await.unwrap(), 1);
        assert_eq!(backend.list_dirty().await.unwrap(), vec!["f1".to_string()]);

        let entry = backend.read_and_clear("f1").await.unwrap();
        assert_eq!(entry.facet, Some(f));
        assert_eq!(entry.deltas, counters(&[("views", 3), ("revenue", 4)]));
        assert_eq!(backend.dirty_count().await.unwrap(), 0);

        // Test: counters without metadata come back as an orphan entry
        let orphan = backend.read_and_clear("f2").await.unwrap();
        assert!(orphan.facet.is_none());
        assert_eq!(orphan.deltas, counters(&[("views", 7)]));

        assert!(!backend.set_metadata_if_absent(&facet("f1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_buffer_add_saturates() {
        let dir = tempdir().unwrap();
        let backend = SqliteBackend::open(dir.path().join("stats.db"), "stats").unwrap();
        let f = facet("f1");

        backend
            .apply(&[FacetWrite { facet: f.clone(), deltas: counters(&[("views", i64::MAX)]) }])
            .await
            .unwrap();
        backend
            .apply(&[FacetWrite { facet: f.clone(), deltas: counters(&[("views", 1)]) }])
            .await
            .unwrap();
        backend.increment("f1", &counters(&[("views", 2), ("low", i64::MIN)])).await.unwrap();
        backend.increment("f1", &counters(&[("low", -1)])).await.unwrap();

        // Test: clamped values still read back as integers
        let entry = backend.read_and_clear("f1").await.unwrap();
        assert_eq!(entry.deltas, counters(&[("views", i64::MAX), ("low", i64::MIN)]));
    }

    #[tokio::test]
    async fn test_corrupt_metadata_keeps_counters() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("stats.db");
        let backend = SqliteBackend::open(&db_path, "stats").unwrap();

        backend
            .apply(&[FacetWrite { facet: facet("f1"), deltas: counters(&[("views", 3)]) }])
            .await
            .unwrap();
        let raw = Connection::open(&db_path).unwrap();
        raw.execute("UPDATE buffer_meta SET facet = 'not json' WHERE facet_id = 'f1'", [])
            .unwrap();

        let err = backend.read_and_clear("f1").await.unwrap_err();
        assert!(matches!(err, BackendError::Corrupt(_)));

        // Test: the failed read rolled back, nothing was drained
        assert_eq!(backend.list_dirty().await.unwrap(), vec!["f1".to_string()]);
        raw.execute("DELETE FROM buffer_meta WHERE facet_id = 'f1'", []).unwrap();
        let orphan = backend.read_and_clear("f1").await.unwrap();
        assert_eq!(orphan.deltas, counters(&[("views", 3)]));
    }

    #[tokio::test]
    async fn test_stats_cas_and_scan() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("stats.db");
        let backend = SqliteBackend::open(&db_path, "stats").unwrap();
        let other_bucket = SqliteBackend::open(&db_path, "other").unwrap();

        let record = StatsRecord {
            facet_parent_id: "p".into(),
            facet: "apple".into(),
            lineage_token: "t1".into(),
            values: counters(&[("views", 1)]),
        };

        assert!(backend.create_if_absent("f-apple", &record).await.unwrap());
        assert!(!backend.create_if_absent("f-apple", &record).await.unwrap());
        assert!(other_bucket.get("f-apple").await.unwrap().is_none());

        assert!(!backend.update_if("f-apple", "stale", "t2", &counters(&[("views", 5)])).await.unwrap());
        assert!(backend.update_if("f-apple", "t1", "t2", &counters(&[("views", 2)])).await.unwrap());

        let stored = backend.get("f-apple").await.unwrap().unwrap();
        assert_eq!(stored.lineage_token, "t2");
        assert_eq!(stored.values, counters(&[("views", 2)]));

        let banana = StatsRecord { facet: "banana".into(), ..record.clone() };
        backend.create_if_absent("f-banana", &banana).await.unwrap();

        let all = backend.scan_children("p", None, 10).await.unwrap();
        assert_eq!(all.iter().map(|r| r.facet.as_str()).collect::<Vec<_>>(), vec!["apple", "banana"]);
        let after = backend.scan_children("p", Some("apple"), 10).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].facet, "banana");
    }
}

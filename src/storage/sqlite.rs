//! SQLite persistence.
//!
//! Three tables, names taken from config:
//!
//! - change table: one row per [`ChangeRecord`], tagged with the run id of the
//!   process that recorded it. Sequence ids restart at 1 for every run; the
//!   row id gives the persisted order across runs.
//! - checkpoint table: the `initial` rows of every checkpoint.
//! - checkpoint-times table: one row per completed checkpoint.
//!
//! Prices and sizes are stored as TEXT so they round-trip exactly.

use super::PersistenceSink;
use crate::config::StorageConfig;
use crate::models::{BookChange, ChangeRecord, CheckpointMarker, Reason, Side};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

fn schema(tables: &StorageConfig) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {change} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    side TEXT,
    price TEXT NOT NULL,
    remaining TEXT NOT NULL,
    reason TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{change}_ts ON {change}(timestamp_ms);
CREATE UNIQUE INDEX IF NOT EXISTS idx_{change}_run_seq ON {change}(run_id, sequence_id);

CREATE TABLE IF NOT EXISTS {checkpoint} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    checkpoint_ms INTEGER NOT NULL,
    position INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    remaining TEXT NOT NULL,
    reason TEXT NOT NULL DEFAULT 'initial'
);

CREATE INDEX IF NOT EXISTS idx_{checkpoint}_ckp ON {checkpoint}(checkpoint_ms, position);

CREATE TABLE IF NOT EXISTS {times} (
    checkpoint_ms INTEGER PRIMARY KEY,
    row_count INTEGER NOT NULL
);
"#,
        change = tables.change_table,
        checkpoint = tables.checkpoint_table,
        times = tables.checkpoint_times_table,
    )
}

#[derive(Debug, Default)]
pub struct SinkStats {
    pub change_batches: AtomicU64,
    pub change_rows: AtomicU64,
    pub checkpoints: AtomicU64,
    pub checkpoint_rows: AtomicU64,
}

impl SinkStats {
    pub fn summary(&self) -> String {
        format!(
            "change_batches={} change_rows={} checkpoints={} checkpoint_rows={}",
            self.change_batches.load(Ordering::Relaxed),
            self.change_rows.load(Ordering::Relaxed),
            self.checkpoints.load(Ordering::Relaxed),
            self.checkpoint_rows.load(Ordering::Relaxed),
        )
    }
}

pub struct SqliteSink {
    conn: Mutex<Connection>,
    tables: StorageConfig,
    run_id: String,
    stats: SinkStats,
}

impl SqliteSink {
    /// Open (or create) the database at `config.database_path`.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let db_path = config.database_path.as_str();
        let path = Path::new(db_path);

        if let Some(parent) = path.parent() {
            if !parent.exists() && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database: {}", db_path))?;
        conn.execute_batch(PRAGMAS)?;

        let sink = Self::with_connection(conn, config.clone())?;
        info!(path = %db_path, run_id = %sink.run_id, "book store opened");
        Ok(sink)
    }

    /// In-memory database with default table names.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, StorageConfig::with_path(":memory:"))
    }

    fn with_connection(conn: Connection, tables: StorageConfig) -> Result<Self> {
        conn.execute_batch(&schema(&tables))
            .context("Failed to initialize schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            tables,
            run_id: Uuid::new_v4().to_string(),
            stats: SinkStats::default(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    // =========================================================================
    // Readers
    // =========================================================================

    /// Latest completed checkpoint captured at or before `at_ms`.
    pub fn latest_checkpoint_at_or_before(&self, at_ms: i64) -> Result<Option<CheckpointMarker>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT MAX(checkpoint_ms) FROM {} WHERE checkpoint_ms <= ?1",
            self.tables.checkpoint_times_table
        );
        let ts: Option<i64> = conn.query_row(&sql, params![at_ms], |row| row.get(0))?;
        Ok(ts.map(|timestamp_ms| CheckpointMarker { timestamp_ms }))
    }

    /// Rows of one checkpoint in capture order.
    pub fn load_checkpoint_rows(&self, marker: &CheckpointMarker) -> Result<Vec<BookChange>> {
        let conn = self.conn.lock();
        let sql = format!(
            r#"
            SELECT timestamp_ms, side, price, remaining, reason
            FROM {}
            WHERE checkpoint_ms = ?1
            ORDER BY position ASC
            "#,
            self.tables.checkpoint_table
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![marker.timestamp_ms], |row| {
            Ok(BookChange {
                timestamp_ms: row.get(0)?,
                side: Some(side_column(row, 1)?),
                price: decimal_column(row, 2)?,
                remaining: decimal_column(row, 3)?,
                reason: reason_column(row, 4)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Change rows with `from_ms <= timestamp_ms <= to_ms`, in persisted order.
    pub fn load_changes_between(&self, from_ms: i64, to_ms: i64) -> Result<Vec<ChangeRecord>> {
        let conn = self.conn.lock();
        let sql = format!(
            r#"
            SELECT sequence_id, timestamp_ms, side, price, remaining, reason
            FROM {}
            WHERE timestamp_ms >= ?1 AND timestamp_ms <= ?2
            ORDER BY id ASC
            "#,
            self.tables.change_table
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![from_ms, to_ms], |row| {
            let side: Option<String> = row.get(2)?;
            let side = match side {
                Some(s) => Some(
                    Side::from_str(&s)
                        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
                ),
                None => None,
            };
            Ok(ChangeRecord {
                sequence_id: row.get::<_, i64>(0)? as u64,
                timestamp_ms: row.get(1)?,
                side,
                price: decimal_column(row, 3)?,
                remaining: decimal_column(row, 4)?,
                reason: reason_column(row, 5)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Reason of the last connect or disconnect row stamped before `before_ms`.
    pub fn last_lifecycle_before(&self, before_ms: i64) -> Result<Option<Reason>> {
        let conn = self.conn.lock();
        let sql = format!(
            r#"
            SELECT reason
            FROM {}
            WHERE timestamp_ms < ?1 AND reason IN (?2, ?3)
            ORDER BY id DESC
            LIMIT 1
            "#,
            self.tables.change_table
        );
        let reason = conn
            .query_row(
                &sql,
                params![
                    before_ms,
                    Reason::Connect.as_str(),
                    Reason::Disconnect.as_str()
                ],
                |row| reason_column(row, 0),
            )
            .optional()?;
        Ok(reason)
    }

    pub fn change_count(&self) -> Result<u64> {
        self.count(&self.tables.change_table)
    }

    pub fn checkpoint_count(&self) -> Result<u64> {
        self.count(&self.tables.checkpoint_times_table)
    }

    fn count(&self, table: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl PersistenceSink for SqliteSink {
    fn append_changes(&self, batch: &[ChangeRecord]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let sql = format!(
                r#"
                INSERT INTO {} (
                    run_id, sequence_id, timestamp_ms, side, price, remaining, reason
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                self.tables.change_table
            );
            let mut stmt = tx.prepare(&sql)?;
            for record in batch {
                stmt.execute(params![
                    self.run_id,
                    record.sequence_id as i64,
                    record.timestamp_ms,
                    record.side.map(|s| s.as_str()),
                    record.price.to_string(),
                    record.remaining.to_string(),
                    record.reason.as_str(),
                ])?;
            }
        }
        tx.commit().context("Failed to commit change batch")?;

        self.stats.change_batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .change_rows
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        debug!(rows = batch.len(), "change batch stored");
        Ok(batch.len())
    }

    fn append_checkpoint_rows(
        &self,
        marker: &CheckpointMarker,
        rows: &[BookChange],
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stored = self.insert_checkpoint_rows(&tx, marker, rows)?;
        tx.commit().context("Failed to commit checkpoint rows")?;

        self.stats
            .checkpoint_rows
            .fetch_add(stored as u64, Ordering::Relaxed);
        Ok(stored)
    }

    fn append_checkpoint_marker(&self, marker: &CheckpointMarker, row_count: usize) -> Result<()> {
        let conn = self.conn.lock();
        self.insert_checkpoint_marker(&conn, marker, row_count)?;

        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn append_checkpoint(&self, marker: &CheckpointMarker, rows: &[BookChange]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let stored = self.insert_checkpoint_rows(&tx, marker, rows)?;
        // A taken timestamp fails here and rolls the rows back with it.
        self.insert_checkpoint_marker(&tx, marker, stored)?;
        tx.commit().context("Failed to commit checkpoint")?;

        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        self.stats
            .checkpoint_rows
            .fetch_add(stored as u64, Ordering::Relaxed);
        debug!(checkpoint_ms = marker.timestamp_ms, rows = stored, "checkpoint stored");
        Ok(stored)
    }
}

impl SqliteSink {
    fn insert_checkpoint_rows(
        &self,
        conn: &Connection,
        marker: &CheckpointMarker,
        rows: &[BookChange],
    ) -> Result<usize> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                checkpoint_ms, position, timestamp_ms, side, price, remaining, reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            self.tables.checkpoint_table
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut stored = 0;
        for (position, row) in rows.iter().enumerate() {
            // Checkpoint rows always describe a price level.
            let Some(side) = row.side else {
                continue;
            };
            stmt.execute(params![
                marker.timestamp_ms,
                position as i64,
                row.timestamp_ms,
                side.as_str(),
                row.price.to_string(),
                row.remaining.to_string(),
                row.reason.as_str(),
            ])?;
            stored += 1;
        }
        Ok(stored)
    }

    fn insert_checkpoint_marker(
        &self,
        conn: &Connection,
        marker: &CheckpointMarker,
        row_count: usize,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (checkpoint_ms, row_count) VALUES (?1, ?2)",
            self.tables.checkpoint_times_table
        );
        conn.execute(&sql, params![marker.timestamp_ms, row_count as i64])
            .with_context(|| format!("Failed to store checkpoint marker {}", marker.timestamp_ms))?;
        Ok(())
    }
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn side_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Side> {
    let text: String = row.get(idx)?;
    Side::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn reason_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Reason> {
    let text: String = row.get(idx)?;
    Reason::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn record(seq: u64, ts: i64, side: Side, price: &str, remaining: &str, reason: Reason) -> ChangeRecord {
        ChangeRecord::from_change(seq, BookChange::new(ts, side, dec(price), dec(remaining), reason))
    }

    #[test]
    fn test_change_batch_round_trip() {
        let sink = SqliteSink::open_memory().unwrap();
        let batch = vec![
            ChangeRecord::from_change(1, BookChange::lifecycle(100, Reason::Connect)),
            record(2, 110, Side::Bid, "100.5", "2.0", Reason::Place),
            record(3, 120, Side::Ask, "101.00000001", "0", Reason::Cancel),
        ];
        assert_eq!(sink.append_changes(&batch).unwrap(), 3);
        assert_eq!(sink.append_changes(&[]).unwrap(), 0);

        let loaded = sink.load_changes_between(0, i64::MAX).unwrap();
        assert_eq!(loaded, batch);
        assert_eq!(loaded[2].price.to_string(), "101.00000001");
        assert_eq!(sink.change_count().unwrap(), 3);

        let window = sink.load_changes_between(110, 115).unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].sequence_id, 2);
    }

    #[test]
    fn test_duplicate_sequence_rolls_back_whole_batch() {
        let sink = SqliteSink::open_memory().unwrap();
        sink.append_changes(&[record(1, 1, Side::Bid, "1", "1", Reason::Place)])
            .unwrap();

        let batch = vec![
            record(2, 2, Side::Bid, "1", "1", Reason::Place),
            record(1, 3, Side::Bid, "1", "1", Reason::Place),
        ];
        assert!(sink.append_changes(&batch).is_err());
        assert_eq!(sink.change_count().unwrap(), 1);
    }

    #[test]
    fn test_checkpoint_lookup() {
        let sink = SqliteSink::open_memory().unwrap();
        assert!(sink.latest_checkpoint_at_or_before(1_000).unwrap().is_none());

        for ts in [100, 500] {
            let marker = CheckpointMarker { timestamp_ms: ts };
            let rows = vec![
                BookChange::new(ts, Side::Bid, dec("99"), dec("1"), Reason::Initial),
                BookChange::new(ts, Side::Ask, dec("101"), dec("2"), Reason::Initial),
            ];
            assert_eq!(sink.append_checkpoint_rows(&marker, &rows).unwrap(), 2);
            sink.append_checkpoint_marker(&marker, rows.len()).unwrap();
        }

        let marker = sink.latest_checkpoint_at_or_before(499).unwrap().unwrap();
        assert_eq!(marker.timestamp_ms, 100);
        let marker = sink.latest_checkpoint_at_or_before(500).unwrap().unwrap();
        assert_eq!(marker.timestamp_ms, 500);

        let rows = sink.load_checkpoint_rows(&marker).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].side, Some(Side::Bid));
        assert!(rows.iter().all(|r| r.reason == Reason::Initial));
        assert_eq!(sink.checkpoint_count().unwrap(), 2);
    }

    #[test]
    fn test_checkpoint_at_taken_timestamp_leaves_no_rows() {
        let sink = SqliteSink::open_memory().unwrap();
        let marker = CheckpointMarker { timestamp_ms: 100 };

        let first = vec![BookChange::new(100, Side::Bid, dec("99"), dec("1"), Reason::Initial)];
        assert_eq!(sink.append_checkpoint(&marker, &first).unwrap(), 1);

        let second = vec![
            BookChange::new(100, Side::Bid, dec("98"), dec("3"), Reason::Initial),
            BookChange::new(100, Side::Ask, dec("102"), dec("1"), Reason::Initial),
        ];
        assert!(sink.append_checkpoint(&marker, &second).is_err());

        let rows = sink.load_checkpoint_rows(&marker).unwrap();
        assert_eq!(rows, first);
        assert_eq!(sink.checkpoint_count().unwrap(), 1);
        assert_eq!(sink.stats().checkpoints.load(Ordering::Relaxed), 1);
        assert_eq!(sink.stats().checkpoint_rows.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_last_lifecycle_before() {
        let sink = SqliteSink::open_memory().unwrap();
        assert_eq!(sink.last_lifecycle_before(1_000).unwrap(), None);

        sink.append_changes(&[
            ChangeRecord::from_change(1, BookChange::lifecycle(100, Reason::Connect)),
            record(2, 150, Side::Bid, "1", "1", Reason::Place),
            ChangeRecord::from_change(3, BookChange::lifecycle(200, Reason::Disconnect)),
            ChangeRecord::from_change(4, BookChange::lifecycle(300, Reason::Connect)),
        ])
        .unwrap();

        assert_eq!(sink.last_lifecycle_before(100).unwrap(), None);
        assert_eq!(sink.last_lifecycle_before(160).unwrap(), Some(Reason::Connect));
        assert_eq!(sink.last_lifecycle_before(201).unwrap(), Some(Reason::Disconnect));
        assert_eq!(sink.last_lifecycle_before(301).unwrap(), Some(Reason::Connect));
    }

    #[test]
    fn test_open_on_disk_with_custom_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::with_path(
            dir.path().join("nested").join("book.db").to_string_lossy().to_string(),
        );
        config.change_table = "btc_changes".into();

        let first_run = {
            let sink = SqliteSink::open(&config).unwrap();
            sink.append_changes(&[record(1, 1, Side::Bid, "1", "1", Reason::Place)])
                .unwrap();
            sink.run_id().to_string()
        };

        // A second run restarts sequence ids without colliding.
        let sink = SqliteSink::open(&config).unwrap();
        assert_ne!(sink.run_id(), first_run);
        sink.append_changes(&[record(1, 2, Side::Ask, "2", "1", Reason::Place)])
            .unwrap();
        assert_eq!(sink.change_count().unwrap(), 2);
        let loaded = sink.load_changes_between(0, 10).unwrap();
        assert_eq!(loaded[1].side, Some(Side::Ask));
    }
}

//! Storage layer for the usage meter.
//!
//! Persists the usage ledger and the sync watermarks using `rusqlite`.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! The agent keeps its single `Database` inside the engine's mutex; short-lived
//! commands such as `um status` open their own connection.
//!
//! # Durability
//!
//! The database runs in WAL mode with `synchronous = FULL`, so a committed
//! transaction survives power loss. Every mutating method is one transaction:
//! it either fully applies and is durable when it returns, or applies nothing.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 UTC with millisecond precision
//! (e.g., `2024-01-15T10:30:00.000Z`), so lexicographic ordering matches
//! chronological ordering. Days in `ledger_daily` are local calendar dates
//! (`YYYY-MM-DD`) of the instant the credit was made.
//!
//! ## Seconds
//!
//! Counters are unsigned in the API and stored as SQLite INTEGER (i64).
//! Values that do not fit are rejected rather than wrapped.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use um_core::{DeltaEntry, FlushRecord, TrackingKey, UsageStore, UsageTotals};

/// How many flush attempts are kept for status reporting.
const FLUSH_LOG_RETENTION: i64 = 500;

/// How long a write waits on another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A counter does not fit in an SQLite integer, or a stored one is negative.
    #[error("seconds value out of range: {0}")]
    SecondsOutOfRange(String),
    /// A stored key failed validation.
    #[error("invalid tracking key in database: {0:?}")]
    InvalidKey(String),
    /// Acknowledging would move a watermark past the ledger total.
    #[error("watermark for {key} would exceed ledger total ({watermark} > {total})")]
    WatermarkAhead { key: String, watermark: u64, total: u64 },
    /// Failed to parse a stored timestamp.
    #[error("invalid timestamp in database: {timestamp}")]
    TimestampParse {
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// A key's usage summed over a range of days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyUsage {
    pub key: TrackingKey,
    pub seconds: u64,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;
        self.conn.execute_batch(
            "
            -- Cumulative seconds observed per tracking key. Never decremented.
            CREATE TABLE IF NOT EXISTS ledger (
                key TEXT PRIMARY KEY,
                seconds INTEGER NOT NULL DEFAULT 0 CHECK (seconds >= 0),
                first_seen_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Cumulative seconds acknowledged by the collector per key.
            CREATE TABLE IF NOT EXISTS watermarks (
                key TEXT PRIMARY KEY,
                seconds INTEGER NOT NULL DEFAULT 0 CHECK (seconds >= 0),
                updated_at TEXT NOT NULL,
                FOREIGN KEY (key) REFERENCES ledger(key) ON DELETE CASCADE
            );

            -- Per local day breakdown of the ledger, for reports.
            CREATE TABLE IF NOT EXISTS ledger_daily (
                day TEXT NOT NULL,
                key TEXT NOT NULL,
                seconds INTEGER NOT NULL DEFAULT 0 CHECK (seconds >= 0),
                PRIMARY KEY (day, key),
                FOREIGN KEY (key) REFERENCES ledger(key) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_daily_key ON ledger_daily(key);

            CREATE TABLE IF NOT EXISTS flush_log (
                batch_id TEXT PRIMARY KEY,
                attempted_at TEXT NOT NULL,
                entries INTEGER NOT NULL,
                seconds INTEGER NOT NULL,
                delivered INTEGER NOT NULL,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_flush_log_attempted ON flush_log(attempted_at);
            ",
        )?;
        Ok(())
    }

    /// Sums each key's usage over the local days `from..=to`.
    ///
    /// Ordered by seconds descending, then key.
    pub fn daily_usage(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyUsage>, DbError> {
        if to < from {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "
            SELECT key, SUM(seconds) AS total
            FROM ledger_daily
            WHERE day >= ? AND day <= ?
            GROUP BY key
            HAVING total > 0
            ORDER BY total DESC, key ASC
            ",
        )?;
        let rows = stmt.query_map([format_day(from), format_day(to)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut usage = Vec::new();
        for row in rows {
            let (key, seconds) = row?;
            usage.push(DailyUsage {
                key: parse_key(key)?,
                seconds: from_sql_seconds(seconds)?,
            });
        }
        Ok(usage)
    }

    /// The most recent flush attempt, if any.
    pub fn last_flush(&self) -> Result<Option<FlushRecord>, DbError> {
        self.query_last_flush(
            "SELECT batch_id, attempted_at, entries, seconds, delivered, error
             FROM flush_log ORDER BY attempted_at DESC, rowid DESC LIMIT 1",
        )
    }

    /// The most recent delivered flush, if any.
    pub fn last_delivered_flush(&self) -> Result<Option<FlushRecord>, DbError> {
        self.query_last_flush(
            "SELECT batch_id, attempted_at, entries, seconds, delivered, error
             FROM flush_log WHERE delivered = 1 ORDER BY attempted_at DESC, rowid DESC LIMIT 1",
        )
    }

    fn query_last_flush(&self, sql: &str) -> Result<Option<FlushRecord>, DbError> {
        let row = self
            .conn
            .query_row(sql, [], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .optional()?;
        let Some((batch_id, attempted_at, entries, seconds, delivered, error)) = row else {
            return Ok(None);
        };
        Ok(Some(FlushRecord {
            batch_id,
            attempted_at: parse_timestamp(&attempted_at)?,
            entries: usize::try_from(entries)
                .map_err(|_| DbError::SecondsOutOfRange(entries.to_string()))?,
            seconds: from_sql_seconds(seconds)?,
            delivered,
            error,
        }))
    }

    /// Deletes all ledger, watermark, daily and flush history rows.
    ///
    /// Returns the number of keys removed.
    pub fn reset(&mut self) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM watermarks", [])?;
        tx.execute("DELETE FROM ledger_daily", [])?;
        let removed = tx.execute("DELETE FROM ledger", [])?;
        tx.execute("DELETE FROM flush_log", [])?;
        tx.commit()?;
        Ok(removed)
    }
}

impl UsageStore for Database {
    type Error = DbError;

    fn credit(&mut self, key: &TrackingKey, seconds: u64, at: DateTime<Utc>) -> Result<u64, DbError> {
        let tx = self.conn.transaction()?;
        if seconds > 0 {
            let delta = to_sql_seconds(seconds)?;
            let now = format_timestamp(at);
            let day = format_day(at.with_timezone(&Local).date_naive());
            tx.execute(
                "
                INSERT INTO ledger (key, seconds, first_seen_at, updated_at)
                VALUES (?1, ?2, ?3, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    seconds = seconds + excluded.seconds,
                    updated_at = excluded.updated_at
                ",
                params![key.as_str(), delta, now],
            )?;
            tx.execute(
                "
                INSERT INTO ledger_daily (day, key, seconds)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(day, key) DO UPDATE SET seconds = seconds + excluded.seconds
                ",
                params![day, key.as_str(), delta],
            )?;
        }
        let total: Option<i64> = tx
            .query_row(
                "SELECT seconds FROM ledger WHERE key = ?",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        tx.commit()?;
        from_sql_seconds(total.unwrap_or(0))
    }

    fn usage(&self) -> Result<Vec<UsageTotals>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT l.key, l.seconds, COALESCE(w.seconds, 0)
            FROM ledger l
            LEFT JOIN watermarks w ON w.key = l.key
            ORDER BY l.key ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut usage = Vec::new();
        for row in rows {
            let (key, seconds, acknowledged) = row?;
            usage.push(UsageTotals {
                key: parse_key(key)?,
                seconds: from_sql_seconds(seconds)?,
                acknowledged: from_sql_seconds(acknowledged)?,
            });
        }
        Ok(usage)
    }

    fn acknowledge(&mut self, entries: &[DeltaEntry], at: DateTime<Utc>) -> Result<(), DbError> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = format_timestamp(at);
        let tx = self.conn.transaction()?;
        for entry in entries {
            let total: Option<i64> = tx
                .query_row(
                    "SELECT seconds FROM ledger WHERE key = ?",
                    [entry.key.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let acknowledged: Option<i64> = tx
                .query_row(
                    "SELECT seconds FROM watermarks WHERE key = ?",
                    [entry.key.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let total = from_sql_seconds(total.unwrap_or(0))?;
            let watermark = from_sql_seconds(acknowledged.unwrap_or(0))?
                .checked_add(entry.seconds)
                .ok_or_else(|| DbError::SecondsOutOfRange(entry.seconds.to_string()))?;
            if watermark > total {
                // Dropping the transaction rolls back earlier entries.
                return Err(DbError::WatermarkAhead {
                    key: entry.key.to_string(),
                    watermark,
                    total,
                });
            }
            tx.execute(
                "
                INSERT INTO watermarks (key, seconds, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    seconds = excluded.seconds,
                    updated_at = excluded.updated_at
                ",
                params![entry.key.as_str(), to_sql_seconds(watermark)?, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn record_flush(&mut self, attempt: &FlushRecord) -> Result<(), DbError> {
        let entries = i64::try_from(attempt.entries)
            .map_err(|_| DbError::SecondsOutOfRange(attempt.entries.to_string()))?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "
            INSERT OR REPLACE INTO flush_log
            (batch_id, attempted_at, entries, seconds, delivered, error)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
            params![
                attempt.batch_id,
                format_timestamp(attempt.attempted_at),
                entries,
                to_sql_seconds(attempt.seconds)?,
                attempt.delivered,
                attempt.error,
            ],
        )?;
        tx.execute(
            "
            DELETE FROM flush_log WHERE rowid NOT IN (
                SELECT rowid FROM flush_log ORDER BY attempted_at DESC, rowid DESC LIMIT ?
            )
            ",
            [FLUSH_LOG_RETENTION],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn parse_key(key: String) -> Result<TrackingKey, DbError> {
    TrackingKey::new(key.clone()).map_err(|_| DbError::InvalidKey(key))
}

fn to_sql_seconds(seconds: u64) -> Result<i64, DbError> {
    i64::try_from(seconds).map_err(|_| DbError::SecondsOutOfRange(seconds.to_string()))
}

fn from_sql_seconds(seconds: i64) -> Result<u64, DbError> {
    u64::try_from(seconds).map_err(|_| DbError::SecondsOutOfRange(seconds.to_string()))
}

fn parse_timestamp(timestamp: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use chrono::{Duration as ChronoDuration, TimeZone};

    #[test]
    fn open_in_memory_database() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn schema_matches_data_model() {
        let db = Database::open_in_memory().expect("open in-memory db");

        assert_eq!(
            table_columns(&db.conn, "ledger"),
            vec!["key", "seconds", "first_seen_at", "updated_at"]
        );
        assert_eq!(
            table_columns(&db.conn, "watermarks"),
            vec!["key", "seconds", "updated_at"]
        );
        assert_eq!(
            table_columns(&db.conn, "ledger_daily"),
            vec!["day", "key", "seconds"]
        );
        assert_eq!(
            table_columns(&db.conn, "flush_log"),
            vec![
                "batch_id",
                "attempted_at",
                "entries",
                "seconds",
                "delivered",
                "error"
            ]
        );

        assert!(index_names(&db.conn, "ledger_daily").contains("idx_ledger_daily_key"));
        assert!(index_names(&db.conn, "flush_log").contains("idx_flush_log_attempted"));
    }

    #[test]
    fn open_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("usage.db");
        {
            let mut db = Database::open(&path).unwrap();
            db.credit(&key("a.com"), 5, t0()).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.usage().unwrap(), vec![totals("a.com", 5, 0)]);
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    fn index_names(conn: &Connection, table: &str) -> HashSet<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({table})"))
            .expect("prepare index_list");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query index_list");
        rows.map(|row| row.expect("index_list row")).collect()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    fn key(s: &str) -> TrackingKey {
        TrackingKey::new(s).unwrap()
    }

    fn totals(k: &str, seconds: u64, acknowledged: u64) -> UsageTotals {
        UsageTotals {
            key: key(k),
            seconds,
            acknowledged,
        }
    }

    fn delta(k: &str, seconds: u64) -> DeltaEntry {
        DeltaEntry {
            key: key(k),
            seconds,
        }
    }

    fn local_day(at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&Local).date_naive()
    }

    #[test]
    fn credit_creates_entries_lazily_and_accumulates() {
        let mut db = Database::open_in_memory().unwrap();
        assert!(db.usage().unwrap().is_empty());

        assert_eq!(db.credit(&key("a.com"), 10, t0()).unwrap(), 10);
        assert_eq!(db.credit(&key("a.com"), 5, t0()).unwrap(), 15);
        assert_eq!(db.credit(&key("b.com"), 7, t0()).unwrap(), 7);

        assert_eq!(
            db.usage().unwrap(),
            vec![totals("a.com", 15, 0), totals("b.com", 7, 0)]
        );
    }

    #[test]
    fn zero_second_credit_writes_nothing() {
        let mut db = Database::open_in_memory().unwrap();
        assert_eq!(db.credit(&key("a.com"), 0, t0()).unwrap(), 0);
        assert!(db.usage().unwrap().is_empty());

        db.credit(&key("a.com"), 4, t0()).unwrap();
        assert_eq!(db.credit(&key("a.com"), 0, t0()).unwrap(), 4);
    }

    #[test]
    fn credit_rejects_values_beyond_sqlite_range() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db.credit(&key("a.com"), u64::MAX, t0()).unwrap_err();
        assert!(matches!(err, DbError::SecondsOutOfRange(_)));
        assert!(db.usage().unwrap().is_empty());
    }

    #[test]
    fn acknowledge_advances_by_exact_delta() {
        let mut db = Database::open_in_memory().unwrap();
        db.credit(&key("a.com"), 15, t0()).unwrap();
        db.acknowledge(&[delta("a.com", 15)], t0()).unwrap();

        // Ledger grew while a request was in flight.
        db.credit(&key("a.com"), 5, t0()).unwrap();
        assert_eq!(db.usage().unwrap(), vec![totals("a.com", 20, 15)]);

        db.acknowledge(&[delta("a.com", 5)], t0()).unwrap();
        assert_eq!(db.usage().unwrap(), vec![totals("a.com", 20, 20)]);
    }

    #[test]
    fn acknowledge_past_ledger_rolls_back_whole_batch() {
        let mut db = Database::open_in_memory().unwrap();
        db.credit(&key("a.com"), 10, t0()).unwrap();
        db.credit(&key("b.com"), 10, t0()).unwrap();

        let err = db
            .acknowledge(&[delta("a.com", 10), delta("b.com", 11)], t0())
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::WatermarkAhead {
                watermark: 11,
                total: 10,
                ..
            }
        ));
        assert_eq!(
            db.usage().unwrap(),
            vec![totals("a.com", 10, 0), totals("b.com", 10, 0)]
        );
    }

    #[test]
    fn acknowledge_unknown_key_is_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        let err = db.acknowledge(&[delta("ghost.com", 1)], t0()).unwrap_err();
        assert!(matches!(err, DbError::WatermarkAhead { total: 0, .. }));
    }

    #[test]
    fn daily_usage_sums_range_and_orders_by_time() {
        let mut db = Database::open_in_memory().unwrap();
        let day_one = t0();
        let day_two = t0() + ChronoDuration::days(1);
        db.credit(&key("a.com"), 60, day_one).unwrap();
        db.credit(&key("b.com"), 30, day_one).unwrap();
        db.credit(&key("b.com"), 90, day_two).unwrap();

        let both = db
            .daily_usage(local_day(day_one), local_day(day_two))
            .unwrap();
        assert_eq!(
            both,
            vec![
                DailyUsage {
                    key: key("b.com"),
                    seconds: 120
                },
                DailyUsage {
                    key: key("a.com"),
                    seconds: 60
                },
            ]
        );

        let first = db
            .daily_usage(local_day(day_one), local_day(day_one))
            .unwrap();
        assert_eq!(first[0].key, key("a.com"));
        assert_eq!(first[1].seconds, 30);

        assert!(
            db.daily_usage(local_day(day_two), local_day(day_one))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn flush_log_reports_latest_attempts() {
        let mut db = Database::open_in_memory().unwrap();
        assert_eq!(db.last_flush().unwrap(), None);

        let delivered = FlushRecord {
            batch_id: "batch-1".to_string(),
            attempted_at: t0(),
            entries: 2,
            seconds: 30,
            delivered: true,
            error: None,
        };
        let failed = FlushRecord {
            batch_id: "batch-2".to_string(),
            attempted_at: t0() + ChronoDuration::minutes(1),
            entries: 2,
            seconds: 45,
            delivered: false,
            error: Some("status 502".to_string()),
        };
        db.record_flush(&delivered).unwrap();
        db.record_flush(&failed).unwrap();

        assert_eq!(db.last_flush().unwrap(), Some(failed));
        assert_eq!(db.last_delivered_flush().unwrap(), Some(delivered));
    }

    #[test]
    fn flush_log_is_pruned() {
        let mut db = Database::open_in_memory().unwrap();
        for i in 0..(FLUSH_LOG_RETENTION + 10) {
            db.record_flush(&FlushRecord {
                batch_id: format!("batch-{i}"),
                attempted_at: t0() + ChronoDuration::seconds(i),
                entries: 1,
                seconds: 1,
                delivered: true,
                error: None,
            })
            .unwrap();
        }
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM flush_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, FLUSH_LOG_RETENTION);
        let latest = db.last_flush().unwrap().unwrap();
        assert_eq!(latest.batch_id, format!("batch-{}", FLUSH_LOG_RETENTION + 9));
    }

    #[test]
    fn reset_clears_everything() {
        let mut db = Database::open_in_memory().unwrap();
        db.credit(&key("a.com"), 10, t0()).unwrap();
        db.credit(&key("b.com"), 10, t0()).unwrap();
        db.acknowledge(&[delta("a.com", 10)], t0()).unwrap();

        assert_eq!(db.reset().unwrap(), 2);
        assert!(db.usage().unwrap().is_empty());
        assert!(
            db.daily_usage(local_day(t0()), local_day(t0()))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn timestamps_round_trip_through_text() {
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(format_timestamp(at), "2025-01-15T10:30:00.000Z");
        assert_eq!(parse_timestamp(&format_timestamp(at)).unwrap(), at);
        assert!(parse_timestamp("yesterday").is_err());
    }
}

//! SQLite store for targets, raw samples, roll-ups, and events.
//!
//! Raw sample `time` is unix epoch milliseconds; roll-up `bucket` is unix
//! epoch seconds aligned to the level's width. All bucketing is integer
//! arithmetic done inside SQLite.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Raw samples are kept for 3 days.
pub const RAW_RETENTION_DAYS: i64 = 3;
/// Minute aggregates are kept for 30 days.
pub const MINUTE_RETENTION_DAYS: i64 = 30;
/// Hour aggregates are never purged.
///
/// Minute roll-up runs every 5 minutes and never materialises the current,
/// still-filling bucket; hour roll-up trails by a full hour.
pub const MINUTE_ROLLUP_INTERVAL_SECS: u64 = 300;
pub const MINUTE_END_OFFSET_SECS: i64 = 60;
pub const HOUR_END_OFFSET_SECS: i64 = 3600;
/// Each roll-up pass re-covers this much time behind the last materialised
/// bucket so late or out-of-order inserts are folded in.
pub const ROLLUP_LOOKBACK_SECS: i64 = 600;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("duplicate row")]
    Duplicate,
    #[error("not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn datetime_from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn datetime_from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

fn target_from_row(row: &rusqlite::Row<'_>) -> SqlResult<MonitorTarget> {
    let created_ms: i64 = row.get(6)?;
    let deleted_ms: Option<i64> = row.get(7)?;
    Ok(MonitorTarget {
        id: row.get(0)?,
        ip: row.get(1)?,
        frequency_seconds: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        url: row.get(4)?,
        notes: row.get(5)?,
        created_at: datetime_from_ms(created_ms),
        deleted_at: deleted_ms.map(datetime_from_ms),
    })
}

fn sample_from_row(row: &rusqlite::Row<'_>) -> SqlResult<PingSample> {
    let time_ms: i64 = row.get(0)?;
    Ok(PingSample {
        time: datetime_from_ms(time_ms),
        target_id: row.get(1)?,
        latency_ms: row.get(2)?,
        hops: row.get(3)?,
        packet_loss: row.get::<_, i64>(4)? != 0,
    })
}

fn aggregate_from_row(row: &rusqlite::Row<'_>) -> SqlResult<AggregateRow> {
    Ok(AggregateRow {
        bucket: row.get(0)?,
        target_id: row.get(1)?,
        avg_latency: row.get(2)?,
        min_latency: row.get(3)?,
        max_latency: row.get(4)?,
        loss_count: row.get(5)?,
        samples: row.get(6)?,
    })
}

const TARGET_COLS: &str =
    "id, ip, frequency_seconds, is_active, url, notes, created_at, deleted_at";

impl Store {
    /// Open (or create) the database at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| DbError::Migration(format!("schema init failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; nothing to salvage.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Targets ---

    /// Insert a new target. The IP must be unique across all rows,
    /// including soft-deleted ones.
    pub fn add_target(
        &self,
        ip: &str,
        frequency_seconds: i64,
        url: Option<&str>,
        notes: Option<&str>,
    ) -> Result<MonitorTarget, DbError> {
        let created_at = Utc::now();
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT INTO monitor_targets (ip, frequency_seconds, is_active, url, notes, created_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5)",
            params![ip, frequency_seconds, url, notes, created_at.timestamp_millis()],
        );
        match inserted {
            Ok(_) => Ok(MonitorTarget {
                id: conn.last_insert_rowid(),
                ip: ip.to_string(),
                frequency_seconds,
                is_active: true,
                url: url.map(str::to_string),
                notes: notes.map(str::to_string),
                created_at,
                deleted_at: None,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(DbError::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_target(&self, id: i64) -> Result<MonitorTarget, DbError> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {TARGET_COLS} FROM monitor_targets WHERE id = ?1"),
            params![id],
            target_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// All targets, including paused and soft-deleted rows.
    pub fn get_targets(&self) -> Result<Vec<MonitorTarget>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TARGET_COLS} FROM monitor_targets ORDER BY id ASC"
        ))?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Targets the scheduler should be running loops for.
    pub fn get_active_targets(&self) -> Result<Vec<MonitorTarget>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TARGET_COLS} FROM monitor_targets
             WHERE is_active = 1 AND deleted_at IS NULL ORDER BY id ASC"
        ))?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Write the mutable metadata of an existing target.
    pub fn update_target(&self, target: &MonitorTarget) -> Result<(), DbError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE monitor_targets SET frequency_seconds = ?1, url = ?2, notes = ?3 WHERE id = ?4",
            params![target.frequency_seconds, target.url, target.notes, target.id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn set_target_active(&self, id: i64, active: bool) -> Result<(), DbError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE monitor_targets SET is_active = ?1 WHERE id = ?2",
            params![active as i64, id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Soft-delete: the row stays for history, further resumes must fail.
    pub fn mark_target_deleted(&self, id: i64, when: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE monitor_targets SET is_active = 0, deleted_at = ?1 WHERE id = ?2",
            params![when.timestamp_millis(), id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Raw samples ---

    /// Idempotent on `(time, target_id)`: a duplicate insert is a no-op.
    pub fn insert_sample(&self, sample: &PingSample) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO ping_logs (time, target_id, latency_ms, hops, packet_loss)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sample.time.timestamp_millis(),
                sample.target_id,
                sample.latency_ms,
                sample.hops,
                sample.packet_loss as i64,
            ],
        )?;
        Ok(())
    }

    /// Batch insert, atomic per batch, same idempotency as `insert_sample`.
    pub fn insert_samples(&self, samples: &[PingSample]) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO ping_logs (time, target_id, latency_ms, hops, packet_loss)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for s in samples {
                stmt.execute(params![
                    s.time.timestamp_millis(),
                    s.target_id,
                    s.latency_ms,
                    s.hops,
                    s.packet_loss as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Raw samples oldest-first, at most `limit` (clamped to [1, 1000]).
    pub fn query_raw(
        &self,
        target_id: i64,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<PingSample>, DbError> {
        let limit = limit.clamp(1, 1000);
        let since_ms = since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, latency_ms, hops, packet_loss FROM ping_logs
             WHERE target_id = ?1 AND time >= ?2 ORDER BY time ASC LIMIT ?3",
        )?;
        let samples = stmt
            .query_map(params![target_id, since_ms, limit as i64], sample_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// Raw samples in the half-open interval `[from, to)`, oldest-first.
    pub fn query_raw_range(
        &self,
        target_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PingSample>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, latency_ms, hops, packet_loss FROM ping_logs
             WHERE target_id = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC",
        )?;
        let samples = stmt
            .query_map(
                params![target_id, from.timestamp_millis(), to.timestamp_millis()],
                sample_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    /// One page of the raw-sample cursor: samples with `time` strictly after
    /// `after_ms`, oldest-first. Backs the streaming CSV export.
    pub fn raw_page(
        &self,
        target_id: i64,
        after_ms: i64,
        limit: usize,
    ) -> Result<Vec<PingSample>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT time, target_id, latency_ms, hops, packet_loss FROM ping_logs
             WHERE target_id = ?1 AND time > ?2 ORDER BY time ASC LIMIT ?3",
        )?;
        let samples = stmt
            .query_map(params![target_id, after_ms, limit as i64], sample_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    // --- Aggregate reads ---

    /// Pick the coarsest level whose native bucket fits the requested width
    /// and whose retention still covers `from`.
    pub fn resolve_resolution(
        bucket_seconds: i64,
        from: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Resolution {
        let age = now.signed_duration_since(from);
        if bucket_seconds < 60 && age <= ChronoDuration::days(RAW_RETENTION_DAYS) {
            Resolution::Raw
        } else if bucket_seconds < 3600 && age <= ChronoDuration::days(MINUTE_RETENTION_DAYS) {
            Resolution::Minute
        } else {
            Resolution::Hour
        }
    }

    /// Aggregate rows for `[from, to)` at the given resolution, oldest-first.
    ///
    /// `Raw` is served by grouping samples into one-second buckets;
    /// `Auto` resolves via [`Store::resolve_resolution`] using `bucket_seconds`.
    pub fn query_aggregate(
        &self,
        target_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        resolution: Resolution,
        bucket_seconds: i64,
    ) -> Result<Vec<AggregateRow>, DbError> {
        let resolution = match resolution {
            Resolution::Auto => Self::resolve_resolution(bucket_seconds, from, Utc::now()),
            r => r,
        };
        match resolution {
            Resolution::Raw => {
                let conn = self.lock();
                let mut stmt = conn.prepare(
                    "SELECT (time / 1000) AS bucket, target_id,
                            AVG(CASE WHEN packet_loss = 0 THEN latency_ms END),
                            MIN(CASE WHEN packet_loss = 0 THEN latency_ms END),
                            MAX(CASE WHEN packet_loss = 0 THEN latency_ms END),
                            SUM(packet_loss), COUNT(*)
                     FROM ping_logs
                     WHERE target_id = ?1 AND time >= ?2 AND time < ?3
                     GROUP BY bucket ORDER BY bucket ASC",
                )?;
                let rows = stmt
                    .query_map(
                        params![target_id, from.timestamp_millis(), to.timestamp_millis()],
                        aggregate_from_row,
                    )?
                    .collect::<SqlResult<Vec<_>>>()?;
                Ok(rows)
            }
            _ => {
                let table = if resolution == Resolution::Hour {
                    "ping_hour"
                } else {
                    "ping_minute"
                };
                let conn = self.lock();
                let mut stmt = conn.prepare(&format!(
                    "SELECT bucket, target_id, avg_latency, min_latency, max_latency,
                            loss_count, samples
                     FROM {table}
                     WHERE target_id = ?1 AND bucket >= ?2 AND bucket < ?3
                     ORDER BY bucket ASC"
                ))?;
                let rows = stmt
                    .query_map(
                        params![target_id, from.timestamp(), to.timestamp()],
                        aggregate_from_row,
                    )?
                    .collect::<SqlResult<Vec<_>>>()?;
                Ok(rows)
            }
        }
    }

    // --- Roll-up ---

    /// Recompute minute buckets covering `[from, to)` (epoch seconds, minute
    /// aligned) from raw samples. Upserts, so recomputation is idempotent.
    pub fn rollup_minute(&self, from_secs: i64, to_secs: i64) -> Result<usize, DbError> {
        let conn = self.lock();
        let changed = conn.execute(
            "INSERT INTO ping_minute
                 (bucket, target_id, avg_latency, min_latency, max_latency, loss_count, samples)
             SELECT (time / 1000 / 60) * 60 AS bucket, target_id,
                    AVG(CASE WHEN packet_loss = 0 THEN latency_ms END),
                    MIN(CASE WHEN packet_loss = 0 THEN latency_ms END),
                    MAX(CASE WHEN packet_loss = 0 THEN latency_ms END),
                    SUM(packet_loss), COUNT(*)
             FROM ping_logs
             WHERE time >= ?1 AND time < ?2
             GROUP BY bucket, target_id
             ON CONFLICT (bucket, target_id) DO UPDATE SET
                 avg_latency = excluded.avg_latency,
                 min_latency = excluded.min_latency,
                 max_latency = excluded.max_latency,
                 loss_count  = excluded.loss_count,
                 samples     = excluded.samples",
            params![from_secs * 1000, to_secs * 1000],
        )?;
        Ok(changed)
    }

    /// Recompute hour buckets covering `[from, to)` (epoch seconds, hour
    /// aligned) from minute aggregates. Averages are weighted by each minute
    /// bucket's non-loss sample count.
    pub fn rollup_hour(&self, from_secs: i64, to_secs: i64) -> Result<usize, DbError> {
        let conn = self.lock();
        let changed = conn.execute(
            "INSERT INTO ping_hour
                 (bucket, target_id, avg_latency, min_latency, max_latency, loss_count, samples)
             SELECT (bucket / 3600) * 3600 AS hour_bucket, target_id,
                    SUM(avg_latency * (samples - loss_count)) /
                        NULLIF(SUM(CASE WHEN avg_latency IS NOT NULL
                                        THEN samples - loss_count ELSE 0 END), 0),
                    MIN(min_latency),
                    MAX(max_latency),
                    SUM(loss_count), SUM(samples)
             FROM ping_minute
             WHERE bucket >= ?1 AND bucket < ?2
             GROUP BY hour_bucket, target_id
             ON CONFLICT (bucket, target_id) DO UPDATE SET
                 avg_latency = excluded.avg_latency,
                 min_latency = excluded.min_latency,
                 max_latency = excluded.max_latency,
                 loss_count  = excluded.loss_count,
                 samples     = excluded.samples",
            params![from_secs, to_secs],
        )?;
        Ok(changed)
    }

    pub fn last_minute_bucket(&self) -> Result<Option<i64>, DbError> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT MAX(bucket) FROM ping_minute", [], |r| r.get(0))?)
    }

    pub fn last_hour_bucket(&self) -> Result<Option<i64>, DbError> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT MAX(bucket) FROM ping_hour", [], |r| r.get(0))?)
    }

    pub fn earliest_raw_time(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.lock();
        let ms: Option<i64> = conn.query_row("SELECT MIN(time) FROM ping_logs", [], |r| r.get(0))?;
        Ok(ms.map(datetime_from_ms))
    }

    pub fn earliest_minute_bucket(&self) -> Result<Option<i64>, DbError> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT MIN(bucket) FROM ping_minute", [], |r| r.get(0))?)
    }

    // --- Retention ---

    pub fn delete_raw_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock();
        Ok(conn.execute(
            "DELETE FROM ping_logs WHERE time < ?1",
            params![cutoff.timestamp_millis()],
        )?)
    }

    pub fn delete_minute_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock();
        Ok(conn.execute(
            "DELETE FROM ping_minute WHERE bucket < ?1",
            params![cutoff.timestamp()],
        )?)
    }

    // --- Events ---

    pub fn add_event(
        &self,
        target_id: Option<i64>,
        event_type: EventType,
        message: &str,
    ) -> Result<i64, DbError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO event_logs (target_id, event_type, message, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                target_id,
                event_type.as_str(),
                message,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Event rows for a target, newest-first.
    pub fn get_events(&self, target_id: i64, limit: usize) -> Result<Vec<EventLog>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, target_id, event_type, message, created_at FROM event_logs
             WHERE target_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![target_id, limit as i64], |row| {
                let kind: String = row.get(2)?;
                let created_ms: i64 = row.get(4)?;
                Ok(EventLog {
                    id: row.get(0)?,
                    target_id: row.get(1)?,
                    event_type: EventType::parse(&kind).unwrap_or(EventType::Start),
                    message: row.get(3)?,
                    created_at: datetime_from_ms(created_ms),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }
}

/// Truncate an epoch-seconds instant down to a bucket boundary.
pub fn truncate_to_bucket(secs: i64, bucket_seconds: i64) -> i64 {
    secs - secs.rem_euclid(bucket_seconds)
}

/// Bucket start as a `DateTime` for response payloads.
pub fn bucket_start(secs: i64) -> DateTime<Utc> {
    datetime_from_secs(secs)
}

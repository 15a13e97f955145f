//! Roll-up manager: materialises minute and hour aggregates.
//!
//! Minute buckets are recomputed from raw samples every scheduling interval,
//! trailing live data by a one-minute end offset so a still-filling bucket is
//! never written. Hour buckets derive from minute buckets behind a one-hour
//! offset. Every pass re-covers a lookback window behind the last
//! materialised bucket, so late or out-of-order inserts are folded in.

use crate::db::{
    truncate_to_bucket, DbError, Store, HOUR_END_OFFSET_SECS, MINUTE_END_OFFSET_SECS,
    MINUTE_ROLLUP_INTERVAL_SECS, ROLLUP_LOOKBACK_SECS,
};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Periodic roll-up task for both aggregate levels.
pub struct RollupManager {
    store: Arc<Store>,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl RollupManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the background task. SQL passes run on the blocking pool so
    /// they never starve the probe loops.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, mut rx) = broadcast::channel(1);
            {
                let mut guard = stop.lock().await;
                *guard = Some(tx);
            }

            let mut interval =
                tokio::time::interval(Duration::from_secs(MINUTE_ROLLUP_INTERVAL_SECS));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let store = store.clone();
                        let outcome = tokio::task::spawn_blocking(move || {
                            run_rollup_pass(&store, Utc::now())
                        })
                        .await;
                        match outcome {
                            Ok(Err(e)) => tracing::error!("rollup pass failed: {}", e),
                            Err(e) => tracing::error!("rollup task panicked: {}", e),
                            Ok(Ok(())) => {}
                        }
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        let guard = self.stop.lock().await;
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// One roll-up pass over both levels at time `now`.
pub fn run_rollup_pass(store: &Store, now: DateTime<Utc>) -> Result<(), DbError> {
    let minute_end = truncate_to_bucket(now.timestamp() - MINUTE_END_OFFSET_SECS, 60);
    let minute_start = match store.last_minute_bucket()? {
        Some(last) => truncate_to_bucket(last - ROLLUP_LOOKBACK_SECS, 60),
        None => match store.earliest_raw_time()? {
            Some(t) => truncate_to_bucket(t.timestamp(), 60),
            None => return Ok(()),
        },
    };
    if minute_start < minute_end {
        let refreshed = store.rollup_minute(minute_start, minute_end)?;
        if refreshed > 0 {
            tracing::debug!("rollup: refreshed {} minute buckets", refreshed);
        }
    }

    let hour_end = truncate_to_bucket(now.timestamp() - HOUR_END_OFFSET_SECS, 3600);
    let hour_start = match store.last_hour_bucket()? {
        Some(last) => truncate_to_bucket(last - 3600, 3600),
        None => match store.earliest_minute_bucket()? {
            Some(bucket) => truncate_to_bucket(bucket, 3600),
            None => return Ok(()),
        },
    };
    if hour_start < hour_end {
        let refreshed = store.rollup_hour(hour_start, hour_end)?;
        if refreshed > 0 {
            tracing::debug!("rollup: refreshed {} hour buckets", refreshed);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PingSample, Resolution};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn at(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, s).unwrap()
    }

    #[test]
    fn test_pass_materialises_minute_and_hour_levels() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let t = store.add_target("192.0.2.60", 1, None, None).unwrap();

        store
            .insert_samples(&[
                PingSample::success(at(14, 10, 0, 0), t.id, 10.0, 56),
                PingSample::success(at(14, 10, 1, 0), t.id, 20.0, 56),
                PingSample::loss(at(14, 10, 59, 0), t.id),
            ])
            .unwrap();

        // Two hours later everything is past both end offsets.
        run_rollup_pass(&store, at(14, 12, 0, 30)).unwrap();

        let minutes = store
            .query_aggregate(t.id, at(14, 10, 0, 0), at(14, 11, 0, 0), Resolution::Minute, 60)
            .unwrap();
        assert_eq!(minutes.len(), 3);

        let hours = store
            .query_aggregate(t.id, at(14, 10, 0, 0), at(14, 11, 0, 0), Resolution::Hour, 3600)
            .unwrap();
        assert_eq!(hours.len(), 1);
        assert_eq!(hours[0].samples, 3);
        assert_eq!(hours[0].loss_count, 1);
        assert_eq!(hours[0].avg_latency, Some(15.0));
    }

    #[test]
    fn test_still_filling_minute_is_not_materialised() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let t = store.add_target("192.0.2.61", 1, None, None).unwrap();

        store
            .insert_samples(&[
                PingSample::success(at(14, 10, 0, 0), t.id, 10.0, 56),
                PingSample::success(at(14, 10, 2, 30), t.id, 20.0, 56),
            ])
            .unwrap();

        // 10:02 has not cleared the one-minute end offset at 10:02:45.
        run_rollup_pass(&store, at(14, 10, 2, 45)).unwrap();

        let minutes = store
            .query_aggregate(t.id, at(14, 10, 0, 0), at(14, 10, 5, 0), Resolution::Minute, 60)
            .unwrap();
        assert_eq!(minutes.len(), 1);
        assert_eq!(minutes[0].bucket, at(14, 10, 0, 0).timestamp());
    }

    #[test]
    fn test_late_insert_is_folded_in_by_next_pass() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let t = store.add_target("192.0.2.62", 1, None, None).unwrap();

        store
            .insert_sample(&PingSample::success(at(14, 10, 0, 0), t.id, 10.0, 56))
            .unwrap();
        run_rollup_pass(&store, at(14, 10, 5, 0)).unwrap();

        // A straggler lands in the already-materialised bucket.
        store
            .insert_sample(&PingSample::success(at(14, 10, 0, 30), t.id, 30.0, 56))
            .unwrap();
        run_rollup_pass(&store, at(14, 10, 10, 0)).unwrap();

        let minutes = store
            .query_aggregate(t.id, at(14, 10, 0, 0), at(14, 10, 1, 0), Resolution::Minute, 60)
            .unwrap();
        assert_eq!(minutes.len(), 1);
        assert_eq!(minutes[0].samples, 2);
        assert_eq!(minutes[0].avg_latency, Some(20.0));
    }

    #[test]
    fn test_empty_store_pass_is_a_noop() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        run_rollup_pass(&store, at(14, 12, 0, 0)).unwrap();
        assert!(store.last_minute_bucket().unwrap().is_none());
        assert!(store.last_hour_bucket().unwrap().is_none());
    }
}

//! Retention manager: drops rows that have aged out of their level.
//!
//! Raw samples live 3 days, minute aggregates 30 days. Hour aggregates are
//! the system of record for long-range history and are never purged.

use crate::db::{DbError, Store, MINUTE_RETENTION_DAYS, RAW_RETENTION_DAYS};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

const RETENTION_INTERVAL_SECS: u64 = 600;

/// Periodic retention task.
pub struct RetentionManager {
    store: Arc<Store>,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the background task; deletes run on the blocking pool.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, mut rx) = broadcast::channel(1);
            {
                let mut guard = stop.lock().await;
                *guard = Some(tx);
            }

            let mut interval = tokio::time::interval(Duration::from_secs(RETENTION_INTERVAL_SECS));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let store = store.clone();
                        let outcome = tokio::task::spawn_blocking(move || {
                            run_retention_pass(&store, Utc::now())
                        })
                        .await;
                        match outcome {
                            Ok(Err(e)) => tracing::error!("retention pass failed: {}", e),
                            Err(e) => tracing::error!("retention task panicked: {}", e),
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

/// One retention sweep at time `now`.
pub fn run_retention_pass(store: &Store, now: DateTime<Utc>) -> Result<(), DbError> {
    let raw_cutoff = now - ChronoDuration::days(RAW_RETENTION_DAYS);
    let purged_raw = store.delete_raw_before(raw_cutoff)?;

    let minute_cutoff = now - ChronoDuration::days(MINUTE_RETENTION_DAYS);
    let purged_minutes = store.delete_minute_before(minute_cutoff)?;

    if purged_raw > 0 || purged_minutes > 0 {
        tracing::info!(
            "retention: purged {} raw samples, {} minute buckets",
            purged_raw,
            purged_minutes
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PingSample, Resolution};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    #[test]
    fn test_pass_applies_per_level_cutoffs() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let t = store.add_target("192.0.2.70", 1, None, None).unwrap();

        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let fresh = now - ChronoDuration::hours(1);
        let stale_raw = now - ChronoDuration::days(4);
        let stale_minute = now - ChronoDuration::days(40);

        store
            .insert_samples(&[
                PingSample::success(fresh, t.id, 1.0, 60),
                PingSample::success(stale_raw, t.id, 2.0, 60),
                PingSample::success(stale_minute, t.id, 3.0, 60),
            ])
            .unwrap();
        // Materialise every level before aging out the sources.
        store
            .rollup_minute(stale_minute.timestamp() - 60, now.timestamp())
            .unwrap();
        store
            .rollup_hour(stale_minute.timestamp() - 3600, now.timestamp())
            .unwrap();

        run_retention_pass(&store, now).unwrap();

        // Only the fresh raw sample survives.
        let raws = store.query_raw(t.id, None, 100).unwrap();
        assert_eq!(raws.len(), 1);
        assert_eq!(raws[0].time, fresh);

        // The 40-day-old minute bucket is gone, the others remain.
        let minutes = store
            .query_aggregate(
                t.id,
                now - ChronoDuration::days(60),
                now,
                Resolution::Minute,
                60,
            )
            .unwrap();
        assert_eq!(minutes.len(), 2);

        // Hour buckets are never purged.
        let hours = store
            .query_aggregate(
                t.id,
                now - ChronoDuration::days(60),
                now,
                Resolution::Hour,
                3600,
            )
            .unwrap();
        assert_eq!(hours.len(), 3);
    }
}

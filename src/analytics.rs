//! Windowed analytics over the time-series store.
//!
//! Picks the cheapest resolution level that can answer a window, then
//! computes uptime, latency stats, percentiles, and a bucketed timeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{bucket_start, truncate_to_bucket, AggregateRow, DbError, Resolution, Store};

/// How the percentile fields were produced.
///
/// Exact percentiles need raw samples; once a window is served from
/// minute or hour aggregates only approximations are possible and the
/// response says so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PercentileMode {
    Exact,
    Approximate,
}

/// One timeline bucket in an insights response.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineBucket {
    pub bucket: DateTime<Utc>,
    pub avg_latency: Option<f64>,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub loss_count: i64,
    pub samples: i64,
}

/// Aggregated metrics for one target over a rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct Insights {
    pub target_id: i64,
    pub window_minutes: i64,
    /// Effective bucket width; coarser than requested when the window had
    /// to be served from minute or hour aggregates.
    pub bucket_seconds: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub resolution: Resolution,
    pub sample_count: i64,
    pub loss_count: i64,
    pub uptime_percent: Option<f64>,
    pub avg_latency: Option<f64>,
    pub min_latency: Option<f64>,
    pub max_latency: Option<f64>,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub percentile_mode: PercentileMode,
    pub timeline: Vec<TimelineBucket>,
}

/// Analytics engine: a thin, stateless view over the store.
#[derive(Clone)]
pub struct Analytics {
    store: Arc<Store>,
}

impl Analytics {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Compute insights for `[now - window_minutes, now]`, both ends aligned
    /// to `bucket_seconds`. Inputs are validated by the caller
    /// (`window_minutes` in [1, 1440], `bucket_seconds` >= 1).
    pub fn insights(
        &self,
        target_id: i64,
        window_minutes: i64,
        bucket_seconds: i64,
    ) -> Result<Insights, DbError> {
        self.insights_at(target_id, window_minutes, bucket_seconds, Utc::now())
    }

    /// Same as [`Analytics::insights`] with an explicit `now` for tests.
    pub fn insights_at(
        &self,
        target_id: i64,
        window_minutes: i64,
        bucket_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<Insights, DbError> {
        let end_secs = truncate_to_bucket(now.timestamp(), bucket_seconds);
        let start_secs = truncate_to_bucket(end_secs - window_minutes * 60, bucket_seconds);
        let window_start = bucket_start(start_secs);
        let window_end = bucket_start(end_secs);

        let resolution = Store::resolve_resolution(bucket_seconds, window_start, now);

        match resolution {
            Resolution::Raw => {
                self.raw_insights(target_id, window_minutes, bucket_seconds, window_start, window_end)
            }
            res => self.aggregate_insights(
                target_id,
                window_minutes,
                res,
                window_start,
                window_end,
            ),
        }
    }

    /// Exact path: every raw sample in the window is in hand.
    fn raw_insights(
        &self,
        target_id: i64,
        window_minutes: i64,
        bucket_seconds: i64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Insights, DbError> {
        let samples = self
            .store
            .query_raw_range(target_id, window_start, window_end)?;

        let sample_count = samples.len() as i64;
        let loss_count = samples.iter().filter(|s| s.packet_loss).count() as i64;

        let mut latencies: Vec<f64> = samples.iter().filter_map(|s| s.latency_ms).collect();
        latencies.sort_by(|a, b| a.total_cmp(b));

        let avg_latency = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        // Timeline: group samples into requested buckets, present buckets
        // only. Samples arrive oldest-first, so same-bucket rows are adjacent.
        let mut timeline: Vec<TimelineBucket> = Vec::new();
        for s in &samples {
            let bucket = truncate_to_bucket(s.time.timestamp(), bucket_seconds);
            match timeline.last_mut() {
                Some(slot) if slot.bucket.timestamp() == bucket => fold_sample(slot, s),
                _ => {
                    let mut slot = TimelineBucket {
                        bucket: bucket_start(bucket),
                        avg_latency: None,
                        min_latency: None,
                        max_latency: None,
                        loss_count: 0,
                        samples: 0,
                    };
                    fold_sample(&mut slot, s);
                    timeline.push(slot);
                }
            }
        }

        Ok(Insights {
            target_id,
            window_minutes,
            bucket_seconds,
            window_start,
            window_end,
            resolution: Resolution::Raw,
            sample_count,
            loss_count,
            uptime_percent: uptime(sample_count, loss_count),
            avg_latency,
            min_latency: latencies.first().copied(),
            max_latency: latencies.last().copied(),
            p50: percentile(&latencies, 0.50),
            p95: percentile(&latencies, 0.95),
            p99: percentile(&latencies, 0.99),
            percentile_mode: PercentileMode::Exact,
            timeline,
        })
    }

    /// Aggregate path: only bucketed summaries survive, so percentiles are
    /// approximations over the bucket distribution.
    fn aggregate_insights(
        &self,
        target_id: i64,
        window_minutes: i64,
        resolution: Resolution,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Insights, DbError> {
        let native = resolution.bucket_seconds();
        let rows = self.store.query_aggregate(
            target_id,
            window_start,
            window_end,
            resolution,
            native,
        )?;

        let sample_count: i64 = rows.iter().map(|r| r.samples).sum();
        let loss_count: i64 = rows.iter().map(|r| r.loss_count).sum();

        let (avg_latency, min_latency, max_latency) = weighted_stats(&rows);

        let mut bucket_avgs: Vec<f64> = rows.iter().filter_map(|r| r.avg_latency).collect();
        bucket_avgs.sort_by(|a, b| a.total_cmp(b));

        let timeline = rows
            .iter()
            .map(|r| TimelineBucket {
                bucket: bucket_start(r.bucket),
                avg_latency: r.avg_latency,
                min_latency: r.min_latency,
                max_latency: r.max_latency,
                loss_count: r.loss_count,
                samples: r.samples,
            })
            .collect();

        Ok(Insights {
            target_id,
            window_minutes,
            bucket_seconds: native,
            window_start,
            window_end,
            resolution,
            sample_count,
            loss_count,
            uptime_percent: uptime(sample_count, loss_count),
            avg_latency,
            min_latency,
            max_latency,
            // p50 tracks the weighted mean; p95 the top-decile boundary of
            // bucket means; p99 the worst bucket.
            p50: avg_latency,
            p95: percentile(&bucket_avgs, 0.95),
            p99: max_latency,
            percentile_mode: PercentileMode::Approximate,
            timeline,
        })
    }
}

/// Fold one raw sample into a timeline bucket (running mean over non-loss).
fn fold_sample(slot: &mut TimelineBucket, s: &crate::db::PingSample) {
    slot.samples += 1;
    if s.packet_loss {
        slot.loss_count += 1;
    } else if let Some(lat) = s.latency_ms {
        let n = (slot.samples - slot.loss_count) as f64;
        slot.avg_latency = Some(slot.avg_latency.map_or(lat, |a| a + (lat - a) / n));
        slot.min_latency = Some(slot.min_latency.map_or(lat, |m| m.min(lat)));
        slot.max_latency = Some(slot.max_latency.map_or(lat, |m| m.max(lat)));
    }
}

fn uptime(sample_count: i64, loss_count: i64) -> Option<f64> {
    if sample_count == 0 {
        return None;
    }
    Some(100.0 * (1.0 - loss_count as f64 / sample_count as f64))
}

/// Mean weighted by each bucket's non-loss sample count, plus global extrema.
fn weighted_stats(rows: &[AggregateRow]) -> (Option<f64>, Option<f64>, Option<f64>) {
    let mut weight = 0i64;
    let mut sum = 0f64;
    let mut min: Option<f64> = None;
    let mut max: Option<f64> = None;

    for r in rows {
        if let Some(avg) = r.avg_latency {
            let ok = r.samples - r.loss_count;
            weight += ok;
            sum += avg * ok as f64;
        }
        if let Some(m) = r.min_latency {
            min = Some(min.map_or(m, |cur| cur.min(m)));
        }
        if let Some(m) = r.max_latency {
            max = Some(max.map_or(m, |cur| cur.max(m)));
        }
    }

    let avg = if weight > 0 {
        Some(sum / weight as f64)
    } else {
        None
    };
    (avg, min, max)
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

//! Scheduler: one probe loop per active target under a global gate.

mod retention;
mod rollup;

pub use retention::*;
pub use rollup::*;

use crate::db::{DbError, MonitorTarget, PingSample, Store};
use crate::probe;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;

/// Graceful shutdown gives every loop this long to reach idle.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Backoff after an internal loop failure is the probe cadence, capped here.
const FAILURE_BACKOFF_CAP: Duration = Duration::from_secs(60);

struct LoopHandle {
    stop: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

/// Counters surfaced for observability.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub active_loops: usize,
    /// Ticks whose probe ran longer than the cadence; the next probe was
    /// scheduled immediately.
    pub missed_ticks: u64,
    /// Samples dropped after a write failed twice.
    pub dropped_writes: u64,
}

/// Orchestrates every probe loop. All loop-map mutations go through one
/// mutex; the semaphore bounds in-flight probes across all targets.
pub struct Scheduler {
    store: Arc<Store>,
    gate: Arc<Semaphore>,
    loops: Mutex<HashMap<i64, LoopHandle>>,
    ping_timeout: Duration,
    missed_ticks: Arc<AtomicU64>,
    dropped_writes: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, ping_concurrency_limit: usize, ping_timeout: Duration) -> Self {
        Self {
            store,
            gate: Arc::new(Semaphore::new(ping_concurrency_limit.max(1))),
            loops: Mutex::new(HashMap::new()),
            ping_timeout,
            missed_ticks: Arc::new(AtomicU64::new(0)),
            dropped_writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Boot: launch one loop per active target. Runs before the API binds.
    pub async fn start(&self) -> Result<(), DbError> {
        let targets = self.store.get_active_targets()?;
        tracing::info!("starting scheduler with {} active targets", targets.len());
        for target in targets {
            self.launch(target).await;
        }
        Ok(())
    }

    /// Launch a probe loop for a target. At most one loop runs per target;
    /// launching while one is alive is a no-op.
    pub async fn launch(&self, target: MonitorTarget) {
        let mut loops = self.loops.lock().await;
        if let Some(existing) = loops.get(&target.id) {
            if !existing.join.is_finished() {
                return;
            }
        }

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let join = tokio::spawn(run_probe_loop(
            target.clone(),
            self.store.clone(),
            self.gate.clone(),
            self.ping_timeout,
            stop_rx,
            self.missed_ticks.clone(),
            self.dropped_writes.clone(),
        ));
        loops.insert(target.id, LoopHandle { stop: stop_tx, join });
        tracing::info!("scheduler: launched loop for target {} ({})", target.id, target.ip);
    }

    /// Cancel a target's loop and wait for it to exit. Past the per-probe
    /// timeout the loop is abandoned; no further samples will be written
    /// because the task is aborted at its next suspension point.
    pub async fn cancel(&self, id: i64) {
        let handle = self.loops.lock().await.remove(&id);
        let Some(handle) = handle else { return };

        let _ = handle.stop.send(());
        let abort = handle.join.abort_handle();
        match tokio::time::timeout(self.ping_timeout, handle.join).await {
            Ok(_) => tracing::info!("scheduler: loop for target {} stopped", id),
            Err(_) => {
                abort.abort();
                tracing::warn!("scheduler: loop for target {} abandoned after timeout", id);
            }
        }
    }

    /// Cancel and relaunch, picking up a changed cadence.
    pub async fn restart(&self, target: MonitorTarget) {
        self.cancel(target.id).await;
        self.launch(target).await;
    }

    pub async fn is_running(&self, id: i64) -> bool {
        self.loops
            .lock()
            .await
            .get(&id)
            .map(|h| !h.join.is_finished())
            .unwrap_or(false)
    }

    /// Stop every loop; returns once all reached idle or the deadline passed.
    pub async fn shutdown(&self) {
        let handles: Vec<(i64, LoopHandle)> = self.loops.lock().await.drain().collect();
        if handles.is_empty() {
            return;
        }
        tracing::info!("scheduler: shutting down {} loops", handles.len());

        for (_, h) in &handles {
            let _ = h.stop.send(());
        }

        let deadline = Instant::now() + SHUTDOWN_DEADLINE;
        for (id, h) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let abort = h.join.abort_handle();
            if tokio::time::timeout(remaining, h.join).await.is_err() {
                abort.abort();
                tracing::warn!("scheduler: abandoned loop for target {} at shutdown", id);
            }
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        let loops = self.loops.lock().await;
        let active_loops = loops.values().filter(|h| !h.join.is_finished()).count();
        SchedulerStats {
            active_loops,
            missed_ticks: self.missed_ticks.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
        }
    }
}

/// One target's probe loop. Cancellation is observed at the gate, during
/// the probe, and across every sleep; probe failures become loss samples
/// and never escape the loop.
async fn run_probe_loop(
    target: MonitorTarget,
    store: Arc<Store>,
    gate: Arc<Semaphore>,
    ping_timeout: Duration,
    mut stop_rx: broadcast::Receiver<()>,
    missed_ticks: Arc<AtomicU64>,
    dropped_writes: Arc<AtomicU64>,
) {
    let frequency = Duration::from_secs(target.frequency_seconds.max(1) as u64);
    let backoff = frequency.min(FAILURE_BACKOFF_CAP);

    // Spread loop starts so a restart does not fire every probe at once.
    let jitter = Duration::from_millis(rand::random::<u64>() % 1000);
    tokio::select! {
        _ = stop_rx.recv() => return,
        _ = tokio::time::sleep(jitter) => {}
    }

    loop {
        let tick_start = Instant::now();

        let permit = tokio::select! {
            _ = stop_rx.recv() => break,
            permit = gate.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        // The probe child is killed when its future is dropped, so a
        // cancellation here does not leak the subprocess.
        let result = tokio::select! {
            _ = stop_rx.recv() => break,
            result = probe::ping(&target.ip, ping_timeout) => result,
        };

        let time = Utc::now();
        let sample = match (result.latency_ms, result.hops) {
            (Some(latency_ms), Some(hops)) if !result.packet_loss => {
                PingSample::success(time, target.id, latency_ms, hops)
            }
            _ => PingSample::loss(time, target.id),
        };

        // One immediate retry; a second failure drops the sample and takes
        // the failure backoff before the loop resumes its cadence.
        let mut write_failed = false;
        if store.insert_sample(&sample).is_err() {
            if let Err(e) = store.insert_sample(&sample) {
                tracing::error!("dropping sample for target {}: {}", target.id, e);
                dropped_writes.fetch_add(1, Ordering::Relaxed);
                write_failed = true;
            }
        }
        drop(permit);

        if write_failed {
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            continue;
        }

        let elapsed = tick_start.elapsed();
        if elapsed >= frequency {
            // Probe overran the interval: go again immediately.
            missed_ticks.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = tokio::time::sleep(frequency - elapsed) => {}
        }
    }

    tracing::debug!("probe loop for target {} exited", target.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, Arc<Store>) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        (tmp, store)
    }

    #[tokio::test]
    async fn test_launch_is_idempotent_per_target() {
        let (_tmp, store) = open_store();
        let scheduler = Scheduler::new(store.clone(), 5, Duration::from_secs(1));
        let target = store.add_target("127.0.0.1", 3600, None, None).unwrap();

        scheduler.launch(target.clone()).await;
        scheduler.launch(target.clone()).await;

        assert_eq!(scheduler.stats().await.active_loops, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_loop_and_blocks_until_idle() {
        let (_tmp, store) = open_store();
        let scheduler = Scheduler::new(store.clone(), 5, Duration::from_secs(2));
        let target = store.add_target("127.0.0.1", 3600, None, None).unwrap();

        scheduler.launch(target.clone()).await;
        assert!(scheduler.is_running(target.id).await);

        scheduler.cancel(target.id).await;
        assert!(!scheduler.is_running(target.id).await);

        // No new samples may appear after cancel returns.
        let before = store.query_raw(target.id, None, 1000).unwrap().len();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let after = store.query_raw(target.id, None, 1000).unwrap().len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_cancel_unknown_target_is_noop() {
        let (_tmp, store) = open_store();
        let scheduler = Scheduler::new(store, 5, Duration::from_secs(1));
        scheduler.cancel(42).await;
    }

    #[tokio::test]
    async fn test_start_launches_only_active_targets() {
        let (_tmp, store) = open_store();
        let a = store.add_target("127.0.0.1", 3600, None, None).unwrap();
        let b = store.add_target("127.0.0.2", 3600, None, None).unwrap();
        store.set_target_active(b.id, false).unwrap();

        let scheduler = Scheduler::new(store.clone(), 5, Duration::from_secs(1));
        scheduler.start().await.unwrap();

        assert!(scheduler.is_running(a.id).await);
        assert!(!scheduler.is_running(b.id).await);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_idles_every_loop() {
        let (_tmp, store) = open_store();
        let scheduler = Scheduler::new(store.clone(), 5, Duration::from_secs(1));
        for i in 1..=3 {
            let t = store
                .add_target(&format!("127.0.0.{}", i), 3600, None, None)
                .unwrap();
            scheduler.launch(t).await;
        }
        scheduler.shutdown().await;
        assert_eq!(scheduler.stats().await.active_loops, 0);
    }
}

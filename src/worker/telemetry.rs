use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::queue::QueueItemType;

/// Default interval used by the telemetry reporter task.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Running latency totals for one item type, in seconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub processing_total: u64,
    pub processing_max: u64,
    pub lifetime_total: u64,
    pub lifetime_max: u64,
}

impl LatencyStats {
    fn observe(&mut self, processing: u64, lifetime: u64) {
        self.count += 1;
        self.processing_total += processing;
        self.processing_max = self.processing_max.max(processing);
        self.lifetime_total += lifetime;
        self.lifetime_max = self.lifetime_max.max(lifetime);
    }

    pub fn processing_mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.processing_total as f64 / self.count as f64
        }
    }

    pub fn lifetime_mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.lifetime_total as f64 / self.count as f64
        }
    }
}

/// Outcome counters and per-type latency for the worker loop.
#[derive(Debug, Default)]
pub struct QueueTelemetry {
    completed: AtomicU64,
    failed: AtomicU64,
    processing_errors: AtomicU64,
    fatal: AtomicU64,
    ineligible: AtomicU64,
    idle: AtomicU64,
    latency: Mutex<HashMap<QueueItemType, LatencyStats>>,
}

impl QueueTelemetry {
    /// `processing` is lease to commit, `lifetime` is creation to commit.
    pub fn record_completed(&self, item_type: QueueItemType, processing: u64, lifetime: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut latency) = self.latency.lock() {
            latency.entry(item_type).or_default().observe(processing, lifetime);
        }
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal(&self) {
        self.fatal.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ineligible(&self) {
        self.ineligible.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle(&self) {
        self.idle.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            ineligible: self.ineligible.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
        }
    }

    pub fn latency(&self, item_type: QueueItemType) -> LatencyStats {
        self.latency
            .lock()
            .ok()
            .and_then(|latency| latency.get(&item_type).copied())
            .unwrap_or_default()
    }

    fn latency_table(&self) -> Vec<(QueueItemType, LatencyStats)> {
        let mut table: Vec<_> = match self.latency.lock() {
            Ok(latency) => latency.iter().map(|(t, s)| (*t, *s)).collect(),
            Err(_) => Vec::new(),
        };
        table.sort_by_key(|(t, _)| *t);
        table
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub completed: u64,
    pub failed: u64,
    pub processing_errors: u64,
    pub fatal: u64,
    pub ineligible: u64,
    pub idle: u64,
}

/// Spawns a background task that periodically logs outcome counters and
/// per-type latency.
pub fn spawn_reporter(
    telemetry: Arc<QueueTelemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("telemetry reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = telemetry.snapshot();
                    tracing::info!(
                        completed = snapshot.completed,
                        failed = snapshot.failed,
                        processing_errors = snapshot.processing_errors,
                        fatal = snapshot.fatal,
                        ineligible = snapshot.ineligible,
                        idle = snapshot.idle,
                        "queue telemetry snapshot"
                    );
                    for (item_type, stats) in telemetry.latency_table() {
                        tracing::info!(
                            item_type = %item_type,
                            count = stats.count,
                            processing_mean = format!("{:.1}", stats.processing_mean()),
                            processing_max = stats.processing_max,
                            lifetime_mean = format!("{:.1}", stats.lifetime_mean()),
                            lifetime_max = stats.lifetime_max,
                            "queue latency"
                        );
                    }
                }
            }
        }
    })
}

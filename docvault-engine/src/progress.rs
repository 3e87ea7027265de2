//! Run progress: shared counters, periodic progress logging and
//! human-readable formatting.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counters updated by worker tasks and sampled by the progress logger.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    documents: AtomicU64,
    bytes: AtomicU64,
    collections_done: AtomicUsize,
    collections_total: AtomicUsize,
}

/// Point-in-time copy of [`ProgressCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub documents: u64,
    pub bytes: u64,
    pub collections_done: usize,
    pub collections_total: usize,
}

impl ProgressCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_total(&self, collections: usize) {
        self.collections_total.store(collections, Ordering::Relaxed);
    }

    pub fn add_documents(&self, n: u64) {
        self.documents.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn collection_done(&self) {
        self.collections_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            documents: self.documents.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            collections_done: self.collections_done.load(Ordering::Relaxed),
            collections_total: self.collections_total.load(Ordering::Relaxed),
        }
    }
}

/// Throughput between successive samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rates {
    pub documents_per_second: u64,
    pub bytes_per_second: u64,
}

/// Progress tracker with time-based speed calculation
pub struct ProgressTracker {
    start_time: Instant,
    last_update_time: Instant,
    last: ProgressSnapshot,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last: ProgressSnapshot::default(),
        }
    }

    /// Record a new sample and return the rates since the previous one.
    pub fn update(&mut self, sample: ProgressSnapshot) -> Rates {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();
        let per_second = |current: u64, previous: u64| {
            if elapsed > 0.0 {
                (current.saturating_sub(previous) as f64 / elapsed) as u64
            } else {
                0
            }
        };

        let rates = Rates {
            documents_per_second: per_second(sample.documents, self.last.documents),
            bytes_per_second: per_second(sample.bytes, self.last.bytes),
        };
        self.last_update_time = now;
        self.last = sample;
        rates
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Log progress every `interval` until `stop` is cancelled.
pub fn spawn_progress_logger(
    label: &'static str,
    counters: Arc<ProgressCounters>,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut tracker = ProgressTracker::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.cancelled() => { break; }
            }

            let sample = counters.snapshot();
            let rates = tracker.update(sample);
            info!(
                "{}: {}/{} collections, {} documents, {} ({}, {} docs/s) after {}",
                label,
                sample.collections_done,
                sample.collections_total,
                sample.documents,
                format_bytes(sample.bytes),
                format_speed(rates.bytes_per_second),
                rates.documents_per_second,
                format_duration(tracker.elapsed().as_secs())
            );
        }
    })
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

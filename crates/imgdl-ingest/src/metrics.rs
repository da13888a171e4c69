//! Run-scoped counters and the end-of-run summary

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::gate::GateStats;
use crate::job::SkipReason;
use crate::progress::format_bytes;

/// Counters shared by the producer and the sink
#[derive(Debug, Default)]
pub struct RunMetrics {
    items_seen: AtomicU64,
    records_written: AtomicU64,
    bytes_written: AtomicU64,
    files_completed: AtomicU64,
    files_failed: AtomicU64,
    skipped: [AtomicU64; SkipReason::COUNT],
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item_seen(&self) {
        self.items_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn items_seen_add(&self, n: u64) {
        self.items_seen.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_written(&self, bytes: u64) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn skipped(&self, reason: SkipReason) {
        self.skipped[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn items_seen(&self) -> u64 {
        self.items_seen.load(Ordering::Relaxed)
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn files_completed(&self) -> u64 {
        self.files_completed.load(Ordering::Relaxed)
    }

    pub fn files_failed(&self) -> u64 {
        self.files_failed.load(Ordering::Relaxed)
    }

    pub fn skip_count(&self, reason: SkipReason) -> u64 {
        self.skipped[reason.index()].load(Ordering::Relaxed)
    }

    pub fn total_skipped(&self) -> u64 {
        SkipReason::ALL.iter().map(|r| self.skip_count(*r)).sum()
    }

    /// Items folded by the sink, written or skipped
    pub fn items_resolved(&self) -> u64 {
        self.records_written() + self.total_skipped()
    }

    /// Non-zero skip counters keyed by reason name
    pub fn skip_breakdown(&self) -> BTreeMap<String, u64> {
        SkipReason::ALL
            .iter()
            .filter_map(|r| {
                let n = self.skip_count(*r);
                (n > 0).then(|| (r.as_str().to_string(), n))
            })
            .collect()
    }
}

/// What a run did, logged at the end and optionally written as JSON
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dry_run: bool,
    /// Dataset written, if any
    pub output: Option<PathBuf>,
    pub files_total: usize,
    pub files_completed: u64,
    pub files_failed: u64,
    /// Files already in the checkpoint log
    pub files_skipped: usize,
    /// Matching records read from the inputs
    pub items_seen: u64,
    pub records_written: u64,
    pub bytes_written: u64,
    pub skipped: BTreeMap<String, u64>,
    pub interrupted: bool,
    pub elapsed_secs: f64,
    /// Items seen per second
    pub throughput: f64,
    pub admission: GateStats,
}

impl RunSummary {
    pub fn new(run_id: Uuid, files_total: usize, files_skipped: usize, capacity: usize) -> Self {
        Self {
            run_id,
            dry_run: false,
            output: None,
            files_total,
            files_completed: 0,
            files_failed: 0,
            files_skipped,
            items_seen: 0,
            records_written: 0,
            bytes_written: 0,
            skipped: BTreeMap::new(),
            interrupted: false,
            elapsed_secs: 0.0,
            throughput: 0.0,
            admission: GateStats {
                capacity,
                acquired: 0,
                released: 0,
                in_flight: 0,
                peak_in_flight: 0,
            },
        }
    }

    /// Copy the counters of a finished run
    pub fn absorb(&mut self, metrics: &RunMetrics, elapsed: Duration) {
        self.files_completed = metrics.files_completed();
        self.files_failed = metrics.files_failed();
        self.items_seen = metrics.items_seen();
        self.records_written = metrics.records_written();
        self.bytes_written = metrics.bytes_written();
        self.skipped = metrics.skip_breakdown();
        self.elapsed_secs = elapsed.as_secs_f64();
        self.throughput = if self.elapsed_secs > 0.0 {
            self.items_seen as f64 / self.elapsed_secs
        } else {
            0.0
        };
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped.values().sum()
    }

    /// Every file still pending at start finished
    pub fn all_files_completed(&self) -> bool {
        !self.interrupted && self.files_completed as usize + self.files_skipped == self.files_total
    }

    pub fn log(&self) {
        info!(
            run_id = %self.run_id,
            dry_run = self.dry_run,
            files_completed = self.files_completed,
            files_failed = self.files_failed,
            files_skipped = self.files_skipped,
            items_seen = self.items_seen,
            records_written = self.records_written,
            bytes_written = %format_bytes(self.bytes_written),
            skipped = self.total_skipped(),
            elapsed_secs = format_args!("{:.1}", self.elapsed_secs),
            throughput = format_args!("{:.1}/s", self.throughput),
            "Run finished"
        );
        for (reason, count) in &self.skipped {
            info!(reason = %reason, count, "Skipped items");
        }
        if let Some(output) = &self.output {
            info!(output = %output.display(), "Output dataset");
        }
    }
}

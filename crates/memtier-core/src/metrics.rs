//! Atomic counters for memtier observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a scheduler tick).
//!
//! There is no process-wide instance; components share one through an
//! `Arc<Metrics>` handed in at construction.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight atomic counters.
#[derive(Debug)]
pub struct Metrics {
    retrievals: AtomicU64,
    records_returned: AtomicU64,
    policy_runs: AtomicU64,
    migrated: AtomicU64,
    trimmed: AtomicU64,
    summarized: AtomicU64,
    thread_summaries: AtomicU64,
    clusters_upserted: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            retrievals: AtomicU64::new(0),
            records_returned: AtomicU64::new(0),
            policy_runs: AtomicU64::new(0),
            migrated: AtomicU64::new(0),
            trimmed: AtomicU64::new(0),
            summarized: AtomicU64::new(0),
            thread_summaries: AtomicU64::new(0),
            clusters_upserted: AtomicU64::new(0),
        }
    }

    /// Record one retrieval and the number of records it returned.
    pub fn inc_retrieval(&self, returned: usize) {
        self.retrievals.fetch_add(1, Ordering::Relaxed);
        self.records_returned
            .fetch_add(returned as u64, Ordering::Relaxed);
        tracing::trace!(metric = "retrievals", "counter incremented");
    }

    pub fn inc_policy_runs(&self) {
        self.policy_runs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "policy_runs", "counter incremented");
    }

    pub fn add_migrated(&self, n: usize) {
        self.migrated.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_trimmed(&self, n: usize) {
        self.trimmed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_summarized(&self, n: usize) {
        self.summarized.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_thread_summaries(&self, n: usize) {
        self.thread_summaries.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_clusters(&self, n: usize) {
        self.clusters_upserted.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            retrievals = self.retrievals(),
            records_returned = self.records_returned(),
            policy_runs = self.policy_runs(),
            migrated = self.migrated(),
            trimmed = self.trimmed(),
            summarized = self.summarized(),
            thread_summaries = self.thread_summaries(),
            clusters_upserted = self.clusters_upserted(),
        );
    }

    pub fn retrievals(&self) -> u64 {
        self.retrievals.load(Ordering::Relaxed)
    }

    pub fn records_returned(&self) -> u64 {
        self.records_returned.load(Ordering::Relaxed)
    }

    pub fn policy_runs(&self) -> u64 {
        self.policy_runs.load(Ordering::Relaxed)
    }

    pub fn migrated(&self) -> u64 {
        self.migrated.load(Ordering::Relaxed)
    }

    pub fn trimmed(&self) -> u64 {
        self.trimmed.load(Ordering::Relaxed)
    }

    pub fn summarized(&self) -> u64 {
        self.summarized.load(Ordering::Relaxed)
    }

    pub fn thread_summaries(&self) -> u64 {
        self.thread_summaries.load(Ordering::Relaxed)
    }

    pub fn clusters_upserted(&self) -> u64 {
        self.clusters_upserted.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.retrievals,
            &self.records_returned,
            &self.policy_runs,
            &self.migrated,
            &self.trimmed,
            &self.summarized,
            &self.thread_summaries,
            &self.clusters_upserted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

//! Consumer metrics.
//!
//! [`ConsumerMetrics`] provides lock-free atomic counters shared between
//! the driver, the fetch tasks and the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for consumer statistics.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    /// Fetch calls dispatched to the remote service.
    pub fetches_dispatched: AtomicU64,
    /// Fetch calls whose results were drained.
    pub fetches_completed: AtomicU64,
    /// Fetch calls that failed.
    pub fetch_errors: AtomicU64,
    /// Records delivered to the caller.
    pub records_fetched: AtomicU64,
    /// Payload bytes delivered to the caller.
    pub bytes_fetched: AtomicU64,
    /// Successful cursor refreshes.
    pub cursor_refreshes: AtomicU64,
    /// Failed cursor refreshes.
    pub cursor_refresh_failures: AtomicU64,
    /// Rebalance requests raised by remote errors.
    pub rebalance_requests: AtomicU64,
    /// Offset commits.
    pub commits: AtomicU64,
}

impl ConsumerMetrics {
    /// Creates a new metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a dispatched fetch.
    pub fn record_dispatch(&self) {
        self.fetches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a drained fetch of `records` records totaling `bytes`.
    pub fn record_fetch(&self, records: u64, bytes: u64) {
        self.fetches_completed.fetch_add(1, Ordering::Relaxed);
        self.records_fetched.fetch_add(records, Ordering::Relaxed);
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a failed fetch.
    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the outcome of a cursor refresh.
    pub fn record_cursor_refresh(&self, ok: bool) {
        if ok {
            self.cursor_refreshes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cursor_refresh_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a rebalance request.
    pub fn record_rebalance_request(&self) {
        self.rebalance_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an offset commit.
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
        ConsumerMetricsSnapshot {
            fetches_dispatched: self.fetches_dispatched.load(Ordering::Relaxed),
            fetches_completed: self.fetches_completed.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            records_fetched: self.records_fetched.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            cursor_refreshes: self.cursor_refreshes.load(Ordering::Relaxed),
            cursor_refresh_failures: self.cursor_refresh_failures.load(Ordering::Relaxed),
            rebalance_requests: self.rebalance_requests.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`ConsumerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ConsumerMetricsSnapshot {
    pub fetches_dispatched: u64,
    pub fetches_completed: u64,
    pub fetch_errors: u64,
    pub records_fetched: u64,
    pub bytes_fetched: u64,
    pub cursor_refreshes: u64,
    pub cursor_refresh_failures: u64,
    pub rebalance_requests: u64,
    pub commits: u64,
}

//! Per-worker query statistics.
//!
//! Every worker owns a [`WorkerStats`] exclusively. There is no cross-worker
//! aggregation; the reporting worker derives a [`Report`] from its local
//! counters and extrapolates the aggregate request rate from its own pace.

use std::{fmt, num::NonZeroU64, time::Duration};

/// Counters owned by a single worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    total: u64,
    failed: u64,
    success: u64,
    cumulative_latency: Duration,
}

impl WorkerStats {
    /// Record one completed query and its observed latency.
    pub fn record(&mut self, elapsed: Duration, ok: bool) {
        self.cumulative_latency += elapsed;
        self.total += 1;
        if ok {
            self.success += 1;
        } else {
            self.failed += 1;
        }
    }

    /// Total queries issued so far.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Queries that failed.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed
    }

    /// Queries that succeeded.
    #[must_use]
    pub fn success(&self) -> u64 {
        self.success
    }

    /// Whether a report is due at the current total.
    #[must_use]
    pub fn report_due(&self, interval: NonZeroU64) -> bool {
        self.total > 0 && self.total % interval.get() == 0
    }

    /// Derive a point-in-time report, extrapolating this worker's pace to
    /// `worker_count` peers for the aggregate request-rate estimate.
    #[must_use]
    pub fn report(&self, worker_count: u16) -> Report {
        let mean_latency = if self.total == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.cumulative_latency.as_secs_f64() / self.total as f64)
        };

        let success_rate = if self.total == 0 {
            0.0
        } else {
            (self.success as f64 / self.total as f64) * 100.0
        };

        let latency_secs = self.cumulative_latency.as_secs_f64();
        let request_rate = if latency_secs > 0.0 {
            (self.total as f64 * f64::from(worker_count)) / latency_secs
        } else {
            0.0
        };

        Report {
            total: self.total,
            failed: self.failed,
            success: self.success,
            mean_latency,
            success_rate,
            request_rate,
        }
    }
}

/// A point-in-time statistics block from the reporting worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    /// Total queries issued by the reporting worker.
    pub total: u64,
    /// Queries that failed.
    pub failed: u64,
    /// Queries that succeeded.
    pub success: u64,
    /// Mean per-query latency, cumulative latency over total queries.
    pub mean_latency: Duration,
    /// Successes over total, as a percentage.
    pub success_rate: f64,
    /// Estimated aggregate request rate across all workers, assuming every
    /// worker runs at the reporting worker's pace.
    pub request_rate: f64,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total queries: {total}, failed: {failed}, success: {success}, \
             average latency: {latency:?}, success rate: {rate:.2}%, \
             estimated request rate: {request_rate:.2}/s",
            total = self.total,
            failed = self.failed,
            success = self.success,
            latency = self.mean_latency,
            rate = self.success_rate,
            request_rate = self.request_rate,
        )
    }
}

//! Per-session traffic statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for everything a session's request sets and schedulers do
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Request sets executed (one transport round trip each)
    pub executions: AtomicU64,
    /// Round maps executed
    pub round_maps_executed: AtomicU64,
    /// Reads queued
    pub reads_prepared: AtomicU64,
    /// Writes queued
    pub writes_prepared: AtomicU64,
    /// Reads that produced exactly the requested bytes
    pub reads_materialized: AtomicU64,
    /// Reads the transport had no (or short) data for
    pub reads_failed: AtomicU64,
    /// Whole-call transport failures
    pub transport_failures: AtomicU64,
    /// Completion receivers invoked
    pub completions_dispatched: AtomicU64,
    /// Successful refresh ticks
    pub refresh_ticks: AtomicU64,
    /// Failed refresh ticks
    pub refresh_failures: AtomicU64,
}

/// Plain copy of [`SessionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub executions: u64,
    pub round_maps_executed: u64,
    pub reads_prepared: u64,
    pub writes_prepared: u64,
    pub reads_materialized: u64,
    pub reads_failed: u64,
    pub transport_failures: u64,
    pub completions_dispatched: u64,
    pub refresh_ticks: u64,
    pub refresh_failures: u64,
}

impl SessionStats {
    /// Create new statistics
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Take a snapshot of every counter
    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            round_maps_executed: self.round_maps_executed.load(Ordering::Relaxed),
            reads_prepared: self.reads_prepared.load(Ordering::Relaxed),
            writes_prepared: self.writes_prepared.load(Ordering::Relaxed),
            reads_materialized: self.reads_materialized.load(Ordering::Relaxed),
            reads_failed: self.reads_failed.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            completions_dispatched: self.completions_dispatched.load(Ordering::Relaxed),
            refresh_ticks: self.refresh_ticks.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
        }
    }
}

impl SessionStatsSnapshot {
    /// Fraction of materialization attempts that failed (0.0 to 1.0)
    pub fn read_failure_rate(&self) -> f64 {
        let attempts = self.reads_materialized + self.reads_failed;
        if attempts == 0 {
            return 0.0;
        }
        self.reads_failed as f64 / attempts as f64
    }

    /// Get a summary string of the statistics
    pub fn summary(&self) -> String {
        format!(
            "SessionStats {{ executions: {}, reads: {} prepared / {} ok / {} failed, \
             writes: {}, completions: {}, transport_failures: {}, refresh: {} ok / {} failed }}",
            self.executions,
            self.reads_prepared,
            self.reads_materialized,
            self.reads_failed,
            self.writes_prepared,
            self.completions_dispatched,
            self.transport_failures,
            self.refresh_ticks,
            self.refresh_failures
        )
    }
}

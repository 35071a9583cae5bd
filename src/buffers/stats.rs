//! Buffer pool statistics tracking

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Snapshot of buffer pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Total rent requests served
    pub total_rents: u64,
    /// Total buffers given back
    pub total_returns: u64,
    /// Rents served from an idle backing store
    pub pool_hits: u64,
    /// Rents that needed a fresh allocation
    pub pool_misses: u64,
    /// Rents too large for any size class
    pub unpooled_rents: u64,
    /// Buffers currently rented out
    pub currently_in_use: usize,
    /// Peak number of buffers rented out at once
    pub peak_usage: usize,
}

impl BufferPoolStats {
    /// Fraction of rents served without allocating (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        if self.total_rents == 0 {
            return 0.0;
        }
        self.pool_hits as f64 / self.total_rents as f64
    }

    /// Get a summary string of the statistics
    pub fn summary(&self) -> String {
        format!(
            "BufferPoolStats {{ rents: {}, returns: {}, in_use: {}, peak: {}, \
             hits: {}, misses: {}, unpooled: {}, hit_rate: {:.2}% }}",
            self.total_rents,
            self.total_returns,
            self.currently_in_use,
            self.peak_usage,
            self.pool_hits,
            self.pool_misses,
            self.unpooled_rents,
            self.hit_rate() * 100.0
        )
    }
}

/// Thread-safe statistics for buffer pools
#[derive(Debug, Default)]
pub struct AtomicBufferPoolStats {
    total_rents: AtomicU64,
    total_returns: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    unpooled_rents: AtomicU64,
    currently_in_use: AtomicUsize,
    peak_usage: AtomicUsize,
}

impl AtomicBufferPoolStats {
    /// Create new atomic statistics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful rent; `hit` is true when an idle store was reused
    pub fn record_rent(&self, hit: bool, pooled: bool) {
        self.total_rents.fetch_add(1, Ordering::Relaxed);
        if !pooled {
            self.unpooled_rents.fetch_add(1, Ordering::Relaxed);
        } else if hit {
            self.pool_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pool_misses.fetch_add(1, Ordering::Relaxed);
        }

        let in_use = self.currently_in_use.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peak = self.peak_usage.load(Ordering::Relaxed);
        while in_use > peak {
            match self.peak_usage.compare_exchange_weak(
                peak,
                in_use,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => peak = x,
            }
        }
    }

    /// Record a buffer coming back
    pub fn record_return(&self) {
        self.total_returns.fetch_add(1, Ordering::Relaxed);
        self.currently_in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> BufferPoolStats {
        BufferPoolStats {
            total_rents: self.total_rents.load(Ordering::Relaxed),
            total_returns: self.total_returns.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            unpooled_rents: self.unpooled_rents.load(Ordering::Relaxed),
            currently_in_use: self.currently_in_use.load(Ordering::Relaxed),
            peak_usage: self.peak_usage.load(Ordering::Relaxed),
        }
    }
}

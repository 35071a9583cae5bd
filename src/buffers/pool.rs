//! Size-class buffer pool backing materialized scatter results

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use crate::error::{Result, ScatterError};

use super::{
    config::BufferPoolConfig,
    pooled::PooledBuffer,
    stats::{AtomicBufferPoolStats, BufferPoolStats},
};

/// A pool of reusable byte stores bucketed by power-of-two size class
///
/// Stores handed out are at least as large as requested; the exact requested
/// length is enforced by [`PooledBuffer`].
#[derive(Debug)]
pub struct BufferPool {
    /// Configuration
    config: BufferPoolConfig,
    /// Idle stores keyed by size class
    idle: Mutex<HashMap<usize, Vec<Box<[u8]>>>>,
    /// Statistics
    stats: AtomicBufferPoolStats,
}

static SHARED_POOL: OnceLock<Arc<BufferPool>> = OnceLock::new();

impl BufferPool {
    /// Create a new buffer pool
    pub fn new(config: BufferPoolConfig) -> Result<Arc<Self>> {
        config.validate()?;

        Ok(Arc::new(Self {
            config,
            idle: Mutex::new(HashMap::new()),
            stats: AtomicBufferPoolStats::new(),
        }))
    }

    /// Process-wide pool used when no explicit pool is configured
    pub fn shared() -> Arc<BufferPool> {
        SHARED_POOL
            .get_or_init(|| {
                Arc::new(Self {
                    config: BufferPoolConfig::new("shared"),
                    idle: Mutex::new(HashMap::new()),
                    stats: AtomicBufferPoolStats::new(),
                })
            })
            .clone()
    }

    /// Rent a buffer exposing exactly `length` bytes
    pub fn rent(self: &Arc<Self>, length: usize) -> Result<PooledBuffer> {
        if length == 0 {
            return Err(ScatterError::invalid_parameter(
                "length",
                "Pooled buffer length cannot be zero",
            ));
        }

        let store = match self.config.size_class_for(length) {
            Some(class) => {
                let reused = {
                    let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
                    idle.get_mut(&class).and_then(|stores| stores.pop())
                };
                self.stats.record_rent(reused.is_some(), true);
                reused.unwrap_or_else(|| vec![0u8; class].into_boxed_slice())
            }
            None => {
                self.stats.record_rent(false, false);
                vec![0u8; length].into_boxed_slice()
            }
        };

        Ok(PooledBuffer::from_store(Arc::clone(self), store, length))
    }

    /// Take a store back; called exactly once per rent by [`PooledBuffer`]
    pub(crate) fn give_back(&self, mut store: Box<[u8]>) {
        self.stats.record_return();

        let class = store.len();
        if !class.is_power_of_two()
            || class < self.config.min_size_class
            || class > self.config.max_size_class
        {
            return;
        }

        if self.config.zero_on_release {
            store.fill(0);
        }

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let stores = idle.entry(class).or_default();
        if stores.len() < self.config.max_cached_per_class {
            stores.push(store);
        }
    }

    /// Get current statistics
    pub fn stats(&self) -> BufferPoolStats {
        self.stats.snapshot()
    }

    /// Get pool configuration
    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    /// Number of idle stores across all size classes
    pub fn idle_count(&self) -> usize {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.values().map(Vec::len).sum()
    }

    /// Drop idle stores until at most `target_idle` remain per class
    pub fn shrink(&self, target_idle: usize) -> usize {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for stores in idle.values_mut() {
            if stores.len() > target_idle {
                removed += stores.len() - target_idle;
                stores.truncate(target_idle);
            }
        }
        idle.retain(|_, stores| !stores.is_empty());
        removed
    }
}

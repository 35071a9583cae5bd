//! Pooled result buffers
//!
//! Materialized scatter reads land in stores rented from a size-class pool so
//! that hot batch loops do not allocate per result.

pub mod config;
pub mod pool;
pub mod pooled;
pub mod stats;

// Re-export main types
pub use config::{BufferPoolConfig, BufferPoolConfigBuilder};
pub use pool::BufferPool;
pub use pooled::PooledBuffer;
pub use stats::{AtomicBufferPoolStats, BufferPoolStats};

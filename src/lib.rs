//! # Memscatter - Batched Scatter Access to Live Memory
//!
//! Memscatter batches many small reads and writes against a live memory
//! target (a process's virtual address space, or physical memory) into as
//! few transport round trips as possible.
//!
//! ## Features
//!
//! - **Scatter request sets**: Prepare reads/writes, execute once, read back
//! - **Completion receivers**: Per-read notifications after each execution
//! - **Round maps**: Ordered rounds for pointer chasing, one round trip per hop
//! - **Pooled result buffers**: Power-of-two size classes, released exactly once
//! - **Background refresh**: Periodic cache refresh loops keyed by session and option
//! - **Loopback transport**: In-process target for tests, benches and the CLI
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                    Session                       │
//! ├──────────────────────────────────────────────────┤
//! │  ScatterRoundMap ──► ScatterRequestSet (rounds)  │
//! │  Refresh schedulers   │  Buffer pool             │
//! └──────────────────────────────────────────────────┘
//!                         │
//!                         ▼
//! ┌──────────────────────────────────────────────────┐
//! │   Transport (initialize/prepare/execute/read)    │
//! └──────────────────────────────────────────────────┘
//! ```

// Core modules
pub mod buffers;
pub mod error;
pub mod scatter;
pub mod session;
pub mod transport;

// Background work
pub mod refresh;

// Main API re-exports
pub use buffers::{
    AtomicBufferPoolStats, BufferPool, BufferPoolConfig, BufferPoolConfigBuilder, BufferPoolStats,
    PooledBuffer,
};
pub use error::{Result, ScatterError};
pub use refresh::RefreshOption;
pub use scatter::{
    CompletionReceiver, PreparedRequest, RequestKind, RoundMapHandle, ScatterCompletion,
    ScatterRequestSet, ScatterRoundMap, SetState,
};
pub use session::{Session, SessionConfig, SessionId, SessionStats, SessionStatsSnapshot};
pub use transport::{
    LoopbackStats, LoopbackTransport, PhysMemRange, Pid, ScatterFlags, ScatterHandle, Transport,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    use std::time::Duration;

    /// Transport page size
    pub const PAGE_SIZE: usize = 0x1000;

    /// Largest single prepared request (1 GiB)
    pub const MAX_REQUEST_LENGTH: u32 = 0x4000_0000;

    /// Smallest pooled buffer size class
    pub const DEFAULT_MIN_SIZE_CLASS: usize = 64;

    /// Largest pooled buffer size class (16 MiB); bigger rents are unpooled
    pub const DEFAULT_MAX_SIZE_CLASS: usize = 16 * 1024 * 1024;

    /// Idle buffers kept per size class
    pub const DEFAULT_MAX_CACHED_PER_CLASS: usize = 32;

    pub const DEFAULT_REFRESH_FAST: Duration = Duration::from_millis(100);
    pub const DEFAULT_REFRESH_MEM: Duration = Duration::from_millis(300);
    pub const DEFAULT_REFRESH_MEDIUM: Duration = Duration::from_secs(2);
    pub const DEFAULT_REFRESH_TLB: Duration = Duration::from_secs(2);
    pub const DEFAULT_REFRESH_SLOW: Duration = Duration::from_secs(10);
}

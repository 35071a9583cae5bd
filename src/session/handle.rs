//! Live connection to an inspected target

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, info};

use crate::{
    buffers::BufferPool,
    error::{Result, ScatterError},
    refresh,
    scatter::{ScatterRequestSet, ScatterRoundMap},
    transport::{PhysMemRange, Pid, ScatterFlags, Transport},
};

use super::{config::SessionConfig, stats::SessionStats};

/// Unique identifier for sessions within this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn next_session_id() -> SessionId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    SessionId(COUNTER.fetch_add(1, Ordering::SeqCst))
}

struct SessionInner {
    id: SessionId,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    pool: Arc<BufferPool>,
    alive: AtomicBool,
    stats: SessionStats,
}

/// Shared handle to a connected target
///
/// Cloning is cheap; every clone refers to the same session. Once
/// [`dispose`](Self::dispose) runs, every scatter and refresh operation
/// against the session fails with [`ScatterError::SessionDisposed`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Open a session over `transport` with default configuration
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_config(transport, SessionConfig::default())
    }

    /// Open a session with explicit configuration
    pub fn with_config(transport: Arc<dyn Transport>, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let pool = match &config.buffer_pool {
            Some(pool_config) => BufferPool::new(pool_config.clone())?,
            None => BufferPool::shared(),
        };

        let id = next_session_id();
        info!("session {} ({}) opened", id, config.name);

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                config,
                transport,
                pool,
                alive: AtomicBool::new(true),
                stats: SessionStats::new(),
            }),
        })
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Session name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Flags used when none are given explicitly
    pub fn default_flags(&self) -> ScatterFlags {
        self.inner.config.default_flags
    }

    /// Whether the session has not been disposed
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Fail with [`ScatterError::SessionDisposed`] if the session is gone
    pub fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(ScatterError::SessionDisposed {
                session: self.inner.id.0,
            })
        }
    }

    /// Transport behind this session
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Pool result buffers are rented from
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }

    /// Traffic statistics
    pub fn stats(&self) -> &SessionStats {
        &self.inner.stats
    }

    /// Set a transport configuration option
    pub fn config_set(&self, option: u64, value: u64) -> Result<()> {
        self.ensure_alive()?;
        self.inner.transport.config_set(option, value)
    }

    /// Page-sized physical ranges, each paired with the bytes left in its run
    ///
    /// The final page of every run is excluded.
    pub fn phys_mem_pages(&self) -> Result<Vec<(u64, u64)>> {
        self.ensure_alive()?;
        let ranges: Vec<PhysMemRange> = self.inner.transport.phys_mem_map()?;
        Ok(ranges.iter().flat_map(|range| range.pages()).collect())
    }

    /// New request set for `pid` using the session's default flags
    pub fn scatter(&self, pid: Pid) -> Result<ScatterRequestSet> {
        ScatterRequestSet::new(self.clone(), pid, self.default_flags())
    }

    /// New request set for `pid` with explicit flags
    pub fn scatter_with_flags(&self, pid: Pid, flags: ScatterFlags) -> Result<ScatterRequestSet> {
        ScatterRequestSet::new(self.clone(), pid, flags)
    }

    /// New round map for `pid` using the session's default flags
    pub fn round_map(&self, pid: Pid) -> Result<ScatterRoundMap> {
        ScatterRoundMap::new(self.clone(), pid, self.default_flags())
    }

    /// New round map for `pid` with explicit flags
    pub fn round_map_with_flags(&self, pid: Pid, flags: ScatterFlags) -> Result<ScatterRoundMap> {
        ScatterRoundMap::new(self.clone(), pid, flags)
    }

    /// Tear the session down
    ///
    /// Marks the session dead, then stops every refresh scheduler registered
    /// for it. Safe to call more than once.
    pub fn dispose(&self) {
        if !self.inner.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let stopped = refresh::unregister_all(self);
        debug!(
            "session {} disposing, stopped {} refresh scheduler(s)",
            self.inner.id, stopped
        );
        info!("session {} ({}) disposed", self.inner.id, self.inner.config.name);
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffers::BufferPoolConfig, transport::LoopbackTransport};

    #[test]
    fn test_session_ids_are_unique() {
        let transport = Arc::new(LoopbackTransport::new());
        let a = Session::new(transport.clone()).unwrap();
        let b = Session::new(transport).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_dispose_is_monotonic() {
        let session = Session::new(Arc::new(LoopbackTransport::new())).unwrap();
        assert!(session.ensure_alive().is_ok());

        session.dispose();
        session.dispose();

        assert!(!session.is_alive());
        assert!(matches!(
            session.config_set(1, 1),
            Err(ScatterError::SessionDisposed { .. })
        ));
        assert!(session.scatter(Pid(4)).is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = Session::with_config(
            Arc::new(LoopbackTransport::new()),
            SessionConfig::new(""),
        );
        assert!(matches!(result, Err(ScatterError::InvalidParameter { .. })));
    }

    #[test]
    fn test_session_with_own_pool() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.write_memory(Pid(6), 0x1000, &[0x42; 32]);
        let config = SessionConfig::new("custom-pool")
            .with_buffer_pool(BufferPoolConfig::new("custom").with_max_cached_per_class(2));
        let session = Session::with_config(transport, config).unwrap();
        assert_eq!(session.buffer_pool().config().name, "custom");
        assert!(!Arc::ptr_eq(session.buffer_pool(), &BufferPool::shared()));

        let set = session.scatter(Pid(6)).unwrap();
        set.prepare_read(0x1000, 32).unwrap();
        set.prepare_read(0x9000, 8).unwrap();
        set.execute().unwrap();
        let buffer = set.read_pooled(0x1000, 32).unwrap().unwrap();
        assert_eq!(buffer.to_vec().unwrap(), vec![0x42; 32]);
        assert!(set.read_pooled(0x9000, 8).unwrap().is_none());

        let pool_stats = session.buffer_pool().stats();
        assert_eq!(pool_stats.total_rents, 2);
        assert_eq!(pool_stats.currently_in_use, 1);

        let stats = session.stats().snapshot();
        assert_eq!((stats.reads_materialized, stats.reads_failed), (1, 1));
        assert!((stats.read_failure_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_phys_mem_pages() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.map_region(Pid::PHYSICAL, 0x10000, 0x3000);
        transport.map_region(Pid::PHYSICAL, 0x20000, 0x1000);
        let session = Session::new(transport).unwrap();

        // The last page of each run is left out, so a one-page run adds nothing
        let pages = session.phys_mem_pages().unwrap();
        assert_eq!(pages, vec![(0x10000, 0x3000), (0x11000, 0x2000)]);
    }
}

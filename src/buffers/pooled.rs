//! Exact-length owner of a pool-rented store

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::error::{Result, ScatterError};

use super::pool::BufferPool;

/// A rented buffer whose view is exactly the requested length
///
/// The backing store may be larger (the pool rounds up to a size class) but
/// only `len()` bytes are ever exposed. The store goes back to its pool on
/// [`release`](Self::release) or drop, whichever happens first. Any access
/// after release fails with [`ScatterError::BufferReleased`].
///
/// Buffers handed out by a request set are fenced to that set's results:
/// once the set is cleared or disposed the view reads as released, though
/// the store itself still goes back to the pool only on release or drop.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    store: Option<Box<[u8]>>,
    length: usize,
    fence: Option<(Arc<AtomicU64>, u64)>,
}

impl PooledBuffer {
    /// Rent `length` bytes from the process-wide shared pool
    pub fn acquire(length: usize) -> Result<Self> {
        BufferPool::shared().rent(length)
    }

    pub(crate) fn from_store(pool: Arc<BufferPool>, store: Box<[u8]>, length: usize) -> Self {
        debug_assert!(store.len() >= length);
        Self {
            pool,
            store: Some(store),
            length,
            fence: None,
        }
    }

    /// Tie the view to `epoch`; any later bump of the epoch invalidates it
    pub(crate) fn fenced(mut self, epoch: &Arc<AtomicU64>) -> Self {
        let seen = epoch.load(Ordering::Acquire);
        self.fence = Some((Arc::clone(epoch), seen));
        self
    }

    fn is_stale(&self) -> bool {
        self.fence
            .as_ref()
            .is_some_and(|(epoch, seen)| epoch.load(Ordering::Acquire) != *seen)
    }

    /// Requested length of the view
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the view is empty (never true for a rented buffer)
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether the view is no longer usable
    ///
    /// True once the store went back to the pool, or once the request set
    /// that produced this buffer was cleared or disposed.
    pub fn is_released(&self) -> bool {
        self.store.is_none() || self.is_stale()
    }

    /// Read-only view of exactly `len()` bytes
    pub fn as_slice(&self) -> Result<&[u8]> {
        match &self.store {
            Some(store) if !self.is_stale() => Ok(&store[..self.length]),
            _ => Err(ScatterError::BufferReleased {
                length: self.length,
            }),
        }
    }

    /// Mutable view of exactly `len()` bytes
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        let length = self.length;
        let stale = self.is_stale();
        match &mut self.store {
            Some(store) if !stale => Ok(&mut store[..length]),
            _ => Err(ScatterError::BufferReleased { length }),
        }
    }

    /// Copy the view into an owned vector
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.as_slice().map(<[u8]>::to_vec)
    }

    /// Return the store to the pool; later calls are no-ops
    pub fn release(&mut self) {
        if let Some(store) = self.store.take() {
            self.pool.give_back(store);
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("length", &self.length)
            .field("released", &self.is_released())
            .field("pool", &self.pool.config().name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPoolConfig;

    #[test]
    fn test_view_is_exact_length() {
        let pool = BufferPool::new(BufferPoolConfig::new("exact").with_min_size_class(64)).unwrap();
        let mut buffer = pool.rent(10).unwrap();

        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.as_slice().unwrap().len(), 10);
        buffer.as_mut_slice().unwrap().copy_from_slice(&[7u8; 10]);
        assert_eq!(buffer.to_vec().unwrap(), vec![7u8; 10]);
    }

    #[test]
    fn test_double_release_is_noop() {
        let pool = BufferPool::new(BufferPoolConfig::new("double")).unwrap();
        let mut buffer = pool.rent(32).unwrap();

        buffer.release();
        buffer.release();
        drop(buffer);

        let stats = pool.stats();
        assert_eq!(stats.total_rents, 1);
        assert_eq!(stats.total_returns, 1);
        assert_eq!(stats.currently_in_use, 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_access_after_release_fails() {
        let mut buffer = PooledBuffer::acquire(8).unwrap();
        buffer.release();

        assert!(buffer.is_released());
        assert!(matches!(
            buffer.as_slice(),
            Err(ScatterError::BufferReleased { length: 8 })
        ));
        assert!(buffer.as_mut_slice().is_err());
    }

    #[test]
    fn test_fence_bump_invalidates_view() {
        let epoch = Arc::new(AtomicU64::new(0));
        let buffer = PooledBuffer::acquire(4).unwrap().fenced(&epoch);
        assert!(buffer.as_slice().is_ok());

        epoch.fetch_add(1, Ordering::Release);
        assert!(buffer.is_released());
        assert!(buffer.to_vec().is_err());
    }
}

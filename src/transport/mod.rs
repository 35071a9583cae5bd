//! Boundary towards the acquisition transport
//!
//! The scatter engine only needs a handful of calls from the transport:
//! create a scatter handle, queue ranges on it, run it, copy results out,
//! and set configuration options. Everything about how the transport
//! reaches the target lives behind [`Transport`].

pub mod flags;
pub mod loopback;

use std::{fmt, iter};

use crate::{
    config::PAGE_SIZE,
    error::{Result, ScatterError},
};

pub use flags::{Pid, ScatterFlags, ScatterHandle};
pub use loopback::{LoopbackStats, LoopbackTransport};

/// A contiguous run of mapped physical memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysMemRange {
    /// Physical base address
    pub base: u64,
    /// Length in bytes
    pub length: u64,
}

impl PhysMemRange {
    /// Page bases within the range, paired with the bytes left to the range end
    ///
    /// Only pages with more than one page left are listed, so the last page
    /// of a run never appears.
    pub fn pages(&self) -> impl Iterator<Item = (u64, u64)> {
        let page = PAGE_SIZE as u64;
        iter::successors(Some((self.base, self.length)), move |&(base, left)| {
            Some((base.checked_add(page)?, left.checked_sub(page)?))
        })
        .take_while(move |&(_, left)| left > page)
    }
}

/// Calls the scatter engine and refresh scheduler make on a transport
pub trait Transport: Send + Sync + fmt::Debug {
    /// Create a scatter handle for `pid` with the given flags
    fn scatter_initialize(&self, pid: Pid, flags: ScatterFlags) -> Result<ScatterHandle>;

    /// Queue a read of `length` bytes at `address`
    fn scatter_prepare(&self, handle: ScatterHandle, address: u64, length: u32) -> Result<()>;

    /// Queue a write; the transport copies `data` before returning
    fn scatter_prepare_write(&self, handle: ScatterHandle, address: u64, data: &[u8])
        -> Result<()>;

    /// Run every queued request in one round trip
    ///
    /// Individual ranges may fail without failing the call.
    fn scatter_execute(&self, handle: ScatterHandle) -> Result<()>;

    /// Copy the executed result for `address` into `buf`
    ///
    /// Returns the number of bytes copied, zero when the transport has no
    /// data for the address.
    fn scatter_read(&self, handle: ScatterHandle, address: u64, buf: &mut [u8]) -> Result<usize>;

    /// Drop queued requests and results, optionally retargeting the handle
    fn scatter_clear(&self, handle: ScatterHandle, pid: Pid, flags: ScatterFlags) -> Result<()>;

    /// Release the handle
    fn scatter_close(&self, handle: ScatterHandle);

    /// Physical memory layout of the target, when the transport exposes it
    fn phys_mem_map(&self) -> Result<Vec<PhysMemRange>> {
        Err(ScatterError::transport(
            "phys_mem_map",
            "physical memory map not available",
        ))
    }

    /// Set a transport configuration option
    fn config_set(&self, option: u64, value: u64) -> Result<()>;
}

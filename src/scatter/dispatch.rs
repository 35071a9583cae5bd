//! Completion dispatch after a request set executes
//!
//! Receivers run synchronously on the thread that called `execute`, in the
//! order reads were prepared. For each read, receivers bound to that read run
//! first, then the set's catch-all receivers. The pass works on a snapshot
//! taken when dispatch starts: a receiver registered on the same set while
//! the pass is running is kept for the next execute but not called now.

use log::trace;

use crate::{buffers::PooledBuffer, error::Result};

use super::set::ScatterRequestSet;

/// Caller-supplied work invoked once per prepared read per execute
pub type CompletionReceiver = Box<dyn FnMut(&ScatterCompletion<'_>) + Send>;

/// What a receiver gets: the executed set and the read it is bound to
pub struct ScatterCompletion<'a> {
    set: &'a ScatterRequestSet,
    address: u64,
    length: u32,
}

impl<'a> ScatterCompletion<'a> {
    pub(crate) fn new(set: &'a ScatterRequestSet, address: u64, length: u32) -> Self {
        Self {
            set,
            address,
            length,
        }
    }

    /// The request set that just executed
    pub fn set(&self) -> &'a ScatterRequestSet {
        self.set
    }

    /// Address of the completed read
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Length of the completed read
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Copy of the bytes read, `None` if the transport had no data
    pub fn read(&self) -> Result<Option<Vec<u8>>> {
        self.set.read(self.address, self.length as usize)
    }

    /// Bytes read into a pooled buffer, released when the buffer drops
    pub fn read_pooled(&self) -> Result<Option<PooledBuffer>> {
        self.set.read_pooled(self.address, self.length as usize)
    }

    /// Little-endian u64 at the start of the read
    ///
    /// Only valid for reads prepared with a length of 8.
    pub fn read_u64(&self) -> Result<Option<u64>> {
        self.set.read_u64(self.address)
    }
}

/// Receivers lifted out of a set for one dispatch pass
#[derive(Default)]
pub(crate) struct DispatchSnapshot {
    /// (request index, address, length, bound receivers) for every read
    pub(crate) reads: Vec<(usize, u64, u32, Vec<CompletionReceiver>)>,
    pub(crate) catch_all: Vec<CompletionReceiver>,
}

impl DispatchSnapshot {
    /// Invoke every receiver in order; returns how many calls were made
    pub(crate) fn run(&mut self, set: &ScatterRequestSet) -> u64 {
        let mut invoked = 0u64;
        for (_, address, length, receivers) in self.reads.iter_mut() {
            let completion = ScatterCompletion::new(set, *address, *length);
            for receiver in receivers.iter_mut() {
                receiver(&completion);
                invoked += 1;
            }
            for receiver in self.catch_all.iter_mut() {
                receiver(&completion);
                invoked += 1;
            }
        }
        trace!(
            "dispatched {} completion(s) over {} read(s)",
            invoked,
            self.reads.len()
        );
        invoked
    }
}

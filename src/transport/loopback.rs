//! In-process transport over simulated target memory
//!
//! Memory is tracked per pid at page granularity. A read whose range touches
//! an unmapped page, or that starts at an address marked with
//! [`LoopbackTransport::fail_address`], fails for that range only, unless the
//! batch carries [`ScatterFlags::ZEROPAD_ON_FAIL`].

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, PoisonError, RwLock,
    },
    thread,
    time::Duration,
};

use log::trace;

use crate::{
    config::PAGE_SIZE,
    error::{Result, ScatterError},
};

use super::{PhysMemRange, Pid, ScatterFlags, ScatterHandle, Transport};

/// Counters describing transport traffic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    /// Scatter handles created
    pub handles_created: u64,
    /// Scatter handles closed
    pub handles_closed: u64,
    /// Execute calls (one per round trip)
    pub executes: u64,
    /// Read ranges queued
    pub reads_prepared: u64,
    /// Write ranges queued
    pub writes_prepared: u64,
    /// Configuration calls accepted
    pub config_sets: u64,
}

#[derive(Debug, Default)]
struct Batch {
    pid: Option<Pid>,
    flags: ScatterFlags,
    reads: Vec<(u64, u32)>,
    writes: Vec<(u64, Vec<u8>)>,
    results: HashMap<u64, Vec<u8>>,
}

type Page = Box<[u8]>;

/// Transport backed by process-local memory maps
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    memory: RwLock<HashMap<Pid, BTreeMap<u64, Page>>>,
    batches: Mutex<HashMap<u64, Batch>>,
    failing: RwLock<HashSet<u64>>,
    config_calls: Mutex<HashMap<u64, u64>>,
    fail_execute: AtomicBool,
    fail_config: AtomicBool,
    execute_delay_us: AtomicU64,
    next_handle: AtomicU64,
    handles_created: AtomicU64,
    handles_closed: AtomicU64,
    executes: AtomicU64,
    reads_prepared: AtomicU64,
    writes_prepared: AtomicU64,
}

fn page_base(address: u64) -> u64 {
    address & !(PAGE_SIZE as u64 - 1)
}

impl LoopbackTransport {
    /// Create an empty target
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Map zeroed pages covering `[base, base + length)` for `pid`
    pub fn map_region(&self, pid: Pid, base: u64, length: u64) {
        if length == 0 {
            return;
        }
        let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
        let pages = memory.entry(pid).or_default();
        let mut page = page_base(base);
        let end = base.saturating_add(length);
        while page < end {
            pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
            page = match page.checked_add(PAGE_SIZE as u64) {
                Some(next) => next,
                None => break,
            };
        }
    }

    /// Unmap every page overlapping `[base, base + length)` for `pid`
    pub fn unmap_region(&self, pid: Pid, base: u64, length: u64) {
        let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pages) = memory.get_mut(&pid) {
            let end = base.saturating_add(length);
            let doomed: Vec<u64> = pages.range(page_base(base)..end).map(|(k, _)| *k).collect();
            for page in doomed {
                pages.remove(&page);
            }
        }
    }

    /// Write directly into target memory, mapping pages as needed
    pub fn write_memory(&self, pid: Pid, address: u64, data: &[u8]) {
        self.map_region(pid, address, data.len() as u64);
        let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pages) = memory.get_mut(&pid) {
            Self::copy_in(pages, address, data);
        }
    }

    /// Read directly from target memory; `None` if any page is unmapped
    pub fn read_memory(&self, pid: Pid, address: u64, length: usize) -> Option<Vec<u8>> {
        let memory = self.memory.read().unwrap_or_else(PoisonError::into_inner);
        let pages = memory.get(&pid)?;
        let mut out = vec![0u8; length];
        Self::copy_out(pages, address, &mut out, false).then_some(out)
    }

    /// Fail any read range starting at `address`
    pub fn fail_address(&self, address: u64) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address);
    }

    /// Forget every injected per-address failure
    pub fn clear_failures(&self) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Make every execute call fail as a whole
    pub fn set_fail_execute(&self, fail: bool) {
        self.fail_execute.store(fail, Ordering::SeqCst);
    }

    /// Make every configuration call fail
    pub fn set_fail_config(&self, fail: bool) {
        self.fail_config.store(fail, Ordering::SeqCst);
    }

    /// Simulated round-trip latency added to each execute
    pub fn set_execute_delay(&self, delay: Duration) {
        self.execute_delay_us
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// Accepted configuration calls for `option`
    pub fn config_calls(&self, option: u64) -> u64 {
        let calls = self.config_calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.get(&option).copied().unwrap_or(0)
    }

    /// Number of scatter handles currently open
    pub fn open_handles(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Traffic counters
    pub fn stats(&self) -> LoopbackStats {
        let config_sets = self
            .config_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum();
        LoopbackStats {
            handles_created: self.handles_created.load(Ordering::Relaxed),
            handles_closed: self.handles_closed.load(Ordering::Relaxed),
            executes: self.executes.load(Ordering::Relaxed),
            reads_prepared: self.reads_prepared.load(Ordering::Relaxed),
            writes_prepared: self.writes_prepared.load(Ordering::Relaxed),
            config_sets,
        }
    }

    fn copy_in(pages: &mut BTreeMap<u64, Page>, address: u64, data: &[u8]) {
        let mut offset = 0usize;
        while offset < data.len() {
            let at = match address.checked_add(offset as u64) {
                Some(at) => at,
                None => return,
            };
            let base = page_base(at);
            let in_page = (at - base) as usize;
            let chunk = (PAGE_SIZE - in_page).min(data.len() - offset);
            if let Some(page) = pages.get_mut(&base) {
                page[in_page..in_page + chunk].copy_from_slice(&data[offset..offset + chunk]);
            }
            offset += chunk;
        }
    }

    /// Copy out of mapped pages; returns false if any page was missing
    fn copy_out(pages: &BTreeMap<u64, Page>, address: u64, out: &mut [u8], zeropad: bool) -> bool {
        let mut offset = 0usize;
        while offset < out.len() {
            let at = match address.checked_add(offset as u64) {
                Some(at) => at,
                None => return false,
            };
            let base = page_base(at);
            let in_page = (at - base) as usize;
            let chunk = (PAGE_SIZE - in_page).min(out.len() - offset);
            match pages.get(&base) {
                Some(page) => {
                    out[offset..offset + chunk].copy_from_slice(&page[in_page..in_page + chunk])
                }
                None if zeropad => out[offset..offset + chunk].fill(0),
                None => return false,
            }
            offset += chunk;
        }
        true
    }

    fn unknown_handle(operation: &str, handle: ScatterHandle) -> ScatterError {
        ScatterError::transport(operation, format!("unknown scatter handle {}", handle.0))
    }
}

impl Transport for LoopbackTransport {
    fn scatter_initialize(&self, pid: Pid, flags: ScatterFlags) -> Result<ScatterHandle> {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let batch = Batch {
            pid: Some(pid),
            flags,
            ..Default::default()
        };
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, batch);
        self.handles_created.fetch_add(1, Ordering::Relaxed);
        trace!("loopback: scatter handle {} created for pid {}", id, pid);
        Ok(ScatterHandle(id))
    }

    fn scatter_prepare(&self, handle: ScatterHandle, address: u64, length: u32) -> Result<()> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let batch = batches
            .get_mut(&handle.0)
            .ok_or_else(|| Self::unknown_handle("scatter_prepare", handle))?;
        batch.reads.push((address, length));
        self.reads_prepared.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn scatter_prepare_write(
        &self,
        handle: ScatterHandle,
        address: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let batch = batches
            .get_mut(&handle.0)
            .ok_or_else(|| Self::unknown_handle("scatter_prepare_write", handle))?;
        batch.writes.push((address, data.to_vec()));
        self.writes_prepared.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn scatter_execute(&self, handle: ScatterHandle) -> Result<()> {
        let delay = self.execute_delay_us.load(Ordering::Relaxed);
        if delay > 0 {
            thread::sleep(Duration::from_micros(delay));
        }
        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(ScatterError::transport(
                "scatter_execute",
                "device did not respond",
            ));
        }

        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let batch = batches
            .get_mut(&handle.0)
            .ok_or_else(|| Self::unknown_handle("scatter_execute", handle))?;
        let pid = batch
            .pid
            .ok_or_else(|| ScatterError::transport("scatter_execute", "handle has no target"))?;

        if !batch.writes.is_empty() {
            let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(pages) = memory.get_mut(&pid) {
                for (address, data) in &batch.writes {
                    Self::copy_in(pages, *address, data);
                }
            }
        }

        let zeropad = batch.flags.contains(ScatterFlags::ZEROPAD_ON_FAIL);
        let failing = self.failing.read().unwrap_or_else(PoisonError::into_inner);
        let memory = self.memory.read().unwrap_or_else(PoisonError::into_inner);
        batch.results.clear();
        for &(address, length) in &batch.reads {
            let mut out = vec![0u8; length as usize];
            let ok = if failing.contains(&address) {
                zeropad
            } else {
                match memory.get(&pid) {
                    Some(pages) => Self::copy_out(pages, address, &mut out, zeropad),
                    None => zeropad,
                }
            };
            // Overlapping reads at one address are served from the longest result
            let longer = batch
                .results
                .get(&address)
                .map_or(true, |previous| previous.len() < out.len());
            if ok && longer {
                batch.results.insert(address, out);
            }
        }

        self.executes.fetch_add(1, Ordering::Relaxed);
        trace!(
            "loopback: executed handle {} ({} reads, {} ok, {} writes)",
            handle.0,
            batch.reads.len(),
            batch.results.len(),
            batch.writes.len()
        );
        Ok(())
    }

    fn scatter_read(&self, handle: ScatterHandle, address: u64, buf: &mut [u8]) -> Result<usize> {
        let batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let batch = batches
            .get(&handle.0)
            .ok_or_else(|| Self::unknown_handle("scatter_read", handle))?;
        match batch.results.get(&address) {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn scatter_clear(&self, handle: ScatterHandle, pid: Pid, flags: ScatterFlags) -> Result<()> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        let batch = batches
            .get_mut(&handle.0)
            .ok_or_else(|| Self::unknown_handle("scatter_clear", handle))?;
        *batch = Batch {
            pid: Some(pid),
            flags,
            ..Default::default()
        };
        Ok(())
    }

    fn scatter_close(&self, handle: ScatterHandle) {
        let removed = self
            .batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);
        if removed.is_some() {
            self.handles_closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn phys_mem_map(&self) -> Result<Vec<PhysMemRange>> {
        let memory = self.memory.read().unwrap_or_else(PoisonError::into_inner);
        let mut ranges: Vec<PhysMemRange> = Vec::new();
        if let Some(pages) = memory.get(&Pid::PHYSICAL) {
            for &base in pages.keys() {
                match ranges.last_mut() {
                    Some(last) if last.base + last.length == base => {
                        last.length += PAGE_SIZE as u64;
                    }
                    _ => ranges.push(PhysMemRange {
                        base,
                        length: PAGE_SIZE as u64,
                    }),
                }
            }
        }
        Ok(ranges)
    }

    fn config_set(&self, option: u64, _value: u64) -> Result<()> {
        if self.fail_config.load(Ordering::SeqCst) {
            return Err(ScatterError::transport(
                "config_set",
                format!("option {:#x} rejected", option),
            ));
        }
        let mut calls = self.config_calls.lock().unwrap_or_else(PoisonError::into_inner);
        *calls.entry(option).or_insert(0) += 1;
        Ok(())
    }
}

//! A single scatter batch bound to one transport handle

use std::{
    fmt, mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use log::{debug, trace, warn};

use crate::{
    buffers::PooledBuffer,
    error::{Result, ScatterError},
    session::{Session, SessionStats},
    transport::{Pid, ScatterFlags, ScatterHandle},
};

use super::{
    dispatch::{CompletionReceiver, DispatchSnapshot, ScatterCompletion},
    request::{checked_length, PreparedRequest, RequestKind, SetState},
};

struct PreparedEntry {
    request: PreparedRequest,
    receivers: Vec<CompletionReceiver>,
}

struct SetCore {
    state: SetState,
    entries: Vec<PreparedEntry>,
    catch_all: Vec<CompletionReceiver>,
    dispatching: bool,
}

struct SetInner {
    session: Session,
    pid: Pid,
    flags: ScatterFlags,
    handle: ScatterHandle,
    core: Mutex<SetCore>,
    /// Bumped on clear and dispose; fences pooled views handed out earlier
    epoch: Arc<AtomicU64>,
}

/// Accumulates reads and writes and runs them in one transport round trip
///
/// States move `Open -> Executed -> (clear) -> Open`, and either of those to
/// `Disposed`. Reads allocate nothing until a result is materialized with
/// [`read`](Self::read), [`read_pooled`](Self::read_pooled),
/// [`read_into`](Self::read_into) or [`read_u64`](Self::read_u64).
///
/// The handle is cheap to clone; clones refer to the same batch, which lets
/// completion receivers of one set prepare requests on another.
#[derive(Clone)]
pub struct ScatterRequestSet {
    inner: Arc<SetInner>,
}

impl ScatterRequestSet {
    /// Create a request set on `session` targeting `pid`
    pub fn new(session: Session, pid: Pid, flags: ScatterFlags) -> Result<Self> {
        session.ensure_alive()?;
        let handle = session.transport().scatter_initialize(pid, flags)?;
        debug!(
            "session {}: scatter set {} opened (pid {}, flags {:#x})",
            session.id(),
            handle.0,
            pid,
            flags.bits()
        );

        Ok(Self {
            inner: Arc::new(SetInner {
                session,
                pid,
                flags,
                handle,
                core: Mutex::new(SetCore {
                    state: SetState::Open,
                    entries: Vec::new(),
                    catch_all: Vec::new(),
                    dispatching: false,
                }),
                epoch: Arc::new(AtomicU64::new(0)),
            }),
        })
    }

    fn core(&self) -> MutexGuard<'_, SetCore> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> &SessionStats {
        self.inner.session.stats()
    }

    fn ensure_open(&self, core: &SetCore) -> Result<()> {
        match core.state {
            SetState::Open => self.inner.session.ensure_alive(),
            SetState::Disposed => Err(ScatterError::disposed("scatter request set")),
            SetState::Executed => Err(ScatterError::invalid_state(
                SetState::Open.to_string(),
                SetState::Executed.to_string(),
            )),
        }
    }

    fn ensure_executed(&self, core: &SetCore) -> Result<()> {
        match core.state {
            SetState::Executed => self.inner.session.ensure_alive(),
            SetState::Disposed => Err(ScatterError::disposed("scatter request set")),
            SetState::Open => Err(ScatterError::invalid_state(
                SetState::Executed.to_string(),
                SetState::Open.to_string(),
            )),
        }
    }

    /// Queue a read of `length` bytes at `address`
    pub fn prepare_read(&self, address: u64, length: usize) -> Result<()> {
        self.prepare_read_inner(address, length, None)
    }

    /// Queue a read and bind a receiver to it
    pub fn prepare_read_with<F>(&self, address: u64, length: usize, receiver: F) -> Result<()>
    where
        F: FnMut(&ScatterCompletion<'_>) + Send + 'static,
    {
        self.prepare_read_inner(address, length, Some(Box::new(receiver)))
    }

    fn prepare_read_inner(
        &self,
        address: u64,
        length: usize,
        receiver: Option<CompletionReceiver>,
    ) -> Result<()> {
        let length = checked_length(length)?;
        let mut core = self.core();
        self.ensure_open(&core)?;

        self.inner
            .session
            .transport()
            .scatter_prepare(self.inner.handle, address, length)?;

        core.entries.push(PreparedEntry {
            request: PreparedRequest {
                address,
                length,
                kind: RequestKind::Read,
            },
            receivers: receiver.into_iter().collect(),
        });
        SessionStats::bump(&self.stats().reads_prepared);
        Ok(())
    }

    /// Queue a write of `data` at `address`
    ///
    /// The transport takes its own copy before this returns, so `data` may be
    /// reused immediately.
    pub fn prepare_write(&self, address: u64, data: &[u8]) -> Result<()> {
        let length = checked_length(data.len())?;
        let mut core = self.core();
        self.ensure_open(&core)?;

        self.inner
            .session
            .transport()
            .scatter_prepare_write(self.inner.handle, address, data)?;

        core.entries.push(PreparedEntry {
            request: PreparedRequest {
                address,
                length,
                kind: RequestKind::Write,
            },
            receivers: Vec::new(),
        });
        SessionStats::bump(&self.stats().writes_prepared);
        Ok(())
    }

    /// Bind a receiver to an already prepared read
    pub fn add_receiver<F>(&self, address: u64, length: usize, receiver: F) -> Result<()>
    where
        F: FnMut(&ScatterCompletion<'_>) + Send + 'static,
    {
        let length = checked_length(length)?;
        let mut core = self.core();
        if core.state == SetState::Disposed {
            return Err(ScatterError::disposed("scatter request set"));
        }

        let entry = core
            .entries
            .iter_mut()
            .find(|entry| entry.request.is_read_of(address, length))
            .ok_or_else(|| {
                ScatterError::invalid_parameter(
                    "address",
                    format!("no read of {} bytes prepared at {:#x}", length, address),
                )
            })?;
        entry.receivers.push(Box::new(receiver));
        Ok(())
    }

    /// Register a receiver called for every prepared read
    ///
    /// Catch-all receivers stay registered across [`clear`](Self::clear).
    pub fn on_completed<F>(&self, receiver: F) -> Result<()>
    where
        F: FnMut(&ScatterCompletion<'_>) + Send + 'static,
    {
        let mut core = self.core();
        if core.state == SetState::Disposed {
            return Err(ScatterError::disposed("scatter request set"));
        }
        core.catch_all.push(Box::new(receiver));
        Ok(())
    }

    /// Run every prepared request in one transport call, then dispatch
    ///
    /// Executing an already executed set re-runs the same requests. An empty
    /// set moves to `Executed` without touching the transport. A failed
    /// transport call leaves the set `Open` with its requests intact.
    pub fn execute(&self) -> Result<()> {
        let mut snapshot = {
            let mut core = self.core();
            if core.dispatching {
                return Err(ScatterError::ReentrantExecute);
            }
            if core.state == SetState::Disposed {
                return Err(ScatterError::disposed("scatter request set"));
            }
            self.inner.session.ensure_alive()?;

            if !core.entries.is_empty() {
                if let Err(e) = self
                    .inner
                    .session
                    .transport()
                    .scatter_execute(self.inner.handle)
                {
                    core.state = SetState::Open;
                    SessionStats::bump(&self.stats().transport_failures);
                    warn!(
                        "session {}: scatter set {} execute failed: {}",
                        self.inner.session.id(),
                        self.inner.handle.0,
                        e
                    );
                    return Err(e);
                }
                SessionStats::bump(&self.stats().executions);
            }
            core.state = SetState::Executed;
            trace!(
                "scatter set {} executed {} request(s)",
                self.inner.handle.0,
                core.entries.len()
            );
            Self::take_snapshot(&mut core)
        };

        let mut guard = DispatchGuard {
            set: self,
            snapshot: &mut snapshot,
        };
        let invoked = guard.snapshot.run(guard.set);
        drop(guard);

        SessionStats::add(&self.stats().completions_dispatched, invoked);
        Ok(())
    }

    fn take_snapshot(core: &mut SetCore) -> DispatchSnapshot {
        core.dispatching = true;
        let reads = core
            .entries
            .iter_mut()
            .enumerate()
            .filter(|(_, entry)| entry.request.kind == RequestKind::Read)
            .map(|(index, entry)| {
                (
                    index,
                    entry.request.address,
                    entry.request.length,
                    mem::take(&mut entry.receivers),
                )
            })
            .collect();
        DispatchSnapshot {
            reads,
            catch_all: mem::take(&mut core.catch_all),
        }
    }

    fn restore_snapshot(&self, snapshot: &mut DispatchSnapshot) {
        let mut core = self.core();
        for (index, _, _, receivers) in snapshot.reads.iter_mut() {
            if let Some(entry) = core.entries.get_mut(*index) {
                let added = mem::replace(&mut entry.receivers, mem::take(receivers));
                entry.receivers.extend(added);
            }
        }
        let added = mem::replace(&mut core.catch_all, mem::take(&mut snapshot.catch_all));
        core.catch_all.extend(added);
        core.dispatching = false;
    }

    fn materialize(&self, address: u64, dest: &mut [u8]) -> Result<bool> {
        let length = checked_length(dest.len())?;
        let core = self.core();
        self.ensure_executed(&core)?;

        let prepared = core
            .entries
            .iter()
            .any(|entry| entry.request.is_read_of(address, length));
        if !prepared {
            return Ok(false);
        }

        let copied = self
            .inner
            .session
            .transport()
            .scatter_read(self.inner.handle, address, dest)?;
        if copied == dest.len() {
            SessionStats::bump(&self.stats().reads_materialized);
            Ok(true)
        } else {
            SessionStats::bump(&self.stats().reads_failed);
            Ok(false)
        }
    }

    /// Copy of the executed read at `address`/`length`
    ///
    /// `Ok(None)` if that exact read was never prepared or the transport had
    /// no complete data for it.
    pub fn read(&self, address: u64, length: usize) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; checked_length(length)? as usize];
        Ok(self.materialize(address, &mut buf)?.then_some(buf))
    }

    /// Executed read in a buffer rented from the session's pool
    ///
    /// The returned view stops being readable once this set is cleared or
    /// disposed.
    pub fn read_pooled(&self, address: u64, length: usize) -> Result<Option<PooledBuffer>> {
        checked_length(length)?;
        let mut buffer = self.inner.session.buffer_pool().rent(length)?;
        let found = self.materialize(address, buffer.as_mut_slice()?)?;
        Ok(found.then(|| buffer.fenced(&self.inner.epoch)))
    }

    /// Executed read copied into `dest`; the read must have `dest.len()` bytes
    pub fn read_into(&self, address: u64, dest: &mut [u8]) -> Result<bool> {
        self.materialize(address, dest)
    }

    /// Little-endian u64 from an 8-byte read at `address`
    pub fn read_u64(&self, address: u64) -> Result<Option<u64>> {
        let mut bytes = [0u8; 8];
        Ok(self
            .materialize(address, &mut bytes)?
            .then(|| u64::from_le_bytes(bytes)))
    }

    /// Drop prepared requests and their receivers, returning to `Open`
    pub fn clear(&self) -> Result<()> {
        let mut core = self.core();
        if core.dispatching {
            return Err(ScatterError::busy("clear"));
        }
        if core.state == SetState::Disposed {
            return Err(ScatterError::disposed("scatter request set"));
        }
        self.inner.session.ensure_alive()?;

        self.inner.session.transport().scatter_clear(
            self.inner.handle,
            self.inner.pid,
            self.inner.flags,
        )?;
        core.entries.clear();
        core.state = SetState::Open;
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Release the transport handle; later calls are no-ops
    pub fn dispose(&self) -> Result<()> {
        let mut core = self.core();
        if core.dispatching {
            return Err(ScatterError::busy("dispose"));
        }
        if core.state == SetState::Disposed {
            return Ok(());
        }
        self.inner
            .session
            .transport()
            .scatter_close(self.inner.handle);
        core.state = SetState::Disposed;
        core.entries.clear();
        core.catch_all.clear();
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        debug!("scatter set {} disposed", self.inner.handle.0);
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> SetState {
        self.core().state
    }

    /// Target pid
    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    /// Batch flags
    pub fn flags(&self) -> ScatterFlags {
        self.inner.flags
    }

    /// Owning session
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Number of prepared requests
    pub fn len(&self) -> usize {
        self.core().entries.len()
    }

    /// Whether nothing is prepared
    pub fn is_empty(&self) -> bool {
        self.core().entries.is_empty()
    }

    /// Prepared requests in preparation order
    pub fn prepared(&self) -> Vec<PreparedRequest> {
        self.core().entries.iter().map(|entry| entry.request).collect()
    }

    /// Whether both handles refer to the same batch
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Puts receivers back and ends the dispatch pass, even if a receiver panics
struct DispatchGuard<'a> {
    set: &'a ScatterRequestSet,
    snapshot: &'a mut DispatchSnapshot,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.set.restore_snapshot(self.snapshot);
    }
}

impl Drop for SetInner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        if core.state != SetState::Disposed {
            self.session.transport().scatter_close(self.handle);
            core.state = SetState::Disposed;
            trace!("scatter set {} closed on drop", self.handle.0);
        }
    }
}

impl fmt::Debug for ScatterRequestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("ScatterRequestSet")
            .field("handle", &self.inner.handle.0)
            .field("pid", &self.inner.pid)
            .field("flags", &self.inner.flags)
            .field("state", &core.state)
            .field("prepared", &core.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn setup() -> (Arc<LoopbackTransport>, Session) {
        let transport = Arc::new(LoopbackTransport::new());
        transport.write_memory(Pid(4), 0x1000, &[0x11; 64]);
        let session = Session::new(transport.clone()).unwrap();
        (transport, session)
    }

    #[test]
    fn test_state_machine() {
        let (_, session) = setup();
        let set = session.scatter(Pid(4)).unwrap();
        assert_eq!(set.state(), SetState::Open);

        set.prepare_read(0x1000, 16).unwrap();
        set.prepare_write(0x2000, &[1, 2]).unwrap();
        let prepared = set.prepared();
        assert_eq!(prepared.len(), 2);
        assert!(prepared[0].is_read_of(0x1000, 16));
        assert_eq!(prepared[1].kind, RequestKind::Write);
        assert_eq!(prepared[1].length, 2);

        set.execute().unwrap();
        assert_eq!(set.state(), SetState::Executed);
        assert!(matches!(
            set.prepare_read(0x1010, 16),
            Err(ScatterError::InvalidState { .. })
        ));

        set.clear().unwrap();
        assert_eq!(set.state(), SetState::Open);
        assert!(set.is_empty());

        set.dispose().unwrap();
        set.dispose().unwrap();
        assert_eq!(set.state(), SetState::Disposed);
        assert!(matches!(
            set.prepare_read(0x1000, 16),
            Err(ScatterError::Disposed { .. })
        ));
        assert!(set.execute().is_err());
        assert!(set.clear().is_err());
    }

    #[test]
    fn test_zero_length_rejected() {
        let (_, session) = setup();
        let set = session.scatter(Pid(4)).unwrap();
        assert!(matches!(
            set.prepare_read(0x1000, 0),
            Err(ScatterError::InvalidParameter { .. })
        ));
        assert!(set.prepare_write(0x1000, &[]).is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn test_read_requires_exact_pair() {
        let (_, session) = setup();
        let set = session.scatter(Pid(4)).unwrap();
        set.prepare_read(0x1000, 16).unwrap();
        assert!(set.read(0x1000, 16).is_err());

        set.execute().unwrap();
        assert_eq!(set.read(0x1000, 16).unwrap(), Some(vec![0x11; 16]));
        assert_eq!(set.read(0x1000, 8).unwrap(), None);
        assert_eq!(set.read(0x2000, 16).unwrap(), None);
    }

    #[test]
    fn test_oversized_read_is_usage_error() {
        let (_, session) = setup();
        let set = session.scatter(Pid(4)).unwrap();
        set.prepare_read(0x1000, 16).unwrap();
        set.execute().unwrap();

        for length in [crate::config::MAX_REQUEST_LENGTH as usize + 1, usize::MAX] {
            assert!(matches!(
                set.read(0x1000, length),
                Err(ScatterError::InvalidParameter { .. })
            ));
            assert!(matches!(
                set.read_pooled(0x1000, length),
                Err(ScatterError::InvalidParameter { .. })
            ));
        }
        assert!(set.read(0x1000, 0).is_err());
    }

    #[test]
    fn test_reentrant_execute_rejected() {
        let (_, session) = setup();
        let set = session.scatter(Pid(4)).unwrap();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        set.prepare_read_with(0x1000, 8, move |completion| {
            let outcome = completion.set().execute();
            sink.lock()
                .unwrap()
                .push(matches!(outcome, Err(ScatterError::ReentrantExecute)));
            assert!(completion.set().clear().is_err());
        })
        .unwrap();

        set.execute().unwrap();
        assert_eq!(*results.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_drop_closes_handle() {
        let (transport, session) = setup();
        {
            let set = session.scatter(Pid(4)).unwrap();
            set.prepare_read(0x1000, 8).unwrap();
            assert_eq!(transport.open_handles(), 1);
        }
        assert_eq!(transport.open_handles(), 0);
    }

    #[test]
    fn test_failed_execute_leaves_set_open() {
        let (transport, session) = setup();
        let set = session.scatter(Pid(4)).unwrap();
        set.prepare_read(0x1000, 8).unwrap();

        transport.set_fail_execute(true);
        assert!(matches!(set.execute(), Err(ScatterError::Transport { .. })));
        assert_eq!(set.state(), SetState::Open);
        assert_eq!(session.stats().snapshot().transport_failures, 1);

        transport.set_fail_execute(false);
        set.execute().unwrap();
        assert_eq!(set.read(0x1000, 8).unwrap(), Some(vec![0x11; 8]));
    }
}

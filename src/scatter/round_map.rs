//! Ordered rounds of scatter batches for dependent reads
//!
//! Each round is a full [`ScatterRequestSet`]. Rounds run strictly in the
//! order they were added, and a round's completion receivers may prepare
//! requests on later rounds (or add new rounds) before those rounds run.
//! A pointer chain of depth N therefore costs N round trips, not one per
//! pointer.
//!
//! The [`ScatterRoundMap`] owns its rounds and disposes them when dropped.
//! Receivers that need to add rounds hold a [`RoundMapHandle`], which does
//! not keep the map alive.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use log::{debug, warn};

use crate::{
    error::{Result, ScatterError},
    session::{Session, SessionStats},
    transport::{Pid, ScatterFlags},
};

use super::{request::SetState, set::ScatterRequestSet};

struct RoundMapInner {
    session: Session,
    pid: Pid,
    flags: ScatterFlags,
    rounds: Mutex<Vec<ScatterRequestSet>>,
    disposed: Mutex<bool>,
}

impl RoundMapInner {
    fn rounds(&self) -> MutexGuard<'_, Vec<ScatterRequestSet>> {
        self.rounds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_usable(&self) -> Result<()> {
        if *self.disposed.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(ScatterError::disposed("scatter round map"));
        }
        self.session.ensure_alive()
    }

    fn add_round_with_flags(&self, flags: ScatterFlags) -> Result<ScatterRequestSet> {
        self.ensure_usable()?;
        let round = ScatterRequestSet::new(self.session.clone(), self.pid, flags)?;
        self.rounds().push(round.clone());
        Ok(round)
    }

    fn round(&self, index: usize) -> Option<ScatterRequestSet> {
        self.rounds().get(index).cloned()
    }
}

impl Drop for RoundMapInner {
    fn drop(&mut self) {
        let rounds = self.rounds.get_mut().unwrap_or_else(PoisonError::into_inner);
        for round in rounds.drain(..) {
            if let Err(e) = round.dispose() {
                warn!("round map dropped with a round it could not dispose: {}", e);
            }
        }
    }
}

/// Sequence of request sets executed round by round
///
/// Dropping the map disposes every round, including rounds whose receivers
/// still hold handles to other rounds.
pub struct ScatterRoundMap {
    inner: Arc<RoundMapInner>,
}

impl ScatterRoundMap {
    /// Create an empty round map
    pub fn new(session: Session, pid: Pid, flags: ScatterFlags) -> Result<Self> {
        session.ensure_alive()?;
        Ok(Self {
            inner: Arc::new(RoundMapInner {
                session,
                pid,
                flags,
                rounds: Mutex::new(Vec::new()),
                disposed: Mutex::new(false),
            }),
        })
    }

    /// Weak handle for receivers that add rounds while the map runs
    pub fn handle(&self) -> RoundMapHandle {
        RoundMapHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Append a round using the map's flags
    pub fn add_round(&self) -> Result<ScatterRequestSet> {
        self.inner.add_round_with_flags(self.inner.flags)
    }

    /// Append a round with its own flags
    pub fn add_round_with_flags(&self, flags: ScatterFlags) -> Result<ScatterRequestSet> {
        self.inner.add_round_with_flags(flags)
    }

    /// Round at `index`, if it exists
    pub fn round(&self, index: usize) -> Option<ScatterRequestSet> {
        self.inner.round(index)
    }

    /// Number of rounds added so far
    pub fn round_count(&self) -> usize {
        self.inner.rounds().len()
    }

    /// Target pid shared by every round
    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    /// Default flags for new rounds
    pub fn flags(&self) -> ScatterFlags {
        self.inner.flags
    }

    /// Owning session
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Execute every round in order
    ///
    /// Round N's dispatch finishes before round N+1 executes. Rounds added
    /// during execution are picked up when their turn arrives. Rounds with
    /// nothing prepared cost no round trip. The first transport failure stops
    /// the map and is returned.
    ///
    /// Once the first round has executed, running the map again clears every
    /// later round first, so their requests must come from earlier rounds'
    /// receivers.
    pub fn execute(&self) -> Result<()> {
        self.inner.ensure_usable()?;

        let rerun = self
            .inner
            .round(0)
            .is_some_and(|first| first.state() == SetState::Executed);
        if rerun {
            let later: Vec<ScatterRequestSet> =
                self.inner.rounds().iter().skip(1).cloned().collect();
            for round in &later {
                round.clear()?;
            }
            debug!(
                "session {}: cleared {} dependent round(s) before re-run",
                self.inner.session.id(),
                later.len()
            );
        }

        let mut index = 0;
        let mut executed = 0;
        while let Some(round) = self.inner.round(index) {
            round.execute()?;
            if !round.is_empty() {
                executed += 1;
            }
            index += 1;
        }

        SessionStats::bump(&self.inner.session.stats().round_maps_executed);
        debug!(
            "session {}: round map executed {} of {} round(s)",
            self.inner.session.id(),
            executed,
            index
        );
        Ok(())
    }

    /// Dispose every round; later calls are no-ops
    pub fn dispose(&self) -> Result<()> {
        {
            let mut disposed = self
                .inner
                .disposed
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *disposed {
                return Ok(());
            }
            *disposed = true;
        }
        let rounds: Vec<ScatterRequestSet> = self.inner.rounds().drain(..).collect();
        for round in rounds {
            round.dispose()?;
        }
        Ok(())
    }
}

impl fmt::Debug for ScatterRoundMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScatterRoundMap")
            .field("pid", &self.inner.pid)
            .field("flags", &self.inner.flags)
            .field("rounds", &self.round_count())
            .finish()
    }
}

/// Non-owning reference to a [`ScatterRoundMap`]
///
/// Once the map is gone, adding rounds fails with [`ScatterError::Disposed`]
/// and lookups find nothing.
#[derive(Clone)]
pub struct RoundMapHandle {
    inner: Weak<RoundMapInner>,
}

impl RoundMapHandle {
    fn upgrade(&self) -> Result<Arc<RoundMapInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| ScatterError::disposed("scatter round map"))
    }

    /// Append a round using the map's flags
    pub fn add_round(&self) -> Result<ScatterRequestSet> {
        let inner = self.upgrade()?;
        inner.add_round_with_flags(inner.flags)
    }

    /// Append a round with its own flags
    pub fn add_round_with_flags(&self, flags: ScatterFlags) -> Result<ScatterRequestSet> {
        self.upgrade()?.add_round_with_flags(flags)
    }

    /// Round at `index`, if the map and the round both exist
    pub fn round(&self, index: usize) -> Option<ScatterRequestSet> {
        self.inner.upgrade()?.round(index)
    }

    /// Number of rounds, zero once the map is gone
    pub fn round_count(&self) -> usize {
        self.inner
            .upgrade()
            .map_or(0, |inner| inner.rounds().len())
    }

    /// Whether the map still exists
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl fmt::Debug for RoundMapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundMapHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

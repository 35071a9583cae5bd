//! Process-wide registry of background refresh loops

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    error::{Result, ScatterError},
    session::{Session, SessionId, SessionStats},
};

use super::option::RefreshOption;

type SchedulerKey = (SessionId, RefreshOption);

/// Cooperative stop signal observed at tick boundaries
#[derive(Debug, Default)]
struct CancelSignal {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelSignal {
    fn cancel(&self) {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `timeout`; returns true if cancelled first
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .wake
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            cancelled = guard;
        }
        true
    }
}

#[derive(Debug)]
struct SchedulerEntry {
    cancel: Arc<CancelSignal>,
    interval: Duration,
    // Detached on removal; the loop exits on its own at the next tick boundary.
    _thread: JoinHandle<()>,
}

/// Created on first registration, reset to `None` once the last entry goes
static REGISTRY: Mutex<Option<HashMap<SchedulerKey, SchedulerEntry>>> = Mutex::new(None);

fn registry() -> MutexGuard<'static, Option<HashMap<SchedulerKey, SchedulerEntry>>> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_loop(
    session: Session,
    option: RefreshOption,
    interval: Duration,
    cancel: Arc<CancelSignal>,
) {
    debug!(
        "refresh loop started: session {}, option {}, every {:?}",
        session.id(),
        option,
        interval
    );
    loop {
        if cancel.wait(interval) || cancel.is_cancelled() {
            break;
        }
        if !session.is_alive() {
            debug!("refresh loop: session {} is gone", session.id());
            break;
        }
        match session.config_set(option.id(), 1) {
            Ok(()) => SessionStats::bump(&session.stats().refresh_ticks),
            Err(e) => {
                SessionStats::bump(&session.stats().refresh_failures);
                warn!(
                    "refresh tick failed: session {}, option {}: {}",
                    session.id(),
                    option,
                    e
                );
            }
        }
    }
    debug!(
        "refresh loop stopped: session {}, option {}",
        session.id(),
        option
    );
}

/// Start a background loop refreshing `option` on `session` every `interval`
///
/// Fails with [`ScatterError::DuplicateRegistration`] if a loop already
/// exists for this session and option.
pub fn register(session: &Session, option: RefreshOption, interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(ScatterError::invalid_parameter(
            "interval",
            "Refresh interval must be greater than zero",
        ));
    }

    let mut registry = registry();
    session.ensure_alive()?;

    let key = (session.id(), option);
    if registry.as_ref().is_some_and(|map| map.contains_key(&key)) {
        return Err(ScatterError::DuplicateRegistration {
            session: session.id().0,
            option: option.to_string(),
        });
    }

    let cancel = Arc::new(CancelSignal::default());
    let thread = {
        let session = session.clone();
        let cancel = Arc::clone(&cancel);
        thread::Builder::new()
            .name(format!("refresh-{}-{}", session.id(), option.name()))
            .spawn(move || run_loop(session, option, interval, cancel))
            .map_err(|e| ScatterError::thread(e, "failed to spawn refresh loop"))?
    };

    registry.get_or_insert_with(HashMap::new).insert(
        key,
        SchedulerEntry {
            cancel,
            interval,
            _thread: thread,
        },
    );
    info!(
        "refresh registered: session {}, option {}, every {:?}",
        session.id(),
        option,
        interval
    );
    Ok(())
}

/// Register `option` with its default interval
pub fn register_default(session: &Session, option: RefreshOption) -> Result<()> {
    register(session, option, option.default_interval())
}

fn remove_where<F>(registry: &mut Option<HashMap<SchedulerKey, SchedulerEntry>>, keep: F) -> usize
where
    F: Fn(&SchedulerKey) -> bool,
{
    let Some(map) = registry.as_mut() else {
        return 0;
    };
    let before = map.len();
    map.retain(|key, entry| {
        if keep(key) {
            true
        } else {
            entry.cancel.cancel();
            false
        }
    });
    let removed = before - map.len();
    if map.is_empty() {
        *registry = None;
    }
    removed
}

/// Stop and remove the loop for `session` and `option`
pub fn unregister(session: &Session, option: RefreshOption) -> Result<()> {
    let key = (session.id(), option);
    let removed = remove_where(&mut registry(), |k| *k != key);
    if removed == 0 {
        return Err(ScatterError::NotRegistered {
            session: session.id().0,
            option: option.to_string(),
        });
    }
    info!(
        "refresh unregistered: session {}, option {}",
        session.id(),
        option
    );
    Ok(())
}

/// Stop and remove every loop for `session`; returns how many were stopped
pub fn unregister_all(session: &Session) -> usize {
    let id = session.id();
    let removed = remove_where(&mut registry(), |(session_id, _)| *session_id != id);
    if removed > 0 {
        info!("refresh: stopped {} loop(s) for session {}", removed, id);
    }
    removed
}

/// Whether a loop exists for `session` and `option`
pub fn is_registered(session: &Session, option: RefreshOption) -> bool {
    registry()
        .as_ref()
        .is_some_and(|map| map.contains_key(&(session.id(), option)))
}

/// Options with an active loop for `session`, with their intervals
pub fn registered_for(session: &Session) -> Vec<(RefreshOption, Duration)> {
    let registry = registry();
    let mut options: Vec<(RefreshOption, Duration)> = registry
        .iter()
        .flat_map(|map| map.iter())
        .filter(|((session_id, _), _)| *session_id == session.id())
        .map(|((_, option), entry)| (*option, entry.interval))
        .collect();
    options.sort();
    options
}

/// Total number of active loops across all sessions
pub fn registered_count() -> usize {
    registry().as_ref().map_or(0, HashMap::len)
}

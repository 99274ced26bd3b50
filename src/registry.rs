//! The set of active trace sessions, one per traced thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, Detached, Handle, StepMode, OBSERVER_EVENTS};
use crate::error::{should_warn, Error, Result};
use crate::powerpc::AtomicStepState;
use crate::probe::Probe;
use crate::ptracer::Pid;

/// Controller state of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Stepping,
    InAtomicSequence,
    Detached,
}

/// Why a session is being removed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reason {
    /// Requested by the caller.
    Explicit,

    /// The thread reported its death. Its process, and memory image, may be gone too.
    Death,

    /// Engine teardown.
    Teardown,
}

/// Mutable per-session state, touched by the thread's one in-flight event or teardown.
#[derive(Debug)]
pub(crate) struct Stepping {
    pub(crate) state: State,
    pub(crate) atomic: Option<AtomicStepState>,
}

impl Stepping {
    /// How to resume the thread when the engine has nothing to add.
    pub(crate) fn resume_mode(&self, mode: StepMode) -> Option<StepMode> {
        match self.state {
            State::Stepping => Some(mode),
            State::InAtomicSequence | State::Detached => None,
        }
    }
}

/// One actively traced thread.
#[derive(Debug)]
pub struct Session {
    tid: Pid,
    mode: StepMode,
    probe: Arc<Probe>,
    handle: Handle,
    stepping: Mutex<Stepping>,
    faults: AtomicU64,
}

impl Session {
    pub fn tid(&self) -> Pid {
        self.tid
    }

    pub fn mode(&self) -> StepMode {
        self.mode
    }

    pub fn probe(&self) -> &Arc<Probe> {
        &self.probe
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn state(&self) -> State {
        self.stepping().state
    }

    /// Whether overlay breakpoints are currently installed for this thread.
    pub fn in_atomic_sequence(&self) -> bool {
        self.stepping()
            .atomic
            .as_ref()
            .map_or(false, AtomicStepState::in_sequence)
    }

    /// Snapshot of the atomic stepping state, if the session carries one.
    pub fn atomic_state(&self) -> Option<AtomicStepState> {
        self.stepping().atomic.clone()
    }

    pub(crate) fn stepping(&self) -> MutexGuard<'_, Stepping> {
        self.stepping.lock().expect("trace session lock poisoned")
    }

    // Log a recoverable memory fault, throttled per session.
    pub(crate) fn note_fault(&self, what: &str, err: &Error) {
        let count = self.faults.fetch_add(1, Ordering::Relaxed);

        if should_warn(count) {
            warn!(tid = self.tid.as_raw(), faults = count + 1, %err, "{}", what);
        } else {
            trace!(tid = self.tid.as_raw(), %err, "{}", what);
        }
    }
}

/// Lock-protected map of trace sessions, keyed by thread id.
///
/// Removing a session and detaching its backend observer happen in one critical section,
/// so each session is released exactly once no matter how many paths race to end it.
#[derive(Debug)]
pub struct Registry<B> {
    backend: Arc<B>,
    sessions: Mutex<HashMap<Pid, Arc<Session>>>,
}

impl<B: Backend> Registry<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let sessions = Mutex::new(HashMap::new());

        Self { backend, sessions }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Pid, Arc<Session>>> {
        self.sessions.lock().expect("trace session registry lock poisoned")
    }

    /// Attach an observer to `tid` and register a session for it.
    pub fn create(
        &self,
        tid: Pid,
        mode: StepMode,
        probe: Arc<Probe>,
        atomic: Option<AtomicStepState>,
    ) -> Result<Arc<Session>> {
        if !self.backend.thread_exists(tid) {
            return Err(Error::ThreadNotFound { tid });
        }

        let mut sessions = self.sessions();

        if sessions.contains_key(&tid) {
            return Err(Error::AlreadyTraced { tid });
        }

        let handle = self.backend
            .attach(tid, OBSERVER_EVENTS)
            .map_err(|err| Error::AttachFailed { tid, source: Box::new(err) })?;

        if let Err(err) = self.backend.set_step_mode(tid, handle, mode) {
            if let Err(detach_err) = self.backend.detach(tid, handle) {
                warn!(tid = tid.as_raw(), %detach_err, "could not detach after failed step mode change");
            }

            return Err(Error::AttachFailed { tid, source: Box::new(err) });
        }

        let stepping = Mutex::new(Stepping { state: State::Stepping, atomic });
        let faults = AtomicU64::new(0);
        let session = Arc::new(Session { tid, mode, probe, handle, stepping, faults });

        sessions.insert(tid, session.clone());
        info!(tid = tid.as_raw(), %handle, ?mode, "created trace session");

        Ok(session)
    }

    pub fn find(&self, tid: Pid) -> Option<Arc<Session>> {
        self.sessions().get(&tid).cloned()
    }

    /// Remove `session`, if it is still the registered session for its thread, and
    /// detach it.
    pub fn remove_and_detach(&self, session: &Session, reason: Reason) -> Detached {
        let mut sessions = self.sessions();

        let registered = sessions
            .get(&session.tid)
            .map_or(false, |s| std::ptr::eq(Arc::as_ptr(s), session));

        if !registered {
            debug!(tid = session.tid.as_raw(), ?reason, "session already removed");
            return Detached::AlreadyDetached;
        }

        if let Some(session) = sessions.remove(&session.tid) {
            self.release(&session, reason);
        }

        Detached::Detached
    }

    /// Remove and detach whatever session is registered for `tid`.
    pub fn remove(&self, tid: Pid, reason: Reason) -> Detached {
        let mut sessions = self.sessions();

        match sessions.remove(&tid) {
            Some(session) => {
                self.release(&session, reason);
                Detached::Detached
            },
            None => {
                debug!(tid = tid.as_raw(), ?reason, "no session to remove");
                Detached::AlreadyDetached
            },
        }
    }

    /// Remove and detach every session. Returns the number removed.
    pub fn drain_all(&self) -> usize {
        let mut sessions = self.sessions();
        let count = sessions.len();

        for (_, session) in sessions.drain() {
            self.release(&session, Reason::Teardown);
        }

        if count > 0 {
            info!(count, "drained trace sessions");
        }

        count
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn tids(&self) -> Vec<Pid> {
        let mut tids: Vec<_> = self.sessions().keys().copied().collect();
        tids.sort_by_key(|tid| tid.as_raw());
        tids
    }

    // Called with the registry lock held, after the session was unlinked.
    fn release(&self, session: &Session, reason: Reason) {
        let tid = session.tid;
        let mut stepping = session.stepping();

        // Sibling threads may still run this text, even when `tid` itself died.
        if let Some(atomic) = stepping.atomic.as_mut().filter(|a| a.in_sequence()) {
            let restored = self.backend
                .memory(tid)
                .and_then(|mut memory| atomic.finish(&mut memory));

            match restored {
                Ok(()) => {},
                Err(err) if reason == Reason::Death && err.image_gone() => {
                    trace!(tid = tid.as_raw(), %err, "process image gone, breakpoints not restored");
                },
                Err(err) => session.note_fault("could not restore atomic-sequence breakpoints", &err),
            }
        }

        stepping.state = State::Detached;
        drop(stepping);

        match self.backend.detach(tid, session.handle) {
            Ok(detached) => {
                info!(tid = tid.as_raw(), handle = %session.handle, ?reason, ?detached, "removed trace session");
            },
            Err(err) => {
                warn!(tid = tid.as_raw(), handle = %session.handle, %err, "backend detach failed");
            },
        }
    }
}

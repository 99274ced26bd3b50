//! Entry points for starting and ending traces.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{Backend, Detached, StepMode};
use crate::error::Result;
use crate::powerpc::AtomicStepState;
use crate::probe::Probe;
use crate::ptracer::Pid;
use crate::registry::{Reason, Registry, Session};

/// Instruction set whose stepping quirks the engine handles.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arch {
    /// Steps over `lwarx`/`stwcx.` sequences with overlay breakpoints.
    PowerPc,

    /// Plain stepping.
    Generic,
}

impl Arch {
    pub fn host() -> Self {
        if cfg!(target_arch = "powerpc64") {
            Arch::PowerPc
        } else {
            Arch::Generic
        }
    }

    fn atomic_state(self) -> Option<AtomicStepState> {
        match self {
            Arch::PowerPc => Some(AtomicStepState::default()),
            Arch::Generic => None,
        }
    }
}

/// Instruction tracing engine over a backend `B`.
///
/// Dropping the engine ends every remaining trace.
#[derive(Debug)]
pub struct Engine<B: Backend> {
    pub(crate) backend: Arc<B>,
    pub(crate) registry: Registry<B>,
    arch: Arch,
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B) -> Self {
        let backend = Arc::new(backend);
        let registry = Registry::new(backend.clone());
        let arch = Arch::host();

        Self { backend, registry, arch }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &Registry<B> {
        &self.registry
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Set the architecture used for sessions created from now on.
    pub fn set_arch(&mut self, arch: Arch) {
        self.arch = arch;
    }

    /// Start tracing `tid`, firing `probe` after every step.
    pub fn begin_trace(&self, tid: Pid, mode: StepMode, probe: Arc<Probe>) -> Result<()> {
        let atomic = self.arch.atomic_state();
        let session = self.registry.create(tid, mode, probe, atomic)?;

        debug!(tid = session.tid().as_raw(), probe = session.probe().point(), "trace started");

        Ok(())
    }

    pub fn session(&self, tid: Pid) -> Option<Arc<Session>> {
        self.registry.find(tid)
    }

    /// Stop tracing `tid`.
    pub fn end_trace(&self, tid: Pid) -> Detached {
        self.registry.remove(tid, Reason::Explicit)
    }

    /// Stop every trace. Returns the number of sessions ended.
    pub fn end_all_traces(&self) -> usize {
        let count = self.registry.drain_all();
        info!(count, "ended all traces");
        count
    }
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.registry.drain_all();
    }
}

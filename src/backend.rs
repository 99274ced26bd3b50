//! The capabilities the engine consumes from a tracing backend, and the messages
//! exchanged with it.
//!
//! A backend delivers [`Event`]s for each observed thread strictly in the order they
//! occur on that thread, one at a time, and applies the [`Action`] the engine returns.
//! Events for different threads may be dispatched concurrently.

use std::fmt;

use crate::error::Result;
use crate::ptracer::{Options, Pid, Signal};
use crate::regs::Registers;

/// Granularity at which a traced thread reports traps.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StepMode {
    /// Trap after every machine instruction.
    Instruction,

    /// Trap after every taken branch, i.e. once per basic block.
    Block,
}

/// Events every observer subscribes to: clone and exit reports. Signal reports are
/// always delivered.
pub const OBSERVER_EVENTS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEEXIT);

/// Opaque token identifying one observer attachment.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Handle(u64);

impl Handle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of a detach request. Detaching is idempotent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Detached {
    Detached,
    AlreadyDetached,
}

/// An event reported by the backend for a traced thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// A signal is about to be delivered. Step and breakpoint traps arrive as `SIGTRAP`.
    ///
    /// `aux` is an architecture-specific scalar sampled alongside the registers (the
    /// sampled data address register on PowerPC), or `0` if the backend has none.
    Signal { signal: Signal, regs: Registers, aux: u64 },

    /// The thread created a new thread.
    Clone { new: Pid },

    /// The thread is exiting.
    Death,
}

/// How the backend should resume a thread after an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Resume, delivering the pending signal. If `step` is set, the thread is restarted
    /// with stepping armed in that mode, otherwise it runs freely.
    Resume { step: Option<StepMode> },

    /// Resume, suppressing the pending signal and hiding it from other observers.
    ResumeHideSignal { step: Option<StepMode> },

    /// Release the thread.
    Detach,
}

/// Cross-process access to a tracee's memory image.
pub trait Memory {
    /// Read up to `data.len()` bytes at `addr`, returning the count actually read.
    fn read(&self, addr: u64, data: &mut [u8]) -> Result<usize>;

    /// Write up to `data.len()` bytes at `addr`, returning the count actually written.
    ///
    /// Must report short writes via the returned count rather than claim success.
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<usize>;
}

/// Attach/detach/stepping facility the engine is built on.
pub trait Backend: Send + Sync {
    type Memory: Memory;

    /// Whether `tid` names a live thread.
    fn thread_exists(&self, tid: Pid) -> bool;

    /// Attach an observer to `tid`, subscribing to `events`.
    fn attach(&self, tid: Pid, events: Options) -> Result<Handle>;

    /// Configure the step granularity of an attached observer.
    fn set_step_mode(&self, tid: Pid, handle: Handle, mode: StepMode) -> Result<()>;

    /// Detach an observer. Detaching an unknown or already-detached observer is not an error.
    fn detach(&self, tid: Pid, handle: Handle) -> Result<Detached>;

    /// Open the memory image of the process owning `tid`.
    fn memory(&self, tid: Pid) -> Result<Self::Memory>;
}

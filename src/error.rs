use std::io;

use nix::errno::Errno;

use crate::backend::Action;
use crate::ptracer::Pid;


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("No such thread = {tid}")]
    ThreadNotFound { tid: Pid },

    #[error("Thread = {tid} is already being traced")]
    AlreadyTraced { tid: Pid },

    #[error("Could not attach tracing observer to thread = {tid}")]
    AttachFailed {
        tid: Pid,
        source: Box<Error>,
    },

    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not restart tracee = {pid} with action = {action:?}")]
    Restart { pid: Pid, action: Action, source: nix::Error },

    #[error("Tracee died while stopped, pid = {pid}")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("Could not access tracee memory at {addr:#x}")]
    MemoryAccess { addr: u64, source: io::Error },

    #[error("Short write at {addr:#x}: wrote {written} of {expected} bytes")]
    PartialWrite { addr: u64, written: usize, expected: usize },

    #[error("Unsupported on this host: {0}")]
    Unsupported(&'static str),

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn tracee_died(&self) -> bool {
        match self {
            Error::TraceeDied { .. } => true,
            Error::Restart { source, .. } => *source == Errno::ESRCH,
            _ => false,
        }
    }

    /// True if the target's memory image no longer exists, as after its process exited.
    pub fn image_gone(&self) -> bool {
        match self {
            Error::IO(err) => matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::ESRCH)),
            _ => self.tracee_died() || self.is_memory_fault(),
        }
    }

    /// True for faults that the engine recovers from by falling back to plain stepping.
    pub fn is_memory_fault(&self) -> bool {
        matches!(self, Error::MemoryAccess { .. } | Error::PartialWrite { .. })
    }
}

pub(crate) trait ResultExt<T> {
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, nix::Error> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::OS(source)
            }
        })
    }
}

// Warn for the first few occurrences of a recurring fault, then only at powers of two.
pub(crate) fn should_warn(count: u64) -> bool {
    count < 8 || count.is_power_of_two()
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

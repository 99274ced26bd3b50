#[macro_use]
pub mod error;

pub mod backend;
mod controller;
pub mod engine;
pub mod overlay;
pub mod powerpc;
pub mod probe;
pub mod ptracer;
pub mod regs;
pub mod registry;

pub use backend::{Action, Backend, Detached, Event, Handle, Memory, StepMode};
pub use engine::{Arch, Engine};
pub use error::{Error, Result};
pub use probe::{Context, Probe, ProbeError, ProbeState};
pub use ptracer::{Pid, Ptracer, Signal, Stop, Tracee};
pub use regs::Registers;
pub use registry::{Session, State};

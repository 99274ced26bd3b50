//! A [`Backend`] built on Linux `ptrace(2)`, and the event pump that feeds its stops to
//! an [`Engine`].
//!
//! ptrace restarts must be issued by the thread that attached to the tracee. Create the
//! engine, begin traces, and call [`Engine::pump()`] from the same thread.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        wait::{self, WaitPidFlag, WaitStatus},
    },
};
use tracing::{debug, info, trace, warn};

use crate::backend::{Action, Backend, Detached, Event, Handle, Memory, StepMode};
use crate::engine::Engine;
use crate::error::{Error, Result, ResultExt};
use crate::regs::{NativeRegisters, Registers};

pub use nix::unistd::Pid;
pub use nix::sys::ptrace::Options;

/// POSIX signal.
pub use nix::sys::signal::Signal;

#[cfg(not(target_arch = "x86_64"))]
const PTRACE_GETREGSET: libc::c_uint = 0x4204;

/// Linux constant defined in `include/uapi/linux/elf.h`.
#[cfg(not(target_arch = "x86_64"))]
const NT_PRSTATUS: libc::c_int = 0x1;

#[cfg(target_arch = "x86_64")]
const PTRACE_SINGLEBLOCK: libc::c_uint = 33;

#[cfg(target_arch = "powerpc64")]
const PTRACE_SINGLEBLOCK: libc::c_uint = 0x100;

const BLOCK_STEP_SUPPORTED: bool = cfg!(any(target_arch = "x86_64", target_arch = "powerpc64"));

/// A _ptrace-stop_, a tracee state in which it is stopped and ready to accept ptrace
/// commands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stop {
    /// First stop of a new tracee: the post-exec trap of a spawned child, or the
    /// attach-stop of an attached or auto-attached thread.
    Attach,

    // signal-delivery-stop
    SignalDelivery { signal: Signal },

    // group-stop
    Group { signal: Signal },

    // ptrace-event-stops
    Clone { new: Pid },
    Exec { old: Pid },
    Exiting { exit_code: i32 },
    Signaling {
        signal: Signal,
        core_dumped: bool,
    },

    /// Terminated without a ptrace-exit-stop. Already reaped, cannot be restarted.
    Reaped,
}

/// Tracee task in ptrace-stop, with an optional pending signal.
///
/// **Warning:** the underlying tracee is not guaranteed to exist, and
/// operations on it may fail between calls to [`Ptracer::wait()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tracee {
    pid: Pid,
    pending: Option<Signal>,
    stop: Stop,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Tracee {
    pub fn new(pid: Pid, pending: impl Into<Option<Signal>>, stop: Stop) -> Self {
        let pending = pending.into();
        let _not_send = PhantomData;

        Self { pid, pending, stop, _not_send }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pending_signal(&self) -> Option<Signal> {
        self.pending
    }

    pub fn stop(&self) -> Stop {
        self.stop
    }

    #[cfg(target_arch = "x86_64")]
    pub fn native_registers(&self) -> Result<NativeRegisters> {
        ptrace::getregs(self.pid).died_if_esrch(self.pid)
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn native_registers(&self) -> Result<NativeRegisters> {
        let mut data = std::mem::MaybeUninit::<NativeRegisters>::uninit();
        let mut rv = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: std::mem::size_of::<NativeRegisters>(),
        };

        let res = unsafe {
            libc::ptrace(
                PTRACE_GETREGSET,
                self.pid.as_raw(),
                NT_PRSTATUS,
                &mut rv as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res).died_if_esrch(self.pid)?;

        Ok(unsafe { data.assume_init() })
    }

    pub fn registers(&self) -> Result<Registers> {
        Ok(self.native_registers()?.into())
    }

    pub fn memory(&self) -> Result<ProcMem> {
        ProcMem::open(self.pid)
    }

    /// The engine event this stop reports, if any.
    pub fn event(&self) -> Result<Option<Event>> {
        let event = match self.stop {
            Stop::SignalDelivery { signal } => {
                let regs = self.registers()?;
                Some(Event::Signal { signal, regs, aux: 0 })
            },
            Stop::Clone { new } => Some(Event::Clone { new }),
            Stop::Exiting { .. } | Stop::Signaling { .. } | Stop::Reaped => Some(Event::Death),
            Stop::Attach | Stop::Group { .. } | Stop::Exec { .. } => None,
        };

        Ok(event)
    }
}

/// Memory of a tracee, via `/proc/<tid>/mem`.
///
/// The file is bound to the address space the tracee had when it was opened, so a
/// handle goes stale once the tracee execs.
#[derive(Clone, Debug)]
pub struct ProcMem {
    file: Arc<fs::File>,
}

impl ProcMem {
    pub fn open(pid: Pid) -> Result<Self> {
        let path = format!("/proc/{}/mem", pid.as_raw() as u32);

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;

        Ok(Self { file: Arc::new(file) })
    }
}

impl AsRawFd for ProcMem {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Memory for ProcMem {
    fn read(&self, addr: u64, data: &mut [u8]) -> Result<usize> {
        self.file
            .read_at(data, addr)
            .map_err(|source| Error::MemoryAccess { addr, source })
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<usize> {
        self.file
            .write_at(data, addr)
            .map_err(|source| Error::MemoryAccess { addr, source })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Observer {
    handle: Handle,
    mode: Option<StepMode>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    // Self-attached, via `spawn()` with a pre-exec `TRACEME` request.
    Spawned { observer: Option<Observer> },

    // Newly-attached, expecting a SIGSTOP. If `release`, detach at that stop.
    Attaching { observer: Option<Observer>, release: bool },

    // Attached, no observer. Continued on every stop.
    Running,

    // Attached and stepped on behalf of an observer.
    Observed(Observer),

    // Observer gone, detach on next stop.
    Detaching,

    // Stopped mid-exit (but not yet reaped) and pending detach.
    Exiting,
}

/// ptrace-based tracing backend.
///
/// Tracees are stepped only while an observer is attached to them; other tracees (for
/// example threads auto-attached on `clone()`) are continued at every stop.
///
/// Dropping the tracer stops and detaches every tracee it still holds. Drop it on the
/// thread that traced them.
#[derive(Debug)]
pub struct Ptracer {
    /// Ptrace options applied to every tracee at its first stop.
    options: Options,

    /// Time to sleep for before polling tracees for new events.
    poll_delay: Duration,

    /// Known tracees, and their state.
    tracees: Mutex<BTreeMap<i32, State>>,

    /// Open memory files of known tracees. Lock after `tracees`, never before.
    memory: Mutex<BTreeMap<i32, ProcMem>>,

    next_handle: AtomicU64,
}

const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(1);
const MAX_POLL_DELAY: Duration = Duration::from_millis(10);

/// Options required for internal tracee state management and observer events.
/// These are:
/// - [`PTRACE_O_TRACECLONE`](Options::PTRACE_O_TRACECLONE)
/// - [`PTRACE_O_TRACEEXEC`](Options::PTRACE_O_TRACEEXEC)
/// - [`PTRACE_O_TRACEEXIT`](Options::PTRACE_O_TRACEEXIT)
/// - [`PTRACE_O_TRACESYSGOOD`](Options::PTRACE_O_TRACESYSGOOD)
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT)
    .union(Options::PTRACE_O_TRACESYSGOOD);

/// Options a caller may add to [`REQUIRED_OPTIONS`]. Others would report events this
/// tracer does not decode.
pub const OPTIONAL_OPTIONS: Options = Options::PTRACE_O_EXITKILL;

impl Default for Ptracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Ptracer {
    pub fn new() -> Self {
        let options = REQUIRED_OPTIONS;
        let poll_delay = DEFAULT_POLL_DELAY;
        let tracees = Mutex::new(BTreeMap::new());
        let memory = Mutex::new(BTreeMap::new());
        let next_handle = AtomicU64::new(1);

        Self { options, poll_delay, tracees, memory, next_handle }
    }

    /// Return the ptrace options applied to tracees.
    pub fn options(&self) -> Options {
        self.options
    }

    /// Set the ptrace options applied to tracees at their first stop.
    ///
    /// **NOTE:**: [`REQUIRED_OPTIONS`] are always set, even if unset in the passed value,
    /// and anything outside [`OPTIONAL_OPTIONS`] is dropped.
    pub fn set_options(&mut self, options: Options) {
        self.options = (options & OPTIONAL_OPTIONS) | REQUIRED_OPTIONS;
    }

    /// Return the initial tracee poll delay.
    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    /// Set the initial tracee poll delay.
    pub fn set_poll_delay(&mut self, poll_delay: Duration) {
        self.poll_delay = poll_delay;
    }

    /// Number of threads currently traced, observed or not.
    pub fn tracee_count(&self) -> usize {
        self.tracees().len()
    }

    /// Spawn `cmd` for tracing.
    ///
    /// The command will be configured to request `PTRACE_TRACEME` after `fork()` and
    /// pre-`exec()`. Its first stop is reported as [`Stop::Attach`] after the `execve()`.
    pub fn spawn(&self, mut cmd: Command) -> Result<Child> {
        // On fork, request `PTRACE_TRACEME`.
        unsafe {
            cmd.pre_exec(|| ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32)))
        };

        let child = cmd.spawn()?;

        let pid = Pid::from_raw(child.id() as i32);
        self.set_tracee_state(pid, State::Spawned { observer: None });

        Ok(child)
    }

    /// Resume a stopped tracee as directed by `action`.
    ///
    /// Tracees that are detaching or exiting are detached regardless of `action`. Our own
    /// `SIGTRAP`s are never delivered to a tracee we release.
    pub fn restart(&self, tracee: Tracee, action: Action) -> Result<()> {
        let Tracee { pid, pending, .. } = tracee;

        let mut tracees = self.tracees();

        let state = match tracees.get(&pid.as_raw()).copied() {
            Some(state) => state,
            None => internal_error!("restart of unknown tracee"),
        };

        let release = action == Action::Detach || matches!(state, State::Detaching | State::Exiting);

        if release {
            tracees.remove(&pid.as_raw());
            drop(tracees);
            self.forget_memory(pid);

            let pending = pending.filter(|&signal| signal != Signal::SIGTRAP);
            info!(pid = pid.as_raw(), ?pending, "detaching tracee");

            return ptrace::detach(pid, pending).map_err(|source| Error::Restart { pid, action, source });
        }

        drop(tracees);

        let (step, pending) = match action {
            Action::Resume { step } => (step, pending),
            Action::ResumeHideSignal { step } => (step, None),
            Action::Detach => internal_error!("unreachable detach restart"),
        };

        let res = match step {
            Some(StepMode::Instruction) => ptrace::step(pid, pending),
            Some(StepMode::Block) => single_block(pid, pending),
            None => ptrace::cont(pid, pending),
        };

        res.map_err(|source| Error::Restart { pid, action, source })
    }

    /// How to restart a stop that the engine is not told about.
    pub fn passthrough(&self, tracee: &Tracee) -> Action {
        let step = self.resume_mode(tracee.pid());

        match tracee.stop() {
            Stop::Group { .. } => Action::Resume { step },
            _ => Action::ResumeHideSignal { step },
        }
    }

    fn resume_mode(&self, pid: Pid) -> Option<StepMode> {
        match self.tracee_state(pid) {
            Some(State::Observed(observer)) => observer.mode,
            _ => None,
        }
    }

    // Poll tracees for a `wait(2)` status change.
    fn poll_tracees(&self, pids: &[Pid]) -> Result<Option<WaitStatus>> {
        let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;

        for &pid in pids {
            match wait::waitpid(pid, Some(flags)) {
                Ok(WaitStatus::StillAlive) => {
                    // Alive, no state change. Check remaining tracees.
                    continue;
                },
                Ok(status) => {
                    // One of our tracees changed state.
                    return Ok(Some(status));
                },
                Err(Errno::ECHILD) => {
                    debug!(pid = pid.as_raw(), "ECHILD for tracee, assuming gone");
                    self.remove_tracee(pid);
                },
                Err(err) => {
                    // Something else went wrong.
                    return Err(err.into());
                },
            };
        }

        // No tracee changed state.
        Ok(None)
    }

    /// Wait for some tracee to stop.
    ///
    /// If there are no tracees to wait on, returns `None`.
    pub fn wait(&self) -> Result<Option<Tracee>> {
        use Signal::*;

        let mut poll_delay = self.poll_delay;

        let status = loop {
            let pids: Vec<_> = self.tracees().keys().map(|&raw| Pid::from_raw(raw)).collect();

            match pids.as_slice() {
                [] => {
                    debug!("no tracees to wait on");

                    return Ok(None);
                },
                [pid] => {
                    // A lone tracee can be waited on directly.
                    match wait::waitpid(*pid, Some(WaitPidFlag::__WALL)) {
                        Ok(status) => break status,
                        Err(Errno::EINTR) => continue,
                        Err(Errno::ECHILD) => {
                            debug!(pid = pid.as_raw(), "ECHILD for tracee, assuming gone");
                            self.remove_tracee(*pid);
                        },
                        Err(err) => return Err(err.into()),
                    }
                },
                _ => {
                    if let Some(status) = self.poll_tracees(&pids)? {
                        break status;
                    }

                    trace!(tracees = pids.len(), ?poll_delay, "no tracee updates, backing off");

                    std::thread::sleep(poll_delay);
                    poll_delay = (poll_delay * 2).min(MAX_POLL_DELAY);
                },
            }
        };

        let tracee = match status {
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                let state = self.remove_tracee(pid);
                debug!(pid = pid.as_raw(), ?state, ?status, "tracee terminated without exit stop");

                Tracee::new(pid, None, Stop::Reaped)
            },
            WaitStatus::Stopped(pid, SIGTRAP) if matches!(self.tracee_state(pid), Some(State::Spawned { .. })) => {
                // The spawned tracee returned from its `execve()` after `PTRACE_TRACEME`.
                self.first_stop(pid)?;
                Tracee::new(pid, None, Stop::Attach)
            },
            WaitStatus::Stopped(pid, SIGSTOP) if matches!(self.tracee_state(pid), Some(State::Attaching { .. }) | None) => {
                // We may see an attach-stop out-of-order, before the ptrace-event-stop which
                // would otherwise have us mark it as `Attaching`.
                self.first_stop(pid)?;
                Tracee::new(pid, None, Stop::Attach)
            },
            WaitStatus::Stopped(pid, signal) => {
                let stop = if is_group_stop(pid, signal)? {
                    Stop::Group { signal }
                } else {
                    Stop::SignalDelivery { signal }
                };

                Tracee::new(pid, signal, stop)
            },
            WaitStatus::PtraceEvent(pid, _signal, code) => {
                match code {
                    libc::PTRACE_EVENT_CLONE => {
                        let evt_data = ptrace::getevent(pid).died_if_esrch(pid)?;
                        let new = Pid::from_raw(evt_data as u32 as i32);

                        // When we return, `new` will start as a tracee, but will be delivered a
                        // `SIGSTOP`. Mark it so we can recognize the `SIGSTOP` as an attach-stop.
                        self.mark_tracee(new);

                        Tracee::new(pid, None, Stop::Clone { new })
                    },
                    libc::PTRACE_EVENT_EXEC => {
                        // The execing thread now has the tid of the thread group leader.
                        let evt_data = ptrace::getevent(pid).died_if_esrch(pid)?;
                        let old = Pid::from_raw(evt_data as u32 as i32);

                        if old != pid {
                            // We exec'd off-thread, and previous tid state is now invalid.
                            self.remove_tracee(old);
                        }

                        // Memory files opened before the exec see the old address space.
                        self.forget_memory(pid);

                        Tracee::new(pid, None, Stop::Exec { old })
                    },
                    libc::PTRACE_EVENT_EXIT => {
                        // In this context, `PTRACE_GETEVENTMSG` returns the pending wait status
                        // as an `unsigned long`. We are only interested in the low 16-bit word.
                        let status = ptrace::getevent(pid).died_if_esrch(pid)? as u16;

                        // Observed tracees are released by their observer. Mark the rest so
                        // we detach on next restart.
                        if !matches!(self.tracee_state(pid), Some(State::Observed(_))) {
                            self.set_tracee_state(pid, State::Exiting);
                        }

                        let stop = match ExitType::parse(status)? {
                            ExitType::Exit(exit_code) =>
                                Stop::Exiting { exit_code },
                            ExitType::Signaled(signal, core_dumped) =>
                                Stop::Signaling { signal, core_dumped },
                        };

                        Tracee::new(pid, None, stop)
                    },
                    _ => {
                        // Fork, vfork and seccomp events are never requested.
                        internal_error!("unexpected ptrace-event-stop code")
                    },
                }
            },
            // We never restart with `PTRACE_SYSCALL`.
            WaitStatus::PtraceSyscall(_) =>
                internal_error!("unexpected syscall-stop"),
            // Assume `!WNOHANG`, `!WCONTINUED`.
            WaitStatus::Continued(_) |
            WaitStatus::StillAlive =>
                internal_error!("unreachable `wait()` status"),
        };

        Ok(Some(tracee))
    }

    // Settle the state of a tracee at its first stop, and apply our options.
    fn first_stop(&self, pid: Pid) -> Result<()> {
        let state = match self.tracee_state(pid) {
            Some(State::Spawned { observer }) |
            Some(State::Attaching { observer, release: false }) =>
                observer.map_or(State::Running, State::Observed),
            Some(State::Attaching { release: true, .. }) =>
                State::Detaching,
            _ => State::Running,
        };

        self.set_tracee_state(pid, state);

        ptrace::setoptions(pid, self.options).died_if_esrch(pid)
    }

    fn tracees(&self) -> MutexGuard<'_, BTreeMap<i32, State>> {
        self.tracees.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_tracee(&self, pid: Pid) -> Option<State> {
        info!(pid = pid.as_raw(), "removing tracee");
        let state = self.tracees().remove(&pid.as_raw());
        self.forget_memory(pid);
        state
    }

    fn memory_files(&self) -> MutexGuard<'_, BTreeMap<i32, ProcMem>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget_memory(&self, pid: Pid) {
        self.memory_files().remove(&pid.as_raw());
    }

    /// Stop and detach every tracee now, rather than at its next reported stop.
    ///
    /// Released tracees run on untraced. Returns the number released, or the first
    /// error after trying every tracee.
    pub fn detach_all(&self) -> Result<usize> {
        let pids: Vec<_> = self.tracees().keys().map(|&raw| Pid::from_raw(raw)).collect();
        let mut released = 0;
        let mut first_err = None;

        for pid in pids {
            self.remove_tracee(pid);

            match self.release_now(pid) {
                Ok(true) => released += 1,
                Ok(false) => {},
                Err(err) if err.tracee_died() => {
                    debug!(pid = pid.as_raw(), %err, "tracee died before release");
                },
                Err(err) => {
                    warn!(pid = pid.as_raw(), %err, "could not release tracee");
                    first_err.get_or_insert(err);
                },
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(released),
        }
    }

    // Detach `pid` now. A running tracee is interrupted with a `SIGSTOP`, run up to
    // that stop, and detached there.
    //
    // Returns `false` if the tracee exited first.
    fn release_now(&self, pid: Pid) -> Result<bool> {
        // ptrace requests only succeed on a tracee in a ptrace-stop.
        if ptrace::getsiginfo(pid).is_ok() {
            ptrace::detach(pid, None).died_if_esrch(pid)?;
            info!(pid = pid.as_raw(), "released stopped tracee");

            return Ok(true);
        }

        let res = unsafe { libc::syscall(libc::SYS_tkill, pid.as_raw(), libc::SIGSTOP) };
        Errno::result(res).died_if_esrch(pid)?;

        loop {
            let status = match wait::waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(false),
                Err(err) => return Err(err.into()),
            };

            trace!(pid = pid.as_raw(), ?status, "draining tracee before release");

            match status {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                    // Suppress our own interrupt.
                    ptrace::detach(pid, None).died_if_esrch(pid)?;
                    info!(pid = pid.as_raw(), "released tracee");

                    return Ok(true);
                },
                WaitStatus::Stopped(_, Signal::SIGTRAP) |
                WaitStatus::PtraceEvent(..) |
                WaitStatus::PtraceSyscall(_) => {
                    ptrace::cont(pid, None).died_if_esrch(pid)?;
                },
                WaitStatus::Stopped(_, signal) => {
                    ptrace::cont(pid, signal).died_if_esrch(pid)?;
                },
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => return Ok(false),
                WaitStatus::Continued(_) | WaitStatus::StillAlive => {},
            }
        }
    }

    fn tracee_state(&self, pid: Pid) -> Option<State> {
        self.tracees().get(&pid.as_raw()).copied()
    }

    fn set_tracee_state(&self, pid: Pid, state: State) {
        debug!(pid = pid.as_raw(), ?state, "setting tracee state");

        self.tracees().insert(pid.as_raw(), state);
    }

    // Mark `pid` as a new tracee pending attach-stop, if it isn't already known.
    fn mark_tracee(&self, pid: Pid) {
        debug!(pid = pid.as_raw(), "marking tracee as attaching if unknown");

        self.tracees()
            .entry(pid.as_raw())
            .or_insert(State::Attaching { observer: None, release: false });
    }
}

impl Backend for Ptracer {
    type Memory = ProcMem;

    fn thread_exists(&self, tid: Pid) -> bool {
        Path::new(&format!("/proc/{}", tid.as_raw())).exists()
    }

    /// Attach an observer. Unknown threads are attached with `PTRACE_ATTACH`; stepping
    /// starts at their attach-stop.
    fn attach(&self, tid: Pid, events: Options) -> Result<Handle> {
        if !self.options.contains(events) {
            return Err(Error::Unsupported("observer events outside the tracer's ptrace options"));
        }

        let handle = Handle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let observer = Some(Observer { handle, mode: None });

        let mut tracees = self.tracees();
        let raw = tid.as_raw();

        let state = match tracees.get(&raw).copied() {
            None => {
                ptrace::attach(tid).map_err(|source| Error::Attach { pid: tid, source })?;
                info!(pid = raw, "attaching to thread");

                State::Attaching { observer, release: false }
            },
            Some(State::Spawned { observer: None }) =>
                State::Spawned { observer },
            Some(State::Attaching { observer: None, release: false }) =>
                State::Attaching { observer, release: false },
            Some(State::Running) =>
                State::Observed(Observer { handle, mode: None }),
            Some(State::Exiting) =>
                return Err(Error::Attach { pid: tid, source: Errno::ESRCH }),
            Some(_) =>
                return Err(Error::Attach { pid: tid, source: Errno::EBUSY }),
        };

        debug!(pid = raw, ?state, "observer attached");
        tracees.insert(raw, state);

        Ok(handle)
    }

    fn set_step_mode(&self, tid: Pid, handle: Handle, mode: StepMode) -> Result<()> {
        if mode == StepMode::Block && !BLOCK_STEP_SUPPORTED {
            return Err(Error::Unsupported("block stepping"));
        }

        let mut tracees = self.tracees();

        match tracees.get_mut(&tid.as_raw()) {
            Some(State::Spawned { observer: Some(observer) }) |
            Some(State::Attaching { observer: Some(observer), .. }) |
            Some(State::Observed(observer)) if observer.handle == handle => {
                observer.mode = Some(mode);
                Ok(())
            },
            _ => internal_error!("no observer for handle"),
        }
    }

    fn detach(&self, tid: Pid, handle: Handle) -> Result<Detached> {
        let mut tracees = self.tracees();

        let state = match tracees.get_mut(&tid.as_raw()) {
            Some(state) => state,
            None => return Ok(Detached::AlreadyDetached),
        };

        let next = match *state {
            State::Spawned { observer: Some(observer) } if observer.handle == handle =>
                State::Spawned { observer: None },
            State::Attaching { observer: Some(observer), .. } if observer.handle == handle =>
                State::Attaching { observer: None, release: true },
            State::Observed(observer) if observer.handle == handle =>
                State::Detaching,
            _ => return Ok(Detached::AlreadyDetached),
        };

        debug!(pid = tid.as_raw(), state = ?next, "observer detached");
        *state = next;

        Ok(Detached::Detached)
    }

    /// Memory of a known tracee is opened once and shared until it execs or is removed.
    fn memory(&self, tid: Pid) -> Result<ProcMem> {
        let raw = tid.as_raw();

        if !self.tracees().contains_key(&raw) {
            return ProcMem::open(tid);
        }

        let mut files = self.memory_files();

        if let Some(mem) = files.get(&raw) {
            return Ok(mem.clone());
        }

        let mem = ProcMem::open(tid)?;
        files.insert(raw, mem.clone());

        Ok(mem)
    }
}

impl Drop for Ptracer {
    fn drop(&mut self) {
        match self.detach_all() {
            Ok(0) => {},
            Ok(count) => info!(count, "released remaining tracees"),
            Err(err) => warn!(%err, "could not release remaining tracees"),
        }
    }
}

impl Engine<Ptracer> {
    /// Wait for the next tracee stop, handle it, and restart the tracee.
    ///
    /// Returns `false` once no tracees remain.
    pub fn pump(&self) -> Result<bool> {
        let tracee = match self.backend.wait()? {
            Some(tracee) => tracee,
            None => return Ok(false),
        };

        let pid = tracee.pid();

        let event = match tracee.event() {
            Ok(event) => event,
            Err(err) if err.tracee_died() => {
                // Its exit will be reported by a later wait.
                debug!(pid = pid.as_raw(), %err, "tracee died while stopped");
                return Ok(true);
            },
            Err(err) => return Err(err),
        };

        let action = match event {
            Some(event) => self.dispatch(pid, event),
            None => self.backend.passthrough(&tracee),
        };

        if tracee.stop() == Stop::Reaped {
            return Ok(true);
        }

        match self.backend.restart(tracee, action) {
            Err(err) if err.tracee_died() => {
                debug!(pid = pid.as_raw(), %err, "tracee died before restart");
            },
            res => res?,
        }

        Ok(true)
    }

    /// Pump tracee stops until no tracees remain.
    pub fn run(&self) -> Result<()> {
        while self.pump()? {}

        Ok(())
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "powerpc64"))]
fn single_block(pid: Pid, signal: Option<Signal>) -> nix::Result<()> {
    let data = signal.map_or(0, |signal| signal as libc::c_long);

    let res = unsafe {
        libc::ptrace(
            PTRACE_SINGLEBLOCK,
            pid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            data as *mut libc::c_void,
        )
    };

    Errno::result(res).map(drop)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "powerpc64")))]
fn single_block(_pid: Pid, _signal: Option<Signal>) -> nix::Result<()> {
    Err(Errno::ENOSYS)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ExitType {
    Exit(i32),
    Signaled(Signal, bool),
}

impl ExitType {
    fn parse(status: u16) -> Result<Self> {
        // The bit layout of the word `status` is:
        //
        //   15                         8   7                     0
        //    +-------------------------+---+---------------------+
        //    |        exit_code        | c |       sig_no        |
        //    +-------------------------+---+---------------------+
        //
        // If `status[6:0]` is nonzero, then `pid` is being signaled with `sig_no`,
        // and a set `status[7]` bit flags a core dump. Otherwise, it is a normal
        // exit with exit code `status[15:8]`.
        let sig_no = status & 0x7f;
        let exiting = sig_no == 0;

        let ty = if exiting {
            // Extract, zero-extend, cast.
            let exit_code = (status >> 8) as u8 as u32 as i32;

            ExitType::Exit(exit_code)
        } else {
            use std::convert::TryFrom;

            let core_dump = (status & (1 << 7)) >> 7;
            let signal = Signal::try_from(sig_no as i32)?;
            let core_dump = core_dump > 0;

            ExitType::Signaled(signal, core_dump)
        };

        Ok(ty)
    }
}

// Check if a wait stop with signal delivery is a group-stop.
//
// Assumes attach-stop has already been ruled out.
fn is_group_stop(pid: Pid, sig: Signal) -> Result<bool> {
    use Signal::*;

    match sig {
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
            // Possible group-stop. Check `siginfo` to disambiguate.
            //
            // From the manual:
            //
            //     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
            //     group-stop.  (Other failure codes are possible, such as ESRCH
            //     ("no such process") if a SIGKILL killed the tracee.)
            //
            match ptrace::getsiginfo(pid) {
                Err(Errno::EINVAL) =>
                    Ok(true),
                Err(err) =>
                    Err(err).died_if_esrch(pid),
                Ok(_) =>
                    Ok(false)
            }
        },
        _ => {
            // Only these four signals are stopping signals.
            Ok(false)
        },
    }
}

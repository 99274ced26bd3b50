#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::convert::TryInto;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use itrace::error::{Error, Result};
use itrace::overlay::TRAP_INSN;
use itrace::ptracer::Options;
use itrace::{Backend, Detached, Handle, Memory, Pid, Probe, StepMode, Stop, Tracee};
use nix::errno::Errno;
use pretty_assertions::assert_eq;

#[allow(unused)]
macro_rules! pid {
    ($raw: expr) => {
        itrace::Pid::from_raw($raw)
    };
}

/// Construct a tracee stop event with a readable, integration test-friendly syntax.
#[allow(unused)]
macro_rules! event {
    ($raw_pid: expr, $stop: expr) => {{
        use itrace::Stop::*;

        let pid = itrace::Pid::from_raw($raw_pid);

        itrace::Tracee::new(pid, None, $stop)
    }};
    ($raw_pid: expr, $stop: expr, $signal: expr) => {{
        use itrace::Signal::*;
        use itrace::Stop::*;

        let pid = itrace::Pid::from_raw($raw_pid);

        itrace::Tracee::new(pid, $signal, $stop)
    }};
}

/// Assert that two event traces are equivalent modulo PID normalization.
pub fn assert_equivalent(left: &[Tracee], right: &[Tracee]) {
    let normed_left = Normalizer::normalize(left);
    let normed_right = Normalizer::normalize(right);
    assert_eq!(normed_left, normed_right)
}

/// Normalizes an event trace by substituting each concrete raw PID value with one that
/// matches its ordinal of appearance in the trace.
#[derive(Default)]
struct Normalizer {
    map: HashMap<Pid, Pid>,
}

impl Normalizer {
    pub fn normalize(trace: &[Tracee]) -> Vec<Tracee> {
        let mut normalizer = Normalizer::default();
        trace.iter().map(|tracee| normalizer.normalize_tracee(tracee)).collect()
    }

    fn normalize_tracee(&mut self, tracee: &Tracee) -> Tracee {
        let normed_pid = self.normalize_pid(tracee.pid());
        let normed_stop = self.normalize_stop(tracee.stop());
        Tracee::new(normed_pid, tracee.pending_signal(), normed_stop)
    }

    fn normalize_stop(&mut self, stop: Stop) -> Stop {
        match stop {
            Stop::Clone { new } => Stop::Clone { new: self.normalize_pid(new) },
            Stop::Exec { old } => Stop::Exec { old: self.normalize_pid(old) },
            _ => stop,
        }
    }

    fn normalize_pid(&mut self, pid: Pid) -> Pid {
        // Avoid borrowck error in `default` fn.
        let next_free = self.map.len();

        let entry = self.map.entry(pid).or_insert_with(|| {
            let raw: i32 = next_free.try_into().expect("exhausted free test PIDs");
            Pid::from_raw(raw)
        });

        *entry
    }
}

#[derive(Debug, Default)]
struct Image {
    bytes: BTreeMap<u64, u8>,
    writes: Vec<(u64, Vec<u8>)>,
    short_writes: BTreeMap<u64, usize>,
    unreadable: BTreeSet<u64>,
}

/// Sparse in-memory process image. Bytes never placed read as unmapped.
///
/// Clones share the same image.
#[derive(Clone, Debug, Default)]
pub struct FakeMemory {
    image: Arc<Mutex<Image>>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_word(&self, addr: u64, word: u32) {
        let mut image = self.image.lock().unwrap();

        for (i, byte) in word.to_ne_bytes().iter().enumerate() {
            image.bytes.insert(addr + i as u64, *byte);
        }
    }

    /// Lay out consecutive instruction words starting at `start`.
    pub fn put_words(&self, start: u64, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            self.put_word(start + 4 * i as u64, word);
        }
    }

    pub fn word(&self, addr: u64) -> u32 {
        let image = self.image.lock().unwrap();
        let mut buf = [0; 4];

        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = image.bytes[&(addr + i as u64)];
        }

        u32::from_ne_bytes(buf)
    }

    /// Every write issued, with the bytes that actually landed.
    pub fn writes(&self) -> Vec<(u64, Vec<u8>)> {
        self.image.lock().unwrap().writes.clone()
    }

    pub fn trap_writes_at(&self, addr: u64) -> usize {
        let trap = TRAP_INSN.to_ne_bytes();

        self.writes()
            .iter()
            .filter(|(at, data)| *at == addr && data.as_slice() == trap)
            .count()
    }

    /// Addresses currently holding a trap word, among `addrs`.
    pub fn traps_among(&self, addrs: &[u64]) -> Vec<u64> {
        addrs.iter().copied().filter(|&addr| self.word(addr) == TRAP_INSN).collect()
    }

    /// Make the next write at `addr` land only `len` bytes.
    pub fn short_write_once(&self, addr: u64, len: usize) {
        self.image.lock().unwrap().short_writes.insert(addr, len);
    }

    pub fn make_unreadable(&self, addr: u64) {
        self.image.lock().unwrap().unreadable.insert(addr);
    }
}

impl Memory for FakeMemory {
    fn read(&self, addr: u64, data: &mut [u8]) -> Result<usize> {
        let image = self.image.lock().unwrap();

        if image.unreadable.contains(&addr) {
            let source = io::Error::from_raw_os_error(libc::EIO);
            return Err(Error::MemoryAccess { addr, source });
        }

        let mut len = 0;

        for (i, byte) in data.iter_mut().enumerate() {
            match image.bytes.get(&(addr + i as u64)) {
                Some(b) => *byte = *b,
                None => break,
            }
            len += 1;
        }

        Ok(len)
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<usize> {
        let mut image = self.image.lock().unwrap();

        let len = image
            .short_writes
            .remove(&addr)
            .unwrap_or(data.len())
            .min(data.len());

        for (i, byte) in data[..len].iter().enumerate() {
            image.bytes.insert(addr + i as u64, *byte);
        }

        image.writes.push((addr, data[..len].to_vec()));

        Ok(len)
    }
}

#[derive(Debug, Default)]
struct Mocked {
    memory: FakeMemory,
    threads: Mutex<BTreeSet<i32>>,
    refused: Mutex<BTreeSet<i32>>,
    observers: Mutex<BTreeMap<i32, (Handle, Option<StepMode>)>>,
    no_block_step: AtomicBool,
    next_handle: AtomicU64,
    attaches: AtomicUsize,
    detaches: AtomicUsize,
    detach_calls: AtomicUsize,
}

/// Scripted backend. Threads exist only once added; every thread shares one memory image.
///
/// Clones share state, so a test can keep a handle after moving one into an engine.
#[derive(Clone, Debug, Default)]
pub struct MockBackend {
    inner: Arc<Mocked>,
}

impl MockBackend {
    pub fn with_threads(tids: &[i32]) -> Self {
        let backend = Self::default();

        for &tid in tids {
            backend.add_thread(tid);
        }

        backend
    }

    pub fn memory(&self) -> FakeMemory {
        self.inner.memory.clone()
    }

    pub fn add_thread(&self, tid: i32) {
        self.inner.threads.lock().unwrap().insert(tid);
    }

    pub fn refuse_attach(&self, tid: i32) {
        self.inner.refused.lock().unwrap().insert(tid);
    }

    pub fn disable_block_step(&self) {
        self.inner.no_block_step.store(true, Ordering::SeqCst);
    }

    pub fn is_attached(&self, tid: i32) -> bool {
        self.inner.observers.lock().unwrap().contains_key(&tid)
    }

    pub fn step_mode(&self, tid: i32) -> Option<StepMode> {
        self.inner.observers.lock().unwrap().get(&tid).and_then(|(_, mode)| *mode)
    }

    pub fn attaches(&self) -> usize {
        self.inner.attaches.load(Ordering::SeqCst)
    }

    /// Detaches that released a live observer.
    pub fn detaches(&self) -> usize {
        self.inner.detaches.load(Ordering::SeqCst)
    }

    pub fn detach_calls(&self) -> usize {
        self.inner.detach_calls.load(Ordering::SeqCst)
    }
}

impl Backend for MockBackend {
    type Memory = FakeMemory;

    fn thread_exists(&self, tid: Pid) -> bool {
        self.inner.threads.lock().unwrap().contains(&tid.as_raw())
    }

    fn attach(&self, tid: Pid, _events: Options) -> Result<Handle> {
        if self.inner.refused.lock().unwrap().contains(&tid.as_raw()) {
            return Err(Error::Attach { pid: tid, source: Errno::EPERM });
        }

        let mut observers = self.inner.observers.lock().unwrap();

        if observers.contains_key(&tid.as_raw()) {
            return Err(Error::Attach { pid: tid, source: Errno::EBUSY });
        }

        let handle = Handle::new(self.inner.next_handle.fetch_add(1, Ordering::SeqCst));
        observers.insert(tid.as_raw(), (handle, None));
        self.inner.attaches.fetch_add(1, Ordering::SeqCst);

        Ok(handle)
    }

    fn set_step_mode(&self, tid: Pid, handle: Handle, mode: StepMode) -> Result<()> {
        if mode == StepMode::Block && self.inner.no_block_step.load(Ordering::SeqCst) {
            return Err(Error::Unsupported("block stepping"));
        }

        match self.inner.observers.lock().unwrap().get_mut(&tid.as_raw()) {
            Some((h, step)) if *h == handle => {
                *step = Some(mode);
                Ok(())
            },
            _ => Err(Error::Internal("no observer for handle".into())),
        }
    }

    fn detach(&self, tid: Pid, handle: Handle) -> Result<Detached> {
        self.inner.detach_calls.fetch_add(1, Ordering::SeqCst);

        let mut observers = self.inner.observers.lock().unwrap();

        match observers.get(&tid.as_raw()) {
            Some((h, _)) if *h == handle => {
                observers.remove(&tid.as_raw());
                self.inner.detaches.fetch_add(1, Ordering::SeqCst);
                Ok(Detached::Detached)
            },
            _ => Ok(Detached::AlreadyDetached),
        }
    }

    fn memory(&self, _tid: Pid) -> Result<FakeMemory> {
        Ok(self.inner.memory.clone())
    }
}

/// A probe that records the program counter of every invocation.
pub fn recording_probe(point: &str) -> (Arc<Probe>, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(vec![]));
    let log = seen.clone();

    let probe = Probe::new(point, move |ctx| {
        log.lock().unwrap().push(ctx.regs().pc);
        Ok(())
    });

    (Arc::new(probe), seen)
}

/// A probe that only counts its invocations.
pub fn counting_probe(point: &str) -> Arc<Probe> {
    Arc::new(Probe::new(point, |_| Ok(())))
}

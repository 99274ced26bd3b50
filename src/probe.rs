//! Probe handlers and the context the engine hands them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{trace, warn};

use crate::backend::StepMode;
use crate::error::should_warn;
use crate::regs::Registers;

/// Default number of actions a handler may perform per invocation.
pub const DEFAULT_MAX_ACTIONS: u32 = 1000;

#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
pub enum ProbeError {
    #[error("MAXACTION exceeded, limit = {limit}")]
    ActionLimit { limit: u32 },

    #[error("{0}")]
    Handler(String),
}

/// State specific to the kind of probe that fired.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProbeState {
    /// Fired after a single instruction.
    Instruction { aux: u64 },

    /// Fired after a basic block.
    Block { aux: u64 },
}

impl ProbeState {
    fn new(mode: StepMode, aux: u64) -> Self {
        match mode {
            StepMode::Instruction => ProbeState::Instruction { aux },
            StepMode::Block => ProbeState::Block { aux },
        }
    }

    /// Architecture-specific scalar sampled with the registers.
    pub fn aux(&self) -> u64 {
        match *self {
            ProbeState::Instruction { aux } | ProbeState::Block { aux } => aux,
        }
    }
}

/// Per-invocation probe context.
#[derive(Debug)]
pub struct Context<'a> {
    probe_point: &'a str,
    regs: &'a Registers,
    state: ProbeState,
    limit: u32,
    actions_remaining: u32,
    last_error: Option<ProbeError>,
}

impl<'a> Context<'a> {
    pub fn probe_point(&self) -> &str {
        self.probe_point
    }

    pub fn regs(&self) -> &Registers {
        self.regs
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    pub fn actions_remaining(&self) -> u32 {
        self.actions_remaining
    }

    pub fn last_error(&self) -> Option<&ProbeError> {
        self.last_error.as_ref()
    }

    /// Account for `actions` units of handler work.
    pub fn charge(&mut self, actions: u32) -> Result<(), ProbeError> {
        match self.actions_remaining.checked_sub(actions) {
            Some(remaining) => {
                self.actions_remaining = remaining;
                Ok(())
            },
            None => {
                self.actions_remaining = 0;
                let err = ProbeError::ActionLimit { limit: self.limit };
                self.last_error = Some(err.clone());
                Err(err)
            },
        }
    }
}

type Handler = dyn Fn(&mut Context<'_>) -> Result<(), ProbeError> + Send + Sync;

/// A probe handler bound to a probe point.
pub struct Probe {
    point: String,
    handler: Box<Handler>,
    max_actions: u32,
    hits: AtomicU64,
    errors: AtomicU64,
}

impl Probe {
    pub fn new<F>(point: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut Context<'_>) -> Result<(), ProbeError> + Send + Sync + 'static,
    {
        Self {
            point: point.into(),
            handler: Box::new(handler),
            max_actions: DEFAULT_MAX_ACTIONS,
            hits: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn with_max_actions(mut self, max_actions: u32) -> Self {
        self.max_actions = max_actions;
        self
    }

    pub fn point(&self) -> &str {
        &self.point
    }

    pub fn max_actions(&self) -> u32 {
        self.max_actions
    }

    /// Number of completed invocations.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of invocations that ended in an error.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub(crate) fn fire(&self, regs: &Registers, mode: StepMode, aux: u64) {
        let mut ctx = Context {
            probe_point: &self.point,
            regs,
            state: ProbeState::new(mode, aux),
            limit: self.max_actions,
            actions_remaining: self.max_actions,
            last_error: None,
        };

        // A handler that swallowed a budget error still failed.
        let result = (self.handler)(&mut ctx).and_then(|()| match ctx.last_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        });
        self.hits.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = result {
            let count = self.errors.fetch_add(1, Ordering::Relaxed);

            if should_warn(count) {
                warn!(probe = %self.point, pc = regs.pc, %err, errors = count + 1, "probe handler failed");
            } else {
                trace!(probe = %self.point, pc = regs.pc, %err, "probe handler failed");
            }
        }
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("point", &self.point)
            .field("max_actions", &self.max_actions)
            .field("hits", &self.hits())
            .field("errors", &self.errors())
            .finish()
    }
}

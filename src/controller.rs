//! Per-event stepping decisions.

use tracing::{debug, trace};

use crate::backend::{Action, Backend, Event};
use crate::engine::Engine;
use crate::ptracer::{Pid, Signal};
use crate::regs::Registers;
use crate::registry::{Reason, State};

impl<B: Backend> Engine<B> {
    /// Handle one backend event for `tid` and decide how to resume it.
    pub fn dispatch(&self, tid: Pid, event: Event) -> Action {
        trace!(tid = tid.as_raw(), ?event, "dispatch");

        match event {
            Event::Signal { signal, regs, aux } => self.on_signal(tid, signal, &regs, aux),
            Event::Clone { new } => self.on_clone(tid, new),
            Event::Death => self.on_death(tid),
        }
    }

    fn on_signal(&self, tid: Pid, signal: Signal, regs: &Registers, aux: u64) -> Action {
        let session = match self.registry.find(tid) {
            Some(session) => session,
            None => return Action::Resume { step: None },
        };

        let mode = session.mode();
        let mut guard = session.stepping();
        let stepping = &mut *guard;

        // Only trace traps drive the engine. Leave armed breakpoints in place.
        if signal != Signal::SIGTRAP {
            return Action::Resume { step: stepping.resume_mode(mode) };
        }

        if stepping.state == State::Detached {
            return Action::ResumeHideSignal { step: None };
        }

        if let Some(atomic) = stepping.atomic.as_mut() {
            let mut memory = None;

            if stepping.state == State::InAtomicSequence {
                let finished = self.backend
                    .memory(tid)
                    .and_then(|mut mem| atomic.finish(&mut mem).map(|()| mem));

                match finished {
                    Ok(mem) => memory = Some(mem),
                    Err(err) => session.note_fault("could not remove atomic-sequence breakpoints", &err),
                }

                stepping.state = State::Stepping;
            }

            let memory = match memory {
                Some(mem) => Ok(mem),
                None => self.backend.memory(tid),
            };

            let armed = memory.and_then(|mut mem| atomic.step_over(&mut mem, regs));

            match armed {
                Ok(Some(seq)) => {
                    stepping.state = State::InAtomicSequence;
                    debug!(tid = tid.as_raw(), start = seq.start, end = seq.end, "running over atomic sequence");
                    return Action::ResumeHideSignal { step: None };
                },
                Ok(None) => {},
                Err(err) => session.note_fault("atomic-sequence detection failed", &err),
            }
        }

        drop(guard);

        session.probe().fire(regs, mode, aux);

        Action::ResumeHideSignal { step: Some(mode) }
    }

    fn on_clone(&self, tid: Pid, new: Pid) -> Action {
        let session = match self.registry.find(tid) {
            Some(session) => session,
            None => return Action::Resume { step: None },
        };

        debug!(tid = tid.as_raw(), new = new.as_raw(), "clone reported, child is not traced");

        let step = session.stepping().resume_mode(session.mode());
        Action::Resume { step }
    }

    fn on_death(&self, tid: Pid) -> Action {
        if let Some(session) = self.registry.find(tid) {
            session.stepping().state = State::Detached;

            let detached = self.registry.remove_and_detach(&session, Reason::Death);
            debug!(tid = tid.as_raw(), ?detached, "thread died");
        }

        Action::Detach
    }
}

//! Stepping over PowerPC load-reserve/store-conditional sequences.
//!
//! Single-stepping between a `lwarx`/`ldarx` and its matching `stwcx.`/`stdcx.` takes a
//! trap inside the reservation window, which clears the reservation and makes the
//! store fail forever. Instead, when a trap lands on a reservation load we scan ahead
//! for the closing store, plant breakpoints after it (and at the destination of at most
//! one conditional branch inside the sequence), and let the thread run to them.

use tracing::{debug, warn};

use crate::backend::Memory;
use crate::error::Result;
use crate::overlay::{self, Breakpoint, INSN_SIZE};
use crate::regs::Registers;

const LWARX_MASK: u32 = 0xfc00_07fe;
const LWARX_INSN: u32 = 0x7c00_0028;
const LDARX_INSN: u32 = 0x7c00_00a8;

const STWCX_MASK: u32 = 0xfc00_07ff;
const STWCX_INSN: u32 = 0x7c00_012d;
const STDCX_INSN: u32 = 0x7c00_01ad;

const OPCODE_B: u32 = 18;
const OPCODE_BC: u32 = 16;
const OPCODE_XL: u32 = 19;

const XO_BCLR: u32 = 16;
const XO_BCCTR: u32 = 528;

/// Maximum number of instructions scanned after the reservation load.
pub const ATOMIC_SEQ_LENGTH: usize = 16;

/// Lowest address a branch destination may have to be worth a breakpoint.
pub const TEXT_SEGMENT_BASE: u64 = 1;

/// Primary opcode, bits 0-5.
pub fn opcode(insn: u32) -> u32 {
    insn >> 26
}

fn extended_opcode(insn: u32) -> u32 {
    (insn >> 1) & 0x3ff
}

pub fn is_reservation_load(insn: u32) -> bool {
    let masked = insn & LWARX_MASK;
    masked == LWARX_INSN || masked == LDARX_INSN
}

pub fn is_conditional_store(insn: u32) -> bool {
    let masked = insn & STWCX_MASK;
    masked == STWCX_INSN || masked == STDCX_INSN
}

/// `bc`, `bclr` or `bcctr`.
pub fn is_conditional_branch(insn: u32) -> bool {
    match opcode(insn) {
        OPCODE_BC => true,
        OPCODE_XL => matches!(extended_opcode(insn), XO_BCLR | XO_BCCTR),
        _ => false,
    }
}

/// Destination of the branch `insn` at `pc`, or `None` if `insn` is not a branch.
pub fn decode_branch(opcode: u32, insn: u32, regs: &Registers, pc: u64) -> Option<u64> {
    let absolute = (insn >> 1) & 1 == 1;

    let dest = match opcode {
        OPCODE_B => {
            // 24-bit LI field, word-aligned and sign-extended.
            let imm = (((insn & !3) << 6) as i32) >> 6;
            relocate(imm, absolute, pc)
        },
        OPCODE_BC => {
            // 14-bit BD field, word-aligned and sign-extended.
            let imm = (((insn & !3) << 16) as i32) >> 16;
            relocate(imm, absolute, pc)
        },
        OPCODE_XL => match extended_opcode(insn) {
            XO_BCLR => regs.link & !3,
            XO_BCCTR => {
                let dest = regs.count & !3;

                // Returning from a system call leaves the count register below the text.
                if dest < TEXT_SEGMENT_BASE {
                    regs.link & !3
                } else {
                    dest
                }
            },
            _ => return None,
        },
        _ => return None,
    };

    Some(dest)
}

fn relocate(imm: i32, absolute: bool, pc: u64) -> u64 {
    let imm = imm as i64 as u64;

    if absolute {
        imm
    } else {
        pc.wrapping_add(imm)
    }
}

/// A detected atomic sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Sequence {
    /// Address of the reservation load.
    pub start: u64,

    /// Where execution resumes after the sequence.
    pub end: u64,

    /// Destination of the sequence's conditional branch, if it leaves `start..=end`.
    pub branch: Option<u64>,
}

/// Recognize an atomic sequence starting at `regs.pc`.
pub fn detect<M: Memory + ?Sized>(memory: &M, regs: &Registers) -> Result<Option<Sequence>> {
    let start = regs.pc;

    if !is_reservation_load(overlay::read_word(memory, start)?) {
        return Ok(None);
    }

    let mut ip = start;
    let mut branch = None;
    let mut store = None;

    for _ in 0..ATOMIC_SEQ_LENGTH {
        ip = ip.wrapping_add(INSN_SIZE);
        let insn = overlay::read_word(memory, ip)?;

        if is_conditional_branch(insn) {
            if branch.is_some() {
                debug!(start, ip, "second conditional branch in atomic sequence");
                return Ok(None);
            }

            branch = decode_branch(opcode(insn), insn, regs, ip)
                .filter(|&dest| dest >= TEXT_SEGMENT_BASE);
        }

        if is_conditional_store(insn) {
            store = Some(ip);
            break;
        }
    }

    let store = match store {
        Some(store) => store,
        None => {
            debug!(start, "no conditional store within scan bound");
            return Ok(None);
        },
    };

    let mut end = store.wrapping_add(INSN_SIZE);
    if is_conditional_branch(overlay::read_word(memory, end)?) {
        end = end.wrapping_add(INSN_SIZE);
    }

    let branch = branch.filter(|dest| !(start..=end).contains(dest));

    Ok(Some(Sequence { start, end, branch }))
}

/// Per-thread state of an in-progress step over an atomic sequence.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AtomicStepState {
    in_sequence: bool,
    end: Option<Breakpoint>,
    branch: Option<Breakpoint>,
}

impl AtomicStepState {
    pub fn in_sequence(&self) -> bool {
        self.in_sequence
    }

    /// Breakpoint written after the sequence, if this state wrote one.
    pub fn end_breakpoint(&self) -> Option<Breakpoint> {
        self.end
    }

    /// Breakpoint written at the branch destination, if this state wrote one.
    pub fn branch_breakpoint(&self) -> Option<Breakpoint> {
        self.branch
    }

    /// Detect a sequence at `regs.pc` and arm breakpoints to run over it.
    ///
    /// Returns the armed sequence, or `None` if the thread should keep stepping. On error
    /// nothing remains installed.
    pub fn step_over<M: Memory + ?Sized>(
        &mut self,
        memory: &mut M,
        regs: &Registers,
    ) -> Result<Option<Sequence>> {
        if self.in_sequence {
            self.finish(memory)?;
        }

        let seq = match detect(memory, regs)? {
            Some(seq) => seq,
            None => return Ok(None),
        };

        let end = overlay::insert(memory, seq.end)?;

        let branch = match seq.branch {
            Some(dest) => match overlay::insert(memory, dest) {
                Ok(bpt) => bpt,
                Err(err) => {
                    if let Some(end) = &end {
                        if let Err(err) = overlay::remove(memory, end) {
                            warn!(addr = end.addr, %err, "could not remove end breakpoint");
                        }
                    }
                    return Err(err);
                },
            },
            None => None,
        };

        self.end = end;
        self.branch = branch;
        self.in_sequence = true;

        debug!(start = seq.start, end = seq.end, branch = ?seq.branch, "stepping over atomic sequence");

        Ok(Some(seq))
    }

    /// Remove every breakpoint this state installed and leave the sequence.
    ///
    /// The state is cleared even if a removal fails; the first failure is returned.
    pub fn finish<M: Memory + ?Sized>(&mut self, memory: &mut M) -> Result<()> {
        let mut result = Ok(());

        for bpt in [self.end.take(), self.branch.take()].iter().flatten() {
            if let Err(err) = overlay::remove(memory, bpt) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        self.in_sequence = false;

        result
    }
}

//! Temporary trap instructions patched into a live process image.

use std::io;

use tracing::{trace, warn};

use crate::backend::Memory;
use crate::error::{Error, Result};

/// Size of one instruction word.
pub const INSN_SIZE: u64 = 4;

/// PowerPC `tw 31,0,0`, the unconditional trap.
pub const TRAP_INSN: u32 = 0x7fe0_0008;

/// A trap we wrote, with the word it replaced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Breakpoint {
    pub addr: u64,
    pub saved: u32,
}

/// Read one instruction word at `addr`, in the target's byte order.
pub fn read_word<M: Memory + ?Sized>(memory: &M, addr: u64) -> Result<u32> {
    let mut buf = [0; INSN_SIZE as usize];
    let len = memory.read(addr, &mut buf)?;

    if len != buf.len() {
        let source = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        return Err(Error::MemoryAccess { addr, source });
    }

    Ok(u32::from_ne_bytes(buf))
}

fn write_word<M: Memory + ?Sized>(memory: &mut M, addr: u64, word: u32, original: u32) -> Result<()> {
    let data = word.to_ne_bytes();
    let written = memory.write(addr, &data)?;

    if written == data.len() {
        return Ok(());
    }

    // Undo whatever prefix landed so the word is not left torn. One attempt only.
    if written > 0 {
        let undo = original.to_ne_bytes();
        if let Err(err) = memory.write(addr, &undo[..written]) {
            warn!(addr, %err, "could not roll back partial write");
        }
    }

    Err(Error::PartialWrite { addr, written, expected: data.len() })
}

/// Patch a trap instruction over `addr`.
///
/// Returns `None` if a trap is already there, in which case there is nothing to restore.
pub fn insert<M: Memory + ?Sized>(memory: &mut M, addr: u64) -> Result<Option<Breakpoint>> {
    let saved = read_word(memory, addr)?;

    if saved == TRAP_INSN {
        trace!(addr, "trap already present");
        return Ok(None);
    }

    write_word(memory, addr, TRAP_INSN, saved)?;
    trace!(addr, saved, "inserted breakpoint");

    Ok(Some(Breakpoint { addr, saved }))
}

/// Restore the word saved by [`insert`].
pub fn remove<M: Memory + ?Sized>(memory: &mut M, bpt: &Breakpoint) -> Result<()> {
    write_word(memory, bpt.addr, bpt.saved, TRAP_INSN)?;
    trace!(addr = bpt.addr, "removed breakpoint");

    Ok(())
}

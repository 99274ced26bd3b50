//! Register snapshots handed to the engine and to probe handlers.

/// Architecture-neutral register snapshot of a stopped thread.
///
/// `link` and `count` hold the PowerPC link and count registers, which branch decoding
/// needs. Architectures without them report `0`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Registers {
    pub pc: u64,
    pub sp: u64,
    pub link: u64,
    pub count: u64,
    pub gpr: [u64; 32],
}

impl Registers {
    pub fn new(pc: u64) -> Self {
        Self { pc, ..Self::default() }
    }
}

/// Native register state of a tracee, as returned by the kernel.
#[cfg(target_arch = "x86_64")]
pub type NativeRegisters = libc::user_regs_struct;

#[cfg(target_arch = "x86_64")]
impl From<NativeRegisters> for Registers {
    fn from(regs: NativeRegisters) -> Self {
        let gpr = [
            regs.rax, regs.rbx, regs.rcx, regs.rdx, regs.rsi, regs.rdi, regs.rbp, regs.rsp,
            regs.r8, regs.r9, regs.r10, regs.r11, regs.r12, regs.r13, regs.r14, regs.r15,
        ];

        let mut all = [0; 32];
        all[..gpr.len()].copy_from_slice(&gpr);

        Self {
            pc: regs.rip,
            sp: regs.rsp,
            link: 0,
            count: 0,
            gpr: all,
        }
    }
}

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NativeRegisters {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

#[cfg(target_arch = "aarch64")]
impl From<NativeRegisters> for Registers {
    fn from(native: NativeRegisters) -> Self {
        let mut gpr = [0; 32];
        gpr[..31].copy_from_slice(&native.regs);

        Self {
            pc: native.pc,
            sp: native.sp,
            link: native.regs[30],
            count: 0,
            gpr,
        }
    }
}

/// `struct pt_regs`, defined in `arch/powerpc/include/uapi/asm/ptrace.h`.
#[cfg(target_arch = "powerpc64")]
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NativeRegisters {
    pub gpr: [u64; 32],
    pub nip: u64,
    pub msr: u64,
    pub orig_gpr3: u64,
    pub ctr: u64,
    pub link: u64,
    pub xer: u64,
    pub ccr: u64,
    pub softe: u64,
    pub trap: u64,
    pub dar: u64,
    pub dsisr: u64,
    pub result: u64,
}

#[cfg(target_arch = "powerpc64")]
impl From<NativeRegisters> for Registers {
    fn from(native: NativeRegisters) -> Self {
        Self {
            pc: native.nip,
            sp: native.gpr[1],
            link: native.link,
            count: native.ctr,
            gpr: native.gpr,
        }
    }
}

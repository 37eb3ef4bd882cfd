//! Typed access to the CPU register file saved in a signal frame.
//!
//! All register semantics live here as explicit computations on the
//! `gregs` array of the saved `ucontext_t`; the fault handler never works
//! with any "current registers" abstraction. Mutating these fields changes
//! the state the faulting thread resumes with.

use ghostbus_decoder::Reg;

/// `uc_mcontext.gregs` index for each GPR in x86 encoding order
/// (0 = RAX, 1 = RCX, 2 = RDX, 3 = RBX, 4 = RSP, 5 = RBP, 6 = RSI,
/// 7 = RDI, 8..=15 = R8..R15).
const GREGS_INDEX: [i32; 16] = [
    libc::REG_RAX,
    libc::REG_RCX,
    libc::REG_RDX,
    libc::REG_RBX,
    libc::REG_RSP,
    libc::REG_RBP,
    libc::REG_RSI,
    libc::REG_RDI,
    libc::REG_R8,
    libc::REG_R9,
    libc::REG_R10,
    libc::REG_R11,
    libc::REG_R12,
    libc::REG_R13,
    libc::REG_R14,
    libc::REG_R15,
];

/// Direction flag in the saved RFLAGS.
pub(crate) const DF_BIT: u64 = 1 << 10;

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDI: u8 = 7;

pub(crate) struct SavedContext {
    uctx: *mut libc::ucontext_t,
}

impl SavedContext {
    /// # Safety
    ///
    /// `ctx` must be the third argument of an `SA_SIGINFO` handler, valid
    /// for the duration of that handler invocation.
    pub(crate) unsafe fn from_signal(ctx: *mut libc::c_void) -> Self {
        Self { uctx: ctx.cast() }
    }

    fn greg(&self, index: i32) -> u64 {
        unsafe { (*self.uctx).uc_mcontext.gregs[index as usize] as u64 }
    }

    fn set_greg(&mut self, index: i32, value: u64) {
        unsafe {
            (*self.uctx).uc_mcontext.gregs[index as usize] = value as libc::greg_t;
        }
    }

    pub(crate) fn rip(&self) -> u64 {
        self.greg(libc::REG_RIP)
    }

    pub(crate) fn advance_rip(&mut self, delta: u64) {
        self.set_greg(libc::REG_RIP, self.rip().wrapping_add(delta));
    }

    pub(crate) fn rflags(&self) -> u64 {
        self.greg(libc::REG_EFL)
    }

    fn gpr(&self, index: u8) -> u64 {
        self.greg(GREGS_INDEX[index as usize & 0xF])
    }

    fn set_gpr(&mut self, index: u8, value: u64) {
        self.set_greg(GREGS_INDEX[index as usize & 0xF], value);
    }

    pub(crate) fn rax(&self) -> u64 {
        self.gpr(RAX)
    }

    pub(crate) fn rcx(&self) -> u64 {
        self.gpr(RCX)
    }

    pub(crate) fn set_rcx(&mut self, value: u64) {
        self.set_gpr(RCX, value);
    }

    pub(crate) fn rdi(&self) -> u64 {
        self.gpr(RDI)
    }

    pub(crate) fn set_rdi(&mut self, value: u64) {
        self.set_gpr(RDI, value);
    }

    /// Read a store source operand, masked to the access size.
    pub(crate) fn read_reg(&self, reg: Reg, size: u8) -> u64 {
        let full = self.gpr(reg.index);
        if reg.high_byte {
            return (full >> 8) & 0xFF;
        }
        match size {
            1 => full & 0xFF,
            2 => full & 0xFFFF,
            4 => full & 0xFFFF_FFFF,
            _ => full,
        }
    }

    /// Write a load destination with x86-64 merge rules: 8- and 16-bit
    /// writes preserve the remaining bits, a 32-bit write clears the upper
    /// 32, a 64-bit write replaces everything.
    pub(crate) fn write_reg(&mut self, reg: Reg, value: u64, size: u8) {
        let cur = self.gpr(reg.index);
        let merged = if reg.high_byte {
            (cur & !0xFF00) | ((value & 0xFF) << 8)
        } else {
            match size {
                1 => (cur & !0xFF) | (value & 0xFF),
                2 => (cur & !0xFFFF) | (value & 0xFFFF),
                4 => value & 0xFFFF_FFFF,
                _ => value,
            }
        };
        self.set_gpr(reg.index, merged);
    }
}

//! Host x86-64 registers and the emitted-code ABI.
//!
//! Generated blocks are entered as `extern "C" fn(*mut CpuContext)
//! -> u64` (System V). The ABI the translator relies on:
//!
//! - RDI holds the guest context pointer. Helper calls pass it as
//!   their first argument unchanged, but helpers may clobber it, so
//!   recipes reload RDI from the stack home slot after every call.
//! - RBX is pushed in the prologue and available as a call-
//!   surviving scratch register.
//! - RAX/RCX/RDX/RSI/R8-R11 are plain scratch.
//! - The frame holds a small set of 8-byte local slots plus the
//!   context home slot; its size is patched into the prologue's
//!   `sub rsp` when the block is finalized.

/// x86-64 general-purpose register numbers (ModRM/REX encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the encoding (ModRM field).
    #[inline]
    pub const fn low3(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Registers 8-15 need a REX extension bit.
    #[inline]
    pub const fn is_ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// Persistent guest-context register inside a block.
pub const CTX_REG: Reg = Reg::Rdi;

/// First function-argument registers of the System V AMD64 ABI, in
/// order. Helper calls are formed against these.
pub const CALL_ARG_REGS: &[Reg] =
    &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// The one callee-saved register blocks save and use.
pub const SAVED_REG: Reg = Reg::Rbx;

/// Number of 8-byte local scratch slots in every frame.
pub const NUM_LOCALS: usize = 4;

/// Byte offset of local slot `i` from RSP.
#[inline]
pub const fn local_off(i: usize) -> i32 {
    (i * 8) as i32
}

/// Byte offset of the context-pointer home slot from RSP.
pub const CTX_HOME_OFF: i32 = (NUM_LOCALS * 8) as i32;

pub const STACK_ALIGN: usize = 16;

/// Frame size the prologue's patched `sub rsp` uses. Entry pushes
/// the return address and RBX (16 bytes together), so a 16-byte-
/// aligned frame keeps RSP aligned at every call site.
pub const FRAME_SIZE: usize = {
    let raw = NUM_LOCALS * 8 + 8;
    (raw + STACK_ALIGN - 1) & !(STACK_ALIGN - 1)
};

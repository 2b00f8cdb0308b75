//! dbt86 core — guest-visible CPU state and the runtime support
//! layer.
//!
//! Everything the generated host code touches lives here: the
//! `#[repr(C)]` [`CpuContext`] with its fixed field offsets, the
//! lazy EFLAGS model, the memory / I/O helper functions callable
//! from emitted code, and the exception delivery machinery. The
//! instruction decoder and the [`TranslatedBlock`] data model are
//! shared with the frontend and the execution engine.

pub mod bus;
pub mod context;
pub mod decode;
pub mod error;
pub mod exceptions;
pub mod insn;
pub mod io;
pub mod lazyflags;
pub mod mem;
pub mod mmu;
pub mod segments;
pub mod sysregs;
pub mod tb;
pub mod x86;

pub use bus::{Bus, RamBus};
pub use context::{CpuConfig, CpuContext, SegReg};
pub use error::CpuError;
pub use exceptions::Exception;
pub use insn::{AddrSize, DecodedInstr, Opcode, Operand, OperandSize};
pub use lazyflags::LazyFlags;
pub use tb::{TbKey, TranslatedBlock};

//! dbt86 backend — host x86-64 code generation.
//!
//! The [`Emitter`] provides the primitive operation set the
//! translator is written against (sized moves, ALU ops, compares,
//! conditional moves, label-based branches, absolute calls, memory
//! operand forms, prologue/epilogue/tail sequences) and flattens a
//! session to bytes at finalize. [`ExecBlock`] owns the W^X
//! executable memory a finalized block is installed into.

pub mod code_block;
pub mod emitter;
pub mod regs;

pub use code_block::ExecBlock;
pub use emitter::{Alu, Cc, EmitError, Emitter, LabelId, Mem, Shift, Width};
pub use regs::Reg;

//! dbt86 frontend — per-block x86 guest translation.
//!
//! Consumes decoded guest instructions starting at the current
//! guest PC and emits one block of host code through the backend
//! emitter, ending at a control-flow boundary, a mode-affecting
//! instruction, or a guest page crossing. The opcode recipes follow
//! a fixed shape: fetch operands, compute, write back, update the
//! lazy flag slots, and finally emit the block tail with its
//! single-step/interrupt checkpoints and link stubs.

pub mod x86;

pub use x86::{translate, RuntimeHooks, TranslatedCode};

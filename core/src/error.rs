use thiserror::Error;

/// Host-visible fatal errors surfaced to the embedder.
///
/// Guest-visible faults never appear here; they are delivered to the
/// guest through the IDT by the exception engine. Nothing in this
/// enum is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuError {
    /// The decoder met an opcode the translator has no recipe for.
    #[error("unknown instruction {opcode:#04x} at eip {eip:#010x}")]
    UnknownInstr { opcode: u8, eip: u32 },

    /// The executable-memory allocator returned no memory.
    #[error("out of executable memory")]
    NoMemory,

    /// An emitter post-condition was violated (zero-size block,
    /// unresolved label at finalize, frame overflow).
    #[error("internal code generation error: {0}")]
    Internal(&'static str),

    /// A guest feature the core deliberately does not model
    /// (task gates, I/O watchpoints). Failing loudly is preferred
    /// over a silent approximation.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

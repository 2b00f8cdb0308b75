//! Translated-block data model.
//!
//! A `TranslatedBlock` maps one linear run of guest instructions to
//! a region of generated host code. Blocks are created empty before
//! translation (their address must be stable so the translator can
//! embed pointers to `flags` and the chain slots in emitted code),
//! filled by the translation cache at install time, and only freed
//! by a full cache flush or page invalidation.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// -- TB flag bits --

/// Number of chainable edges decided at translate time (0..2).
pub const TB_FLG_NUM_JMP_MASK: u32 = 0x3;

/// Runtime exit-kind field, written by the block tail just before
/// it leaves: which edge the block took this time.
pub const TB_FLG_JMP_KIND_MASK: u32 = 0x30;
/// Took the branch target — chain slot 0.
pub const TB_JMP_DST: u32 = 0 << 4;
/// Fell through — chain slot 1.
pub const TB_JMP_NEXT_PC: u32 = 1 << 4;
/// Runtime target matched neither compile-time edge; returned to
/// the dispatcher, not linkable.
pub const TB_JMP_RET: u32 = 2 << 4;

/// Block ends in a direct (compile-time-target) transfer.
pub const TB_FLG_DIRECT: u32 = 1 << 6;
/// Block ends in an indirect (runtime-target) transfer.
pub const TB_FLG_INDIRECT: u32 = 1 << 7;
/// Direct transfer with a single unconditional destination.
pub const TB_FLG_DST_ONLY: u32 = 1 << 8;
/// Reserved variant of DST_ONLY behind a runtime condition; the bit
/// is kept for compatibility but no code path sets it.
pub const TB_FLG_COND_DST_ONLY: u32 = 1 << 9;

pub const TB_FLG_LINK_MASK: u32 =
    TB_FLG_DIRECT | TB_FLG_INDIRECT | TB_FLG_DST_ONLY | TB_FLG_COND_DST_ONLY;

/// Chain-slot index of the interrupt-check edge. Never patched by
/// the linker; jumping through it always reaches the dispatcher.
pub const TB_JMP_INT_SLOT: usize = 2;

/// Lookup key: a block is reusable only for the same physical PC,
/// code-segment base and translation-relevant mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TbKey {
    pub phys_pc: u32,
    pub cs_base: u32,
    pub flags: u32,
}

/// One translated block.
///
/// Concurrency discipline: after install, a block is immutable
/// except for the chain slots, the runtime exit-kind bits in
/// `flags`, and the link bookkeeping. Chain slots are single-writer
/// (the dispatcher) and only rewritten while no host thread is
/// executing inside the block; release stores publish them.
pub struct TranslatedBlock {
    /// Guest physical PC of the first instruction.
    pub pc: u32,
    pub cs_base: u32,
    /// Mode fingerprint at translate time.
    pub mode_flags: u32,
    /// CS-relative EIP of the first instruction.
    pub eip: u32,
    /// Guest bytes covered by this block.
    pub size: u32,
    pub icount: u16,

    /// NUM_JMP / exit-kind / link-kind bits; the low half is also
    /// read and written by the block's own tail code.
    pub flags: AtomicU32,
    /// Chain slots 0/1 plus the interrupt-check slot 2. Each holds
    /// a host code address: initially this block's epilogue
    /// trampoline, after linking a successor's entry point.
    pub jmp_offset: [AtomicU64; 3],

    /// First host instruction of the block.
    pub host_entry: AtomicU64,
    /// Address of the block's epilogue trampoline (the 11-byte
    /// `movabs rax, tb; ret` sequence after the code). A chain slot
    /// equal to this value is unlinked.
    pub epilogue: AtomicU64,

    /// Outgoing links per chain slot (dispatcher bookkeeping).
    pub jmp_dest: [Option<TbKey>; 2],
    /// Incoming links: (source key, slot) pairs, so invalidation
    /// can unlink chains that lead here.
    pub jmp_list: Vec<(TbKey, usize)>,
}

impl TranslatedBlock {
    pub fn new(pc: u32, cs_base: u32, mode_flags: u32, eip: u32) -> Box<Self> {
        Box::new(Self {
            pc,
            cs_base,
            mode_flags,
            eip,
            size: 0,
            icount: 0,
            flags: AtomicU32::new(0),
            jmp_offset: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            host_entry: AtomicU64::new(0),
            epilogue: AtomicU64::new(0),
            jmp_dest: [None; 2],
            jmp_list: Vec::new(),
        })
    }

    #[inline]
    pub fn key(&self) -> TbKey {
        TbKey {
            phys_pc: self.pc,
            cs_base: self.cs_base,
            flags: self.mode_flags,
        }
    }

    /// Address of the `flags` word, for embedding in emitted code.
    #[inline]
    pub fn flags_ptr(&self) -> u64 {
        &self.flags as *const AtomicU32 as u64
    }

    /// Address of chain slot `n`, for embedding in emitted code.
    #[inline]
    pub fn jmp_slot_ptr(&self, n: usize) -> u64 {
        &self.jmp_offset[n] as *const AtomicU64 as u64
    }

    /// Merge translate-time flag bits (NUM_JMP, link kind).
    pub fn or_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::Relaxed);
    }

    /// Which edge did the block take when it last exited?
    pub fn exit_kind(&self) -> u32 {
        self.flags.load(Ordering::Acquire) & TB_FLG_JMP_KIND_MASK
    }

    pub fn num_jmp(&self) -> u32 {
        self.flags.load(Ordering::Relaxed) & TB_FLG_NUM_JMP_MASK
    }

    /// True while chain slot `n` still routes to the epilogue
    /// trampoline (i.e. has never been linked).
    pub fn slot_unlinked(&self, n: usize) -> bool {
        self.jmp_offset[n].load(Ordering::Acquire)
            == self.epilogue.load(Ordering::Relaxed)
    }

    /// Publish a successor's entry point into chain slot `n`.
    pub fn link_slot(&self, n: usize, target_entry: u64) {
        self.jmp_offset[n].store(target_entry, Ordering::Release);
    }

    /// Route chain slot `n` back to the epilogue trampoline.
    pub fn unlink_slot(&self, n: usize) {
        self.jmp_offset[n]
            .store(self.epilogue.load(Ordering::Relaxed), Ordering::Release);
    }
}

impl std::fmt::Debug for TranslatedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatedBlock")
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("cs_base", &self.cs_base)
            .field("mode_flags", &self.mode_flags)
            .field("size", &self.size)
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .finish()
    }
}

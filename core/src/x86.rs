//! x86 architectural constants shared across the translator core.

// ---------------------------------------------------------------
// General-purpose register indices (guest, 32-bit order)
// ---------------------------------------------------------------

pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;

// Segment register indices, in descriptor-table order.
pub const SEG_ES: usize = 0;
pub const SEG_CS: usize = 1;
pub const SEG_SS: usize = 2;
pub const SEG_DS: usize = 3;
pub const SEG_FS: usize = 4;
pub const SEG_GS: usize = 5;
pub const NUM_SEGS: usize = 6;

// ---------------------------------------------------------------
// EFLAGS
// ---------------------------------------------------------------

pub const CF_MASK: u32 = 1 << 0;
pub const PF_MASK: u32 = 1 << 2;
pub const AF_MASK: u32 = 1 << 4;
pub const ZF_MASK: u32 = 1 << 6;
pub const SF_MASK: u32 = 1 << 7;
pub const TF_MASK: u32 = 1 << 8;
pub const IF_MASK: u32 = 1 << 9;
pub const DF_MASK: u32 = 1 << 10;
pub const OF_MASK: u32 = 1 << 11;
pub const IOPL_MASK: u32 = 3 << 12;
pub const IOPL_SHIFT: u32 = 12;
pub const NT_MASK: u32 = 1 << 14;
pub const RF_MASK: u32 = 1 << 16;
pub const VM_MASK: u32 = 1 << 17;
pub const AC_MASK: u32 = 1 << 18;

/// Bit 1 reads as one on every x86.
pub const EFLAGS_FIXED: u32 = 1 << 1;

/// The six flags carried by the lazy model; everything else lives
/// directly in `CpuContext.eflags`.
pub const LAZY_FLAGS_MASK: u32 =
    CF_MASK | PF_MASK | AF_MASK | ZF_MASK | SF_MASK | OF_MASK;

// ---------------------------------------------------------------
// Control registers
// ---------------------------------------------------------------

pub const CR0_PE_MASK: u32 = 1 << 0;
pub const CR0_MP_MASK: u32 = 1 << 1;
pub const CR0_EM_MASK: u32 = 1 << 2;
pub const CR0_TS_MASK: u32 = 1 << 3;
pub const CR0_ET_MASK: u32 = 1 << 4;
pub const CR0_NE_MASK: u32 = 1 << 5;
pub const CR0_WP_MASK: u32 = 1 << 16;
pub const CR0_AM_MASK: u32 = 1 << 18;
pub const CR0_NW_MASK: u32 = 1 << 29;
pub const CR0_CD_MASK: u32 = 1 << 30;
pub const CR0_PG_MASK: u32 = 1 << 31;

/// Writable CR0 bits.
pub const CR0_FLG_MASK: u32 = CR0_PE_MASK
    | CR0_MP_MASK
    | CR0_EM_MASK
    | CR0_TS_MASK
    | CR0_NE_MASK
    | CR0_WP_MASK
    | CR0_AM_MASK
    | CR0_NW_MASK
    | CR0_CD_MASK
    | CR0_PG_MASK;

pub const CR3_PD_MASK: u32 = 0xFFFF_F000;
pub const CR3_FLG_MASK: u32 = CR3_PD_MASK | (1 << 3) | (1 << 4);

pub const CR4_DE_MASK: u32 = 1 << 3;
pub const CR4_PSE_MASK: u32 = 1 << 4;
pub const CR4_PGE_MASK: u32 = 1 << 7;

// ---------------------------------------------------------------
// Debug registers
// ---------------------------------------------------------------

pub const DR6_B0_MASK: u32 = 1 << 0;
pub const DR6_BD_MASK: u32 = 1 << 13;
pub const DR6_BS_MASK: u32 = 1 << 14;
/// Bits of DR6 that read as one.
pub const DR6_RES_MASK: u32 = 0xFFFF_0FF0;

pub const DR7_GD_MASK: u32 = 1 << 13;
/// Bits of DR7 that read as one.
pub const DR7_RES_MASK: u32 = 1 << 10;
pub const DR7_TYPE_SHIFT: u32 = 16;

/// DR7 watchpoint kind field values (per-breakpoint, 2 bits).
pub const DR7_TYPE_EXEC: u32 = 0;
pub const DR7_TYPE_WRITE: u32 = 1;
pub const DR7_TYPE_IO_RW: u32 = 2;
pub const DR7_TYPE_DATA_RW: u32 = 3;

// ---------------------------------------------------------------
// Exception vectors
// ---------------------------------------------------------------

pub const EXP_DE: u8 = 0;
pub const EXP_DB: u8 = 1;
pub const EXP_NMI: u8 = 2;
pub const EXP_BP: u8 = 3;
pub const EXP_OF: u8 = 4;
pub const EXP_BR: u8 = 5;
pub const EXP_UD: u8 = 6;
pub const EXP_NM: u8 = 7;
pub const EXP_DF: u8 = 8;
pub const EXP_TS: u8 = 10;
pub const EXP_NP: u8 = 11;
pub const EXP_SS: u8 = 12;
pub const EXP_GP: u8 = 13;
pub const EXP_PF: u8 = 14;
pub const EXP_MF: u8 = 16;

// Page-fault error code bits.
pub const PF_ERR_P: u16 = 1 << 0;
pub const PF_ERR_W: u16 = 1 << 1;
pub const PF_ERR_U: u16 = 1 << 2;

// ---------------------------------------------------------------
// hflags — precomputed mode bits kept in CpuContext.hflags
// ---------------------------------------------------------------

/// Current privilege level (bits 0-1).
pub const HFLG_CPL_MASK: u32 = 0x3;
/// CS.D/B: 32-bit default operand/address size for code.
pub const HFLG_CS32: u32 = 1 << 2;
/// SS.D/B: 32-bit stack.
pub const HFLG_SS32: u32 = 1 << 3;
/// CR0.PE is set.
pub const HFLG_PE_MODE: u32 = 1 << 4;
/// Implicit supervisor access override for the current helper call.
pub const HFLG_CPL_PRIV: u32 = 1 << 5;

// ---------------------------------------------------------------
// Paging / TLB
// ---------------------------------------------------------------

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// One direct-mapped soft-TLB entry per virtual page.
pub const TLB_ENTRIES: usize = 1 << 20;

pub const TLB_VALID: u32 = 1 << 0;
pub const TLB_WRITE: u32 = 1 << 1;
pub const TLB_USER: u32 = 1 << 2;
pub const TLB_GLOBAL: u32 = 1 << 3;
pub const TLB_DIRTY: u32 = 1 << 4;
pub const TLB_CODE: u32 = 1 << 5;
pub const TLB_WATCH: u32 = 1 << 6;
pub const TLB_RAM: u32 = 1 << 7;
pub const TLB_FLAGS_MASK: u32 = PAGE_MASK;

/// IOTLB granule: 8 ports per entry.
pub const IO_SHIFT: u32 = 3;
pub const IOTLB_ENTRIES: usize = 1 << 13;
pub const IOTLB_WATCH: u16 = 1 << 0;

// ---------------------------------------------------------------
// Segment descriptor hidden-flag bits (raw high-dword layout)
// ---------------------------------------------------------------

pub const SEG_FLG_TYPE_MASK: u32 = 0xF << 8;
pub const SEG_FLG_ACCESSED: u32 = 1 << 8;
pub const SEG_FLG_WRITABLE: u32 = 1 << 9; // data segments
pub const SEG_FLG_READABLE: u32 = 1 << 9; // code segments
pub const SEG_FLG_EXPAND_DOWN: u32 = 1 << 10; // data segments
pub const SEG_FLG_CONFORMING: u32 = 1 << 10; // code segments
pub const SEG_FLG_CODE: u32 = 1 << 11;
pub const SEG_FLG_S: u32 = 1 << 12;
pub const SEG_FLG_DPL_MASK: u32 = 3 << 13;
pub const SEG_FLG_DPL_SHIFT: u32 = 13;
pub const SEG_FLG_P: u32 = 1 << 15;
pub const SEG_FLG_AVL: u32 = 1 << 20;
pub const SEG_FLG_DB: u32 = 1 << 22;
pub const SEG_FLG_G: u32 = 1 << 23;

// System descriptor types (S = 0).
pub const SYS_TYPE_LDT: u32 = 0x2;
pub const SYS_TYPE_TASK_GATE: u32 = 0x5;
pub const SYS_TYPE_TSS32_AVAIL: u32 = 0x9;
pub const SYS_TYPE_TSS32_BUSY: u32 = 0xB;
pub const SYS_TYPE_CALL_GATE32: u32 = 0xC;
pub const SYS_TYPE_INT_GATE16: u32 = 0x6;
pub const SYS_TYPE_TRAP_GATE16: u32 = 0x7;
pub const SYS_TYPE_INT_GATE32: u32 = 0xE;
pub const SYS_TYPE_TRAP_GATE32: u32 = 0xF;

/// Selector table-indicator bit (LDT when set).
pub const SEL_TI_MASK: u16 = 1 << 2;
pub const SEL_RPL_MASK: u16 = 0x3;
pub const SEL_INDEX_MASK: u16 = !0x7;

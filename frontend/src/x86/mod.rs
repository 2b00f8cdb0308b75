//! x86 frontend — disassembly context and the block translation
//! loop.

mod flags;
mod operands;
mod tail;
mod trans;
mod trans_ctrl;
mod trans_sys;

use tracing::trace;

use dbt86_backend::{Emitter, LabelId, Reg, Width};
use dbt86_core::context::{off_eip, CpuContext};
use dbt86_core::decode::{decode, DecodeError};
use dbt86_core::insn::{DecodedInstr, Opcode, OperandSize};
use dbt86_core::mem::fetch_code_byte;
use dbt86_core::tb::TranslatedBlock;
use dbt86_core::x86::*;
use dbt86_core::CpuError;

/// Cap on guest instructions per block.
const MAX_INSNS: u32 = 128;

/// Runtime entry points the emitted code calls but which live
/// above the frontend (the execution engine provides them when it
/// drives a translation).
#[derive(Debug, Clone, Copy)]
pub struct RuntimeHooks {
    /// `extern "C" fn(*mut CpuContext, *const TranslatedBlock) ->
    /// u64` — translation-cache lookup for indirect exits; returns
    /// the successor's host entry or 0.
    pub lookup_indirect: u64,
}

/// Output of one translation: finalized position-independent code
/// bytes plus the block metadata the cache needs.
pub struct TranslatedCode {
    pub code: Vec<u8>,
    /// Guest bytes covered.
    pub guest_size: u32,
    pub icount: u16,
    /// Translation stopped because the next instruction starts on
    /// a different guest page; such a block runs once and is never
    /// cached.
    pub page_cross: bool,
}

/// Per-block translation state. Mode bits are snapshotted when the
/// block starts; they are part of the block's fingerprint and may
/// not change mid-block (instructions that change them terminate
/// the block).
pub(crate) struct DisasCtx<'a> {
    pub e: Emitter,
    pub tb: &'a TranslatedBlock,
    pub hooks: RuntimeHooks,

    // Translate-time mode snapshot.
    pub cs_base: u32,
    pub cs32: bool,
    pub ss32: bool,
    pub pe_mode: bool,
    pub cpl: u32,
    pub iopl: u32,
    pub eflags_tf_rf: u32,
    pub single_step: bool,

    /// Current instruction (valid inside recipes).
    pub instr: DecodedInstr,

    /// Keep decoding after the current instruction.
    pub translate_next: bool,
    /// An exit path has already been emitted; the shared tail must
    /// not add another epilogue.
    pub needs_epilogue: bool,
    /// Shared null-TB exit for helper-detected exceptions.
    pub bail: LabelId,
    pub bail_used: bool,
}

impl<'a> DisasCtx<'a> {
    /// Linear address of the current instruction.
    pub fn instr_linear(&self) -> u32 {
        self.cs_base.wrapping_add(self.instr.eip)
    }

    /// Guest page of the current instruction.
    pub fn instr_page(&self) -> u32 {
        self.instr_linear() & !PAGE_MASK
    }

    pub fn size(&self) -> OperandSize {
        self.instr.op_size
    }

    /// Branch to the shared "exception already delivered" exit.
    pub fn gen_exp_check(&mut self) {
        use dbt86_backend::{Alu, Cc, Mem};
        self.e.reload_ctx();
        self.e.alu_mi(
            Alu::Cmp,
            Width::B8,
            Mem::ctx(dbt86_core::context::off_exp_pending()),
            0,
        );
        self.bail_used = true;
        self.e.jcc(Cc::Ne, self.bail);
    }

    /// Store a compile-time EIP value.
    pub fn gen_store_eip(&mut self, eip: u32) {
        use dbt86_backend::Mem;
        self.e.mov_mi(Width::B32, Mem::ctx(off_eip()), eip);
    }
}

/// Translate one block starting at the context's current CS:EIP.
///
/// The `tb` is pre-allocated (and address-stable) because the
/// emitted tail references its `flags` word and chain slots by
/// absolute address. On success the caller installs the returned
/// code and publishes the block.
pub fn translate(
    ctx: &mut CpuContext,
    tb: &TranslatedBlock,
    hooks: RuntimeHooks,
) -> Result<TranslatedCode, CpuError> {
    let mut e = Emitter::new();
    e.gen_prologue();
    let bail = e.new_label();

    let mut dc = DisasCtx {
        e,
        tb,
        hooks,
        cs_base: ctx.seg[SEG_CS].base,
        cs32: ctx.cs32(),
        ss32: ctx.hflags & HFLG_SS32 != 0,
        pe_mode: ctx.pe_mode(),
        cpl: ctx.cpl(),
        iopl: (ctx.eflags & IOPL_MASK) >> IOPL_SHIFT,
        eflags_tf_rf: ctx.eflags & (TF_MASK | RF_MASK),
        single_step: ctx.single_step != 0,
        instr: DecodedInstr::new(ctx.eip),
        translate_next: true,
        needs_epilogue: true,
        bail,
        bail_used: false,
    };

    let start_eip = ctx.eip;
    let start_page = dc.cs_base.wrapping_add(start_eip) & !PAGE_MASK;
    let mut eip = start_eip;
    let mut icount: u16 = 0;
    let mut page_cross = false;

    loop {
        let linear = dc.cs_base.wrapping_add(eip);
        let mut off = 0u32;
        let mut fetch = || {
            let b = fetch_code_byte(ctx, linear.wrapping_add(off))?;
            off += 1;
            Ok(b)
        };
        let decoded = decode(&mut fetch, eip, dc.cs32);

        match decoded {
            Ok(instr) => {
                dc.instr = instr;
            }
            Err(DecodeError::Fault(exc)) => {
                if icount == 0 {
                    // Fetch faulted on the block's first
                    // instruction: the block's sole operation is
                    // delivering the page fault.
                    trace!(eip = format_args!("{eip:#010x}"), "fetch fault block");
                    dc.gen_fetch_fault(&exc, eip);
                    dc.translate_next = false;
                } else {
                    // Mid-block fetch fault: stop before the
                    // faulting instruction; re-dispatch delivers
                    // it via a fresh block.
                    dc.gen_store_eip(eip);
                    dc.gen_tail_no_link();
                    dc.translate_next = false;
                }
                break;
            }
            Err(DecodeError::Unknown { opcode }) => {
                return Err(CpuError::UnknownInstr { opcode, eip });
            }
        }

        trace!(
            eip = format_args!("{eip:#010x}"),
            op = ?dc.instr.opcode,
            "translate insn"
        );
        dc.gen_insn()?;
        icount += 1;
        eip = dc.instr.next_eip();

        if !dc.translate_next {
            break;
        }
        if icount as u32 >= MAX_INSNS {
            dc.gen_store_eip(eip);
            dc.gen_tail_no_link();
            break;
        }
        if dc.cs_base.wrapping_add(eip) & !PAGE_MASK != start_page {
            page_cross = true;
            dc.gen_store_eip(eip);
            dc.gen_tail_no_link();
            break;
        }
    }

    debug_assert!(
        !dc.needs_epilogue,
        "block ended without emitting an exit path"
    );

    // Shared exception exit: a helper delivered a fault, return a
    // null block pointer so the dispatcher restarts cleanly.
    if dc.bail_used {
        let bail = dc.bail;
        dc.e.bind(bail);
        dc.e.mov_ri32(Reg::Rax, 0);
        dc.e.gen_epilogue_ret();
    }

    let code = dc
        .e
        .finalize()
        .map_err(|_| CpuError::Internal("emitter finalize failed"))?;
    Ok(TranslatedCode {
        code,
        guest_size: eip.wrapping_sub(start_eip),
        icount,
        page_cross,
    })
}

impl<'a> DisasCtx<'a> {
    /// Dispatch the current instruction to its recipe.
    fn gen_insn(&mut self) -> Result<(), CpuError> {
        use Opcode::*;
        match self.instr.opcode {
            Add | Or | And | Sub | Xor | Cmp | Test => self.gen_alu(),
            Inc | Dec => self.gen_incdec(),
            Neg => self.gen_neg(),
            Not => self.gen_not(),
            Shl | Shr | Sar => self.gen_shift(),
            Mov => self.gen_mov(),
            MovZx | MovSx => self.gen_movx(),
            Lea => self.gen_lea(),
            Push => self.gen_push(),
            Pop => self.gen_pop(),
            Jcc(cc) => self.gen_jcc(cc),
            Jecxz => self.gen_jecxz(),
            Loop | Loope | Loopne => self.gen_loop(),
            Jmp => self.gen_jmp(),
            JmpFar => self.gen_jmp_far(),
            Call => self.gen_call(),
            Ret => self.gen_ret(),
            RetFar => self.gen_ret_far(),
            Iret => self.gen_iret(),
            Int | Int3 => self.gen_int(),
            Hlt => self.gen_hlt(),
            Cli | Sti => self.gen_cli_sti(),
            Clc | Stc | Cmc => self.gen_carry_ops(),
            Cld | Std => self.gen_direction(),
            In | Out => self.gen_in_out(),
            MovSeg => self.gen_mov_seg(),
            MovCr => self.gen_mov_cr(),
            MovDr => self.gen_mov_dr(),
            Lgdt | Lidt => self.gen_lgdt_lidt(),
            Nop => Ok(()),
        }
    }
}

//! Guest exception delivery.
//!
//! Two entry points feed this module: helpers that detect a fault
//! at runtime call [`raise`] directly, and translator-staged raises
//! go through the emitted `exp_frame` stores plus
//! [`helper_raise_exception`]. Either way the exception is
//! delivered immediately — frame pushed, IDT consulted, CS:EIP
//! redirected — and `exp_pending` is set so the generated code
//! abandons the current block and the dispatcher resumes at the
//! handler.

use tracing::{debug, trace};

use crate::context::CpuContext;
use crate::mem::{stack_push16, stack_push32};
use crate::segments::read_descriptor;
use crate::x86::*;

/// A guest exception in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    pub vector: u8,
    pub error_code: Option<u16>,
    pub fault_addr: Option<u32>,
}

impl Exception {
    pub const fn new(vector: u8) -> Self {
        Self {
            vector,
            error_code: None,
            fault_addr: None,
        }
    }

    pub const fn with_code(vector: u8, code: u16) -> Self {
        Self {
            vector,
            error_code: Some(code),
            fault_addr: None,
        }
    }

    pub const fn gp(code: u16) -> Self {
        Self::with_code(EXP_GP, code)
    }

    pub const fn np(code: u16) -> Self {
        Self::with_code(EXP_NP, code)
    }

    pub const fn ss_fault(code: u16) -> Self {
        Self::with_code(EXP_SS, code)
    }

    pub const fn ud() -> Self {
        Self::new(EXP_UD)
    }

    pub const fn db() -> Self {
        Self::new(EXP_DB)
    }

    pub const fn pf(code: u16, addr: u32) -> Self {
        Self {
            vector: EXP_PF,
            error_code: Some(code),
            fault_addr: Some(addr),
        }
    }
}

/// How the event entered the pipeline; controls the gate DPL check
/// and which flags are cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// CPU-detected fault/trap.
    Fault,
    /// `INT n` / `INT3` — gate DPL is checked against CPL.
    SoftInt,
    /// External (device) interrupt.
    External,
}

/// Fatal-abort codes staged in `CpuContext.fatal`.
pub const FATAL_NONE: u8 = 0;
pub const FATAL_TRIPLE_FAULT: u8 = 1;
pub const FATAL_TASK_GATE: u8 = 2;
pub const FATAL_IO_WATCHPOINT: u8 = 3;

/// Deliver `exc`, escalating to #DF and then to a fatal triple
/// fault if delivery itself keeps faulting. Always leaves
/// `exp_pending` set so emitted code unwinds to the dispatcher.
pub fn raise(ctx: &mut CpuContext, exc: Exception, ret_eip: u32, kind: EventKind) {
    debug!(
        vector = exc.vector,
        code = ?exc.error_code,
        eip = format_args!("{ret_eip:#010x}"),
        "raising guest exception"
    );
    if let Some(addr) = exc.fault_addr {
        ctx.cr2 = addr;
    }
    match deliver(ctx, &exc, ret_eip, kind) {
        Ok(()) => {}
        Err(second) => {
            // A failed software-interrupt delivery restarts as an
            // ordinary fault; a failed fault escalates to #DF and
            // then to a fatal triple fault.
            let next = if kind == EventKind::SoftInt {
                second
            } else {
                Exception::with_code(EXP_DF, 0)
            };
            if deliver(ctx, &next, ret_eip, EventKind::Fault).is_err() {
                let df = Exception::with_code(EXP_DF, 0);
                if deliver(ctx, &df, ret_eip, EventKind::Fault).is_err() {
                    ctx.fatal = FATAL_TRIPLE_FAULT;
                }
            }
        }
    }
    ctx.exp_pending = 1;
}

/// Push the frame and vector through the IVT/IDT. Returns the
/// nested exception if delivery faults.
fn deliver(
    ctx: &mut CpuContext,
    exc: &Exception,
    ret_eip: u32,
    kind: EventKind,
) -> Result<(), Exception> {
    if ctx.pe_mode() {
        deliver_pe(ctx, exc, ret_eip, kind)
    } else {
        deliver_real(ctx, exc, ret_eip)
    }
}

fn deliver_real(
    ctx: &mut CpuContext,
    exc: &Exception,
    ret_eip: u32,
) -> Result<(), Exception> {
    let off = exc.vector as u32 * 4;
    if off + 3 > ctx.idtr_limit {
        return Err(Exception::gp(0));
    }

    let eflags = ctx.read_eflags();
    let old_cs = ctx.seg[SEG_CS].sel;
    stack_push16(ctx, (eflags & 0xFFFF) as u16, ret_eip)?;
    stack_push16(ctx, old_cs, ret_eip)?;
    stack_push16(ctx, (ret_eip & 0xFFFF) as u16, ret_eip)?;

    ctx.eflags &= !(TF_MASK | IF_MASK | RF_MASK | AC_MASK);

    let vec_addr = ctx.idtr_base + off;
    let vec_entry = crate::mem::mem_read(ctx, vec_addr, 4, ret_eip, true)?;
    let new_cs = (vec_entry >> 16) as u16;
    ctx.seg[SEG_CS].sel = new_cs;
    ctx.seg[SEG_CS].base = (new_cs as u32) << 4;
    ctx.eip = vec_entry & 0xFFFF;
    trace!(
        cs = format_args!("{new_cs:#06x}"),
        eip = format_args!("{:#06x}", ctx.eip),
        "real-mode vector"
    );
    Ok(())
}

fn deliver_pe(
    ctx: &mut CpuContext,
    exc: &Exception,
    ret_eip: u32,
    kind: EventKind,
) -> Result<(), Exception> {
    let vec = exc.vector as u32;
    // IDT error codes carry bit 1 set; external events also bit 0.
    let ext = (kind == EventKind::External || kind == EventKind::Fault) as u16;
    let idt_ec = ((vec as u16) << 3) | 2 | ext;

    let off = vec * 8;
    if off + 7 > ctx.idtr_limit {
        return Err(Exception::gp(idt_ec));
    }
    let gate_addr = ctx.idtr_base + off;
    let lo = crate::mem::mem_read(ctx, gate_addr, 4, ret_eip, true)?;
    let hi = crate::mem::mem_read(ctx, gate_addr + 4, 4, ret_eip, true)?;

    let gate_type = (hi >> 8) & 0x1F;
    let (gate32, intgate) = match gate_type {
        t if t == SYS_TYPE_INT_GATE32 => (true, true),
        t if t == SYS_TYPE_TRAP_GATE32 => (true, false),
        t if t == SYS_TYPE_INT_GATE16 => (false, true),
        t if t == SYS_TYPE_TRAP_GATE16 => (false, false),
        t if t == SYS_TYPE_TASK_GATE => {
            ctx.fatal = FATAL_TASK_GATE;
            return Ok(());
        }
        _ => return Err(Exception::gp(idt_ec)),
    };

    let gate_dpl = (hi >> 13) & 3;
    if kind == EventKind::SoftInt && gate_dpl < ctx.cpl() {
        return Err(Exception::gp(((vec as u16) << 3) | 2));
    }
    if hi & (1 << 15) == 0 {
        return Err(Exception::np(idt_ec));
    }

    let sel = (lo >> 16) as u16;
    let handler_eip = (lo & 0xFFFF) | (hi & 0xFFFF_0000);
    if sel & !(SEL_RPL_MASK) == 0 {
        return Err(Exception::gp(ext));
    }

    let desc = read_descriptor(ctx, sel, ret_eip)?;
    let fl = desc.flags;
    if fl & SEG_FLG_S == 0 || fl & SEG_FLG_CODE == 0 {
        return Err(Exception::gp((sel & SEL_INDEX_MASK as u16) | ext));
    }
    let code_dpl = desc.dpl();
    if code_dpl > ctx.cpl() {
        return Err(Exception::gp((sel & SEL_INDEX_MASK as u16) | ext));
    }
    if fl & SEG_FLG_P == 0 {
        return Err(Exception::np((sel & SEL_INDEX_MASK as u16) | ext));
    }

    let conforming = fl & SEG_FLG_CONFORMING != 0;
    let target_cpl = if conforming { ctx.cpl() } else { code_dpl };

    let old_eflags = ctx.read_eflags();
    let old_cs = ctx.seg[SEG_CS].sel;
    let old_ss = ctx.seg[SEG_SS].sel;
    let old_esp = ctx.gpr[crate::x86::ESP];

    if target_cpl < ctx.cpl() {
        // Inner-level transfer: pick up the new stack from the TSS
        // and remember the outgoing one on it.
        if ctx.tr.flags & SEG_FLG_P == 0 {
            return Err(Exception::ss_fault(ext));
        }
        let tss_off = 4 + target_cpl * 8;
        if tss_off + 7 > ctx.tr.limit {
            return Err(Exception::ss_fault((ctx.tr.sel & SEL_INDEX_MASK) | ext));
        }
        let stack_slot = ctx.tr.base + tss_off;
        let new_esp = crate::mem::mem_read(ctx, stack_slot, 4, ret_eip, true)?;
        let new_ss =
            crate::mem::mem_read(ctx, stack_slot + 4, 4, ret_eip, true)? as u16;
        if new_ss & !(SEL_RPL_MASK) == 0 {
            return Err(Exception::ss_fault(ext));
        }
        let ss_desc = read_descriptor(ctx, new_ss, ret_eip)?;
        if ss_desc.flags & SEG_FLG_P == 0 {
            return Err(Exception::ss_fault((new_ss & SEL_INDEX_MASK as u16) | ext));
        }

        ctx.write_seg(
            SEG_SS,
            (new_ss & !SEL_RPL_MASK) | target_cpl as u16,
            ss_desc.base,
            ss_desc.limit,
            ss_desc.flags,
        );
        ctx.gpr[crate::x86::ESP] = new_esp;

        if gate32 {
            stack_push32(ctx, old_ss as u32, ret_eip)?;
            stack_push32(ctx, old_esp, ret_eip)?;
        } else {
            stack_push16(ctx, old_ss, ret_eip)?;
            stack_push16(ctx, (old_esp & 0xFFFF) as u16, ret_eip)?;
        }
    }

    if gate32 {
        stack_push32(ctx, old_eflags, ret_eip)?;
        stack_push32(ctx, old_cs as u32, ret_eip)?;
        stack_push32(ctx, ret_eip, ret_eip)?;
        if let Some(code) = exc.error_code {
            stack_push32(ctx, code as u32, ret_eip)?;
        }
    } else {
        stack_push16(ctx, (old_eflags & 0xFFFF) as u16, ret_eip)?;
        stack_push16(ctx, old_cs, ret_eip)?;
        stack_push16(ctx, (ret_eip & 0xFFFF) as u16, ret_eip)?;
        if let Some(code) = exc.error_code {
            stack_push16(ctx, code, ret_eip)?;
        }
    }

    ctx.eflags &= !(TF_MASK | RF_MASK | AC_MASK | NT_MASK);
    if intgate {
        ctx.eflags &= !IF_MASK;
    }

    ctx.write_seg(
        SEG_CS,
        (sel & !SEL_RPL_MASK) | target_cpl as u16,
        desc.base,
        desc.limit,
        desc.flags,
    );
    ctx.eip = if gate32 {
        handler_eip
    } else {
        handler_eip & 0xFFFF
    };
    trace!(
        sel = format_args!("{sel:#06x}"),
        eip = format_args!("{:#010x}", ctx.eip),
        cpl = target_cpl,
        "protected-mode vector"
    );
    Ok(())
}

/// Runtime raise entry point for emitted code. The translator
/// stages `{addr, code, idx, eip}` in the context's `exp_frame`
/// and calls here; control never resumes in the calling block.
///
/// # Safety
/// `ctx` must be the context pointer the block was entered with.
pub unsafe extern "C" fn helper_raise_exception(ctx: *mut CpuContext) {
    let ctx = &mut *ctx;
    let frame = ctx.exp_frame;
    let exc = Exception {
        vector: frame.idx as u8,
        error_code: if frame.idx as u8 == EXP_DB || frame.code == 0xFFFF {
            None
        } else {
            Some(frame.code)
        },
        fault_addr: if frame.idx as u8 == EXP_PF {
            Some(frame.addr)
        } else {
            None
        },
    };
    raise(ctx, exc, frame.eip, EventKind::Fault);
}

/// `INT n` / `INT3` delivery (return EIP is the next instruction).
///
/// # Safety
/// `ctx` must be the context pointer the block was entered with.
pub unsafe extern "C" fn helper_soft_int(
    ctx: *mut CpuContext,
    vector: u32,
    next_eip: u32,
) {
    let ctx = &mut *ctx;
    raise(
        ctx,
        Exception::new(vector as u8),
        next_eip,
        EventKind::SoftInt,
    );
}

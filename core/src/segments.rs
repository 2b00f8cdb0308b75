//! Segment descriptor loads and the protected-mode far-transfer
//! protocol.
//!
//! The translator calls these helpers for far JMP/CALL/RET/IRET and
//! segment-register loads in protected mode; each returns a status
//! byte where non-zero means an exception was already staged and
//! delivered. Real-mode far transfers never come here — the recipes
//! recompute `base = sel << 4` inline.
//!
//! Call gates and task gates through far transfers abort with a
//! typed not-implemented error instead of being approximated.

use crate::context::{CpuContext, SegReg};
use crate::exceptions::{raise, EventKind, Exception, FATAL_TASK_GATE};
use crate::mem::{stack_pop16, stack_pop32, stack_push16, stack_push32};
use crate::x86::*;

/// A parsed 8-byte descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub base: u32,
    pub limit: u32,
    /// Raw high-dword flag bits (type, S, DPL, P, DB, G).
    pub flags: u32,
}

impl Descriptor {
    #[inline]
    pub fn dpl(&self) -> u32 {
        (self.flags & SEG_FLG_DPL_MASK) >> SEG_FLG_DPL_SHIFT
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.flags & SEG_FLG_S != 0 && self.flags & SEG_FLG_CODE != 0
    }

    #[inline]
    pub fn is_data(&self) -> bool {
        self.flags & SEG_FLG_S != 0 && self.flags & SEG_FLG_CODE == 0
    }
}

/// Read and parse the descriptor `sel` names from the GDT or LDT.
pub fn read_descriptor(
    ctx: &mut CpuContext,
    sel: u16,
    eip: u32,
) -> Result<Descriptor, Exception> {
    let ec = sel & SEL_INDEX_MASK;
    let (table_base, table_limit) = if sel & SEL_TI_MASK != 0 {
        (ctx.ldtr.base, ctx.ldtr.limit)
    } else {
        (ctx.gdtr_base, ctx.gdtr_limit)
    };
    let off = (sel & SEL_INDEX_MASK) as u32;
    if off + 7 > table_limit {
        return Err(Exception::gp(ec));
    }
    let lo = crate::mem::mem_read(ctx, table_base + off, 4, eip, true)?;
    let hi = crate::mem::mem_read(ctx, table_base + off + 4, 4, eip, true)?;

    let base = (lo >> 16) | ((hi & 0xFF) << 16) | (hi & 0xFF00_0000);
    let mut limit = (lo & 0xFFFF) | (hi & 0x000F_0000);
    if hi & SEG_FLG_G != 0 {
        limit = (limit << 12) | 0xFFF;
    }
    Ok(Descriptor {
        base,
        limit,
        flags: hi & 0x00F0_FF00,
    })
}

/// Load a code segment for a far jump/call target, with the
/// conforming/non-conforming privilege rules.
fn load_far_code_seg(
    ctx: &mut CpuContext,
    sel: u16,
    eip: u32,
) -> Result<(), Exception> {
    let ec = sel & SEL_INDEX_MASK;
    if sel & !SEL_RPL_MASK == 0 {
        return Err(Exception::gp(0));
    }
    let desc = read_descriptor(ctx, sel, eip)?;
    if desc.flags & SEG_FLG_S == 0 {
        // Gates and TSSs reached through far transfers are outside
        // the modelled subset.
        ctx.fatal = FATAL_TASK_GATE;
        ctx.exp_pending = 1;
        return Ok(());
    }
    if !desc.is_code() {
        return Err(Exception::gp(ec));
    }
    let cpl = ctx.cpl();
    let rpl = (sel & SEL_RPL_MASK) as u32;
    if desc.flags & SEG_FLG_CONFORMING != 0 {
        if desc.dpl() > cpl {
            return Err(Exception::gp(ec));
        }
    } else if rpl > cpl || desc.dpl() != cpl {
        return Err(Exception::gp(ec));
    }
    if desc.flags & SEG_FLG_P == 0 {
        return Err(Exception::np(ec));
    }
    ctx.write_seg(
        SEG_CS,
        (sel & !SEL_RPL_MASK) | cpl as u16,
        desc.base,
        desc.limit,
        desc.flags,
    );
    Ok(())
}

/// The segment-register load rules for MOV sreg / POP sreg / LxS.
fn load_data_seg(
    ctx: &mut CpuContext,
    seg_idx: usize,
    sel: u16,
    eip: u32,
) -> Result<(), Exception> {
    let ec = sel & SEL_INDEX_MASK;
    if seg_idx == SEG_SS {
        if sel & !SEL_RPL_MASK == 0 {
            return Err(Exception::gp(0));
        }
        let desc = read_descriptor(ctx, sel, eip)?;
        let rpl = (sel & SEL_RPL_MASK) as u32;
        if rpl != ctx.cpl()
            || !desc.is_data()
            || desc.flags & SEG_FLG_WRITABLE == 0
            || desc.dpl() != ctx.cpl()
        {
            return Err(Exception::gp(ec));
        }
        if desc.flags & SEG_FLG_P == 0 {
            return Err(Exception::ss_fault(ec));
        }
        ctx.write_seg(SEG_SS, sel, desc.base, desc.limit, desc.flags);
        return Ok(());
    }

    // DS/ES/FS/GS accept the null selector (faults on use, which
    // the modelled subset does not track).
    if sel & !SEL_RPL_MASK == 0 {
        ctx.write_seg(seg_idx, sel, 0, 0, 0);
        return Ok(());
    }
    let desc = read_descriptor(ctx, sel, eip)?;
    let rpl = (sel & SEL_RPL_MASK) as u32;
    let readable_code =
        desc.is_code() && desc.flags & SEG_FLG_READABLE != 0;
    if !(desc.is_data() || readable_code) {
        return Err(Exception::gp(ec));
    }
    // Conforming code ignores the privilege check.
    if desc.is_data() || desc.flags & SEG_FLG_CONFORMING == 0 {
        if rpl > desc.dpl() || ctx.cpl() > desc.dpl() {
            return Err(Exception::gp(ec));
        }
    }
    if desc.flags & SEG_FLG_P == 0 {
        return Err(Exception::np(ec));
    }
    ctx.write_seg(seg_idx, sel, desc.base, desc.limit, desc.flags);
    Ok(())
}

// -- Helpers callable from emitted code (status byte: 0 = ok) --

/// Far JMP in protected mode.
///
/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_ljmp_pe(
    ctx: *mut CpuContext,
    sel: u32,
    new_eip: u32,
    eip: u32,
) -> u8 {
    let ctx = &mut *ctx;
    match load_far_code_seg(ctx, sel as u16, eip) {
        Ok(()) if ctx.exp_pending == 0 => {
            ctx.eip = if ctx.cs32() { new_eip } else { new_eip & 0xFFFF };
            0
        }
        Ok(()) => 1,
        Err(e) => {
            raise(ctx, e, eip, EventKind::Fault);
            1
        }
    }
}

/// Far CALL in protected mode: push the return far pointer, then
/// transfer.
///
/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_lcall_pe(
    ctx: *mut CpuContext,
    sel: u32,
    new_eip: u32,
    next_eip: u32,
    size32: u32,
) -> u8 {
    let ctx = &mut *ctx;
    let old_cs = ctx.seg[SEG_CS].sel;
    let r = (|| -> Result<(), Exception> {
        if size32 != 0 {
            stack_push32(ctx, old_cs as u32, next_eip)?;
            stack_push32(ctx, next_eip, next_eip)?;
        } else {
            stack_push16(ctx, old_cs, next_eip)?;
            stack_push16(ctx, (next_eip & 0xFFFF) as u16, next_eip)?;
        }
        load_far_code_seg(ctx, sel as u16, next_eip)
    })();
    match r {
        Ok(()) if ctx.exp_pending == 0 => {
            ctx.eip = if size32 != 0 { new_eip } else { new_eip & 0xFFFF };
            0
        }
        Ok(()) => 1,
        Err(e) => {
            raise(ctx, e, next_eip, EventKind::Fault);
            1
        }
    }
}

/// Far RET (both modes). `pop_bytes` releases callee arguments.
///
/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_lret(
    ctx: *mut CpuContext,
    pop_bytes: u32,
    size32: u32,
    eip: u32,
) -> u8 {
    let ctx = &mut *ctx;
    let r = (|| -> Result<(), Exception> {
        let (new_eip, sel) = if size32 != 0 {
            let e = stack_pop32(ctx, eip)?;
            let s = stack_pop32(ctx, eip)? as u16;
            (e, s)
        } else {
            let e = stack_pop16(ctx, eip)? as u32;
            let s = stack_pop16(ctx, eip)?;
            (e, s)
        };

        if !ctx.pe_mode() {
            ctx.seg[SEG_CS].sel = sel;
            ctx.seg[SEG_CS].base = (sel as u32) << 4;
            ctx.eip = new_eip;
        } else {
            let rpl = (sel & SEL_RPL_MASK) as u32;
            if rpl < ctx.cpl() {
                return Err(Exception::gp(sel & SEL_INDEX_MASK));
            }
            return_to_outer(ctx, sel, new_eip, rpl, size32 != 0, eip)?;
        }
        let mask = stack_mask32(ctx);
        ctx.gpr[ESP] = (ctx.gpr[ESP] & !mask)
            | (ctx.gpr[ESP].wrapping_add(pop_bytes) & mask);
        Ok(())
    })();
    finish_status(ctx, r, eip)
}

/// IRET (both modes).
///
/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_iret(
    ctx: *mut CpuContext,
    size32: u32,
    eip: u32,
) -> u8 {
    let ctx = &mut *ctx;
    let r = (|| -> Result<(), Exception> {
        let (new_eip, sel, flags) = if size32 != 0 {
            let e = stack_pop32(ctx, eip)?;
            let s = stack_pop32(ctx, eip)? as u16;
            let f = stack_pop32(ctx, eip)?;
            (e, s, f)
        } else {
            let e = stack_pop16(ctx, eip)? as u32;
            let s = stack_pop16(ctx, eip)?;
            let f = stack_pop16(ctx, eip)? as u32;
            (e, s, f)
        };

        if !ctx.pe_mode() {
            ctx.seg[SEG_CS].sel = sel;
            ctx.seg[SEG_CS].base = (sel as u32) << 4;
            ctx.eip = new_eip;
            let mask = if size32 != 0 { 0x0025_7FD5 } else { 0x7FD5 };
            ctx.write_eflags(flags, mask);
            return Ok(());
        }

        if ctx.eflags & NT_MASK != 0 {
            ctx.fatal = FATAL_TASK_GATE;
            ctx.exp_pending = 1;
            return Ok(());
        }
        let rpl = (sel & SEL_RPL_MASK) as u32;
        if rpl < ctx.cpl() {
            return Err(Exception::gp(sel & SEL_INDEX_MASK));
        }
        let old_cpl = ctx.cpl();
        return_to_outer(ctx, sel, new_eip, rpl, size32 != 0, eip)?;

        // EFLAGS restore honours the privilege rules: IOPL changes
        // only at CPL 0, IF only when CPL <= old IOPL.
        let mut mask = 0x0024_7FD5; // everything but IOPL/IF/VM
        if old_cpl == 0 {
            mask |= IOPL_MASK;
        }
        if old_cpl <= (ctx.eflags & IOPL_MASK) >> IOPL_SHIFT {
            mask |= IF_MASK;
        }
        if size32 == 0 {
            mask &= 0xFFFF;
        }
        ctx.write_eflags(flags, mask);
        Ok(())
    })();
    finish_status(ctx, r, eip)
}

/// Shared tail of far returns: load CS at `rpl`, switch stacks when
/// returning to an outer level.
fn return_to_outer(
    ctx: &mut CpuContext,
    sel: u16,
    new_eip: u32,
    rpl: u32,
    size32: bool,
    eip: u32,
) -> Result<(), Exception> {
    let ec = sel & SEL_INDEX_MASK;
    if sel & !SEL_RPL_MASK == 0 {
        return Err(Exception::gp(0));
    }
    let desc = read_descriptor(ctx, sel, eip)?;
    if !desc.is_code() {
        return Err(Exception::gp(ec));
    }
    if desc.flags & SEG_FLG_CONFORMING != 0 {
        if desc.dpl() > rpl {
            return Err(Exception::gp(ec));
        }
    } else if desc.dpl() != rpl {
        return Err(Exception::gp(ec));
    }
    if desc.flags & SEG_FLG_P == 0 {
        return Err(Exception::np(ec));
    }

    let outer = rpl > ctx.cpl();
    let (new_esp, new_ss) = if outer {
        let (esp, ss) = if size32 {
            let esp = stack_pop32(ctx, eip)?;
            let ss = stack_pop32(ctx, eip)? as u16;
            (esp, ss)
        } else {
            let esp = stack_pop16(ctx, eip)? as u32;
            let ss = stack_pop16(ctx, eip)?;
            (esp, ss)
        };
        (Some(esp), Some(ss))
    } else {
        (None, None)
    };

    ctx.write_seg(SEG_CS, sel, desc.base, desc.limit, desc.flags);
    ctx.eip = if size32 { new_eip } else { new_eip & 0xFFFF };

    if let (Some(esp), Some(ss)) = (new_esp, new_ss) {
        load_data_seg(ctx, SEG_SS, ss, eip)?;
        ctx.gpr[ESP] = esp;
    }
    Ok(())
}

/// MOV sreg / POP sreg in protected mode.
///
/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_mov_sel_pe(
    ctx: *mut CpuContext,
    seg_idx: u32,
    sel: u32,
    eip: u32,
) -> u8 {
    let ctx = &mut *ctx;
    let r = load_data_seg(ctx, seg_idx as usize, sel as u16, eip);
    finish_status(ctx, r, eip)
}

fn finish_status(
    ctx: &mut CpuContext,
    r: Result<(), Exception>,
    eip: u32,
) -> u8 {
    match r {
        Ok(()) if ctx.exp_pending == 0 => 0,
        Ok(()) => 1,
        Err(e) => {
            raise(ctx, e, eip, EventKind::Fault);
            1
        }
    }
}

fn stack_mask32(ctx: &CpuContext) -> u32 {
    if ctx.hflags & HFLG_SS32 != 0 {
        0xFFFF_FFFF
    } else {
        0xFFFF
    }
}

/// Build the flat hidden descriptor used when an embedder places
/// the CPU straight into a known protected-mode state.
pub fn flat_seg(sel: u16, code: bool, dpl: u32, db32: bool) -> SegReg {
    let mut flags = SEG_FLG_P | SEG_FLG_S | SEG_FLG_G | (dpl << SEG_FLG_DPL_SHIFT);
    if code {
        flags |= SEG_FLG_CODE | SEG_FLG_READABLE;
    } else {
        flags |= SEG_FLG_WRITABLE;
    }
    if db32 {
        flags |= SEG_FLG_DB;
    }
    SegReg::new(sel, 0, 0xFFFF_FFFF, flags)
}

//! Control and debug register writes.
//!
//! MOV to CR0/CR3/CR4 and MOV to/from DR0..DR7 are rare and
//! semantically heavy, so the translator calls these helpers rather
//! than inlining the logic. A CR0 write that toggles PE invalidates
//! every cached block: the helper records the flush request and the
//! mode-change status makes the block unwind to the dispatcher,
//! which flushes between blocks and re-enters the loop.

use tracing::debug;

use crate::context::CpuContext;
use crate::exceptions::{raise, EventKind, Exception, FATAL_IO_WATCHPOINT};
use crate::mem::page_has_data_watchpoint;
use crate::x86::*;

/// Status values returned to emitted code.
pub const CRN_OK: u8 = 0;
pub const CRN_EXCEPTION: u8 = 1;
/// PE toggled: the TC is gone, unwind to the dispatcher.
pub const CRN_MODE_CHANGE: u8 = 2;

/// MOV to CR0/CR2/CR3/CR4.
///
/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_update_crn(
    ctx: *mut CpuContext,
    new_val: u32,
    idx: u32,
    eip: u32,
    instr_bytes: u32,
) -> u8 {
    let ctx = &mut *ctx;
    match idx {
        0 => {
            // PG without PE and NW without CD are invalid combos.
            if (new_val & CR0_PE_MASK == 0 && new_val & CR0_PG_MASK != 0)
                || (new_val & CR0_CD_MASK == 0 && new_val & CR0_NW_MASK != 0)
            {
                raise(ctx, Exception::gp(0), eip, EventKind::Fault);
                return CRN_EXCEPTION;
            }
            let pe_toggled =
                (ctx.cr0 ^ new_val) & CR0_PE_MASK != 0;
            let pg_toggled =
                (ctx.cr0 ^ new_val) & CR0_PG_MASK != 0;
            ctx.cr0 = (new_val & CR0_FLG_MASK) | CR0_ET_MASK;
            if pg_toggled {
                ctx.tlb_flush(false);
            }
            if pe_toggled {
                debug!(pe = (new_val & CR0_PE_MASK) != 0, "CR0.PE toggled");
                ctx.recompute_hflags();
                // The flush drops the block we are executing; eip
                // must already point past this instruction when the
                // dispatcher re-enters.
                ctx.tc_flush_pending = 1;
                ctx.eip = eip.wrapping_add(instr_bytes);
                return CRN_MODE_CHANGE;
            }
            CRN_OK
        }
        2 => {
            ctx.cr2 = new_val;
            CRN_OK
        }
        3 => {
            ctx.cr3 = new_val & CR3_FLG_MASK;
            ctx.tlb_flush(ctx.cr4 & CR4_PGE_MASK != 0);
            CRN_OK
        }
        4 => {
            let pse_pge_toggled =
                (ctx.cr4 ^ new_val) & (CR4_PSE_MASK | CR4_PGE_MASK) != 0;
            ctx.cr4 = new_val;
            if pse_pge_toggled {
                ctx.tlb_flush(false);
            }
            CRN_OK
        }
        _ => CRN_OK,
    }
}

/// Shared front half of every DR move: DR7.GD turns the access into
/// a #DB with DR6.BD, and CPL must be zero.
fn dr_access_check(ctx: &mut CpuContext, eip: u32) -> Result<(), ()> {
    if ctx.dr[7] & DR7_GD_MASK != 0 {
        ctx.dr[6] |= DR6_BD_MASK | DR6_RES_MASK;
        ctx.dr[7] &= !DR7_GD_MASK;
        raise(ctx, Exception::db(), eip, EventKind::Fault);
        return Err(());
    }
    if ctx.pe_mode() && ctx.cpl() != 0 {
        raise(ctx, Exception::gp(0), eip, EventKind::Fault);
        return Err(());
    }
    Ok(())
}

/// DR4/DR5 alias DR6/DR7 unless CR4.DE turns them into #UD.
fn resolve_dr_alias(ctx: &mut CpuContext, idx: u32, eip: u32) -> Result<u32, ()> {
    if idx == 4 || idx == 5 {
        if ctx.cr4 & CR4_DE_MASK != 0 {
            raise(ctx, Exception::ud(), eip, EventKind::Fault);
            return Err(());
        }
        Ok(idx + 2)
    } else {
        Ok(idx)
    }
}

/// Refresh the WATCH bit of the TLB page holding watchpoint `i`'s
/// old or new address.
fn refresh_watch_page(ctx: &mut CpuContext, linear: u32) {
    let page = linear & !PAGE_MASK;
    let entry = ctx.tlb_entry(page);
    let want = page_has_data_watchpoint(ctx, page);
    let new = if want {
        entry | TLB_WATCH
    } else {
        entry & !TLB_WATCH
    };
    if new != entry {
        ctx.tlb_set_entry(page, new);
    }
}

/// Does DR7 program watchpoint `i` as an I/O breakpoint? Those are
/// deliberately unmodelled.
fn is_io_watchpoint(ctx: &CpuContext, dr7: u32, i: u32) -> bool {
    let kind = (dr7 >> (DR7_TYPE_SHIFT + i * 4)) & 3;
    kind == DR7_TYPE_IO_RW && ctx.cr4 & CR4_DE_MASK != 0
}

/// MOV to DR0..DR7.
///
/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_update_drn(
    ctx: *mut CpuContext,
    val: u32,
    idx: u32,
    eip: u32,
) {
    let ctx = &mut *ctx;
    if dr_access_check(ctx, eip).is_err() {
        return;
    }
    let idx = match resolve_dr_alias(ctx, idx, eip) {
        Ok(i) => i,
        Err(()) => return,
    };

    match idx {
        0..=3 => {
            // The old page stops matching, the new one may start.
            let old = ctx.dr[idx as usize];
            ctx.dr[idx as usize] = val;
            refresh_watch_page(ctx, old);
            refresh_watch_page(ctx, val);
        }
        6 => {
            ctx.dr[6] = val | DR6_RES_MASK;
        }
        7 => {
            for i in 0..4 {
                if is_io_watchpoint(ctx, val, i) {
                    ctx.fatal = FATAL_IO_WATCHPOINT;
                    ctx.exp_pending = 1;
                    return;
                }
            }
            let new = val | DR7_RES_MASK;
            ctx.dr[7] = new;
            // Re-derive WATCH for every programmed address under
            // the new enable/type bits.
            for i in 0..4 {
                let addr = ctx.dr[i];
                refresh_watch_page(ctx, addr);
            }
        }
        _ => unreachable!(),
    }
}

/// MOV from DR0..DR7; the value is returned in the host register,
/// faults surface through `exp_pending`.
///
/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_read_drn(
    ctx: *mut CpuContext,
    idx: u32,
    eip: u32,
) -> u32 {
    let ctx = &mut *ctx;
    if dr_access_check(ctx, eip).is_err() {
        return 0;
    }
    match resolve_dr_alias(ctx, idx, eip) {
        Ok(i) => ctx.dr[i as usize],
        Err(()) => 0,
    }
}

//! Guest memory access path.
//!
//! Every load and store emitted by the translator funnels through
//! the `helper_mem_*` functions below: consult the soft TLB, walk
//! the page tables on a miss, honour data watchpoints before the
//! access commits, split accesses that straddle a page, and finally
//! touch RAM through the cached host pointer or MMIO through the
//! bus callbacks.
//!
//! The helpers are not required to preserve any host register; the
//! generated code re-materializes the context pointer from its
//! stack home slot after each call and tests `exp_pending` to bail
//! out of the block when a helper delivered an exception.

use crate::context::CpuContext;
use crate::exceptions::{raise, EventKind, Exception};
use crate::mmu::{self, Access};
use crate::x86::*;

/// Fill the soft TLB entry for `vaddr` from a walk result.
fn tlb_fill(
    ctx: &mut CpuContext,
    vaddr: u32,
    access: Access,
    cpl: u32,
) -> Result<u32, Exception> {
    let tr = mmu::translate(ctx, vaddr, access, cpl)?;

    let mut entry = (tr.paddr & !PAGE_MASK) | TLB_VALID;
    if tr.writable {
        entry |= TLB_WRITE;
    }
    if tr.user {
        entry |= TLB_USER;
    }
    if tr.global {
        entry |= TLB_GLOBAL;
    }
    if ctx.bus.ram_ptr(tr.paddr & !PAGE_MASK).is_some() {
        entry |= TLB_RAM;
    }
    if page_has_data_watchpoint(ctx, vaddr & !PAGE_MASK) {
        entry |= TLB_WATCH;
    }
    // Keep the sticky bits an earlier mapping may have accumulated.
    let old = ctx.tlb_entry(vaddr);
    entry |= old & (TLB_CODE | TLB_DIRTY);

    ctx.tlb_set_entry(vaddr, entry);
    Ok(entry)
}

/// Does any enabled DR0..DR3 data watchpoint live on this page?
pub fn page_has_data_watchpoint(ctx: &CpuContext, page: u32) -> bool {
    let dr7 = ctx.dr[7];
    for i in 0..4 {
        if (dr7 >> (i * 2)) & 3 == 0 {
            continue;
        }
        let kind = (dr7 >> (DR7_TYPE_SHIFT + i * 4)) & 3;
        if kind != DR7_TYPE_WRITE && kind != DR7_TYPE_DATA_RW {
            continue;
        }
        if ctx.dr[i as usize] & !PAGE_MASK == page {
            return true;
        }
    }
    false
}

/// Check the enabled watchpoints against `[vaddr, vaddr+size)`.
/// On a hit, set the matching DR6.Bn bit and report #DB; the access
/// must not commit.
fn check_watchpoint(
    ctx: &mut CpuContext,
    vaddr: u32,
    size: u32,
    is_write: bool,
) -> Result<(), Exception> {
    let dr7 = ctx.dr[7];
    let mut hit = 0u32;
    for i in 0..4 {
        if (dr7 >> (i * 2)) & 3 == 0 {
            continue;
        }
        let kind = (dr7 >> (DR7_TYPE_SHIFT + i * 4)) & 3;
        let applies = match kind {
            DR7_TYPE_WRITE => is_write,
            DR7_TYPE_DATA_RW => true,
            _ => false,
        };
        if !applies {
            continue;
        }
        let len_bits = (dr7 >> (DR7_TYPE_SHIFT + i * 4 + 2)) & 3;
        let len = match len_bits {
            0 => 1,
            1 => 2,
            3 => 4,
            _ => 2,
        };
        let wp = ctx.dr[i as usize];
        if vaddr < wp.wrapping_add(len) && wp < vaddr.wrapping_add(size) {
            hit |= 1 << i;
        }
    }
    if hit != 0 {
        ctx.dr[6] |= hit | DR6_RES_MASK;
        return Err(Exception::db());
    }
    Ok(())
}

/// Effective privilege of an access: CPL unless the per-context
/// supervisor override is active or the caller forces it.
#[inline]
fn effective_cpl(ctx: &CpuContext, priv_override: bool) -> u32 {
    if priv_override || ctx.hflags & HFLG_CPL_PRIV != 0 {
        0
    } else {
        ctx.cpl()
    }
}

/// Read `size` bytes (1/2/4) at linear `vaddr`.
pub fn mem_read(
    ctx: &mut CpuContext,
    vaddr: u32,
    size: u32,
    eip: u32,
    priv_override: bool,
) -> Result<u32, Exception> {
    // Split accesses that cross a page boundary.
    if (vaddr & PAGE_MASK) + size > PAGE_SIZE {
        let mut val = 0u32;
        for i in 0..size {
            let b = mem_read(ctx, vaddr.wrapping_add(i), 1, eip, priv_override)?;
            val |= b << (8 * i);
        }
        return Ok(val);
    }

    let cpl = effective_cpl(ctx, priv_override);
    let mut entry = ctx.tlb_entry(vaddr);
    if entry & TLB_VALID == 0
        || (cpl == 3 && entry & TLB_USER == 0)
    {
        entry = tlb_fill(ctx, vaddr, Access::Read, cpl)?;
    }
    if entry & TLB_WATCH != 0 {
        check_watchpoint(ctx, vaddr, size, false)?;
    }

    let paddr = (entry & !PAGE_MASK) | (vaddr & PAGE_MASK);
    if entry & TLB_RAM != 0 {
        if let Some(p) = ctx.bus.ram_ptr(paddr) {
            // SAFETY: the bus guarantees the pointer covers this
            // page and the access does not cross it.
            unsafe {
                return Ok(match size {
                    1 => *p as u32,
                    2 => (p as *const u16).read_unaligned() as u32,
                    _ => (p as *const u32).read_unaligned(),
                });
            }
        }
    }
    Ok(match size {
        1 => ctx.bus.mem_read8(paddr) as u32,
        2 => ctx.bus.mem_read16(paddr) as u32,
        _ => ctx.bus.mem_read32(paddr),
    })
}

/// Write `size` bytes (1/2/4) at linear `vaddr`.
pub fn mem_write(
    ctx: &mut CpuContext,
    vaddr: u32,
    val: u32,
    size: u32,
    eip: u32,
    priv_override: bool,
) -> Result<(), Exception> {
    if (vaddr & PAGE_MASK) + size > PAGE_SIZE {
        for i in 0..size {
            mem_write(
                ctx,
                vaddr.wrapping_add(i),
                (val >> (8 * i)) & 0xFF,
                1,
                eip,
                priv_override,
            )?;
        }
        return Ok(());
    }

    let cpl = effective_cpl(ctx, priv_override);
    let mut entry = ctx.tlb_entry(vaddr);
    if entry & TLB_VALID == 0
        || entry & TLB_WRITE == 0
        || (cpl == 3 && entry & TLB_USER == 0)
    {
        entry = tlb_fill(ctx, vaddr, Access::Write, cpl)?;
    }
    if entry & TLB_WATCH != 0 {
        check_watchpoint(ctx, vaddr, size, true)?;
    }

    ctx.tlb_set_entry(vaddr, entry | TLB_DIRTY);

    let paddr = (entry & !PAGE_MASK) | (vaddr & PAGE_MASK);
    if entry & TLB_RAM != 0 {
        if let Some(p) = ctx.bus.ram_ptr(paddr) {
            // SAFETY: see mem_read.
            unsafe {
                match size {
                    1 => *p = val as u8,
                    2 => (p as *mut u16).write_unaligned(val as u16),
                    _ => (p as *mut u32).write_unaligned(val),
                }
            }
            return Ok(());
        }
    }
    match size {
        1 => ctx.bus.mem_write8(paddr, val as u8),
        2 => ctx.bus.mem_write16(paddr, val as u16),
        _ => ctx.bus.mem_write32(paddr, val),
    }
    Ok(())
}

/// Fetch one guest code byte for the translator, marking the page
/// as holding translated code.
pub fn fetch_code_byte(ctx: &mut CpuContext, vaddr: u32) -> Result<u8, Exception> {
    let cpl = ctx.cpl();
    let mut entry = ctx.tlb_entry(vaddr);
    if entry & TLB_VALID == 0 || (cpl == 3 && entry & TLB_USER == 0) {
        entry = tlb_fill(ctx, vaddr, Access::Fetch, cpl)?;
    }
    if entry & TLB_CODE == 0 {
        ctx.tlb_set_entry(vaddr, entry | TLB_CODE);
    }
    let paddr = (entry & !PAGE_MASK) | (vaddr & PAGE_MASK);
    Ok(ctx.bus.mem_read8(paddr))
}

/// Physical address of a linear address for TC keying (fetch
/// access).
pub fn translate_fetch(ctx: &mut CpuContext, vaddr: u32) -> Result<u32, Exception> {
    let cpl = ctx.cpl();
    let entry = ctx.tlb_entry(vaddr);
    if entry & TLB_VALID != 0 && (cpl != 3 || entry & TLB_USER != 0) {
        return Ok((entry & !PAGE_MASK) | (vaddr & PAGE_MASK));
    }
    let entry = tlb_fill(ctx, vaddr, Access::Fetch, cpl)?;
    Ok((entry & !PAGE_MASK) | (vaddr & PAGE_MASK))
}

// -- Stack primitives (used by exception delivery and the far
// transfer helpers) --

fn stack_mask(ctx: &CpuContext) -> u32 {
    if ctx.hflags & HFLG_SS32 != 0 {
        0xFFFF_FFFF
    } else {
        0xFFFF
    }
}

pub fn stack_push32(ctx: &mut CpuContext, val: u32, eip: u32) -> Result<(), Exception> {
    let mask = stack_mask(ctx);
    let sp = ctx.gpr[ESP].wrapping_sub(4) & mask;
    let addr = ctx.seg[SEG_SS].base.wrapping_add(sp);
    mem_write(ctx, addr, val, 4, eip, true)?;
    ctx.gpr[ESP] = (ctx.gpr[ESP] & !mask) | sp;
    Ok(())
}

pub fn stack_push16(ctx: &mut CpuContext, val: u16, eip: u32) -> Result<(), Exception> {
    let mask = stack_mask(ctx);
    let sp = ctx.gpr[ESP].wrapping_sub(2) & mask;
    let addr = ctx.seg[SEG_SS].base.wrapping_add(sp);
    mem_write(ctx, addr, val as u32, 2, eip, true)?;
    ctx.gpr[ESP] = (ctx.gpr[ESP] & !mask) | sp;
    Ok(())
}

pub fn stack_pop32(ctx: &mut CpuContext, eip: u32) -> Result<u32, Exception> {
    let mask = stack_mask(ctx);
    let sp = ctx.gpr[ESP] & mask;
    let addr = ctx.seg[SEG_SS].base.wrapping_add(sp);
    let val = mem_read(ctx, addr, 4, eip, true)?;
    ctx.gpr[ESP] = (ctx.gpr[ESP] & !mask) | (sp.wrapping_add(4) & mask);
    Ok(val)
}

pub fn stack_pop16(ctx: &mut CpuContext, eip: u32) -> Result<u16, Exception> {
    let mask = stack_mask(ctx);
    let sp = ctx.gpr[ESP] & mask;
    let addr = ctx.seg[SEG_SS].base.wrapping_add(sp);
    let val = mem_read(ctx, addr, 2, eip, true)?;
    ctx.gpr[ESP] = (ctx.gpr[ESP] & !mask) | (sp.wrapping_add(2) & mask);
    Ok(val as u16)
}

// -- Helpers callable from emitted code --

macro_rules! mem_read_helper {
    ($name:ident, $size:expr) => {
        /// # Safety
        /// `ctx` must be the live context the block was entered
        /// with.
        pub unsafe extern "C" fn $name(
            ctx: *mut CpuContext,
            vaddr: u32,
            eip: u32,
            priv_override: u32,
        ) -> u32 {
            let ctx = &mut *ctx;
            match mem_read(ctx, vaddr, $size, eip, priv_override != 0) {
                Ok(v) => v,
                Err(e) => {
                    raise(ctx, e, eip, EventKind::Fault);
                    0
                }
            }
        }
    };
}

macro_rules! mem_write_helper {
    ($name:ident, $size:expr) => {
        /// # Safety
        /// `ctx` must be the live context the block was entered
        /// with.
        pub unsafe extern "C" fn $name(
            ctx: *mut CpuContext,
            vaddr: u32,
            val: u32,
            eip: u32,
            priv_override: u32,
        ) {
            let ctx = &mut *ctx;
            if let Err(e) = mem_write(ctx, vaddr, val, $size, eip, priv_override != 0)
            {
                raise(ctx, e, eip, EventKind::Fault);
            }
        }
    };
}

mem_read_helper!(helper_mem_read8, 1);
mem_read_helper!(helper_mem_read16, 2);
mem_read_helper!(helper_mem_read32, 4);
mem_write_helper!(helper_mem_write8, 1);
mem_write_helper!(helper_mem_write16, 2);
mem_write_helper!(helper_mem_write32, 4);

/// Stack push from emitted code (PUSH/CALL).
///
/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_push(
    ctx: *mut CpuContext,
    val: u32,
    size: u32,
    eip: u32,
) {
    let ctx = &mut *ctx;
    let r = if size == 4 {
        stack_push32(ctx, val, eip)
    } else {
        stack_push16(ctx, val as u16, eip)
    };
    if let Err(e) = r {
        raise(ctx, e, eip, EventKind::Fault);
    }
}

/// Stack pop from emitted code (POP/RET). Returns the popped value.
///
/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_pop(
    ctx: *mut CpuContext,
    size: u32,
    eip: u32,
) -> u32 {
    let ctx = &mut *ctx;
    let r = if size == 4 {
        stack_pop32(ctx, eip)
    } else {
        stack_pop16(ctx, eip).map(|v| v as u32)
    };
    match r {
        Ok(v) => v,
        Err(e) => {
            raise(ctx, e, eip, EventKind::Fault);
            0
        }
    }
}

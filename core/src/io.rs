//! Port I/O access path.
//!
//! IN/OUT recipes call `helper_check_io_priv` first when translated
//! in protected mode; real mode skips the check entirely. The
//! access itself goes straight to the bus — ports are never cached.

use crate::context::CpuContext;
use crate::exceptions::{raise, EventKind, Exception};
use crate::mem::mem_read;
use crate::x86::*;

/// TSS offset of the I/O permission bitmap base field.
const TSS_IOMAP_BASE_OFF: u32 = 102;

/// I/O permission check for `size` bytes at `port`.
///
/// In protected mode with CPL above IOPL every accessed port must
/// have a clear bit in the TSS I/O permission bitmap; a set bit or
/// a bitmap that runs past the TSS limit yields #GP(0).
pub fn check_io_priv(
    ctx: &mut CpuContext,
    port: u32,
    size: u32,
    eip: u32,
) -> Result<(), Exception> {
    if !ctx.pe_mode() {
        return Ok(());
    }
    let iopl = (ctx.eflags & IOPL_MASK) >> IOPL_SHIFT;
    if ctx.cpl() <= iopl {
        return Ok(());
    }

    let tr_base = ctx.tr.base;
    if ctx.tr.limit < TSS_IOMAP_BASE_OFF + 1 {
        return Err(Exception::gp(0));
    }
    let iomap_base = mem_read(ctx, tr_base + TSS_IOMAP_BASE_OFF, 2, eip, true)?;
    let byte_off = iomap_base + (port >> 3);
    // The bit test may span two bytes; both must lie inside the TSS.
    if byte_off + 1 > ctx.tr.limit {
        return Err(Exception::gp(0));
    }
    let bits = mem_read(ctx, tr_base + byte_off, 2, eip, true)?;
    let mask = (1u32 << size) - 1;
    if (bits >> (port & 7)) & mask != 0 {
        return Err(Exception::gp(0));
    }
    Ok(())
}

/// # Safety
/// `ctx` must be the live context the block was entered with.
pub unsafe extern "C" fn helper_check_io_priv(
    ctx: *mut CpuContext,
    port: u32,
    size: u32,
    eip: u32,
) {
    let ctx = &mut *ctx;
    if let Err(e) = check_io_priv(ctx, port, size, eip) {
        raise(ctx, e, eip, EventKind::Fault);
    }
}

macro_rules! io_helpers {
    ($read:ident, $write:ident, $bus_read:ident, $bus_write:ident, $ty:ty) => {
        /// # Safety
        /// `ctx` must be the live context the block was entered
        /// with.
        pub unsafe extern "C" fn $read(ctx: *mut CpuContext, port: u32) -> u32 {
            let ctx = &mut *ctx;
            ctx.bus.$bus_read(port as u16) as u32
        }

        /// # Safety
        /// `ctx` must be the live context the block was entered
        /// with.
        pub unsafe extern "C" fn $write(
            ctx: *mut CpuContext,
            port: u32,
            val: u32,
        ) {
            let ctx = &mut *ctx;
            ctx.bus.$bus_write(port as u16, val as $ty);
        }
    };
}

io_helpers!(helper_io_read8, helper_io_write8, io_read8, io_write8, u8);
io_helpers!(helper_io_read16, helper_io_write16, io_read16, io_write16, u16);
io_helpers!(helper_io_read32, helper_io_write32, io_read32, io_write32, u32);

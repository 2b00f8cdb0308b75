//! The dispatcher: translate on miss, run the block, follow the
//! chain.
//!
//! Control flow at run time: the dispatcher native-calls a block's
//! entry; the block executes and either tail-calls into a chained
//! successor or returns through an epilogue trampoline carrying
//! the address of whichever block it left from (null after an
//! exception or mode change). The dispatcher then links eligible
//! `(prev, next)` pairs and loops.

use std::sync::atomic::Ordering;

use tracing::trace;

use dbt86_core::context::{CpuConfig, CpuContext};
use dbt86_core::exceptions::{
    self, EventKind, Exception, FATAL_IO_WATCHPOINT, FATAL_TASK_GATE,
    FATAL_TRIPLE_FAULT,
};
use dbt86_core::mem::translate_fetch;
use dbt86_core::tb::{TbKey, TranslatedBlock, TB_JMP_RET};
use dbt86_core::x86::{IF_MASK, SEG_CS};
use dbt86_core::{Bus, CpuError};
use dbt86_frontend::{translate, RuntimeHooks};

use crate::tc::{build_block, TranslationCache};

/// Why `Cpu::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The guest executed HLT; run again after raising an
    /// interrupt.
    Halt,
}

/// Signature of a translated block's host entry point.
type BlockFn = unsafe extern "C" fn(*mut CpuContext) -> u64;

/// One emulated CPU: architectural state plus its translation
/// cache.
pub struct Cpu {
    ctx: Box<CpuContext>,
    tc: Box<TranslationCache>,
    /// Guards TC flushes: they are only legal while no block is
    /// on the host stack.
    run_depth: u32,
}

impl Cpu {
    pub fn new(config: CpuConfig, bus: Box<dyn Bus>) -> Self {
        let cache_max = config.code_cache_max;
        let mut ctx = CpuContext::new(config, bus);
        let mut tc = Box::new(TranslationCache::new(cache_max));
        ctx.tc_ptr = tc.as_mut() as *mut TranslationCache as *mut _;
        Self {
            ctx,
            tc,
            run_depth: 0,
        }
    }

    pub fn context(&self) -> &CpuContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut CpuContext {
        &mut self.ctx
    }

    pub fn cache_stats(&self) -> &crate::tc::TcStats {
        &self.tc.stats
    }

    /// Request an external interrupt; it is taken at the next
    /// block edge (or immediately if the CPU is halted).
    pub fn raise_external_interrupt(&mut self, vector: u8) {
        self.ctx.int_vector = vector;
        self.ctx.int_pending = 1;
    }

    /// Drop every translated block on the given guest physical
    /// page (embedder-visible writes to guest code, DMA).
    pub fn invalidate_page(&mut self, ppn: u32) {
        debug_assert_eq!(self.run_depth, 0);
        self.tc.invalidate_phys_page(ppn);
    }

    /// The main loop. Returns when the guest halts or a fatal
    /// host-visible error occurs.
    pub fn run(&mut self) -> Result<ExitReason, CpuError> {
        let hooks = RuntimeHooks {
            lookup_indirect: helper_lookup_indirect as usize as u64,
        };
        let mut prev: Option<TbKey> = None;

        loop {
            let ctx = &mut *self.ctx;
            ctx.exp_pending = 0;

            if ctx.fatal != 0 {
                return Err(map_fatal(ctx.fatal));
            }
            if ctx.tc_flush_pending != 0 {
                // Deferred from a CR0.PE toggle inside a block;
                // run_depth is zero here so the flush is safe.
                debug_assert_eq!(self.run_depth, 0);
                self.tc.flush_all();
                ctx.tc_flush_pending = 0;
                prev = None;
                continue;
            }

            // Pending external interrupts are sampled between
            // blocks; a halted CPU wakes up for them.
            if ctx.int_pending != 0 && ctx.eflags & IF_MASK != 0 {
                let vector = ctx.int_vector;
                let ret_eip = ctx.eip;
                ctx.int_pending = 0;
                ctx.halted = 0;
                exceptions::raise(
                    ctx,
                    Exception::new(vector),
                    ret_eip,
                    EventKind::External,
                );
                ctx.exp_pending = 0;
                prev = None;
                if ctx.fatal != 0 {
                    return Err(map_fatal(ctx.fatal));
                }
            }
            if ctx.halted != 0 {
                return Ok(ExitReason::Halt);
            }

            // Physical PC for the cache key; a fetch-time page
            // fault vectors to the guest and restarts the loop.
            let linear = ctx.linear_pc();
            let phys = match translate_fetch(ctx, linear) {
                Ok(p) => p,
                Err(e) => {
                    let ret_eip = ctx.eip;
                    exceptions::raise(ctx, e, ret_eip, EventKind::Fault);
                    ctx.exp_pending = 0;
                    prev = None;
                    continue;
                }
            };
            let key = TbKey {
                phys_pc: phys,
                cs_base: ctx.seg[SEG_CS].base,
                flags: ctx.mode_fingerprint(),
            };

            if self.tc.lookup(&key).is_none() {
                let mut tb =
                    TranslatedBlock::new(phys, key.cs_base, key.flags, ctx.eip);
                let code = translate(ctx, &tb, hooks)?;
                tb.size = code.guest_size;
                tb.icount = code.icount;
                trace!(
                    pc = format_args!("{phys:#010x}"),
                    icount = code.icount,
                    page_cross = code.page_cross,
                    "translated block"
                );

                if code.page_cross {
                    // Runs once, never cached, never linked.
                    let block = build_block(&tb, &code)?;
                    let entry = tb.host_entry.load(Ordering::Relaxed);
                    self.exec(entry);
                    drop(block);
                    prev = None;
                    continue;
                }

                if self.tc.is_full() {
                    self.tc.flush_all();
                    prev = None;
                }
                self.tc.install(tb, &code)?;
            }

            if let Some(prev_key) = prev {
                self.tc.try_link(prev_key, key);
            }

            let entry = {
                let tb = self.tc.lookup(&key).expect("block just installed");
                tb.host_entry.load(Ordering::Relaxed)
            };
            let ret = self.exec(entry);

            if self.ctx.fatal != 0 {
                return Err(map_fatal(self.ctx.fatal));
            }

            prev = if ret == 0 {
                None
            } else {
                // The trampoline hands back whichever block was
                // left; its pointer stays valid until the next
                // flush, which only happens inside this loop.
                let tb = unsafe { &*(ret as *const TranslatedBlock) };
                if tb.exit_kind() == TB_JMP_RET {
                    None
                } else {
                    Some(tb.key())
                }
            };
        }
    }

    /// Native-call a block.
    fn exec(&mut self, entry: u64) -> u64 {
        self.run_depth += 1;
        // SAFETY: `entry` points at code this cache installed and
        // sealed R+X; the block's ABI takes the context pointer
        // and returns a TranslatedBlock pointer or null.
        let ret = unsafe {
            let f: BlockFn = std::mem::transmute(entry as usize);
            f(self.ctx.as_mut() as *mut CpuContext)
        };
        self.run_depth -= 1;
        ret
    }
}

fn map_fatal(code: u8) -> CpuError {
    match code {
        FATAL_TASK_GATE => CpuError::NotImplemented("task gates"),
        FATAL_IO_WATCHPOINT => CpuError::NotImplemented("I/O watchpoints"),
        FATAL_TRIPLE_FAULT => CpuError::Internal("guest triple fault"),
        _ => CpuError::Internal("unknown fatal code"),
    }
}

/// Runtime half of the indirect link: called from a block's tail
/// with the architectural state already advanced to the transfer
/// target. Looks the successor up in the cache and returns its
/// host entry, or null to fall back to the dispatcher.
///
/// # Safety
/// Called only from generated code with the live context pointer;
/// `ctx.tc_ptr` points at the cache owned by the running `Cpu`.
pub unsafe extern "C" fn helper_lookup_indirect(
    ctx: *mut CpuContext,
    _from: *const TranslatedBlock,
) -> u64 {
    let ctx = &mut *ctx;
    let tc = &mut *(ctx.tc_ptr as *mut TranslationCache);

    let linear = ctx.linear_pc();
    let phys = match translate_fetch(ctx, linear) {
        Ok(p) => p,
        // Let the dispatcher take the fault on its own fetch.
        Err(_) => return 0,
    };
    let key = TbKey {
        phys_pc: phys,
        cs_base: ctx.seg[SEG_CS].base,
        flags: ctx.mode_fingerprint(),
    };
    match tc.lookup(&key) {
        Some(tb) => tb.host_entry.load(Ordering::Relaxed),
        None => 0,
    }
}

//! Block-tail emission: staged raises, the single-step and
//! interrupt checkpoints, and the direct/indirect link stubs.
//!
//! Every exit leaves a well-defined value in RAX: the block's own
//! address for exits the dispatcher may act on (chaining, HLT), or
//! null after an exception / mode change so the dispatcher drops
//! its chain bookkeeping and restarts from the architectural
//! state.

use dbt86_backend::{Alu, Cc, Mem, Reg, Width};
use dbt86_core::context::{
    off_dr, off_eflags, off_eip, off_exp_addr, off_exp_code, off_exp_eip,
    off_exp_idx, off_int_pending,
};
use dbt86_core::exceptions::helper_raise_exception;
use dbt86_core::tb::*;
use dbt86_core::x86::*;
use dbt86_core::Exception;

use super::DisasCtx;

impl<'a> DisasCtx<'a> {
    /// Stage `{addr, code, idx, eip}` into the exception frame and
    /// invoke the raise helper; the block then returns null to the
    /// dispatcher. `code == 0xFFFF` marks "no error code".
    pub fn gen_raise(&mut self, addr: u32, code: u16, vector: u8, eip: u32) {
        self.e.mov_mi(Width::B32, Mem::ctx(off_exp_addr()), addr);
        self.e
            .mov_mi(Width::B16, Mem::ctx(off_exp_code()), code as u32);
        self.e
            .mov_mi(Width::B16, Mem::ctx(off_exp_idx()), vector as u32);
        self.e.mov_mi(Width::B32, Mem::ctx(off_exp_eip()), eip);
        self.e.call_abs(helper_raise_exception as usize as u64);
        self.gen_exit_null();
    }

    /// Terminal raise: the recipe's only outcome is this fault.
    pub fn gen_raise_block(&mut self, code: u16, vector: u8) {
        let eip = self.instr.eip;
        self.gen_raise(0, code, vector, eip);
        self.translate_next = false;
    }

    /// First-instruction fetch fault: the whole block is the #PF
    /// delivery.
    pub fn gen_fetch_fault(&mut self, exc: &Exception, eip: u32) {
        self.gen_raise(
            exc.fault_addr.unwrap_or(0),
            exc.error_code.unwrap_or(0),
            exc.vector,
            eip,
        );
    }

    /// Return to the dispatcher with a null block pointer.
    pub fn gen_exit_null(&mut self) {
        self.e.mov_ri32(Reg::Rax, 0);
        self.e.gen_epilogue_ret();
        self.needs_epilogue = false;
    }

    /// Return to the dispatcher carrying this block, recording the
    /// runtime exit kind as "no linkable edge".
    pub fn gen_exit_self(&mut self) {
        let flags_ptr = self.tb.flags_ptr();
        self.e.mov_ri64(Reg::Rdx, flags_ptr);
        self.e.mov_rm(Width::B32, Reg::Rax, Mem::base(Reg::Rdx));
        self.e
            .alu_ri(Alu::And, Width::B32, Reg::Rax, !TB_FLG_JMP_KIND_MASK);
        self.e.alu_ri(Alu::Or, Width::B32, Reg::Rax, TB_JMP_RET);
        self.e.mov_mr(Width::B32, Mem::base(Reg::Rdx), Reg::Rax);
        self.e.mov_ri64(
            Reg::Rax,
            self.tb as *const dbt86_core::TranslatedBlock as u64,
        );
        self.e.gen_epilogue_ret();
        self.needs_epilogue = false;
    }

    /// RF/TF/single-step checkpoint, evaluated against the
    /// translate-time EFLAGS snapshot (part of the fingerprint).
    /// Returns true when the block ends here with a #DB.
    pub fn gen_check_rf_single_step(&mut self) -> bool {
        if self.eflags_tf_rf == 0 && !self.single_step {
            return false;
        }

        if self.eflags_tf_rf & RF_MASK != 0 {
            // RF suppresses instruction breakpoints for one
            // instruction and must be cleared at runtime, after
            // the fact.
            self.e
                .mov_rm(Width::B32, Reg::Rdx, Mem::ctx(off_eflags()));
            self.e
                .alu_ri(Alu::And, Width::B32, Reg::Rdx, !RF_MASK);
            self.e
                .mov_mr(Width::B32, Mem::ctx(off_eflags()), Reg::Rdx);
        }

        if self.eflags_tf_rf & TF_MASK != 0 || self.single_step {
            self.e.mov_rm(Width::B32, Reg::Rdx, Mem::ctx(off_dr(6)));
            self.e
                .alu_ri(Alu::Or, Width::B32, Reg::Rdx, DR6_BS_MASK);
            self.e.mov_mr(Width::B32, Mem::ctx(off_dr(6)), Reg::Rdx);
            // #DB with the runtime EIP (already updated by the
            // terminating recipe).
            self.e.mov_rm(Width::B32, Reg::Rdx, Mem::ctx(off_eip()));
            self.e
                .mov_mr(Width::B32, Mem::ctx(off_exp_eip()), Reg::Rdx);
            self.e.mov_mi(Width::B32, Mem::ctx(off_exp_addr()), 0);
            self.e.mov_mi(Width::B16, Mem::ctx(off_exp_code()), 0xFFFF);
            self.e
                .mov_mi(Width::B16, Mem::ctx(off_exp_idx()), EXP_DB as u32);
            self.e.call_abs(helper_raise_exception as usize as u64);
            self.gen_exit_null();
            return true;
        }
        false
    }

    /// Interrupt checkpoint: a pending interrupt leaves through
    /// chain slot 2, which always routes to the dispatcher.
    pub fn gen_check_int(&mut self) {
        let skip = self.e.new_label();
        self.e.alu_mi(Alu::Cmp, Width::B8, Mem::ctx(off_int_pending()), 0);
        self.e.jcc(Cc::E, skip);
        self.e
            .mov_ri64(Reg::Rax, self.tb.jmp_slot_ptr(TB_JMP_INT_SLOT));
        self.e.mov_rm(Width::B64, Reg::Rax, Mem::base(Reg::Rax));
        self.e.gen_tail_call(Reg::Rax);
        self.e.bind(skip);
    }

    /// Record the runtime exit kind and leave through chain slot
    /// `slot`.
    fn gen_take_slot(&mut self, kind: u32, slot: usize) {
        let flags_ptr = self.tb.flags_ptr();
        self.e.mov_ri64(Reg::Rdx, flags_ptr);
        self.e.mov_rm(Width::B32, Reg::Rax, Mem::base(Reg::Rdx));
        self.e
            .alu_ri(Alu::And, Width::B32, Reg::Rax, !TB_FLG_JMP_KIND_MASK);
        if kind != 0 {
            self.e.alu_ri(Alu::Or, Width::B32, Reg::Rax, kind);
        }
        self.e.mov_mr(Width::B32, Mem::base(Reg::Rdx), Reg::Rax);
        self.e.mov_ri64(Reg::Rdx, self.tb.jmp_slot_ptr(slot));
        self.e.mov_rm(Width::B64, Reg::Rax, Mem::base(Reg::Rdx));
        self.e.gen_tail_call(Reg::Rax);
    }

    /// Direct-link tail. `dst_pc` is the linear branch target,
    /// `next_pc` the linear fall-through (None for unconditional
    /// transfers), and `runtime` names the register carrying the
    /// runtime linear target when the destination is chosen at run
    /// time (the guard compares it against the compile-time
    /// predictions and routes mismatches to the return path).
    pub fn gen_link_direct(
        &mut self,
        dst_pc: u32,
        next_pc: Option<u32>,
        runtime: Option<Reg>,
    ) {
        self.tb.or_flags(TB_FLG_DIRECT);
        if self.gen_check_rf_single_step() {
            return;
        }
        self.gen_check_int();

        let page = self.instr_page();
        let dst_on_page = dst_pc & !PAGE_MASK == page;
        let next_on_page =
            next_pc.is_some_and(|pc| pc & !PAGE_MASK == page);
        let num_jmp =
            dst_on_page as u32 + next_on_page as u32;
        self.tb.or_flags(num_jmp & TB_FLG_NUM_JMP_MASK);

        if num_jmp == 0 {
            self.gen_exit_self();
            return;
        }

        match runtime {
            None => {
                // Target known at compile time: a single
                // unconditional edge through slot 0.
                self.gen_take_slot(TB_JMP_DST, 0);
            }
            Some(r) => {
                debug_assert!(matches!(r, Reg::R9));
                if dst_on_page {
                    let miss = self.e.new_label();
                    self.e.mov_ri32(Reg::R11, dst_pc);
                    self.e.alu_rr(Alu::Cmp, Width::B32, Reg::R9, Reg::R11);
                    self.e.jcc(Cc::Ne, miss);
                    self.gen_take_slot(TB_JMP_DST, 0);
                    self.e.bind(miss);
                }
                if let (true, Some(next)) = (next_on_page, next_pc) {
                    let miss = self.e.new_label();
                    self.e.mov_ri32(Reg::R11, next);
                    self.e.alu_rr(Alu::Cmp, Width::B32, Reg::R9, Reg::R11);
                    self.e.jcc(Cc::Ne, miss);
                    self.gen_take_slot(TB_JMP_NEXT_PC, 1);
                    self.e.bind(miss);
                }
                self.gen_exit_self();
            }
        }
        self.needs_epilogue = false;
    }

    /// Single-destination tail for non-jump terminators (mode or
    /// debug state changed, execution simply continues at the next
    /// instruction).
    pub fn gen_link_dst_only(&mut self) {
        self.tb.or_flags(TB_FLG_DST_ONLY);
        if self.gen_check_rf_single_step() {
            return;
        }
        self.gen_check_int();

        let next_pc = self
            .cs_base
            .wrapping_add(self.instr.next_eip());
        if next_pc & !PAGE_MASK == self.instr_page() {
            self.tb.or_flags(1);
            self.gen_take_slot(TB_JMP_DST, 0);
            self.needs_epilogue = false;
        } else {
            self.gen_exit_self();
        }
    }

    /// Indirect tail: runtime TC lookup, tail-call the result or
    /// return to the dispatcher.
    pub fn gen_link_indirect(&mut self) {
        self.tb.or_flags(TB_FLG_INDIRECT);
        if self.gen_check_rf_single_step() {
            return;
        }
        self.gen_check_int();

        self.e.mov_ri64(
            Reg::Rsi,
            self.tb as *const dbt86_core::TranslatedBlock as u64,
        );
        self.e.call_abs(self.hooks.lookup_indirect);
        // A null result means no cached successor. The successor's
        // prologue snapshots RDI, so the context register must be
        // live again before the tail transfer.
        let hit = self.e.new_label();
        self.e.mov_rr(Width::B64, Reg::R11, Reg::Rax);
        self.e.reload_ctx();
        self.e.test_rr(Width::B64, Reg::R11, Reg::R11);
        self.e.jcc(Cc::Ne, hit);
        self.gen_exit_self();
        self.e.bind(hit);
        self.e.gen_tail_call(Reg::R11);
        self.needs_epilogue = false;
    }

    /// Tail for blocks that stop without a control transfer (page
    /// crossing, instruction cap, mid-block fetch fault). Not
    /// linkable; interrupts are sampled by the dispatcher on
    /// re-entry.
    pub fn gen_tail_no_link(&mut self) {
        if self.gen_check_rf_single_step() {
            return;
        }
        self.gen_exit_null();
    }
}

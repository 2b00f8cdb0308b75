//! System-instruction recipes: control/debug register moves,
//! segment loads, descriptor-table loads, port I/O and the EFLAGS
//! bit instructions.

use dbt86_backend::{Alu, Mem, Reg, Shift, Width};
use dbt86_core::context::{
    off_cr, off_eflags, off_gdtr_base, off_gdtr_limit, off_gpr, off_idtr_base,
    off_idtr_limit, off_lazy_aux, off_seg_base, off_seg_sel,
};
use dbt86_core::insn::{GprRef, Opcode, Operand, OperandSize};
use dbt86_core::io::{
    helper_check_io_priv, helper_io_read16, helper_io_read32, helper_io_read8,
    helper_io_write16, helper_io_write32, helper_io_write8,
};
use dbt86_core::segments::helper_mov_sel_pe;
use dbt86_core::sysregs::{helper_read_drn, helper_update_crn, helper_update_drn};
use dbt86_core::x86::*;
use dbt86_core::CpuError;

use super::DisasCtx;

impl<'a> DisasCtx<'a> {
    /// CLI/STI: the IOPL gate is evaluated at translate time (the
    /// privilege inputs are part of the fingerprint).
    pub(super) fn gen_cli_sti(&mut self) -> Result<(), CpuError> {
        if self.pe_mode && self.iopl < self.cpl {
            self.gen_raise_block(0, EXP_GP);
            return Ok(());
        }
        self.e
            .mov_rm(Width::B32, Reg::Rdx, Mem::ctx(off_eflags()));
        if self.instr.opcode == Opcode::Cli {
            self.e
                .alu_ri(Alu::And, Width::B32, Reg::Rdx, !IF_MASK);
        } else {
            self.e.alu_ri(Alu::Or, Width::B32, Reg::Rdx, IF_MASK);
        }
        self.e
            .mov_mr(Width::B32, Mem::ctx(off_eflags()), Reg::Rdx);
        Ok(())
    }

    /// CLC/STC/CMC operate on the aux word: CF is bit 31 and the
    /// OF source is bit 30, so OF must be re-encoded when CF
    /// changes. CMC collapses to flipping both bits.
    pub(super) fn gen_carry_ops(&mut self) -> Result<(), CpuError> {
        match self.instr.opcode {
            Opcode::Cmc => {
                self.e
                    .mov_rm(Width::B32, Reg::Rax, Mem::ctx(off_lazy_aux()));
                self.e
                    .alu_ri(Alu::Xor, Width::B32, Reg::Rax, 0xC000_0000);
                self.e
                    .mov_mr(Width::B32, Mem::ctx(off_lazy_aux()), Reg::Rax);
            }
            clc_stc => {
                // edx = OF at bit 30 (preserved), then rebuild the
                // carry bits.
                self.e
                    .mov_rm(Width::B32, Reg::Rax, Mem::ctx(off_lazy_aux()));
                self.e.lea(
                    Width::B32,
                    Reg::Rdx,
                    Mem::base_index(Reg::Rax, Reg::Rax, 0),
                );
                self.e.alu_rr(Alu::Xor, Width::B32, Reg::Rdx, Reg::Rax);
                self.e
                    .alu_ri(Alu::And, Width::B32, Reg::Rdx, 0x8000_0000);
                self.e.shift_ri(Shift::Shr, Width::B32, Reg::Rdx, 1);
                self.e
                    .alu_ri(Alu::And, Width::B32, Reg::Rax, 0x3FFF_FFFF);
                if clc_stc == Opcode::Stc {
                    // CF set: bit 31 on, bit 30 = OF ^ 1.
                    self.e
                        .alu_ri(Alu::Xor, Width::B32, Reg::Rdx, 0x4000_0000);
                    self.e
                        .alu_ri(Alu::Or, Width::B32, Reg::Rdx, 0x8000_0000);
                }
                self.e.alu_rr(Alu::Or, Width::B32, Reg::Rax, Reg::Rdx);
                self.e
                    .mov_mr(Width::B32, Mem::ctx(off_lazy_aux()), Reg::Rax);
            }
        }
        Ok(())
    }

    /// CLD/STD: DF lives directly in EFLAGS.
    pub(super) fn gen_direction(&mut self) -> Result<(), CpuError> {
        self.e
            .mov_rm(Width::B32, Reg::Rdx, Mem::ctx(off_eflags()));
        if self.instr.opcode == Opcode::Cld {
            self.e
                .alu_ri(Alu::And, Width::B32, Reg::Rdx, !DF_MASK);
        } else {
            self.e.alu_ri(Alu::Or, Width::B32, Reg::Rdx, DF_MASK);
        }
        self.e
            .mov_mr(Width::B32, Mem::ctx(off_eflags()), Reg::Rdx);
        Ok(())
    }

    /// IN/OUT. Protected mode runs the TSS bitmap check in its
    /// helper first; real mode skips it entirely.
    pub(super) fn gen_in_out(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let eip = self.instr.eip;
        let is_in = self.instr.opcode == Opcode::In;
        let dx_port = self.instr.imm < 0;

        let load_port = |dc: &mut Self, dst: Reg| {
            if dx_port {
                dc.e.movzx_rm(
                    Width::B32,
                    dst,
                    Width::B16,
                    Mem::ctx(off_gpr(EDX)),
                );
            } else {
                dc.e.mov_ri32(dst, dc.instr.imm as u32 & 0xFF);
            }
        };

        if self.pe_mode {
            load_port(self, Reg::Rsi);
            self.e.mov_ri32(Reg::Rdx, size.bytes());
            self.e.mov_ri32(Reg::Rcx, eip);
            self.e.call_abs(helper_check_io_priv as usize as u64);
            self.gen_exp_check();
        }

        load_port(self, Reg::Rsi);
        if is_in {
            let helper = match size {
                OperandSize::S8 => helper_io_read8 as usize as u64,
                OperandSize::S16 => helper_io_read16 as usize as u64,
                OperandSize::S32 => helper_io_read32 as usize as u64,
            };
            self.e.call_abs(helper);
            self.e.reload_ctx();
            self.gen_st_gpr(GprRef::new(EAX), size, Reg::Rax);
        } else {
            self.gen_ld_gpr(Reg::Rdx, GprRef::new(EAX), size);
            let helper = match size {
                OperandSize::S8 => helper_io_write8 as usize as u64,
                OperandSize::S16 => helper_io_write16 as usize as u64,
                OperandSize::S32 => helper_io_write32 as usize as u64,
            };
            self.e.call_abs(helper);
            self.e.reload_ctx();
        }
        Ok(())
    }

    /// MOV sreg, r/m16 and MOV r/m16, sreg.
    pub(super) fn gen_mov_seg(&mut self) -> Result<(), CpuError> {
        let eip = self.instr.eip;
        match self.instr.operands {
            // Load into a segment register.
            [Operand::Seg(idx), src] => {
                if idx == SEG_CS {
                    self.gen_raise_block(0xFFFF, EXP_UD);
                    return Ok(());
                }
                self.gen_load_operand(src, OperandSize::S16);
                if self.pe_mode {
                    self.e.mov_ri32(Reg::Rsi, idx as u32);
                    self.e.mov_rr(Width::B32, Reg::Rdx, Reg::Rax);
                    self.e.mov_ri32(Reg::Rcx, eip);
                    self.e.call_abs(helper_mov_sel_pe as usize as u64);
                    self.gen_exp_check();
                    // The hidden flags feed the fingerprint; stop
                    // the block so the next one retranslates under
                    // the new mode bits.
                    self.gen_store_eip(self.instr.next_eip());
                    self.gen_link_dst_only();
                    self.translate_next = false;
                } else {
                    self.e
                        .mov_mr(Width::B16, Mem::ctx(off_seg_sel(idx)), Reg::Rax);
                    self.e.shift_ri(Shift::Shl, Width::B32, Reg::Rax, 4);
                    self.e
                        .mov_mr(Width::B32, Mem::ctx(off_seg_base(idx)), Reg::Rax);
                }
            }
            // Store a segment selector.
            [dst, Operand::Seg(idx)] => {
                self.gen_ld_sel(Reg::Rax, idx);
                self.gen_store_operand(dst, OperandSize::S16, false);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// MOV to/from CR0..CR4.
    pub(super) fn gen_mov_cr(&mut self) -> Result<(), CpuError> {
        let eip = self.instr.eip;
        if self.pe_mode && self.cpl != 0 {
            self.gen_raise_block(0, EXP_GP);
            return Ok(());
        }
        match self.instr.operands {
            [Operand::Cr(idx), Operand::Gpr(g)] => {
                // CR writes go through the helper: CR0 PE toggles
                // invalidate the cache and unwind, CR3 reloads the
                // TLB.
                if idx == 0 {
                    // EIP must name the next instruction before
                    // the helper can request a mode-change unwind.
                    self.gen_store_eip(self.instr.next_eip());
                }
                self.gen_ld_gpr(Reg::Rsi, g, OperandSize::S32);
                self.e.mov_ri32(Reg::Rdx, idx as u32);
                self.e.mov_ri32(Reg::Rcx, eip);
                self.e.mov_ri32(Reg::R8, self.instr.len);
                self.e.call_abs(helper_update_crn as usize as u64);
                self.e.reload_ctx();
                // Non-zero status: exception already delivered or
                // the translation cache is gone; either way the
                // block cannot continue.
                let ok = self.e.new_label();
                self.e.test_rr(Width::B8, Reg::Rax, Reg::Rax);
                self.e.jcc(dbt86_backend::Cc::E, ok);
                self.gen_exit_null();
                self.e.bind(ok);
                if idx == 0 {
                    self.gen_link_dst_only();
                    self.translate_next = false;
                }
            }
            [Operand::Gpr(g), Operand::Cr(idx)] => {
                self.e
                    .mov_rm(Width::B32, Reg::Rax, Mem::ctx(off_cr(idx)));
                self.gen_st_gpr(g, OperandSize::S32, Reg::Rax);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// MOV to/from DR0..DR7. The helper owns the DR7.GD check, the
    /// privilege check, the DR4/DR5 aliasing and the soft-TLB
    /// WATCH maintenance.
    pub(super) fn gen_mov_dr(&mut self) -> Result<(), CpuError> {
        let eip = self.instr.eip;
        match self.instr.operands {
            [Operand::Dr(idx), Operand::Gpr(g)] => {
                self.gen_ld_gpr(Reg::Rsi, g, OperandSize::S32);
                self.e.mov_ri32(Reg::Rdx, idx as u32);
                self.e.mov_ri32(Reg::Rcx, eip);
                self.e.call_abs(helper_update_drn as usize as u64);
                self.gen_exp_check();
                // Watchpoint state changed: end the block so later
                // code observes the new TLB WATCH bits.
                self.gen_store_eip(self.instr.next_eip());
                self.gen_link_dst_only();
                self.translate_next = false;
            }
            [Operand::Gpr(g), Operand::Dr(idx)] => {
                self.e.mov_ri32(Reg::Rsi, idx as u32);
                self.e.mov_ri32(Reg::Rdx, eip);
                self.e.call_abs(helper_read_drn as usize as u64);
                self.gen_exp_check();
                self.gen_st_gpr(g, OperandSize::S32, Reg::Rax);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// LGDT/LIDT m16&32.
    pub(super) fn gen_lgdt_lidt(&mut self) -> Result<(), CpuError> {
        if self.pe_mode && self.cpl != 0 {
            self.gen_raise_block(0, EXP_GP);
            return Ok(());
        }
        let is_idt = self.instr.opcode == Opcode::Lidt;
        let (base_off, limit_off) = if is_idt {
            (off_idtr_base(), off_idtr_limit())
        } else {
            (off_gdtr_base(), off_gdtr_limit())
        };

        self.gen_ea(true);
        self.e.mov_rr(Width::B32, Reg::Rbx, Reg::Rdx);
        // Limit word first, then the (possibly 24-bit) base; both
        // reads fault before anything is written back.
        self.gen_mem_read(OperandSize::S16);
        self.e
            .mov_mr(Width::B32, Mem::frame(dbt86_backend::regs::local_off(0)), Reg::Rax);
        self.e.lea(Width::B32, Reg::Rdx, Mem::base_disp(Reg::Rbx, 2));
        self.gen_mem_read(OperandSize::S32);
        if self.size() == OperandSize::S16 {
            self.e
                .alu_ri(Alu::And, Width::B32, Reg::Rax, 0x00FF_FFFF);
        }
        self.e.mov_mr(Width::B32, Mem::ctx(base_off), Reg::Rax);
        self.e
            .mov_rm(Width::B32, Reg::Rax, Mem::frame(dbt86_backend::regs::local_off(0)));
        self.e.mov_mr(Width::B32, Mem::ctx(limit_off), Reg::Rax);
        Ok(())
    }
}

//! Control-transfer recipes. Every recipe here terminates the
//! block and hands off to one of the tail/link emitters.

use dbt86_backend::{Alu, Cc, Mem, Reg, Width};
use dbt86_core::context::{off_eip, off_gpr, off_seg_base, off_seg_sel};
use dbt86_core::insn::{Opcode, Operand, OperandSize};
use dbt86_core::mem::{helper_pop, helper_push};
use dbt86_core::segments::{helper_iret, helper_lcall_pe, helper_ljmp_pe, helper_lret};
use dbt86_core::x86::*;
use dbt86_core::CpuError;

use super::DisasCtx;

impl<'a> DisasCtx<'a> {
    fn eip_mask(&self) -> u32 {
        if self.size() == OperandSize::S16 {
            0xFFFF
        } else {
            0xFFFF_FFFF
        }
    }

    /// Jcc: derive the condition from the lazy flags, select the
    /// target with a conditional move, then direct-link both
    /// edges.
    pub(super) fn gen_jcc(&mut self, cc: u8) -> Result<(), CpuError> {
        let next_eip = self.instr.next_eip();
        let jmp_eip =
            (next_eip.wrapping_add(self.instr.imm as u32)) & self.eip_mask();
        let next_pc = self.cs_base.wrapping_add(next_eip);
        let dst_pc = self.cs_base.wrapping_add(jmp_eip);

        // Even condition codes take the branch when a term fires;
        // odd codes are the negations, handled by swapping the
        // initial/alternate selection.
        let (init, alt) = if cc & 1 == 0 {
            (next_eip, jmp_eip)
        } else {
            (jmp_eip, next_eip)
        };
        self.gen_cc_select(cc, init, alt);

        self.e.mov_mr(Width::B32, Mem::ctx(off_eip()), Reg::R9);
        if self.cs_base != 0 {
            self.e
                .alu_ri(Alu::Add, Width::B32, Reg::R9, self.cs_base);
        }
        self.gen_link_direct(dst_pc, Some(next_pc), Some(Reg::R9));
        self.translate_next = false;
        Ok(())
    }

    /// JECXZ: branch on (E)CX == 0 per the address size.
    pub(super) fn gen_jecxz(&mut self) -> Result<(), CpuError> {
        let next_eip = self.instr.next_eip();
        let jmp_eip =
            (next_eip.wrapping_add(self.instr.imm as u32)) & self.eip_mask();
        let next_pc = self.cs_base.wrapping_add(next_eip);
        let dst_pc = self.cs_base.wrapping_add(jmp_eip);

        self.e.mov_ri32(Reg::R9, next_eip);
        self.e.mov_ri32(Reg::R10, jmp_eip);
        self.gen_ld_ecx_addr_size(Reg::Rax);
        self.e.test_rr(Width::B32, Reg::Rax, Reg::Rax);
        self.e.cmov_rr(Cc::E, Width::B32, Reg::R9, Reg::R10);

        self.e.mov_mr(Width::B32, Mem::ctx(off_eip()), Reg::R9);
        if self.cs_base != 0 {
            self.e
                .alu_ri(Alu::Add, Width::B32, Reg::R9, self.cs_base);
        }
        self.gen_link_direct(dst_pc, Some(next_pc), Some(Reg::R9));
        self.translate_next = false;
        Ok(())
    }

    /// LOOP/LOOPE/LOOPNE: decrement (E)CX per the address size,
    /// branch while non-zero (and ZF agrees for the E/NE forms).
    pub(super) fn gen_loop(&mut self) -> Result<(), CpuError> {
        let next_eip = self.instr.next_eip();
        let jmp_eip =
            (next_eip.wrapping_add(self.instr.imm as u32)) & self.eip_mask();
        let next_pc = self.cs_base.wrapping_add(next_eip);
        let dst_pc = self.cs_base.wrapping_add(jmp_eip);

        // Decrement the counter at the address width.
        match self.instr.addr_size {
            dbt86_core::insn::AddrSize::A32 => {
                self.e
                    .mov_rm(Width::B32, Reg::Rsi, Mem::ctx(off_gpr(ECX)));
                self.e.alu_ri(Alu::Sub, Width::B32, Reg::Rsi, 1);
                self.e
                    .mov_mr(Width::B32, Mem::ctx(off_gpr(ECX)), Reg::Rsi);
            }
            dbt86_core::insn::AddrSize::A16 => {
                self.e.movzx_rm(
                    Width::B32,
                    Reg::Rsi,
                    Width::B16,
                    Mem::ctx(off_gpr(ECX)),
                );
                self.e.alu_ri(Alu::Sub, Width::B32, Reg::Rsi, 1);
                self.e
                    .mov_mr(Width::B16, Mem::ctx(off_gpr(ECX)), Reg::Rsi);
                self.e
                    .movzx_rr(Width::B32, Reg::Rsi, Width::B16, Reg::Rsi);
            }
        }

        let not_taken = self.e.new_label();
        let end = self.e.new_label();
        self.e.test_rr(Width::B32, Reg::Rsi, Reg::Rsi);
        self.e.jcc(Cc::E, not_taken);
        match self.instr.opcode {
            Opcode::Loope => {
                // Taken only while ZF is set (res == 0).
                self.gen_ld_zf(Reg::Rdx);
                self.e.test_rr(Width::B32, Reg::Rdx, Reg::Rdx);
                self.e.jcc(Cc::Ne, not_taken);
            }
            Opcode::Loopne => {
                self.gen_ld_zf(Reg::Rdx);
                self.e.test_rr(Width::B32, Reg::Rdx, Reg::Rdx);
                self.e.jcc(Cc::E, not_taken);
            }
            Opcode::Loop => {}
            _ => unreachable!(),
        }

        self.e.mov_mi(Width::B32, Mem::ctx(off_eip()), jmp_eip);
        self.e.mov_ri32(Reg::R9, dst_pc);
        self.e.jmp(end);
        self.e.bind(not_taken);
        self.e.mov_mi(Width::B32, Mem::ctx(off_eip()), next_eip);
        self.e.mov_ri32(Reg::R9, next_pc);
        self.e.bind(end);

        self.gen_link_direct(dst_pc, Some(next_pc), Some(Reg::R9));
        self.translate_next = false;
        Ok(())
    }

    /// JMP rel8/rel32 and JMP r/m.
    pub(super) fn gen_jmp(&mut self) -> Result<(), CpuError> {
        match self.instr.operands[0] {
            Operand::Imm => {
                let next_eip = self.instr.next_eip();
                let dst_eip = (next_eip.wrapping_add(self.instr.imm as u32))
                    & self.eip_mask();
                self.gen_store_eip(dst_eip);
                let dst_pc = self.cs_base.wrapping_add(dst_eip);
                self.gen_link_direct(dst_pc, None, None);
            }
            op @ (Operand::Gpr(_) | Operand::Mem) => {
                self.gen_load_operand(op, self.size());
                self.e.mov_mr(Width::B32, Mem::ctx(off_eip()), Reg::Rax);
                self.gen_link_indirect();
            }
            _ => unreachable!(),
        }
        self.translate_next = false;
        Ok(())
    }

    /// Far JMP: the real-mode form recomputes the CS cache
    /// directly; the protected-mode form runs the descriptor
    /// protocol in its helper.
    pub(super) fn gen_jmp_far(&mut self) -> Result<(), CpuError> {
        let sel = self.instr.imm_sel;
        let new_eip = (self.instr.imm as u32) & self.eip_mask();
        let eip = self.instr.eip;

        if self.pe_mode {
            self.e.mov_ri32(Reg::Rsi, sel as u32);
            self.e.mov_ri32(Reg::Rdx, new_eip);
            self.e.mov_ri32(Reg::Rcx, eip);
            self.e.call_abs(helper_ljmp_pe as usize as u64);
            self.gen_exp_check();
            self.gen_link_indirect();
        } else {
            self.e
                .mov_mi(Width::B16, Mem::ctx(off_seg_sel(SEG_CS)), sel as u32);
            self.e.mov_mi(
                Width::B32,
                Mem::ctx(off_seg_base(SEG_CS)),
                (sel as u32) << 4,
            );
            self.gen_store_eip(new_eip);
            let dst_pc = ((sel as u32) << 4).wrapping_add(new_eip);
            self.gen_link_direct(dst_pc, None, None);
        }
        self.translate_next = false;
        Ok(())
    }

    /// CALL rel, CALL r/m and far CALL.
    pub(super) fn gen_call(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let next_eip = self.instr.next_eip();
        let eip = self.instr.eip;

        match self.instr.operands[0] {
            Operand::Imm => {
                let dst_eip = (next_eip.wrapping_add(self.instr.imm as u32))
                    & self.eip_mask();
                self.gen_push_const(next_eip, size, eip);
                self.gen_store_eip(dst_eip);
                let dst_pc = self.cs_base.wrapping_add(dst_eip);
                self.gen_link_direct(dst_pc, None, None);
            }
            op @ (Operand::Gpr(_) | Operand::Mem) => {
                // Target first (EBX survives the push helper),
                // then the return address, then the transfer.
                self.gen_load_operand(op, size);
                self.e.mov_rr(Width::B32, Reg::Rbx, Reg::Rax);
                self.gen_push_const(next_eip, size, eip);
                self.e.mov_mr(Width::B32, Mem::ctx(off_eip()), Reg::Rbx);
                self.gen_link_indirect();
            }
            Operand::Far => {
                let sel = self.instr.imm_sel;
                let new_eip = (self.instr.imm as u32) & self.eip_mask();
                if self.pe_mode {
                    self.e.mov_ri32(Reg::Rsi, sel as u32);
                    self.e.mov_ri32(Reg::Rdx, new_eip);
                    self.e.mov_ri32(Reg::Rcx, next_eip);
                    self.e.mov_ri32(
                        Reg::R8,
                        (size == OperandSize::S32) as u32,
                    );
                    self.e.call_abs(helper_lcall_pe as usize as u64);
                    self.gen_exp_check();
                    self.gen_link_indirect();
                } else {
                    self.gen_ld_sel(Reg::Rax, SEG_CS);
                    self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rax);
                    self.e.mov_ri32(Reg::Rdx, size.bytes());
                    self.e.mov_ri32(Reg::Rcx, eip);
                    self.e.call_abs(helper_push as usize as u64);
                    self.gen_exp_check();
                    self.gen_push_const(next_eip, size, eip);
                    self.e.mov_mi(
                        Width::B16,
                        Mem::ctx(off_seg_sel(SEG_CS)),
                        sel as u32,
                    );
                    self.e.mov_mi(
                        Width::B32,
                        Mem::ctx(off_seg_base(SEG_CS)),
                        (sel as u32) << 4,
                    );
                    self.gen_store_eip(new_eip);
                    let dst_pc = ((sel as u32) << 4).wrapping_add(new_eip);
                    self.gen_link_direct(dst_pc, None, None);
                }
            }
            _ => unreachable!(),
        }
        self.translate_next = false;
        Ok(())
    }

    fn gen_push_const(&mut self, val: u32, size: OperandSize, eip: u32) {
        self.e.mov_ri32(Reg::Rsi, val & size.mask());
        self.e.mov_ri32(Reg::Rdx, size.bytes());
        self.e.mov_ri32(Reg::Rcx, eip);
        self.e.call_abs(helper_push as usize as u64);
        self.gen_exp_check();
    }

    /// Near RET (optionally releasing `imm` bytes of arguments).
    pub(super) fn gen_ret(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let eip = self.instr.eip;
        self.e.mov_ri32(Reg::Rsi, size.bytes());
        self.e.mov_ri32(Reg::Rdx, eip);
        self.e.call_abs(helper_pop as usize as u64);
        self.gen_exp_check();
        self.e.mov_mr(Width::B32, Mem::ctx(off_eip()), Reg::Rax);

        let pop_bytes = self.instr.imm as u32;
        if pop_bytes != 0 {
            self.gen_adjust_sp(pop_bytes);
        }
        self.gen_link_indirect();
        self.translate_next = false;
        Ok(())
    }

    /// Release callee arguments from the stack, at the stack
    /// width. SS.D is part of the fingerprint, so the snapshot is
    /// sound here.
    fn gen_adjust_sp(&mut self, bytes: u32) {
        if self.ss32 {
            self.e
                .mov_rm(Width::B32, Reg::Rax, Mem::ctx(off_gpr(ESP)));
            self.e.alu_ri(Alu::Add, Width::B32, Reg::Rax, bytes);
            self.e
                .mov_mr(Width::B32, Mem::ctx(off_gpr(ESP)), Reg::Rax);
        } else {
            self.e
                .movzx_rm(Width::B32, Reg::Rax, Width::B16, Mem::ctx(off_gpr(ESP)));
            self.e.alu_ri(Alu::Add, Width::B32, Reg::Rax, bytes);
            self.e
                .mov_mr(Width::B16, Mem::ctx(off_gpr(ESP)), Reg::Rax);
        }
    }

    /// Far RET.
    pub(super) fn gen_ret_far(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let eip = self.instr.eip;
        self.e
            .mov_ri32(Reg::Rsi, self.instr.imm as u32);
        self.e
            .mov_ri32(Reg::Rdx, (size == OperandSize::S32) as u32);
        self.e.mov_ri32(Reg::Rcx, eip);
        self.e.call_abs(helper_lret as usize as u64);
        self.gen_exp_check();
        self.gen_link_indirect();
        self.translate_next = false;
        Ok(())
    }

    /// IRET (both modes; the helper sorts out the privilege
    /// protocol).
    pub(super) fn gen_iret(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let eip = self.instr.eip;
        self.e
            .mov_ri32(Reg::Rsi, (size == OperandSize::S32) as u32);
        self.e.mov_ri32(Reg::Rdx, eip);
        self.e.call_abs(helper_iret as usize as u64);
        self.gen_exp_check();
        self.gen_link_indirect();
        self.translate_next = false;
        Ok(())
    }

    /// INT n / INT3: software interrupt through the IDT. The
    /// helper redirects CS:EIP; the block returns to the
    /// dispatcher which re-enters at the handler.
    pub(super) fn gen_int(&mut self) -> Result<(), CpuError> {
        let vector = if self.instr.opcode == Opcode::Int3 {
            3
        } else {
            self.instr.imm as u32 & 0xFF
        };
        let next_eip = self.instr.next_eip();
        self.e.mov_ri32(Reg::Rsi, vector);
        self.e.mov_ri32(Reg::Rdx, next_eip);
        self.e
            .call_abs(dbt86_core::exceptions::helper_soft_int as usize as u64);
        self.gen_exit_null();
        self.translate_next = false;
        Ok(())
    }

    /// HLT: privileged; stops the dispatcher until the embedder
    /// raises an interrupt.
    pub(super) fn gen_hlt(&mut self) -> Result<(), CpuError> {
        if self.pe_mode && self.cpl != 0 {
            self.gen_raise_block(0, EXP_GP);
            return Ok(());
        }
        let next_eip = self.instr.next_eip();
        self.gen_store_eip(next_eip);
        self.e.mov_mi(
            Width::B8,
            Mem::ctx(dbt86_core::context::off_halted()),
            1,
        );
        self.gen_exit_null();
        self.translate_next = false;
        Ok(())
    }

    fn gen_ld_ecx_addr_size(&mut self, dst: Reg) {
        match self.instr.addr_size {
            dbt86_core::insn::AddrSize::A32 => {
                self.e.mov_rm(Width::B32, dst, Mem::ctx(off_gpr(ECX)))
            }
            dbt86_core::insn::AddrSize::A16 => self.e.movzx_rm(
                Width::B32,
                dst,
                Width::B16,
                Mem::ctx(off_gpr(ECX)),
            ),
        }
    }
}

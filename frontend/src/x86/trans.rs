//! Data-movement and arithmetic recipes.

use dbt86_backend::regs::local_off;
use dbt86_backend::{Alu, Cc, Mem, Reg, Shift, Width};
use dbt86_core::insn::{Opcode, Operand, OperandSize};
use dbt86_core::mem::{helper_pop, helper_push};
use dbt86_core::x86::*;
use dbt86_core::CpuError;

use super::DisasCtx;

impl<'a> DisasCtx<'a> {
    /// ADD/OR/AND/SUB/XOR/CMP/TEST. Fetch both operands, compute
    /// on zero-extended 32-bit host values, write back (except
    /// CMP/TEST), then produce the lazy flag pair.
    pub(super) fn gen_alu(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let [dst, src] = self.instr.operands;
        let op = self.instr.opcode;
        let writeback = !matches!(op, Opcode::Cmp | Opcode::Test);
        let dst_mem = dst == Operand::Mem;

        // The memory operand (if any) is fetched first: its helper
        // call clobbers every scratch register, so the register/
        // immediate operand is materialized afterwards.
        // a -> ECX (destination's original value), b -> ESI.
        if dst_mem {
            self.gen_load_operand(dst, size);
            self.e.mov_rr(Width::B32, Reg::Rcx, Reg::Rax);
            match src {
                Operand::Gpr(g) => self.gen_ld_gpr(Reg::Rsi, g, size),
                Operand::Imm => {
                    let imm = (self.instr.imm as u64 as u32) & size.mask();
                    self.e.mov_ri32(Reg::Rsi, imm);
                }
                _ => unreachable!(),
            }
        } else {
            match src {
                Operand::Gpr(g) => self.gen_ld_gpr(Reg::Rsi, g, size),
                Operand::Imm => {
                    let imm = (self.instr.imm as u64 as u32) & size.mask();
                    self.e.mov_ri32(Reg::Rsi, imm);
                }
                Operand::Mem => {
                    self.gen_ea(true);
                    self.gen_mem_read(size);
                    self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rax);
                }
                _ => unreachable!(),
            }
            self.gen_load_operand(dst, size);
            self.e.mov_rr(Width::B32, Reg::Rcx, Reg::Rax);
        }

        // result -> R8D.
        self.e.mov_rr(Width::B32, Reg::R8, Reg::Rcx);
        let host_op = match op {
            Opcode::Add => Alu::Add,
            Opcode::Or => Alu::Or,
            Opcode::And | Opcode::Test => Alu::And,
            Opcode::Sub | Opcode::Cmp => Alu::Sub,
            Opcode::Xor => Alu::Xor,
            _ => unreachable!(),
        };
        self.e.alu_rr(host_op, Width::B32, Reg::R8, Reg::Rsi);

        if writeback {
            if dst_mem {
                // The store helper clobbers the flag inputs; park
                // them in frame locals across the call. The store
                // must commit (or fault) before the flags change.
                self.e
                    .mov_mr(Width::B32, Mem::frame(local_off(0)), Reg::Rcx);
                self.e
                    .mov_mr(Width::B32, Mem::frame(local_off(1)), Reg::Rsi);
                self.e
                    .mov_mr(Width::B32, Mem::frame(local_off(2)), Reg::R8);
                self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rbx);
                self.e.mov_rr(Width::B32, Reg::Rdx, Reg::R8);
                self.gen_mem_write(size);
                self.e
                    .mov_rm(Width::B32, Reg::Rcx, Mem::frame(local_off(0)));
                self.e
                    .mov_rm(Width::B32, Reg::Rsi, Mem::frame(local_off(1)));
                self.e
                    .mov_rm(Width::B32, Reg::R8, Mem::frame(local_off(2)));
            } else {
                let Operand::Gpr(g) = dst else { unreachable!() };
                self.e.mov_rr(Width::B32, Reg::Rax, Reg::R8);
                self.gen_st_gpr(g, size, Reg::Rax);
            }
        }

        match op {
            Opcode::Add => self.gen_set_flags_sum(size),
            Opcode::Sub | Opcode::Cmp => self.gen_set_flags_sub(size),
            _ => self.gen_set_flags_logic(size),
        }
        Ok(())
    }

    /// INC/DEC: an add/sub of one that preserves CF. The old CF is
    /// read before the flag slots are overwritten and re-injected
    /// into the fresh aux word.
    pub(super) fn gen_incdec(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let dst = self.instr.operands[0];
        let is_inc = self.instr.opcode == Opcode::Inc;
        let dst_mem = dst == Operand::Mem;

        self.gen_load_operand(dst, size);
        self.e.mov_rr(Width::B32, Reg::Rcx, Reg::Rax);
        self.e.mov_rr(Width::B32, Reg::R8, Reg::Rcx);
        let op = if is_inc { Alu::Add } else { Alu::Sub };
        self.e.alu_ri(op, Width::B32, Reg::R8, 1);

        if dst_mem {
            self.e
                .mov_mr(Width::B32, Mem::frame(local_off(0)), Reg::Rcx);
            self.e
                .mov_mr(Width::B32, Mem::frame(local_off(2)), Reg::R8);
            self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rbx);
            self.e.mov_rr(Width::B32, Reg::Rdx, Reg::R8);
            self.gen_mem_write(size);
            self.e
                .mov_rm(Width::B32, Reg::Rcx, Mem::frame(local_off(0)));
            self.e
                .mov_rm(Width::B32, Reg::R8, Mem::frame(local_off(2)));
        } else {
            let Operand::Gpr(g) = dst else { unreachable!() };
            self.e.mov_rr(Width::B32, Reg::Rax, Reg::R8);
            self.gen_st_gpr(g, size, Reg::Rax);
        }

        // Old CF (bit 31) before the setter replaces aux.
        self.gen_ld_cf(Reg::R10);
        self.e.mov_ri32(Reg::Rsi, 1);
        if is_inc {
            self.gen_set_flags_sum(size);
        } else {
            self.gen_set_flags_sub(size);
        }

        // aux := fresh OF/AF with the old CF spliced back in:
        // bit 31 = old CF, bit 30 = OF ^ old CF.
        self.e
            .mov_rm(Width::B32, Reg::Rax, Mem::ctx(dbt86_core::context::off_lazy_aux()));
        self.gen_ld_of(Reg::Rdx, Reg::Rax);
        self.e.alu_rr(Alu::Xor, Width::B32, Reg::Rdx, Reg::R10);
        self.e.shift_ri(Shift::Shr, Width::B32, Reg::Rdx, 1);
        self.e.alu_rr(Alu::Or, Width::B32, Reg::Rdx, Reg::R10);
        self.e
            .mov_rm(Width::B32, Reg::Rax, Mem::ctx(dbt86_core::context::off_lazy_aux()));
        self.e
            .alu_ri(Alu::And, Width::B32, Reg::Rax, 0x3FFF_FFFF);
        self.e.alu_rr(Alu::Or, Width::B32, Reg::Rdx, Reg::Rax);
        self.e.mov_mr(
            Width::B32,
            Mem::ctx(dbt86_core::context::off_lazy_aux()),
            Reg::Rdx,
        );
        Ok(())
    }

    /// NEG: `0 - x` with the usual subtract flags.
    pub(super) fn gen_neg(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let dst = self.instr.operands[0];
        let dst_mem = dst == Operand::Mem;

        self.gen_load_operand(dst, size);
        self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rax); // b = x
        self.e.mov_ri32(Reg::Rcx, 0); // a = 0
        self.e.mov_rr(Width::B32, Reg::R8, Reg::Rsi);
        self.e.neg_r(Width::B32, Reg::R8);

        if dst_mem {
            self.e
                .mov_mr(Width::B32, Mem::frame(local_off(1)), Reg::Rsi);
            self.e
                .mov_mr(Width::B32, Mem::frame(local_off(2)), Reg::R8);
            self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rbx);
            self.e.mov_rr(Width::B32, Reg::Rdx, Reg::R8);
            self.gen_mem_write(size);
            self.e.mov_ri32(Reg::Rcx, 0);
            self.e
                .mov_rm(Width::B32, Reg::Rsi, Mem::frame(local_off(1)));
            self.e
                .mov_rm(Width::B32, Reg::R8, Mem::frame(local_off(2)));
        } else {
            let Operand::Gpr(g) = dst else { unreachable!() };
            self.e.mov_rr(Width::B32, Reg::Rax, Reg::R8);
            self.gen_st_gpr(g, size, Reg::Rax);
        }
        self.gen_set_flags_sub(size);
        Ok(())
    }

    /// NOT: bitwise complement, no flags.
    pub(super) fn gen_not(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let dst = self.instr.operands[0];
        self.gen_load_operand(dst, size);
        self.e.not_r(Width::B32, Reg::Rax);
        self.gen_store_operand(dst, size, dst == Operand::Mem);
        Ok(())
    }

    /// SHL/SHR/SAR with an immediate or CL count.
    pub(super) fn gen_shift(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let [dst, src] = self.instr.operands;
        let op = self.instr.opcode;

        if src == Operand::Imm {
            let count = (self.instr.imm as u32) & 31;
            if count == 0 {
                return Ok(());
            }
            self.gen_load_operand(dst, size);
            self.gen_shift_compute_const(op, size, count);
            self.gen_shift_writeback_and_flags(dst, size);
            return Ok(());
        }

        // Count in CL: everything (including the write-back) is
        // skipped when the masked count is zero.
        self.gen_load_operand(dst, size);
        let skip = self.e.new_label();
        self.gen_ld_gpr(Reg::Rcx, dbt86_core::insn::GprRef::new(ECX), OperandSize::S8);
        self.e.alu_ri(Alu::And, Width::B32, Reg::Rcx, 31);
        self.e.test_rr(Width::B32, Reg::Rcx, Reg::Rcx);
        self.e.jcc(Cc::E, skip);
        self.gen_shift_compute_cl(op, size);
        self.gen_shift_writeback_and_flags(dst, size);
        self.e.bind(skip);
        Ok(())
    }

    /// Shared tail of the shift recipes: the result commits (or
    /// faults, leaving the old flags) before the flag slots are
    /// rewritten from `(CF, OF^CF, result)` in (ESI, EDX, R8D).
    fn gen_shift_writeback_and_flags(&mut self, dst: Operand, size: OperandSize) {
        if dst == Operand::Mem {
            self.e
                .mov_mr(Width::B32, Mem::frame(local_off(0)), Reg::Rsi);
            self.e
                .mov_mr(Width::B32, Mem::frame(local_off(1)), Reg::Rdx);
            self.e
                .mov_mr(Width::B32, Mem::frame(local_off(2)), Reg::R8);
            self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rbx);
            self.e.mov_rr(Width::B32, Reg::Rdx, Reg::R8);
            self.gen_mem_write(size);
            self.e
                .mov_rm(Width::B32, Reg::Rsi, Mem::frame(local_off(0)));
            self.e
                .mov_rm(Width::B32, Reg::Rdx, Mem::frame(local_off(1)));
            self.e
                .mov_rm(Width::B32, Reg::R8, Mem::frame(local_off(2)));
        } else {
            let Operand::Gpr(g) = dst else { unreachable!() };
            self.e.mov_rr(Width::B32, Reg::Rax, Reg::R8);
            self.gen_st_gpr(g, size, Reg::Rax);
        }
        self.gen_set_flags_cf_ofxor(size);
    }

    /// Shift with a compile-time count: value in EAX on entry;
    /// leaves CF in ESI, `OF ^ CF` in EDX and the result in R8D.
    fn gen_shift_compute_const(&mut self, op: Opcode, size: OperandSize, count: u32) {
        let width = size.bits();
        match op {
            Opcode::Shl => {
                // CF = bit (width - count) of the value when the
                // count fits, else 0. OF ^ CF = result's MSB.
                self.e.mov_rr(Width::B32, Reg::R8, Reg::Rax);
                self.e
                    .shift_ri(Shift::Shl, Width::B32, Reg::R8, count as u8);
                if count <= width {
                    self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rax);
                    if count < width {
                        self.e.shift_ri(
                            Shift::Shr,
                            Width::B32,
                            Reg::Rsi,
                            (width - count) as u8,
                        );
                    }
                    self.e.alu_ri(Alu::And, Width::B32, Reg::Rsi, 1);
                } else {
                    self.e.mov_ri32(Reg::Rsi, 0);
                }
                self.gen_shift_msb_to_edx(size, Reg::R8);
            }
            Opcode::Shr => {
                // CF = bit (count-1); OF ^ CF folds to the
                // original MSB xor CF.
                self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rax);
                if count > 1 {
                    self.e.shift_ri(
                        Shift::Shr,
                        Width::B32,
                        Reg::Rsi,
                        (count - 1) as u8,
                    );
                }
                self.e.alu_ri(Alu::And, Width::B32, Reg::Rsi, 1);
                self.gen_shift_msb_to_edx(size, Reg::Rax);
                self.e.alu_rr(Alu::Xor, Width::B32, Reg::Rdx, Reg::Rsi);
                self.e.alu_ri(Alu::And, Width::B32, Reg::Rdx, 1);
                self.e.mov_rr(Width::B32, Reg::R8, Reg::Rax);
                self.e
                    .shift_ri(Shift::Shr, Width::B32, Reg::R8, count as u8);
            }
            Opcode::Sar => {
                // Arithmetic shift over the sign-extended value;
                // OF is zero so OF ^ CF = CF.
                self.gen_sign_extend_eax(size);
                self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rax);
                if count > 1 {
                    self.e.shift_ri(
                        Shift::Sar,
                        Width::B32,
                        Reg::Rsi,
                        (count - 1) as u8,
                    );
                }
                self.e.alu_ri(Alu::And, Width::B32, Reg::Rsi, 1);
                self.e.mov_rr(Width::B32, Reg::R8, Reg::Rax);
                self.e
                    .shift_ri(Shift::Sar, Width::B32, Reg::R8, count as u8);
                self.e.mov_rr(Width::B32, Reg::Rdx, Reg::Rsi);
            }
            _ => unreachable!(),
        }
    }

    /// Shift with the count in CL (non-zero, already masked).
    /// Value in EAX on entry; leaves CF in ESI, `OF ^ CF` in EDX
    /// and the result in R8D.
    fn gen_shift_compute_cl(&mut self, op: Opcode, size: OperandSize) {
        let width = size.bits();
        match op {
            Opcode::Shl => {
                // A 64-bit shift keeps the carry-out reachable for
                // every masked count; CF is bit `width` of the wide
                // result, OF ^ CF is the result's MSB.
                self.e.mov_rr(Width::B32, Reg::R8, Reg::Rax);
                self.e.shift_cl(Shift::Shl, Width::B64, Reg::R8);
                self.e.mov_rr(Width::B64, Reg::Rsi, Reg::R8);
                self.e
                    .shift_ri(Shift::Shr, Width::B64, Reg::Rsi, width as u8);
                self.e.alu_ri(Alu::And, Width::B32, Reg::Rsi, 1);
                self.gen_shift_msb_to_edx(size, Reg::R8);
            }
            Opcode::Shr => {
                self.e.mov_rr(Width::B32, Reg::R8, Reg::Rax);
                self.e.shift_cl(Shift::Shr, Width::B32, Reg::R8);
                // CF = bit (count-1) of the original value; CL is
                // dead after this.
                self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rax);
                self.e.alu_ri(Alu::Sub, Width::B32, Reg::Rcx, 1);
                self.e.shift_cl(Shift::Shr, Width::B32, Reg::Rsi);
                self.e.alu_ri(Alu::And, Width::B32, Reg::Rsi, 1);
                // OF ^ CF = original MSB xor CF.
                self.gen_shift_msb_to_edx(size, Reg::Rax);
                self.e.alu_rr(Alu::Xor, Width::B32, Reg::Rdx, Reg::Rsi);
                self.e.alu_ri(Alu::And, Width::B32, Reg::Rdx, 1);
            }
            Opcode::Sar => {
                self.gen_sign_extend_eax(size);
                self.e.mov_rr(Width::B32, Reg::R8, Reg::Rax);
                self.e.shift_cl(Shift::Sar, Width::B32, Reg::R8);
                self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rax);
                self.e.alu_ri(Alu::Sub, Width::B32, Reg::Rcx, 1);
                self.e.shift_cl(Shift::Sar, Width::B32, Reg::Rsi);
                self.e.alu_ri(Alu::And, Width::B32, Reg::Rsi, 1);
                // SAR leaves OF clear, so OF ^ CF collapses to CF.
                self.e.mov_rr(Width::B32, Reg::Rdx, Reg::Rsi);
            }
            _ => unreachable!(),
        }
    }

    /// MSB of `src`'s guest-width result into EDX bit 0.
    fn gen_shift_msb_to_edx(&mut self, size: OperandSize, src: Reg) {
        self.e.mov_rr(Width::B32, Reg::Rdx, src);
        self.e
            .shift_ri(Shift::Shr, Width::B32, Reg::Rdx, (size.bits() - 1) as u8);
        self.e.alu_ri(Alu::And, Width::B32, Reg::Rdx, 1);
    }

    /// Sign-extend EAX from the guest width in place.
    fn gen_sign_extend_eax(&mut self, size: OperandSize) {
        match size {
            OperandSize::S8 => {
                self.e.movsx_rr(Width::B32, Reg::Rax, Width::B8, Reg::Rax)
            }
            OperandSize::S16 => {
                self.e.movsx_rr(Width::B32, Reg::Rax, Width::B16, Reg::Rax)
            }
            OperandSize::S32 => {}
        }
    }

    /// MOV in all its decoded shapes. No flags.
    pub(super) fn gen_mov(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let [dst, src] = self.instr.operands;
        self.gen_load_operand(src, size);
        // A memory source leaves its EA in EBX, but a memory
        // destination recomputes its own; MOV never has two
        // memory operands.
        self.gen_store_operand(dst, size, false);
        Ok(())
    }

    /// MOVZX/MOVSX: narrow source, wide destination.
    pub(super) fn gen_movx(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let src_size = match self.instr.imm {
            0 => OperandSize::S8,
            _ => OperandSize::S16,
        };
        let [dst, src] = self.instr.operands;
        self.gen_load_operand(src, src_size);
        if self.instr.opcode == Opcode::MovSx {
            self.gen_sign_extend_eax(src_size);
        }
        let Operand::Gpr(g) = dst else { unreachable!() };
        self.gen_st_gpr(g, size, Reg::Rax);
        Ok(())
    }

    /// LEA: effective address without the segment base.
    pub(super) fn gen_lea(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let Operand::Gpr(g) = self.instr.operands[0] else {
            unreachable!()
        };
        self.gen_ea(false);
        self.e.mov_rr(Width::B32, Reg::Rax, Reg::Rdx);
        self.gen_st_gpr(g, size, Reg::Rax);
        Ok(())
    }

    /// PUSH r/m (and the decoded-immediate form).
    pub(super) fn gen_push(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let eip = self.instr.eip;
        self.gen_load_operand(self.instr.operands[0], size);
        self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rax);
        self.e.mov_ri32(Reg::Rdx, size.bytes());
        self.e.mov_ri32(Reg::Rcx, eip);
        self.e.call_abs(helper_push as usize as u64);
        self.gen_exp_check();
        Ok(())
    }

    /// POP r.
    pub(super) fn gen_pop(&mut self) -> Result<(), CpuError> {
        let size = self.size();
        let eip = self.instr.eip;
        self.e.mov_ri32(Reg::Rsi, size.bytes());
        self.e.mov_ri32(Reg::Rdx, eip);
        self.e.call_abs(helper_pop as usize as u64);
        self.gen_exp_check();
        let Operand::Gpr(g) = self.instr.operands[0] else {
            unreachable!()
        };
        self.gen_st_gpr(g, size, Reg::Rax);
        Ok(())
    }
}

//! Operand fetch/store primitives shared by the recipes.
//!
//! Conventions inside a block (see `backend::regs`): RDI is the
//! context pointer, guest values travel zero-extended in 32-bit
//! host registers, effective addresses are computed into EDX, and
//! RBX (call-surviving) holds a memory operand's linear address
//! across the helper calls of read-modify-write recipes.

use dbt86_backend::{Alu, Mem, Reg, Width};
use dbt86_core::context::{off_gpr, off_gpr8, off_seg_base, off_seg_sel};
use dbt86_core::insn::{AddrSize, GprRef, MemOperand, Operand, OperandSize};
use dbt86_core::mem::{
    helper_mem_read16, helper_mem_read32, helper_mem_read8, helper_mem_write16,
    helper_mem_write32, helper_mem_write8,
};

use super::DisasCtx;

impl<'a> DisasCtx<'a> {
    /// Load guest GPR `gpr` into host `dst`, zero-extended to 32
    /// bits.
    pub fn gen_ld_gpr(&mut self, dst: Reg, gpr: GprRef, size: OperandSize) {
        match size {
            OperandSize::S8 => self.e.movzx_rm(
                Width::B32,
                dst,
                Width::B8,
                Mem::ctx(off_gpr8(gpr.idx, gpr.high_byte)),
            ),
            OperandSize::S16 => self.e.movzx_rm(
                Width::B32,
                dst,
                Width::B16,
                Mem::ctx(off_gpr(gpr.idx)),
            ),
            OperandSize::S32 => {
                self.e.mov_rm(Width::B32, dst, Mem::ctx(off_gpr(gpr.idx)))
            }
        }
    }

    /// Store host `src`'s low bits into guest GPR `gpr`.
    pub fn gen_st_gpr(&mut self, gpr: GprRef, size: OperandSize, src: Reg) {
        match size {
            OperandSize::S8 => self.e.mov_mr(
                Width::B8,
                Mem::ctx(off_gpr8(gpr.idx, gpr.high_byte)),
                src,
            ),
            OperandSize::S16 => {
                self.e
                    .mov_mr(Width::B16, Mem::ctx(off_gpr(gpr.idx)), src)
            }
            OperandSize::S32 => {
                self.e
                    .mov_mr(Width::B32, Mem::ctx(off_gpr(gpr.idx)), src)
            }
        }
    }

    /// Compute the current memory operand's linear address into
    /// EDX: base + index*scale + disp, wrapped to the address
    /// size, plus the segment base unless `with_seg` is off (LEA).
    pub fn gen_ea(&mut self, with_seg: bool) {
        let mem: MemOperand = self.instr.mem;
        match mem.base {
            Some(b) => {
                self.e.mov_rm(Width::B32, Reg::Rdx, Mem::ctx(off_gpr(b)));
                if mem.disp != 0 {
                    self.e
                        .alu_ri(Alu::Add, Width::B32, Reg::Rdx, mem.disp as u32);
                }
            }
            None => {
                self.e.mov_ri32(Reg::Rdx, mem.disp as u32);
            }
        }
        if let Some(i) = mem.index {
            self.e.mov_rm(Width::B32, Reg::Rax, Mem::ctx(off_gpr(i)));
            if mem.scale > 0 {
                self.e.shift_ri(
                    dbt86_backend::Shift::Shl,
                    Width::B32,
                    Reg::Rax,
                    mem.scale,
                );
            }
            self.e.alu_rr(Alu::Add, Width::B32, Reg::Rdx, Reg::Rax);
        }
        if self.instr.addr_size == AddrSize::A16 {
            self.e
                .movzx_rr(Width::B32, Reg::Rdx, Width::B16, Reg::Rdx);
        }
        if with_seg {
            self.e.alu_rm(
                Alu::Add,
                Width::B32,
                Reg::Rdx,
                Mem::ctx(off_seg_base(mem.seg)),
            );
        }
    }

    fn mem_read_helper_addr(size: OperandSize) -> u64 {
        match size {
            OperandSize::S8 => helper_mem_read8 as usize as u64,
            OperandSize::S16 => helper_mem_read16 as usize as u64,
            OperandSize::S32 => helper_mem_read32 as usize as u64,
        }
    }

    fn mem_write_helper_addr(size: OperandSize) -> u64 {
        match size {
            OperandSize::S8 => helper_mem_write8 as usize as u64,
            OperandSize::S16 => helper_mem_write16 as usize as u64,
            OperandSize::S32 => helper_mem_write32 as usize as u64,
        }
    }

    /// Guest memory read: linear address in EDX on entry, value in
    /// EAX on return. Re-materializes RDI and bails on a delivered
    /// exception.
    pub fn gen_mem_read(&mut self, size: OperandSize) {
        let eip = self.instr.eip;
        self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rdx);
        self.e.mov_ri32(Reg::Rdx, eip);
        self.e.mov_ri32(Reg::Rcx, 0);
        self.e.call_abs(Self::mem_read_helper_addr(size));
        self.gen_exp_check();
    }

    /// Guest memory write: linear address in ESI, value in EDX.
    pub fn gen_mem_write(&mut self, size: OperandSize) {
        let eip = self.instr.eip;
        self.e.mov_ri32(Reg::Rcx, eip);
        self.e.mov_ri32(Reg::R8, 0);
        self.e.call_abs(Self::mem_write_helper_addr(size));
        self.gen_exp_check();
    }

    /// Load operand `op` (register, memory or immediate) into EAX,
    /// zero-extended. For memory operands the linear address is
    /// left in EBX for a later write-back.
    pub fn gen_load_operand(&mut self, op: Operand, size: OperandSize) {
        match op {
            Operand::Gpr(g) => self.gen_ld_gpr(Reg::Rax, g, size),
            Operand::Imm => {
                let imm = (self.instr.imm as u64 as u32) & size.mask();
                self.e.mov_ri32(Reg::Rax, imm);
            }
            Operand::Mem => {
                self.gen_ea(true);
                self.e.mov_rr(Width::B32, Reg::Rbx, Reg::Rdx);
                self.gen_mem_read(size);
            }
            _ => unreachable!("not a value operand: {op:?}"),
        }
    }

    /// Store EAX's low bits back to operand `op`. Memory operands
    /// reuse the address EBX captured during the load (or a fresh
    /// EA if the recipe never loaded).
    pub fn gen_store_operand(&mut self, op: Operand, size: OperandSize, have_ea: bool) {
        match op {
            Operand::Gpr(g) => self.gen_st_gpr(g, size, Reg::Rax),
            Operand::Mem => {
                if !have_ea {
                    // Value must survive the EA computation.
                    self.e.mov_rr(Width::B32, Reg::Rbx, Reg::Rax);
                    self.gen_ea(true);
                    self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rdx);
                    self.e.mov_rr(Width::B32, Reg::Rdx, Reg::Rbx);
                } else {
                    self.e.mov_rr(Width::B32, Reg::Rsi, Reg::Rbx);
                    self.e.mov_rr(Width::B32, Reg::Rdx, Reg::Rax);
                }
                self.gen_mem_write(size);
            }
            _ => unreachable!("not a writable operand: {op:?}"),
        }
    }

    /// Load a segment selector into host `dst`.
    pub fn gen_ld_sel(&mut self, dst: Reg, seg: usize) {
        self.e
            .movzx_rm(Width::B32, dst, Width::B16, Mem::ctx(off_seg_sel(seg)));
    }
}

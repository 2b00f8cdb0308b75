//! Lazy-flag emission sequences.
//!
//! Producers store the sign-extended result and the packed carry
//! vector into the context's `(res, aux)` slots; readers derive a
//! single flag into a host register. The identities mirror
//! `core::lazyflags` exactly — that module is the reference these
//! sequences are tested against.
//!
//! Producer register convention: `a` in ECX, `b` in ESI, result in
//! R8D, all zero-extended to 32 bits. Everything here clobbers
//! EAX/EDX.

use dbt86_backend::{Alu, Cc, Mem, Reg, Shift, Width};
use dbt86_core::context::{off_lazy_aux, off_lazy_res, off_parity};
use dbt86_core::insn::OperandSize;
use dbt86_core::lazyflags::AUX_MASK;

use super::DisasCtx;

impl<'a> DisasCtx<'a> {
    /// Store R8D into `res`, sign-extended from the guest width.
    fn gen_store_res(&mut self, size: OperandSize) {
        match size {
            OperandSize::S8 => {
                self.e.movsx_rr(Width::B32, Reg::Rax, Width::B8, Reg::R8)
            }
            OperandSize::S16 => {
                self.e.movsx_rr(Width::B32, Reg::Rax, Width::B16, Reg::R8)
            }
            OperandSize::S32 => self.e.mov_rr(Width::B32, Reg::Rax, Reg::R8),
        }
        self.e
            .mov_mr(Width::B32, Mem::ctx(off_lazy_res()), Reg::Rax);
    }

    /// Fold the carry vector in EDX into the canonical aux layout
    /// (narrow vectors masked to their width, carry bits
    /// replicated into bits 31/30) and apply the aux mask. The
    /// width mask matters: the borrow vector of a narrow subtract
    /// is computed from the full-width host difference.
    fn gen_fold_aux(&mut self, size: OperandSize) {
        match size {
            OperandSize::S8 => {
                self.e.movzx_rr(Width::B32, Reg::Rdx, Width::B8, Reg::Rdx);
                self.e.mov_rr(Width::B32, Reg::Rax, Reg::Rdx);
                self.e.shift_ri(Shift::Shl, Width::B32, Reg::Rax, 24);
                self.e.alu_rr(Alu::Or, Width::B32, Reg::Rdx, Reg::Rax);
            }
            OperandSize::S16 => {
                self.e.movzx_rr(Width::B32, Reg::Rdx, Width::B16, Reg::Rdx);
                self.e.mov_rr(Width::B32, Reg::Rax, Reg::Rdx);
                self.e.shift_ri(Shift::Shl, Width::B32, Reg::Rax, 16);
                self.e.alu_rr(Alu::Or, Width::B32, Reg::Rdx, Reg::Rax);
            }
            OperandSize::S32 => {}
        }
        self.e.alu_ri(Alu::And, Width::B32, Reg::Rdx, AUX_MASK);
    }

    /// Flags after `a + b = sum` (a=ECX, b=ESI, sum=R8D): aux from
    /// the carry vector `((a | b) & !sum) | (a & b)`.
    pub fn gen_set_flags_sum(&mut self, size: OperandSize) {
        self.e.mov_rr(Width::B32, Reg::Rdx, Reg::Rcx);
        self.e.alu_rr(Alu::Or, Width::B32, Reg::Rdx, Reg::Rsi);
        self.e.mov_rr(Width::B32, Reg::Rax, Reg::R8);
        self.e.not_r(Width::B32, Reg::Rax);
        self.e.alu_rr(Alu::And, Width::B32, Reg::Rdx, Reg::Rax);
        self.e.mov_rr(Width::B32, Reg::Rax, Reg::Rcx);
        self.e.alu_rr(Alu::And, Width::B32, Reg::Rax, Reg::Rsi);
        self.e.alu_rr(Alu::Or, Width::B32, Reg::Rdx, Reg::Rax);
        self.gen_fold_aux(size);
        self.gen_store_res(size);
        self.e
            .mov_mr(Width::B32, Mem::ctx(off_lazy_aux()), Reg::Rdx);
    }

    /// Flags after `a - b = res` (a=ECX, b=ESI, res=R8D): aux from
    /// the borrow vector `(!(a ^ b) & res) | (!a & b)`.
    pub fn gen_set_flags_sub(&mut self, size: OperandSize) {
        self.e.mov_rr(Width::B32, Reg::Rdx, Reg::Rcx);
        self.e.alu_rr(Alu::Xor, Width::B32, Reg::Rdx, Reg::Rsi);
        self.e.not_r(Width::B32, Reg::Rdx);
        self.e.alu_rr(Alu::And, Width::B32, Reg::Rdx, Reg::R8);
        self.e.mov_rr(Width::B32, Reg::Rax, Reg::Rcx);
        self.e.not_r(Width::B32, Reg::Rax);
        self.e.alu_rr(Alu::And, Width::B32, Reg::Rax, Reg::Rsi);
        self.e.alu_rr(Alu::Or, Width::B32, Reg::Rdx, Reg::Rax);
        self.gen_fold_aux(size);
        self.gen_store_res(size);
        self.e
            .mov_mr(Width::B32, Mem::ctx(off_lazy_aux()), Reg::Rdx);
    }

    /// Flags after a logic op: result in R8D, aux cleared.
    pub fn gen_set_flags_logic(&mut self, size: OperandSize) {
        self.gen_store_res(size);
        self.e.mov_mi(Width::B32, Mem::ctx(off_lazy_aux()), 0);
    }

    /// Flags with explicit CF/OF (shifts): CF in ESI (bit 0), the
    /// result's sign bit in EDX (bit 0), result in R8D. The aux
    /// encoding is `cf << 31 | (of ^ cf) << 30`; the shift recipes
    /// arrange for `of ^ cf` to be the value left in EDX.
    pub fn gen_set_flags_cf_ofxor(&mut self, size: OperandSize) {
        self.e.shift_ri(Shift::Shl, Width::B32, Reg::Rsi, 31);
        self.e.shift_ri(Shift::Shl, Width::B32, Reg::Rdx, 30);
        self.e.alu_rr(Alu::Or, Width::B32, Reg::Rdx, Reg::Rsi);
        self.gen_store_res(size);
        self.e
            .mov_mr(Width::B32, Mem::ctx(off_lazy_aux()), Reg::Rdx);
    }

    // -- Readers. Each leaves the named flag in `dst`; the value
    // is zero/non-zero unless stated otherwise. --

    /// CF into `dst` as bit 31.
    pub fn gen_ld_cf(&mut self, dst: Reg) {
        self.e.mov_rm(Width::B32, dst, Mem::ctx(off_lazy_aux()));
        self.e.alu_ri(Alu::And, Width::B32, dst, 0x8000_0000);
    }

    /// ZF source into `dst`: zero iff ZF is set.
    pub fn gen_ld_zf(&mut self, dst: Reg) {
        self.e.mov_rm(Width::B32, dst, Mem::ctx(off_lazy_res()));
    }

    /// SF into `dst` as 0/1 (clobbers `tmp`).
    pub fn gen_ld_sf(&mut self, dst: Reg, tmp: Reg) {
        self.e.mov_rm(Width::B32, dst, Mem::ctx(off_lazy_res()));
        self.e.shift_ri(Shift::Shr, Width::B32, dst, 31);
        self.e.mov_rm(Width::B32, tmp, Mem::ctx(off_lazy_aux()));
        self.e.alu_ri(Alu::And, Width::B32, tmp, 1);
        self.e.alu_rr(Alu::Xor, Width::B32, dst, tmp);
    }

    /// OF into `dst` as bit 31 (clobbers `tmp`).
    pub fn gen_ld_of(&mut self, dst: Reg, tmp: Reg) {
        self.e.mov_rm(Width::B32, tmp, Mem::ctx(off_lazy_aux()));
        self.e.lea(Width::B32, dst, Mem::base_index(tmp, tmp, 0));
        self.e.alu_rr(Alu::Xor, Width::B32, dst, tmp);
        self.e.alu_ri(Alu::And, Width::B32, dst, 0x8000_0000);
    }

    /// AF into `dst` as bit 3. No current recipe consumes AF
    /// directly (the BCD adjust instructions are outside the
    /// inventory), but the reader belongs to the flag API.
    #[allow(dead_code)]
    pub fn gen_ld_af(&mut self, dst: Reg) {
        self.e.mov_rm(Width::B32, dst, Mem::ctx(off_lazy_aux()));
        self.e.alu_ri(Alu::And, Width::B32, dst, 8);
    }

    /// PF into `dst` as 0/1 via the context parity table
    /// (clobbers EAX/EDX).
    pub fn gen_ld_pf(&mut self, dst: Reg) {
        self.e
            .mov_rm(Width::B32, Reg::Rax, Mem::ctx(off_lazy_res()));
        self.e
            .mov_rm(Width::B32, Reg::Rdx, Mem::ctx(off_lazy_aux()));
        self.e.shift_ri(Shift::Shr, Width::B32, Reg::Rdx, 8);
        self.e.alu_rr(Alu::Xor, Width::B32, Reg::Rax, Reg::Rdx);
        self.e.movzx_rr(Width::B32, Reg::Rax, Width::B8, Reg::Rax);
        self.e.movzx_rm(
            Width::B32,
            dst,
            Width::B8,
            Mem::base_index_disp(dbt86_backend::regs::CTX_REG, Reg::Rax, 0, off_parity()),
        );
    }

    /// SF xor OF into `dst` as 0/1 (the signed-less-than source;
    /// clobbers EAX/EDX/ECX).
    pub fn gen_ld_sf_xor_of(&mut self, dst: Reg) {
        self.gen_ld_of(Reg::Rax, Reg::Rdx);
        self.e.shift_ri(Shift::Shr, Width::B32, Reg::Rax, 31);
        self.gen_ld_sf(Reg::Rdx, Reg::Rcx);
        self.e.alu_rr(Alu::Xor, Width::B32, Reg::Rax, Reg::Rdx);
        if dst != Reg::Rax {
            self.e.mov_rr(Width::B32, dst, Reg::Rax);
        }
    }

    /// Select `init`/`alt` into R9D on the guest condition `cc`
    /// (Jcc/SETcc nibble). R10D is clobbered as the alternate
    /// value; term computation clobbers EAX/EDX/ECX/ESI.
    pub fn gen_cc_select(&mut self, cc: u8, init: u32, alt: u32) {
        self.e.mov_ri32(Reg::R9, init);
        self.e.mov_ri32(Reg::R10, alt);

        // Terms of the condition; the select moves to `alt` when a
        // term fires. Odd condition codes are the negations, which
        // the init/alt swap in the caller handles.
        match cc >> 1 {
            // O: OF != 0
            0 => {
                self.gen_ld_of(Reg::Rax, Reg::Rdx);
                self.e.test_rr(Width::B32, Reg::Rax, Reg::Rax);
                self.e.cmov_rr(Cc::Ne, Width::B32, Reg::R9, Reg::R10);
            }
            // B: CF != 0
            1 => {
                self.gen_ld_cf(Reg::Rax);
                self.e.test_rr(Width::B32, Reg::Rax, Reg::Rax);
                self.e.cmov_rr(Cc::Ne, Width::B32, Reg::R9, Reg::R10);
            }
            // E: ZF
            2 => {
                self.gen_ld_zf(Reg::Rax);
                self.e.test_rr(Width::B32, Reg::Rax, Reg::Rax);
                self.e.cmov_rr(Cc::E, Width::B32, Reg::R9, Reg::R10);
            }
            // BE: CF | ZF
            3 => {
                self.gen_ld_cf(Reg::Rax);
                self.e.test_rr(Width::B32, Reg::Rax, Reg::Rax);
                self.e.cmov_rr(Cc::Ne, Width::B32, Reg::R9, Reg::R10);
                self.gen_ld_zf(Reg::Rax);
                self.e.test_rr(Width::B32, Reg::Rax, Reg::Rax);
                self.e.cmov_rr(Cc::E, Width::B32, Reg::R9, Reg::R10);
            }
            // S: SF
            4 => {
                self.gen_ld_sf(Reg::Rax, Reg::Rdx);
                self.e.test_rr(Width::B32, Reg::Rax, Reg::Rax);
                self.e.cmov_rr(Cc::Ne, Width::B32, Reg::R9, Reg::R10);
            }
            // P: PF
            5 => {
                self.gen_ld_pf(Reg::Rcx);
                self.e.test_rr(Width::B32, Reg::Rcx, Reg::Rcx);
                self.e.cmov_rr(Cc::Ne, Width::B32, Reg::R9, Reg::R10);
            }
            // L: SF != OF
            6 => {
                self.gen_ld_sf_xor_of(Reg::Rax);
                self.e.test_rr(Width::B32, Reg::Rax, Reg::Rax);
                self.e.cmov_rr(Cc::Ne, Width::B32, Reg::R9, Reg::R10);
            }
            // LE: ZF | (SF != OF)
            _ => {
                self.gen_ld_zf(Reg::Rax);
                self.e.test_rr(Width::B32, Reg::Rax, Reg::Rax);
                self.e.cmov_rr(Cc::E, Width::B32, Reg::R9, Reg::R10);
                self.gen_ld_sf_xor_of(Reg::Rax);
                self.e.test_rr(Width::B32, Reg::Rax, Reg::Rax);
                self.e.cmov_rr(Cc::Ne, Width::B32, Reg::R9, Reg::R10);
            }
        }
    }
}

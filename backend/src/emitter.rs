//! Host x86-64 instruction emitter.
//!
//! The translator drives this through a fixed primitive set: sized
//! moves, the ALU family, compares, conditional moves, label-based
//! branches, absolute calls and the block prologue/epilogue/tail
//! sequences. Bytes are appended to an internal buffer as each
//! primitive is emitted; label forward references and the prologue
//! frame immediate are resolved by [`Emitter::finalize`], which
//! flattens the session into a relocatable byte vector (everything
//! emitted is position-independent except absolute `movabs`
//! immediates, so installation is a plain copy).

use thiserror::Error;

use crate::regs::{Reg, CTX_HOME_OFF, CTX_REG, FRAME_SIZE, SAVED_REG};

/// Operand widths of emitted host instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    B8,
    B16,
    B32,
    B64,
}

/// Host condition codes (x86 `cc` nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cc {
    pub const fn invert(self) -> Cc {
        // Flipping the low bit inverts every x86 condition.
        match self as u8 ^ 1 {
            0x0 => Cc::O,
            0x1 => Cc::No,
            0x2 => Cc::B,
            0x3 => Cc::Ae,
            0x4 => Cc::E,
            0x5 => Cc::Ne,
            0x6 => Cc::Be,
            0x7 => Cc::A,
            0x8 => Cc::S,
            0x9 => Cc::Ns,
            0xA => Cc::P,
            0xB => Cc::Np,
            0xC => Cc::L,
            0xD => Cc::Ge,
            0xE => Cc::Le,
            _ => Cc::G,
        }
    }
}

/// ALU operation selector; the value is both the one-byte opcode
/// base and the group-1 `/r` extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alu {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl Alu {
    const fn base(self) -> u8 {
        match self {
            Alu::Add => 0x00,
            Alu::Or => 0x08,
            Alu::And => 0x20,
            Alu::Sub => 0x28,
            Alu::Xor => 0x30,
            Alu::Cmp => 0x38,
        }
    }

    const fn ext(self) -> u8 {
        match self {
            Alu::Add => 0,
            Alu::Or => 1,
            Alu::And => 4,
            Alu::Sub => 5,
            Alu::Xor => 6,
            Alu::Cmp => 7,
        }
    }
}

/// Shift operation selector (group-2 `/r` extension).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    Shl,
    Shr,
    Sar,
}

impl Shift {
    const fn ext(self) -> u8 {
        match self {
            Shift::Shl => 4,
            Shift::Shr => 5,
            Shift::Sar => 7,
        }
    }
}

/// A host memory operand: `[base + index*scale + disp]` and the
/// degenerate forms. `scale` is log2.
#[derive(Debug, Clone, Copy)]
pub struct Mem {
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: i32,
}

impl Mem {
    pub const fn base(base: Reg) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 0,
            disp: 0,
        }
    }

    pub const fn base_disp(base: Reg, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 0,
            disp,
        }
    }

    pub const fn base_index(base: Reg, index: Reg, scale: u8) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            disp: 0,
        }
    }

    pub const fn base_index_disp(base: Reg, index: Reg, scale: u8, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            disp,
        }
    }

    pub const fn disp_index(disp: i32, index: Reg, scale: u8) -> Self {
        Self {
            base: None,
            index: Some(index),
            scale,
            disp,
        }
    }

    /// `[rdi + disp]` — a guest-context field.
    pub const fn ctx(disp: i32) -> Self {
        Self::base_disp(CTX_REG, disp)
    }

    /// `[rsp + disp]` — a frame slot.
    pub const fn frame(disp: i32) -> Self {
        Self::base_disp(Reg::Rsp, disp)
    }
}

/// Branch-target label supporting forward references; uses are
/// back-patched at finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelId(u32);

#[derive(Debug, Default)]
struct Label {
    bound: Option<usize>,
    /// Offsets of rel32 displacement fields referring here.
    uses: Vec<usize>,
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("finalized block has no code")]
    ZeroSize,
    #[error("label {0} used but never bound")]
    UnresolvedLabel(u32),
    #[error("branch displacement out of range")]
    DispOverflow,
}

/// One emission session; produces the body of a single translated
/// block.
pub struct Emitter {
    buf: Vec<u8>,
    labels: Vec<Label>,
    /// Offset of the prologue's frame-size imm32, patched at
    /// finalize.
    frame_patch: Option<usize>,
}

impl Emitter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(512),
            labels: Vec::new(),
            frame_patch: None,
        }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    // -- Raw byte plumbing --

    #[inline]
    fn db(&mut self, b: u8) {
        self.buf.push(b);
    }

    #[inline]
    fn dw(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn dd(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn dq(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit prefixes for an instruction with register field `reg`
    /// and r/m register `rm`.
    fn prefix_rr(&mut self, w: Width, reg: Reg, rm: Reg) {
        if w == Width::B16 {
            self.db(0x66);
        }
        let mut rex = 0u8;
        if w == Width::B64 {
            rex |= 0x48;
        }
        if reg.is_ext() {
            rex |= 0x44;
        }
        if rm.is_ext() {
            rex |= 0x41;
        }
        // SPL/BPL/SIL/DIL need a REX to avoid the AH..BH bank.
        if w == Width::B8 && ((reg as u8) >= 4 || (rm as u8) >= 4) {
            rex |= 0x40;
        }
        if rex != 0 {
            self.db(rex);
        }
    }

    fn prefix_rm(&mut self, w: Width, reg: Reg, mem: &Mem) {
        if w == Width::B16 {
            self.db(0x66);
        }
        let mut rex = 0u8;
        if w == Width::B64 {
            rex |= 0x48;
        }
        if reg.is_ext() {
            rex |= 0x44;
        }
        if mem.index.is_some_and(|r| r.is_ext()) {
            rex |= 0x42;
        }
        if mem.base.is_some_and(|r| r.is_ext()) {
            rex |= 0x41;
        }
        if w == Width::B8 && (reg as u8) >= 4 {
            rex |= 0x40;
        }
        if rex != 0 {
            self.db(rex);
        }
    }

    /// ModRM + SIB + displacement for `reg_field` against `mem`.
    fn modrm_mem(&mut self, reg_field: u8, mem: &Mem) {
        let reg = (reg_field & 7) << 3;
        match mem.base {
            None => {
                // No base: SIB with base=101, mod=00, disp32.
                let index = match mem.index {
                    Some(r) => {
                        debug_assert!(r != Reg::Rsp, "rsp cannot index");
                        r.low3()
                    }
                    None => 4,
                };
                self.db(reg | 4);
                self.db((mem.scale << 6) | (index << 3) | 5);
                self.dd(mem.disp as u32);
            }
            Some(base) => {
                let need_sib = mem.index.is_some() || base.low3() == 4;
                // RBP/R13 as base cannot use the disp-less form.
                let (md, disp_bytes) = if mem.disp == 0 && base.low3() != 5 {
                    (0u8, 0)
                } else if (-128..=127).contains(&mem.disp) {
                    (0x40u8, 1)
                } else {
                    (0x80u8, 4)
                };
                if need_sib {
                    let index = match mem.index {
                        Some(r) => {
                            debug_assert!(r != Reg::Rsp, "rsp cannot index");
                            r.low3()
                        }
                        None => 4,
                    };
                    self.db(md | reg | 4);
                    self.db((mem.scale << 6) | (index << 3) | base.low3());
                } else {
                    self.db(md | reg | base.low3());
                }
                match disp_bytes {
                    1 => self.db(mem.disp as i8 as u8),
                    4 => self.dd(mem.disp as u32),
                    _ => {}
                }
            }
        }
    }

    /// Width-selected one-byte opcode: `op8` for B8, `op8+1`
    /// otherwise.
    #[inline]
    fn opc(&mut self, w: Width, op8: u8) {
        self.db(if w == Width::B8 { op8 } else { op8 + 1 });
    }

    // -- Moves --

    /// `mov dst, src` (register to register).
    pub fn mov_rr(&mut self, w: Width, dst: Reg, src: Reg) {
        self.prefix_rr(w, src, dst);
        self.opc(w, 0x88); // MOV r/m, r
        self.db(0xC0 | (src.low3() << 3) | dst.low3());
    }

    /// `mov dst, [mem]`.
    pub fn mov_rm(&mut self, w: Width, dst: Reg, mem: Mem) {
        self.prefix_rm(w, dst, &mem);
        self.opc(w, 0x8A); // MOV r, r/m
        self.modrm_mem(dst.low3(), &mem);
    }

    /// `mov [mem], src`.
    pub fn mov_mr(&mut self, w: Width, mem: Mem, src: Reg) {
        self.prefix_rm(w, src, &mem);
        self.opc(w, 0x88); // MOV r/m, r
        self.modrm_mem(src.low3(), &mem);
    }

    /// `mov [mem], imm` (immediate truncated to the width).
    pub fn mov_mi(&mut self, w: Width, mem: Mem, imm: u32) {
        self.prefix_rm(w, Reg::Rax, &mem);
        self.opc(w, 0xC6); // MOV r/m, imm
        self.modrm_mem(0, &mem);
        match w {
            Width::B8 => self.db(imm as u8),
            Width::B16 => self.dw(imm as u16),
            _ => self.dd(imm),
        }
    }

    /// `mov dst, imm32` (32-bit destination, zero-extends).
    pub fn mov_ri32(&mut self, dst: Reg, imm: u32) {
        if imm == 0 {
            self.xor_rr32(dst, dst);
            return;
        }
        self.prefix_rr(Width::B32, Reg::Rax, dst);
        self.db(0xB8 + dst.low3());
        self.dd(imm);
    }

    /// `mov dst, imm64` — movabs, or the shorter zero/sign forms
    /// when the value allows.
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) {
        if imm == 0 {
            self.xor_rr32(dst, dst);
        } else if imm <= u32::MAX as u64 {
            self.mov_ri32(dst, imm as u32);
        } else {
            let mut rex = 0x48u8;
            if dst.is_ext() {
                rex |= 0x01;
            }
            self.db(rex);
            self.db(0xB8 + dst.low3());
            self.dq(imm);
        }
    }

    fn xor_rr32(&mut self, dst: Reg, src: Reg) {
        self.prefix_rr(Width::B32, src, dst);
        self.db(0x31);
        self.db(0xC0 | (src.low3() << 3) | dst.low3());
    }

    // -- Widening moves --

    /// `movzx dst32/64, src8/16`.
    pub fn movzx_rr(&mut self, dst_w: Width, dst: Reg, src_w: Width, src: Reg) {
        debug_assert!(matches!(src_w, Width::B8 | Width::B16));
        self.prefix_widen_rr(dst_w, dst, src_w, src);
        self.db(0x0F);
        self.db(if src_w == Width::B8 { 0xB6 } else { 0xB7 });
        self.db(0xC0 | (dst.low3() << 3) | src.low3());
    }

    /// Prefix for widening register moves: the *byte source*, not
    /// the instruction width, decides whether a bare REX is needed
    /// for SPL/BPL/SIL/DIL.
    fn prefix_widen_rr(&mut self, dst_w: Width, dst: Reg, src_w: Width, src: Reg) {
        let mut rex = 0u8;
        if dst_w == Width::B64 {
            rex |= 0x48;
        }
        if dst.is_ext() {
            rex |= 0x44;
        }
        if src.is_ext() {
            rex |= 0x41;
        }
        if src_w == Width::B8 && (src as u8) >= 4 {
            rex |= 0x40;
        }
        if rex != 0 {
            self.db(rex);
        }
    }

    /// `movzx dst, byte/word [mem]`.
    pub fn movzx_rm(&mut self, dst_w: Width, dst: Reg, src_w: Width, mem: Mem) {
        debug_assert!(matches!(src_w, Width::B8 | Width::B16));
        self.prefix_rm(widen_prefix(dst_w, src_w), dst, &mem);
        self.db(0x0F);
        self.db(if src_w == Width::B8 { 0xB6 } else { 0xB7 });
        self.modrm_mem(dst.low3(), &mem);
    }

    /// `movsx dst32/64, src8/16`.
    pub fn movsx_rr(&mut self, dst_w: Width, dst: Reg, src_w: Width, src: Reg) {
        debug_assert!(matches!(src_w, Width::B8 | Width::B16));
        self.prefix_widen_rr(dst_w, dst, src_w, src);
        self.db(0x0F);
        self.db(if src_w == Width::B8 { 0xBE } else { 0xBF });
        self.db(0xC0 | (dst.low3() << 3) | src.low3());
    }

    /// `movsx dst, byte/word [mem]`.
    pub fn movsx_rm(&mut self, dst_w: Width, dst: Reg, src_w: Width, mem: Mem) {
        debug_assert!(matches!(src_w, Width::B8 | Width::B16));
        self.prefix_rm(widen_prefix(dst_w, src_w), dst, &mem);
        self.db(0x0F);
        self.db(if src_w == Width::B8 { 0xBE } else { 0xBF });
        self.modrm_mem(dst.low3(), &mem);
    }

    /// `lea dst, [mem]` — address arithmetic without flags. A
    /// 32-bit destination gives 32-bit wraparound for free.
    pub fn lea(&mut self, w: Width, dst: Reg, mem: Mem) {
        debug_assert!(matches!(w, Width::B32 | Width::B64));
        self.prefix_rm(w, dst, &mem);
        self.db(0x8D);
        self.modrm_mem(dst.low3(), &mem);
    }

    // -- ALU --

    /// `op dst, src` (register forms).
    pub fn alu_rr(&mut self, op: Alu, w: Width, dst: Reg, src: Reg) {
        self.prefix_rr(w, src, dst);
        self.opc(w, op.base()); // op r/m, r
        self.db(0xC0 | (src.low3() << 3) | dst.low3());
    }

    /// `op dst, [mem]`.
    pub fn alu_rm(&mut self, op: Alu, w: Width, dst: Reg, mem: Mem) {
        self.prefix_rm(w, dst, &mem);
        self.opc(w, op.base() + 2); // op r, r/m
        self.modrm_mem(dst.low3(), &mem);
    }

    /// `op [mem], src`.
    pub fn alu_mr(&mut self, op: Alu, w: Width, mem: Mem, src: Reg) {
        self.prefix_rm(w, src, &mem);
        self.opc(w, op.base()); // op r/m, r
        self.modrm_mem(src.low3(), &mem);
    }

    /// `op dst, imm`.
    pub fn alu_ri(&mut self, op: Alu, w: Width, dst: Reg, imm: u32) {
        self.prefix_rr(w, Reg::Rax, dst);
        if w != Width::B8 && (imm as i32) >= -128 && (imm as i32) <= 127 {
            self.db(0x83); // group 1, imm8 sign-extended
            self.db(0xC0 | (op.ext() << 3) | dst.low3());
            self.db(imm as u8);
            return;
        }
        self.opc(w, 0x80); // group 1, full immediate
        self.db(0xC0 | (op.ext() << 3) | dst.low3());
        match w {
            Width::B8 => self.db(imm as u8),
            Width::B16 => self.dw(imm as u16),
            _ => self.dd(imm),
        }
    }

    /// `op [mem], imm`.
    pub fn alu_mi(&mut self, op: Alu, w: Width, mem: Mem, imm: u32) {
        self.prefix_rm(w, Reg::Rax, &mem);
        if w != Width::B8 && (imm as i32) >= -128 && (imm as i32) <= 127 {
            self.db(0x83);
            self.modrm_mem(op.ext(), &mem);
            self.db(imm as u8);
            return;
        }
        self.opc(w, 0x80);
        self.modrm_mem(op.ext(), &mem);
        match w {
            Width::B8 => self.db(imm as u8),
            Width::B16 => self.dw(imm as u16),
            _ => self.dd(imm),
        }
    }

    /// `test a, b` (register form; AND without a destination).
    pub fn test_rr(&mut self, w: Width, a: Reg, b: Reg) {
        self.prefix_rr(w, b, a);
        self.opc(w, 0x84);
        self.db(0xC0 | (b.low3() << 3) | a.low3());
    }

    /// `test reg, imm`.
    pub fn test_ri(&mut self, w: Width, reg: Reg, imm: u32) {
        self.prefix_rr(w, Reg::Rax, reg);
        self.opc(w, 0xF6); // group 3 /0
        self.db(0xC0 | reg.low3());
        match w {
            Width::B8 => self.db(imm as u8),
            Width::B16 => self.dw(imm as u16),
            _ => self.dd(imm),
        }
    }

    /// `not reg`.
    pub fn not_r(&mut self, w: Width, reg: Reg) {
        self.prefix_rr(w, Reg::Rax, reg);
        self.opc(w, 0xF6); // group 3 /2
        self.db(0xC0 | (2 << 3) | reg.low3());
    }

    /// `neg reg`.
    pub fn neg_r(&mut self, w: Width, reg: Reg) {
        self.prefix_rr(w, Reg::Rax, reg);
        self.opc(w, 0xF6); // group 3 /3
        self.db(0xC0 | (3 << 3) | reg.low3());
    }

    /// `shl/shr/sar reg, imm8`.
    pub fn shift_ri(&mut self, op: Shift, w: Width, reg: Reg, count: u8) {
        self.prefix_rr(w, Reg::Rax, reg);
        if count == 1 {
            self.opc(w, 0xD0); // group 2, count 1
            self.db(0xC0 | (op.ext() << 3) | reg.low3());
        } else {
            self.opc(w, 0xC0); // group 2, imm8
            self.db(0xC0 | (op.ext() << 3) | reg.low3());
            self.db(count);
        }
    }

    /// `shl/shr/sar reg, cl`.
    pub fn shift_cl(&mut self, op: Shift, w: Width, reg: Reg) {
        self.prefix_rr(w, Reg::Rax, reg);
        self.opc(w, 0xD2); // group 2, CL
        self.db(0xC0 | (op.ext() << 3) | reg.low3());
    }

    /// `cmovcc dst, src` (32/64-bit only).
    pub fn cmov_rr(&mut self, cc: Cc, w: Width, dst: Reg, src: Reg) {
        debug_assert!(matches!(w, Width::B32 | Width::B64));
        self.prefix_rr(w, dst, src);
        self.db(0x0F);
        self.db(0x40 + cc as u8);
        self.db(0xC0 | (dst.low3() << 3) | src.low3());
    }

    // -- Labels and branches --

    pub fn new_label(&mut self) -> LabelId {
        let id = self.labels.len() as u32;
        self.labels.push(Label::default());
        LabelId(id)
    }

    /// Place a label at the current offset, resolving nothing yet;
    /// all fixups happen at finalize.
    pub fn bind(&mut self, label: LabelId) {
        let l = &mut self.labels[label.0 as usize];
        debug_assert!(l.bound.is_none(), "label bound twice");
        l.bound = Some(self.buf.len());
    }

    /// `jmp label` (rel32).
    pub fn jmp(&mut self, label: LabelId) {
        self.db(0xE9);
        let at = self.buf.len();
        self.dd(0);
        self.labels[label.0 as usize].uses.push(at);
    }

    /// `jcc label` (rel32).
    pub fn jcc(&mut self, cc: Cc, label: LabelId) {
        self.db(0x0F);
        self.db(0x80 + cc as u8);
        let at = self.buf.len();
        self.dd(0);
        self.labels[label.0 as usize].uses.push(at);
    }

    /// `jmp reg` (indirect).
    pub fn jmp_r(&mut self, reg: Reg) {
        if reg.is_ext() {
            self.db(0x41);
        }
        self.db(0xFF);
        self.db(0xE0 | reg.low3()); // /4
    }

    /// `call reg` (indirect).
    pub fn call_r(&mut self, reg: Reg) {
        if reg.is_ext() {
            self.db(0x41);
        }
        self.db(0xFF);
        self.db(0xD0 | reg.low3()); // /2
    }

    /// Call an absolute 64-bit address through RAX.
    pub fn call_abs(&mut self, target: u64) {
        self.mov_ri64(Reg::Rax, target);
        self.call_r(Reg::Rax);
    }

    pub fn ret(&mut self) {
        self.db(0xC3);
    }

    // -- Prologue / epilogue / tail sequences --

    fn push_r(&mut self, reg: Reg) {
        if reg.is_ext() {
            self.db(0x41);
        }
        self.db(0x50 + reg.low3());
    }

    fn pop_r(&mut self, reg: Reg) {
        if reg.is_ext() {
            self.db(0x41);
        }
        self.db(0x58 + reg.low3());
    }

    /// Block prologue: save RBX, open the frame (imm32 patched at
    /// finalize with the final size), stash the context pointer in
    /// its home slot.
    pub fn gen_prologue(&mut self) {
        self.push_r(SAVED_REG);
        // Always the imm32 SUB form so the patch slot has a fixed
        // shape.
        self.db(0x48);
        self.db(0x81);
        self.db(0xEC);
        self.frame_patch = Some(self.buf.len());
        self.dd(0);
        self.mov_mr(Width::B64, Mem::frame(CTX_HOME_OFF), CTX_REG);
    }

    fn gen_frame_teardown(&mut self) {
        // add rsp, imm32
        self.db(0x48);
        self.db(0x81);
        self.db(0xC4);
        self.dd(FRAME_SIZE as u32);
        self.pop_r(SAVED_REG);
    }

    /// Return to the dispatcher with whatever RAX holds.
    pub fn gen_epilogue_ret(&mut self) {
        self.gen_frame_teardown();
        self.ret();
    }

    /// Tear the frame down and jump to the code address in `reg` —
    /// the chain/trampoline transfer.
    pub fn gen_tail_call(&mut self, reg: Reg) {
        self.gen_frame_teardown();
        self.jmp_r(reg);
    }

    /// Reload the context register from its home slot (required
    /// after every helper call).
    pub fn reload_ctx(&mut self) {
        self.mov_rm(Width::B64, CTX_REG, Mem::frame(CTX_HOME_OFF));
    }

    // -- Finalize --

    /// Resolve labels and the frame patch; yield the flattened
    /// position-independent code bytes.
    pub fn finalize(mut self) -> Result<Vec<u8>, EmitError> {
        if self.buf.is_empty() {
            return Err(EmitError::ZeroSize);
        }
        if let Some(at) = self.frame_patch {
            self.buf[at..at + 4]
                .copy_from_slice(&(FRAME_SIZE as u32).to_le_bytes());
        }
        for (id, label) in self.labels.iter().enumerate() {
            if label.uses.is_empty() {
                continue;
            }
            let target = label
                .bound
                .ok_or(EmitError::UnresolvedLabel(id as u32))?;
            for &at in &label.uses {
                let disp = target as i64 - (at as i64 + 4);
                if disp < i32::MIN as i64 || disp > i32::MAX as i64 {
                    return Err(EmitError::DispOverflow);
                }
                self.buf[at..at + 4]
                    .copy_from_slice(&(disp as i32).to_le_bytes());
            }
        }
        Ok(self.buf)
    }

    /// Flattened size so far (labels unresolved); used for
    /// allocation estimates.
    pub fn code_size(&self) -> usize {
        self.buf.len()
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Widening moves encode the *source* width in the opcode and the
/// destination width in the prefix; 16-bit sources still use the
/// 32-bit-destination form.
fn widen_prefix(dst_w: Width, _src_w: Width) -> Width {
    match dst_w {
        Width::B64 => Width::B64,
        _ => Width::B32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(f: impl FnOnce(&mut Emitter)) -> Vec<u8> {
        let mut e = Emitter::new();
        f(&mut e);
        e.finalize().unwrap()
    }

    #[test]
    fn mov_rr_forms() {
        // mov rax, rdi  (REX.W 89 /r)
        assert_eq!(
            bytes(|e| e.mov_rr(Width::B64, Reg::Rax, Reg::Rdi)),
            [0x48, 0x89, 0xF8]
        );
        // mov eax, edx
        assert_eq!(
            bytes(|e| e.mov_rr(Width::B32, Reg::Rax, Reg::Rdx)),
            [0x89, 0xD0]
        );
        // mov r8d, eax
        assert_eq!(
            bytes(|e| e.mov_rr(Width::B32, Reg::R8, Reg::Rax)),
            [0x41, 0x89, 0xC0]
        );
    }

    #[test]
    fn mov_mem_forms() {
        // mov eax, [rdi + 0x20]
        assert_eq!(
            bytes(|e| e.mov_rm(Width::B32, Reg::Rax, Mem::base_disp(Reg::Rdi, 0x20))),
            [0x8B, 0x47, 0x20]
        );
        // mov [rdi], edx  (disp 0, base not rbp: no disp byte)
        assert_eq!(
            bytes(|e| e.mov_mr(Width::B32, Mem::base(Reg::Rdi), Reg::Rdx)),
            [0x89, 0x17]
        );
        // mov [rsp + 0x20], rdi — rsp base forces a SIB
        assert_eq!(
            bytes(|e| e.mov_mr(Width::B64, Mem::frame(0x20), Reg::Rdi)),
            [0x48, 0x89, 0x7C, 0x24, 0x20]
        );
        // mov dl, [rbp] — rbp base forces disp8 = 0
        assert_eq!(
            bytes(|e| e.mov_rm(Width::B8, Reg::Rdx, Mem::base(Reg::Rbp))),
            [0x8A, 0x55, 0x00]
        );
        // mov ax, [rdi + 4] — operand-size prefix
        assert_eq!(
            bytes(|e| e.mov_rm(Width::B16, Reg::Rax, Mem::base_disp(Reg::Rdi, 4))),
            [0x66, 0x8B, 0x47, 0x04]
        );
    }

    #[test]
    fn mov_sib_forms() {
        // mov eax, [rdi + rcx*4 + 0x30]
        assert_eq!(
            bytes(|e| e.mov_rm(
                Width::B32,
                Reg::Rax,
                Mem::base_index_disp(Reg::Rdi, Reg::Rcx, 2, 0x30)
            )),
            [0x8B, 0x44, 0x8F, 0x30]
        );
        // movzx eax, byte [rdx + rax]
        assert_eq!(
            bytes(|e| e.movzx_rm(
                Width::B32,
                Reg::Rax,
                Width::B8,
                Mem::base_index(Reg::Rdx, Reg::Rax, 0)
            )),
            [0x0F, 0xB6, 0x04, 0x02]
        );
    }

    #[test]
    fn mov_imm_forms() {
        // mov eax, 0x42
        assert_eq!(
            bytes(|e| e.mov_ri32(Reg::Rax, 0x42)),
            [0xB8, 0x42, 0, 0, 0]
        );
        // zero via xor
        assert_eq!(bytes(|e| e.mov_ri32(Reg::Rdx, 0)), [0x31, 0xD2]);
        // movabs rax, imm64
        assert_eq!(
            bytes(|e| e.mov_ri64(Reg::Rax, 0x1122_3344_5566_7788)),
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        // 64-bit register, value fits in 32 bits: mov r32 form
        assert_eq!(
            bytes(|e| e.mov_ri64(Reg::Rcx, 0xDEAD)),
            [0xB9, 0xAD, 0xDE, 0, 0]
        );
    }

    #[test]
    fn alu_forms() {
        // add eax, edx
        assert_eq!(
            bytes(|e| e.alu_rr(Alu::Add, Width::B32, Reg::Rax, Reg::Rdx)),
            [0x01, 0xD0]
        );
        // sub rsp-form imm8 via group 1: sub edx, 8
        assert_eq!(
            bytes(|e| e.alu_ri(Alu::Sub, Width::B32, Reg::Rdx, 8)),
            [0x83, 0xEA, 0x08]
        );
        // and eax, 0x80000000 (doesn't fit imm8)
        assert_eq!(
            bytes(|e| e.alu_ri(Alu::And, Width::B32, Reg::Rax, 0x8000_0000)),
            [0x81, 0xE0, 0x00, 0x00, 0x00, 0x80]
        );
        // cmp al, 0x55 — 8-bit accumulator still takes group 1
        assert_eq!(
            bytes(|e| e.alu_ri(Alu::Cmp, Width::B8, Reg::Rax, 0x55)),
            [0x80, 0xF8, 0x55]
        );
        // or ecx, [rdi+8]
        assert_eq!(
            bytes(|e| e.alu_rm(Alu::Or, Width::B32, Reg::Rcx, Mem::base_disp(Reg::Rdi, 8))),
            [0x0B, 0x4F, 0x08]
        );
    }

    #[test]
    fn alu_acc_imm_uses_group1_form() {
        // Deliberate: the emitter always uses group 1, never the
        // short accumulator forms; byte-for-byte stability beats
        // size here.
        assert_eq!(
            bytes(|e| e.alu_ri(Alu::Add, Width::B32, Reg::Rax, 0x1000)),
            [0x81, 0xC0, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn shifts() {
        // shl eax, 1 (D1 form)
        assert_eq!(
            bytes(|e| e.shift_ri(Shift::Shl, Width::B32, Reg::Rax, 1)),
            [0xD1, 0xE0]
        );
        // shr edx, 12
        assert_eq!(
            bytes(|e| e.shift_ri(Shift::Shr, Width::B32, Reg::Rdx, 12)),
            [0xC1, 0xEA, 0x0C]
        );
        // sar ecx, cl
        assert_eq!(
            bytes(|e| e.shift_cl(Shift::Sar, Width::B32, Reg::Rcx)),
            [0xD3, 0xF9]
        );
    }

    #[test]
    fn cmov_and_widen() {
        // cmove eax, edx
        assert_eq!(
            bytes(|e| e.cmov_rr(Cc::E, Width::B32, Reg::Rax, Reg::Rdx)),
            [0x0F, 0x44, 0xC2]
        );
        // movzx eax, dl
        assert_eq!(
            bytes(|e| e.movzx_rr(Width::B32, Reg::Rax, Width::B8, Reg::Rdx)),
            [0x0F, 0xB6, 0xC2]
        );
        // movsx eax, cx
        assert_eq!(
            bytes(|e| e.movsx_rr(Width::B32, Reg::Rax, Width::B16, Reg::Rcx)),
            [0x0F, 0xBF, 0xC1]
        );
    }

    #[test]
    fn labels_resolve_forward_and_backward() {
        let code = bytes(|e| {
            let fwd = e.new_label();
            let back = e.new_label();
            e.bind(back);
            e.jcc(Cc::E, fwd); // 6 bytes
            e.jmp(back); // 5 bytes
            e.bind(fwd);
            e.ret();
        });
        // jcc E fwd: 0F 84 disp32(5) → target 11
        assert_eq!(&code[..6], &[0x0F, 0x84, 0x05, 0x00, 0x00, 0x00]);
        // jmp back: E9 disp32(-11)
        assert_eq!(&code[6..11], &[0xE9, 0xF5, 0xFF, 0xFF, 0xFF]);
        assert_eq!(code[11], 0xC3);
    }

    #[test]
    fn unresolved_label_is_an_error() {
        let mut e = Emitter::new();
        let l = e.new_label();
        e.jmp(l);
        assert!(matches!(e.finalize(), Err(EmitError::UnresolvedLabel(0))));
    }

    #[test]
    fn prologue_frame_is_patched() {
        let mut e = Emitter::new();
        e.gen_prologue();
        e.gen_epilogue_ret();
        let code = e.finalize().unwrap();
        // push rbx; sub rsp, imm32
        assert_eq!(&code[..3], &[0x53, 0x48, 0x81]);
        assert_eq!(code[3], 0xEC);
        let frame = u32::from_le_bytes(code[4..8].try_into().unwrap());
        assert_eq!(frame as usize, FRAME_SIZE);
        assert_eq!(frame as usize % 16, 0);
    }

    #[test]
    fn call_and_tail() {
        // call through rax
        assert_eq!(
            bytes(|e| e.call_r(Reg::Rax)),
            [0xFF, 0xD0]
        );
        // indirect jmp r11
        assert_eq!(bytes(|e| e.jmp_r(Reg::R11)), [0x41, 0xFF, 0xE3]);
    }
}

//! Table-style x86 instruction decoder.
//!
//! Produces the normalized [`DecodedInstr`] the translator recipes
//! consume: mnemonic, dst/src operands, resolved operand and
//! address size, ModRM memory shape and immediates. Only the
//! opcode inventory the translator has recipes for is accepted;
//! anything else comes back as [`DecodeError::Unknown`] and is
//! surfaced to the embedder as a fatal `unknown_instr` status.

use crate::exceptions::Exception;
use crate::insn::*;
use crate::x86::*;

/// Why decoding stopped.
#[derive(Debug)]
pub enum DecodeError {
    /// Instruction fetch faulted (page fault): the translator
    /// emits the staged raise as the block's sole operation.
    Fault(Exception),
    /// No recipe for this opcode.
    Unknown { opcode: u8 },
}

/// Byte source for the decoder: returns the next code byte or the
/// fetch fault.
pub trait CodeFetcher {
    fn next_byte(&mut self) -> Result<u8, Exception>;
}

impl<F: FnMut() -> Result<u8, Exception>> CodeFetcher for F {
    fn next_byte(&mut self) -> Result<u8, Exception> {
        self()
    }
}

struct Reader<'a, F: CodeFetcher> {
    fetch: &'a mut F,
    len: u32,
}

impl<'a, F: CodeFetcher> Reader<'a, F> {
    fn read8(&mut self) -> Result<u8, DecodeError> {
        let b = self.fetch.next_byte().map_err(DecodeError::Fault)?;
        self.len += 1;
        Ok(b)
    }

    fn read16(&mut self) -> Result<u16, DecodeError> {
        let lo = self.read8()? as u16;
        let hi = self.read8()? as u16;
        Ok(lo | (hi << 8))
    }

    fn read32(&mut self) -> Result<u32, DecodeError> {
        let lo = self.read16()? as u32;
        let hi = self.read16()? as u32;
        Ok(lo | (hi << 16))
    }

    /// Immediate of the instruction's operand size, sign-extended.
    fn read_imm(&mut self, size: OperandSize) -> Result<i64, DecodeError> {
        Ok(match size {
            OperandSize::S8 => self.read8()? as i8 as i64,
            OperandSize::S16 => self.read16()? as i16 as i64,
            OperandSize::S32 => self.read32()? as i32 as i64,
        })
    }
}

/// Decoded ModRM r/m side.
enum Rm {
    Reg(u8),
    Mem,
}

/// Decode one instruction at `eip`. `cs32` selects the default
/// operand/address size (the CS.D/B bit).
pub fn decode<F: CodeFetcher>(
    fetch: &mut F,
    eip: u32,
    cs32: bool,
) -> Result<DecodedInstr, DecodeError> {
    let mut r = Reader { fetch, len: 0 };
    let mut instr = DecodedInstr::new(eip);

    // -- Prefixes --
    let mut op_size_override = false;
    let mut addr_size_override = false;
    let mut seg_override: Option<usize> = None;
    let opcode = loop {
        let b = r.read8()?;
        match b {
            0x66 => op_size_override = true,
            0x67 => addr_size_override = true,
            0x26 => seg_override = Some(SEG_ES),
            0x2E => seg_override = Some(SEG_CS),
            0x36 => seg_override = Some(SEG_SS),
            0x3E => seg_override = Some(SEG_DS),
            0x64 => seg_override = Some(SEG_FS),
            0x65 => seg_override = Some(SEG_GS),
            0xF0 | 0xF2 | 0xF3 => {
                // LOCK/REPNE/REP gate string and atomic forms the
                // recipe set does not include.
                return Err(DecodeError::Unknown { opcode: b });
            }
            _ => break b,
        }
    };

    instr.op_size = if cs32 ^ op_size_override {
        OperandSize::S32
    } else {
        OperandSize::S16
    };
    instr.addr_size = if cs32 ^ addr_size_override {
        AddrSize::A32
    } else {
        AddrSize::A16
    };
    instr.mem.seg = SEG_DS;

    let mut d = Decoder {
        r,
        instr,
        seg_override,
    };
    d.dispatch(opcode)?;

    let mut instr = d.instr;
    instr.len = d.r.len;
    if let Some(seg) = seg_override {
        instr.mem.seg = seg;
    }
    Ok(instr)
}

struct Decoder<'a, F: CodeFetcher> {
    r: Reader<'a, F>,
    instr: DecodedInstr,
    seg_override: Option<usize>,
}

impl<'a, F: CodeFetcher> Decoder<'a, F> {
    fn dispatch(&mut self, opcode: u8) -> Result<(), DecodeError> {
        match opcode {
            // -- ALU op families: op rm,r / op r,rm / op acc,imm --
            0x00..=0x05 => self.alu_family(opcode, Opcode::Add),
            0x08..=0x0D => self.alu_family(opcode, Opcode::Or),
            0x20..=0x25 => self.alu_family(opcode, Opcode::And),
            0x28..=0x2D => self.alu_family(opcode, Opcode::Sub),
            0x30..=0x35 => self.alu_family(opcode, Opcode::Xor),
            0x38..=0x3D => self.alu_family(opcode, Opcode::Cmp),

            // -- INC/DEC/PUSH/POP r --
            0x40..=0x47 => self.one_reg(opcode, Opcode::Inc),
            0x48..=0x4F => self.one_reg(opcode, Opcode::Dec),
            0x50..=0x57 => self.one_reg(opcode, Opcode::Push),
            0x58..=0x5F => self.one_reg(opcode, Opcode::Pop),

            // -- Jcc rel8 --
            0x70..=0x7F => {
                self.instr.opcode = Opcode::Jcc(opcode & 0x0F);
                self.rel8()
            }

            // -- Group 1: op rm, imm --
            0x80 | 0x81 | 0x83 => self.group1(opcode),

            0x84 | 0x85 => {
                if opcode == 0x84 {
                    self.instr.op_size = OperandSize::S8;
                }
                self.instr.opcode = Opcode::Test;
                self.modrm_rm_reg(true)
            }

            // -- MOV --
            0x88 => self.mov_rm_r(true, true),
            0x89 => self.mov_rm_r(false, true),
            0x8A => self.mov_rm_r(true, false),
            0x8B => self.mov_rm_r(false, false),
            0x8C | 0x8E => self.mov_seg(opcode),
            0x8D => {
                self.instr.opcode = Opcode::Lea;
                let (reg, rm) = self.modrm()?;
                if !matches!(rm, Rm::Mem) {
                    return Err(DecodeError::Unknown { opcode });
                }
                self.instr.operands = [
                    Operand::Gpr(GprRef::decode(reg, self.instr.op_size)),
                    Operand::Mem,
                ];
                Ok(())
            }

            0x90 => {
                self.instr.opcode = Opcode::Nop;
                Ok(())
            }

            // -- MOV accumulator <-> moffs --
            0xA0..=0xA3 => self.mov_moffs(opcode),

            // -- MOV r, imm --
            0xB0..=0xB7 => {
                self.instr.op_size = OperandSize::S8;
                self.instr.opcode = Opcode::Mov;
                let dst = GprRef::decode(opcode & 7, OperandSize::S8);
                self.instr.imm = self.r.read8()? as i64;
                self.instr.operands = [Operand::Gpr(dst), Operand::Imm];
                Ok(())
            }
            0xB8..=0xBF => {
                self.instr.opcode = Opcode::Mov;
                let dst = GprRef::decode(opcode & 7, self.instr.op_size);
                self.instr.imm = self.r.read_imm(self.instr.op_size)?;
                self.instr.operands = [Operand::Gpr(dst), Operand::Imm];
                Ok(())
            }

            // -- Shift groups --
            0xC0 | 0xC1 => self.group2(opcode, ShiftCount::Imm8),
            0xD0 | 0xD1 => self.group2(opcode, ShiftCount::One),
            0xD2 | 0xD3 => self.group2(opcode, ShiftCount::Cl),

            0xC2 => {
                self.instr.opcode = Opcode::Ret;
                self.instr.imm = self.r.read16()? as i64;
                Ok(())
            }
            0xC3 => {
                self.instr.opcode = Opcode::Ret;
                Ok(())
            }
            0xCA => {
                self.instr.opcode = Opcode::RetFar;
                self.instr.imm = self.r.read16()? as i64;
                Ok(())
            }
            0xCB => {
                self.instr.opcode = Opcode::RetFar;
                Ok(())
            }

            0xC6 | 0xC7 => {
                if opcode == 0xC6 {
                    self.instr.op_size = OperandSize::S8;
                }
                self.instr.opcode = Opcode::Mov;
                let (reg, rm) = self.modrm()?;
                if reg != 0 {
                    return Err(DecodeError::Unknown { opcode });
                }
                let dst = self.rm_operand(rm);
                self.instr.imm = self.r.read_imm(self.instr.op_size)?;
                self.instr.operands = [dst, Operand::Imm];
                Ok(())
            }

            0xCC => {
                self.instr.opcode = Opcode::Int3;
                Ok(())
            }
            0xCD => {
                self.instr.opcode = Opcode::Int;
                self.instr.imm = self.r.read8()? as i64;
                Ok(())
            }
            0xCF => {
                self.instr.opcode = Opcode::Iret;
                Ok(())
            }

            // -- LOOPcc / JECXZ --
            0xE0 => {
                self.instr.opcode = Opcode::Loopne;
                self.rel8()
            }
            0xE1 => {
                self.instr.opcode = Opcode::Loope;
                self.rel8()
            }
            0xE2 => {
                self.instr.opcode = Opcode::Loop;
                self.rel8()
            }
            0xE3 => {
                self.instr.opcode = Opcode::Jecxz;
                self.rel8()
            }

            // -- IN/OUT --
            0xE4 | 0xE5 | 0xEC | 0xED => self.in_out(opcode, true),
            0xE6 | 0xE7 | 0xEE | 0xEF => self.in_out(opcode, false),

            0xE8 => {
                self.instr.opcode = Opcode::Call;
                self.rel_op_size()
            }
            0xE9 => {
                self.instr.opcode = Opcode::Jmp;
                self.rel_op_size()
            }
            0xEA | 0x9A => {
                self.instr.opcode = if opcode == 0xEA {
                    Opcode::JmpFar
                } else {
                    Opcode::Call
                };
                // ptr16:16/32 — offset first, selector second.
                self.instr.imm = if self.instr.op_size == OperandSize::S32 {
                    self.r.read32()? as i64
                } else {
                    self.r.read16()? as i64
                };
                self.instr.imm_sel = self.r.read16()?;
                self.instr.operands = [Operand::Far, Operand::None];
                if opcode == 0x9A {
                    self.instr.opcode = Opcode::Call;
                }
                Ok(())
            }
            0xEB => {
                self.instr.opcode = Opcode::Jmp;
                self.rel8()
            }

            0xF4 => {
                self.instr.opcode = Opcode::Hlt;
                Ok(())
            }
            0xF5 => {
                self.instr.opcode = Opcode::Cmc;
                Ok(())
            }

            0xF6 | 0xF7 => self.group3(opcode),

            0xF8 => {
                self.instr.opcode = Opcode::Clc;
                Ok(())
            }
            0xF9 => {
                self.instr.opcode = Opcode::Stc;
                Ok(())
            }
            0xFA => {
                self.instr.opcode = Opcode::Cli;
                Ok(())
            }
            0xFB => {
                self.instr.opcode = Opcode::Sti;
                Ok(())
            }
            0xFC => {
                self.instr.opcode = Opcode::Cld;
                Ok(())
            }
            0xFD => {
                self.instr.opcode = Opcode::Std;
                Ok(())
            }

            0xFE => self.group4(),
            0xFF => self.group5(),

            0x0F => self.dispatch_0f(),

            _ => Err(DecodeError::Unknown { opcode }),
        }
    }

    fn dispatch_0f(&mut self) -> Result<(), DecodeError> {
        let op2 = self.r.read8()?;
        match op2 {
            // MOV r32 <-> CRn/DRn. ModRM mod bits are ignored by
            // the hardware; the rm field is always a register.
            0x20 | 0x21 | 0x22 | 0x23 => {
                let modrm = self.r.read8()?;
                let reg = (modrm >> 3) & 7;
                let rm = modrm & 7;
                let gpr = Operand::Gpr(GprRef::new(rm as usize));
                let sys = if op2 & 1 == 0 {
                    Operand::Cr(reg as usize)
                } else {
                    Operand::Dr(reg as usize)
                };
                self.instr.op_size = OperandSize::S32;
                self.instr.opcode = if op2 & 1 == 0 {
                    Opcode::MovCr
                } else {
                    Opcode::MovDr
                };
                self.instr.operands = if op2 < 0x22 {
                    [gpr, sys] // MOV r32, CRn/DRn
                } else {
                    [sys, gpr] // MOV CRn/DRn, r32
                };
                Ok(())
            }

            // Jcc rel16/32
            0x80..=0x8F => {
                self.instr.opcode = Opcode::Jcc(op2 & 0x0F);
                self.rel_op_size()
            }

            // MOVZX/MOVSX r, rm8/rm16
            0xB6 | 0xB7 | 0xBE | 0xBF => {
                let src_size = if op2 & 1 == 0 {
                    OperandSize::S8
                } else {
                    OperandSize::S16
                };
                self.instr.opcode = if op2 < 0xBE {
                    Opcode::MovZx
                } else {
                    Opcode::MovSx
                };
                let (reg, rm) = self.modrm_at(src_size)?;
                let dst = GprRef::decode(reg, self.instr.op_size);
                let src = self.rm_operand_at(rm, src_size);
                // Source width travels in imm.
                self.instr.imm = src_size as u8 as i64;
                self.instr.operands = [Operand::Gpr(dst), src];
                Ok(())
            }

            // Group 7: LGDT/LIDT m16&32
            0x01 => {
                let (reg, rm) = self.modrm()?;
                if !matches!(rm, Rm::Mem) {
                    return Err(DecodeError::Unknown { opcode: 0x01 });
                }
                self.instr.opcode = match reg {
                    2 => Opcode::Lgdt,
                    3 => Opcode::Lidt,
                    _ => return Err(DecodeError::Unknown { opcode: 0x01 }),
                };
                self.instr.operands = [Operand::Mem, Operand::None];
                Ok(())
            }

            _ => Err(DecodeError::Unknown { opcode: op2 }),
        }
    }

    // -- Family decoders --

    /// The classic six-opcode ALU family layout.
    fn alu_family(&mut self, opcode: u8, op: Opcode) -> Result<(), DecodeError> {
        self.instr.opcode = op;
        match opcode & 7 {
            0 => {
                self.instr.op_size = OperandSize::S8;
                self.modrm_rm_reg(true)
            }
            1 => self.modrm_rm_reg(true),
            2 => {
                self.instr.op_size = OperandSize::S8;
                self.modrm_reg_rm()
            }
            3 => self.modrm_reg_rm(),
            4 => {
                self.instr.op_size = OperandSize::S8;
                self.acc_imm()
            }
            5 => self.acc_imm(),
            _ => unreachable!(),
        }
    }

    fn one_reg(&mut self, opcode: u8, op: Opcode) -> Result<(), DecodeError> {
        self.instr.opcode = op;
        let reg = GprRef::new((opcode & 7) as usize);
        self.instr.operands = [Operand::Gpr(reg), Operand::None];
        Ok(())
    }

    fn group1(&mut self, opcode: u8) -> Result<(), DecodeError> {
        if opcode == 0x80 {
            self.instr.op_size = OperandSize::S8;
        }
        let (reg, rm) = self.modrm()?;
        self.instr.opcode = match reg {
            0 => Opcode::Add,
            1 => Opcode::Or,
            4 => Opcode::And,
            5 => Opcode::Sub,
            6 => Opcode::Xor,
            7 => Opcode::Cmp,
            _ => return Err(DecodeError::Unknown { opcode }),
        };
        let dst = self.rm_operand(rm);
        self.instr.imm = if opcode == 0x83 {
            self.r.read8()? as i8 as i64
        } else {
            self.r.read_imm(self.instr.op_size)?
        };
        self.instr.operands = [dst, Operand::Imm];
        Ok(())
    }

    fn group2(&mut self, opcode: u8, count: ShiftCount) -> Result<(), DecodeError> {
        if opcode & 1 == 0 {
            self.instr.op_size = OperandSize::S8;
        }
        let (reg, rm) = self.modrm()?;
        self.instr.opcode = match reg {
            4 => Opcode::Shl,
            5 => Opcode::Shr,
            7 => Opcode::Sar,
            _ => return Err(DecodeError::Unknown { opcode }),
        };
        let dst = self.rm_operand(rm);
        let src = match count {
            ShiftCount::Imm8 => {
                self.instr.imm = self.r.read8()? as i64;
                Operand::Imm
            }
            ShiftCount::One => {
                self.instr.imm = 1;
                Operand::Imm
            }
            ShiftCount::Cl => Operand::Gpr(GprRef::new(ECX)),
        };
        self.instr.operands = [dst, src];
        Ok(())
    }

    fn group3(&mut self, opcode: u8) -> Result<(), DecodeError> {
        if opcode == 0xF6 {
            self.instr.op_size = OperandSize::S8;
        }
        let (reg, rm) = self.modrm()?;
        let dst = self.rm_operand(rm);
        match reg {
            0 | 1 => {
                self.instr.opcode = Opcode::Test;
                self.instr.imm = self.r.read_imm(self.instr.op_size)?;
                self.instr.operands = [dst, Operand::Imm];
            }
            2 => {
                self.instr.opcode = Opcode::Not;
                self.instr.operands = [dst, Operand::None];
            }
            3 => {
                self.instr.opcode = Opcode::Neg;
                self.instr.operands = [dst, Operand::None];
            }
            _ => return Err(DecodeError::Unknown { opcode }),
        }
        Ok(())
    }

    fn group4(&mut self) -> Result<(), DecodeError> {
        self.instr.op_size = OperandSize::S8;
        let (reg, rm) = self.modrm()?;
        self.instr.opcode = match reg {
            0 => Opcode::Inc,
            1 => Opcode::Dec,
            _ => return Err(DecodeError::Unknown { opcode: 0xFE }),
        };
        self.instr.operands = [self.rm_operand(rm), Operand::None];
        Ok(())
    }

    fn group5(&mut self) -> Result<(), DecodeError> {
        let (reg, rm) = self.modrm()?;
        let opnd = self.rm_operand(rm);
        self.instr.opcode = match reg {
            0 => Opcode::Inc,
            1 => Opcode::Dec,
            2 => Opcode::Call,
            4 => Opcode::Jmp,
            6 => Opcode::Push,
            _ => return Err(DecodeError::Unknown { opcode: 0xFF }),
        };
        self.instr.operands = [opnd, Operand::None];
        Ok(())
    }

    fn mov_rm_r(&mut self, byte: bool, to_rm: bool) -> Result<(), DecodeError> {
        if byte {
            self.instr.op_size = OperandSize::S8;
        }
        self.instr.opcode = Opcode::Mov;
        if to_rm {
            self.modrm_rm_reg(true)
        } else {
            self.modrm_reg_rm()
        }
    }

    fn mov_seg(&mut self, opcode: u8) -> Result<(), DecodeError> {
        self.instr.opcode = Opcode::MovSeg;
        self.instr.op_size = OperandSize::S16;
        let (reg, rm) = self.modrm()?;
        if reg as usize >= NUM_SEGS {
            return Err(DecodeError::Unknown { opcode });
        }
        let seg = Operand::Seg(reg as usize);
        let other = self.rm_operand(rm);
        self.instr.operands = if opcode == 0x8C {
            [other, seg] // MOV rm16, sreg
        } else {
            [seg, other] // MOV sreg, rm16
        };
        Ok(())
    }

    fn mov_moffs(&mut self, opcode: u8) -> Result<(), DecodeError> {
        self.instr.opcode = Opcode::Mov;
        if opcode & 1 == 0 {
            self.instr.op_size = OperandSize::S8;
        }
        let disp = match self.instr.addr_size {
            AddrSize::A16 => self.r.read16()? as i32,
            AddrSize::A32 => self.r.read32()? as i32,
        };
        self.instr.mem = MemOperand {
            base: None,
            index: None,
            scale: 0,
            disp,
            seg: SEG_DS,
        };
        let acc = Operand::Gpr(GprRef::new(EAX));
        self.instr.operands = if opcode < 0xA2 {
            [acc, Operand::Mem] // MOV acc, moffs
        } else {
            [Operand::Mem, acc] // MOV moffs, acc
        };
        Ok(())
    }

    fn in_out(&mut self, opcode: u8, is_in: bool) -> Result<(), DecodeError> {
        if opcode & 1 == 0 {
            self.instr.op_size = OperandSize::S8;
        }
        self.instr.opcode = if is_in { Opcode::In } else { Opcode::Out };
        // Port: imm8 for E4-E7, DX for EC-EF; travels in imm with
        // -1 marking the DX form.
        if opcode & 0x08 == 0 {
            self.instr.imm = self.r.read8()? as i64;
        } else {
            self.instr.imm = -1;
        }
        Ok(())
    }

    // -- Operand plumbing --

    fn acc_imm(&mut self) -> Result<(), DecodeError> {
        let acc = Operand::Gpr(GprRef::new(EAX));
        self.instr.imm = self.r.read_imm(self.instr.op_size)?;
        self.instr.operands = [acc, Operand::Imm];
        Ok(())
    }

    fn rel8(&mut self) -> Result<(), DecodeError> {
        self.instr.imm = self.r.read8()? as i8 as i64;
        self.instr.operands = [Operand::Imm, Operand::None];
        Ok(())
    }

    fn rel_op_size(&mut self) -> Result<(), DecodeError> {
        self.instr.imm = self.r.read_imm(self.instr.op_size)?;
        self.instr.operands = [Operand::Imm, Operand::None];
        Ok(())
    }

    /// ModRM with dst = r/m, src = reg (or the reverse).
    fn modrm_rm_reg(&mut self, rm_is_dst: bool) -> Result<(), DecodeError> {
        let (reg, rm) = self.modrm()?;
        let reg_op = Operand::Gpr(GprRef::decode(reg, self.instr.op_size));
        let rm_op = self.rm_operand(rm);
        self.instr.operands = if rm_is_dst {
            [rm_op, reg_op]
        } else {
            [reg_op, rm_op]
        };
        Ok(())
    }

    fn modrm_reg_rm(&mut self) -> Result<(), DecodeError> {
        self.modrm_rm_reg(false)
    }

    fn rm_operand(&self, rm: Rm) -> Operand {
        self.rm_operand_at(rm, self.instr.op_size)
    }

    fn rm_operand_at(&self, rm: Rm, size: OperandSize) -> Operand {
        match rm {
            Rm::Reg(r) => Operand::Gpr(GprRef::decode(r, size)),
            Rm::Mem => Operand::Mem,
        }
    }

    fn modrm(&mut self) -> Result<(u8, Rm), DecodeError> {
        self.modrm_at(self.instr.op_size)
    }

    /// Decode a ModRM byte (and SIB/displacement) at the given
    /// register width.
    fn modrm_at(&mut self, _size: OperandSize) -> Result<(u8, Rm), DecodeError> {
        let modrm = self.r.read8()?;
        let md = modrm >> 6;
        let reg = (modrm >> 3) & 7;
        let rm = modrm & 7;

        if md == 3 {
            return Ok((reg, Rm::Reg(rm)));
        }

        match self.instr.addr_size {
            AddrSize::A16 => self.modrm_mem16(md, rm)?,
            AddrSize::A32 => self.modrm_mem32(md, rm)?,
        }
        Ok((reg, Rm::Mem))
    }

    fn modrm_mem16(&mut self, md: u8, rm: u8) -> Result<(), DecodeError> {
        // The eight 16-bit addressing forms.
        let (base, index, ss_default) = match rm {
            0 => (Some(EBX), Some(ESI), false),
            1 => (Some(EBX), Some(EDI), false),
            2 => (Some(EBP), Some(ESI), true),
            3 => (Some(EBP), Some(EDI), true),
            4 => (Some(ESI), None, false),
            5 => (Some(EDI), None, false),
            6 => (Some(EBP), None, true),
            _ => (Some(EBX), None, false),
        };
        let (base, disp) = match (md, rm) {
            (0, 6) => (None, self.r.read16()? as i32),
            (0, _) => (base, 0),
            (1, _) => (base, self.r.read8()? as i8 as i32),
            _ => (base, self.r.read16()? as i16 as i32),
        };
        self.instr.mem = MemOperand {
            base,
            index,
            scale: 0,
            disp,
            seg: if ss_default && base.is_some() && self.seg_override.is_none() {
                SEG_SS
            } else {
                SEG_DS
            },
        };
        Ok(())
    }

    fn modrm_mem32(&mut self, md: u8, rm: u8) -> Result<(), DecodeError> {
        let (mut base, mut index, mut scale) = (None, None, 0u8);

        if rm == 4 {
            let sib = self.r.read8()?;
            scale = sib >> 6;
            let idx = ((sib >> 3) & 7) as usize;
            let b = (sib & 7) as usize;
            if idx != ESP {
                index = Some(idx);
            }
            if !(b == EBP && md == 0) {
                base = Some(b);
            }
        } else if !(rm == 5 && md == 0) {
            base = Some(rm as usize);
        }

        let disp = match md {
            // mod=0 carries a disp32 exactly when there is no base
            // (rm=5, or a SIB byte with base=101).
            0 if base.is_none() => self.r.read32()? as i32,
            0 => 0,
            1 => self.r.read8()? as i8 as i32,
            _ => self.r.read32()? as i32,
        };

        let ss_default = matches!(base, Some(b) if b == EBP || b == ESP);
        self.instr.mem = MemOperand {
            base,
            index,
            scale,
            disp,
            seg: if ss_default && self.seg_override.is_none() {
                SEG_SS
            } else {
                SEG_DS
            },
        };
        Ok(())
    }
}

enum ShiftCount {
    Imm8,
    One,
    Cl,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_bytes(bytes: &[u8], cs32: bool) -> DecodedInstr {
        let mut pos = 0usize;
        let mut fetch = || -> Result<u8, Exception> {
            let b = bytes[pos];
            pos += 1;
            Ok(b)
        };
        decode(&mut fetch, 0x1000, cs32).expect("decode")
    }

    #[test]
    fn mov_eax_imm32() {
        let i = decode_bytes(&[0xB8, 0x2A, 0, 0, 0], true);
        assert_eq!(i.opcode, Opcode::Mov);
        assert_eq!(i.op_size, OperandSize::S32);
        assert_eq!(i.imm, 42);
        assert_eq!(i.len, 5);
        assert_eq!(i.operands[0], Operand::Gpr(GprRef::new(EAX)));
    }

    #[test]
    fn mov_dx_imm16_in_16bit_code() {
        let i = decode_bytes(&[0xBA, 0x80, 0x00], false);
        assert_eq!(i.opcode, Opcode::Mov);
        assert_eq!(i.op_size, OperandSize::S16);
        assert_eq!(i.imm, 0x80);
        assert_eq!(i.len, 3);
        assert_eq!(i.operands[0], Operand::Gpr(GprRef::new(EDX)));
    }

    #[test]
    fn add_eax_imm() {
        let i = decode_bytes(&[0x05, 8, 0, 0, 0], true);
        assert_eq!(i.opcode, Opcode::Add);
        assert_eq!(i.imm, 8);
    }

    #[test]
    fn high_byte_registers() {
        // MOV AH, imm8
        let i = decode_bytes(&[0xB4, 0x55], true);
        assert_eq!(
            i.operands[0],
            Operand::Gpr(GprRef {
                idx: EAX,
                high_byte: true
            })
        );
    }

    #[test]
    fn modrm32_sib_forms() {
        // MOV EAX, [EBX + ESI*4 + 0x10]
        let i = decode_bytes(&[0x8B, 0x44, 0xB3, 0x10], true);
        assert_eq!(i.opcode, Opcode::Mov);
        assert_eq!(i.operands[1], Operand::Mem);
        assert_eq!(i.mem.base, Some(EBX));
        assert_eq!(i.mem.index, Some(ESI));
        assert_eq!(i.mem.scale, 2);
        assert_eq!(i.mem.disp, 0x10);
    }

    #[test]
    fn modrm32_disp_only() {
        // MOV [0x1000], EAX
        let i = decode_bytes(&[0x89, 0x05, 0x00, 0x10, 0x00, 0x00], true);
        assert_eq!(i.mem.base, None);
        assert_eq!(i.mem.index, None);
        assert_eq!(i.mem.disp, 0x1000);
        assert_eq!(i.operands[0], Operand::Mem);
    }

    #[test]
    fn modrm16_bp_defaults_to_ss() {
        // MOV AX, [BP+2] in 16-bit code
        let i = decode_bytes(&[0x8B, 0x46, 0x02], false);
        assert_eq!(i.mem.base, Some(EBP));
        assert_eq!(i.mem.seg, SEG_SS);
        assert_eq!(i.mem.disp, 2);
    }

    #[test]
    fn seg_override_applies() {
        // ES: MOV AX, [BP+2]
        let i = decode_bytes(&[0x26, 0x8B, 0x46, 0x02], false);
        assert_eq!(i.mem.seg, SEG_ES);
    }

    #[test]
    fn jnz_rel8_backward() {
        let i = decode_bytes(&[0x75, 0xFD], true);
        assert_eq!(i.opcode, Opcode::Jcc(5));
        assert_eq!(i.imm, -3);
        assert_eq!(i.len, 2);
    }

    #[test]
    fn group1_sign_extended_imm8() {
        // SUB ESP, 8 via 83 /5
        let i = decode_bytes(&[0x83, 0xEC, 0x08], true);
        assert_eq!(i.opcode, Opcode::Sub);
        assert_eq!(i.operands[0], Operand::Gpr(GprRef::new(ESP)));
        assert_eq!(i.imm, 8);
    }

    #[test]
    fn out_dx_al() {
        let i = decode_bytes(&[0xEE], false);
        assert_eq!(i.opcode, Opcode::Out);
        assert_eq!(i.op_size, OperandSize::S8);
        assert_eq!(i.imm, -1);
    }

    #[test]
    fn mov_cr0() {
        // MOV CR0, EAX
        let i = decode_bytes(&[0x0F, 0x22, 0xC0], true);
        assert_eq!(i.opcode, Opcode::MovCr);
        assert_eq!(i.operands[0], Operand::Cr(0));
        assert_eq!(i.operands[1], Operand::Gpr(GprRef::new(EAX)));
    }

    #[test]
    fn mov_dr0() {
        // MOV DR0, EAX
        let i = decode_bytes(&[0x0F, 0x23, 0xC0], true);
        assert_eq!(i.opcode, Opcode::MovDr);
        assert_eq!(i.operands[0], Operand::Dr(0));
    }

    #[test]
    fn movzx_r32_rm8() {
        let i = decode_bytes(&[0x0F, 0xB6, 0xC3], true);
        assert_eq!(i.opcode, Opcode::MovZx);
        assert_eq!(i.operands[0], Operand::Gpr(GprRef::new(EAX)));
        assert_eq!(
            i.operands[1],
            Operand::Gpr(GprRef {
                idx: EBX,
                high_byte: false
            })
        );
    }

    #[test]
    fn far_jmp_ptr16() {
        let i = decode_bytes(&[0xEA, 0x00, 0x10, 0x00, 0xF0], false);
        assert_eq!(i.opcode, Opcode::JmpFar);
        assert_eq!(i.imm, 0x1000);
        assert_eq!(i.imm_sel, 0xF000);
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let mut pos = 0usize;
        let bytes = [0x0F, 0x31]; // RDTSC: no recipe
        let mut fetch = || -> Result<u8, Exception> {
            let b = bytes[pos];
            pos += 1;
            Ok(b)
        };
        match decode(&mut fetch, 0, true) {
            Err(DecodeError::Unknown { opcode }) => assert_eq!(opcode, 0x31),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}

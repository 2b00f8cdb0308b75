//! Execute small emitted functions to validate the encoder
//! end-to-end (encodings are also byte-checked by the backend's
//! own unit tests).

use dbt86_backend::{Alu, Cc, Emitter, ExecBlock, Mem, Reg, Shift, Width};

/// Finalize, install and call an emitted `extern "C" fn(u64) ->
/// u64`; the argument arrives in RDI.
fn run1(e: Emitter, arg: u64) -> u64 {
    let code = e.finalize().expect("finalize");
    let mut block = ExecBlock::alloc(code.len()).expect("alloc");
    block.write(0, &code);
    block.protect_exec().expect("protect");
    // SAFETY: the emitted code follows the C ABI, reads RDI and
    // returns through RAX.
    unsafe {
        let f: unsafe extern "C" fn(u64) -> u64 =
            std::mem::transmute(block.base() as usize);
        f(arg)
    }
}

#[test]
fn exec_mov_imm64() {
    let mut e = Emitter::new();
    e.mov_ri64(Reg::Rax, 0x1122_3344_5566_7788);
    e.ret();
    assert_eq!(run1(e, 0), 0x1122_3344_5566_7788);
}

#[test]
fn exec_add_arg() {
    let mut e = Emitter::new();
    e.mov_rr(Width::B64, Reg::Rax, Reg::Rdi);
    e.alu_ri(Alu::Add, Width::B32, Reg::Rax, 5);
    e.ret();
    assert_eq!(run1(e, 37), 42);
}

#[test]
fn exec_alu_mix() {
    // rax = ((arg | 0xF0) & 0xFF) ^ 0x0F
    let mut e = Emitter::new();
    e.mov_rr(Width::B64, Reg::Rax, Reg::Rdi);
    e.alu_ri(Alu::Or, Width::B32, Reg::Rax, 0xF0);
    e.alu_ri(Alu::And, Width::B32, Reg::Rax, 0xFF);
    e.alu_ri(Alu::Xor, Width::B32, Reg::Rax, 0x0F);
    e.ret();
    assert_eq!(run1(e, 0x1234), 0xFB);
}

#[test]
fn exec_shifts() {
    // rax = (arg << 4) >> 1
    let mut e = Emitter::new();
    e.mov_rr(Width::B64, Reg::Rax, Reg::Rdi);
    e.shift_ri(Shift::Shl, Width::B32, Reg::Rax, 4);
    e.shift_ri(Shift::Shr, Width::B32, Reg::Rax, 1);
    e.ret();
    assert_eq!(run1(e, 3), 24);
}

#[test]
fn exec_cmov_select() {
    // rax = arg == 7 ? 100 : 200
    let mut e = Emitter::new();
    e.mov_ri32(Reg::Rax, 200);
    e.mov_ri32(Reg::Rdx, 100);
    e.alu_ri(Alu::Cmp, Width::B32, Reg::Rdi, 7);
    e.cmov_rr(Cc::E, Width::B32, Reg::Rax, Reg::Rdx);
    e.ret();
    assert_eq!(run1(e, 7), 100);
    // Fresh session: emitted code is single-use per Emitter.
    let mut e = Emitter::new();
    e.mov_ri32(Reg::Rax, 200);
    e.mov_ri32(Reg::Rdx, 100);
    e.alu_ri(Alu::Cmp, Width::B32, Reg::Rdi, 7);
    e.cmov_rr(Cc::E, Width::B32, Reg::Rax, Reg::Rdx);
    e.ret();
    assert_eq!(run1(e, 8), 200);
}

#[test]
fn exec_label_loop() {
    // Count arg down to zero, summing: rax = arg*(arg+1)/2 for
    // small args; exercises backward jcc resolution.
    let mut e = Emitter::new();
    e.mov_ri32(Reg::Rax, 0);
    e.mov_rr(Width::B64, Reg::Rdx, Reg::Rdi);
    let top = e.new_label();
    let done = e.new_label();
    e.bind(top);
    e.test_rr(Width::B32, Reg::Rdx, Reg::Rdx);
    e.jcc(Cc::E, done);
    e.alu_rr(Alu::Add, Width::B32, Reg::Rax, Reg::Rdx);
    e.alu_ri(Alu::Sub, Width::B32, Reg::Rdx, 1);
    e.jmp(top);
    e.bind(done);
    e.ret();
    assert_eq!(run1(e, 10), 55);
}

#[test]
fn exec_movzx_movsx() {
    let mut e = Emitter::new();
    // rax = sext8(arg) & 0xFFFF_FFFF
    e.mov_rr(Width::B64, Reg::Rax, Reg::Rdi);
    e.movsx_rr(Width::B32, Reg::Rax, Width::B8, Reg::Rax);
    e.ret();
    assert_eq!(run1(e, 0x80), 0xFFFF_FF80);

    let mut e = Emitter::new();
    e.mov_rr(Width::B64, Reg::Rax, Reg::Rdi);
    e.movzx_rr(Width::B32, Reg::Rax, Width::B8, Reg::Rax);
    e.ret();
    assert_eq!(run1(e, 0xABCD), 0xCD);
}

#[test]
fn exec_memory_operands() {
    // Store through a pointer argument, reload with an index.
    let mut buf = [0u64; 4];
    let mut e = Emitter::new();
    e.mov_ri32(Reg::Rax, 0xBEEF);
    e.mov_mr(Width::B64, Mem::base_disp(Reg::Rdi, 16), Reg::Rax);
    e.mov_ri32(Reg::Rcx, 2);
    e.mov_rm(Width::B64, Reg::Rax, Mem::base_index(Reg::Rdi, Reg::Rcx, 3));
    e.ret();
    let got = run1(e, buf.as_mut_ptr() as u64);
    assert_eq!(got, 0xBEEF);
    assert_eq!(buf[2], 0xBEEF);
}

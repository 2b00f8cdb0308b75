//! End-to-end guest programs through the dispatcher.

use dbt86_core::context::{CpuConfig, CpuContext};
use dbt86_core::x86::*;
use dbt86_core::{Bus, CpuError, SegReg};
use dbt86_exec::{Cpu, ExitReason};

/// Flat RAM plus recorded port I/O.
struct TestBus {
    ram: Vec<u8>,
    io_writes: Vec<(u16, u32, u8)>,
    io_read_value: u32,
}

impl TestBus {
    fn new(size: usize) -> Self {
        Self {
            ram: vec![0u8; size],
            io_writes: Vec::new(),
            io_read_value: 0xFFFF_FFFF,
        }
    }
}

impl Bus for TestBus {
    fn mem_read8(&mut self, paddr: u32) -> u8 {
        self.ram.get(paddr as usize).copied().unwrap_or(0xFF)
    }

    fn mem_read16(&mut self, paddr: u32) -> u16 {
        u16::from_le_bytes([self.mem_read8(paddr), self.mem_read8(paddr + 1)])
    }

    fn mem_read32(&mut self, paddr: u32) -> u32 {
        u32::from_le_bytes([
            self.mem_read8(paddr),
            self.mem_read8(paddr + 1),
            self.mem_read8(paddr + 2),
            self.mem_read8(paddr + 3),
        ])
    }

    fn mem_write8(&mut self, paddr: u32, val: u8) {
        if let Some(b) = self.ram.get_mut(paddr as usize) {
            *b = val;
        }
    }

    fn mem_write16(&mut self, paddr: u32, val: u16) {
        let b = val.to_le_bytes();
        self.mem_write8(paddr, b[0]);
        self.mem_write8(paddr + 1, b[1]);
    }

    fn mem_write32(&mut self, paddr: u32, val: u32) {
        for (i, byte) in val.to_le_bytes().iter().enumerate() {
            self.mem_write8(paddr + i as u32, *byte);
        }
    }

    fn io_read8(&mut self, _port: u16) -> u8 {
        self.io_read_value as u8
    }

    fn io_read16(&mut self, _port: u16) -> u16 {
        self.io_read_value as u16
    }

    fn io_read32(&mut self, _port: u16) -> u32 {
        self.io_read_value
    }

    fn io_write8(&mut self, port: u16, val: u8) {
        self.io_writes.push((port, val as u32, 1));
    }

    fn io_write16(&mut self, port: u16, val: u16) {
        self.io_writes.push((port, val as u32, 2));
    }

    fn io_write32(&mut self, port: u16, val: u32) {
        self.io_writes.push((port, val, 4));
    }

    fn ram_ptr(&mut self, paddr: u32) -> Option<*mut u8> {
        let idx = paddr as usize;
        if idx < self.ram.len() {
            // SAFETY: in bounds; the Vec is never resized.
            Some(unsafe { self.ram.as_mut_ptr().add(idx) })
        } else {
            None
        }
    }
}

const RAM_SIZE: usize = 1 << 20;
const CODE_BASE: u32 = 0x1000;

fn test_bus<'a>(cpu: &'a Cpu) -> &'a TestBus {
    // SAFETY: every Cpu in this file is constructed over a
    // TestBus.
    unsafe { &*(cpu.context().bus.as_ref() as *const dyn Bus as *const TestBus) }
}

/// Real-mode CPU with the code loaded at CODE_BASE and a stack at
/// 0x8000. `cs32` grows the code segment to a 32-bit default
/// (big-real-mode style) so 32-bit byte streams decode as listed.
fn boot(code: &[u8], cs32: bool) -> Cpu {
    let mut bus = TestBus::new(RAM_SIZE);
    bus.ram[CODE_BASE as usize..CODE_BASE as usize + code.len()]
        .copy_from_slice(code);
    let config = CpuConfig {
        start_eip: CODE_BASE,
        start_cs: 0,
        ..CpuConfig::default()
    };
    let mut cpu = Cpu::new(config, Box::new(bus));
    let ctx = cpu.context_mut();
    if cs32 {
        let mut cs = ctx.seg[SEG_CS];
        cs.flags |= SEG_FLG_DB;
        cs.limit = 0xFFFF_FFFF;
        ctx.write_seg(SEG_CS, cs.sel, cs.base, cs.limit, cs.flags);
    }
    ctx.gpr[ESP] = 0x8000;
    cpu
}

fn run_to_halt(cpu: &mut Cpu) {
    assert_eq!(cpu.run().expect("run"), ExitReason::Halt);
}

fn flags_of(ctx: &CpuContext) -> u32 {
    ctx.read_eflags()
}

// ---------------------------------------------------------------
// Spec scenarios
// ---------------------------------------------------------------

/// S1: MOV EAX,42; ADD EAX,8; HLT.
#[test]
fn s1_mov_add_flags() {
    let code = [
        0xB8, 0x2A, 0x00, 0x00, 0x00, // mov eax, 42
        0x05, 0x08, 0x00, 0x00, 0x00, // add eax, 8
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, true);
    run_to_halt(&mut cpu);

    let ctx = cpu.context();
    assert_eq!(ctx.gpr[EAX], 0x32);
    let f = flags_of(ctx);
    assert_eq!(f & CF_MASK, 0);
    assert_eq!(f & ZF_MASK, 0);
    assert_eq!(f & SF_MASK, 0);
    // 0x32 has three bits set: odd parity clears PF on real
    // silicon, and the lazy model follows the silicon.
    assert_eq!(f & PF_MASK, 0);
}

/// S2: MOV ECX,3; loop: DEC ECX; JNZ loop; HLT — the DEC block
/// runs three times and the loop edge gets chained.
#[test]
fn s2_dec_loop_chains() {
    let code = [
        0xB9, 0x03, 0x00, 0x00, 0x00, // mov ecx, 3
        0x49, // dec ecx
        0x75, 0xFD, // jnz -3
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, true);
    run_to_halt(&mut cpu);

    let ctx = cpu.context();
    assert_eq!(ctx.gpr[ECX], 0);
    assert_ne!(flags_of(ctx) & ZF_MASK, 0);
    assert!(cpu.cache_stats().links >= 1, "loop edge never chained");
}

/// S3: real-mode OUT with a 16-bit code segment; no #GP outside
/// protected mode.
#[test]
fn s3_real_mode_out() {
    let code = [
        0xBA, 0x80, 0x00, // mov dx, 0x80
        0xB0, 0x55, // mov al, 0x55
        0xEE, // out dx, al
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, false);
    run_to_halt(&mut cpu);

    assert_eq!(test_bus(&cpu).io_writes, vec![(0x80, 0x55, 1)]);
}

// -- Protected-mode scaffolding for S4 --

fn gdt_desc(base: u32, limit_4k: u32, access: u8, flags4: u8) -> [u8; 8] {
    let mut d = [0u8; 8];
    d[0] = (limit_4k & 0xFF) as u8;
    d[1] = ((limit_4k >> 8) & 0xFF) as u8;
    d[2] = (base & 0xFF) as u8;
    d[3] = ((base >> 8) & 0xFF) as u8;
    d[4] = ((base >> 16) & 0xFF) as u8;
    d[5] = access;
    d[6] = (((limit_4k >> 16) & 0xF) as u8) | (flags4 << 4);
    d[7] = ((base >> 24) & 0xFF) as u8;
    d
}

fn flat_hidden(sel: u16, code: bool, dpl: u32) -> SegReg {
    dbt86_core::segments::flat_seg(sel, code, dpl, true)
}

/// S4: CPL3 IN from a port whose TSS bitmap bit is set: #GP(0) is
/// delivered through the IDT and the pushed EIP names the IN
/// itself.
#[test]
fn s4_io_bitmap_gp() {
    const GDT: u32 = 0x0000_0400;
    const IDT: u32 = 0x2000;
    const TSS: u32 = 0x3000;
    const USER_CODE: u32 = 0x5000;
    const HANDLER: u32 = 0x6000;
    const ESP0: u32 = 0x7000;

    let mut bus = TestBus::new(RAM_SIZE);
    // GDT: null, 0x08 code0, 0x10 data0, 0x18 code3, 0x20 data3.
    let descs = [
        gdt_desc(0, 0, 0, 0),
        gdt_desc(0, 0xF_FFFF, 0x9A, 0xC),
        gdt_desc(0, 0xF_FFFF, 0x92, 0xC),
        gdt_desc(0, 0xF_FFFF, 0xFA, 0xC),
        gdt_desc(0, 0xF_FFFF, 0xF2, 0xC),
    ];
    for (i, d) in descs.iter().enumerate() {
        bus.ram[GDT as usize + i * 8..GDT as usize + i * 8 + 8]
            .copy_from_slice(d);
    }
    // IDT gate 13 -> 0x08:HANDLER, 32-bit interrupt gate, DPL0.
    let lo: u32 = (0x08 << 16) | (HANDLER & 0xFFFF);
    let hi: u32 = (HANDLER & 0xFFFF_0000) | 0x8E00;
    bus.ram[IDT as usize + 13 * 8..IDT as usize + 13 * 8 + 4]
        .copy_from_slice(&lo.to_le_bytes());
    bus.ram[IDT as usize + 13 * 8 + 4..IDT as usize + 13 * 8 + 8]
        .copy_from_slice(&hi.to_le_bytes());
    // TSS: esp0/ss0 and an I/O bitmap denying port 0x80.
    bus.ram[TSS as usize + 4..TSS as usize + 8]
        .copy_from_slice(&ESP0.to_le_bytes());
    bus.ram[TSS as usize + 8..TSS as usize + 12]
        .copy_from_slice(&0x10u32.to_le_bytes());
    let iomap_base: u16 = 104;
    bus.ram[TSS as usize + 102..TSS as usize + 104]
        .copy_from_slice(&iomap_base.to_le_bytes());
    bus.ram[TSS as usize + 104 + (0x80 >> 3)] = 0x01; // port 0x80 denied

    bus.ram[USER_CODE as usize] = 0xE4; // in al, 0x80
    bus.ram[USER_CODE as usize + 1] = 0x80;
    bus.ram[USER_CODE as usize + 2] = 0xF4; // (never reached)
    bus.ram[HANDLER as usize] = 0xF4; // hlt at CPL0

    let config = CpuConfig {
        start_eip: USER_CODE,
        ..CpuConfig::default()
    };
    let mut cpu = Cpu::new(config, Box::new(bus));
    let ctx = cpu.context_mut();
    ctx.cr0 |= CR0_PE_MASK;
    ctx.gdtr_base = GDT;
    ctx.gdtr_limit = 0xFF;
    ctx.idtr_base = IDT;
    ctx.idtr_limit = 0x7FF;
    ctx.tr = SegReg::new(
        0x28,
        TSS,
        0xFF,
        SEG_FLG_P | (SYS_TYPE_TSS32_BUSY << 8),
    );
    let cs = flat_hidden(0x18 | 3, true, 3);
    ctx.write_seg(SEG_CS, cs.sel, cs.base, cs.limit, cs.flags);
    let ss = flat_hidden(0x20 | 3, false, 3);
    ctx.write_seg(SEG_SS, ss.sel, ss.base, ss.limit, ss.flags);
    let ds = flat_hidden(0x20 | 3, false, 3);
    ctx.write_seg(SEG_DS, ds.sel, ds.base, ds.limit, ds.flags);
    ctx.gpr[ESP] = 0x9000;
    ctx.gpr[EAX] = 0x1234_5678;
    assert_eq!(ctx.cpl(), 3);

    run_to_halt(&mut cpu);

    let ctx = cpu.context();
    // Now in the CPL0 handler, on the TSS stack.
    assert_eq!(ctx.cpl(), 0);
    assert_eq!(ctx.seg[SEG_CS].sel, 0x08);
    assert_eq!(ctx.seg[SEG_SS].sel, 0x10);
    // Frame: ss3, esp3, eflags, cs3, eip, error code.
    assert_eq!(ctx.gpr[ESP], ESP0 - 24);
    let bus = test_bus(&cpu);
    let at = |off: u32| {
        u32::from_le_bytes(
            bus.ram[(ESP0 - off) as usize..(ESP0 - off + 4) as usize]
                .try_into()
                .unwrap(),
        )
    };
    assert_eq!(at(4), 0x23, "pushed SS");
    assert_eq!(at(8), 0x9000, "pushed ESP");
    assert_eq!(at(16), 0x1B, "pushed CS");
    assert_eq!(at(20), USER_CODE, "EIP of the faulting IN, unchanged");
    assert_eq!(at(24), 0, "#GP error code");
    // The IN never reached the bus, AL is untouched.
    assert_eq!(ctx.gpr[EAX], 0x1234_5678);
}

/// S5: setting CR0.PE flushes the cache, unwinds to the
/// dispatcher and resumes at the next instruction in protected
/// mode.
#[test]
fn s5_cr0_pe_mode_change() {
    let code = [
        0x0F, 0x20, 0xC0, // mov eax, cr0
        0x83, 0xC8, 0x01, // or eax, 1
        0x0F, 0x22, 0xC0, // mov cr0, eax
        0xF4, // hlt (retranslated in PE mode)
    ];
    let mut cpu = boot(&code, true);
    let flushes_before = cpu.cache_stats().flushes;
    run_to_halt(&mut cpu);

    let ctx = cpu.context();
    assert!(ctx.pe_mode());
    assert_ne!(ctx.hflags & HFLG_PE_MODE, 0);
    assert_eq!(ctx.eip, CODE_BASE + code.len() as u32);
    assert!(cpu.cache_stats().flushes > flushes_before);
}

/// S6: an enabled DR0 write-watchpoint fires #DB before the store
/// reaches the bus.
#[test]
fn s6_data_watchpoint() {
    const WATCHED: u32 = 0x2000;
    const HANDLER: u32 = 0x3000;
    let code = [
        0xA3, 0x00, 0x20, 0x00, 0x00, // mov [0x2000], eax
        0xF4, // (never reached)
    ];
    let mut cpu = boot(&code, true);
    {
        let ctx = cpu.context_mut();
        ctx.gpr[EAX] = 0xDEAD_BEEF;
        ctx.dr[0] = WATCHED;
        // L0 enabled, type = write, length = 4.
        ctx.dr[7] = DR7_RES_MASK | 1 | (DR7_TYPE_WRITE << 16) | (3 << 18);
        // IVT vector 1 -> 0:HANDLER.
        let ivt = ((0u32) << 16) | HANDLER;
        ctx.bus.mem_write32(4, ivt);
        ctx.bus.mem_write8(HANDLER, 0xF4); // hlt
    }
    run_to_halt(&mut cpu);

    let ctx = cpu.context();
    assert_ne!(ctx.dr[6] & DR6_B0_MASK, 0);
    assert_eq!(ctx.eip, HANDLER + 1);
    // The store must not be observable.
    assert_eq!(
        &test_bus(&cpu).ram[WATCHED as usize..WATCHED as usize + 4],
        &[0, 0, 0, 0]
    );
}

// ---------------------------------------------------------------
// Additional end-to-end coverage
// ---------------------------------------------------------------

#[test]
fn call_ret_roundtrip() {
    let code = [
        0xE8, 0x06, 0x00, 0x00, 0x00, // call +6 -> 0x100B
        0xB3, 0x07, // mov bl, 7
        0xF4, // hlt
        0x90, 0x90, 0x90, // padding
        0xB8, 0x2A, 0x00, 0x00, 0x00, // 0x100B: mov eax, 42
        0xC3, // ret
    ];
    let mut cpu = boot(&code, true);
    let esp_before = cpu.context().gpr[ESP];
    run_to_halt(&mut cpu);

    let ctx = cpu.context();
    assert_eq!(ctx.gpr[EAX], 42);
    assert_eq!(ctx.gpr[EBX] & 0xFF, 7);
    assert_eq!(ctx.gpr[ESP], esp_before, "stack balanced");
}

#[test]
fn push_pop_transfer() {
    let code = [
        0xB8, 0x44, 0x33, 0x22, 0x11, // mov eax, 0x11223344
        0x50, // push eax
        0x5A, // pop edx
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, true);
    run_to_halt(&mut cpu);
    assert_eq!(cpu.context().gpr[EDX], 0x1122_3344);
}

#[test]
fn memory_rmw_and_flags() {
    let code = [
        0xC7, 0x05, 0x00, 0x20, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00,
        // mov dword [0x2000], 5
        0x83, 0x05, 0x00, 0x20, 0x00, 0x00, 0x03, // add dword [0x2000], 3
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, true);
    run_to_halt(&mut cpu);

    let bus = test_bus(&cpu);
    assert_eq!(
        u32::from_le_bytes(bus.ram[0x2000..0x2004].try_into().unwrap()),
        8
    );
    assert_eq!(flags_of(cpu.context()) & ZF_MASK, 0);
}

#[test]
fn shl_sets_carry_and_zero() {
    let code = [
        0xB8, 0x00, 0x00, 0x00, 0x80, // mov eax, 0x80000000
        0xD1, 0xE0, // shl eax, 1
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, true);
    run_to_halt(&mut cpu);

    let ctx = cpu.context();
    assert_eq!(ctx.gpr[EAX], 0);
    let f = flags_of(ctx);
    assert_ne!(f & CF_MASK, 0);
    assert_ne!(f & ZF_MASK, 0);
}

#[test]
fn signed_vs_unsigned_branches() {
    // eax = -5; cmp eax, 3; jl -> bl = 1 (signed), jb not taken
    // for the unsigned compare afterwards.
    let code = [
        0xB8, 0xFB, 0xFF, 0xFF, 0xFF, // mov eax, -5
        0x83, 0xF8, 0x03, // cmp eax, 3
        0x7C, 0x03, // jl +3
        0xB3, 0x00, // mov bl, 0
        0xF4, // hlt
        0xB3, 0x01, // mov bl, 1
        0x72, 0x03, // jb +3 (CF clear: -5 above 3 unsigned)
        0xB7, 0x01, // mov bh, 1
        0xF4, // hlt
        0xB7, 0x02, // mov bh, 2
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, true);
    run_to_halt(&mut cpu);

    let ctx = cpu.context();
    assert_eq!(ctx.gpr[EBX] & 0xFF, 1, "signed branch taken");
    assert_eq!((ctx.gpr[EBX] >> 8) & 0xFF, 1, "unsigned branch not taken");
}

#[test]
fn addressing_16bit_forms() {
    let code = [
        0xBB, 0x00, 0x20, // mov bx, 0x2000
        0xC7, 0x47, 0x02, 0x34, 0x12, // mov word [bx+2], 0x1234
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, false);
    run_to_halt(&mut cpu);

    let bus = test_bus(&cpu);
    assert_eq!(bus.ram[0x2002], 0x34);
    assert_eq!(bus.ram[0x2003], 0x12);
}

#[test]
fn int_iret_roundtrip() {
    const HANDLER: u32 = 0x3000;
    let code = [
        0xCD, 0x21, // int 0x21
        0xB0, 0xAA, // mov al, 0xAA
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, false);
    {
        let ctx = cpu.context_mut();
        let ivt = ((0u32) << 16) | HANDLER;
        ctx.bus.mem_write32(0x21 * 4, ivt);
        // Handler: mov bl, 0x5A; iret
        ctx.bus.mem_write8(HANDLER, 0xB3);
        ctx.bus.mem_write8(HANDLER + 1, 0x5A);
        ctx.bus.mem_write8(HANDLER + 2, 0xCF);
    }
    run_to_halt(&mut cpu);

    let ctx = cpu.context();
    assert_eq!(ctx.gpr[EAX] & 0xFF, 0xAA, "resumed after INT");
    assert_eq!(ctx.gpr[EBX] & 0xFF, 0x5A, "handler ran");
}

#[test]
fn hlt_wakes_on_external_interrupt() {
    const HANDLER: u32 = 0x3000;
    let code = [
        0xFB, // sti
        0xF4, // hlt
        0xB0, 0x99, // mov al, 0x99 (after iret)
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, false);
    {
        let ctx = cpu.context_mut();
        let ivt = ((0u32) << 16) | HANDLER;
        ctx.bus.mem_write32(0x20 * 4, ivt);
        // Handler: mov bl, 0x77; iret
        ctx.bus.mem_write8(HANDLER, 0xB3);
        ctx.bus.mem_write8(HANDLER + 1, 0x77);
        ctx.bus.mem_write8(HANDLER + 2, 0xCF);
    }
    run_to_halt(&mut cpu);
    assert_eq!(cpu.context().gpr[EBX] & 0xFF, 0, "not delivered yet");

    cpu.raise_external_interrupt(0x20);
    run_to_halt(&mut cpu);

    let ctx = cpu.context();
    assert_eq!(ctx.gpr[EBX] & 0xFF, 0x77, "handler ran on wakeup");
    assert_eq!(ctx.gpr[EAX] & 0xFF, 0x99, "resumed after HLT");
}

/// Flushing and retranslating reproduces the same guest-visible
/// state (TB identity is not architectural).
#[test]
fn flush_and_reexecute_is_equivalent() {
    let code = [
        0xB9, 0x05, 0x00, 0x00, 0x00, // mov ecx, 5
        0x49, // dec ecx
        0x75, 0xFD, // jnz -3
        0xB8, 0x2A, 0x00, 0x00, 0x00, // mov eax, 42
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, true);
    run_to_halt(&mut cpu);
    let gpr_first = cpu.context().gpr;
    let flags_first = flags_of(cpu.context());

    // Drop the translations and run the same program again from
    // the architectural start.
    cpu.invalidate_page(CODE_BASE >> 12);
    {
        let ctx = cpu.context_mut();
        ctx.eip = CODE_BASE;
        ctx.halted = 0;
        ctx.gpr = [0; 8];
        ctx.gpr[ESP] = 0x8000;
    }
    run_to_halt(&mut cpu);

    assert_eq!(cpu.context().gpr, gpr_first);
    assert_eq!(flags_of(cpu.context()), flags_first);
}

#[test]
fn unknown_opcode_is_fatal() {
    let code = [0x0F, 0x31]; // rdtsc: no recipe
    let mut cpu = boot(&code, true);
    match cpu.run() {
        Err(CpuError::UnknownInstr { opcode, eip }) => {
            assert_eq!(opcode, 0x31);
            assert_eq!(eip, CODE_BASE);
        }
        other => panic!("expected UnknownInstr, got {other:?}"),
    }
}

/// Paging smoke test: identity-map the low 4 MiB and run through
/// the walker.
#[test]
fn paging_identity_map() {
    const PD: u32 = 0x0008_0000;
    const PT: u32 = 0x0008_1000;
    let code = [
        0xB8, 0x77, 0x00, 0x00, 0x00, // mov eax, 0x77
        0xA3, 0x00, 0x20, 0x00, 0x00, // mov [0x2000], eax
        0xF4, // hlt
    ];
    let mut cpu = boot(&code, true);
    {
        let ctx = cpu.context_mut();
        // One page table mapping 0..4MiB, present + writable.
        ctx.bus.mem_write32(PD, PT | 0x3);
        for i in 0..1024u32 {
            ctx.bus.mem_write32(PT + i * 4, (i << 12) | 0x3);
        }
        ctx.cr3 = PD;
        ctx.cr0 |= CR0_PE_MASK | CR0_PG_MASK;
        ctx.recompute_hflags();
        ctx.tlb_flush(false);
    }
    run_to_halt(&mut cpu);

    let bus = test_bus(&cpu);
    assert_eq!(bus.ram[0x2000], 0x77);
}

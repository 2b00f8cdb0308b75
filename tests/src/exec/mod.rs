//! Translation-cache discipline tests: install, lookup, flush,
//! page invalidation and the chain-slot publish protocol.

use std::sync::atomic::Ordering;

use dbt86_core::tb::{TbKey, TranslatedBlock, TB_JMP_DST};
use dbt86_exec::tc::TRAMPOLINE_SIZE;
use dbt86_exec::TranslationCache;
use dbt86_frontend::TranslatedCode;

fn dummy_code() -> TranslatedCode {
    TranslatedCode {
        // Never executed by these tests; a bare RET keeps the
        // image non-empty.
        code: vec![0xC3],
        guest_size: 1,
        icount: 1,
        page_cross: false,
    }
}

fn make_tb(pc: u32) -> Box<TranslatedBlock> {
    TranslatedBlock::new(pc, 0, 0, pc)
}

#[test]
fn install_populates_entry_and_slots() {
    let mut tc = TranslationCache::new(16);
    let tb = make_tb(0x1000);
    let key = tb.key();
    tc.install(tb, &dummy_code()).unwrap();

    let tb = tc.lookup(&key).unwrap();
    let entry = tb.host_entry.load(Ordering::Relaxed);
    let epilogue = tb.epilogue.load(Ordering::Relaxed);
    assert_ne!(entry, 0);
    // Trampoline is 16-byte aligned right after the code.
    assert_eq!(epilogue, entry + 16);
    assert_eq!(epilogue % 16, 0);
    // Every chain slot starts out routed to the trampoline.
    for slot in 0..3 {
        assert!(tb.slot_unlinked(slot));
        assert_eq!(tb.jmp_offset[slot].load(Ordering::Relaxed), epilogue);
    }
}

#[test]
fn trampoline_encodes_tb_pointer() {
    // movabs rax, <tb>; ret — 11 bytes.
    assert_eq!(TRAMPOLINE_SIZE, 11);

    let mut tc = TranslationCache::new(16);
    let tb = make_tb(0x2000);
    let key = tb.key();
    tc.install(tb, &dummy_code()).unwrap();
    let tb = tc.lookup(&key).unwrap();

    let epilogue = tb.epilogue.load(Ordering::Relaxed);
    // SAFETY: the trampoline bytes were just installed R+X;
    // reading them back is fine.
    let bytes = unsafe {
        std::slice::from_raw_parts(epilogue as *const u8, TRAMPOLINE_SIZE)
    };
    assert_eq!(bytes[0], 0x48);
    assert_eq!(bytes[1], 0xB8);
    assert_eq!(bytes[10], 0xC3);
    let ptr = u64::from_le_bytes(bytes[2..10].try_into().unwrap());
    assert_eq!(ptr, tb as *const TranslatedBlock as u64);
}

#[test]
fn lookup_misses_on_different_fingerprint() {
    let mut tc = TranslationCache::new(16);
    let tb = make_tb(0x1000);
    tc.install(tb, &dummy_code()).unwrap();

    let other = TbKey {
        phys_pc: 0x1000,
        cs_base: 0,
        flags: 0x10, // different mode fingerprint
    };
    assert!(tc.lookup(&other).is_none());
}

#[test]
fn flush_drops_everything() {
    let mut tc = TranslationCache::new(16);
    for i in 0..4 {
        tc.install(make_tb(0x1000 + i * 0x100), &dummy_code()).unwrap();
    }
    assert_eq!(tc.len(), 4);
    tc.flush_all();
    assert!(tc.is_empty());
}

#[test]
fn capacity_is_reported() {
    let mut tc = TranslationCache::new(2);
    tc.install(make_tb(0x1000), &dummy_code()).unwrap();
    assert!(!tc.is_full());
    tc.install(make_tb(0x2000), &dummy_code()).unwrap();
    assert!(tc.is_full());
}

#[test]
fn link_patches_pending_slot_once() {
    let mut tc = TranslationCache::new(16);
    let a = make_tb(0x1000);
    let b = make_tb(0x1010);
    let ka = a.key();
    let kb = b.key();
    tc.install(a, &dummy_code()).unwrap();
    tc.install(b, &dummy_code()).unwrap();

    // Pretend A just exited through its taken edge.
    {
        let a = tc.lookup(&ka).unwrap();
        a.flags.store(TB_JMP_DST | 1, Ordering::Relaxed);
    }
    tc.try_link(ka, kb);

    let b_entry = tc.lookup(&kb).unwrap().host_entry.load(Ordering::Relaxed);
    let a = tc.lookup(&ka).unwrap();
    assert!(!a.slot_unlinked(0));
    assert_eq!(a.jmp_offset[0].load(Ordering::Relaxed), b_entry);
    assert_eq!(a.jmp_dest[0], Some(kb));
    // The interrupt slot is never patched.
    assert!(a.slot_unlinked(2));

    // Second link attempt is a no-op (single-writer publish).
    let links_before = tc.stats.links;
    tc.try_link(ka, kb);
    assert_eq!(tc.stats.links, links_before);
}

#[test]
fn page_invalidation_unlinks_incoming_chains() {
    let mut tc = TranslationCache::new(16);
    let a = make_tb(0x1000); // page 0x1000
    let b = make_tb(0x2500); // page 0x2000
    let ka = a.key();
    let kb = b.key();
    tc.install(a, &dummy_code()).unwrap();
    tc.install(b, &dummy_code()).unwrap();

    {
        let a = tc.lookup(&ka).unwrap();
        a.flags.store(TB_JMP_DST | 1, Ordering::Relaxed);
    }
    tc.try_link(ka, kb);

    // Dropping B's page must restore A's slot to its trampoline.
    tc.invalidate_phys_page(0x2);
    assert!(tc.lookup(&kb).is_none());
    let a = tc.lookup(&ka).unwrap();
    assert!(a.slot_unlinked(0));
    assert_eq!(a.jmp_dest[0], None);
}

#[test]
fn page_invalidation_drops_only_matching_page() {
    let mut tc = TranslationCache::new(16);
    let a = make_tb(0x1000);
    let b = make_tb(0x2000);
    let ka = a.key();
    let kb = b.key();
    tc.install(a, &dummy_code()).unwrap();
    tc.install(b, &dummy_code()).unwrap();

    tc.invalidate_phys_page(0x1);
    assert!(tc.lookup(&ka).is_none());
    assert!(tc.lookup(&kb).is_some());
}

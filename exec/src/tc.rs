//! Translation cache.
//!
//! Owns every installed block (`TranslatedBlock` metadata plus its
//! executable memory) keyed by `(physical PC, CS base, mode
//! fingerprint)`, with a side index by guest physical page for
//! invalidation. Reaching the capacity triggers a full flush — the
//! cache never evicts piecemeal on capacity pressure.

use std::collections::HashMap;

use tracing::debug;

use dbt86_backend::ExecBlock;
use dbt86_core::tb::{TbKey, TranslatedBlock, TB_FLG_JMP_KIND_MASK, TB_JMP_DST, TB_JMP_NEXT_PC};
use dbt86_core::x86::PAGE_MASK;
use dbt86_core::CpuError;
use dbt86_frontend::TranslatedCode;

use std::sync::atomic::Ordering;

/// The epilogue trampoline: `movabs rax, <tb>; ret` — 11 bytes,
/// installed 16-byte aligned after each block's code.
pub const TRAMPOLINE_SIZE: usize = 11;

struct Entry {
    tb: Box<TranslatedBlock>,
    /// Keeps the block's executable mapping alive.
    _code: ExecBlock,
}

/// Build the executable image for a translated block: copy the
/// finalized code, append the epilogue trampoline, point the entry
/// and all chain slots at their initial targets and seal the
/// mapping R+X.
pub fn build_block(
    tb: &TranslatedBlock,
    code: &TranslatedCode,
) -> Result<ExecBlock, CpuError> {
    if code.code.is_empty() {
        return Err(CpuError::Internal("zero-size block"));
    }
    let exit_off = (code.code.len() + 15) & !15;
    let total = exit_off + TRAMPOLINE_SIZE;

    let mut block = ExecBlock::alloc(total).map_err(|_| CpuError::NoMemory)?;
    block.write(0, &code.code);

    let mut tramp = [0u8; TRAMPOLINE_SIZE];
    tramp[0] = 0x48; // REX.W
    tramp[1] = 0xB8; // MOV RAX, imm64
    tramp[2..10]
        .copy_from_slice(&(tb as *const TranslatedBlock as u64).to_le_bytes());
    tramp[10] = 0xC3; // RET
    block.write(exit_off, &tramp);

    let entry = block.addr();
    let epilogue = entry + exit_off as u64;
    tb.host_entry.store(entry, Ordering::Relaxed);
    tb.epilogue.store(epilogue, Ordering::Relaxed);
    for slot in &tb.jmp_offset {
        slot.store(epilogue, Ordering::Release);
    }

    block
        .protect_exec()
        .map_err(|_| CpuError::Internal("mprotect to R+X failed"))?;
    Ok(block)
}

pub struct TranslationCache {
    map: HashMap<TbKey, Entry>,
    page_index: HashMap<u32, Vec<TbKey>>,
    cap: usize,
    pub stats: TcStats,
}

#[derive(Debug, Default)]
pub struct TcStats {
    pub lookups: u64,
    pub hits: u64,
    pub installs: u64,
    pub flushes: u64,
    pub links: u64,
    pub unlinks: u64,
}

impl TranslationCache {
    pub fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            page_index: HashMap::new(),
            cap,
            stats: TcStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.map.len() >= self.cap
    }

    pub fn lookup(&mut self, key: &TbKey) -> Option<&TranslatedBlock> {
        self.stats.lookups += 1;
        let e = self.map.get(key)?;
        self.stats.hits += 1;
        Some(&e.tb)
    }

    /// Install a finalized block. The caller has already handled
    /// capacity (flush) and page-crossing (never installed).
    pub fn install(
        &mut self,
        tb: Box<TranslatedBlock>,
        code: &TranslatedCode,
    ) -> Result<(), CpuError> {
        let block = build_block(&tb, code)?;
        let key = tb.key();
        self.page_index
            .entry(tb.pc & !PAGE_MASK)
            .or_default()
            .push(key);
        self.map.insert(key, Entry { tb, _code: block });
        self.stats.installs += 1;
        Ok(())
    }

    /// Drop every block. Only legal between block executions: any
    /// chain may reference any other block's memory.
    pub fn flush_all(&mut self) {
        debug!(blocks = self.map.len(), "translation cache flush");
        self.map.clear();
        self.page_index.clear();
        self.stats.flushes += 1;
    }

    /// Drop the blocks on one guest physical page, first unlinking
    /// every chain that leads into them.
    pub fn invalidate_phys_page(&mut self, ppn: u32) {
        let page = ppn << 12;
        let Some(keys) = self.page_index.remove(&page) else {
            return;
        };
        debug!(page = format_args!("{page:#010x}"), n = keys.len(), "invalidate page");
        for key in keys {
            let Some(victim) = self.map.remove(&key) else {
                continue;
            };
            // Incoming chains route back to their own trampolines.
            for &(src_key, slot) in &victim.tb.jmp_list {
                if let Some(src) = self.map.get_mut(&src_key) {
                    src.tb.unlink_slot(slot);
                    src.tb.jmp_dest[slot] = None;
                    self.stats.unlinks += 1;
                }
            }
            // Outgoing edges disappear from their targets' lists.
            for (slot, dst) in victim.tb.jmp_dest.iter().enumerate() {
                if let Some(dst_key) = dst {
                    if let Some(d) = self.map.get_mut(dst_key) {
                        d.tb
                            .jmp_list
                            .retain(|&(k, s)| !(k == key && s == slot));
                    }
                }
            }
        }
    }

    /// Patch `prev`'s pending chain slot to enter `next` directly.
    /// The slot is identified by the exit kind `prev` recorded on
    /// its way out; a slot is written at most once between
    /// invalidations (single-writer publish).
    pub fn try_link(&mut self, prev_key: TbKey, next_key: TbKey) {
        let Some(prev) = self.map.get(&prev_key) else {
            return;
        };
        let slot = match prev.tb.exit_kind() & TB_FLG_JMP_KIND_MASK {
            k if k == TB_JMP_DST => 0,
            k if k == TB_JMP_NEXT_PC => 1,
            _ => return,
        };
        if !prev.tb.slot_unlinked(slot) {
            return;
        }
        let Some(next) = self.map.get(&next_key) else {
            return;
        };
        let entry = next.tb.host_entry.load(Ordering::Relaxed);

        let prev = self.map.get_mut(&prev_key).unwrap();
        prev.tb.link_slot(slot, entry);
        prev.tb.jmp_dest[slot] = Some(next_key);
        let next = self.map.get_mut(&next_key).unwrap();
        next.tb.jmp_list.push((prev_key, slot));
        self.stats.links += 1;
        debug!(
            from = format_args!("{:#010x}", prev_key.phys_pc),
            to = format_args!("{:#010x}", next_key.phys_pc),
            slot,
            "chained blocks"
        );
    }
}

//! Device-bus collaborator interface.
//!
//! The translator core never owns guest memory or devices; all
//! physical memory and port I/O goes through this trait. RAM-backed
//! pages may additionally grant a host pointer so the memory helpers
//! can service TLB hits without a bus round-trip.

/// Physical memory and port I/O access, as seen by the CPU core.
///
/// All addresses are guest-physical. Accesses are naturally sized and
/// never cross a page boundary (the memory helpers split straddling
/// guest accesses before calling down).
pub trait Bus {
    fn mem_read8(&mut self, paddr: u32) -> u8;
    fn mem_read16(&mut self, paddr: u32) -> u16;
    fn mem_read32(&mut self, paddr: u32) -> u32;

    fn mem_write8(&mut self, paddr: u32, val: u8);
    fn mem_write16(&mut self, paddr: u32, val: u16);
    fn mem_write32(&mut self, paddr: u32, val: u32);

    fn io_read8(&mut self, port: u16) -> u8;
    fn io_read16(&mut self, port: u16) -> u16;
    fn io_read32(&mut self, port: u16) -> u32;

    fn io_write8(&mut self, port: u16, val: u8);
    fn io_write16(&mut self, port: u16, val: u16);
    fn io_write32(&mut self, port: u16, val: u32);

    /// Host pointer to the RAM byte backing `paddr`, if the physical
    /// page is plain RAM. MMIO regions return `None` and always take
    /// the callback path. The pointer stays valid for the lifetime of
    /// the bus and is only dereferenced for accesses that do not
    /// cross the page containing `paddr`.
    fn ram_ptr(&mut self, paddr: u32) -> Option<*mut u8>;
}

/// Flat RAM with unmapped-hole semantics: reads beyond the RAM size
/// return all-ones, writes are dropped, I/O is unconnected.
///
/// Mostly useful to embedders that only need a memory image (and to
/// the test suite).
pub struct RamBus {
    ram: Vec<u8>,
}

impl RamBus {
    pub fn new(size: usize) -> Self {
        Self {
            ram: vec![0u8; size],
        }
    }

    pub fn load(&mut self, paddr: u32, bytes: &[u8]) {
        let start = paddr as usize;
        self.ram[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }
}

impl Bus for RamBus {
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
        let b = val.to_le_bytes();
        for (i, byte) in b.iter().enumerate() {
            self.mem_write8(paddr + i as u32, *byte);
        }
    }

    fn io_read8(&mut self, _port: u16) -> u8 {
        0xFF
    }

    fn io_read16(&mut self, _port: u16) -> u16 {
        0xFFFF
    }

    fn io_read32(&mut self, _port: u16) -> u32 {
        0xFFFF_FFFF
    }

    fn io_write8(&mut self, _port: u16, _val: u8) {}
    fn io_write16(&mut self, _port: u16, _val: u16) {}
    fn io_write32(&mut self, _port: u16, _val: u32) {}

    fn ram_ptr(&mut self, paddr: u32) -> Option<*mut u8> {
        let idx = paddr as usize;
        if idx < self.ram.len() {
            // SAFETY: idx is in bounds; the Vec is never resized
            // after construction.
            Some(unsafe { self.ram.as_mut_ptr().add(idx) })
        } else {
            None
        }
    }
}

//! Executable memory blocks.
//!
//! Each translated block gets its own mmap'd region, written while
//! R+W and flipped to R+X before first execution. W^X is strict:
//! once a block is executable it is never written again (chain
//! linking mutates the TB structure, not the code).

use std::io;
use std::ptr;

/// A page-granular region of host memory holding one translated
/// block's code plus its epilogue trampoline.
pub struct ExecBlock {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: ExecBlock owns its mapping exclusively.
unsafe impl Send for ExecBlock {}

impl ExecBlock {
    /// Map a fresh R+W region of at least `size` bytes.
    pub fn alloc(size: usize) -> io::Result<Self> {
        let page = page_size();
        let size = (size.max(1) + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `bytes` into the block at `offset`. Only valid while
    /// the block is still writable.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.size, "code block overflow");
        // SAFETY: range checked above; mapping is R+W until
        // protect_exec.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.add(offset),
                bytes.len(),
            );
        }
    }

    /// Transition to R+X and synchronize the instruction stream.
    pub fn protect_exec(&self) -> io::Result<()> {
        // SAFETY: protecting our own mapping.
        let ret = unsafe {
            libc::mprotect(
                self.ptr as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        // x86 keeps the instruction cache coherent with stores from
        // the same core; no explicit flush is needed.
        Ok(())
    }
}

impl Drop for ExecBlock {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: unmapping the region we mapped in alloc().
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

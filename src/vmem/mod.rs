//! Host virtual-memory management
//!
//! One large address-space reservation is obtained at startup and subdivided
//! by fixed offsets into guest RAM, I/O RAM, vector-unit memory, and the
//! per-CPU recompiled-code caches. Pages start out reserved-but-inaccessible
//! and are committed/decommitted as the lifecycle layer asks for them.
//!
//! The base address is chosen once and never moves for the lifetime of the
//! process, so host pointers seen in a debugger stay stable across runs.

mod reserve;

pub use reserve::{RecompiledCodeReserve, VirtualMemoryReserve};

use std::ffi::c_void;
use std::io;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::error::CoreError;

/// Host page granularity assumed by the reservation layer.
pub const HOST_PAGE_SIZE: usize = 4096;

/// Round `size` up to host page granularity.
pub const fn page_align(size: usize) -> usize {
    (size + HOST_PAGE_SIZE - 1) & !(HOST_PAGE_SIZE - 1)
}

bitflags! {
    /// Page protection applied when a reserve is committed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProtection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl PageProtection {
    pub const fn rw() -> Self {
        PageProtection::READ.union(PageProtection::WRITE)
    }

    /// Combined read/write/execute protection. Code generation writes into
    /// the same pages it later executes from, so code reserves give up W^X.
    pub const fn rwx() -> Self {
        PageProtection::rw().union(PageProtection::EXECUTE)
    }

    fn to_native(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(PageProtection::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(PageProtection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(PageProtection::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Fixed offsets of every guest region and code cache inside the single
/// reservation. Computed absolute addresses are read-only after startup.
pub mod host_map {
    /// Main-CPU RAM (32 MiB).
    pub const MAIN_RAM_OFFSET: usize = 0x0000_0000;
    pub const MAIN_RAM_SIZE: usize = 32 * 1024 * 1024;

    /// I/O-CPU RAM (2 MiB).
    pub const IOP_RAM_OFFSET: usize = 0x0200_0000;
    pub const IOP_RAM_SIZE: usize = 2 * 1024 * 1024;

    /// Vector-unit micro + data memory window.
    pub const VU_MEM_OFFSET: usize = 0x0220_0000;
    pub const VU_MEM_SIZE: usize = 0x1_0000;

    /// Recompiled-code caches, one per CPU role.
    pub const MAIN_REC_OFFSET: usize = 0x0240_0000;
    pub const MAIN_REC_SIZE: usize = 64 * 1024 * 1024;
    pub const IOP_REC_OFFSET: usize = 0x0640_0000;
    pub const IOP_REC_SIZE: usize = 32 * 1024 * 1024;
    pub const VU_REC_OFFSET: usize = 0x0840_0000;
    pub const VU_REC_SIZE: usize = 16 * 1024 * 1024;

    pub const TOTAL_SIZE: usize = 0x0940_0000;
}

/// One contiguous host address-space reservation.
///
/// The manager owns the mapping exclusively; sub-reserves borrow windows of
/// it and never unmap anything themselves.
pub struct VirtualMemoryManager {
    name: &'static str,
    base: *mut u8,
    size: usize,
}

// The mapping itself is plain memory; all page-state mutation goes through
// &self with the kernel serializing the syscalls. Sharing the handle across
// the VU worker thread is part of the design contract.
unsafe impl Send for VirtualMemoryManager {}
unsafe impl Sync for VirtualMemoryManager {}

impl VirtualMemoryManager {
    /// Reserve `size` bytes of address space, optionally pinned at
    /// `preferred_base`. With `strict` the reservation fails outright instead
    /// of accepting an OS-chosen placement.
    pub fn reserve(
        name: &'static str,
        preferred_base: usize,
        size: usize,
        strict: bool,
    ) -> Result<VirtualMemoryManager, CoreError> {
        let size = page_align(size);
        let ptr = unsafe {
            libc::mmap(
                preferred_base as *mut c_void,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CoreError::ReservationFailed {
                name,
                detail: io::Error::last_os_error().to_string(),
            });
        }
        if strict && preferred_base != 0 && ptr as usize != preferred_base {
            unsafe {
                libc::munmap(ptr, size);
            }
            return Err(CoreError::ReservationFailed {
                name,
                detail: format!("address {preferred_base:#x} unavailable"),
            });
        }
        debug!(name, base = ptr as usize, size, "reserved address space");
        Ok(VirtualMemoryManager {
            name,
            base: ptr as *mut u8,
            size,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `[offset, offset + len)` lies inside the reservation.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .map(|end| end <= self.size)
            .unwrap_or(false)
    }

    /// Make pages in the window backing-store resident with `prot`.
    pub(crate) fn commit_pages(
        &self,
        offset: usize,
        len: usize,
        prot: PageProtection,
    ) -> Result<(), CoreError> {
        let rc = unsafe {
            libc::mprotect(
                self.base.add(offset) as *mut c_void,
                page_align(len),
                prot.to_native(),
            )
        };
        if rc != 0 {
            return Err(CoreError::OutOfMemory {
                name: self.name,
                fatal: false,
            });
        }
        Ok(())
    }

    /// Release physical backing for the window while keeping the address
    /// range reserved. Pages read back as zero after the next commit.
    pub(crate) fn decommit_pages(&self, offset: usize, len: usize) {
        let len = page_align(len);
        unsafe {
            let ptr = self.base.add(offset) as *mut c_void;
            libc::madvise(ptr, len, libc::MADV_DONTNEED);
            libc::mprotect(ptr, len, libc::PROT_NONE);
        }
    }
}

impl Drop for VirtualMemoryManager {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, self.size);
        }
    }
}

/// Reserve the main memory span near a code-derived anchor.
///
/// Pinning the base near the executable keeps pointer values small and
/// repeatable in a debugger. Candidates walk a fixed set of 256 MiB-granular
/// offsets around the anchor, skipping any placement whose base or end would
/// set the host sign bit (such addresses are not representable in the guest's
/// 32-bit-visible pointer space). If every candidate is rejected, one
/// unconstrained reservation is taken instead; there is no point retrying
/// beyond the enumerated offsets.
pub fn sys_reserve_main_memory(
    size: usize,
) -> Result<Arc<VirtualMemoryManager>, CoreError> {
    let anchor = sys_reserve_main_memory as usize / (1 << 28) * (1 << 28);

    for offset in (-6i64..=4).rev() {
        let base = anchor.wrapping_add_signed((offset << 28) as isize);
        let Some(end) = base.checked_add(size - 1) else {
            continue;
        };
        if base == 0 || (base as isize) < 0 || (end as isize) < 0 {
            continue;
        }
        if let Ok(mgr) = VirtualMemoryManager::reserve("main memory", base, size, true) {
            return Ok(Arc::new(mgr));
        }
    }

    warn!("no candidate base near code anchor; using an OS-chosen placement");
    VirtualMemoryManager::reserve("main memory", 0, size, false).map(Arc::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), HOST_PAGE_SIZE);
        assert_eq!(page_align(HOST_PAGE_SIZE), HOST_PAGE_SIZE);
        assert_eq!(page_align(HOST_PAGE_SIZE + 1), 2 * HOST_PAGE_SIZE);
    }

    #[test]
    fn test_reserve_commit_rw() {
        let mgr = VirtualMemoryManager::reserve("test", 0, 1 << 20, false).unwrap();
        mgr.commit_pages(0, HOST_PAGE_SIZE, PageProtection::rw()).unwrap();
        unsafe {
            *mgr.base() = 0x5A;
            assert_eq!(*mgr.base(), 0x5A);
        }
    }

    #[test]
    fn test_decommit_zeroes_on_recommit() {
        let mgr = VirtualMemoryManager::reserve("test", 0, 1 << 20, false).unwrap();
        mgr.commit_pages(0, HOST_PAGE_SIZE, PageProtection::rw()).unwrap();
        unsafe {
            *mgr.base() = 0xFF;
        }
        mgr.decommit_pages(0, HOST_PAGE_SIZE);
        mgr.commit_pages(0, HOST_PAGE_SIZE, PageProtection::rw()).unwrap();
        unsafe {
            assert_eq!(*mgr.base(), 0);
        }
    }

    #[test]
    fn test_main_memory_anchor_walk() {
        let mgr = sys_reserve_main_memory(host_map::TOTAL_SIZE).unwrap();
        assert!((mgr.base() as isize) > 0);
        assert_eq!(mgr.size(), host_map::TOTAL_SIZE);
    }

    #[test]
    fn test_host_map_regions_disjoint() {
        use host_map::*;
        let regions = [
            (MAIN_RAM_OFFSET, MAIN_RAM_SIZE),
            (IOP_RAM_OFFSET, IOP_RAM_SIZE),
            (VU_MEM_OFFSET, VU_MEM_SIZE),
            (MAIN_REC_OFFSET, MAIN_REC_SIZE),
            (IOP_REC_OFFSET, IOP_REC_SIZE),
            (VU_REC_OFFSET, VU_REC_SIZE),
        ];
        for w in regions.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0);
        }
        let (last_off, last_size) = regions[regions.len() - 1];
        assert!(last_off + last_size <= TOTAL_SIZE);
    }
}

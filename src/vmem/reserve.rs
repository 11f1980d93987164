//! Typed views over windows of the main reservation
//!
//! A `VirtualMemoryReserve` tracks committed vs merely reserved pages for one
//! named sub-region. `RecompiledCodeReserve` layers executable protection and
//! a bump allocator for translated-block bodies on top.

use std::sync::Arc;

use tracing::{info, trace};

use super::{page_align, PageProtection, VirtualMemoryManager, HOST_PAGE_SIZE};
use crate::error::CoreError;

/// Named window of the manager's span with a staged page lifecycle.
///
/// Invariant: committed range ⊆ reserved window ⊆ manager span. The reserve
/// never owns host memory; the manager alone unmaps.
pub struct VirtualMemoryReserve {
    name: &'static str,
    manager: Arc<VirtualMemoryManager>,
    offset: usize,
    size: usize,
    committed: usize,
    prot: PageProtection,
}

impl VirtualMemoryReserve {
    /// Carve a named window without allocating new host memory.
    pub fn assign(
        name: &'static str,
        manager: Arc<VirtualMemoryManager>,
        offset: usize,
        size: usize,
        prot: PageProtection,
    ) -> Result<VirtualMemoryReserve, CoreError> {
        let size = page_align(size);
        if !manager.contains(offset, size) {
            return Err(CoreError::BadWindow { name });
        }
        trace!(name, offset, size, "assigned reserve window");
        Ok(VirtualMemoryReserve {
            name,
            manager,
            offset,
            size,
            committed: 0,
            prot,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn is_committed(&self) -> bool {
        self.committed == self.size
    }

    pub fn protection(&self) -> PageProtection {
        self.prot
    }

    pub fn base_ptr(&self) -> *mut u8 {
        unsafe { self.manager.base().add(self.offset) }
    }

    /// Make the whole window backing-store resident. Idempotent.
    pub fn commit(&mut self) -> Result<(), CoreError> {
        if self.is_committed() {
            return Ok(());
        }
        self.manager.commit_pages(self.offset, self.size, self.prot)?;
        self.committed = self.size;
        Ok(())
    }

    /// Release backing while keeping the window reserved. Idempotent.
    pub fn decommit(&mut self) {
        if self.committed == 0 {
            return;
        }
        self.manager.decommit_pages(self.offset, self.size);
        self.committed = 0;
    }

    /// Decommit + commit: drops page contents, keeps the address range valid.
    pub fn reset(&mut self) -> Result<(), CoreError> {
        self.decommit();
        self.commit()
    }

    /// View the committed window as a byte slice.
    ///
    /// # Safety
    /// The window must be committed and the caller must uphold the single
    /// writer per region discipline of the concurrency model.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base_ptr(), self.committed)
    }

    /// # Safety
    /// See [`VirtualMemoryReserve::as_slice`].
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base_ptr(), self.committed)
    }

    fn set_size(&mut self, size: usize) {
        self.size = size;
    }
}

/// Executable window holding one CPU's translated blocks.
///
/// Pages carry combined read/write/execute protection: the generator writes
/// into the same pages the host later executes from. Block bodies are placed
/// by a bump allocator; individual blocks are never freed, the whole cache
/// resets at once.
pub struct RecompiledCodeReserve {
    mem: VirtualMemoryReserve,
    used: usize,
}

impl RecompiledCodeReserve {
    /// Carve and immediately commit an executable window.
    pub fn assign(
        name: &'static str,
        manager: Arc<VirtualMemoryManager>,
        offset: usize,
        size: usize,
    ) -> Result<RecompiledCodeReserve, CoreError> {
        let mut mem =
            VirtualMemoryReserve::assign(name, manager, offset, size, PageProtection::rwx())?;
        mem.commit()?;
        Ok(RecompiledCodeReserve { mem, used: 0 })
    }

    pub fn name(&self) -> &'static str {
        self.mem.name()
    }

    pub fn size(&self) -> usize {
        self.mem.size()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.mem.committed().saturating_sub(self.used)
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.mem.base_ptr()
    }

    /// Allocate `len` bytes of executable memory for one block body.
    /// Returns `None` when the reserve is exhausted; the caller fails that
    /// block only and decides whether to raise cache pressure.
    pub fn alloc(&mut self, len: usize) -> Option<*mut u8> {
        let len = (len + 15) & !15;
        if self.used + len > self.mem.committed() {
            return None;
        }
        let ptr = unsafe { self.mem.base_ptr().add(self.used) };
        self.used += len;
        Some(ptr)
    }

    /// Drop every translation and restore fresh zeroed executable pages.
    pub fn reset(&mut self) -> Result<(), CoreError> {
        self.used = 0;
        self.mem.reset()
    }

    /// Shrink the committed window to `new_size` and drop all translations.
    /// The released tail returns to the reserved-only state.
    pub fn shrink_to(&mut self, new_size: usize) -> Result<(), CoreError> {
        let new_size = page_align(new_size).max(HOST_PAGE_SIZE);
        if new_size >= self.mem.size() {
            return self.reset();
        }
        self.mem.decommit();
        self.mem.set_size(new_size);
        self.used = 0;
        self.mem.commit()?;
        info!(
            name = self.mem.name(),
            size = new_size,
            "code cache shrunk"
        );
        Ok(())
    }

    /// Decommit the window entirely; any resident blocks die with it.
    pub fn decommit(&mut self) {
        self.used = 0;
        self.mem.decommit();
    }

    /// Map an unusable (uncommitted) reserve to the out-of-memory condition
    /// that downgrades this CPU role to its interpreter.
    pub fn ok_or_oom(&self) -> Result<(), CoreError> {
        if self.mem.is_committed() {
            Ok(())
        } else {
            Err(CoreError::OutOfMemory {
                name: self.mem.name(),
                fatal: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmem::VirtualMemoryManager;

    fn manager() -> Arc<VirtualMemoryManager> {
        Arc::new(VirtualMemoryManager::reserve("test", 0, 4 << 20, false).unwrap())
    }

    #[test]
    fn test_assign_rejects_out_of_range() {
        let mgr = manager();
        assert!(VirtualMemoryReserve::assign(
            "bad",
            mgr.clone(),
            3 << 20,
            2 << 20,
            PageProtection::rw()
        )
        .is_err());
    }

    #[test]
    fn test_commit_decommit_commit_round_trip() {
        let mgr = manager();
        let mut res =
            VirtualMemoryReserve::assign("ram", mgr, 0, 64 * 1024, PageProtection::rw()).unwrap();
        res.commit().unwrap();
        let before = res.committed();
        unsafe { res.as_mut_slice()[0] = 0xAB };
        res.decommit();
        assert_eq!(res.committed(), 0);
        res.commit().unwrap();
        assert_eq!(res.committed(), before);
        assert_eq!(unsafe { res.as_slice()[0] }, 0);
    }

    #[test]
    fn test_code_reserve_bump_alloc() {
        let mgr = manager();
        let mut code = RecompiledCodeReserve::assign("rec", mgr, 0, 64 * 1024).unwrap();
        let a = code.alloc(100).unwrap();
        let b = code.alloc(100).unwrap();
        assert_eq!(b as usize - a as usize, 112);
        assert!(code.alloc(64 * 1024).is_none());
        code.reset().unwrap();
        assert_eq!(code.used(), 0);
        assert!(code.alloc(64 * 1024).is_some());
    }

    #[test]
    fn test_code_reserve_shrink() {
        let mgr = manager();
        let mut code = RecompiledCodeReserve::assign("rec", mgr, 0, 64 * 1024).unwrap();
        code.shrink_to(16 * 1024).unwrap();
        assert_eq!(code.size(), 16 * 1024);
        assert!(code.alloc(32 * 1024).is_none());
        assert!(code.alloc(8 * 1024).is_some());
        code.ok_or_oom().unwrap();
    }
}

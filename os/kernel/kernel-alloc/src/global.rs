//! # Process-wide memory context
//!
//! The kernel builds its [`KernelMemory`] once during bring-up and parks it
//! here. Everything afterwards borrows it through [`with_kernel_memory`],
//! under a single spin lock that serializes PFA bitmap and heap list mutation.
//!
//! There is one CPU, so finding the lock held means the caller is nested
//! inside another borrow. That is reported as [`MemoryError::ContextBusy`]
//! instead of spinning forever. Code that allocates `alloc::*` collections
//! while it works with memory services takes a [`KernelServices`] handle,
//! which holds the lock for one call at a time.
//!
//! With the `global-allocator` feature the heap also backs `alloc::*`
//! collections through [`KernelHeap`].

use crate::error::{MemoryError, Result};
use crate::kernel_memory::KernelMemory;
use crate::services::MemoryServices;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::{SpinLock, SyncOnceCell};
use log::info;

#[cfg(not(test))]
pub type GlobalMapper = crate::phys_mapper::OffsetPhysMapper;
#[cfg(test)]
pub type GlobalMapper = &'static crate::sim::SimulatedRam;

pub type GlobalMemory = KernelMemory<GlobalMapper>;

static KERNEL_MEMORY: SyncOnceCell<SpinLock<GlobalMemory>> = SyncOnceCell::new();

/// Publish the memory context.
///
/// # Errors
/// Hands `memory` back if a context was installed before.
pub fn install(memory: GlobalMemory) -> core::result::Result<(), GlobalMemory> {
    KERNEL_MEMORY
        .set(SpinLock::new(memory))
        .map_err(SpinLock::into_inner)?;
    info!("kernel memory context installed");
    Ok(())
}

#[must_use]
pub fn is_installed() -> bool {
    KERNEL_MEMORY.is_initialized()
}

/// Run `f` with exclusive access to the installed context.
///
/// `f` must not allocate through the global allocator; see [`KernelServices`].
///
/// # Errors
/// `NotInitialized` before [`install`], `ContextBusy` when nested inside
/// another call.
pub fn with_kernel_memory<R>(f: impl FnOnce(&mut GlobalMemory) -> R) -> Result<R> {
    let cell = KERNEL_MEMORY.get().ok_or(MemoryError::NotInitialized)?;
    let mut guard = cell.try_lock().ok_or(MemoryError::ContextBusy)?;
    Ok(f(&mut guard))
}

/// [`MemoryServices`] over the installed context, locked per call.
///
/// Drivers handed this may allocate between calls without re-entering the
/// lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelServices;

impl MemoryServices for KernelServices {
    fn request_page(&mut self) -> Result<PhysicalAddress> {
        with_kernel_memory(GlobalMemory::request_page)?
    }

    fn lock_page(&mut self, page: PhysicalAddress) -> Result<()> {
        with_kernel_memory(|m| m.lock_page(page))?
    }

    fn lock_pages(&mut self, first: PhysicalAddress, count: u64) -> Result<()> {
        with_kernel_memory(|m| m.lock_pages(first, count))?
    }

    fn free_page(&mut self, page: PhysicalAddress) -> Result<()> {
        with_kernel_memory(|m| m.free_page(page))?
    }

    fn free_pages(&mut self, first: PhysicalAddress, count: u64) -> Result<()> {
        with_kernel_memory(|m| m.free_pages(first, count))?
    }

    fn reserve_page(&mut self, page: PhysicalAddress) -> Result<()> {
        with_kernel_memory(|m| m.reserve_page(page))?
    }

    fn map_memory(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        cacheable: bool,
    ) -> Result<()> {
        with_kernel_memory(|m| m.map_memory(va, pa, cacheable))?
    }

    fn unmap_memory(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        with_kernel_memory(|m| m.unmap_memory(va)).ok().flatten()
    }

    fn malloc(&mut self, size: usize) -> Result<Option<VirtualAddress>> {
        with_kernel_memory(|m| m.malloc(size))?
    }

    fn free(&mut self, ptr: VirtualAddress) -> Result<()> {
        with_kernel_memory(|m| m.free(ptr))?
    }

    fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<()> {
        with_kernel_memory(|m| m.read_bytes(va, buf))?
    }

    fn write_bytes(&mut self, va: VirtualAddress, data: &[u8]) -> Result<()> {
        with_kernel_memory(|m| m.write_bytes(va, data))?
    }

    fn fill_bytes(&mut self, va: VirtualAddress, value: u8, len: usize) -> Result<()> {
        with_kernel_memory(|m| m.fill_bytes(va, value, len))?
    }

    fn read_u32(&self, va: VirtualAddress) -> Result<u32> {
        with_kernel_memory(|m| m.read_u32(va))?
    }

    fn write_u32(&mut self, va: VirtualAddress, value: u32) -> Result<()> {
        with_kernel_memory(|m| m.write_u32(va, value))?
    }
}

#[cfg(feature = "global-allocator")]
pub use self::heap_allocator::KernelHeap;

#[cfg(feature = "global-allocator")]
mod heap_allocator {
    use super::with_kernel_memory;
    use crate::fatal::halt_with_diagnostic;
    use core::alloc::{GlobalAlloc, Layout};
    use core::ptr;
    use kernel_memory_addresses::VirtualAddress;

    /// `GlobalAlloc` over [`KernelMemory::allocate`](crate::KernelMemory::allocate).
    ///
    /// Alignments above one page get a null pointer.
    pub struct KernelHeap;

    #[cfg(not(test))]
    #[global_allocator]
    static GLOBAL_ALLOCATOR: KernelHeap = KernelHeap;

    unsafe impl GlobalAlloc for KernelHeap {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            match with_kernel_memory(|memory| memory.allocate(layout)) {
                Ok(Ok(Some(va))) => va.as_mut_ptr(),
                Ok(Ok(None)) => ptr::null_mut(),
                Ok(Err(e)) | Err(e) => halt_with_diagnostic(&e),
            }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if ptr.is_null() {
                return;
            }
            let va = VirtualAddress::from_ptr(ptr);
            match with_kernel_memory(|memory| memory.deallocate(va, layout)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) | Err(e) => halt_with_diagnostic(&e),
            }
        }
    }
}

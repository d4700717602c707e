//! # Memory Services
//!
//! The capability drivers and filesystems receive instead of reaching for the
//! allocators themselves. A driver that takes a page or maps a range is
//! responsible for giving it back through the same interface.

use crate::error::{MemoryError, Result};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

pub trait MemoryServices {
    /// Lock and return a free physical page.
    ///
    /// # Errors
    /// `OutOfMemory` when the PFA is exhausted.
    fn request_page(&mut self) -> Result<PhysicalAddress>;

    /// # Errors
    /// `InvalidAddress` outside the managed range.
    fn lock_page(&mut self, page: PhysicalAddress) -> Result<()>;

    /// # Errors
    /// `InvalidAddress` outside the managed range.
    fn lock_pages(&mut self, first: PhysicalAddress, count: u64) -> Result<()>;

    /// # Errors
    /// `InvalidAddress` outside the managed range.
    fn free_page(&mut self, page: PhysicalAddress) -> Result<()>;

    /// # Errors
    /// `InvalidAddress` outside the managed range.
    fn free_pages(&mut self, first: PhysicalAddress, count: u64) -> Result<()>;

    /// # Errors
    /// `InvalidAddress` outside the managed range.
    fn reserve_page(&mut self, page: PhysicalAddress) -> Result<()>;

    /// Map one 4 KiB page. Pass `cacheable = false` for device registers.
    ///
    /// # Errors
    /// `MappingFailure` when a page table cannot be allocated.
    fn map_memory(&mut self, va: VirtualAddress, pa: PhysicalAddress, cacheable: bool)
    -> Result<()>;

    /// Remove the mapping of one page, returning the frame it pointed to.
    fn unmap_memory(&mut self, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Allocate from the kernel heap; `Ok(None)` for a zero-size request.
    ///
    /// # Errors
    /// `OutOfMemory`, `RequestTooLarge` or `NotInitialized`.
    fn malloc(&mut self, size: usize) -> Result<Option<VirtualAddress>>;

    /// # Errors
    /// `ForeignPointer` for addresses that did not come from `malloc`.
    fn free(&mut self, ptr: VirtualAddress) -> Result<()>;

    /// Copy `buf.len()` bytes from `va`.
    ///
    /// # Errors
    /// `Unmapped` if any byte of the range has no mapping.
    fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<()>;

    /// # Errors
    /// `Unmapped` if any byte of the range has no mapping.
    fn write_bytes(&mut self, va: VirtualAddress, data: &[u8]) -> Result<()>;

    /// # Errors
    /// `Unmapped` if any byte of the range has no mapping.
    fn fill_bytes(&mut self, va: VirtualAddress, value: u8, len: usize) -> Result<()>;

    /// Little-endian load; implementations backing MMIO must use a single
    /// volatile access.
    ///
    /// # Errors
    /// `Unmapped` if the address has no mapping.
    fn read_u32(&self, va: VirtualAddress) -> Result<u32> {
        let mut raw = [0; 4];
        self.read_bytes(va, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// # Errors
    /// `Unmapped` if the address has no mapping.
    fn write_u32(&mut self, va: VirtualAddress, value: u32) -> Result<()> {
        self.write_bytes(va, &value.to_le_bytes())
    }

    /// Copy `s` plus a trailing NUL into a fresh heap block.
    ///
    /// # Errors
    /// As [`malloc`](Self::malloc).
    fn strdup(&mut self, s: &str) -> Result<VirtualAddress> {
        let ptr = self
            .malloc(s.len() + 1)?
            .ok_or(MemoryError::OutOfMemory)?;
        self.write_bytes(ptr, s.as_bytes())?;
        self.fill_bytes(VirtualAddress::new(ptr.as_u64() + s.len() as u64), 0, 1)?;
        Ok(ptr)
    }

    /// Map `pa` at its offset-mapped address and return that address.
    ///
    /// # Errors
    /// `InvalidAddress` above the 4 GiB window, otherwise as
    /// [`map_memory`](Self::map_memory).
    fn map_offset(&mut self, pa: PhysicalAddress, cacheable: bool) -> Result<VirtualAddress> {
        let va = pa
            .to_offset_mapped()
            .ok_or(MemoryError::InvalidAddress { address: pa })?;
        self.map_memory(va, pa, cacheable)?;
        Ok(va)
    }
}

//! # Offset-mapped physical access
//!
//! The kernel reaches physical address `P` at `P + DIRECT_MAP_OFFSET`. The
//! loader establishes this window before the kernel runs, and
//! [`KernelMemory::bring_up`](crate::KernelMemory::bring_up) rebuilds it in
//! the kernel's own page tables for every region the memory map lists.
//!
//! ```rust
//! use kernel_alloc::phys_mapper::OffsetPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let va = OffsetPhysMapper::virtual_of(PhysicalAddress::new(0x1000)).unwrap();
//! assert_eq!(va.as_u64(), 0xFFFF_FFFF_0000_1000);
//! ```

use kernel_info::memory::DIRECT_MAP_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] over the offset-mapped window.
#[derive(Debug, Default, Clone, Copy)]
pub struct OffsetPhysMapper;

impl OffsetPhysMapper {
    /// Where `pa` appears in the window, if it fits.
    #[inline]
    #[must_use]
    pub const fn virtual_of(pa: PhysicalAddress) -> Option<VirtualAddress> {
        pa.to_offset_mapped()
    }
}

impl PhysMapper for OffsetPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // Addresses above the window wrap to nonsense; the caller guarantees
        // `pa` lies below 4 GiB.
        let va = pa
            .to_offset_mapped()
            .map_or(core::ptr::null_mut(), VirtualAddress::as_mut_ptr::<T>);
        debug_assert!(!va.is_null(), "{pa:?} is outside the offset-mapped window");
        // SAFETY: the caller guarantees the window covers `pa` and upholds aliasing.
        unsafe { &mut *va }
    }

    unsafe fn phys_bytes<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        let first: *mut u8 = pa
            .to_offset_mapped()
            .map_or(core::ptr::null_mut(), VirtualAddress::as_mut_ptr::<u8>);
        debug_assert!(!first.is_null(), "{pa:?} is outside the offset-mapped window");
        // SAFETY: the window maps physical memory contiguously; the caller
        // guarantees the range is inside it.
        unsafe { core::slice::from_raw_parts_mut(first, len) }
    }

    fn reach_end(&self) -> Option<PhysicalAddress> {
        Some(PhysicalAddress::new(DIRECT_MAP_SIZE))
    }
}

//! # Physical and Virtual Address Types
//!
//! Strongly typed wrappers for the two address spaces the memory core juggles:
//! physical addresses handed out by the page frame allocator, and virtual
//! addresses the CPU dereferences once paging is enabled.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address translated through the page tables. |
//! | [`PhysicalPage`] | A 4 KiB aligned physical frame base. |
//! | [`VirtualPage`] | A 4 KiB aligned virtual page base. |
//!
//! All types are `#[repr(transparent)]` over `u64` and cost nothing at runtime.
//!
//! ## Offset-mapped access
//!
//! Drivers never touch physical memory through an identity mapping. Instead every
//! physical page they obtain is mapped at `physical + DIRECT_MAP_OFFSET`, and on-disk
//! or device structure pointers are derived the same way. The conversion lives on
//! the type so it cannot be forgotten at a call site:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2000);
//! let va = pa.to_offset_mapped().unwrap();
//! assert_eq!(va.as_u64(), 0xFFFF_FFFF_0010_2000);
//! assert_eq!(va.offset_mapped_physical(), Some(pa));
//! ```
//!
//! ## Page arithmetic
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_8800_0000_1234);
//! let (page, offset) = va.split();
//! assert_eq!(page.base().as_u64(), 0xFFFF_8800_0000_1000);
//! assert_eq!(offset, 0x234);
//! assert_eq!(page.join(offset), va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page;
mod physical_address;
mod virtual_address;

pub use page::{PhysicalPage, VirtualPage};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of a base page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Additive offset at which physical memory is reachable from the kernel.
///
/// A physical address `P` is accessed through the virtual address
/// `P + DIRECT_MAP_OFFSET`. Only the low 4 GiB fit below the top of the
/// address space.
pub const DIRECT_MAP_OFFSET: u64 = 0xFFFF_FFFF_0000_0000;

/// Align `x` down to a multiple of `a` (power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x12345, 4096), 0x12000);
/// assert_eq!(align_down(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to a multiple of `a` (power of two).
///
/// `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 8), 8);
/// assert_eq!(align_up(4097, 4096), 8192);
/// assert_eq!(align_up(0, 4096), 0);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Number of 4 KiB pages needed to cover `bytes`.
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_mapping_round_trips() {
        let pa = PhysicalAddress::new(0x0000_0000_FEBF_1000);
        let va = pa.to_offset_mapped().expect("below 4 GiB");
        assert_eq!(va.as_u64(), 0xFFFF_FFFF_FEBF_1000);
        assert_eq!(va.offset_mapped_physical(), Some(pa));
    }

    #[test]
    fn offset_mapping_rejects_high_memory() {
        let pa = PhysicalAddress::new(0x1_0000_0000);
        assert_eq!(pa.to_offset_mapped(), None);
    }

    #[test]
    fn addresses_below_the_window_are_not_offset_mapped() {
        assert_eq!(VirtualAddress::new(0xFFFF_8800_0000_0000).offset_mapped_physical(), None);
    }

    #[test]
    fn split_and_join() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let (frame, offset) = pa.split();
        assert_eq!(frame.base().as_u64(), 0x0000_0010_2000_0000);
        assert_eq!(offset, 0x42);
        assert_eq!(frame.join(offset), pa);
    }

    #[test]
    fn table_indices() {
        // PML4 272 / PDPT 0 / PD 0 / PT 1
        let va = VirtualAddress::new(0xFFFF_8800_0000_1000);
        assert_eq!(va.pml4_index(), 272);
        assert_eq!(va.pdpt_index(), 0);
        assert_eq!(va.pd_index(), 0);
        assert_eq!(va.pt_index(), 1);

        let va = VirtualAddress::new(0xFFFF_FFFF_0010_0000);
        assert_eq!(va.pml4_index(), 511);
        assert_eq!(va.pdpt_index(), 508);
        assert_eq!(va.pd_index(), 0);
        assert_eq!(va.pt_index(), 256);
    }

    #[test]
    fn canonical_form() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0xFFFF_7FFF_FFFF_FFFF).is_canonical());
    }

    #[test]
    fn page_counts() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(4096), 1);
        assert_eq!(pages_for(4097), 2);
    }
}

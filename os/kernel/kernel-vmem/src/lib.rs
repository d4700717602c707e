//! # Virtual Memory Support
//!
//! The Page Table Manager: x86-64 4-level paging structures and an
//! [`AddressSpace`] that maps arbitrary virtual pages to arbitrary physical
//! frames, pulling intermediate tables from a [`FrameAlloc`] on demand.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 63‒48 | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! | sign  |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   maps a 4 KiB frame
//!   │        │        └────────────► PDE   PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! Every table holds 512 eight-byte [`PageEntry`] values and occupies exactly
//! one 4 KiB frame. Bits 63‒48 of a virtual address must repeat bit 47
//! (canonical form) or the CPU faults.
//!
//! [`AddressSpace::map_memory`] only ever *creates* 4 KiB leaves. Large pages
//! are honored when translating but never built.
//!
//! ## TLB
//!
//! Nothing in this crate flushes the TLB implicitly. After changing a live
//! mapping call [`AddressSpace::invalidate`] or reload CR3.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod entry;
mod error;
mod table;

pub use crate::address_space::AddressSpace;
pub use crate::entry::PageEntry;
pub use crate::error::MapError;
pub use crate::table::{ENTRIES, PageTable, TableLevel};
pub use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};

/// Source of physical 4 KiB frames for page tables.
///
/// Returned frames **must** be page aligned and not otherwise in use.
/// `None` means out of memory.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage>;
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        (**self).alloc_4k()
    }
}

/// Turns a physical address into a usable reference in the current address space.
///
/// The kernel implements this with the offset-mapped window at
/// `physical + DIRECT_MAP_OFFSET`; tests back it with plain host memory.
pub trait PhysMapper {
    /// Access the `T` living at physical address `pa`.
    ///
    /// # Safety
    /// - `pa` must be reachable and writable through this mapper for all of `'a`.
    /// - `pa` must be suitably aligned for `T` and the bytes must be a valid `T`.
    /// - The caller must not create overlapping live references.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Access `len` bytes starting at `pa`.
    ///
    /// # Safety
    /// As [`phys_to_mut`](Self::phys_to_mut), for the whole range. The range
    /// must be mapped contiguously by this mapper.
    unsafe fn phys_bytes<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8];

    /// First physical address this mapper cannot reach, if there is one.
    fn reach_end(&self) -> Option<PhysicalAddress> {
        None
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: forwarded contract.
        unsafe { (**self).phys_to_mut(pa) }
    }

    #[inline]
    unsafe fn phys_bytes<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        // SAFETY: forwarded contract.
        unsafe { (**self).phys_bytes(pa, len) }
    }

    #[inline]
    fn reach_end(&self) -> Option<PhysicalAddress> {
        (**self).reach_end()
    }
}

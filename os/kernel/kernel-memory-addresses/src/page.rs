//! 4 KiB page bases.

use crate::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use core::fmt;

/// A 4 KiB aligned physical frame.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(PhysicalAddress);

impl PhysicalPage {
    /// Frame containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(PhysicalAddress::new(addr.as_u64() & !(PAGE_SIZE - 1)))
    }

    /// Wrap an address that must already be aligned.
    /// Panics in debug if unaligned.
    #[inline]
    #[must_use]
    pub fn from_aligned(addr: PhysicalAddress) -> Self {
        debug_assert!(addr.is_page_aligned(), "unaligned frame address {addr:?}");
        Self::containing(addr)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        PhysicalAddress::new(self.0.as_u64() + (offset & (PAGE_SIZE - 1)))
    }

    /// The frame `n` pages after this one.
    #[inline]
    #[must_use]
    pub const fn nth(self, n: u64) -> Self {
        Self(PhysicalAddress::new(self.0.as_u64() + n * PAGE_SIZE))
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:016X})", self.0.as_u64())
    }
}

impl From<PhysicalPage> for PhysicalAddress {
    #[inline]
    fn from(p: PhysicalPage) -> Self {
        p.base()
    }
}

/// A 4 KiB aligned virtual page.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(VirtualAddress);

impl VirtualPage {
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self(VirtualAddress::new(addr.as_u64() & !(PAGE_SIZE - 1)))
    }

    #[inline]
    #[must_use]
    pub fn from_aligned(addr: VirtualAddress) -> Self {
        debug_assert!(addr.is_page_aligned(), "unaligned page address {addr:?}");
        Self::containing(addr)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> VirtualAddress {
        VirtualAddress::new(self.0.as_u64() + (offset & (PAGE_SIZE - 1)))
    }

    #[inline]
    #[must_use]
    pub const fn nth(self, n: u64) -> Self {
        Self(VirtualAddress::new(self.0.as_u64() + n * PAGE_SIZE))
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:016X})", self.0.as_u64())
    }
}

impl From<VirtualPage> for VirtualAddress {
    #[inline]
    fn from(p: VirtualPage) -> Self {
        p.base()
    }
}

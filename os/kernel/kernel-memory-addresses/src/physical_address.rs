use crate::{DIRECT_MAP_OFFSET, PAGE_SIZE, PhysicalPage, VirtualAddress};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Physical memory address.
///
/// Denotes host RAM or MMIO as seen by the memory controller, never something
/// the CPU can dereference directly once paging is on. Use
/// [`to_offset_mapped`](Self::to_offset_mapped) to obtain the virtual address the
/// kernel reaches it through.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The 4 KiB frame that contains this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage {
        PhysicalPage::containing(self)
    }

    /// Byte offset inside the containing 4 KiB frame.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn split(self) -> (PhysicalPage, u64) {
        (self.page(), self.offset())
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// The virtual address this physical address is reachable at through the
    /// fixed direct-map offset, or `None` if it lies above the 4 GiB window.
    #[inline]
    #[must_use]
    pub const fn to_offset_mapped(self) -> Option<VirtualAddress> {
        match self.0.checked_add(DIRECT_MAP_OFFSET) {
            Some(v) => Some(VirtualAddress::new(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<PhysicalAddress> for u64 {
    #[inline]
    fn from(a: PhysicalAddress) -> Self {
        a.0
    }
}

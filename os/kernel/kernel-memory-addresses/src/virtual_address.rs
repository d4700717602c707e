use crate::{DIRECT_MAP_OFFSET, PAGE_SIZE, PhysicalAddress, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign};

/// Virtual memory address.
///
/// Carries the *kind* of address only; canonical form is not enforced on
/// construction but can be checked with [`is_canonical`](Self::is_canonical).
///
/// The four page-table indices are the 9-bit fields above the 12-bit page offset:
///
/// ```text
/// | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
/// |  PML4 |  PDPT |   PD  |   PT  | Offset |
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn split(self) -> (VirtualPage, u64) {
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

    /// Bits 63..48 replicate bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == 0x1_FFFF
    }

    #[inline]
    #[must_use]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1FF) as usize
    }

    #[inline]
    #[must_use]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1FF) as usize
    }

    #[inline]
    #[must_use]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1FF) as usize
    }

    #[inline]
    #[must_use]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1FF) as usize
    }

    /// Inverse of [`PhysicalAddress::to_offset_mapped`]; `None` if this address
    /// is not inside the direct-map window.
    #[inline]
    #[must_use]
    pub const fn offset_mapped_physical(self) -> Option<PhysicalAddress> {
        if self.0 >= DIRECT_MAP_OFFSET {
            Some(PhysicalAddress::new(self.0 - DIRECT_MAP_OFFSET))
        } else {
            None
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

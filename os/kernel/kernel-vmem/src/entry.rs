//! # Page Table Entry
//!
//! One 64-bit entry, shared by all four levels. At PML4/PDPT/PD level a present
//! entry (with `PS=0`) points at the next table; at PT level it maps a 4 KiB frame.
//!
//! | Bits  | Name | Meaning |
//! |-------|------|---------|
//! | 0     | P    | Present |
//! | 1     | RW   | Writable |
//! | 2     | US   | User accessible |
//! | 3     | PWT  | Write-through |
//! | 4     | PCD  | Cache disabled |
//! | 5     | A    | Accessed |
//! | 6     | D    | Dirty (leaf only) |
//! | 7     | PS   | Large page (PDPT/PD only) |
//! | 8     | G    | Global (leaf only) |
//! | 9–11  |      | OS available |
//! | 12–51 |      | Physical frame number |
//! | 52–62 |      | OS available |
//! | 63    | NX   | No execute |
//!
//! The address field of a non-present entry is meaningless and is never
//! followed.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

#[bitfield(u64)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    pub available_low: u8,
    /// Physical address bits 51..12.
    #[bits(40)]
    frame_number: u64,
    #[bits(11)]
    pub available_high: u16,
    pub no_execute: bool,
}

impl PageEntry {
    /// Non-present entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// Entry pointing at a next-level table: Present + ReadWrite.
    #[inline]
    #[must_use]
    pub const fn table(next: PhysicalPage) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_number(next.base().as_u64() >> 12)
    }

    /// Leaf mapping a 4 KiB frame: Present + ReadWrite, plus WriteThrough and
    /// CacheDisabled when `cacheable` is false (MMIO).
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage, cacheable: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_write_through(!cacheable)
            .with_cache_disabled(!cacheable)
            .with_frame_number(frame.base().as_u64() >> 12)
    }

    /// Decoded physical address (frame base).
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_number() << 12)
    }

    /// The next-level table or mapped frame, if present.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> Option<PhysicalPage> {
        if self.present() {
            Some(PhysicalPage::containing(self.address()))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        !self.cache_disabled() && !self.write_through()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_entry_is_present_and_writable() {
        let e = PageEntry::table(PhysicalPage::containing(PhysicalAddress::new(0x0010_3000)));
        assert!(e.present());
        assert!(e.writable());
        assert!(!e.user());
        assert!(!e.large_page());
        assert_eq!(e.address().as_u64(), 0x0010_3000);
        assert_eq!(e.into_bits(), 0x0010_3003);
    }

    #[test]
    fn uncached_leaf_sets_pwt_and_pcd() {
        let frame = PhysicalPage::containing(PhysicalAddress::new(0xFEBF_1000));
        let mmio = PageEntry::leaf(frame, false);
        assert!(mmio.write_through());
        assert!(mmio.cache_disabled());
        assert!(!mmio.is_cacheable());

        let ram = PageEntry::leaf(frame, true);
        assert!(ram.is_cacheable());
        assert_eq!(ram.into_bits(), 0xFEBF_1003);
        assert_eq!(mmio.into_bits(), 0xFEBF_101B);
    }

    #[test]
    fn address_field_survives_high_bits() {
        let frame = PhysicalPage::containing(PhysicalAddress::new(0x000F_FFFF_FFFF_F000));
        let e = PageEntry::leaf(frame, true).with_no_execute(true);
        assert_eq!(e.address().as_u64(), 0x000F_FFFF_FFFF_F000);
        assert!(e.no_execute());
    }

    #[test]
    fn zero_entry_has_no_frame() {
        assert!(PageEntry::zero().frame().is_none());
    }
}

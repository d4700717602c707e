//! # Firmware Memory Map
//!
//! The raw `EFI_MEMORY_DESCRIPTOR` array handed over by the loader. Firmware
//! reports its own stride (`descSize`), which is usually larger than
//! `size_of::<MemoryDescriptor>()`, so descriptors are located by stride and
//! read unaligned.

use kernel_info::boot::MemoryMapInfo;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use uefi::mem::memory_map::{MemoryDescriptor, MemoryType};

/// Borrowed view of a memory map buffer.
#[derive(Clone, Copy)]
pub struct MemoryMap<'a> {
    bytes: &'a [u8],
    desc_size: usize,
}

impl<'a> MemoryMap<'a> {
    /// A `desc_size` smaller than a descriptor yields an empty map.
    #[must_use]
    pub const fn new(bytes: &'a [u8], desc_size: usize) -> Self {
        Self { bytes, desc_size }
    }

    /// View the map described by the boot information.
    ///
    /// # Safety
    /// The buffer named by `info` must be readable for `'a`.
    #[must_use]
    pub unsafe fn from_boot_info(info: &MemoryMapInfo) -> Self {
        let bytes = unsafe { info.as_bytes() };
        let desc_size = usize::try_from(info.mmap_desc_size).unwrap_or(0);
        Self::new(bytes, desc_size)
    }

    /// Number of descriptors.
    #[must_use]
    pub const fn len(&self) -> usize {
        if self.desc_size < size_of::<MemoryDescriptor>() {
            0
        } else {
            self.bytes.len() / self.desc_size
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn iter(&self) -> Descriptors<'a> {
        Descriptors {
            map: *self,
            next: 0,
        }
    }

    /// Lowest `PhysicalStart` and highest end over all descriptors.
    #[must_use]
    pub fn span(&self) -> Option<(PhysicalAddress, PhysicalAddress)> {
        self.iter().fold(None, |acc: Option<(u64, u64)>, d| {
            let start = d.phys_start;
            let end = region_end(&d);
            Some(match acc {
                None => (start, end),
                Some((lo, hi)) => (lo.min(start), hi.max(end)),
            })
        })
        .map(|(lo, hi)| (PhysicalAddress::new(lo), PhysicalAddress::new(hi)))
    }

    /// The conventional region with the most pages (the first on ties).
    #[must_use]
    pub fn largest_conventional(&self) -> Option<MemoryDescriptor> {
        self.largest_conventional_below(u64::MAX)
    }

    /// As [`largest_conventional`](Self::largest_conventional), counting only
    /// the pages that end at or below `limit`. The returned descriptor is
    /// clipped to them.
    #[must_use]
    pub fn largest_conventional_below(&self, limit: u64) -> Option<MemoryDescriptor> {
        self.iter()
            .filter(|d| d.ty == MemoryType::CONVENTIONAL)
            .filter_map(|mut d| {
                d.page_count = pages_below(&d, limit);
                (d.page_count > 0).then_some(d)
            })
            .fold(None, |best: Option<MemoryDescriptor>, d| match best {
                Some(b) if b.page_count >= d.page_count => Some(b),
                _ => Some(d),
            })
    }
}

impl<'a> IntoIterator for &MemoryMap<'a> {
    type Item = MemoryDescriptor;
    type IntoIter = Descriptors<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct Descriptors<'a> {
    map: MemoryMap<'a>,
    next: usize,
}

impl Iterator for Descriptors<'_> {
    type Item = MemoryDescriptor;

    fn next(&mut self) -> Option<MemoryDescriptor> {
        if self.next >= self.map.len() {
            return None;
        }
        let offset = self.next * self.map.desc_size;
        self.next += 1;
        let bytes = &self.map.bytes[offset..offset + size_of::<MemoryDescriptor>()];
        // SAFETY: the slice holds a full descriptor; the read tolerates any alignment.
        Some(unsafe { bytes.as_ptr().cast::<MemoryDescriptor>().read_unaligned() })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.map.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Descriptors<'_> {}

/// Memory the kernel may hand out once boot services are gone.
#[must_use]
pub fn is_allocatable(ty: MemoryType) -> bool {
    ty == MemoryType::CONVENTIONAL
        || ty == MemoryType::BOOT_SERVICES_CODE
        || ty == MemoryType::BOOT_SERVICES_DATA
}

/// Regions the loader wrote into: the kernel image, boot info and the map itself.
#[must_use]
pub fn is_loader(ty: MemoryType) -> bool {
    ty == MemoryType::LOADER_CODE || ty == MemoryType::LOADER_DATA
}

/// First byte past the region.
#[must_use]
pub const fn region_end(d: &MemoryDescriptor) -> u64 {
    d.phys_start.saturating_add(d.page_count.saturating_mul(PAGE_SIZE))
}

/// Whole pages of the region that lie below `limit`.
#[must_use]
pub const fn pages_below(d: &MemoryDescriptor, limit: u64) -> u64 {
    if d.phys_start >= limit {
        return 0;
    }
    let end = if region_end(d) < limit { region_end(d) } else { limit };
    (end - d.phys_start) / PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use uefi::mem::memory_map::MemoryAttribute;

    const STRIDE: usize = 48;

    fn desc(ty: MemoryType, start: u64, pages: u64) -> MemoryDescriptor {
        MemoryDescriptor {
            ty,
            phys_start: start,
            virt_start: 0,
            page_count: pages,
            att: MemoryAttribute::empty(),
        }
    }

    fn encode(descs: &[MemoryDescriptor]) -> Vec<u8> {
        let mut out = vec![0xCC; descs.len() * STRIDE + 3];
        for (n, d) in descs.iter().enumerate() {
            // Odd base offset so reads are unaligned.
            let at = 3 + n * STRIDE;
            unsafe {
                out.as_mut_ptr()
                    .add(at)
                    .cast::<MemoryDescriptor>()
                    .write_unaligned(*d);
            }
        }
        out
    }

    #[test]
    fn walks_descriptors_by_firmware_stride() {
        let raw = encode(&[
            desc(MemoryType::CONVENTIONAL, 0x10_0000, 16),
            desc(MemoryType::RESERVED, 0x11_0000, 4),
        ]);
        let map = MemoryMap::new(&raw[3..], STRIDE);
        assert_eq!(map.len(), 2);

        let all: Vec<_> = map.iter().map(|d| (d.ty, d.phys_start, d.page_count)).collect();
        assert_eq!(
            all,
            [
                (MemoryType::CONVENTIONAL, 0x10_0000, 16),
                (MemoryType::RESERVED, 0x11_0000, 4)
            ]
        );
        assert_eq!(
            map.span(),
            Some((PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x11_4000)))
        );
    }

    #[test]
    fn picks_the_largest_conventional_region() {
        let raw = encode(&[
            desc(MemoryType::CONVENTIONAL, 0x1000, 8),
            desc(MemoryType::BOOT_SERVICES_DATA, 0x10_0000, 400),
            desc(MemoryType::CONVENTIONAL, 0x20_0000, 64),
            desc(MemoryType::CONVENTIONAL, 0x40_0000, 64),
        ]);
        let map = MemoryMap::new(&raw[3..], STRIDE);
        let best = map.largest_conventional().unwrap();
        assert_eq!(best.phys_start, 0x20_0000);
    }

    #[test]
    fn largest_region_is_clipped_to_a_limit() {
        let raw = encode(&[
            desc(MemoryType::CONVENTIONAL, 0x10_0000, 16),
            desc(MemoryType::CONVENTIONAL, 0xFFF0_0000, 0x100),
            desc(MemoryType::CONVENTIONAL, 0x1_0000_0000, 0x4_0000),
        ]);
        let map = MemoryMap::new(&raw[3..], STRIDE);
        let pick = |limit| {
            map.largest_conventional_below(limit)
                .map(|d| (d.phys_start, d.page_count))
        };

        assert_eq!(pick(u64::MAX), Some((0x1_0000_0000, 0x4_0000)));
        assert_eq!(pick(0x1_0000_0000), Some((0xFFF0_0000, 0x100)));
        assert_eq!(pick(0x1_0020_0000), Some((0x1_0000_0000, 0x200)));
        assert_eq!(pick(0xFFF8_0000), Some((0xFFF0_0000, 0x80)));
        assert_eq!(pick(0x10_0000), None);
    }

    #[test]
    fn undersized_stride_reads_nothing() {
        let raw = encode(&[desc(MemoryType::CONVENTIONAL, 0, 1)]);
        let map = MemoryMap::new(&raw, 8);
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
        assert!(map.span().is_none());
    }

    #[test]
    fn classification() {
        assert!(is_allocatable(MemoryType::CONVENTIONAL));
        assert!(is_allocatable(MemoryType::BOOT_SERVICES_CODE));
        assert!(is_allocatable(MemoryType::BOOT_SERVICES_DATA));
        assert!(!is_allocatable(MemoryType::LOADER_DATA));
        assert!(!is_allocatable(MemoryType::ACPI_RECLAIM));
        assert!(!is_allocatable(MemoryType::MMIO));
        assert!(is_loader(MemoryType::LOADER_CODE));
    }
}

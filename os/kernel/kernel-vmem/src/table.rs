use crate::entry::PageEntry;
use core::fmt;

/// Entries per table at every level.
pub const ENTRIES: usize = 512;

/// One paging structure: 512 entries, 4 KiB aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

/// Paging level, root first.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TableLevel {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        })
    }
}

use crate::table::TableLevel;
use kernel_memory_addresses::VirtualAddress;

/// Failure of a page-table walk that had to build missing levels.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// No frame for a fresh PML4.
    #[error("out of memory allocating the PML4")]
    OomPml4,
    #[error("out of memory allocating a PDPT")]
    OomPdpt,
    #[error("out of memory allocating a PD")]
    OomPd,
    #[error("out of memory allocating a PT")]
    OomPt,
    #[error("virtual address {0:?} is not canonical")]
    NonCanonical(VirtualAddress),
    /// A large page at `level` already covers the address.
    #[error("a large page at {level} covers {va:?}")]
    LargePageInTheWay { va: VirtualAddress, level: TableLevel },
}

impl MapError {
    /// The allocation error for building a table at `level`.
    pub(crate) const fn oom_for(level: TableLevel) -> Self {
        match level {
            TableLevel::Pml4 => Self::OomPml4,
            TableLevel::Pdpt => Self::OomPdpt,
            TableLevel::Pd => Self::OomPd,
            TableLevel::Pt => Self::OomPt,
        }
    }

    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OomPml4 | Self::OomPdpt | Self::OomPd | Self::OomPt)
    }
}

use crate::bitmap::BitmapError;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::MapError;

/// Failures of the memory core.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    /// The PFA has no free page left, or the heap could not grow.
    #[error("out of physical memory")]
    OutOfMemory,
    /// The address lies outside the range described by the memory map.
    #[error("physical address {address:?} is outside the managed range")]
    InvalidAddress { address: PhysicalAddress },
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
    #[error("page table mapping failed: {0}")]
    MappingFailure(#[from] MapError),
    /// The rounded request does not fit a single page-sized block.
    #[error("heap request of {size} bytes exceeds one block")]
    RequestTooLarge { size: usize },
    #[error("no memory map has been read yet")]
    NotInitialized,
    /// The virtual address has no present mapping.
    #[error("virtual address {address:?} is not mapped")]
    Unmapped { address: VirtualAddress },
    /// `free` got a pointer that cannot have come from the heap.
    #[error("{address:?} is not a heap allocation")]
    ForeignPointer { address: VirtualAddress },
    /// The installed context is already borrowed further up the stack.
    #[error("kernel memory context is already in use")]
    ContextBusy,
}

pub type Result<T, E = MemoryError> = core::result::Result<T, E>;

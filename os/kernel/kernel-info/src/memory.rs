//! # Memory Layout

pub use kernel_memory_addresses::{DIRECT_MAP_OFFSET, PAGE_SIZE};

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0xffff_0000_0000_0000;

/// Fixed virtual base of the kernel heap.
pub const HEAP_BASE: u64 = 0xffff_8800_0000_0000;

/// Virtual base for allocations served as whole pages instead of heap blocks.
pub const PAGE_ALLOC_BASE: u64 = 0xffff_8c00_0000_0000;

/// Where the kernel executes (VMA).
///
/// This lies inside the direct-map window; the kernel image mapping takes
/// precedence over the offset mapping of the physical range below it.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the loader places the kernel bytes in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Low bootstrap region kept identity mapped so the paging switch code keeps
/// executing right after the CR3 reload.
pub const IDENTITY_LOW_BYTES: u64 = 0x20_0000; // 2 MiB

/// Size of the direct-map window: physical memory beyond this is not reachable
/// through [`DIRECT_MAP_OFFSET`].
pub const DIRECT_MAP_SIZE: u64 = 0x1_0000_0000; // 4 GiB

const _: () = {
    assert!(PAGE_SIZE == 4096);
    assert!(HEAP_BASE >= LAST_USERSPACE_ADDRESS);
    assert!(HEAP_BASE.is_multiple_of(PAGE_SIZE));
    assert!(DIRECT_MAP_OFFSET > HEAP_BASE);
    assert!(PAGE_ALLOC_BASE > HEAP_BASE && PAGE_ALLOC_BASE < DIRECT_MAP_OFFSET);
    assert!(DIRECT_MAP_OFFSET.wrapping_add(DIRECT_MAP_SIZE) == 0);
    assert!(KERNEL_BASE > DIRECT_MAP_OFFSET);
    assert!(IDENTITY_LOW_BYTES.is_multiple_of(PAGE_SIZE));
};

//! # Kernel Boot Information
//!
//! The loader fills a [`KernelBootInfo`] after `ExitBootServices` and passes a
//! pointer to it to the kernel entry point. Everything here crosses the
//! loader/kernel boundary, so all structures are `#[repr(C)]` with fixed-size
//! integers.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Kernel function pointer.
///
/// # ABI
/// The ABI is defined as `win64` since the kernel is called from a UEFI
/// (PE/COFF) application.
pub type KernelEntryFn = extern "win64" fn(*const KernelBootInfo) -> !;

/// Information the kernel needs right after `ExitBootServices`.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct KernelBootInfo {
    /// The firmware memory map, the sole input to page frame allocation.
    pub mmap: MemoryMapInfo,

    /// RSDP (ACPI 2.0+) physical address, or 0 if not provided.
    pub rsdp_addr: u64,

    /// Framebuffer information, passed from UEFI GOP.
    pub fb: FramebufferInfo,

    /// Where the loader placed the kernel image.
    pub kernel: KernelImageInfo,
}

#[repr(C)]
#[derive(Clone, Debug)]
pub struct MemoryMapInfo {
    /// Pointer to the raw UEFI memory map buffer (array of `EFI_MEMORY_DESCRIPTOR` bytes).
    pub mmap_ptr: u64,

    /// Length of the memory map buffer in **bytes** (`mapSize`).
    pub mmap_len: u64,

    /// Stride between descriptors in bytes (`descSize`). Firmware may report
    /// more than `size_of::<EFI_MEMORY_DESCRIPTOR>()`.
    pub mmap_desc_size: u64,

    /// Descriptor version (from UEFI).
    pub mmap_desc_version: u32,
}

impl MemoryMapInfo {
    /// View the memory map buffer as bytes.
    ///
    /// # Safety
    /// `mmap_ptr` must point to `mmap_len` readable bytes that stay valid for `'a`.
    #[must_use]
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        if self.mmap_ptr == 0 || self.mmap_len == 0 {
            return &[];
        }
        let len = usize::try_from(self.mmap_len).unwrap_or(0);
        // SAFETY: the caller vouches for pointer and length.
        unsafe { core::slice::from_raw_parts(self.mmap_ptr as *const u8, len) }
    }
}

#[repr(C)]
#[derive(Clone, Debug)]
pub struct FramebufferInfo {
    /// Linear framebuffer base address (CPU physical address).
    pub framebuffer_ptr: u64,

    /// Total framebuffer size in **bytes**.
    pub framebuffer_size: u64,

    /// Visible width in **pixels**.
    pub framebuffer_width: u64,

    /// Visible height in **pixels**.
    pub framebuffer_height: u64,

    /// Pixels per scanline. May be >= width due to padding.
    pub framebuffer_stride: u64,
}

impl FramebufferInfo {
    /// `true` if the loader handed over a linear framebuffer.
    #[inline]
    #[must_use]
    pub const fn is_present(&self) -> bool {
        self.framebuffer_ptr != 0 && self.framebuffer_size != 0
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.framebuffer_ptr)
    }
}

/// Physical placement and link address of the kernel image.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct KernelImageInfo {
    /// First physical byte of the loaded image (page aligned).
    pub phys_start: u64,

    /// Virtual address the image is linked at.
    pub virt_start: u64,

    /// Image length in bytes, including `.bss`.
    pub len: u64,
}

impl KernelImageInfo {
    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_start)
    }

    #[inline]
    #[must_use]
    pub const fn virt(&self) -> VirtualAddress {
        VirtualAddress::new(self.virt_start)
    }
}

//! Simulated physical memory for host tests.
//!
//! [`SimulatedRam`] owns a run of page-aligned host frames that pretend to
//! start at some physical address. Through its [`PhysMapper`] impl the PFA
//! bitmap, page tables, heap headers and device buffers all live in ordinary
//! host memory while keeping their physical addresses.

use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_vmem::PhysMapper;
use uefi::mem::memory_map::{MemoryAttribute, MemoryDescriptor, MemoryType};

use crate::memory_map::MemoryMap;

/// Stride used by [`encode_memory_map`]; larger than a descriptor, like real firmware.
pub const DESCRIPTOR_STRIDE: usize = 48;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

pub struct SimulatedRam {
    base: PhysicalAddress,
    frames: *mut Frame,
    pages: usize,
    reach: Option<PhysicalAddress>,
    _owner: Vec<Frame>,
}

impl SimulatedRam {
    /// `pages` zeroed frames starting at `base`.
    #[must_use]
    pub fn new(base: PhysicalAddress, pages: usize) -> Self {
        Self::with_pattern(base, pages, 0)
    }

    /// Frames filled with `byte`, to catch memory that should have been cleared.
    #[must_use]
    pub fn with_pattern(base: PhysicalAddress, pages: usize, byte: u8) -> Self {
        assert!(base.is_page_aligned(), "simulated RAM base {base:?} is not page aligned");
        let mut owner: Vec<Frame> = (0..pages).map(|_| Frame([byte; PAGE_SIZE as usize])).collect();
        let frames = owner.as_mut_ptr();
        Self {
            base,
            frames,
            pages,
            reach: None,
            _owner: owner,
        }
    }

    /// Report `end` as the edge of what the mapper reaches, the way the
    /// offset window stops at 4 GiB.
    #[must_use]
    pub fn with_reach_end(mut self, end: PhysicalAddress) -> Self {
        self.reach = Some(end);
        self
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// First address past the simulated range.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + self.pages as u64 * PAGE_SIZE)
    }

    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress, len: u64) -> bool {
        pa.as_u64() >= self.base.as_u64() && pa.as_u64() + len <= self.end().as_u64()
    }

    /// Host-side peek at physical memory.
    pub fn read(&self, pa: PhysicalAddress, buf: &mut [u8]) {
        let src = self.host_ptr(pa, buf.len());
        // SAFETY: `host_ptr` checked the range.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }

    /// Host-side poke at physical memory.
    pub fn write(&self, pa: PhysicalAddress, data: &[u8]) {
        let dst = self.host_ptr(pa, data.len());
        // SAFETY: `host_ptr` checked the range.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }

    #[must_use]
    pub fn read_u32(&self, pa: PhysicalAddress) -> u32 {
        let mut raw = [0; 4];
        self.read(pa, &mut raw);
        u32::from_le_bytes(raw)
    }

    pub fn write_u32(&self, pa: PhysicalAddress, value: u32) {
        self.write(pa, &value.to_le_bytes());
    }

    #[must_use]
    pub fn bytes(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        self.read(pa, &mut out);
        out
    }

    /// View bytes produced by [`encode_memory_map`].
    #[must_use]
    pub const fn memory_map(raw: &[u8]) -> MemoryMap<'_> {
        MemoryMap::new(raw, DESCRIPTOR_STRIDE)
    }

    fn host_ptr(&self, pa: PhysicalAddress, len: usize) -> *mut u8 {
        assert!(
            self.contains(pa, len as u64),
            "{pa:?}+{len:#x} is outside simulated RAM {:?}..{:?}",
            self.base,
            self.end()
        );
        let offset = usize::try_from(pa.as_u64() - self.base.as_u64()).unwrap_or(usize::MAX);
        // SAFETY: in bounds of the owned frames.
        unsafe { self.frames.cast::<u8>().add(offset) }
    }
}

// SAFETY: the frames are owned for the lifetime of the value; aliasing of the
// bytes handed out is governed by the `PhysMapper` contract, as for real RAM.
unsafe impl Send for SimulatedRam {}
unsafe impl Sync for SimulatedRam {}

impl PhysMapper for SimulatedRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = self.host_ptr(pa, size_of::<T>());
        debug_assert!(ptr.cast::<T>().is_aligned(), "misaligned access at {pa:?}");
        // SAFETY: in bounds; the caller upholds aliasing and validity.
        unsafe { &mut *ptr.cast::<T>() }
    }

    unsafe fn phys_bytes<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
        let ptr = self.host_ptr(pa, len);
        // SAFETY: in bounds; the caller upholds aliasing.
        unsafe { core::slice::from_raw_parts_mut(ptr, len) }
    }

    fn reach_end(&self) -> Option<PhysicalAddress> {
        self.reach
    }
}

/// Lay out `(type, start, pages)` triples the way firmware does.
#[must_use]
pub fn encode_memory_map(regions: &[(MemoryType, u64, u64)]) -> Vec<u8> {
    let mut out = vec![0u8; regions.len() * DESCRIPTOR_STRIDE];
    for (n, &(ty, phys_start, page_count)) in regions.iter().enumerate() {
        let d = MemoryDescriptor {
            ty,
            phys_start,
            virt_start: 0,
            page_count,
            att: MemoryAttribute::WRITE_BACK,
        };
        // SAFETY: each slot is DESCRIPTOR_STRIDE >= size_of::<MemoryDescriptor>() bytes.
        unsafe {
            out.as_mut_ptr()
                .add(n * DESCRIPTOR_STRIDE)
                .cast::<MemoryDescriptor>()
                .write_unaligned(d);
        }
    }
    out
}

const _: () = assert!(DESCRIPTOR_STRIDE >= size_of::<MemoryDescriptor>());

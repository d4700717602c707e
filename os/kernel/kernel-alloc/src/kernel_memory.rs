//! # Kernel memory context
//!
//! [`KernelMemory`] bundles the page frame allocator, the kernel address space
//! and the heap, and hands them to the rest of the kernel as one
//! [`MemoryServices`] implementation.
//!
//! ## Bring-up
//!
//! [`KernelMemory::bring_up`] runs once, right after `ExitBootServices`:
//!
//! 1. Read the firmware memory map into the PFA.
//! 2. Allocate a fresh PML4.
//! 3. Offset-map every allocatable and loader region below 4 GiB. The PFA
//!    bitmap lives in the largest conventional region below 4 GiB and is
//!    covered here.
//! 4. Identity-map the low bootstrap region.
//! 5. Map the kernel image at its link address. It lies inside the offset
//!    window, so this overwrites the offset mapping of the same pages.
//! 6. Lock the framebuffer and map it uncached at its offset address.
//! 7. Initialize the heap at [`HEAP_BASE`].
//!
//! The tables are built but not loaded; [`KernelMemory::activate`] does that.
//!
//! ## Rust allocations
//!
//! [`KernelMemory::allocate`] backs the global allocator. Layouts a heap block
//! can hold go to the heap; anything larger is mapped as whole pages from
//! [`PAGE_ALLOC_BASE`] upwards.

use crate::error::{MemoryError, Result};
use crate::frame_alloc::PageFrameAllocator;
use crate::heap::{ALIGN, Blocks, Heap, HeapBacking, HeapWords, MAX_REQUEST};
use core::alloc::Layout;
use crate::memory_map::{MemoryMap, is_allocatable, is_loader, region_end};
use crate::services::MemoryServices;
use kernel_info::boot::KernelBootInfo;
use kernel_info::memory::{DIRECT_MAP_OFFSET, DIRECT_MAP_SIZE, HEAP_BASE, IDENTITY_LOW_BYTES, PAGE_ALLOC_BASE};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, pages_for};
use kernel_vmem::{AddressSpace, PhysMapper};
use log::{debug, info, warn};

pub struct KernelMemory<M: PhysMapper + Copy> {
    pfa: PageFrameAllocator<M>,
    space: AddressSpace<M>,
    heap: Heap,
    /// Next unused address for [`allocate_pages`](Self::allocate_pages).
    next_pages: VirtualAddress,
}

impl<M: PhysMapper + Copy> KernelMemory<M> {
    /// Read the memory map and allocate an empty address space.
    ///
    /// The heap is not usable until [`init_heap`](Self::init_heap).
    ///
    /// # Errors
    /// Whatever [`PageFrameAllocator::read_memory_map`] reports, or a mapping
    /// failure if no page is left for the PML4.
    pub fn new(mapper: M, map: &MemoryMap<'_>) -> Result<Self> {
        let mut pfa = PageFrameAllocator::new(mapper);
        pfa.read_memory_map(map)?;
        let space = AddressSpace::new(mapper, &mut pfa)?;
        debug!("kernel PML4 at {:?}", space.root());
        Ok(Self {
            pfa,
            space,
            heap: Heap::new(VirtualAddress::new(HEAP_BASE)),
            next_pages: VirtualAddress::new(PAGE_ALLOC_BASE),
        })
    }

    /// Build the kernel's page tables and heap from the loader handoff.
    ///
    /// # Errors
    /// The first PFA, mapping or heap failure. Bring-up failures are not
    /// recoverable; the caller is expected to halt.
    pub fn bring_up(mapper: M, map: &MemoryMap<'_>, boot: &KernelBootInfo) -> Result<Self> {
        let mut memory = Self::new(mapper, map)?;
        memory.map_regions(map)?;

        let low = PhysicalAddress::zero();
        memory
            .space
            .map_range(VirtualAddress::new(0), low, IDENTITY_LOW_BYTES, true, &mut memory.pfa)?;

        if boot.kernel.len > 0 {
            memory.space.map_range(
                boot.kernel.virt(),
                boot.kernel.phys(),
                boot.kernel.len,
                true,
                &mut memory.pfa,
            )?;
        }

        if boot.fb.is_present() {
            memory.map_framebuffer(boot.fb.base(), boot.fb.framebuffer_size)?;
        }

        memory.init_heap()?;
        info!(
            "memory online: free {} KiB, used {} KiB, reserved {} KiB",
            memory.pfa.free_memory() / 1024,
            memory.pfa.used_memory() / 1024,
            memory.pfa.reserved_memory() / 1024
        );
        Ok(memory)
    }

    /// [`bring_up`](Self::bring_up) with the memory map taken from `boot`.
    ///
    /// # Safety
    /// The memory map buffer described by `boot.mmap` must still be intact.
    pub unsafe fn bring_up_from_boot_info(mapper: M, boot: &KernelBootInfo) -> Result<Self> {
        // SAFETY: forwarded to the caller.
        let map = unsafe { MemoryMap::from_boot_info(&boot.mmap) };
        Self::bring_up(mapper, &map, boot)
    }

    fn map_regions(&mut self, map: &MemoryMap<'_>) -> Result<()> {
        for d in map {
            if !(is_allocatable(d.ty) || is_loader(d.ty)) {
                continue;
            }
            let start = PhysicalAddress::new(d.phys_start);
            if start.as_u64() >= DIRECT_MAP_SIZE {
                continue;
            }
            let end = region_end(&d).min(DIRECT_MAP_SIZE);
            for n in 0..pages_for(end - start.as_u64()) {
                let pa = PhysicalAddress::new(start.as_u64() + n * PAGE_SIZE);
                let Some(va) = pa.to_offset_mapped() else {
                    break;
                };
                self.space.map_memory(va, pa, true, &mut self.pfa)?;
            }
        }
        Ok(())
    }

    fn map_framebuffer(&mut self, base: PhysicalAddress, size: u64) -> Result<()> {
        let Some(va) = base.to_offset_mapped() else {
            warn!("framebuffer at {base:?} is beyond the offset window, not mapped");
            return Ok(());
        };
        for n in 0..pages_for(base.offset() + size) {
            let page = PhysicalAddress::new(base.page().base().as_u64() + n * PAGE_SIZE);
            match self.pfa.lock_page(page) {
                // Framebuffers usually sit outside the RAM the map describes.
                Ok(()) | Err(MemoryError::InvalidAddress { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        self.space.map_range(va, base, size, false, &mut self.pfa)?;
        debug!("framebuffer {base:?} mapped at {va:?}, {size} bytes");
        Ok(())
    }

    /// Map the first heap page. Idempotent.
    ///
    /// # Errors
    /// `OutOfMemory` or a mapping failure.
    pub fn init_heap(&mut self) -> Result<()> {
        let Self { pfa, space, heap, .. } = self;
        heap.initialize(&mut HeapPages { pfa, space })
    }

    /// Serve a Rust allocation. Layouts a heap block can hold come from the
    /// heap; larger or more strictly aligned ones get whole fresh pages.
    ///
    /// `Ok(None)` for a zero size or an alignment above one page.
    ///
    /// # Errors
    /// As [`malloc`](MemoryServices::malloc) or
    /// [`allocate_pages`](Self::allocate_pages).
    pub fn allocate(&mut self, layout: Layout) -> Result<Option<VirtualAddress>> {
        if layout.size() == 0 {
            return Ok(None);
        }
        if fits_heap_block(layout) {
            return self.malloc(layout.size());
        }
        if layout.align() as u64 > PAGE_SIZE {
            return Ok(None);
        }
        self.allocate_pages(pages_for(layout.size() as u64)).map(Some)
    }

    /// Return what [`allocate`](Self::allocate) handed out for `layout`.
    ///
    /// # Errors
    /// `ForeignPointer` if `ptr` did not come from `allocate` with this layout.
    pub fn deallocate(&mut self, ptr: VirtualAddress, layout: Layout) -> Result<()> {
        if fits_heap_block(layout) {
            self.free(ptr)
        } else {
            self.release_pages(ptr, pages_for(layout.size() as u64))
        }
    }

    /// Map `count` fresh frames at consecutive virtual pages above
    /// [`PAGE_ALLOC_BASE`]. Virtual ranges are never reused.
    ///
    /// # Errors
    /// `OutOfMemory` or a mapping failure; pages mapped so far are released.
    pub fn allocate_pages(&mut self, count: u64) -> Result<VirtualAddress> {
        let base = self.next_pages;
        let end = count
            .checked_mul(PAGE_SIZE)
            .and_then(|len| base.as_u64().checked_add(len))
            .filter(|&end| end <= DIRECT_MAP_OFFSET)
            .ok_or(MemoryError::OutOfMemory)?;

        let mut pages = HeapPages {
            pfa: &mut self.pfa,
            space: &mut self.space,
        };
        for n in 0..count {
            if let Err(e) = pages.grow(base + n * PAGE_SIZE) {
                self.unmap_and_free(base, n)?;
                return Err(e);
            }
        }
        self.next_pages = VirtualAddress::new(end);
        debug!("{count} pages mapped at {base:?}");
        Ok(base)
    }

    /// Unmap pages from [`allocate_pages`](Self::allocate_pages) and return
    /// their frames.
    ///
    /// # Errors
    /// `ForeignPointer` for a range that was never handed out, `Unmapped` if a
    /// page of it is already gone.
    pub fn release_pages(&mut self, va: VirtualAddress, count: u64) -> Result<()> {
        let inside = va.as_u64() >= PAGE_ALLOC_BASE
            && va.is_page_aligned()
            && count
                .checked_mul(PAGE_SIZE)
                .and_then(|len| va.as_u64().checked_add(len))
                .is_some_and(|end| end <= self.next_pages.as_u64());
        if !inside {
            return Err(MemoryError::ForeignPointer { address: va });
        }
        self.unmap_and_free(va, count)
    }

    fn unmap_and_free(&mut self, va: VirtualAddress, count: u64) -> Result<()> {
        for n in 0..count {
            let page = va + n * PAGE_SIZE;
            let frame = self
                .space
                .unmap(page)
                .ok_or(MemoryError::Unmapped { address: page })?;
            self.pfa.free_page(frame)?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn pfa(&self) -> &PageFrameAllocator<M> {
        &self.pfa
    }

    pub const fn pfa_mut(&mut self) -> &mut PageFrameAllocator<M> {
        &mut self.pfa
    }

    #[must_use]
    pub const fn address_space(&self) -> &AddressSpace<M> {
        &self.space
    }

    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Walk the heap's block chain.
    pub fn heap_blocks(&self) -> Blocks<SpaceWords<'_, M>> {
        self.heap.blocks(SpaceWords { space: &self.space })
    }

    /// Load the kernel PML4 into CR3.
    ///
    /// # Safety
    /// Everything the CPU touches next, including the executing code and the
    /// stack, must be mapped by this address space.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn activate(&self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.space.activate() };
    }

    /// Call `f` for every page-contained piece of `va..va + len`.
    ///
    /// Pieces before the first unmapped page have already been visited when
    /// the error is returned.
    fn for_each_chunk(
        &self,
        va: VirtualAddress,
        len: usize,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<()> {
        let mut done = 0usize;
        while done < len {
            let at = va
                .checked_add(done as u64)
                .ok_or(MemoryError::Unmapped { address: va })?;
            let pa = self
                .space
                .translate(at)
                .ok_or(MemoryError::Unmapped { address: at })?;
            let room = usize::try_from(PAGE_SIZE - at.offset()).unwrap_or(usize::MAX);
            let n = room.min(len - done);
            // SAFETY: `pa..pa + n` stays inside one mapped page.
            let chunk = unsafe { self.space.mapper().phys_bytes(pa, n) };
            f(chunk, done);
            done += n;
        }
        Ok(())
    }

    /// Physical address of a 4-aligned `u32`, if mapped.
    fn word_at(&self, va: VirtualAddress) -> Result<PhysicalAddress> {
        self.space
            .translate(va)
            .ok_or(MemoryError::Unmapped { address: va })
    }
}

impl<M: PhysMapper + Copy> MemoryServices for KernelMemory<M> {
    fn request_page(&mut self) -> Result<PhysicalAddress> {
        self.pfa.request_page()
    }

    fn lock_page(&mut self, page: PhysicalAddress) -> Result<()> {
        self.pfa.lock_page(page)
    }

    fn lock_pages(&mut self, first: PhysicalAddress, count: u64) -> Result<()> {
        self.pfa.lock_pages(first, count)
    }

    fn free_page(&mut self, page: PhysicalAddress) -> Result<()> {
        self.pfa.free_page(page)
    }

    fn free_pages(&mut self, first: PhysicalAddress, count: u64) -> Result<()> {
        self.pfa.free_pages(first, count)
    }

    fn reserve_page(&mut self, page: PhysicalAddress) -> Result<()> {
        self.pfa.reserve_page(page)
    }

    fn map_memory(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        cacheable: bool,
    ) -> Result<()> {
        Ok(self.space.map_memory(va, pa, cacheable, &mut self.pfa)?)
    }

    fn unmap_memory(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space.unmap(va)
    }

    fn malloc(&mut self, size: usize) -> Result<Option<VirtualAddress>> {
        let Self { pfa, space, heap, .. } = self;
        heap.malloc(&mut HeapPages { pfa, space }, size)
    }

    fn free(&mut self, ptr: VirtualAddress) -> Result<()> {
        let Self { pfa, space, heap, .. } = self;
        heap.free(&mut HeapPages { pfa, space }, ptr)
    }

    fn read_bytes(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<()> {
        self.for_each_chunk(va, buf.len(), |chunk, at| {
            buf[at..at + chunk.len()].copy_from_slice(chunk);
        })
    }

    fn write_bytes(&mut self, va: VirtualAddress, data: &[u8]) -> Result<()> {
        self.for_each_chunk(va, data.len(), |chunk, at| {
            chunk.copy_from_slice(&data[at..at + chunk.len()]);
        })
    }

    fn fill_bytes(&mut self, va: VirtualAddress, value: u8, len: usize) -> Result<()> {
        self.for_each_chunk(va, len, |chunk, _| chunk.fill(value))
    }

    fn read_u32(&self, va: VirtualAddress) -> Result<u32> {
        if !va.as_u64().is_multiple_of(4) {
            let mut raw = [0; 4];
            self.read_bytes(va, &mut raw)?;
            return Ok(u32::from_le_bytes(raw));
        }
        let pa = self.word_at(va)?;
        // SAFETY: mapped and 4-aligned; a single volatile load for MMIO.
        Ok(unsafe { core::ptr::read_volatile(self.space.mapper().phys_to_mut::<u32>(pa)) })
    }

    fn write_u32(&mut self, va: VirtualAddress, value: u32) -> Result<()> {
        if !va.as_u64().is_multiple_of(4) {
            return self.write_bytes(va, &value.to_le_bytes());
        }
        let pa = self.word_at(va)?;
        // SAFETY: mapped and 4-aligned; a single volatile store for MMIO.
        unsafe { core::ptr::write_volatile(self.space.mapper().phys_to_mut::<u32>(pa), value) };
        Ok(())
    }
}

fn fits_heap_block(layout: Layout) -> bool {
    layout.align() as u64 <= ALIGN && layout.size() as u64 <= MAX_REQUEST
}

/// Grows the heap with PFA pages mapped into the kernel address space.
struct HeapPages<'a, M: PhysMapper + Copy> {
    pfa: &'a mut PageFrameAllocator<M>,
    space: &'a mut AddressSpace<M>,
}

impl<M: PhysMapper + Copy> HeapWords for HeapPages<'_, M> {
    fn load(&self, va: VirtualAddress) -> Result<u64> {
        load_word(self.space, va)
    }
}

impl<M: PhysMapper + Copy> HeapBacking for HeapPages<'_, M> {
    fn grow(&mut self, va: VirtualAddress) -> Result<()> {
        let page = self.pfa.request_page()?;
        if let Err(e) = self.space.map_memory(va, page, true, &mut *self.pfa) {
            self.pfa.free_page(page)?;
            return Err(e.into());
        }
        Ok(())
    }

    fn store(&mut self, va: VirtualAddress, value: u64) -> Result<()> {
        let pa = self
            .space
            .translate(va)
            .ok_or(MemoryError::Unmapped { address: va })?;
        // SAFETY: heap words are 8-aligned and their page is mapped.
        unsafe { *self.space.mapper().phys_to_mut::<u64>(pa) = value };
        Ok(())
    }
}

/// Read-only view of the heap through the kernel address space.
pub struct SpaceWords<'a, M: PhysMapper> {
    space: &'a AddressSpace<M>,
}

impl<M: PhysMapper> HeapWords for SpaceWords<'_, M> {
    fn load(&self, va: VirtualAddress) -> Result<u64> {
        load_word(self.space, va)
    }
}

fn load_word<M: PhysMapper>(space: &AddressSpace<M>, va: VirtualAddress) -> Result<u64> {
    let pa = space
        .translate(va)
        .ok_or(MemoryError::Unmapped { address: va })?;
    // SAFETY: heap words are 8-aligned and their page is mapped.
    Ok(unsafe { *space.mapper().phys_to_mut::<u64>(pa) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{HEADER_SIZE, MAX_REQUEST};
    use crate::sim::{SimulatedRam, encode_memory_map};
    use alloc::vec::Vec;
    use kernel_info::boot::{FramebufferInfo, KernelImageInfo, MemoryMapInfo};
    use kernel_info::memory::KERNEL_BASE;
    use kernel_qemu::QemuLogger;
    use log::LevelFilter;
    use uefi::mem::memory_map::MemoryType;

    const RAM: u64 = 0x10_0000;

    static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Trace);

    fn ram() -> SimulatedRam {
        SimulatedRam::with_pattern(PhysicalAddress::new(RAM), 64, 0xA5)
    }

    fn map_bytes() -> Vec<u8> {
        encode_memory_map(&[
            (MemoryType::CONVENTIONAL, RAM, 48),
            (MemoryType::LOADER_DATA, RAM + 48 * PAGE_SIZE, 16),
        ])
    }

    fn memory<'r>(ram: &'r SimulatedRam, raw: &[u8]) -> KernelMemory<&'r SimulatedRam> {
        let mut memory = KernelMemory::new(ram, &SimulatedRam::memory_map(raw)).unwrap();
        memory.init_heap().unwrap();
        memory
    }

    fn boot_info(fb_ptr: u64) -> KernelBootInfo {
        KernelBootInfo {
            mmap: MemoryMapInfo {
                mmap_ptr: 0,
                mmap_len: 0,
                mmap_desc_size: 48,
                mmap_desc_version: 1,
            },
            rsdp_addr: 0,
            fb: FramebufferInfo {
                framebuffer_ptr: fb_ptr,
                framebuffer_size: 3 * PAGE_SIZE,
                framebuffer_width: 32,
                framebuffer_height: 24,
                framebuffer_stride: 32,
            },
            kernel: KernelImageInfo {
                phys_start: RAM + 48 * PAGE_SIZE,
                virt_start: KERNEL_BASE,
                len: 0x2800,
            },
        }
    }

    #[test]
    fn heap_reuses_the_first_hole() {
        let ram = ram();
        let raw = map_bytes();
        let mut memory = memory(&ram, &raw);

        let first = memory.malloc(32).unwrap().unwrap();
        let second = memory.malloc(64).unwrap().unwrap();
        memory.free(first).unwrap();
        let end = memory.heap().heap_end();
        let third = memory.malloc(16).unwrap().unwrap();

        assert_eq!(third, first);
        assert_ne!(second, first);
        assert_eq!(memory.heap().heap_end(), end);
    }

    #[test]
    fn split_blocks_coalesce_back_into_one() {
        let ram = ram();
        let raw = map_bytes();
        let mut memory = memory(&ram, &raw);

        let a = memory.malloc(100).unwrap().unwrap();
        let b = memory.malloc(200).unwrap().unwrap();
        assert_eq!(memory.heap_blocks().count(), 3);

        memory.free(a).unwrap();
        memory.free(b).unwrap();
        let blocks: Vec<_> = memory.heap_blocks().map(Result::unwrap).collect();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].free);
        assert_eq!(blocks[0].size, MAX_REQUEST);
    }

    #[test]
    fn heap_pages_come_from_the_pfa() {
        let ram = ram();
        let raw = map_bytes();
        let mut memory = memory(&ram, &raw);
        let used = memory.pfa().used_memory();

        memory.malloc(MAX_REQUEST as usize).unwrap().unwrap();
        let grown = memory.malloc(8).unwrap().unwrap();

        assert_eq!(memory.pfa().used_memory(), used + PAGE_SIZE);
        assert_eq!(grown.as_u64(), HEAP_BASE + PAGE_SIZE + HEADER_SIZE);
        let pa = memory.address_space().translate(grown).unwrap();
        assert!(memory.pfa().is_page_used(pa).unwrap());
    }

    #[test]
    fn strdup_appends_a_nul() {
        let ram = ram();
        let raw = map_bytes();
        let mut memory = memory(&ram, &raw);

        let s = memory.strdup("ext4").unwrap();
        let mut back = [0xFF; 5];
        memory.read_bytes(s, &mut back).unwrap();
        assert_eq!(&back, b"ext4\0");
    }

    #[test]
    fn byte_access_crosses_page_boundaries() {
        let ram = ram();
        let raw = map_bytes();
        let mut memory = memory(&ram, &raw);

        // Two virtually adjacent pages backed by non-adjacent frames.
        let va = VirtualAddress::new(0xFFFF_9000_0000_0000);
        let lo = memory.request_page().unwrap();
        memory.request_page().unwrap();
        let hi = memory.request_page().unwrap();
        memory.map_memory(va, lo, true).unwrap();
        memory.map_memory(va + PAGE_SIZE, hi, true).unwrap();

        let data: Vec<u8> = (0..64u8).collect();
        let at = va + (PAGE_SIZE - 16);
        memory.write_bytes(at, &data).unwrap();

        assert_eq!(ram.bytes(lo + (PAGE_SIZE - 16), 16), data[..16]);
        assert_eq!(ram.bytes(hi, 48), data[16..]);

        let mut back = [0; 64];
        memory.read_bytes(at, &mut back).unwrap();
        assert_eq!(back.as_slice(), data.as_slice());

        memory.fill_bytes(va, 0, 2 * PAGE_SIZE as usize).unwrap();
        assert!(ram.bytes(hi, PAGE_SIZE as usize).iter().all(|&b| b == 0));
    }

    #[test]
    fn unmapped_access_is_an_error() {
        let ram = ram();
        let raw = map_bytes();
        let memory = memory(&ram, &raw);

        let va = VirtualAddress::new(0xFFFF_9100_0000_0000);
        assert_eq!(
            memory.read_u32(va),
            Err(MemoryError::Unmapped { address: va })
        );
    }

    #[test]
    fn words_are_little_endian_even_unaligned() {
        let ram = ram();
        let raw = map_bytes();
        let mut memory = memory(&ram, &raw);

        let pa = memory.request_page().unwrap();
        let va = memory.map_offset(pa, false).unwrap();
        assert_eq!(Some(va), pa.to_offset_mapped());

        memory.write_u32(va + 4, 0x1122_3344).unwrap();
        assert_eq!(ram.bytes(pa + 4, 4), [0x44, 0x33, 0x22, 0x11]);
        memory.write_u32(va + 9, 0xDEAD_BEEF).unwrap();
        assert_eq!(memory.read_u32(va + 9).unwrap(), 0xDEAD_BEEF);
        assert_eq!(ram.read_u32(pa + 4), 0x1122_3344);

        let entry = memory.address_space().leaf_entry(va).unwrap();
        assert!(!entry.is_cacheable());
    }

    #[test]
    fn unmap_memory_returns_the_frame() {
        let ram = ram();
        let raw = map_bytes();
        let mut memory = memory(&ram, &raw);

        let pa = memory.request_page().unwrap();
        let va = memory.map_offset(pa, true).unwrap();
        assert_eq!(memory.unmap_memory(va), Some(pa));
        assert_eq!(memory.unmap_memory(va), None);
        assert!(memory.pfa().is_page_used(pa).unwrap());
    }

    #[test]
    fn small_layouts_come_from_the_heap() {
        let ram = ram();
        let raw = map_bytes();
        let mut memory = memory(&ram, &raw);

        let layout = Layout::from_size_align(24, 8).unwrap();
        let p = memory.allocate(layout).unwrap().unwrap();
        assert_eq!(p.as_u64(), HEAP_BASE + HEADER_SIZE);
        memory.deallocate(p, layout).unwrap();
        assert_eq!(memory.heap_blocks().count(), 1);

        assert_eq!(memory.allocate(Layout::from_size_align(0, 8).unwrap()), Ok(None));
        assert_eq!(
            memory.allocate(Layout::from_size_align(64, 2 * PAGE_SIZE as usize).unwrap()),
            Ok(None)
        );
    }

    #[test]
    fn large_layouts_get_whole_pages() {
        let ram = ram();
        let raw = map_bytes();
        let mut memory = memory(&ram, &raw);

        // A 4 KiB block buffer does not fit a heap block.
        let layout = Layout::from_size_align(5000, 8).unwrap();
        let first = memory.allocate(layout).unwrap().unwrap();
        assert_eq!(first.as_u64(), PAGE_ALLOC_BASE);

        let data: Vec<u8> = (0..5000u32).map(|n| (n % 253) as u8).collect();
        memory.write_bytes(first, &data).unwrap();
        let mut back = vec![0; 5000];
        memory.read_bytes(first, &mut back).unwrap();
        assert_eq!(back, data);

        memory.deallocate(first, layout).unwrap();
        assert_eq!(memory.address_space().translate(first), None);
        let used = memory.pfa().used_memory();

        // Page tables stay; the data frames cycle.
        let second = memory.allocate(layout).unwrap().unwrap();
        assert_eq!(second.as_u64(), PAGE_ALLOC_BASE + 2 * PAGE_SIZE);
        assert_eq!(memory.pfa().used_memory(), used + 2 * PAGE_SIZE);
        memory.deallocate(second, layout).unwrap();
        assert_eq!(memory.pfa().used_memory(), used);

        assert_eq!(
            memory.deallocate(second, layout),
            Err(MemoryError::Unmapped { address: second })
        );
        let stray = VirtualAddress::new(PAGE_ALLOC_BASE + 64 * PAGE_SIZE);
        assert_eq!(
            memory.deallocate(stray, layout),
            Err(MemoryError::ForeignPointer { address: stray })
        );

        // Page alignment requests also take the page path.
        let aligned = Layout::from_size_align(64, PAGE_SIZE as usize).unwrap();
        let third = memory.allocate(aligned).unwrap().unwrap();
        assert!(third.is_page_aligned());
        memory.deallocate(third, aligned).unwrap();
    }

    #[test]
    fn exhausted_page_allocation_rolls_back() {
        let ram = ram();
        let raw = map_bytes();
        let mut memory = memory(&ram, &raw);
        let free = memory.pfa().free_memory();

        assert_eq!(memory.allocate_pages(1000), Err(MemoryError::OutOfMemory));
        // Only the page tables built on the way remain.
        assert!(memory.pfa().free_memory() >= free - 3 * PAGE_SIZE);
        assert_eq!(memory.allocate_pages(1).unwrap().as_u64(), PAGE_ALLOC_BASE);
    }

    #[test]
    fn bring_up_builds_the_kernel_mappings() {
        // Route every log line of the bring-up through the formatter.
        let _ = LOGGER.install();
        let ram = ram();
        let raw = map_bytes();
        let boot = boot_info(0xFD00_0000);
        let memory =
            KernelMemory::bring_up(&ram, &SimulatedRam::memory_map(&raw), &boot).unwrap();
        let space = memory.address_space();

        // Offset window over RAM and loader data.
        let pa = PhysicalAddress::new(RAM + 0x1234);
        assert_eq!(space.translate(pa.to_offset_mapped().unwrap()), Some(pa));
        let loader = PhysicalAddress::new(RAM + 60 * PAGE_SIZE);
        assert_eq!(space.translate(loader.to_offset_mapped().unwrap()), Some(loader));

        // Identity-mapped bootstrap region.
        assert_eq!(
            space.translate(VirtualAddress::new(0x1F_F000)),
            Some(PhysicalAddress::new(0x1F_F000))
        );
        assert_eq!(space.translate(VirtualAddress::new(IDENTITY_LOW_BYTES)), None);

        // Kernel image at its link address, three pages for 0x2800 bytes.
        let image = boot.kernel.phys();
        assert_eq!(space.translate(VirtualAddress::new(KERNEL_BASE + 0x2004)), Some(image + 0x2004));
        assert_eq!(space.translate(VirtualAddress::new(KERNEL_BASE + 0x3000)), None);

        // Framebuffer outside RAM, mapped uncached.
        let fb = PhysicalAddress::new(0xFD00_0000);
        let fb_va = fb.to_offset_mapped().unwrap();
        assert_eq!(space.translate(fb_va + 0x2FFF), Some(fb + 0x2FFF));
        assert!(!space.leaf_entry(fb_va).unwrap().is_cacheable());

        assert!(memory.heap().is_initialized());
        assert_eq!(memory.heap_blocks().count(), 1);
        assert!(memory.pfa().is_page_reserved(loader).unwrap());
    }

    #[test]
    fn bring_up_locks_a_framebuffer_inside_ram() {
        let ram = ram();
        let raw = map_bytes();
        let fb = RAM + 40 * PAGE_SIZE;
        let memory = KernelMemory::bring_up(
            &ram,
            &SimulatedRam::memory_map(&raw),
            &boot_info(fb),
        )
        .unwrap();

        for n in 0..3 {
            let page = PhysicalAddress::new(fb + n * PAGE_SIZE);
            assert!(memory.pfa().is_page_used(page).unwrap());
        }
        let fb_va = PhysicalAddress::new(fb).to_offset_mapped().unwrap();
        assert!(!memory.address_space().leaf_entry(fb_va).unwrap().is_cacheable());
    }

    #[test]
    fn bring_up_without_conventional_memory_fails() {
        let ram = ram();
        let raw = encode_memory_map(&[(MemoryType::RESERVED, RAM, 64)]);
        let result = KernelMemory::bring_up(&ram, &SimulatedRam::memory_map(&raw), &boot_info(0));
        assert!(matches!(result, Err(MemoryError::OutOfMemory)));
    }
}

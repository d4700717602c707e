//! # Address Space (PML4-rooted)
//!
//! One tree of paging structures and the operations on it.
//!
//! - [`AddressSpace::map_memory`] walks PML4 → PDPT → PD, creating any missing
//!   table as a zeroed frame linked Present + ReadWrite, then overwrites the PT
//!   leaf unconditionally.
//! - [`AddressSpace::translate`] resolves a virtual address, honoring 1 GiB and
//!   2 MiB leaves.
//! - [`AddressSpace::unmap`] clears one 4 KiB leaf. Intermediate tables are
//!   never reclaimed.
//!
//! Tables are reached through the [`PhysMapper`], so the same code runs on the
//! offset-mapped window in the kernel and on host memory in tests.

use crate::entry::PageEntry;
use crate::error::MapError;
use crate::table::{PageTable, TableLevel};
use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, pages_for};
use log::trace;

const SIZE_1G: u64 = 1 << 30;
const SIZE_2M: u64 = 1 << 21;

/// Handle to a single address space.
pub struct AddressSpace<M: PhysMapper> {
    root: PhysicalPage,
    mapper: M,
}

impl<M: PhysMapper> AddressSpace<M> {
    /// Allocate and zero a fresh PML4.
    ///
    /// # Errors
    /// [`MapError::OomPml4`] if the allocator has no frame left.
    pub fn new<A: FrameAlloc>(mapper: M, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::OomPml4)?;
        let space = Self { root, mapper };
        space.table(root).zero();
        trace!("new PML4 at {:?}", root.base());
        Ok(space)
    }

    /// Wrap an existing PML4.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: M, root: PhysicalPage) -> Self {
        Self { root, mapper }
    }

    /// Physical frame of the PML4 (the CR3 value).
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[allow(clippy::mut_from_ref)]
    fn table<'a>(&self, page: PhysicalPage) -> &'a mut PageTable {
        // SAFETY: every frame handed to this function is a page table of this
        // space, reachable through the mapper, and borrows never outlive a call.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Follow `table[index]`, creating the `child` level if the entry is absent.
    fn next_or_create<A: FrameAlloc>(
        &mut self,
        table: PhysicalPage,
        index: usize,
        child: TableLevel,
        va: VirtualAddress,
        alloc: &mut A,
    ) -> Result<PhysicalPage, MapError> {
        let entry = self.table(table).get(index);
        if entry.present() {
            if entry.large_page() {
                return Err(MapError::LargePageInTheWay {
                    va,
                    level: parent_of(child),
                });
            }
            return Ok(PhysicalPage::containing(entry.address()));
        }

        let fresh = alloc.alloc_4k().ok_or(MapError::oom_for(child))?;
        self.table(fresh).zero();
        self.table(table).set(index, PageEntry::table(fresh));
        trace!("{child} at {:?} for {va:?}", fresh.base());
        Ok(fresh)
    }

    /// Map the 4 KiB page containing `va` to the frame containing `pa`.
    ///
    /// An existing leaf is overwritten. `cacheable = false` sets WriteThrough
    /// and CacheDisabled and is required for MMIO. The TLB is not flushed.
    ///
    /// # Errors
    /// - `NonCanonical` if `va` is not a canonical address.
    /// - `OomPdpt` / `OomPd` / `OomPt` when an intermediate table cannot be
    ///   allocated. Tables created before the failure stay linked.
    /// - `LargePageInTheWay` if a 1 GiB or 2 MiB leaf already covers `va`.
    pub fn map_memory<A: FrameAlloc>(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        cacheable: bool,
        alloc: &mut A,
    ) -> Result<(), MapError> {
        if !va.is_canonical() {
            return Err(MapError::NonCanonical(va));
        }

        let pdpt = self.next_or_create(self.root, va.pml4_index(), TableLevel::Pdpt, va, alloc)?;
        let pd = self.next_or_create(pdpt, va.pdpt_index(), TableLevel::Pd, va, alloc)?;
        let pt = self.next_or_create(pd, va.pd_index(), TableLevel::Pt, va, alloc)?;
        self.table(pt)
            .set(va.pt_index(), PageEntry::leaf(pa.page(), cacheable));
        Ok(())
    }

    /// Map `len` bytes starting at `va` → `pa`, one 4 KiB page at a time.
    ///
    /// Both addresses are aligned down to their page; the range covers every
    /// page the byte range touches. A failure leaves the pages mapped so far in place.
    ///
    /// # Errors
    /// Whatever [`map_memory`](Self::map_memory) reports for the first failing page.
    pub fn map_range<A: FrameAlloc>(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u64,
        cacheable: bool,
        alloc: &mut A,
    ) -> Result<(), MapError> {
        let count = pages_for(va.offset() + len);
        let (vpage, _) = va.split();
        let (ppage, _) = pa.split();
        for n in 0..count {
            self.map_memory(vpage.nth(n).base(), ppage.nth(n).base(), cacheable, alloc)?;
        }
        Ok(())
    }

    /// Clear the 4 KiB leaf for `va` and return the frame it pointed to.
    ///
    /// Returns `None` if nothing was mapped there or a large page covers it.
    /// Neither the frame nor emptied tables are freed.
    pub fn unmap(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pt = self.leaf_table(va)?;
        let table = self.table(pt);
        let old = table.get(va.pt_index()).frame()?;
        table.set(va.pt_index(), PageEntry::zero());
        Some(old.base())
    }

    /// Resolve `va` to a physical address, if mapped.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !va.is_canonical() {
            return None;
        }

        let pdpt = self.table(self.root).get(va.pml4_index()).frame()?;

        let e3 = self.table(pdpt).get(va.pdpt_index());
        if e3.present() && e3.large_page() {
            let base = e3.address().as_u64() & !(SIZE_1G - 1);
            return Some(PhysicalAddress::new(base | (va.as_u64() & (SIZE_1G - 1))));
        }
        let pd = e3.frame()?;

        let e2 = self.table(pd).get(va.pd_index());
        if e2.present() && e2.large_page() {
            let base = e2.address().as_u64() & !(SIZE_2M - 1);
            return Some(PhysicalAddress::new(base | (va.as_u64() & (SIZE_2M - 1))));
        }
        let pt = e2.frame()?;

        let leaf = self.table(pt).get(va.pt_index()).frame()?;
        Some(leaf.join(va.offset()))
    }

    /// The present 4 KiB leaf entry for `va`.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageEntry> {
        let pt = self.leaf_table(va)?;
        let entry = self.table(pt).get(va.pt_index());
        entry.present().then_some(entry)
    }

    /// The PT frame covering `va`, if the walk reaches one.
    fn leaf_table(&self, va: VirtualAddress) -> Option<PhysicalPage> {
        if !va.is_canonical() {
            return None;
        }
        let pdpt = self.table(self.root).get(va.pml4_index()).frame()?;
        let e3 = self.table(pdpt).get(va.pdpt_index());
        if e3.large_page() {
            return None;
        }
        let e2 = self.table(e3.frame()?).get(va.pd_index());
        if e2.large_page() {
            return None;
        }
        e2.frame()
    }

    /// Load CR3 with this space's root.
    ///
    /// # Safety
    /// The currently executing code, its stack and every structure in use
    /// must be mapped identically in this space.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn activate(&self) {
        let cr3 = self.root.base().as_u64();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    /// Drop the TLB entry for the page containing `va`.
    ///
    /// # Safety
    /// Must run at CPL0.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn invalidate(va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }
}

const fn parent_of(child: TableLevel) -> TableLevel {
    match child {
        TableLevel::Pml4 | TableLevel::Pdpt => TableLevel::Pml4,
        TableLevel::Pd => TableLevel::Pdpt,
        TableLevel::Pt => TableLevel::Pd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PAGE_SIZE;

    #[repr(C, align(4096))]
    struct Frame([u8; 4096]);

    /// A few host frames pretending to live at physical `base`.
    struct TestPhys {
        base: u64,
        frames: *mut Frame,
        len: usize,
        _owner: Vec<Frame>,
    }

    impl TestPhys {
        fn new(base: u64, len: usize) -> Self {
            let mut owner: Vec<Frame> = (0..len).map(|_| Frame([0xA5; 4096])).collect();
            let frames = owner.as_mut_ptr();
            Self {
                base,
                frames,
                len,
                _owner: owner,
            }
        }
    }

    impl TestPhys {
        fn ptr(&self, pa: PhysicalAddress, len: usize) -> *mut u8 {
            let rel = usize::try_from(pa.as_u64() - self.base).unwrap();
            assert!(rel + len <= self.len * 4096, "{pa:?} outside test RAM");
            unsafe { self.frames.cast::<u8>().add(rel) }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            unsafe { &mut *self.ptr(pa, size_of::<T>()).cast::<T>() }
        }

        unsafe fn phys_bytes<'a>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [u8] {
            unsafe { core::slice::from_raw_parts_mut(self.ptr(pa, len), len) }
        }
    }

    struct BumpAlloc {
        next: u64,
        end: u64,
        handed_out: usize,
    }

    impl BumpAlloc {
        fn new(base: u64, frames: u64) -> Self {
            Self {
                next: base,
                end: base + frames * PAGE_SIZE,
                handed_out: 0,
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage> {
            if self.next >= self.end {
                return None;
            }
            let page = PhysicalPage::containing(PhysicalAddress::new(self.next));
            self.next += PAGE_SIZE;
            self.handed_out += 1;
            Some(page)
        }
    }

    const RAM: u64 = 0x0010_0000;
    const HEAP_VA: u64 = 0xFFFF_8800_0000_0000;

    fn setup(frames: u64) -> (AddressSpace<TestPhys>, BumpAlloc) {
        let mut alloc = BumpAlloc::new(RAM, frames);
        let phys = TestPhys::new(RAM, usize::try_from(frames).unwrap());
        let space = AddressSpace::new(phys, &mut alloc).unwrap();
        (space, alloc)
    }

    #[test]
    fn fresh_root_is_zeroed() {
        let (space, alloc) = setup(4);
        assert_eq!(space.root().base().as_u64(), RAM);
        assert_eq!(alloc.handed_out, 1);
        assert_eq!(space.table(space.root()).present_count(), 0);
    }

    #[test]
    fn map_one_4k_creates_tables_and_leaf() {
        let (mut space, mut alloc) = setup(8);
        let va = VirtualAddress::new(HEAP_VA + 0x1000);
        let pa = PhysicalAddress::new(0x0020_3000);

        space.map_memory(va, pa, true, &mut alloc).unwrap();
        assert_eq!(alloc.handed_out, 4, "root plus PDPT, PD and PT");

        let hit = space.translate(VirtualAddress::new(HEAP_VA + 0x1123));
        assert_eq!(hit, Some(PhysicalAddress::new(0x0020_3123)));
        assert_eq!(space.translate(VirtualAddress::new(HEAP_VA)), None);

        let pml4e = space.table(space.root()).get(va.pml4_index());
        assert!(pml4e.present() && pml4e.writable());
    }

    #[test]
    fn remap_overwrites_the_leaf() {
        let (mut space, mut alloc) = setup(8);
        let va = VirtualAddress::new(HEAP_VA);
        space
            .map_memory(va, PhysicalAddress::new(0x0030_0000), true, &mut alloc)
            .unwrap();
        space
            .map_memory(va, PhysicalAddress::new(0x0040_0000), true, &mut alloc)
            .unwrap();

        assert_eq!(space.translate(va), Some(PhysicalAddress::new(0x0040_0000)));
        assert_eq!(alloc.handed_out, 4, "the second map reuses every table");
    }

    #[test]
    fn neighbours_share_intermediate_tables() {
        let (mut space, mut alloc) = setup(8);
        for n in 0..4 {
            let va = VirtualAddress::new(HEAP_VA + n * PAGE_SIZE);
            let pa = PhysicalAddress::new(0x0050_0000 + n * PAGE_SIZE);
            space.map_memory(va, pa, true, &mut alloc).unwrap();
        }
        assert_eq!(alloc.handed_out, 4);
    }

    #[test]
    fn uncached_mapping_sets_pwt_and_pcd() {
        let (mut space, mut alloc) = setup(8);
        let abar = PhysicalAddress::new(0xFEBF_1000);
        let va = abar.to_offset_mapped().unwrap();
        space.map_memory(va, abar, false, &mut alloc).unwrap();

        let leaf = space.leaf_entry(va).unwrap();
        assert!(leaf.cache_disabled());
        assert!(leaf.write_through());
        assert!(leaf.writable());
        assert_eq!(space.translate(va), Some(abar));
    }

    #[test]
    fn exhausted_allocator_reports_the_missing_level() {
        // Root and PDPT fit, the PD does not.
        let (mut space, mut alloc) = setup(2);
        let err = space
            .map_memory(
                VirtualAddress::new(HEAP_VA),
                PhysicalAddress::new(0x0020_0000),
                true,
                &mut alloc,
            )
            .unwrap_err();
        assert_eq!(err, MapError::OomPd);
        assert!(err.is_out_of_memory());
        assert_eq!(space.translate(VirtualAddress::new(HEAP_VA)), None);
    }

    #[test]
    fn no_frame_for_the_root() {
        let mut alloc = BumpAlloc::new(RAM, 0);
        let phys = TestPhys::new(RAM, 1);
        assert!(matches!(
            AddressSpace::new(phys, &mut alloc),
            Err(MapError::OomPml4)
        ));
    }

    #[test]
    fn unmap_clears_only_the_leaf() {
        let (mut space, mut alloc) = setup(8);
        let va = VirtualAddress::new(HEAP_VA + 0x2000);
        space
            .map_memory(va, PhysicalAddress::new(0x0060_0000), true, &mut alloc)
            .unwrap();

        assert_eq!(space.unmap(va), Some(PhysicalAddress::new(0x0060_0000)));
        assert_eq!(space.translate(va), None);
        assert_eq!(space.unmap(va), None);

        // Tables survive; mapping again takes no new frames.
        space
            .map_memory(va, PhysicalAddress::new(0x0070_0000), true, &mut alloc)
            .unwrap();
        assert_eq!(alloc.handed_out, 4);
    }

    #[test]
    fn non_canonical_addresses_are_refused() {
        let (mut space, mut alloc) = setup(4);
        let va = VirtualAddress::new(0x0000_8000_0000_0000);
        assert_eq!(
            space.map_memory(va, PhysicalAddress::zero(), true, &mut alloc),
            Err(MapError::NonCanonical(va))
        );
        assert_eq!(space.translate(va), None);
        assert_eq!(alloc.handed_out, 1);
    }

    #[test]
    fn large_pages_translate_but_block_4k_maps() {
        let (mut space, mut alloc) = setup(8);
        let va = VirtualAddress::new(0x0000_0040_0000_0000);

        // Build PML4 → PDPT via an ordinary map elsewhere in the same 512 GiB.
        space
            .map_memory(
                VirtualAddress::new(0x0000_0040_4000_0000),
                PhysicalAddress::new(0x0010_0000),
                true,
                &mut alloc,
            )
            .unwrap();
        let pdpt = space.table(space.root()).get(va.pml4_index()).frame().unwrap();
        let huge = PageEntry::leaf(PhysicalPage::containing(PhysicalAddress::new(0x8000_0000)), true)
            .with_large_page(true);
        space.table(pdpt).set(va.pdpt_index(), huge);

        let probe = VirtualAddress::new(va.as_u64() + 0x0123_4567);
        assert_eq!(space.translate(probe), Some(PhysicalAddress::new(0x8123_4567)));
        assert!(space.leaf_entry(probe).is_none());
        assert_eq!(
            space.map_memory(probe, PhysicalAddress::zero(), true, &mut alloc),
            Err(MapError::LargePageInTheWay {
                va: probe,
                level: TableLevel::Pdpt
            })
        );
    }

    #[test]
    fn map_range_covers_every_touched_page() {
        let (mut space, mut alloc) = setup(8);
        let va = VirtualAddress::new(HEAP_VA + 0x0800);
        let pa = PhysicalAddress::new(0x0090_0800);

        space.map_range(va, pa, 0x1000, false, &mut alloc).unwrap();

        for n in 0..2 {
            let probe = VirtualAddress::new(HEAP_VA + n * PAGE_SIZE);
            assert_eq!(
                space.translate(probe),
                Some(PhysicalAddress::new(0x0090_0000 + n * PAGE_SIZE))
            );
        }
        assert_eq!(space.translate(VirtualAddress::new(HEAP_VA + 2 * PAGE_SIZE)), None);
    }
}

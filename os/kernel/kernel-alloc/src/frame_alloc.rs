//! # Page Frame Allocator
//!
//! Classifies every 4 KiB page between the lowest and highest address of the
//! firmware memory map as free, used or reserved, and hands out free pages
//! one at a time.
//!
//! ## Bookkeeping
//!
//! Two bitmaps of `totalPages / 8 + 1` bytes each sit back to back at the base
//! of the largest conventional region, which makes those pages the first ones
//! the allocator locks:
//!
//! ```text
//! largest conventional region
//! ┌──────────────┬──────────────┬────────────────────────────┐
//! │ in-use bits  │ reserve bits │ free pages ...             │
//! └──────────────┴──────────────┴────────────────────────────┘
//! ```
//!
//! A set in-use bit means the page cannot be handed out. The reserve bits tell
//! reserved pages apart from used ones so `free_page` never releases a
//! reservation and `unreserve_page` never releases an allocation.
//!
//! The byte counters always satisfy `free + used + reserved == total_pages * 4096`.
//!
//! ## Classification
//!
//! Conventional and boot-services memory is allocatable. Every other
//! descriptor type, and any gap between descriptors, is reserved. So is
//! memory at or above [`PhysMapper::reach_end`]: the allocator touches its
//! bitmaps, and callers touch the frames it hands out, through the mapper.

use crate::bitmap::Bitmap;
use crate::error::{MemoryError, Result};
use crate::memory_map::{MemoryMap, is_allocatable, pages_below};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, pages_for};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, error, info, trace, warn};

pub struct PageFrameAllocator<M: PhysMapper> {
    mapper: M,
    initialized: bool,
    /// Physical address of page index 0.
    base: PhysicalAddress,
    total_pages: u64,
    bitmap_at: PhysicalAddress,
    bitmap_bytes: usize,
    free: u64,
    used: u64,
    reserved: u64,
}

impl<M: PhysMapper> PageFrameAllocator<M> {
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            initialized: false,
            base: PhysicalAddress::zero(),
            total_pages: 0,
            bitmap_at: PhysicalAddress::zero(),
            bitmap_bytes: 0,
            free: 0,
            used: 0,
            reserved: 0,
        }
    }

    /// Build the page classification from the firmware memory map.
    ///
    /// Runs once; later calls return `Ok(())` without touching any state.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if the map is empty, has no conventional
    /// region, or the largest one cannot hold the bitmaps. The allocator then
    /// stays uninitialized.
    pub fn read_memory_map(&mut self, map: &MemoryMap<'_>) -> Result<()> {
        if self.initialized {
            debug!("memory map already read, ignoring");
            return Ok(());
        }

        let Some((lowest, highest)) = map.span() else {
            error!("empty memory map");
            return Err(MemoryError::OutOfMemory);
        };
        let reach = self.mapper.reach_end().map_or(u64::MAX, PhysicalAddress::as_u64);
        let Some(largest) = map.largest_conventional_below(reach) else {
            error!("no reachable conventional memory for the page bitmap");
            return Err(MemoryError::OutOfMemory);
        };

        let total_pages = pages_for(highest.as_u64() - lowest.as_u64());
        let bitmap_bytes =
            usize::try_from(total_pages / 8 + 1).map_err(|_| MemoryError::OutOfMemory)?;
        let bitmap_pages = pages_for(2 * bitmap_bytes as u64);
        if largest.page_count < bitmap_pages {
            error!(
                "largest conventional region ({} pages) cannot hold a {bitmap_pages}-page bitmap",
                largest.page_count
            );
            return Err(MemoryError::OutOfMemory);
        }

        self.base = lowest;
        self.total_pages = total_pages;
        self.bitmap_at = PhysicalAddress::new(largest.phys_start);
        self.bitmap_bytes = bitmap_bytes;

        let (mut in_use, mut reservations) = self.bitmaps();
        in_use.fill(true);
        reservations.fill(true);
        self.free = 0;
        self.used = 0;
        self.reserved = total_pages * PAGE_SIZE;
        self.initialized = true;

        let mut unreachable = 0;
        for d in map {
            if is_allocatable(d.ty) {
                let reachable = pages_below(&d, reach);
                unreachable += d.page_count - reachable;
                self.unreserve_pages(PhysicalAddress::new(d.phys_start), reachable)?;
            }
        }
        if unreachable > 0 {
            warn!("{unreachable} allocatable pages at or above {reach:#x} stay reserved");
        }
        self.lock_pages(self.bitmap_at, bitmap_pages)?;

        info!(
            "PFA: {} pages from {lowest:?}, bitmap at {:?}; free {} KiB, used {} KiB, reserved {} KiB",
            total_pages,
            self.bitmap_at,
            self.free / 1024,
            self.used / 1024,
            self.reserved / 1024
        );
        Ok(())
    }

    /// Lock and return the lowest free page.
    ///
    /// # Errors
    /// `NotInitialized` before a memory map was read, `OutOfMemory` when every
    /// page is taken.
    pub fn request_page(&mut self) -> Result<PhysicalAddress> {
        self.ensure_initialized()?;
        let limit = usize::try_from(self.total_pages).unwrap_or(usize::MAX);
        let (in_use, _) = self.bitmaps_ref();
        let Some(index) = in_use.first_clear(limit) else {
            warn!("PFA exhausted");
            return Err(MemoryError::OutOfMemory);
        };
        let address = self.address_of(index);
        self.lock_page(address)?;
        Ok(address)
    }

    /// Mark a page used. Already unavailable pages are left alone.
    ///
    /// # Errors
    /// `NotInitialized`, or `InvalidAddress` outside the managed range.
    pub fn lock_page(&mut self, address: PhysicalAddress) -> Result<()> {
        let index = self.index_of(address)?;
        let (mut in_use, _) = self.bitmaps();
        if in_use.get(index)? {
            return Ok(());
        }
        in_use.set(index, true)?;
        self.free -= PAGE_SIZE;
        self.used += PAGE_SIZE;
        trace!("lock {address:?}");
        Ok(())
    }

    /// Return a used page. Free and reserved pages are left alone.
    ///
    /// # Errors
    /// `NotInitialized`, or `InvalidAddress` outside the managed range.
    pub fn free_page(&mut self, address: PhysicalAddress) -> Result<()> {
        let index = self.index_of(address)?;
        let (mut in_use, reservations) = self.bitmaps();
        if !in_use.get(index)? {
            return Ok(());
        }
        if reservations.get(index)? {
            warn!("refusing to free reserved page {address:?}");
            return Ok(());
        }
        in_use.set(index, false)?;
        self.used -= PAGE_SIZE;
        self.free += PAGE_SIZE;
        trace!("free {address:?}");
        Ok(())
    }

    /// Mark a free page reserved. Unavailable pages are left alone.
    ///
    /// # Errors
    /// `NotInitialized`, or `InvalidAddress` outside the managed range.
    pub fn reserve_page(&mut self, address: PhysicalAddress) -> Result<()> {
        let index = self.index_of(address)?;
        let (mut in_use, mut reservations) = self.bitmaps();
        if in_use.get(index)? {
            return Ok(());
        }
        in_use.set(index, true)?;
        reservations.set(index, true)?;
        self.free -= PAGE_SIZE;
        self.reserved += PAGE_SIZE;
        Ok(())
    }

    /// Release a reservation. Pages that are not reserved are left alone.
    ///
    /// # Errors
    /// `NotInitialized`, or `InvalidAddress` outside the managed range.
    pub fn unreserve_page(&mut self, address: PhysicalAddress) -> Result<()> {
        let index = self.index_of(address)?;
        let (mut in_use, mut reservations) = self.bitmaps();
        if !reservations.get(index)? {
            return Ok(());
        }
        in_use.set(index, false)?;
        reservations.set(index, false)?;
        self.reserved -= PAGE_SIZE;
        self.free += PAGE_SIZE;
        Ok(())
    }

    /// # Errors
    /// The first failing [`lock_page`](Self::lock_page); earlier pages stay locked.
    pub fn lock_pages(&mut self, address: PhysicalAddress, count: u64) -> Result<()> {
        self.each_page(address, count, Self::lock_page)
    }

    /// # Errors
    /// The first failing [`free_page`](Self::free_page); earlier pages stay freed.
    pub fn free_pages(&mut self, address: PhysicalAddress, count: u64) -> Result<()> {
        self.each_page(address, count, Self::free_page)
    }

    /// # Errors
    /// The first failing [`reserve_page`](Self::reserve_page).
    pub fn reserve_pages(&mut self, address: PhysicalAddress, count: u64) -> Result<()> {
        self.each_page(address, count, Self::reserve_page)
    }

    /// # Errors
    /// The first failing [`unreserve_page`](Self::unreserve_page).
    pub fn unreserve_pages(&mut self, address: PhysicalAddress, count: u64) -> Result<()> {
        self.each_page(address, count, Self::unreserve_page)
    }

    fn each_page(
        &mut self,
        address: PhysicalAddress,
        count: u64,
        mut op: impl FnMut(&mut Self, PhysicalAddress) -> Result<()>,
    ) -> Result<()> {
        for n in 0..count {
            let page = count_offset(address, n).ok_or(MemoryError::InvalidAddress { address })?;
            op(self, page)?;
        }
        Ok(())
    }

    /// Whether the page is unavailable (used or reserved).
    ///
    /// # Errors
    /// `NotInitialized`, or `InvalidAddress` outside the managed range.
    pub fn is_page_used(&self, address: PhysicalAddress) -> Result<bool> {
        let index = self.index_of(address)?;
        Ok(self.bitmaps_ref().0.get(index)?)
    }

    /// # Errors
    /// `NotInitialized`, or `InvalidAddress` outside the managed range.
    pub fn is_page_reserved(&self, address: PhysicalAddress) -> Result<bool> {
        let index = self.index_of(address)?;
        Ok(self.bitmaps_ref().1.get(index)?)
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub const fn free_memory(&self) -> u64 {
        self.free
    }

    #[must_use]
    pub const fn used_memory(&self) -> u64 {
        self.used
    }

    #[must_use]
    pub const fn reserved_memory(&self) -> u64 {
        self.reserved
    }

    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        self.total_pages * PAGE_SIZE
    }

    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    /// Physical address of page index 0.
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Where the bitmaps live and how many pages they occupy.
    #[must_use]
    pub const fn bitmap_region(&self) -> (PhysicalAddress, u64) {
        (self.bitmap_at, pages_for(2 * self.bitmap_bytes as u64))
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    const fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(MemoryError::NotInitialized)
        }
    }

    fn index_of(&self, address: PhysicalAddress) -> Result<usize> {
        self.ensure_initialized()?;
        let invalid = MemoryError::InvalidAddress { address };
        let rel = address
            .as_u64()
            .checked_sub(self.base.as_u64())
            .ok_or(invalid)?;
        let index = rel / PAGE_SIZE;
        if index >= self.total_pages {
            return Err(invalid);
        }
        usize::try_from(index).map_err(|_| invalid)
    }

    const fn address_of(&self, index: usize) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + index as u64 * PAGE_SIZE)
    }

    /// The in-use and reservation bitmaps.
    fn bitmaps(&mut self) -> (Bitmap<&mut [u8]>, Bitmap<&mut [u8]>) {
        // SAFETY: the bitmap pages are locked in the PFA itself, never handed
        // out, and lie below the mapper's reach as one contiguous run. The
        // borrow of `self` keeps the views unique.
        let all = unsafe { self.mapper.phys_bytes(self.bitmap_at, 2 * self.bitmap_bytes) };
        let (in_use, reservations) = all.split_at_mut(self.bitmap_bytes);
        (Bitmap::new(in_use), Bitmap::new(reservations))
    }

    fn bitmaps_ref(&self) -> (Bitmap<&[u8]>, Bitmap<&[u8]>) {
        // SAFETY: as in `bitmaps`; shared views while no `&mut self` exists.
        let all: &[u8] =
            unsafe { self.mapper.phys_bytes(self.bitmap_at, 2 * self.bitmap_bytes) };
        let (in_use, reservations) = all.split_at(self.bitmap_bytes);
        (Bitmap::new(in_use), Bitmap::new(reservations))
    }
}

fn count_offset(address: PhysicalAddress, n: u64) -> Option<PhysicalAddress> {
    address.checked_add(n.checked_mul(PAGE_SIZE)?)
}

impl<M: PhysMapper> FrameAlloc for PageFrameAllocator<M> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.request_page().ok().map(PhysicalAddress::page)
    }
}

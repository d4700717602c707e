//! # Kernel Heap
//!
//! A doubly-linked list of blocks laid out back to back from [`HEAP_BASE`].
//! Every block starts with a 32-byte header:
//!
//! ```text
//! +0   size   u64   payload bytes after the header
//! +8   free   u64   0 or 1
//! +16  next   u64   virtual address of the next header, 0 for none
//! +24  prev   u64   virtual address of the previous header, 0 for none
//! ```
//!
//! The list covers the whole mapped heap with no gaps. Allocation is first
//! fit with splitting; `free` merges with free neighbours on both sides.
//!
//! Headers are read and written one aligned `u64` at a time through a
//! [`HeapBacking`], so the heap never assumes its pages are contiguous in
//! physical memory.
//!
//! [`HEAP_BASE`]: kernel_info::memory::HEAP_BASE

use crate::error::{MemoryError, Result};
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_up};
use log::{debug, trace};

/// Bytes in a block header.
pub const HEADER_SIZE: u64 = 32;

/// Allocation granularity.
pub const ALIGN: u64 = 8;

/// Largest request one block can serve.
pub const MAX_REQUEST: u64 = PAGE_SIZE - HEADER_SIZE;

const SIZE: u64 = 0;
const FREE: u64 = 8;
const NEXT: u64 = 16;
const PREV: u64 = 24;

/// Read access to heap memory.
pub trait HeapWords {
    /// Read the aligned `u64` at `va`.
    ///
    /// # Errors
    /// `Unmapped` if `va` has no mapping.
    fn load(&self, va: VirtualAddress) -> Result<u64>;
}

impl<W: HeapWords + ?Sized> HeapWords for &W {
    fn load(&self, va: VirtualAddress) -> Result<u64> {
        (**self).load(va)
    }
}

/// Memory the heap lives in and grows into.
pub trait HeapBacking: HeapWords {
    /// Back the page at `va` with a fresh physical page.
    ///
    /// # Errors
    /// `OutOfMemory` or a mapping failure.
    fn grow(&mut self, va: VirtualAddress) -> Result<()>;

    /// Write the aligned `u64` at `va`.
    ///
    /// # Errors
    /// `Unmapped` if `va` has no mapping.
    fn store(&mut self, va: VirtualAddress, value: u64) -> Result<()>;
}

/// Decoded block header.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Header {
    size: u64,
    free: bool,
    next: Option<VirtualAddress>,
    prev: Option<VirtualAddress>,
}

/// One block as seen from outside.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HeapBlock {
    /// Address of the header.
    pub address: VirtualAddress,
    /// Payload bytes.
    pub size: u64,
    pub free: bool,
}

impl HeapBlock {
    /// Where the payload starts.
    #[must_use]
    pub const fn payload(&self) -> VirtualAddress {
        VirtualAddress::new(self.address.as_u64() + HEADER_SIZE)
    }
}

pub struct Heap {
    base: VirtualAddress,
    end: VirtualAddress,
    initialized: bool,
}

impl Heap {
    #[must_use]
    pub const fn new(base: VirtualAddress) -> Self {
        Self {
            base,
            end: base,
            initialized: false,
        }
    }

    /// Map the first page and install one free block spanning it.
    ///
    /// # Errors
    /// Whatever [`HeapBacking::grow`] reports.
    pub fn initialize<B: HeapBacking>(&mut self, backing: &mut B) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        backing.grow(self.base)?;
        write_header(
            backing,
            self.base,
            &Header {
                size: MAX_REQUEST,
                free: true,
                next: None,
                prev: None,
            },
        )?;
        self.end = VirtualAddress::new(self.base.as_u64() + PAGE_SIZE);
        self.initialized = true;
        debug!("heap at {:?}", self.base);
        Ok(())
    }

    /// Allocate `size` bytes, rounded up to 8.
    ///
    /// Returns `Ok(None)` for a zero-size request.
    ///
    /// # Errors
    /// - `NotInitialized` before [`initialize`](Self::initialize).
    /// - `RequestTooLarge` if the rounded size exceeds [`MAX_REQUEST`].
    /// - `OutOfMemory` (or a mapping failure) when the heap cannot grow.
    pub fn malloc<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        size: usize,
    ) -> Result<Option<VirtualAddress>> {
        if size == 0 {
            return Ok(None);
        }
        if !self.initialized {
            return Err(MemoryError::NotInitialized);
        }
        let wanted = align_up(size as u64, ALIGN);
        if wanted > MAX_REQUEST {
            return Err(MemoryError::RequestTooLarge { size });
        }

        let mut cursor = Some(self.base);
        let mut last = self.base;
        while let Some(at) = cursor {
            let mut block = read_header(backing, at)?;
            if block.free && block.size >= wanted {
                if block.size >= wanted + HEADER_SIZE + ALIGN {
                    split(backing, at, &mut block, wanted)?;
                }
                store_free(backing, at, false)?;
                trace!("malloc({size}) -> {:?}", payload_of(at));
                return Ok(Some(payload_of(at)));
            }
            last = at;
            cursor = block.next;
        }

        self.extend(backing, last).map(Some)
    }

    /// Map one more page at the heap end and hand its block out whole.
    ///
    /// The new block starts out used, so the unused remainder of the page only
    /// becomes available once the block is freed.
    fn extend<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        last: VirtualAddress,
    ) -> Result<VirtualAddress> {
        let at = self.end;
        backing.grow(at)?;
        write_header(
            backing,
            at,
            &Header {
                size: MAX_REQUEST,
                free: false,
                next: None,
                prev: Some(last),
            },
        )?;
        store_link(backing, last, NEXT, Some(at))?;
        self.end = VirtualAddress::new(at.as_u64() + PAGE_SIZE);
        debug!("heap grew to {:?}", self.end);
        Ok(payload_of(at))
    }

    /// Return a block and merge it with free neighbours.
    ///
    /// # Errors
    /// `ForeignPointer` if `ptr` is not the payload of a live block: outside
    /// the heap, inside a block, or already free. Nothing is written then.
    pub fn free<B: HeapBacking>(&mut self, backing: &mut B, ptr: VirtualAddress) -> Result<()> {
        let raw = ptr.as_u64();
        if !self.initialized
            || raw < self.base.as_u64() + HEADER_SIZE
            || raw >= self.end.as_u64()
            || raw % ALIGN != 0
        {
            return Err(MemoryError::ForeignPointer { address: ptr });
        }

        let at = VirtualAddress::new(raw - HEADER_SIZE);
        let mut block = self
            .live_block(backing, at)?
            .ok_or(MemoryError::ForeignPointer { address: ptr })?;
        block.free = true;
        store_free(backing, at, true)?;
        trace!("free({ptr:?})");

        if let Some(next_at) = block.next {
            let next = read_header(backing, next_at)?;
            if next.free {
                block.size += HEADER_SIZE + next.size;
                block.next = next.next;
                write_merged(backing, at, &block)?;
            }
        }

        if let Some(prev_at) = block.prev {
            let mut prev = read_header(backing, prev_at)?;
            if prev.free {
                prev.size += HEADER_SIZE + block.size;
                prev.next = block.next;
                write_merged(backing, prev_at, &prev)?;
            }
        }
        Ok(())
    }

    /// The header at `at`, if the chain has a used block starting there.
    fn live_block<W: HeapWords>(&self, words: &W, at: VirtualAddress) -> Result<Option<Header>> {
        let mut cursor = Some(self.base);
        while let Some(here) = cursor {
            if here.as_u64() > at.as_u64() {
                break;
            }
            let header = read_header(words, here)?;
            if here == at {
                return Ok((!header.free).then_some(header));
            }
            cursor = header.next;
        }
        Ok(None)
    }

    /// Walk the chain from the base.
    pub fn blocks<W: HeapWords>(&self, words: W) -> Blocks<W> {
        Blocks {
            words,
            cursor: self.initialized.then_some(self.base),
        }
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// First address past the mapped heap.
    #[must_use]
    pub const fn heap_end(&self) -> VirtualAddress {
        self.end
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }
}

pub struct Blocks<W> {
    words: W,
    cursor: Option<VirtualAddress>,
}

impl<W: HeapWords> Iterator for Blocks<W> {
    type Item = Result<HeapBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.cursor.take()?;
        match read_header(&self.words, at) {
            Ok(h) => {
                self.cursor = h.next;
                Some(Ok(HeapBlock {
                    address: at,
                    size: h.size,
                    free: h.free,
                }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Carve a free block off the tail of `block` so it keeps exactly `wanted` bytes.
fn split<B: HeapBacking>(
    backing: &mut B,
    at: VirtualAddress,
    block: &mut Header,
    wanted: u64,
) -> Result<()> {
    let tail_at = VirtualAddress::new(at.as_u64() + HEADER_SIZE + wanted);
    let tail = Header {
        size: block.size - wanted - HEADER_SIZE,
        free: true,
        next: block.next,
        prev: Some(at),
    };
    write_header(backing, tail_at, &tail)?;
    if let Some(next) = block.next {
        store_link(backing, next, PREV, Some(tail_at))?;
    }
    block.size = wanted;
    block.next = Some(tail_at);
    backing.store(field(at, SIZE), wanted)?;
    store_link(backing, at, NEXT, Some(tail_at))
}

/// Persist a merged block's size and forward link and point its new
/// successor back at it.
fn write_merged<B: HeapBacking>(backing: &mut B, at: VirtualAddress, merged: &Header) -> Result<()> {
    backing.store(field(at, SIZE), merged.size)?;
    store_link(backing, at, NEXT, merged.next)?;
    if let Some(next) = merged.next {
        store_link(backing, next, PREV, Some(at))?;
    }
    Ok(())
}

const fn payload_of(header: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(header.as_u64() + HEADER_SIZE)
}

const fn field(at: VirtualAddress, offset: u64) -> VirtualAddress {
    VirtualAddress::new(at.as_u64() + offset)
}

const fn link(raw: u64) -> Option<VirtualAddress> {
    if raw == 0 {
        None
    } else {
        Some(VirtualAddress::new(raw))
    }
}

fn read_header<W: HeapWords>(backing: &W, at: VirtualAddress) -> Result<Header> {
    Ok(Header {
        size: backing.load(field(at, SIZE))?,
        free: backing.load(field(at, FREE))? != 0,
        next: link(backing.load(field(at, NEXT))?),
        prev: link(backing.load(field(at, PREV))?),
    })
}

fn write_header<B: HeapBacking>(backing: &mut B, at: VirtualAddress, h: &Header) -> Result<()> {
    backing.store(field(at, SIZE), h.size)?;
    store_free(backing, at, h.free)?;
    store_link(backing, at, NEXT, h.next)?;
    store_link(backing, at, PREV, h.prev)
}

fn store_free<B: HeapBacking>(backing: &mut B, at: VirtualAddress, free: bool) -> Result<()> {
    backing.store(field(at, FREE), u64::from(free))
}

fn store_link<B: HeapBacking>(
    backing: &mut B,
    at: VirtualAddress,
    offset: u64,
    target: Option<VirtualAddress>,
) -> Result<()> {
    backing.store(field(at, offset), target.map_or(0, VirtualAddress::as_u64))
}

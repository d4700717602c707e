//! # Block devices
//!
//! Sector-granular storage. The buffer handed to a transfer is the physical
//! address of a page the caller obtained from the PFA, so hardware can DMA
//! into it directly. A sector never exceeds one page.

use crate::error::Result;
use kernel_alloc::MemoryServices;
use kernel_memory_addresses::PhysicalAddress;

pub trait BlockDevice {
    /// Bytes per sector.
    fn sector_size(&self) -> u32;

    fn sector_count(&self) -> u64;

    /// Copy sector `lba` into the physical buffer.
    ///
    /// # Errors
    /// `OutOfRange` past the last sector, or a device failure.
    fn read_sector<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        lba: u64,
        buffer: PhysicalAddress,
    ) -> Result<()>;

    /// Copy the physical buffer into sector `lba`.
    ///
    /// # Errors
    /// `OutOfRange` past the last sector, or a device failure.
    fn write_sector<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        lba: u64,
        buffer: PhysicalAddress,
    ) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    #[inline]
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    #[inline]
    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    #[inline]
    fn read_sector<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        lba: u64,
        buffer: PhysicalAddress,
    ) -> Result<()> {
        (**self).read_sector(services, lba, buffer)
    }

    #[inline]
    fn write_sector<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        lba: u64,
        buffer: PhysicalAddress,
    ) -> Result<()> {
        (**self).write_sector(services, lba, buffer)
    }
}

/// `OutOfRange` unless `lba` is a sector of a device with `count` sectors.
pub(crate) const fn check_lba(lba: u64, count: u64) -> Result<()> {
    if lba < count {
        Ok(())
    } else {
        Err(crate::error::StorageError::OutOfRange {
            lba,
            last: count.saturating_sub(1),
        })
    }
}

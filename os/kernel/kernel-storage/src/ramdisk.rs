//! # RAM disk
//!
//! A block device backed by a byte vector. Transfers copy through the
//! buffer's offset-mapped address, standing in for the DMA engine of a real
//! controller.

use crate::block::{BlockDevice, check_lba};
use crate::error::{Result, StorageError};
use alloc::vec;
use alloc::vec::Vec;
use kernel_alloc::{MemoryError, MemoryServices};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

pub struct RamDisk {
    data: Vec<u8>,
    sector_size: u32,
    reads: u64,
    writes: u64,
}

impl RamDisk {
    /// A zeroed disk of `sectors` sectors.
    ///
    /// # Errors
    /// `UnsupportedSectorSize` unless the size is a power of two between 512
    /// bytes and one page.
    pub fn new(sectors: u64, sector_size: u32) -> Result<Self> {
        let len = usize::try_from(sectors * u64::from(sector_size)).unwrap_or(usize::MAX);
        Self::from_image(vec![0; len], sector_size)
    }

    /// Wrap an existing image; a partial last sector is padded with zeros.
    ///
    /// # Errors
    /// As [`new`](Self::new).
    pub fn from_image(mut data: Vec<u8>, sector_size: u32) -> Result<Self> {
        if !sector_size.is_power_of_two()
            || sector_size < 512
            || u64::from(sector_size) > PAGE_SIZE
        {
            return Err(StorageError::UnsupportedSectorSize { size: sector_size });
        }
        let size = sector_size as usize;
        data.resize(data.len().div_ceil(size) * size, 0);
        Ok(Self {
            data,
            sector_size,
            reads: 0,
            writes: 0,
        })
    }

    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Sectors read so far.
    #[must_use]
    pub const fn reads(&self) -> u64 {
        self.reads
    }

    #[must_use]
    pub const fn writes(&self) -> u64 {
        self.writes
    }

    fn span(&self, lba: u64) -> Result<core::ops::Range<usize>> {
        check_lba(lba, self.sector_count())?;
        let size = self.sector_size as usize;
        let start = usize::try_from(lba).unwrap_or(usize::MAX) * size;
        Ok(start..start + size)
    }
}

fn offset_mapped(buffer: PhysicalAddress) -> Result<VirtualAddress> {
    buffer
        .to_offset_mapped()
        .ok_or(StorageError::Memory(MemoryError::InvalidAddress { address: buffer }))
}

impl BlockDevice for RamDisk {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.data.len() as u64 / u64::from(self.sector_size)
    }

    fn read_sector<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        lba: u64,
        buffer: PhysicalAddress,
    ) -> Result<()> {
        let span = self.span(lba)?;
        services.write_bytes(offset_mapped(buffer)?, &self.data[span])?;
        self.reads += 1;
        Ok(())
    }

    fn write_sector<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        lba: u64,
        buffer: PhysicalAddress,
    ) -> Result<()> {
        let span = self.span(lba)?;
        services.read_bytes(offset_mapped(buffer)?, &mut self.data[span])?;
        self.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_follows_the_image() {
        let disk = RamDisk::from_image(vec![1; 1500], 512).unwrap();
        assert_eq!(disk.sector_count(), 3);
        assert_eq!(disk.image().len(), 1536);
        assert_eq!(disk.image()[1535], 0);
    }

    #[test]
    fn odd_sector_sizes_are_refused() {
        assert_eq!(
            RamDisk::new(4, 520).err(),
            Some(StorageError::UnsupportedSectorSize { size: 520 })
        );
        assert!(RamDisk::new(4, 8192).is_err());
        assert!(RamDisk::new(4, 4096).is_ok());
    }

    #[test]
    fn lba_past_the_end_is_out_of_range() {
        let disk = RamDisk::new(8, 512).unwrap();
        assert_eq!(
            disk.span(8),
            Err(StorageError::OutOfRange { lba: 8, last: 7 })
        );
        assert_eq!(disk.span(7), Ok(3584..4096));
    }
}

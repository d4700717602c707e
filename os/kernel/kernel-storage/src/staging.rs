//! # Staging pages
//!
//! Drivers never read disk structures through a pointer to the block device.
//! Each transfer lands in a page taken from the PFA and mapped uncached at its
//! offset-mapped address; the CPU then copies what it needs out of it.

use crate::block::BlockDevice;
use crate::error::{Result, StorageError};
use kernel_alloc::MemoryServices;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use log::trace;

/// One PFA page mapped at `physical + DIRECT_MAP_OFFSET`.
///
/// There is no `Drop`: returning the page needs the services, so call
/// [`release`](Self::release) or use [`with_staging`].
#[derive(Debug)]
#[must_use = "a staging page must be released"]
pub struct StagingPage {
    physical: PhysicalAddress,
    virt: VirtualAddress,
}

impl StagingPage {
    /// Take a page, map it uncached and zero it.
    ///
    /// # Errors
    /// `OutOfMemory` or a mapping failure. The page is returned on failure.
    pub fn acquire<S: MemoryServices + ?Sized>(services: &mut S) -> Result<Self> {
        let physical = services.request_page()?;
        let virt = match services.map_offset(physical, false) {
            Ok(virt) => virt,
            Err(e) => {
                services.free_page(physical)?;
                return Err(e.into());
            }
        };
        let page = Self { physical, virt };
        if let Err(e) = services.fill_bytes(virt, 0, PAGE_SIZE as usize) {
            page.release(services)?;
            return Err(e.into());
        }
        trace!("staging page {physical:?}");
        Ok(page)
    }

    /// Put the cacheable offset mapping back and hand the page to the PFA.
    ///
    /// The offset window is how the kernel reaches every RAM frame, so the
    /// uncached entry is overwritten rather than removed.
    ///
    /// # Errors
    /// Propagates the PFA's answer.
    pub fn release<S: MemoryServices + ?Sized>(self, services: &mut S) -> Result<()> {
        services.map_memory(self.virt, self.physical, true)?;
        services.free_page(self.physical)?;
        Ok(())
    }

    #[must_use]
    pub const fn physical(&self) -> PhysicalAddress {
        self.physical
    }

    #[must_use]
    pub const fn virtual_address(&self) -> VirtualAddress {
        self.virt
    }

    /// Physical address `offset` bytes into the page.
    #[must_use]
    pub const fn physical_at(&self, offset: u64) -> PhysicalAddress {
        PhysicalAddress::new(self.physical.as_u64() + offset)
    }

    /// # Errors
    /// `Corrupt` if the range leaves the page, otherwise memory errors.
    pub fn read<S: MemoryServices + ?Sized>(
        &self,
        services: &S,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        Self::check(offset, buf.len())?;
        services.read_bytes(self.virt + offset as u64, buf)?;
        Ok(())
    }

    /// # Errors
    /// `Corrupt` if the range leaves the page, otherwise memory errors.
    pub fn write<S: MemoryServices + ?Sized>(
        &self,
        services: &mut S,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        Self::check(offset, data.len())?;
        services.write_bytes(self.virt + offset as u64, data)?;
        Ok(())
    }

    /// # Errors
    /// Memory errors.
    pub fn clear<S: MemoryServices + ?Sized>(&self, services: &mut S) -> Result<()> {
        services.fill_bytes(self.virt, 0, PAGE_SIZE as usize)?;
        Ok(())
    }

    const fn check(offset: usize, len: usize) -> Result<()> {
        if offset + len > PAGE_SIZE as usize {
            return Err(StorageError::Corrupt("staging range"));
        }
        Ok(())
    }
}

/// Run `f` with a fresh staging page and release it afterwards, whatever `f`
/// returned.
///
/// # Errors
/// The error of `f`, or of acquiring or releasing the page.
pub fn with_staging<S, R>(
    services: &mut S,
    f: impl FnOnce(&mut S, &StagingPage) -> Result<R>,
) -> Result<R>
where
    S: MemoryServices + ?Sized,
{
    let page = StagingPage::acquire(services)?;
    let result = f(services, &page);
    page.release(services)?;
    result
}

/// Sector size of `device` if one sector fits a staging page.
///
/// # Errors
/// `UnsupportedSectorSize` otherwise.
pub fn staged_sector_size<D: BlockDevice + ?Sized>(device: &D) -> Result<u64> {
    let size = device.sector_size();
    if size == 0 || u64::from(size) > PAGE_SIZE || !PAGE_SIZE.is_multiple_of(u64::from(size)) {
        return Err(StorageError::UnsupportedSectorSize { size });
    }
    Ok(u64::from(size))
}

/// Read `buf.len()` bytes starting at byte `offset` of `device`, one sector at
/// a time through a single staging page.
///
/// # Errors
/// Device, range or memory errors.
pub fn read_span<D, S>(device: &mut D, services: &mut S, offset: u64, buf: &mut [u8]) -> Result<()>
where
    D: BlockDevice + ?Sized,
    S: MemoryServices + ?Sized,
{
    let sector = staged_sector_size(device)?;
    with_staging(services, |services, page| {
        let mut done = 0usize;
        while done < buf.len() {
            let at = offset + done as u64;
            let within = at % sector;
            let n = usize::try_from(sector - within)
                .unwrap_or(usize::MAX)
                .min(buf.len() - done);
            device.read_sector(services, at / sector, page.physical())?;
            page.read(services, within as usize, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    })
}

/// Write `data` to `device` starting at byte `offset`. Sectors only partly
/// covered are read first so their other bytes survive.
///
/// # Errors
/// Device, range or memory errors.
pub fn write_span<D, S>(device: &mut D, services: &mut S, offset: u64, data: &[u8]) -> Result<()>
where
    D: BlockDevice + ?Sized,
    S: MemoryServices + ?Sized,
{
    let sector = staged_sector_size(device)?;
    with_staging(services, |services, page| {
        let mut done = 0usize;
        while done < data.len() {
            let at = offset + done as u64;
            let within = at % sector;
            let n = usize::try_from(sector - within)
                .unwrap_or(usize::MAX)
                .min(data.len() - done);
            let lba = at / sector;
            if n as u64 != sector {
                device.read_sector(services, lba, page.physical())?;
            }
            page.write(services, within as usize, &data[done..done + n])?;
            device.write_sector(services, lba, page.physical())?;
            done += n;
        }
        Ok(())
    })
}

//! # GUID Partition Table
//!
//! ```text
//! LBA 0   protective MBR, one partition record of type 0xEE at byte 446
//! LBA 1   GPT header, signature "EFI PART"
//! LBA 2.. partition entry array, `entry_count` entries of `entry_size` bytes
//! ```
//!
//! Only the primary header is read. CRCs are not verified.

use crate::block::{BlockDevice, check_lba};
use crate::bytes::{bytes_at, u16_at, u32_at, u64_at};
use crate::error::{Result, StorageError};
use crate::staging::{staged_sector_size, with_staging};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use kernel_alloc::MemoryServices;
use kernel_memory_addresses::PhysicalAddress;
use log::{debug, info, warn};

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Entries beyond this many are ignored.
pub const MAX_PARTITIONS: usize = 128;

/// Smallest legal partition entry.
pub const MIN_ENTRY_SIZE: u32 = 128;

const MBR_RECORD: usize = 446;
const OS_TYPE_GPT_PROTECTIVE: u8 = 0xEE;

/// Mixed-endian GUID as stored on disk.
#[derive(Clone, Copy, Eq, PartialEq, Default)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            u32_at(b, 0),
            u16_at(b, 4),
            u16_at(b, 6),
            b[8],
            b[9]
        )?;
        b[10..].iter().try_for_each(|x| write!(f, "{x:02X}"))
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The first partition record of the MBR in LBA 0.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ProtectiveMbr {
    pub boot_indicator: u8,
    pub os_type: u8,
    pub starting_lba: u32,
    pub size_in_lba: u32,
    /// `0x55AA` at bytes 510..512.
    pub boot_signature: bool,
}

impl ProtectiveMbr {
    #[must_use]
    pub fn parse(sector: &[u8]) -> Self {
        let record = &sector[MBR_RECORD.min(sector.len())..];
        Self {
            boot_indicator: record.first().copied().unwrap_or(0),
            os_type: record.get(4).copied().unwrap_or(0),
            starting_lba: u32_at(record, 8),
            size_in_lba: u32_at(record, 12),
            boot_signature: u16_at(sector, 510) == 0xAA55,
        }
    }

    #[must_use]
    pub const fn is_protective(&self) -> bool {
        self.boot_signature && self.os_type == OS_TYPE_GPT_PROTECTIVE
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    /// First sector of the partition entry array.
    pub partition_entry_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
}

impl GptHeader {
    /// # Errors
    /// `NoGpt` without the signature, `Corrupt` for an unusable entry size.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if bytes_at::<8>(sector, 0) != GPT_SIGNATURE {
            return Err(StorageError::NoGpt);
        }
        let header = Self {
            revision: u32_at(sector, 8),
            header_size: u32_at(sector, 12),
            my_lba: u64_at(sector, 24),
            alternate_lba: u64_at(sector, 32),
            first_usable_lba: u64_at(sector, 40),
            last_usable_lba: u64_at(sector, 48),
            disk_guid: Guid(bytes_at(sector, 56)),
            partition_entry_lba: u64_at(sector, 72),
            entry_count: u32_at(sector, 80),
            entry_size: u32_at(sector, 84),
        };
        if header.entry_size < MIN_ENTRY_SIZE || !header.entry_size.is_multiple_of(8) {
            return Err(StorageError::Corrupt("GPT partition entry size"));
        }
        Ok(header)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PartitionEntry {
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
    pub attributes: u64,
    name: [u16; 36],
}

impl PartitionEntry {
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let mut name = [0u16; 36];
        for (n, unit) in name.iter_mut().enumerate() {
            *unit = u16_at(raw, 56 + 2 * n);
        }
        Self {
            type_guid: Guid(bytes_at(raw, 0)),
            unique_guid: Guid(bytes_at(raw, 16)),
            first_lba: u64_at(raw, 32),
            last_lba: u64_at(raw, 40),
            attributes: u64_at(raw, 48),
            name,
        }
    }

    /// Unused slots have a zero type or a zero unique GUID.
    #[must_use]
    pub fn is_used(&self) -> bool {
        !self.type_guid.is_zero() && !self.unique_guid.is_zero()
    }

    /// The UTF-16 name up to its first NUL.
    #[must_use]
    pub fn name(&self) -> String {
        let len = self.name.iter().position(|&u| u == 0).unwrap_or(self.name.len());
        char::decode_utf16(self.name[..len].iter().copied())
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }

    #[must_use]
    pub const fn sector_count(&self) -> u64 {
        if self.last_lba >= self.first_lba {
            self.last_lba - self.first_lba + 1
        } else {
            0
        }
    }
}

/// A disk's partition table.
#[derive(Debug, Clone)]
pub struct GptDisk {
    mbr: ProtectiveMbr,
    header: GptHeader,
    partitions: Vec<PartitionEntry>,
}

impl GptDisk {
    /// Read LBA 0, LBA 1 and the partition entry array.
    ///
    /// # Errors
    /// `NoGpt` if LBA 1 has no GPT header, otherwise device and memory errors.
    pub fn probe<D, S>(device: &mut D, services: &mut S) -> Result<Self>
    where
        D: BlockDevice + ?Sized,
        S: MemoryServices + ?Sized,
    {
        let sector_size = staged_sector_size(device)?;
        let size = usize::try_from(sector_size).unwrap_or(usize::MAX);
        let mut sector = vec![0u8; size];

        with_staging(services, |services, page| {
            device.read_sector(services, 0, page.physical())?;
            page.read(services, 0, &mut sector)?;
            let mbr = ProtectiveMbr::parse(&sector);
            if !mbr.is_protective() {
                warn!("LBA 0 holds no protective MBR (type {:#04x})", mbr.os_type);
            }

            page.clear(services)?;
            device.read_sector(services, 1, page.physical())?;
            page.read(services, 0, &mut sector)?;
            let header = GptHeader::parse(&sector)?;
            if u64::from(header.entry_size) > sector_size {
                return Err(StorageError::Corrupt("GPT entry larger than a sector"));
            }
            debug!(
                "GPT disk {} with {} entries at LBA {}",
                header.disk_guid, header.entry_count, header.partition_entry_lba
            );

            let entry_size = header.entry_size as usize;
            let per_sector = size / entry_size;
            let sectors = (header.entry_count as usize).div_ceil(per_sector);
            let mut partitions = Vec::new();
            'sectors: for s in 0..sectors {
                page.clear(services)?;
                device.read_sector(services, header.partition_entry_lba + s as u64, page.physical())?;
                page.read(services, 0, &mut sector)?;
                for i in 0..per_sector {
                    if s * per_sector + i >= header.entry_count as usize {
                        break 'sectors;
                    }
                    let entry = PartitionEntry::parse(&sector[i * entry_size..(i + 1) * entry_size]);
                    if !entry.is_used() {
                        continue;
                    }
                    if partitions.len() == MAX_PARTITIONS {
                        warn!("more than {MAX_PARTITIONS} partitions, ignoring the rest");
                        break 'sectors;
                    }
                    partitions.push(entry);
                }
            }

            info!("GPT: {} partitions", partitions.len());
            Ok(Self {
                mbr,
                header,
                partitions,
            })
        })
    }

    #[must_use]
    pub const fn mbr(&self) -> &ProtectiveMbr {
        &self.mbr
    }

    #[must_use]
    pub const fn header(&self) -> &GptHeader {
        &self.header
    }

    #[must_use]
    pub fn partitions(&self) -> &[PartitionEntry] {
        &self.partitions
    }

    /// View partition `index` of `device` as a block device of its own.
    pub fn partition<D: BlockDevice>(&self, index: usize, device: D) -> Option<Partition<D>> {
        self.partitions.get(index).map(|entry| Partition::new(device, entry))
    }
}

/// A partition as a block device; LBA 0 is the partition's first sector.
pub struct Partition<D> {
    device: D,
    first_lba: u64,
    last_lba: u64,
}

impl<D: BlockDevice> Partition<D> {
    pub fn new(device: D, entry: &PartitionEntry) -> Self {
        Self {
            device,
            first_lba: entry.first_lba,
            last_lba: entry.last_lba,
        }
    }

    #[must_use]
    pub const fn first_lba(&self) -> u64 {
        self.first_lba
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    fn translate(&self, lba: u64) -> Result<u64> {
        let count = if self.last_lba >= self.first_lba {
            self.last_lba - self.first_lba + 1
        } else {
            0
        };
        check_lba(lba, count)?;
        Ok(self.first_lba + lba)
    }
}

impl<D: BlockDevice> BlockDevice for Partition<D> {
    fn sector_size(&self) -> u32 {
        self.device.sector_size()
    }

    fn sector_count(&self) -> u64 {
        if self.last_lba >= self.first_lba {
            self.last_lba - self.first_lba + 1
        } else {
            0
        }
    }

    fn read_sector<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        lba: u64,
        buffer: PhysicalAddress,
    ) -> Result<()> {
        let lba = self.translate(lba)?;
        self.device.read_sector(services, lba, buffer)
    }

    fn write_sector<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        lba: u64,
        buffer: PhysicalAddress,
    ) -> Result<()> {
        let lba = self.translate(lba)?;
        self.device.write_sector(services, lba, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(first: u64, last: u64, name: &str) -> Vec<u8> {
        let mut raw = vec![0u8; 128];
        raw[0] = 0xAF;
        raw[16] = 0x01;
        raw[32..40].copy_from_slice(&first.to_le_bytes());
        raw[40..48].copy_from_slice(&last.to_le_bytes());
        for (n, unit) in name.encode_utf16().enumerate() {
            raw[56 + 2 * n..58 + 2 * n].copy_from_slice(&unit.to_le_bytes());
        }
        raw
    }

    #[test]
    fn partition_entry_fields_and_name() {
        let e = PartitionEntry::parse(&entry(2048, 4095, "EFI system"));
        assert!(e.is_used());
        assert_eq!(e.first_lba, 2048);
        assert_eq!(e.sector_count(), 2048);
        assert_eq!(e.name(), "EFI system");
    }

    #[test]
    fn zero_guids_mark_unused_slots() {
        let mut raw = entry(1, 2, "x");
        raw[16] = 0;
        assert!(!PartitionEntry::parse(&raw).is_used());
        let mut raw = entry(1, 2, "x");
        raw[0] = 0;
        assert!(!PartitionEntry::parse(&raw).is_used());
    }

    #[test]
    fn header_requires_signature_and_sane_entry_size() {
        let mut sector = vec![0u8; 512];
        assert_eq!(GptHeader::parse(&sector), Err(StorageError::NoGpt));
        sector[..8].copy_from_slice(b"EFI PART");
        sector[84..88].copy_from_slice(&64u32.to_le_bytes());
        assert!(matches!(GptHeader::parse(&sector), Err(StorageError::Corrupt(_))));
        sector[72..80].copy_from_slice(&2u64.to_le_bytes());
        sector[80..84].copy_from_slice(&128u32.to_le_bytes());
        sector[84..88].copy_from_slice(&128u32.to_le_bytes());
        let header = GptHeader::parse(&sector).unwrap();
        assert_eq!(header.partition_entry_lba, 2);
        assert_eq!(header.entry_count, 128);
    }

    #[test]
    fn protective_mbr_record() {
        let mut sector = vec![0u8; 512];
        sector[446 + 4] = 0xEE;
        sector[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
        assert!(!ProtectiveMbr::parse(&sector).is_protective());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        let mbr = ProtectiveMbr::parse(&sector);
        assert!(mbr.is_protective());
        assert_eq!(mbr.starting_lba, 1);
    }

    #[test]
    fn guid_formats_mixed_endian() {
        let g = Guid([
            0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E,
            0xC9, 0x3B,
        ]);
        assert_eq!(
            alloc::format!("{g}"),
            "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"
        );
    }
}

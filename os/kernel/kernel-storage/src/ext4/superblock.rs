//! The superblock, 1024 bytes at byte offset 1024 of the volume.

use super::checksum::crc32c;
use crate::bytes::{bytes_at, put_u32, u16_at, u32_at};
use crate::error::{Result, StorageError};
use kernel_memory_addresses::PAGE_SIZE;
use log::warn;

pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const EXT4_MAGIC: u16 = 0xEF53;

pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const INCOMPAT_64BIT: u32 = 0x0080;
pub const INCOMPAT_FLEX_BG: u32 = 0x0200;
/// `s_checksum_seed` holds the seed instead of it being derived from the UUID.
pub const INCOMPAT_CSUM_SEED: u32 = 0x2000;

pub const RO_COMPAT_GDT_CSUM: u32 = 0x0010;
pub const RO_COMPAT_BIGALLOC: u32 = 0x0200;
pub const RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

/// Incompatible features a reader of plain extent files can ignore.
const INCOMPAT_UNDERSTOOD: u32 = INCOMPAT_FILETYPE
    | INCOMPAT_EXTENTS
    | INCOMPAT_64BIT
    | INCOMPAT_FLEX_BG
    | INCOMPAT_CSUM_SEED
    | 0x0004
    | 0x0008;

/// Revision 0 volumes have fixed 128-byte inodes.
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
/// First non-reserved inode on revision 0 volumes.
const GOOD_OLD_FIRST_INO: u32 = 11;
const MIN_DESC_SIZE: u16 = 32;
const CHECKSUM_OFFSET: usize = 0x3FC;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub free_blocks_count: u64,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub magic: u16,
    pub rev_level: u32,
    first_ino: u32,
    inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    volume_name: [u8; 16],
    desc_size: u16,
    checksum_seed: u32,
}

impl Superblock {
    /// # Errors
    /// * `BadSuperblock` without the magic or with zero-sized groups.
    /// * `UnsupportedFeature` without extents or with blocks larger than a page.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let incompat = u32_at(raw, 96);
        let hi = |at: usize| {
            if incompat & INCOMPAT_64BIT != 0 {
                u64::from(u32_at(raw, at)) << 32
            } else {
                0
            }
        };
        let sb = Self {
            inodes_count: u32_at(raw, 0),
            blocks_count: u64::from(u32_at(raw, 4)) | hi(0x150),
            free_blocks_count: u64::from(u32_at(raw, 12)) | hi(0x158),
            free_inodes_count: u32_at(raw, 16),
            first_data_block: u32_at(raw, 20),
            log_block_size: u32_at(raw, 24),
            blocks_per_group: u32_at(raw, 32),
            inodes_per_group: u32_at(raw, 40),
            magic: u16_at(raw, 56),
            rev_level: u32_at(raw, 76),
            first_ino: u32_at(raw, 84),
            inode_size: u16_at(raw, 88),
            feature_compat: u32_at(raw, 92),
            feature_incompat: incompat,
            feature_ro_compat: u32_at(raw, 100),
            uuid: bytes_at(raw, 104),
            volume_name: bytes_at(raw, 120),
            desc_size: u16_at(raw, 254),
            checksum_seed: u32_at(raw, 0x270),
        };

        if sb.magic != EXT4_MAGIC {
            return Err(StorageError::BadSuperblock);
        }
        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 || sb.log_block_size > 6 {
            return Err(StorageError::BadSuperblock);
        }
        if incompat & INCOMPAT_EXTENTS == 0 {
            return Err(StorageError::UnsupportedFeature("extents"));
        }
        if sb.block_size() > PAGE_SIZE {
            return Err(StorageError::UnsupportedFeature("blocks larger than a page"));
        }
        if sb.inode_size() < GOOD_OLD_INODE_SIZE {
            return Err(StorageError::BadSuperblock);
        }
        if incompat & !INCOMPAT_UNDERSTOOD != 0 {
            warn!(
                "ext4: ignoring incompatible features {:#x}",
                incompat & !INCOMPAT_UNDERSTOOD
            );
        }
        Ok(sb)
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        1024 << self.log_block_size
    }

    #[must_use]
    pub const fn inode_size(&self) -> u16 {
        if self.rev_level == 0 {
            GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size
        }
    }

    /// Group descriptor size; 32 unless the volume is 64-bit.
    #[must_use]
    pub const fn descriptor_size(&self) -> u16 {
        if self.feature_incompat & INCOMPAT_64BIT != 0 && self.desc_size >= MIN_DESC_SIZE {
            self.desc_size
        } else {
            MIN_DESC_SIZE
        }
    }

    #[must_use]
    pub const fn group_count(&self) -> u32 {
        let data_blocks = self.blocks_count.saturating_sub(self.first_data_block as u64);
        #[allow(clippy::cast_possible_truncation)]
        {
            data_blocks.div_ceil(self.blocks_per_group as u64) as u32
        }
    }

    /// The block right after the superblock's: block 2 with 1 KiB blocks,
    /// block 1 otherwise.
    #[must_use]
    pub const fn descriptor_table_block(&self) -> u64 {
        self.first_data_block as u64 + 1
    }

    #[must_use]
    pub const fn has_file_type(&self) -> bool {
        self.feature_incompat & INCOMPAT_FILETYPE != 0
    }

    /// The lowest inode number that is not reserved.
    #[must_use]
    pub const fn first_ino(&self) -> u32 {
        if self.rev_level == 0 {
            GOOD_OLD_FIRST_INO
        } else {
            self.first_ino
        }
    }

    #[must_use]
    pub const fn has_metadata_csum(&self) -> bool {
        self.feature_ro_compat & RO_COMPAT_METADATA_CSUM != 0
    }

    /// Seed of every metadata checksum except the superblock's own.
    #[must_use]
    pub fn checksum_seed(&self) -> u32 {
        if self.feature_incompat & INCOMPAT_CSUM_SEED != 0 {
            self.checksum_seed
        } else {
            crc32c(!0, &self.uuid)
        }
    }

    /// Put the free counts into `raw`, the superblock as read from disk, and
    /// recompute its checksum when the volume has one.
    pub fn store(&self, raw: &mut [u8]) {
        let (lo, hi) = split(self.free_blocks_count);
        put_u32(raw, 12, lo);
        if self.feature_incompat & INCOMPAT_64BIT != 0 {
            put_u32(raw, 0x158, hi);
        }
        put_u32(raw, 16, self.free_inodes_count);
        if self.has_metadata_csum() && raw.len() >= SUPERBLOCK_SIZE {
            let checksum = crc32c(!0, &raw[..CHECKSUM_OFFSET]);
            put_u32(raw, CHECKSUM_OFFSET, checksum);
        }
    }

    /// Label up to the first NUL; empty if not UTF-8.
    #[must_use]
    pub fn volume_name(&self) -> &str {
        let len = self.volume_name.iter().position(|&b| b == 0).unwrap_or(16);
        core::str::from_utf8(&self.volume_name[..len]).unwrap_or("")
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn split(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(log_block_size: u32, incompat: u32) -> alloc::vec::Vec<u8> {
        let mut raw = alloc::vec![0u8; SUPERBLOCK_SIZE];
        raw[0..4].copy_from_slice(&64u32.to_le_bytes());
        raw[4..8].copy_from_slice(&1000u32.to_le_bytes());
        raw[20..24].copy_from_slice(&u32::from(log_block_size == 0).to_le_bytes());
        raw[24..28].copy_from_slice(&log_block_size.to_le_bytes());
        raw[32..36].copy_from_slice(&8192u32.to_le_bytes());
        raw[40..44].copy_from_slice(&64u32.to_le_bytes());
        raw[56..58].copy_from_slice(&EXT4_MAGIC.to_le_bytes());
        raw[76..80].copy_from_slice(&1u32.to_le_bytes());
        raw[84..88].copy_from_slice(&11u32.to_le_bytes());
        raw[88..90].copy_from_slice(&256u16.to_le_bytes());
        raw[96..100].copy_from_slice(&incompat.to_le_bytes());
        raw[120..124].copy_from_slice(b"root");
        raw
    }

    #[test]
    fn geometry_of_a_1k_volume() {
        let sb = Superblock::parse(&raw(0, INCOMPAT_EXTENTS | INCOMPAT_FILETYPE)).unwrap();
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.descriptor_table_block(), 2);
        assert_eq!(sb.descriptor_size(), 32);
        assert_eq!(sb.group_count(), 1);
        assert_eq!(sb.inode_size(), 256);
        assert_eq!(sb.volume_name(), "root");
        assert!(sb.has_file_type());
    }

    #[test]
    fn larger_blocks_put_the_descriptors_in_block_one() {
        let sb = Superblock::parse(&raw(2, INCOMPAT_EXTENTS)).unwrap();
        assert_eq!(sb.block_size(), 4096);
        assert_eq!(sb.descriptor_table_block(), 1);
    }

    #[test]
    fn rejects_what_it_cannot_read() {
        assert_eq!(
            Superblock::parse(&raw(0, INCOMPAT_FILETYPE)),
            Err(StorageError::UnsupportedFeature("extents"))
        );
        assert!(matches!(
            Superblock::parse(&raw(3, INCOMPAT_EXTENTS)),
            Err(StorageError::UnsupportedFeature(_))
        ));
        let mut bad = raw(0, INCOMPAT_EXTENTS);
        bad[56] = 0;
        assert_eq!(Superblock::parse(&bad), Err(StorageError::BadSuperblock));
    }

    #[test]
    fn stored_counts_and_checksum() {
        let mut raw = raw(0, INCOMPAT_EXTENTS | INCOMPAT_64BIT);
        raw[100..104].copy_from_slice(&RO_COMPAT_METADATA_CSUM.to_le_bytes());
        let mut sb = Superblock::parse(&raw).unwrap();
        sb.free_blocks_count = (3 << 32) | 7;
        sb.free_inodes_count = 9;
        sb.store(&mut raw);

        let again = Superblock::parse(&raw).unwrap();
        assert_eq!(again.free_blocks_count, (3 << 32) | 7);
        assert_eq!(again.free_inodes_count, 9);
        assert_eq!(u32_at(&raw, CHECKSUM_OFFSET), crc32c(!0, &raw[..CHECKSUM_OFFSET]));
    }

    #[test]
    fn seed_comes_from_the_uuid_unless_stored() {
        let mut raw = raw(0, INCOMPAT_EXTENTS);
        raw[104..120].copy_from_slice(&[0xAB; 16]);
        raw[0x270..0x274].copy_from_slice(&0x5EED_u32.to_le_bytes());
        let sb = Superblock::parse(&raw).unwrap();
        assert_eq!(sb.checksum_seed(), crc32c(!0, &[0xAB; 16]));
        assert_eq!(sb.first_ino(), 11);

        raw[96..100].copy_from_slice(&(INCOMPAT_EXTENTS | INCOMPAT_CSUM_SEED).to_le_bytes());
        assert_eq!(Superblock::parse(&raw).unwrap().checksum_seed(), 0x5EED);
    }
}

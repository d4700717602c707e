//! Block group descriptors.

use super::checksum::crc32c;
use crate::bytes::{put_u16, put_u32, u16_at, u32_at};

/// Descriptors of at least this size carry the high halves.
const WIDE_DESC_SIZE: u16 = 64;
const CHECKSUM_OFFSET: usize = 0x1E;

/// `bg_flags`: the inode table and bitmap are not initialized.
pub const INODE_UNINIT: u16 = 0x1;
/// `bg_flags`: the block bitmap is not initialized.
pub const BLOCK_UNINIT: u16 = 0x2;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GroupDescriptor {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub used_dirs: u32,
    pub flags: u16,
    pub block_bitmap_csum: u32,
    pub inode_bitmap_csum: u32,
    /// Inodes at the end of the table that were never used.
    pub itable_unused: u32,
    pub checksum: u16,
}

impl GroupDescriptor {
    #[must_use]
    pub fn parse(raw: &[u8], desc_size: u16) -> Self {
        let wide = desc_size >= WIDE_DESC_SIZE;
        let lo_hi32 = |lo: usize, hi: usize| {
            u64::from(u32_at(raw, lo)) | if wide { u64::from(u32_at(raw, hi)) << 32 } else { 0 }
        };
        let lo_hi16 = |lo: usize, hi: usize| {
            u32::from(u16_at(raw, lo)) | if wide { u32::from(u16_at(raw, hi)) << 16 } else { 0 }
        };
        Self {
            block_bitmap: lo_hi32(0x00, 0x20),
            inode_bitmap: lo_hi32(0x04, 0x24),
            inode_table: lo_hi32(0x08, 0x28),
            free_blocks: lo_hi16(0x0C, 0x2C),
            free_inodes: lo_hi16(0x0E, 0x2E),
            used_dirs: lo_hi16(0x10, 0x30),
            flags: u16_at(raw, 0x12),
            block_bitmap_csum: lo_hi16(0x18, 0x38),
            inode_bitmap_csum: lo_hi16(0x1A, 0x3A),
            itable_unused: lo_hi16(0x1C, 0x32),
            checksum: u16_at(raw, CHECKSUM_OFFSET),
        }
    }

    /// Write every field back into `raw`; high halves only for wide
    /// descriptors. The checksum is left to [`seal`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn store(&self, raw: &mut [u8], desc_size: u16) {
        let wide = desc_size >= WIDE_DESC_SIZE;
        let mut lo_hi32 = |lo: usize, hi: usize, value: u64| {
            put_u32(raw, lo, value as u32);
            if wide {
                put_u32(raw, hi, (value >> 32) as u32);
            }
        };
        lo_hi32(0x00, 0x20, self.block_bitmap);
        lo_hi32(0x04, 0x24, self.inode_bitmap);
        lo_hi32(0x08, 0x28, self.inode_table);

        let mut lo_hi16 = |lo: usize, hi: usize, value: u32| {
            put_u16(raw, lo, value as u16);
            if wide {
                put_u16(raw, hi, (value >> 16) as u16);
            }
        };
        lo_hi16(0x0C, 0x2C, self.free_blocks);
        lo_hi16(0x0E, 0x2E, self.free_inodes);
        lo_hi16(0x10, 0x30, self.used_dirs);
        lo_hi16(0x18, 0x38, self.block_bitmap_csum);
        lo_hi16(0x1A, 0x3A, self.inode_bitmap_csum);
        lo_hi16(0x1C, 0x32, self.itable_unused);
        put_u16(raw, 0x12, self.flags);
    }
}

/// The `metadata_csum` checksum of descriptor `group`, computed over `raw`
/// with its checksum field read as zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn checksum(raw: &[u8], group: u32, seed: u32) -> u16 {
    let crc = crc32c(seed, &group.to_le_bytes());
    let crc = crc32c(crc, &raw[..CHECKSUM_OFFSET.min(raw.len())]);
    let crc = crc32c(crc, &[0, 0]);
    let crc = crc32c(crc, raw.get(CHECKSUM_OFFSET + 2..).unwrap_or(&[]));
    crc as u16
}

/// Store [`checksum`] into `raw`.
pub fn seal(raw: &mut [u8], group: u32, seed: u32) {
    let sum = checksum(raw, group, seed);
    put_u16(raw, CHECKSUM_OFFSET, sum);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_halves_only_count_for_wide_descriptors() {
        let mut raw = [0u8; 64];
        raw[0x08..0x0C].copy_from_slice(&5u32.to_le_bytes());
        raw[0x28..0x2C].copy_from_slice(&1u32.to_le_bytes());
        raw[0x0E..0x10].copy_from_slice(&7u16.to_le_bytes());
        assert_eq!(GroupDescriptor::parse(&raw, 32).inode_table, 5);
        let wide = GroupDescriptor::parse(&raw, 64);
        assert_eq!(wide.inode_table, (1 << 32) | 5);
        assert_eq!(wide.free_inodes, 7);
    }

    #[test]
    fn narrow_store_keeps_the_high_halves_out() {
        let mut desc = GroupDescriptor::parse(&[0u8; 32], 32);
        desc.free_blocks = 0x1_0005;
        desc.block_bitmap_csum = 0xBEEF_CAFE;
        desc.flags = BLOCK_UNINIT;

        let mut narrow = [0u8; 64];
        desc.store(&mut narrow, 32);
        assert_eq!(narrow[32..], [0u8; 32]);
        let back = GroupDescriptor::parse(&narrow, 32);
        assert_eq!(
            (back.free_blocks, back.block_bitmap_csum, back.flags),
            (5, 0xCAFE, BLOCK_UNINIT)
        );

        let mut wide = [0u8; 64];
        desc.store(&mut wide, 64);
        let back = GroupDescriptor::parse(&wide, 64);
        assert_eq!((back.free_blocks, back.block_bitmap_csum), (0x1_0005, 0xBEEF_CAFE));
    }

    #[test]
    fn checksum_ignores_its_own_field() {
        let mut raw = [0x42u8; 32];
        let before = checksum(&raw, 3, 0x1234);
        seal(&mut raw, 3, 0x1234);
        assert_eq!(u16_at(&raw, CHECKSUM_OFFSET), before);
        assert_eq!(checksum(&raw, 3, 0x1234), before);
        assert_ne!(checksum(&raw, 4, 0x1234), before);
    }
}

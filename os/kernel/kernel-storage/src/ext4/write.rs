//! # Metadata writes
//!
//! Every bitmap change is followed by the group descriptor and then the
//! superblock that count it, each sealed with a fresh checksum when the
//! volume has `metadata_csum`. There is no journal, so a failure between
//! those writes leaves the counts behind the bitmaps.
//!
//! Groups still flagged `INODE_UNINIT` or `BLOCK_UNINIT` are skipped rather
//! than initialized.

use super::checksum::crc32c;
use super::group::{self, BLOCK_UNINIT, INODE_UNINIT};
use super::inode;
use super::superblock::{RO_COMPAT_BIGALLOC, RO_COMPAT_GDT_CSUM, SUPERBLOCK_OFFSET};
use super::{Ext4Volume, FsNode, GroupDescriptor, Inode, NodeKind};
use crate::block::BlockDevice;
use crate::error::{Result, StorageError};
use crate::staging::write_span;
use alloc::vec;
use alloc::vec::Vec;
use kernel_alloc::MemoryServices;
use log::{debug, warn};

impl<D: BlockDevice> Ext4Volume<D> {
    /// Write `data`, at most one block, to the start of filesystem block
    /// `block`. The rest of the block is kept.
    ///
    /// # Errors
    /// `Corrupt` past the end of the volume or the block, otherwise device
    /// and memory errors.
    pub fn write_block<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        block: u64,
        data: &[u8],
    ) -> Result<()> {
        self.write_in_block(services, block, 0, data)
    }

    fn write_in_block<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        block: u64,
        within: u64,
        data: &[u8],
    ) -> Result<()> {
        if block >= self.superblock.blocks_count {
            return Err(StorageError::Corrupt("block beyond the volume"));
        }
        let block_size = self.block_size();
        if within + data.len() as u64 > block_size {
            return Err(StorageError::Corrupt("write past the block"));
        }
        write_span(&mut self.device, services, block * block_size + within, data)
    }

    /// Metadata this driver can keep consistent: no clusters, and either
    /// full `metadata_csum` or no group checksums at all.
    fn check_writable(&self) -> Result<()> {
        let ro_compat = self.superblock.feature_ro_compat;
        if ro_compat & RO_COMPAT_BIGALLOC != 0 {
            return Err(StorageError::UnsupportedFeature("bigalloc"));
        }
        if ro_compat & RO_COMPAT_GDT_CSUM != 0 && !self.superblock.has_metadata_csum() {
            return Err(StorageError::UnsupportedFeature("crc16 group checksums"));
        }
        Ok(())
    }

    fn read_bitmap<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        block: u64,
    ) -> Result<Vec<u8>> {
        let mut bitmap = vec![0u8; usize::try_from(self.block_size()).unwrap_or(0)];
        self.read_block(services, block, &mut bitmap)?;
        Ok(bitmap)
    }

    /// The block bitmap of `group`, one filesystem block. Bit `n` of byte
    /// `n / 8`, least significant first, is block
    /// `first_data_block + group * blocks_per_group + n`.
    ///
    /// # Errors
    /// `NotFound` for a group the volume does not have.
    pub fn read_block_bitmap<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        group: u32,
    ) -> Result<Vec<u8>> {
        let desc = self.read_group_descriptor(services, group)?;
        self.read_bitmap(services, desc.block_bitmap)
    }

    /// The inode bitmap of `group`; bit `n` is inode
    /// `group * inodes_per_group + n + 1`.
    ///
    /// # Errors
    /// `NotFound` for a group the volume does not have.
    pub fn read_inode_bitmap<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        group: u32,
    ) -> Result<Vec<u8>> {
        let desc = self.read_group_descriptor(services, group)?;
        self.read_bitmap(services, desc.inode_bitmap)
    }

    /// Store the block bitmap of `group` and its checksum. Free counts are
    /// the caller's business.
    ///
    /// # Errors
    /// `UnsupportedFeature` for volumes this driver does not write, `NotFound`
    /// for a group the volume does not have.
    pub fn write_block_bitmap<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        group: u32,
        bitmap: &[u8],
    ) -> Result<()> {
        self.check_writable()?;
        let mut desc = self.read_group_descriptor(services, group)?;
        self.write_block(services, desc.block_bitmap, bitmap)?;
        self.update_block_bitmap_checksum(&mut desc, bitmap);
        self.update_group_descriptor(services, group, &desc)
    }

    /// Store the inode bitmap of `group` and its checksum.
    ///
    /// # Errors
    /// As [`write_block_bitmap`](Self::write_block_bitmap).
    pub fn write_inode_bitmap<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        group: u32,
        bitmap: &[u8],
    ) -> Result<()> {
        self.check_writable()?;
        let mut desc = self.read_group_descriptor(services, group)?;
        self.write_block(services, desc.inode_bitmap, bitmap)?;
        self.update_inode_bitmap_checksum(&mut desc, bitmap);
        self.update_group_descriptor(services, group, &desc)
    }

    /// Recompute `desc.block_bitmap_csum` over the first
    /// `blocks_per_group / 8` bytes of `bitmap`. Nothing changes without
    /// `metadata_csum`.
    pub fn update_block_bitmap_checksum(&self, desc: &mut GroupDescriptor, bitmap: &[u8]) {
        if let Some(sum) = self.bitmap_checksum(bitmap, self.superblock.blocks_per_group) {
            desc.block_bitmap_csum = sum;
        }
    }

    /// As [`update_block_bitmap_checksum`](Self::update_block_bitmap_checksum),
    /// over `inodes_per_group / 8` bytes.
    pub fn update_inode_bitmap_checksum(&self, desc: &mut GroupDescriptor, bitmap: &[u8]) {
        if let Some(sum) = self.bitmap_checksum(bitmap, self.superblock.inodes_per_group) {
            desc.inode_bitmap_csum = sum;
        }
    }

    fn bitmap_checksum(&self, bitmap: &[u8], bits: u32) -> Option<u32> {
        if !self.superblock.has_metadata_csum() {
            return None;
        }
        let len = usize::try_from(bits / 8).unwrap_or(usize::MAX).min(bitmap.len());
        Some(crc32c(self.superblock.checksum_seed(), &bitmap[..len]))
    }

    /// Write `desc` over descriptor `group`, keeping the bytes it does not
    /// model, and seal it.
    ///
    /// # Errors
    /// `UnsupportedFeature` for volumes this driver does not write, `NotFound`
    /// for a group the volume does not have.
    pub fn update_group_descriptor<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        group: u32,
        desc: &GroupDescriptor,
    ) -> Result<()> {
        self.check_writable()?;
        let (block, within) = self.descriptor_location(group)?;
        let desc_size = self.superblock.descriptor_size();
        let mut raw = vec![0u8; usize::from(desc_size)];
        self.read_in_block(services, block, within, &mut raw)?;
        desc.store(&mut raw, desc_size);
        if self.superblock.has_metadata_csum() {
            group::seal(&mut raw, group, self.superblock.checksum_seed());
        }
        self.write_in_block(services, block, within, &raw)
    }

    /// Write the free counts held in [`superblock`](Self::superblock) back to
    /// disk, with a fresh checksum.
    ///
    /// # Errors
    /// `UnsupportedFeature` for volumes this driver does not write, otherwise
    /// device and memory errors.
    pub fn update_superblock<S: MemoryServices + ?Sized>(&mut self, services: &mut S) -> Result<()> {
        self.check_writable()?;
        self.superblock.store(&mut self.superblock_raw);
        write_span(&mut self.device, services, SUPERBLOCK_OFFSET, &self.superblock_raw)
    }

    /// Write `inode` over inode `number`, keeping the on-disk bytes it does
    /// not model, and seal it.
    ///
    /// # Errors
    /// `UnsupportedFeature` for volumes this driver does not write, `NotFound`
    /// for inode 0 or one past `inodes_count`.
    pub fn write_inode<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        number: u32,
        inode: &Inode,
    ) -> Result<()> {
        self.check_writable()?;
        let (block, within) = self.inode_location(services, number)?;
        let mut raw = vec![0u8; usize::from(self.superblock.inode_size())];
        self.read_in_block(services, block, within, &mut raw)?;
        inode.store(&mut raw);
        if self.superblock.has_metadata_csum() {
            inode::seal(&mut raw, number, self.superblock.checksum_seed());
        }
        self.write_in_block(services, block, within, &raw)
    }

    /// Take the lowest free, non-reserved inode, searching from `parent`'s
    /// group onward. A directory also counts toward its group's `used_dirs`.
    ///
    /// The inode itself is left as found; fill it in with
    /// [`write_inode`](Self::write_inode).
    ///
    /// # Errors
    /// `NoSpace` when no group has a free inode, otherwise as
    /// [`update_group_descriptor`](Self::update_group_descriptor).
    pub fn allocate_inode<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        parent: &FsNode,
        kind: NodeKind,
    ) -> Result<u32> {
        self.check_writable()?;
        if self.superblock.free_inodes_count == 0 {
            return Err(StorageError::NoSpace);
        }
        let ipg = self.superblock.inodes_per_group;
        let groups = self.superblock.group_count();
        let start = parent.node_id.saturating_sub(1) / ipg;

        for n in 0..groups {
            let group = (start + n) % groups;
            let mut desc = self.read_group_descriptor(services, group)?;
            if desc.free_inodes == 0 || desc.flags & INODE_UNINIT != 0 {
                continue;
            }
            let mut bitmap = self.read_bitmap(services, desc.inode_bitmap)?;
            let first = group * ipg + 1;
            let reserved = self.superblock.first_ino().saturating_sub(first);
            let Some(index) = first_clear(&bitmap, reserved as usize, ipg as usize) else {
                warn!("ext4: group {group} counts free inodes its bitmap does not have");
                continue;
            };
            set_bit(&mut bitmap, index);
            let index = u32::try_from(index).map_err(|_| StorageError::Corrupt("inode bitmap"))?;

            self.write_block(services, desc.inode_bitmap, &bitmap)?;
            self.update_inode_bitmap_checksum(&mut desc, &bitmap);
            desc.free_inodes -= 1;
            if kind == NodeKind::Directory {
                desc.used_dirs += 1;
            }
            desc.itable_unused = desc.itable_unused.min(ipg - index - 1);
            self.update_group_descriptor(services, group, &desc)?;

            self.superblock.free_inodes_count -= 1;
            self.update_superblock(services)?;
            let number = first + index;
            debug!("ext4: allocated inode {number} in group {group}");
            return Ok(number);
        }
        Err(StorageError::NoSpace)
    }

    /// Take one free block, preferring the group of `near`'s inode.
    ///
    /// # Errors
    /// As [`allocate_blocks`](Self::allocate_blocks).
    pub fn allocate_block<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        near: &FsNode,
    ) -> Result<u64> {
        let blocks = self.allocate_blocks(services, near, 1)?;
        blocks.first().copied().ok_or(StorageError::NoSpace)
    }

    /// Take `count` free blocks, lowest first within each group, starting at
    /// the group of `near`'s inode. Each touched group's bitmap and
    /// descriptor are written once, then the superblock.
    ///
    /// # Errors
    /// `NoSpace` if the superblock counts fewer free blocks, `Corrupt` if the
    /// bitmaps hold fewer than the counts promised.
    pub fn allocate_blocks<S: MemoryServices + ?Sized>(
        &mut self,
        services: &mut S,
        near: &FsNode,
        count: u32,
    ) -> Result<Vec<u64>> {
        self.check_writable()?;
        if u64::from(count) > self.superblock.free_blocks_count {
            return Err(StorageError::NoSpace);
        }
        let wanted = count as usize;
        let bpg = u64::from(self.superblock.blocks_per_group);
        let groups = self.superblock.group_count();
        let start = near.node_id.saturating_sub(1) / self.superblock.inodes_per_group;

        let mut taken = Vec::with_capacity(wanted);
        for n in 0..groups {
            if taken.len() == wanted {
                break;
            }
            let group = (start + n) % groups;
            let mut desc = self.read_group_descriptor(services, group)?;
            if desc.free_blocks == 0 || desc.flags & BLOCK_UNINIT != 0 {
                continue;
            }
            let mut bitmap = self.read_bitmap(services, desc.block_bitmap)?;
            let group_first = u64::from(self.superblock.first_data_block) + u64::from(group) * bpg;
            let bits = self.superblock.blocks_count.saturating_sub(group_first).min(bpg);
            let bits = usize::try_from(bits).unwrap_or(usize::MAX);

            let mut got = 0u32;
            let mut from = 0;
            while taken.len() < wanted {
                let Some(index) = first_clear(&bitmap, from, bits) else {
                    break;
                };
                set_bit(&mut bitmap, index);
                taken.push(group_first + index as u64);
                got += 1;
                from = index + 1;
            }
            if got == 0 {
                continue;
            }

            self.write_block(services, desc.block_bitmap, &bitmap)?;
            self.update_block_bitmap_checksum(&mut desc, &bitmap);
            desc.free_blocks = desc.free_blocks.saturating_sub(got);
            self.update_group_descriptor(services, group, &desc)?;
            self.superblock.free_blocks_count -= u64::from(got);
        }

        self.update_superblock(services)?;
        if taken.len() < wanted {
            return Err(StorageError::Corrupt("free block counts"));
        }
        debug!("ext4: allocated {count} blocks near inode {}", near.node_id);
        Ok(taken)
    }
}

/// First clear bit in `from..limit`, least significant bit of each byte
/// first.
fn first_clear(bitmap: &[u8], from: usize, limit: usize) -> Option<usize> {
    let limit = limit.min(bitmap.len() * 8);
    (from..limit).find(|&n| bitmap[n / 8] & (1 << (n % 8)) == 0)
}

fn set_bit(bitmap: &mut [u8], index: usize) {
    bitmap[index / 8] |= 1 << (index % 8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_least_significant_first() {
        let mut bitmap = [0b0000_0111u8, 0xFF, 0b1111_1110];
        assert_eq!(first_clear(&bitmap, 0, 24), Some(3));
        assert_eq!(first_clear(&bitmap, 8, 24), Some(16));
        assert_eq!(first_clear(&bitmap, 8, 16), None);
        assert_eq!(first_clear(&bitmap, 0, 100), Some(3));

        set_bit(&mut bitmap, 3);
        set_bit(&mut bitmap, 16);
        assert_eq!(bitmap, [0b0000_1111, 0xFF, 0xFF]);
        assert_eq!(first_clear(&bitmap, 0, 24), Some(4));
    }
}

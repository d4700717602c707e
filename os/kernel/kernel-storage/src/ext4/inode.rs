//! On-disk inodes.

use super::checksum::crc32c;
use crate::bytes::{bytes_at, put_bytes, put_u16, put_u32, u16_at, u32_at};

pub const ROOT_INODE: u32 = 2;

/// `i_flags`: `i_block` holds an extent tree.
pub const EXTENTS_FL: u32 = 0x8_0000;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const S_IFREG: u16 = 0x8000;
const S_IFLNK: u16 = 0xA000;

const CHECKSUM_LO: usize = 0x7C;
const EXTRA_ISIZE: usize = 0x80;
const CHECKSUM_HI: usize = 0x82;
/// Smallest on-disk inode.
const BASE_SIZE: usize = 0x80;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
    /// Devices, FIFOs and sockets, by their `S_IFMT` bits.
    Other(u16),
}

impl NodeKind {
    #[must_use]
    pub const fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFREG => Self::File,
            S_IFLNK => Self::Symlink,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Inode {
    pub mode: u16,
    pub uid: u32,
    pub size: u64,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub gid: u32,
    pub links_count: u16,
    /// `i_blocks_lo`, in 512-byte units.
    pub blocks: u32,
    pub flags: u32,
    /// `i_block`: the extent tree root, or a block map on older files.
    pub block: [u8; 60],
}

impl Inode {
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        Self {
            mode: u16_at(raw, 0x00),
            uid: u32::from(u16_at(raw, 0x02)) | (u32::from(u16_at(raw, 0x78)) << 16),
            size: u64::from(u32_at(raw, 0x04)) | (u64::from(u32_at(raw, 0x6C)) << 32),
            atime: u32_at(raw, 0x08),
            ctime: u32_at(raw, 0x0C),
            mtime: u32_at(raw, 0x10),
            gid: u32::from(u16_at(raw, 0x18)) | (u32::from(u16_at(raw, 0x7A)) << 16),
            links_count: u16_at(raw, 0x1A),
            blocks: u32_at(raw, 0x1C),
            flags: u32_at(raw, 0x20),
            block: bytes_at(raw, 0x28),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        NodeKind::from_mode(self.mode)
    }

    /// The nine `rwx` bits.
    #[must_use]
    pub const fn permissions(&self) -> u16 {
        self.mode & 0o777
    }

    #[must_use]
    pub const fn uses_extents(&self) -> bool {
        self.flags & EXTENTS_FL != 0
    }

    /// Write the fields back into `raw`, the inode as read from disk. Bytes
    /// this type does not model are left alone.
    #[allow(clippy::cast_possible_truncation)]
    pub fn store(&self, raw: &mut [u8]) {
        put_u16(raw, 0x00, self.mode);
        put_u16(raw, 0x02, self.uid as u16);
        put_u16(raw, 0x78, (self.uid >> 16) as u16);
        put_u32(raw, 0x04, self.size as u32);
        put_u32(raw, 0x6C, (self.size >> 32) as u32);
        put_u32(raw, 0x08, self.atime);
        put_u32(raw, 0x0C, self.ctime);
        put_u32(raw, 0x10, self.mtime);
        put_u16(raw, 0x18, self.gid as u16);
        put_u16(raw, 0x7A, (self.gid >> 16) as u16);
        put_u16(raw, 0x1A, self.links_count);
        put_u32(raw, 0x1C, self.blocks);
        put_u32(raw, 0x20, self.flags);
        put_bytes(raw, 0x28, &self.block);
    }
}

/// Whether `raw` is large enough to carry `i_checksum_hi`.
fn has_checksum_hi(raw: &[u8]) -> bool {
    raw.len() > BASE_SIZE && usize::from(u16_at(raw, EXTRA_ISIZE)) >= CHECKSUM_HI + 2 - BASE_SIZE
}

/// The `metadata_csum` checksum of inode `number`, over `raw` with both
/// checksum fields read as zero and seeded with the inode number and
/// generation.
#[must_use]
pub fn checksum(raw: &[u8], number: u32, seed: u32) -> u32 {
    let generation = u32_at(raw, 0x64);
    let crc = crc32c(seed, &number.to_le_bytes());
    let crc = crc32c(crc, &generation.to_le_bytes());

    let mut zeroed = raw.to_vec();
    put_u16(&mut zeroed, CHECKSUM_LO, 0);
    if has_checksum_hi(raw) {
        put_u16(&mut zeroed, CHECKSUM_HI, 0);
    }
    let sum = crc32c(crc, &zeroed);
    if has_checksum_hi(raw) { sum } else { sum & 0xFFFF }
}

/// Store [`checksum`] into `raw`.
#[allow(clippy::cast_possible_truncation)]
pub fn seal(raw: &mut [u8], number: u32, seed: u32) {
    let sum = checksum(raw, number, seed);
    put_u16(raw, CHECKSUM_LO, sum as u16);
    if has_checksum_hi(raw) {
        put_u16(raw, CHECKSUM_HI, (sum >> 16) as u16);
    }
}

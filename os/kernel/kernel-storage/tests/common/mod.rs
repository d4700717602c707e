//! Simulated RAM, a kernel memory context over it, and disk image builders.

#![allow(dead_code)]

use kernel_alloc::KernelMemory;
use kernel_alloc::sim::{SimulatedRam, encode_memory_map};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_storage::staging::with_staging;
use uefi::mem::memory_map::MemoryType;

pub const RAM: u64 = 0x20_0000;
pub const RAM_PAGES: u64 = 256;

pub const SECTOR: usize = 512;
pub const BLOCK: usize = 1024;

pub fn ram() -> SimulatedRam {
    SimulatedRam::with_pattern(PhysicalAddress::new(RAM), RAM_PAGES as usize, 0x5A)
}

pub fn map_bytes() -> Vec<u8> {
    encode_memory_map(&[(MemoryType::CONVENTIONAL, RAM, RAM_PAGES)])
}

pub fn memory<'r>(ram: &'r SimulatedRam, raw: &[u8]) -> KernelMemory<&'r SimulatedRam> {
    let mut memory = KernelMemory::new(ram, &SimulatedRam::memory_map(raw)).unwrap();
    memory.init_heap().unwrap();
    memory
}

/// Free memory once a first staging page has been mapped, so the page
/// tables over the offset window already exist.
pub fn settled_free(memory: &mut KernelMemory<&SimulatedRam>) -> u64 {
    with_staging(memory, |_, _| Ok(())).unwrap();
    memory.pfa().free_memory()
}

pub fn page(n: u64) -> PhysicalAddress {
    PhysicalAddress::new(RAM + n * PAGE_SIZE)
}

fn put(img: &mut [u8], at: usize, bytes: &[u8]) {
    img[at..at + bytes.len()].copy_from_slice(bytes);
}

fn put_u16(img: &mut [u8], at: usize, v: u16) {
    put(img, at, &v.to_le_bytes());
}

fn put_u32(img: &mut [u8], at: usize, v: u32) {
    put(img, at, &v.to_le_bytes());
}

fn put_u64(img: &mut [u8], at: usize, v: u64) {
    put(img, at, &v.to_le_bytes());
}

/// `(first_lba, last_lba, name)` of each partition.
pub type PartitionSpec<'a> = (u64, u64, &'a str);

/// A disk of `sectors` sectors with a protective MBR, a GPT header at LBA 1
/// and 128 entries starting at `entry_lba`.
pub fn gpt_disk(sectors: u64, entry_lba: u64, partitions: &[PartitionSpec<'_>]) -> Vec<u8> {
    let mut img = vec![0u8; sectors as usize * SECTOR];

    let record = 446;
    img[record + 4] = 0xEE;
    put_u32(&mut img, record + 8, 1);
    put_u32(&mut img, record + 12, (sectors - 1) as u32);
    put(&mut img, 510, &[0x55, 0xAA]);

    let h = SECTOR;
    put(&mut img, h, b"EFI PART");
    put_u32(&mut img, h + 8, 0x0001_0000);
    put_u32(&mut img, h + 12, 92);
    put_u64(&mut img, h + 24, 1);
    put_u64(&mut img, h + 32, sectors - 1);
    put_u64(&mut img, h + 40, entry_lba + 32);
    put_u64(&mut img, h + 48, sectors - 34);
    put(&mut img, h + 56, &[0x11; 16]);
    put_u64(&mut img, h + 72, entry_lba);
    put_u32(&mut img, h + 80, 128);
    put_u32(&mut img, h + 84, 128);

    for (n, &(first, last, name)) in partitions.iter().enumerate() {
        let e = entry_lba as usize * SECTOR + n * 128;
        // Linux filesystem data.
        put(
            &mut img,
            e,
            &[
                0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47,
                0x7D, 0xE4,
            ],
        );
        put(&mut img, e + 16, &[n as u8 + 1; 16]);
        put_u64(&mut img, e + 32, first);
        put_u64(&mut img, e + 40, last);
        for (i, unit) in name.encode_utf16().enumerate() {
            put_u16(&mut img, e + 56 + 2 * i, unit);
        }
    }
    img
}

/// Place `data` at sector `lba` of `img`.
pub fn place(img: &mut [u8], lba: u64, data: &[u8]) {
    put(img, lba as usize * SECTOR, data);
}

pub const EXT4_FIRST_LBA: u64 = 64;
pub const EXT4_BLOCKS: usize = 256;
pub const EXT4_SECTORS: u64 = (EXT4_BLOCKS * BLOCK / SECTOR) as u64;

pub const BLOCK_BITMAP: usize = 3;
pub const INODE_BITMAP: usize = 4;
pub const INODE_TABLE: usize = 5;
pub const INODES: u32 = 32;
pub const FIRST_INO: u32 = 11;

/// Blocks 1..=12 hold metadata, 20..=28 and 30 hold data.
pub const USED_BLOCKS: [std::ops::RangeInclusive<usize>; 3] = [1..=12, 20..=28, 30..=30];
pub const FREE_BLOCKS: u32 = 233;
pub const FREE_INODES: u32 = 16;

pub const HELLO_INODE: u32 = 12;
pub const DOCS_INODE: u32 = 13;
pub const SPARSE_INODE: u32 = 14;
pub const LEGACY_INODE: u32 = 15;
pub const README_INODE: u32 = 16;

pub const HELLO_LEN: usize = 1500;
pub const README: &[u8] = b"read me first\n";

const EXTENTS_FL: u32 = 0x8_0000;
const DIR_MODE: u16 = 0o40_755;
const FILE_MODE: u16 = 0o100_644;

pub fn hello_bytes() -> Vec<u8> {
    (0..HELLO_LEN).map(|i| (i % 251) as u8).collect()
}

fn leaf(logical: u32, len: u16, physical: u32) -> [u8; 12] {
    let mut e = [0u8; 12];
    put_u32(&mut e, 0, logical);
    put_u16(&mut e, 4, len);
    put_u32(&mut e, 8, physical);
    e
}

fn index(logical: u32, child: u32) -> [u8; 12] {
    let mut e = [0u8; 12];
    put_u32(&mut e, 0, logical);
    put_u32(&mut e, 4, child);
    e
}

fn extent_node(out: &mut [u8], max: u16, depth: u16, entries: &[[u8; 12]]) {
    put_u16(out, 0, 0xF30A);
    put_u16(out, 2, entries.len() as u16);
    put_u16(out, 4, max);
    put_u16(out, 6, depth);
    for (n, e) in entries.iter().enumerate() {
        put(out, 12 * (n + 1), e);
    }
}

fn inode(img: &mut [u8], ino: u32, mode: u16, size: u64, flags: u32, i_block: &[u8; 60]) {
    let at = INODE_TABLE * BLOCK + (ino as usize - 1) * 256;
    put_u16(img, at, mode);
    put_u16(img, at + 2, 1000);
    put_u32(img, at + 4, size as u32);
    put_u32(img, at + 0x08, 1_700_000_000);
    put_u32(img, at + 0x0C, 1_700_000_100);
    put_u32(img, at + 0x10, 1_700_000_200);
    put_u16(img, at + 0x18, 100);
    put_u16(img, at + 0x1A, 1);
    put_u32(img, at + 0x1C, (size.div_ceil(BLOCK as u64) * 2) as u32);
    put_u32(img, at + 0x20, flags);
    put(img, at + 0x28, i_block);
}

fn extent_inode(img: &mut [u8], ino: u32, mode: u16, size: u64, depth: u16, entries: &[[u8; 12]]) {
    let mut i_block = [0u8; 60];
    extent_node(&mut i_block, 4, depth, entries);
    inode(img, ino, mode, size, EXTENTS_FL, &i_block);
}

fn dir_block(img: &mut [u8], block: usize, entries: &[(u32, u8, &str)]) {
    let base = block * BLOCK;
    let mut at = 0;
    for (n, &(ino, ty, name)) in entries.iter().enumerate() {
        let rec_len = if n + 1 == entries.len() {
            BLOCK - at
        } else {
            (8 + name.len()).next_multiple_of(4)
        };
        put_u32(img, base + at, ino);
        put_u16(img, base + at + 4, rec_len as u16);
        img[base + at + 6] = name.len() as u8;
        img[base + at + 7] = ty;
        put(img, base + at + 8, name.as_bytes());
        at += rec_len;
    }
}

/// A 256 KiB ext4 volume with 1 KiB blocks, one group and consistent
/// bitmaps and free counts:
///
/// ```text
/// /hello.txt        1500 bytes over blocks 21..23
/// /docs/readme.md   one block
/// /sparse.bin       depth-1 tree: data, hole, data, uninitialized
/// /legacy           block-mapped, unreadable here
/// ```
pub fn ext4_image() -> Vec<u8> {
    let mut img = vec![0u8; EXT4_BLOCKS * BLOCK];

    let sb = 1024;
    put_u32(&mut img, sb, INODES);
    put_u32(&mut img, sb + 4, EXT4_BLOCKS as u32);
    put_u32(&mut img, sb + 12, FREE_BLOCKS);
    put_u32(&mut img, sb + 16, FREE_INODES);
    put_u32(&mut img, sb + 20, 1);
    put_u32(&mut img, sb + 24, 0);
    put_u32(&mut img, sb + 32, 8192);
    put_u32(&mut img, sb + 40, INODES);
    put_u16(&mut img, sb + 56, 0xEF53);
    put_u32(&mut img, sb + 76, 1);
    put_u32(&mut img, sb + 84, FIRST_INO);
    put_u16(&mut img, sb + 88, 256);
    put_u32(&mut img, sb + 96, 0x0002 | 0x0040);
    put(&mut img, sb + 120, b"testvol");

    let gd = 2 * BLOCK;
    put_u32(&mut img, gd, BLOCK_BITMAP as u32);
    put_u32(&mut img, gd + 4, INODE_BITMAP as u32);
    put_u32(&mut img, gd + 8, INODE_TABLE as u32);
    put_u16(&mut img, gd + 0x0C, FREE_BLOCKS as u16);
    put_u16(&mut img, gd + 0x0E, FREE_INODES as u16);
    put_u16(&mut img, gd + 0x10, 2);

    // Bit n is block n + 1; bits past the last block are padding and set.
    let blocks = &mut img[BLOCK_BITMAP * BLOCK..(BLOCK_BITMAP + 1) * BLOCK];
    for block in USED_BLOCKS.into_iter().flatten().chain(EXT4_BLOCKS..=BLOCK * 8) {
        blocks[(block - 1) / 8] |= 1 << ((block - 1) % 8);
    }
    // Inodes 1..=16 are taken; bits past INODES are padding.
    let inodes = &mut img[INODE_BITMAP * BLOCK..(INODE_BITMAP + 1) * BLOCK];
    inodes[..2].fill(0xFF);
    inodes[INODES as usize / 8..].fill(0xFF);

    extent_inode(&mut img, 2, DIR_MODE, BLOCK as u64, 0, &[leaf(0, 1, 20)]);
    dir_block(
        &mut img,
        20,
        &[
            (2, 2, "."),
            (2, 2, ".."),
            (HELLO_INODE, 1, "hello.txt"),
            (DOCS_INODE, 2, "docs"),
            (SPARSE_INODE, 1, "sparse.bin"),
            (LEGACY_INODE, 1, "legacy"),
        ],
    );

    extent_inode(&mut img, HELLO_INODE, FILE_MODE, HELLO_LEN as u64, 0, &[leaf(0, 2, 21)]);
    put(&mut img, 21 * BLOCK, &hello_bytes());

    extent_inode(&mut img, DOCS_INODE, DIR_MODE, BLOCK as u64, 0, &[leaf(0, 1, 23)]);
    dir_block(
        &mut img,
        23,
        &[(DOCS_INODE, 2, "."), (2, 2, ".."), (README_INODE, 1, "readme.md")],
    );
    extent_inode(&mut img, README_INODE, 0o100_600, README.len() as u64, 0, &[leaf(0, 1, 24)]);
    put(&mut img, 24 * BLOCK, README);

    extent_inode(&mut img, SPARSE_INODE, FILE_MODE, 4 * BLOCK as u64, 1, &[index(0, 25)]);
    let mut uninit = leaf(3, 1, 28);
    put_u16(&mut uninit, 4, 32768 + 1);
    extent_node(
        &mut img[25 * BLOCK..26 * BLOCK],
        84,
        0,
        &[leaf(0, 1, 26), leaf(2, 1, 27), uninit],
    );
    img[26 * BLOCK..27 * BLOCK].fill(0x11);
    img[27 * BLOCK..28 * BLOCK].fill(0x33);
    img[28 * BLOCK..29 * BLOCK].fill(0x44);

    let mut block_map = [0u8; 60];
    put_u32(&mut block_map, 0, 30);
    inode(&mut img, LEGACY_INODE, FILE_MODE, 10, 0, &block_map);
    put(&mut img, 30 * BLOCK, b"old style\n");

    img
}

/// GPT disk with the ext4 volume in partition 0 and a patterned partition 1.
pub fn disk_image() -> Vec<u8> {
    let ext4_last = EXT4_FIRST_LBA + EXT4_SECTORS - 1;
    let data_first = ext4_last + 1;
    let mut img = gpt_disk(
        data_first + 16 + 34,
        2,
        &[(EXT4_FIRST_LBA, ext4_last, "root"), (data_first, data_first + 15, "data")],
    );
    place(&mut img, EXT4_FIRST_LBA, &ext4_image());
    for s in 0..16 {
        place(&mut img, data_first + s, &[s as u8 + 0xA0; SECTOR]);
    }
    img
}

pub const DATA_FIRST_LBA: u64 = EXT4_FIRST_LBA + EXT4_SECTORS;

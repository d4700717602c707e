//! Linear directory blocks.
//!
//! Hashed directories keep their tree inside the `..` record of the first
//! block, so a linear walk sees every entry of those too.

use crate::bytes::{u16_at, u32_at};
use crate::error::{Result, StorageError};
use alloc::string::String;
use alloc::vec::Vec;

const HEADER: usize = 8;

/// `file_type` of the checksum tail that ends a block.
const TAIL_FILE_TYPE: u8 = 0xDE;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
    /// Zero unless the volume has the `filetype` feature.
    pub file_type: u8,
}

/// Append the live entries of `block` to `out`, skipping `.`, `..`, empty
/// slots and the checksum tail.
///
/// # Errors
/// `Corrupt` if a record length is short or runs past the block.
pub fn parse_block(block: &[u8], has_file_type: bool, out: &mut Vec<DirEntry>) -> Result<()> {
    let mut at = 0usize;
    while at + HEADER <= block.len() {
        let inode = u32_at(block, at);
        let rec_len = usize::from(u16_at(block, at + 4));
        let (name_len, file_type) = if has_file_type {
            (usize::from(block[at + 6]), block[at + 7])
        } else {
            (usize::from(u16_at(block, at + 6)), 0)
        };
        if rec_len < HEADER || at + rec_len > block.len() || HEADER + name_len > rec_len {
            return Err(StorageError::Corrupt("directory record length"));
        }

        let name = &block[at + HEADER..at + HEADER + name_len];
        let skip = inode == 0
            || (has_file_type && file_type == TAIL_FILE_TYPE)
            || name == b"."
            || name == b"..";
        if !skip {
            out.push(DirEntry {
                inode,
                name: String::from_utf8_lossy(name).into_owned(),
                file_type,
            });
        }
        at += rec_len;
    }
    Ok(())
}

//! Extent tree nodes.
//!
//! ```text
//! header (12 B)  magic 0xF30A, entries, max, depth, generation
//! depth == 0     leaves:  logical block, length, physical start
//! depth  > 0     indexes: logical block, child node block
//! ```

use crate::bytes::{u16_at, u32_at};
use crate::error::{Result, StorageError};
use alloc::vec::Vec;

pub const EXTENT_MAGIC: u16 = 0xF30A;

/// Deeper trees are treated as corrupt.
pub const MAX_DEPTH: u16 = 5;

const ENTRY_SIZE: usize = 12;

/// Lengths above this mark an uninitialized extent.
const INIT_MAX_LEN: u16 = 32768;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ExtentHeader {
    pub entries: u16,
    pub max: u16,
    pub depth: u16,
}

/// A run of `len` blocks starting at file block `logical`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Extent {
    pub logical: u32,
    pub len: u16,
    pub physical: u64,
    /// Allocated but never written; reads as zeros.
    pub uninitialized: bool,
}

impl Extent {
    /// The physical block backing file block `logical`, if this extent covers it.
    #[must_use]
    pub const fn physical_of(&self, logical: u64) -> Option<u64> {
        let first = self.logical as u64;
        if logical >= first && logical < first + self.len as u64 {
            Some(self.physical + (logical - first))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ExtentIndex {
    pub logical: u32,
    pub child: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ExtentNode {
    Leaf(Vec<Extent>),
    Index(Vec<ExtentIndex>),
}

/// Parse the node in `raw`: the 60-byte `i_block` or a whole tree block.
///
/// # Errors
/// `Corrupt` for a bad magic, depth or entry count.
pub fn parse_node(raw: &[u8]) -> Result<(ExtentHeader, ExtentNode)> {
    if u16_at(raw, 0) != EXTENT_MAGIC {
        return Err(StorageError::Corrupt("extent header magic"));
    }
    let header = ExtentHeader {
        entries: u16_at(raw, 2),
        max: u16_at(raw, 4),
        depth: u16_at(raw, 6),
    };
    if header.depth > MAX_DEPTH {
        return Err(StorageError::Corrupt("extent tree too deep"));
    }
    let entries = usize::from(header.entries);
    if header.entries > header.max || ENTRY_SIZE * (entries + 1) > raw.len() {
        return Err(StorageError::Corrupt("extent entry count"));
    }

    let entry = |n: usize| &raw[ENTRY_SIZE * (n + 1)..ENTRY_SIZE * (n + 2)];
    let node = if header.depth == 0 {
        ExtentNode::Leaf(
            (0..entries)
                .map(|n| {
                    let e = entry(n);
                    let raw_len = u16_at(e, 4);
                    let (len, uninitialized) = if raw_len > INIT_MAX_LEN {
                        (raw_len - INIT_MAX_LEN, true)
                    } else {
                        (raw_len, false)
                    };
                    Extent {
                        logical: u32_at(e, 0),
                        len,
                        physical: (u64::from(u16_at(e, 6)) << 32) | u64::from(u32_at(e, 8)),
                        uninitialized,
                    }
                })
                .collect(),
        )
    } else {
        ExtentNode::Index(
            (0..entries)
                .map(|n| {
                    let e = entry(n);
                    ExtentIndex {
                        logical: u32_at(e, 0),
                        child: u64::from(u32_at(e, 4)) | (u64::from(u16_at(e, 8)) << 32),
                    }
                })
                .collect(),
        )
    };
    Ok((header, node))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(depth: u16, entries: &[[u8; 12]]) -> [u8; 60] {
        let mut raw = [0u8; 60];
        raw[0..2].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        raw[2..4].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        raw[4..6].copy_from_slice(&4u16.to_le_bytes());
        raw[6..8].copy_from_slice(&depth.to_le_bytes());
        for (n, e) in entries.iter().enumerate() {
            raw[12 * (n + 1)..12 * (n + 2)].copy_from_slice(e);
        }
        raw
    }

    fn leaf(logical: u32, len: u16, physical: u32) -> [u8; 12] {
        let mut e = [0u8; 12];
        e[0..4].copy_from_slice(&logical.to_le_bytes());
        e[4..6].copy_from_slice(&len.to_le_bytes());
        e[8..12].copy_from_slice(&physical.to_le_bytes());
        e
    }

    #[test]
    fn leaves_and_uninitialized_runs() {
        let raw = node(0, &[leaf(0, 2, 100), leaf(2, 32768 + 3, 200)]);
        let (header, ExtentNode::Leaf(extents)) = parse_node(&raw).unwrap() else {
            panic!("expected a leaf");
        };
        assert_eq!(header.depth, 0);
        assert_eq!(extents[0].physical_of(1), Some(101));
        assert_eq!(extents[0].physical_of(2), None);
        assert!(extents[1].uninitialized);
        assert_eq!(extents[1].len, 3);
    }

    #[test]
    fn index_nodes_point_at_children() {
        let mut idx = [0u8; 12];
        idx[4..8].copy_from_slice(&77u32.to_le_bytes());
        let (header, node) = parse_node(&node(1, &[idx])).unwrap();
        assert_eq!(header.depth, 1);
        assert_eq!(
            node,
            ExtentNode::Index(alloc::vec![ExtentIndex { logical: 0, child: 77 }])
        );
    }

    #[test]
    fn garbage_is_corrupt() {
        assert!(parse_node(&[0u8; 60]).is_err());
        let mut raw = node(0, &[]);
        raw[2..4].copy_from_slice(&9u16.to_le_bytes());
        assert!(parse_node(&raw).is_err());
        assert!(parse_node(&node(MAX_DEPTH + 1, &[])).is_err());
    }
}

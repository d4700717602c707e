//! # Kernel Storage Stack
//!
//! Block devices and the on-disk formats layered on them. Every driver here is
//! a client of the memory core: it receives `&mut impl MemoryServices` and
//! stages each sector it touches in a PFA page mapped uncached at its
//! offset-mapped address.
//!
//! ```text
//! Ext4Volume ──► Partition ──► AhciPort / RamDisk
//!                 (GPT)          (BlockDevice)
//! ```
//!
//! * [`block`]: the [`BlockDevice`] trait. Buffers are physical addresses, the
//!   way a DMA engine sees them.
//! * [`staging`]: [`StagingPage`], one zeroed, uncached page for sector I/O.
//! * [`ramdisk`]: an in-memory device.
//! * [`gpt`]: protective MBR, GPT header and partition entries.
//! * [`ext4`]: superblock, group descriptors, inodes, extent trees and
//!   directory blocks, plus inode and block allocation. No journal.
//! * [`ahci`]: the AHCI host bus adapter and its SATA ports.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod ahci;
pub mod block;
mod bytes;
pub mod error;
pub mod ext4;
pub mod gpt;
pub mod ramdisk;
pub mod staging;

pub use crate::block::BlockDevice;
pub use crate::error::{Result, StorageError};
pub use crate::ramdisk::RamDisk;
pub use crate::staging::StagingPage;

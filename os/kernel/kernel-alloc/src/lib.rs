//! # Kernel Memory Core
//!
//! Physical page accounting, the kernel heap and the context that ties them
//! to the kernel's page tables.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  KernelMemory  (implements MemoryServices)          │
//! │    drivers and filesystems only ever see this       │
//! └───────┬──────────────────┬──────────────────┬───────┘
//!         │                  │                  │
//! ┌───────▼───────┐  ┌───────▼────────┐  ┌──────▼───────┐
//! │ Heap          │  │ AddressSpace   │  │ Page Frame   │
//! │ first fit,    │─►│ (kernel-vmem)  │─►│ Allocator    │
//! │ split/merge   │  │ 4-level tables │  │ two bitmaps  │
//! └───────────────┘  └────────────────┘  └──────────────┘
//! ```
//!
//! * [`frame_alloc`]: every page between the lowest and highest address of the
//!   firmware [`memory_map`] is free, used or reserved.
//! * [`heap`]: variable-sized blocks at [`HEAP_BASE`], grown one page at a time.
//! * [`kernel_memory`]: the bring-up sequence and the [`MemoryServices`] impl.
//! * [`global`]: the installed singleton and, with the `global-allocator`
//!   feature, the `#[global_allocator]`.
//!
//! Failures are returned as [`MemoryError`]. Only [`fatal`] halts.
//!
//! [`HEAP_BASE`]: kernel_info::memory::HEAP_BASE

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

pub mod bitmap;
pub mod error;
pub mod fatal;
pub mod frame_alloc;
pub mod global;
pub mod heap;
pub mod kernel_memory;
pub mod memory_map;
pub mod phys_mapper;
pub mod services;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::bitmap::{Bitmap, BitmapError};
pub use crate::error::{MemoryError, Result};
pub use crate::frame_alloc::PageFrameAllocator;
pub use crate::heap::{Heap, HeapBlock};
pub use crate::kernel_memory::KernelMemory;
pub use crate::memory_map::MemoryMap;
pub use crate::phys_mapper::OffsetPhysMapper;
pub use crate::services::MemoryServices;

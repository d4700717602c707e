//! # Kernel Configuration and Boot Interface
//!
//! Shared definitions between the loader and the kernel memory core:
//!
//! * [`boot`]: the `#[repr(C)]` handoff structure carrying the firmware memory
//!   map, the framebuffer and the kernel image placement.
//! * [`memory`]: fixed virtual memory layout constants, validated at compile time.
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  identity-mapped low 2 MiB      │
//!                       │  (bootstrap / paging switch)    │
//!                       ├─────────────────────────────────┤
//!                       │         User Space              │
//! LAST_USERSPACE_ADDRESS├─────────────────────────────────┤ 0xffff_0000_0000_0000
//! HEAP_BASE             ├─────────────────────────────────┤ 0xffff_8800_0000_0000
//!                       │   Kernel heap (grows upward)    │
//! DIRECT_MAP_OFFSET     ├─────────────────────────────────┤ 0xffff_ffff_0000_0000
//!                       │  physical + DIRECT_MAP_OFFSET   │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot;
pub mod memory;

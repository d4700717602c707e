//! # QEMU Debug Console Output
//!
//! Early-boot diagnostics for the memory core. Bytes written to I/O port
//! `0x402` show up on the host when QEMU runs with
//! `-debugcon stdio -global isa-debugcon.iobase=0x402`.
//!
//! * [`qemu_trace!`] formats straight to the port without allocating, so it
//!   works before the heap exists.
//! * [`QemuLogger`] routes the `log` facade to the same port.
//!
//! Port I/O is only emitted with the `enabled` feature (default) on bare-metal
//! targets. On hosted targets, such as the test harness, every write is a no-op.
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Debug);
//!
//! LOGGER.install().expect("logger installed twice");
//! log::info!("page frame allocator online");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::{QemuLogger, write_record};

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU `isa-debugcon` port.
    pub const QEMU_DEBUG_PORT: u16 = 0x402;

    #[cfg(all(feature = "enabled", target_os = "none"))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn put_byte(b: u8) {
        // SAFETY: writing to the debug console port has no memory side effects.
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") b,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(all(feature = "enabled", target_os = "none")))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    const fn put_byte(_: u8) {}

    /// Byte-at-a-time sink over the debug port.
    pub struct DebugConsole;

    impl Write for DebugConsole {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            s.bytes().for_each(put_byte);
            Ok(())
        }
    }

    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; the sink itself never fails.
        let _ = DebugConsole.write_fmt(args);
    }
}

/// Format directly to the QEMU debug console.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}

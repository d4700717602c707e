//! Halt policy for unrecoverable memory-core failures.
//!
//! Library functions in this crate return errors. Callers that cannot go on
//! without memory, such as bring-up and the global allocator, end up here.

use crate::error::MemoryError;
use log::error;

/// Log `err` and stop this CPU for good.
///
/// On bare metal this disables interrupts and spins on `hlt`. Hosted builds
/// panic instead, so tests can observe the halt.
#[cold]
pub fn halt_with_diagnostic(err: &MemoryError) -> ! {
    error!("fatal memory error: {err}");
    halt(err)
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
fn halt(_: &MemoryError) -> ! {
    loop {
        // SAFETY: masking interrupts and halting has no memory effects.
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
fn halt(err: &MemoryError) -> ! {
    panic!("halted: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "halted: out of physical memory")]
    fn hosted_halt_panics_with_the_error() {
        halt_with_diagnostic(&MemoryError::OutOfMemory);
    }
}

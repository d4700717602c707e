use crate::qemu_fmt::DebugConsole;
use core::fmt::{self, Write};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend writing `"[LEVEL] target: message"` lines to the debug console.
pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Register this logger with the `log` facade.
    ///
    /// # Errors
    /// Fails if a logger was already installed.
    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

/// Render one record in the console line format.
///
/// # Errors
/// Propagates the writer's error.
pub fn write_record(w: &mut impl Write, record: &Record) -> fmt::Result {
    writeln!(w, "[{}] {}: {}", record.level(), record.target(), record.args())
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = write_record(&mut DebugConsole, record);
        }
    }

    fn flush(&self) {}
}

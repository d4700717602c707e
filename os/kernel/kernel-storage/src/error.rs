use kernel_alloc::MemoryError;

/// Failures of block devices and filesystems.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// The device reported a failed transfer.
    #[error("device I/O failed at LBA {lba}")]
    DeviceIo { lba: u64 },
    #[error("LBA {lba} is beyond the last sector {last}")]
    OutOfRange { lba: u64, last: u64 },
    #[error("sector size {size} is not supported")]
    UnsupportedSectorSize { size: u32 },
    /// LBA 1 does not carry an `EFI PART` header.
    #[error("no GPT header")]
    NoGpt,
    #[error("bad ext4 superblock")]
    BadSuperblock,
    #[error("unsupported filesystem feature: {0}")]
    UnsupportedFeature(&'static str),
    /// An on-disk structure contradicts itself.
    #[error("corrupt {0}")]
    Corrupt(&'static str),
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("volume is already mounted")]
    AlreadyMounted,
    #[error("volume is not mounted")]
    NotMounted,
    #[error("no space left on the volume")]
    NoSpace,
    /// The port has no working SATA device attached.
    #[error("no device on AHCI port {port}")]
    NoDevice { port: u8 },
    #[error("AHCI port {port} did not respond in time")]
    Timeout { port: u8 },
    #[error("task file error on AHCI port {port}, status {status:#04x}")]
    TaskFileError { port: u8, status: u8 },
}

pub type Result<T, E = StorageError> = core::result::Result<T, E>;

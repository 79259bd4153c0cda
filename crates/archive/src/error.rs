//! Error and Result types for archive operations.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A convenience `Result` type for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// The error type for archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A caller supplied an argument that can never be valid.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A timestamp lies outside the representable archive time range.
    #[error("Time {0} is outside the archive time range")]
    TimeOutOfRange(f64),

    /// Invalid magic bytes in the allocation table trailer.
    #[error("Invalid magic bytes: expected AFAT, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported allocation table format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Trailer checksum does not match the stored value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Stored CRC32 checksum.
        expected: u32,
        /// Computed CRC32 checksum.
        actual: u32,
    },

    /// The file structure is inconsistent with its allocation table.
    #[error("Corrupt archive file: {0}")]
    Corrupt(String),

    /// A data block has no free slots left.
    #[error("Data block {index} is full")]
    BlockFull {
        /// Index of the full block.
        index: usize,
    },

    /// No data block could be allocated in the active file.
    #[error("Archive file is full: {path:?}")]
    FileFull {
        /// Path of the full file.
        path: PathBuf,
    },

    /// The operation needs an open archive file.
    #[error("Archive file is not open")]
    NotOpen,

    /// `open` was called on an archive that is already open.
    #[error("Archive file is already open")]
    AlreadyOpen,

    /// The archive was closed while the caller was waiting on it.
    #[error("Archive file has been closed")]
    Closed,

    /// An exclusive lock on a file could not be obtained in time.
    #[error("Timed out after {timeout:?} waiting for exclusive access to {path:?}")]
    LockTimeout {
        /// File that stayed locked.
        path: PathBuf,
        /// How long the wait lasted.
        timeout: Duration,
    },

    /// A collaborator store rejected a read or write.
    #[error("Store error: {0}")]
    Store(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

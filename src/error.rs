//! Error type shared by every public operation of the inspection engine.
//!
//! Resource failures (missing image, permissions, device I/O) are surfaced as distinct
//! variants so a front-end can tell the user what to fix. Structural corruption is absorbed
//! by the layer that finds it and only shows up here when a caller asks for a specific
//! structure directly.

use std::io;
use thiserror::Error;

use crate::filesystem::fs_error::FsError;
use crate::partition::partition_error::PartitionError;

/// Represents errors returned by the inspection engine.
#[derive(Error, Debug)]
pub enum InspectError {
    /// The image or device does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// The image or device exists but cannot be opened for reading.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// Transient device or file failure.
    #[error("I/O error: {0}")]
    Io(io::Error),
    /// A read would extend past the end of the image or volume.
    #[error("Read of {length} bytes at offset {offset} goes past the end ({limit} bytes)")]
    OutOfRange { offset: u64, length: u64, limit: u64 },
    /// The partition table failed its consistency checks.
    #[error("Malformed partition table: {0}")]
    MalformedTable(PartitionError),
    /// No filesystem driver recognised the volume.
    #[error("No supported filesystem found on volume #{0}")]
    UnrecognizedFilesystem(usize),
    /// A single on-disk record could not be decoded.
    #[error("Corrupt entry: {0}")]
    CorruptEntry(String),
    /// The session owning this handle has been closed.
    #[error("The inspection session has been closed")]
    SessionClosed,
    /// The volume index does not exist in the session.
    #[error("Invalid volume number: {0}")]
    InvalidVolume(usize),
    /// A manually registered volume would start inside an existing one.
    #[error("Offset {offset} lies inside volume #{volume}")]
    OverlappingVolume { offset: u64, volume: usize },
    /// A path component resolved to something that is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(String),
}

impl InspectError {
    /// Maps an I/O error raised while opening `what` onto the user-actionable variants.
    pub fn from_open(err: io::Error, what: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => InspectError::NotFound(what.to_string()),
            io::ErrorKind::PermissionDenied => InspectError::PermissionDenied(what.to_string()),
            _ => InspectError::Io(err),
        }
    }
}

/// Converts standard I/O errors into InspectError.
impl From<io::Error> for InspectError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => InspectError::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => InspectError::PermissionDenied(err.to_string()),
            _ => InspectError::Io(err),
        }
    }
}

/// Converts BinRead errors into InspectError.
impl From<binread::Error> for InspectError {
    fn from(err: binread::Error) -> Self {
        match err {
            binread::Error::Io(io_err) => InspectError::from(io_err),
            other => InspectError::CorruptEntry(other.to_string()),
        }
    }
}

impl From<PartitionError> for InspectError {
    fn from(err: PartitionError) -> Self {
        match err {
            PartitionError::Read(inner) => *inner,
            other => InspectError::MalformedTable(other),
        }
    }
}

impl From<FsError> for InspectError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Read(inner) => *inner,
            other => InspectError::CorruptEntry(other.to_string()),
        }
    }
}

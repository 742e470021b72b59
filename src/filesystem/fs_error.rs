//! Error types raised while validating filesystem superblocks and boot sectors.
//!
//! A probe that fails with one of these simply means "this driver does not match"; the
//! registry then tries the next driver.

use thiserror::Error;

use crate::error::InspectError;

/// Errors that can occur while validating a filesystem's on-disk header.
#[derive(Error, Debug)]
pub enum FsError {
    /// The header could not be read.
    #[error("Read error: {0}")]
    Read(Box<InspectError>),

    /// The first three bytes of a FAT volume must contain a valid x86 jump instruction.
    #[error("Invalid jump instruction `{0}`")]
    InvalidJmp(String),

    /// Bytes per sector must be 512, 1024, 2048 or 4096.
    #[error("Invalid count of bytes per sector: `{0}`. Legal values: 512, 1024, 2048 or 4096")]
    InvalidBytesPerSec(u32),

    /// Sectors per cluster must be a power of 2.
    #[error("Invalid number of sector per cluster: `{0}`")]
    InvalidSecPerClus(u32),

    /// Total cluster size must not exceed 32 KiB on FAT volumes.
    #[error("Invalid cluster size: `{0}`. Any value greater than 32K is invalid.")]
    InvalidClusSz(u32),

    /// The count of reserved sectors must be greater than 0.
    #[error("Invalid count of reserved sectors: `{0}`. Any value greater than 0 is valid.")]
    InvalidRsvdSecCnt(u16),

    /// The number of File Allocation Tables must be 1 or 2.
    #[error("Invalid number of FATs on this volume: `{0}`.")]
    InvalidNumFat(u8),

    /// The root directory entry count does not match the FAT type.
    #[error("Invalid count of directory entries in the root directory: `{0}`")]
    InvalidRootEntCnt(u16),

    /// The total sector count must be valid for the volume size.
    #[error("Invalid total count of sectors on the volume: `{0}`")]
    InvalidTotSec(String),

    /// The FAT size in sectors must be valid and consistent with the volume layout.
    #[error("Invalid FAT size:`{0}`")]
    InvalidFatSz(String),

    /// The root directory's first cluster number must be at least 2.
    #[error("Invalid cluster number of the first cluster of the root directory: `{0}`")]
    InvalidRootClus(u32),

    /// The boot sector signature must be 0x55AA.
    #[error("Invalid boot sector signature: `{0}`. Expected signature: 0x55AA")]
    InvalidSignature(String),

    /// A magic number or OEM name did not match.
    #[error("Bad magic: expected {expected}, found {found}")]
    BadMagic { expected: String, found: String },

    /// A structural field holds a value the driver cannot work with.
    #[error("Invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },

    /// The filesystem uses a feature this driver cannot decode.
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),
}

impl From<InspectError> for FsError {
    fn from(err: InspectError) -> Self {
        FsError::Read(Box::new(err))
    }
}

impl From<binread::Error> for FsError {
    fn from(err: binread::Error) -> Self {
        FsError::Read(Box::new(InspectError::from(err)))
    }
}

//! Error types for partition table parsing.
//!
//! None of these errors are fatal to a session: the table parser logs them and falls back
//! to treating the whole image as one volume.

use thiserror;

use crate::error::InspectError;

/// Represents the reasons a partition table is rejected.
#[derive(thiserror::Error, Debug)]
pub enum PartitionError {
    /// The table could not be read from the image.
    #[error("Read error: {0}")]
    Read(Box<InspectError>),
    /// Indicates that the boot signature is not valid.
    /// Contains the invalid signature value that was found.
    #[error("Invalid signature: 0x{0:04X}")]
    InvalidSignature(u16),
    /// A partition entry carries a status byte other than 0x00 or 0x80.
    #[error("Invalid status byte 0x{status:02X} in entry #{entry}")]
    InvalidStatus { entry: usize, status: u8 },
    /// Indicates that two or more partitions have overlapping sectors.
    #[error("Partitions #{0} and #{1} are overlapping")]
    OverlappingPartitions(usize, usize),
    /// The extended partition chain points back to an already visited record.
    #[error("Extended partition chain loops at sector {0}")]
    ExtendedLoop(u64),
    /// The GPT header is inconsistent.
    #[error("Invalid GPT header: {0}")]
    InvalidGptHeader(String),
    /// A stored CRC32 does not match the computed one.
    #[error("{what} checksum mismatch: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        what: &'static str,
        stored: u32,
        computed: u32,
    },
    /// A GPT entry ends before it starts.
    #[error("GPT entry #{0} has its last LBA before its first LBA")]
    InvertedEntry(usize),
}

impl From<InspectError> for PartitionError {
    fn from(err: InspectError) -> Self {
        PartitionError::Read(Box::new(err))
    }
}

impl From<binread::Error> for PartitionError {
    fn from(err: binread::Error) -> Self {
        PartitionError::Read(Box::new(InspectError::from(err)))
    }
}

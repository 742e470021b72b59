//! Enum for the different FAT types (FAT12, FAT16, FAT32).
//!
//! This module defines the FATType enum, which is used to distinguish between FAT12, FAT16, and FAT32
//! filesystems, and the per-type meaning of FAT entry values.

use std::fmt;

/// Represents the different types of FAT filesystems.
///
/// # Values
/// - `FAT12`: 12-bit File Allocation Table entries
/// - `FAT16`: 16-bit File Allocation Table entries
/// - `FAT32`: 32-bit File Allocation Table entries (only 28 bits are used)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FATType {
    FAT12,
    FAT16,
    FAT32,
}

impl fmt::Display for FATType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FATType::FAT12 => "FAT12",
            FATType::FAT16 => "FAT16",
            FATType::FAT32 => "FAT32",
        };
        write!(f, "{s}")
    }
}

impl FATType {
    /// Width of one FAT entry in bits.
    pub fn entry_bits(&self) -> u32 {
        match self {
            FATType::FAT12 => 12,
            FATType::FAT16 => 16,
            FATType::FAT32 => 32,
        }
    }

    /// Value marking a cluster as bad.
    pub fn bad_cluster_marker(&self) -> u32 {
        match self {
            FATType::FAT12 => 0xFF7,
            FATType::FAT16 => 0xFFF7,
            FATType::FAT32 => 0x0FFF_FFF7,
        }
    }

    /// Returns `true` if `value` marks the end of a cluster chain.
    pub fn is_eoc(&self, value: u32) -> bool {
        match self {
            FATType::FAT12 => value >= 0xFF8,
            FATType::FAT16 => value >= 0xFFF8,
            FATType::FAT32 => (value & 0x0FFF_FFFF) >= 0x0FFF_FFF8,
        }
    }
}

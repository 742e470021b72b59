//! This module provides functionality for parsing Master Boot Records (MBR) and the
//! Extended Boot Records (EBR) chained behind an extended partition.
//!
//! It defines structures and methods to interpret partition table entries,
//! validate partition tables, and turn them into volumes in on-disk order.
use binread::{BinRead, BinReaderExt};
use getset::CopyGetters;
use log::warn;
use std::collections::HashSet;
use std::fmt::{self, Display};
use std::io;

use super::partition_error::PartitionError;
use super::table::{Volume, VolumeKind};
use crate::image::ImageSource;

/// The number of partition entries in a MBR or EBR.
pub const PART_CNT: usize = 4;

/// Longest chain of logical partitions followed before giving up.
const MAX_LOGICAL: usize = 128;

/// Represents the type of a partition table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PTType {
    Empty,
    Fat12,
    Fat16,
    Fat32,
    /// NTFS and exFAT share the same type byte.
    NtfsExFat,
    /// Container for logical partitions (CHS, LBA or Linux flavour).
    Extended,
    LinuxSwap,
    Linux,
    /// Single entry covering the disk in front of a GUID partition table.
    GptProtective,
    /// Unsupported partition type, encapsulating the raw type byte.
    Unsupported(u8),
}

impl Display for PTType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PTType::Empty => write!(f, "Empty"),
            PTType::Fat12 => write!(f, "FAT12"),
            PTType::Fat16 => write!(f, "FAT16"),
            PTType::Fat32 => write!(f, "FAT32"),
            PTType::NtfsExFat => write!(f, "NTFS/exFAT"),
            PTType::Extended => write!(f, "Extended"),
            PTType::LinuxSwap => write!(f, "Linux swap"),
            PTType::Linux => write!(f, "Linux"),
            PTType::GptProtective => write!(f, "GPT protective"),
            PTType::Unsupported(b) => write!(f, "Unknown 0x{:02X}", b),
        }
    }
}

impl PTType {
    /// Creates a `PTType` instance from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => PTType::Empty,
            0x01 => PTType::Fat12,
            0x04 | 0x06 | 0x0E => PTType::Fat16,
            0x0B | 0x0C => PTType::Fat32,
            0x07 => PTType::NtfsExFat,
            0x05 | 0x0F | 0x85 => PTType::Extended,
            0x82 => PTType::LinuxSwap,
            0x83 => PTType::Linux,
            0xEE => PTType::GptProtective,
            _ => PTType::Unsupported(byte),
        }
    }
}

/// Represents a single 16-byte partition table entry.
#[derive(BinRead, Debug, Clone, Copy, Default, CopyGetters)]
#[br(little)]
pub struct PTEntry {
    /// 0x80 for the active (bootable) partition, 0x00 otherwise.
    #[getset(get_copy = "pub")]
    status: u8,
    _chs_first: [u8; 3],
    /// Raw partition type byte.
    #[getset(get_copy = "pub")]
    type_byte: u8,
    _chs_last: [u8; 3],
    /// The starting sector, relative to the record holding this entry.
    #[getset(get_copy = "pub")]
    lba_start: u32,
    /// The number of sectors in the partition.
    #[getset(get_copy = "pub")]
    sector_cnt: u32,
}

impl PTEntry {
    pub fn pt_type(&self) -> PTType {
        PTType::from_byte(self.type_byte)
    }

    pub fn is_bootable(&self) -> bool {
        self.status == 0x80
    }

    fn is_empty(&self) -> bool {
        self.type_byte == 0 || self.sector_cnt == 0
    }
}

/// Represents the boot signature of a Master Boot Record (MBR).
#[derive(Debug, Clone, Copy)]
enum BootSignature {
    /// Standard MBR boot signature (0x55AA).
    Mbr,
    /// Unsupported boot signature, encapsulating the raw value.
    Unsupported(u16),
}

impl BootSignature {
    fn from_u16(sig: u16) -> BootSignature {
        match sig {
            // The signature 0x55AA is stored on disk in little-endian byte order.
            0xAA55 => BootSignature::Mbr,
            other => BootSignature::Unsupported(other),
        }
    }
}

/// Raw layout of a MBR/EBR sector.
#[derive(BinRead, Debug)]
#[br(little)]
struct RawMbr {
    #[br(pad_before = 446)]
    pt_entries: [PTEntry; PART_CNT],
    boot_signature: u16,
}

/// Represents a Master Boot Record (or an Extended Boot Record, which shares the layout).
#[derive(Debug)]
pub struct Mbr {
    /// The sector holding this record.
    lba: u64,
    /// The partition table entries, in on-disk order.
    pt_entries: [PTEntry; PART_CNT],
}

impl Mbr {
    /// Returns `true` if the first sector carries the 0x55AA boot signature.
    pub fn has_signature(sector: &[u8]) -> bool {
        sector.len() >= 512 && sector[510] == 0x55 && sector[511] == 0xAA
    }

    /// Reads and validates the record stored at sector `lba`.
    ///
    /// # Errors
    /// - `PartitionError::Read` if the sector cannot be read
    /// - `PartitionError::InvalidSignature` if the boot signature is not 0x55AA
    /// - `PartitionError::InvalidStatus` if an entry has a status other than 0x00 or 0x80
    pub fn from_image(image: &ImageSource, lba: u64) -> Result<Mbr, PartitionError> {
        let buffer = image.read_sector(lba)?;
        let raw: RawMbr = io::Cursor::new(buffer).read_le()?;

        if let BootSignature::Unsupported(sig) = BootSignature::from_u16(raw.boot_signature) {
            return Err(PartitionError::InvalidSignature(sig));
        }

        let mbr = Mbr {
            lba,
            pt_entries: raw.pt_entries,
        };
        mbr.check_status()
    }

    /// Returns the non-empty partition table entries, in on-disk order.
    pub fn pt_entries(&self) -> Vec<&PTEntry> {
        self.pt_entries
            .iter()
            .filter(|entry| !entry.is_empty())
            .collect()
    }

    /// Returns `true` if this record only protects a GUID partition table.
    pub fn is_protective(&self) -> bool {
        self.pt_entries()
            .iter()
            .any(|entry| entry.pt_type() == PTType::GptProtective)
    }

    /// Checks that every entry carries a legal status byte. Boot sectors of unpartitioned
    /// volumes also end with 0x55AA, and this is what usually tells them apart.
    fn check_status(self) -> Result<Self, PartitionError> {
        for (i, entry) in self.pt_entries.iter().enumerate() {
            if entry.status != 0x00 && entry.status != 0x80 {
                return Err(PartitionError::InvalidStatus {
                    entry: i,
                    status: entry.status,
                });
            }
        }
        Ok(self)
    }

    /// Expands the table into volumes, descending into extended partitions depth-first
    /// in on-disk order.
    pub fn volumes(&self, image: &ImageSource) -> Result<Vec<Volume>, PartitionError> {
        let mut volumes = vec![];
        let mut visited = HashSet::from([self.lba]);

        for entry in self.pt_entries() {
            if entry.pt_type() == PTType::Extended {
                let ext_base = u64::from(entry.lba_start());
                collect_logical(image, ext_base, ext_base, &mut visited, &mut volumes)?;
            } else {
                volumes.push(entry_volume(entry, self.lba, image.sector_size()));
            }
        }

        Ok(volumes)
    }
}

/// Follows one EBR and everything chained behind it.
///
/// Logical partitions are relative to the EBR describing them, while links to the next
/// EBR are relative to the start of the outermost extended partition.
fn collect_logical(
    image: &ImageSource,
    ext_base: u64,
    ebr_lba: u64,
    visited: &mut HashSet<u64>,
    out: &mut Vec<Volume>,
) -> Result<(), PartitionError> {
    if !visited.insert(ebr_lba) {
        return Err(PartitionError::ExtendedLoop(ebr_lba));
    }
    if visited.len() > MAX_LOGICAL {
        warn!("Extended partition chain longer than {MAX_LOGICAL} records, ignoring the rest");
        return Ok(());
    }

    let ebr = Mbr::from_image(image, ebr_lba)?;
    for entry in ebr.pt_entries() {
        if entry.pt_type() == PTType::Extended {
            let next = ext_base + u64::from(entry.lba_start());
            collect_logical(image, ext_base, next, visited, out)?;
        } else {
            out.push(entry_volume(entry, ebr_lba, image.sector_size()));
        }
    }

    Ok(())
}

fn entry_volume(entry: &PTEntry, base_lba: u64, sector_size: usize) -> Volume {
    let sector_size = sector_size as u64;
    Volume::new(
        (base_lba + u64::from(entry.lba_start())) * sector_size,
        u64::from(entry.sector_cnt()) * sector_size,
        VolumeKind::Mbr(entry.type_byte()),
        entry.is_bootable(),
        entry.pt_type().to_string(),
    )
}

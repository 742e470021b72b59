//! GUID Partition Table (GPT) parsing.
//!
//! The primary header lives in the sector after the protective MBR. Both the header and the
//! partition entry array are protected by a CRC32; a mismatch in either rejects the table.

use binread::{BinRead, BinReaderExt};
use getset::{CopyGetters, Getters};
use std::io;

use super::partition_error::PartitionError;
use super::table::{Volume, VolumeKind};
use crate::image::ImageSource;
use crate::utils;

/// GPT header signature.
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// Smallest legal header size (the revision 1.0 layout).
const MIN_HEADER_SIZE: u32 = 92;

/// Upper bound on the partition array, far above the 128 * 128 bytes tools create.
const MAX_ARRAY_SIZE: u64 = 1 << 20;

/// Attribute bit marking a partition as bootable by legacy BIOS.
const LEGACY_BIOS_BOOTABLE: u64 = 1 << 2;

/// Well-known partition type GUIDs and their descriptions.
const KNOWN_TYPES: [(&str, &str); 8] = [
    ("C12A7328-F81F-11D2-BA4B-00A0C93EC93B", "EFI System"),
    ("21686148-6449-6E6F-744E-656564454649", "BIOS boot"),
    ("E3C9E316-0B5C-4DB8-817D-F92DF00215AE", "Microsoft reserved"),
    ("EBD0A0A2-B9E5-4433-87C0-68B6B72699C7", "Microsoft basic data"),
    ("DE94BBA4-06D1-4D40-A16A-BFD50179D6AC", "Windows recovery"),
    ("0FC63DAF-8483-4772-8E79-3D69D8477DE4", "Linux filesystem"),
    ("0657FD6D-A4AB-43C4-84E5-0933C84B4F4F", "Linux swap"),
    ("E6D6D379-F507-44C2-A23C-238F2A3DF928", "Linux LVM"),
];

/// On-disk GPT header.
#[derive(BinRead, Debug, Clone, Getters, CopyGetters)]
#[br(little)]
pub struct GptHeader {
    signature: [u8; 8],
    #[getset(get_copy = "pub")]
    revision: u32,
    #[getset(get_copy = "pub")]
    header_size: u32,
    #[getset(get_copy = "pub")]
    header_crc32: u32,
    _reserved: u32,
    #[getset(get_copy = "pub")]
    current_lba: u64,
    #[getset(get_copy = "pub")]
    backup_lba: u64,
    #[getset(get_copy = "pub")]
    first_usable_lba: u64,
    #[getset(get_copy = "pub")]
    last_usable_lba: u64,
    #[getset(get = "pub")]
    disk_guid: [u8; 16],
    #[getset(get_copy = "pub")]
    entries_lba: u64,
    #[getset(get_copy = "pub")]
    entry_count: u32,
    #[getset(get_copy = "pub")]
    entry_size: u32,
    #[getset(get_copy = "pub")]
    entries_crc32: u32,
}

/// One 128-byte partition entry (longer entries only add reserved bytes).
#[derive(BinRead, Debug, Clone)]
#[br(little)]
struct GptEntry {
    type_guid: [u8; 16],
    _unique_guid: [u8; 16],
    first_lba: u64,
    last_lba: u64,
    attributes: u64,
    #[br(count = 36)]
    name: Vec<u16>,
}

impl GptEntry {
    fn is_unused(&self) -> bool {
        self.type_guid.iter().all(|&b| b == 0)
    }
}

/// A parsed and checksum-verified GUID partition table.
#[derive(Debug)]
pub struct Gpt {
    header: GptHeader,
    volumes: Vec<Volume>,
}

impl Gpt {
    /// Returns `true` if the sector after the MBR starts with the GPT signature.
    pub fn is_present(image: &ImageSource) -> bool {
        let sector_size = image.sector_size() as u64;
        image.len() >= 2 * sector_size
            && image
                .read(sector_size, GPT_SIGNATURE.len())
                .is_ok_and(|sig| sig == GPT_SIGNATURE)
    }

    /// Reads the primary header and partition array, validating both checksums.
    ///
    /// # Errors
    /// - `PartitionError::InvalidGptHeader` if sizes or signature are inconsistent
    /// - `PartitionError::ChecksumMismatch` if the header or array CRC32 does not match
    /// - `PartitionError::InvertedEntry` if an entry ends before it starts
    pub fn from_image(image: &ImageSource) -> Result<Gpt, PartitionError> {
        let sector_size = image.sector_size();
        let raw = image.read_sector(1)?;
        let header: GptHeader = io::Cursor::new(&raw).read_le()?;

        if &header.signature != GPT_SIGNATURE {
            return Err(PartitionError::InvalidGptHeader("missing signature".to_string()));
        }
        if header.header_size < MIN_HEADER_SIZE || header.header_size as usize > sector_size {
            return Err(PartitionError::InvalidGptHeader(format!(
                "header size {} out of range",
                header.header_size
            )));
        }

        let mut crc_input = raw[..header.header_size as usize].to_vec();
        crc_input[16..20].fill(0);
        check_crc("Header", header.header_crc32, &crc_input)?;

        if header.entry_size < 128 || header.entry_size % 8 != 0 {
            return Err(PartitionError::InvalidGptHeader(format!(
                "entry size {} is not supported",
                header.entry_size
            )));
        }
        let array_len = u64::from(header.entry_count) * u64::from(header.entry_size);
        if array_len > MAX_ARRAY_SIZE {
            return Err(PartitionError::InvalidGptHeader(format!(
                "partition array of {array_len} bytes is too large"
            )));
        }

        let array_start = header
            .entries_lba
            .checked_mul(sector_size as u64)
            .ok_or_else(|| {
                PartitionError::InvalidGptHeader(format!(
                    "partition array LBA {} is out of range",
                    header.entries_lba
                ))
            })?;
        let array = image.read(array_start, array_len as usize)?;
        check_crc("Partition array", header.entries_crc32, &array)?;

        let mut volumes = vec![];
        for (i, chunk) in array.chunks_exact(header.entry_size as usize).enumerate() {
            let entry: GptEntry = io::Cursor::new(chunk).read_le()?;
            if entry.is_unused() {
                continue;
            }
            if entry.last_lba < entry.first_lba {
                return Err(PartitionError::InvertedEntry(i));
            }

            let type_guid = format_guid(&entry.type_guid);
            let name = utils::utf16_to_string(&entry.name);
            let description = if name.is_empty() {
                type_name(&type_guid).to_string()
            } else {
                name
            };

            let sector = sector_size as u64;
            let bounds = entry.first_lba.checked_mul(sector).zip(
                (entry.last_lba - entry.first_lba)
                    .checked_add(1)
                    .and_then(|sectors| sectors.checked_mul(sector)),
            );
            let Some((start, len)) = bounds else {
                return Err(PartitionError::InvalidGptHeader(format!(
                    "entry {i} spans LBA {}..={}, beyond any addressable image",
                    entry.first_lba, entry.last_lba
                )));
            };

            volumes.push(Volume::new(
                start,
                len,
                VolumeKind::Gpt(type_guid),
                entry.attributes & LEGACY_BIOS_BOOTABLE != 0,
                description,
            ));
        }

        Ok(Gpt { header, volumes })
    }

    pub fn header(&self) -> &GptHeader {
        &self.header
    }

    pub fn into_volumes(self) -> Vec<Volume> {
        self.volumes
    }
}

fn check_crc(what: &'static str, stored: u32, data: &[u8]) -> Result<(), PartitionError> {
    let computed = crc32fast::hash(data);
    if computed != stored {
        return Err(PartitionError::ChecksumMismatch {
            what,
            stored,
            computed,
        });
    }
    Ok(())
}

/// Looks for the GPT header at LBA 1 for 512- and 4096-byte sectors and returns the
/// sector size it was found with, or the default 512.
pub fn probe_sector_size(image: &ImageSource) -> usize {
    for candidate in [512u64, 4096] {
        if image.len() >= 2 * candidate
            && image
                .read(candidate, GPT_SIGNATURE.len())
                .is_ok_and(|sig| sig == GPT_SIGNATURE)
        {
            return candidate as usize;
        }
    }
    512
}

/// Formats a GUID stored in the mixed-endian on-disk layout.
pub fn format_guid(raw: &[u8; 16]) -> String {
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
        u16::from_le_bytes([raw[4], raw[5]]),
        u16::from_le_bytes([raw[6], raw[7]]),
        raw[8],
        raw[9],
        raw[10],
        raw[11],
        raw[12],
        raw[13],
        raw[14],
        raw[15],
    )
}

/// Returns a human-readable name for a partition type GUID.
pub fn type_name(guid: &str) -> &'static str {
    KNOWN_TYPES
        .iter()
        .find(|(known, _)| *known == guid)
        .map(|(_, name)| *name)
        .unwrap_or("Unknown GPT type")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_uses_mixed_endian_layout() {
        let raw = [
            0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E,
            0xC9, 0x3B,
        ];
        let guid = format_guid(&raw);
        assert_eq!(guid, "C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
        assert_eq!(type_name(&guid), "EFI System");
    }
}

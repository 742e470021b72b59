//! Volume list construction.
//!
//! Decides which partitioning scheme an image uses, validates the resulting volumes, and
//! falls back to a single volume spanning the whole image when the table is missing or
//! cannot be trusted, so filesystem probing always gets a chance.

use getset::{CopyGetters, Getters};
use log::{info, warn};
use std::fmt::{self, Display, Write};

use super::gpt::Gpt;
use super::mbr::Mbr;
use super::partition_error::PartitionError;
use crate::image::ImageSource;
use crate::traits::LayoutDisplay;

/// Raw type identifier of a volume, as found in its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeKind {
    /// MBR/EBR partition type byte.
    Mbr(u8),
    /// GPT partition type GUID.
    Gpt(String),
    /// Synthetic volume covering the whole image.
    Whole,
    /// Volume registered by hand at a caller-supplied offset.
    Manual,
}

impl Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeKind::Mbr(b) => write!(f, "0x{b:02X}"),
            VolumeKind::Gpt(guid) => write!(f, "{guid}"),
            VolumeKind::Whole => write!(f, "whole image"),
            VolumeKind::Manual => write!(f, "manual"),
        }
    }
}

/// One partition table entry, resolved to absolute byte offsets.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Volume {
    /// Position in the session's volume list.
    #[getset(get_copy = "pub")]
    index: usize,
    /// Start offset in bytes from the beginning of the image.
    #[getset(get_copy = "pub")]
    start: u64,
    /// Length in bytes.
    #[getset(get_copy = "pub")]
    len: u64,
    #[getset(get = "pub")]
    kind: VolumeKind,
    #[getset(get_copy = "pub")]
    bootable: bool,
    #[getset(get = "pub")]
    description: String,
}

impl Volume {
    pub fn new(start: u64, len: u64, kind: VolumeKind, bootable: bool, description: String) -> Self {
        Self {
            index: 0,
            start,
            len,
            kind,
            bootable,
            description,
        }
    }

    /// A volume covering `[0, image_len)`.
    pub fn whole(image_len: u64) -> Self {
        Self::new(
            0,
            image_len,
            VolumeKind::Whole,
            false,
            String::from("Whole image (no partition table)"),
        )
    }

    pub(crate) fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// The partitioning scheme the volume list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Mbr,
    Gpt,
    /// No usable table: the whole image is one volume.
    None,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Mbr => write!(f, "Master Boot Record"),
            Scheme::Gpt => write!(f, "GUID Partition Table"),
            Scheme::None => write!(f, "No Partition Table"),
        }
    }
}

/// The ordered volume list of an image.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct PartitionTable {
    #[getset(get_copy = "pub")]
    scheme: Scheme,
    #[getset(get = "pub")]
    volumes: Vec<Volume>,
    #[getset(get_copy = "pub")]
    image_len: u64,
    #[getset(get_copy = "pub")]
    sector_size: usize,
}

impl PartitionTable {
    /// Parses the volume system of an image. Never fails: any rejected table is logged and
    /// replaced by a single volume spanning the image.
    ///
    /// A GUID table takes precedence over the legacy table in front of it.
    pub fn parse(image: &ImageSource) -> Self {
        let (scheme, volumes) = match read_table(image) {
            Ok(Some((scheme, volumes))) if !volumes.is_empty() => {
                info!("Found {} volume(s) in the {scheme}", volumes.len());
                (scheme, volumes)
            }
            Ok(_) => {
                info!(
                    "No partition table in {}; treating the whole image as one volume",
                    image.label()
                );
                (Scheme::None, vec![Volume::whole(image.len())])
            }
            Err(err) => {
                warn!(
                    "Partition table of {} rejected ({err}); treating the whole image as one volume",
                    image.label()
                );
                (Scheme::None, vec![Volume::whole(image.len())])
            }
        };

        Self {
            scheme,
            volumes: number(volumes),
            image_len: image.len(),
            sector_size: image.sector_size(),
        }
    }

    /// Appends a volume and returns its index.
    pub(crate) fn push(&mut self, volume: Volume) -> usize {
        let index = self.volumes.len();
        self.volumes.push(volume.with_index(index));
        index
    }
}

fn number(volumes: Vec<Volume>) -> Vec<Volume> {
    volumes
        .into_iter()
        .enumerate()
        .map(|(i, v)| v.with_index(i))
        .collect()
}

/// Reads whichever table the image carries, `Ok(None)` if it has none.
fn read_table(image: &ImageSource) -> Result<Option<(Scheme, Vec<Volume>)>, PartitionError> {
    if image.len() < image.sector_size() as u64 {
        return Ok(None);
    }

    if Gpt::is_present(image) {
        let volumes = Gpt::from_image(image)?.into_volumes();
        return Ok(Some((Scheme::Gpt, check_bounds(image, volumes)?)));
    }

    let sector0 = image.read_sector(0)?;
    if !Mbr::has_signature(&sector0) {
        return Ok(None);
    }

    let mbr = Mbr::from_image(image, 0)?;
    if mbr.is_protective() {
        // A protective MBR without a readable GPT header describes nothing usable.
        return Ok(None);
    }
    let volumes = mbr.volumes(image)?;
    Ok(Some((Scheme::Mbr, check_bounds(image, volumes)?)))
}

/// Enforces that volumes stay inside the image and never overlap each other.
///
/// Volumes starting past the end are dropped and volumes running past the end are
/// truncated, so a partially acquired image still exposes what it holds.
fn check_bounds(image: &ImageSource, volumes: Vec<Volume>) -> Result<Vec<Volume>, PartitionError> {
    let image_len = image.len();
    let mut kept = vec![];

    for (i, mut volume) in volumes.into_iter().enumerate() {
        if volume.start >= image_len {
            warn!("Partition #{i} starts past the end of the image, ignoring it");
            continue;
        }
        if volume.end() > image_len {
            warn!("Partition #{i} runs past the end of the image, truncating it");
            volume.len = image_len - volume.start;
        }
        kept.push((i, volume));
    }

    let mut by_start: Vec<&(usize, Volume)> = kept.iter().collect();
    by_start.sort_by_key(|(_, v)| v.start);
    if let Some(pair) = by_start
        .windows(2)
        .find(|pair| pair[0].1.end() > pair[1].1.start)
    {
        return Err(PartitionError::OverlappingPartitions(pair[0].0, pair[1].0));
    }

    Ok(kept.into_iter().map(|(_, v)| v).collect())
}

/// Prints the layout of the image based on its volume list, including unallocated gaps.
impl LayoutDisplay for PartitionTable {
    fn display_layout(&self, indent: u8) -> Result<String, fmt::Error> {
        let mut out = String::new();
        let indent = " ".repeat(indent.into());
        let sector = self.sector_size as u64;
        let disk_end = self.image_len / sector;

        writeln!(out, "{}┌{:─^68}┐", indent, format!(" {} Layout ", self.scheme))?;
        writeln!(out, "{}├{:<58}{:>10}┤", indent, "Disk Size (sectors)", disk_end)?;
        writeln!(out, "{}├{:<58}{:>10}┤", indent, "Sector Size", self.sector_size)?;
        writeln!(out, "{}├{:─^68}┤", indent, "")?;
        writeln!(
            out,
            "{}├{:^12}┬{:^12}┬{:^12}┬{:^29}┤",
            indent, "Region", "Start", "End", "Description"
        )?;
        writeln!(
            out,
            "{}├{:─<12}┼{:─<12}┼{:─<12}┼{:─<29}┤",
            indent, "", "", "", ""
        )?;

        let mut sorted: Vec<&Volume> = self.volumes.iter().collect();
        sorted.sort_by_key(|v| v.start);

        let mut last_end = 0;
        for volume in sorted {
            let start = volume.start / sector;
            let end = volume.end() / sector;

            if start > last_end {
                writeln!(
                    out,
                    "{}│{:^12}│{:>12}│{:>12}│{:^29}│",
                    indent, "", last_end, start, "Unallocated"
                )?;
            }

            let mut description: String = volume.description.chars().take(27).collect();
            if volume.bootable {
                description.push_str(" *");
            }
            writeln!(
                out,
                "{}│{:^12}│{:>12}│{:>12}│{:^29}│",
                indent,
                format!("Vol #{}", volume.index),
                start,
                end,
                description
            )?;

            last_end = last_end.max(end);
        }

        if last_end < disk_end {
            writeln!(
                out,
                "{}│{:^12}│{:>12}│{:>12}│{:^29}│",
                indent, "", last_end, disk_end, "Unallocated"
            )?;
        }

        writeln!(
            out,
            "{}└{:─<12}┴{:─<12}┴{:─<12}┴{:─<29}┘",
            indent, "", "", "", ""
        )?;

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image(disk: Vec<u8>) -> ImageSource {
        ImageSource::from_source(Cursor::new(disk), "mem").unwrap()
    }

    fn put_mbr_entry(disk: &mut [u8], slot: usize, ty: u8, start: u32, cnt: u32) {
        let off = 446 + slot * 16;
        disk[off + 4] = ty;
        disk[off + 8..off + 12].copy_from_slice(&start.to_le_bytes());
        disk[off + 12..off + 16].copy_from_slice(&cnt.to_le_bytes());
        disk[510] = 0x55;
        disk[511] = 0xAA;
    }

    /// Writes a protective MBR, a GPT header and a one-entry partition array.
    fn gpt_disk(sectors: usize) -> Vec<u8> {
        let mut disk = vec![0u8; 512 * sectors];
        put_mbr_entry(&mut disk, 0, 0xEE, 1, sectors as u32 - 1);

        let entries_lba = 2u64;
        let mut entry = [0u8; 128];
        // Linux filesystem type GUID in on-disk byte order.
        entry[..16].copy_from_slice(&[
            0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47,
            0x7D, 0xE4,
        ]);
        entry[32..40].copy_from_slice(&34u64.to_le_bytes());
        entry[40..48].copy_from_slice(&99u64.to_le_bytes());
        let mut array = vec![0u8; 128 * 4];
        array[..128].copy_from_slice(&entry);
        let array_off = entries_lba as usize * 512;
        disk[array_off..array_off + array.len()].copy_from_slice(&array);

        let h = 512;
        disk[h..h + 8].copy_from_slice(b"EFI PART");
        disk[h + 8..h + 12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        disk[h + 12..h + 16].copy_from_slice(&92u32.to_le_bytes());
        disk[h + 24..h + 32].copy_from_slice(&1u64.to_le_bytes());
        disk[h + 72..h + 80].copy_from_slice(&entries_lba.to_le_bytes());
        disk[h + 80..h + 84].copy_from_slice(&4u32.to_le_bytes());
        disk[h + 84..h + 88].copy_from_slice(&128u32.to_le_bytes());
        disk[h + 88..h + 92].copy_from_slice(&crc32fast::hash(&array).to_le_bytes());
        let crc = crc32fast::hash(&disk[h..h + 92]);
        disk[h + 16..h + 20].copy_from_slice(&crc.to_le_bytes());
        disk
    }

    #[test]
    fn no_signature_yields_one_whole_volume() {
        let table = PartitionTable::parse(&image(vec![0u8; 8192]));
        assert_eq!(table.scheme(), Scheme::None);
        assert_eq!(table.volumes().len(), 1);
        let volume = &table.volumes()[0];
        assert_eq!((volume.start(), volume.len()), (0, 8192));
        assert_eq!(volume.kind(), &VolumeKind::Whole);
    }

    #[test]
    fn image_shorter_than_a_sector_is_whole() {
        let table = PartitionTable::parse(&image(vec![0u8; 100]));
        assert_eq!(table.volumes()[0].len(), 100);
    }

    #[test]
    fn gpt_takes_precedence_over_the_protective_mbr() {
        let table = PartitionTable::parse(&image(gpt_disk(128)));
        assert_eq!(table.scheme(), Scheme::Gpt);
        assert_eq!(table.volumes().len(), 1);
        let volume = &table.volumes()[0];
        assert_eq!((volume.start(), volume.len()), (34 * 512, 66 * 512));
        assert_eq!(volume.description(), "Linux filesystem");
    }

    #[test]
    fn gpt_with_bad_header_checksum_falls_back_to_whole_image() {
        let mut disk = gpt_disk(128);
        disk[512 + 16] ^= 0xFF;
        let table = PartitionTable::parse(&image(disk));
        assert_eq!(table.scheme(), Scheme::None);
        assert_eq!(table.volumes().len(), 1);
        assert_eq!(table.volumes()[0].len(), 128 * 512);
    }

    #[test]
    fn gpt_with_bad_array_checksum_falls_back_to_whole_image() {
        let mut disk = gpt_disk(128);
        disk[2 * 512 + 40] = 0x77;
        let table = PartitionTable::parse(&image(disk));
        assert_eq!(table.scheme(), Scheme::None);
        assert_eq!(table.volumes()[0].kind(), &VolumeKind::Whole);
    }

    #[test]
    fn gpt_entry_at_the_end_of_the_lba_space_falls_back() {
        let mut disk = gpt_disk(128);
        let entry = 2 * 512;
        disk[entry + 32..entry + 40].copy_from_slice(&0u64.to_le_bytes());
        disk[entry + 40..entry + 48].copy_from_slice(&u64::MAX.to_le_bytes());
        let array_crc = crc32fast::hash(&disk[entry..entry + 512]);
        disk[512 + 88..512 + 92].copy_from_slice(&array_crc.to_le_bytes());
        disk[512 + 16..512 + 20].fill(0);
        let header_crc = crc32fast::hash(&disk[512..512 + 92]);
        disk[512 + 16..512 + 20].copy_from_slice(&header_crc.to_le_bytes());

        let table = PartitionTable::parse(&image(disk));
        assert_eq!(table.scheme(), Scheme::None);
        assert_eq!(table.volumes()[0].kind(), &VolumeKind::Whole);
    }

    #[test]
    fn overlapping_mbr_entries_fall_back() {
        let mut disk = vec![0u8; 512 * 100];
        put_mbr_entry(&mut disk, 0, 0x83, 10, 50);
        put_mbr_entry(&mut disk, 1, 0x83, 40, 20);
        let table = PartitionTable::parse(&image(disk));
        assert_eq!(table.scheme(), Scheme::None);
    }

    #[test]
    fn entries_past_the_end_are_truncated_or_dropped() {
        let mut disk = vec![0u8; 512 * 100];
        put_mbr_entry(&mut disk, 0, 0x83, 10, 200);
        put_mbr_entry(&mut disk, 1, 0x83, 300, 20);
        let table = PartitionTable::parse(&image(disk));
        assert_eq!(table.scheme(), Scheme::Mbr);
        assert_eq!(table.volumes().len(), 1);
        assert_eq!(table.volumes()[0].end(), 512 * 100);
    }

    #[test]
    fn layout_lists_unallocated_gaps() {
        let mut disk = vec![0u8; 512 * 100];
        put_mbr_entry(&mut disk, 0, 0x0C, 10, 50);
        let layout = PartitionTable::parse(&image(disk)).display_layout(0).unwrap();
        assert!(layout.contains("Vol #0"));
        assert_eq!(layout.matches("Unallocated").count(), 2);
    }
}

//! exFAT volume structure and directory walking.
//!
//! exFAT directories are made of 32-byte records grouped into entry sets: a file entry
//! (0x85) followed by a stream extension (0xC0) and one or more file name entries (0xC1).
//! Clearing the in-use bit (0x80) of every record of a set is how a file gets deleted, so
//! released sets keep their name, size and timestamps until the slot is reused.

use binread::{BinRead, BinReaderExt};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use getset::CopyGetters;
use log::{debug, warn};
use std::collections::HashSet;
use std::fmt::Write as FmtWrite;
use std::io::{self, SeekFrom};
use std::sync::Arc;

use super::entry::{DirLocation, DirectoryEntry, FileKind};
use super::fs_error::FsError;
use super::walker::{DirBlocks, EntryBatch};
use crate::error::InspectError;
use crate::image::VolumeView;
use crate::traits::LayoutDisplay;
use crate::utils::{le_units, u16_at, u32_at, u64_at, u8_at};

const EXFAT_SIGNATURE: &[u8; 8] = b"EXFAT   ";
const RECORD_SIZE: usize = 32;

const ENTRY_FILE: u8 = 0x05;
const ENTRY_STREAM: u8 = 0x40;
const ENTRY_NAME: u8 = 0x41;
const IN_USE: u8 = 0x80;

const ATTR_DIRECTORY: u16 = 0x10;
const FLAG_NO_FAT_CHAIN: u8 = 0x02;
const NAME_UNITS_PER_RECORD: usize = 15;

/// exFAT main boot sector.
#[derive(BinRead, Debug, Clone, CopyGetters)]
#[br(little)]
pub struct ExFatBootSector {
    jump_boot: [u8; 3],
    fs_name: [u8; 8],
    /// 53 zero bytes covering the BPB of FAT volumes, read in two parts
    must_be_zero: [u8; 32],
    must_be_zero_tail: [u8; 21],
    partition_offset: u64,
    /// Volume size in sectors
    #[getset(get_copy = "pub")]
    volume_length: u64,
    /// First FAT, in sectors from the volume start
    #[getset(get_copy = "pub")]
    fat_offset: u32,
    #[getset(get_copy = "pub")]
    fat_length: u32,
    #[getset(get_copy = "pub")]
    cluster_heap_offset: u32,
    #[getset(get_copy = "pub")]
    cluster_count: u32,
    #[getset(get_copy = "pub")]
    first_cluster_of_root: u32,
    #[getset(get_copy = "pub")]
    volume_serial: u32,
    fs_revision: u16,
    volume_flags: u16,
    bytes_per_sector_shift: u8,
    sectors_per_cluster_shift: u8,
    #[getset(get_copy = "pub")]
    number_of_fats: u8,
    drive_select: u8,
    percent_in_use: u8,
    #[br(seek_before = SeekFrom::Start(510))]
    boot_signature: u16,
}

impl ExFatBootSector {
    pub fn from_sector(sector: &[u8]) -> Result<Self, FsError> {
        let mut reader = io::Cursor::new(sector);
        Ok(reader.read_le()?)
    }

    pub fn bytes_per_sector(&self) -> u32 {
        1 << self.bytes_per_sector_shift
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector() << self.sectors_per_cluster_shift
    }

    /// Checks the boot sector fields listed as mandatory by the exFAT specification.
    fn validate(&self, strict: bool, volume_len: u64) -> Result<(), FsError> {
        if &self.fs_name != EXFAT_SIGNATURE {
            return Err(FsError::BadMagic {
                expected: String::from_utf8_lossy(EXFAT_SIGNATURE).into_owned(),
                found: String::from_utf8_lossy(&self.fs_name).into_owned(),
            });
        }
        if self
            .must_be_zero
            .iter()
            .chain(&self.must_be_zero_tail)
            .any(|&b| b != 0)
        {
            return Err(FsError::InvalidField {
                field: "MustBeZero area",
                value: 1,
            });
        }
        if self.boot_signature != 0xAA55 {
            return Err(FsError::InvalidSignature(format!(
                "0x{:04X}",
                self.boot_signature.swap_bytes()
            )));
        }
        if !(9..=12).contains(&self.bytes_per_sector_shift) {
            return Err(FsError::InvalidBytesPerSec(1 << self.bytes_per_sector_shift.min(31)));
        }
        if self.bytes_per_sector_shift as u32 + self.sectors_per_cluster_shift as u32 > 25 {
            return Err(FsError::InvalidSecPerClus(self.sectors_per_cluster_shift.into()));
        }
        if !(1..=2).contains(&self.number_of_fats) {
            return Err(FsError::InvalidNumFat(self.number_of_fats));
        }
        if self.cluster_count == 0 {
            return Err(FsError::InvalidField {
                field: "cluster count",
                value: 0,
            });
        }
        let root = self.first_cluster_of_root;
        if root < 2 || root - 2 >= self.cluster_count {
            return Err(FsError::InvalidRootClus(root));
        }

        if strict {
            if self.fat_offset < 24 {
                return Err(FsError::InvalidField {
                    field: "FAT offset",
                    value: self.fat_offset.into(),
                });
            }
            let declared = self.volume_length.saturating_mul(self.bytes_per_sector() as u64);
            if declared > volume_len {
                return Err(FsError::InvalidTotSec(format!(
                    "{declared} bytes declared on a {volume_len}-byte volume"
                )));
            }
        }

        Ok(())
    }
}

/// Structure for an exFAT volume.
#[derive(Debug)]
pub struct ExFatVol {
    boot: ExFatBootSector,
    len: u64,
}

impl ExFatVol {
    /// Reads and validates the main boot sector.
    pub fn probe(view: &VolumeView<'_>, strict: bool) -> Result<ExFatVol, FsError> {
        let sector = view.read(0, 512)?;
        if &sector[3..11] != EXFAT_SIGNATURE {
            return Err(FsError::BadMagic {
                expected: String::from_utf8_lossy(EXFAT_SIGNATURE).into_owned(),
                found: String::from_utf8_lossy(&sector[3..11]).into_owned(),
            });
        }
        let boot = ExFatBootSector::from_sector(&sector)?;
        boot.validate(strict, view.len())?;
        debug!(
            "exFAT boot sector: {} clusters of {} bytes, root at cluster {}",
            boot.cluster_count,
            boot.bytes_per_cluster(),
            boot.first_cluster_of_root
        );

        Ok(Self {
            boot,
            len: view.len(),
        })
    }

    pub fn boot_sector(&self) -> &ExFatBootSector {
        &self.boot
    }

    pub fn cluster_size(&self) -> u32 {
        self.boot.bytes_per_cluster()
    }

    pub fn root_location(&self) -> DirLocation {
        DirLocation::Cluster {
            first: self.boot.first_cluster_of_root,
            contiguous_len: None,
        }
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster - 2 < self.boot.cluster_count
    }

    fn fat_start(&self) -> u64 {
        self.boot.fat_offset as u64 * self.boot.bytes_per_sector() as u64
    }

    fn heap_start(&self) -> u64 {
        self.boot.cluster_heap_offset as u64 * self.boot.bytes_per_sector() as u64
    }

    fn heap_end(&self) -> u64 {
        self.heap_start() + self.boot.cluster_count as u64 * self.cluster_size() as u64
    }

    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.heap_start() + (cluster as u64 - 2) * self.cluster_size() as u64
    }

    pub fn fat_entry(&self, view: &VolumeView<'_>, cluster: u32) -> Result<u32, InspectError> {
        Ok(u32_at(&view.read(self.fat_start() + cluster as u64 * 4, 4)?, 0))
    }

    pub(crate) fn open_dir(self: &Arc<Self>, location: DirLocation) -> ExFatDirCursor {
        let (next, remaining) = match location {
            DirLocation::Cluster { first, contiguous_len } => (Some(first), contiguous_len),
            DirLocation::FatRoot => (Some(self.boot.first_cluster_of_root), None),
            DirLocation::Inode(_) => (None, None),
        };

        ExFatDirCursor {
            fs: Arc::clone(self),
            next,
            last: None,
            remaining,
            visited: HashSet::new(),
            block_offset: 0,
            set: None,
            ended: false,
        }
    }
}

impl LayoutDisplay for ExFatVol {
    fn display_layout(&self, indent: u8) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        let indent = " ".repeat(indent.into());

        writeln!(out, "{}┌{:─^55}┐", indent, " exFAT Volume Layout ")?;
        writeln!(
            out,
            "{}├{:^12}┬{:^12}┬{:^12}┬{:^16}┤",
            indent, "Region", "Start", "End", "Description"
        )?;
        writeln!(
            out,
            "{}├{:─<12}┼{:─<12}┼{:─<12}┼{:─<16}┤",
            indent, "", "", "", ""
        )?;

        let fat_len = self.boot.fat_length as u64 * self.boot.bytes_per_sector() as u64;
        let rows = [
            ("Boot", 0, self.fat_start(), "Boot Regions"),
            ("FAT", self.fat_start(), self.fat_start() + fat_len, "FAT Table"),
            ("Heap", self.heap_start(), self.heap_end(), "Cluster Heap"),
        ];
        for (region, start, end, desc) in rows {
            writeln!(
                out,
                "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
                indent, region, start, end, desc
            )?;
        }
        if self.heap_end() < self.len {
            writeln!(
                out,
                "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
                indent,
                "",
                self.heap_end(),
                self.len,
                "Volume Slack"
            )?;
        }

        writeln!(
            out,
            "{}└{:─<12}┴{:─<12}┴{:─<12}┴{:─<16}┘",
            indent, "", "", "", ""
        )?;
        Ok(out)
    }
}

/// Records of an entry set gathered so far. A set may straddle two directory blocks.
struct PendingSet {
    id: u64,
    deleted: bool,
    expected: usize,
    records: Vec<[u8; RECORD_SIZE]>,
}

/// Cursor over the records of one exFAT directory.
pub(crate) struct ExFatDirCursor {
    fs: Arc<ExFatVol>,
    next: Option<u32>,
    last: Option<u32>,
    /// Bytes left in a directory whose clusters are contiguous (NoFatChain).
    remaining: Option<u64>,
    visited: HashSet<u32>,
    block_offset: u64,
    set: Option<PendingSet>,
    ended: bool,
}

impl ExFatDirCursor {
    fn advance_chain(&mut self, view: &VolumeView<'_>) -> Result<(), InspectError> {
        let Some(last) = self.last.take() else {
            return Ok(());
        };

        if self.remaining.is_some() {
            self.next = Some(last + 1);
            return Ok(());
        }

        let next = self.fs.fat_entry(view, last)?;
        self.next = match next {
            0xFFFF_FFFF => None,
            n if self.fs.is_valid_cluster(n) => Some(n),
            n => {
                warn!("exFAT cluster chain broken after cluster {last} (FAT entry 0x{n:X})");
                None
            }
        };
        Ok(())
    }

    fn decode_record(&mut self, record: &[u8; RECORD_SIZE], id: u64, batch: &mut EntryBatch) {
        let kind = record[0] & !IN_USE;
        let in_use = record[0] & IN_USE != 0;

        if let Some(mut set) = self.set.take() {
            let belongs = (kind == ENTRY_STREAM && set.records.len() == 1)
                || (kind == ENTRY_NAME && set.records.len() >= 2);
            if belongs && in_use != set.deleted {
                set.records.push(*record);
                if set.records.len() == set.expected {
                    self.finish_set(set, batch);
                } else {
                    self.set = Some(set);
                }
                return;
            }
            self.abandon_set(set, "entry set cut short", batch);
        }

        if kind == ENTRY_FILE {
            let secondary = record[1] as usize;
            if !(2..=18).contains(&secondary) {
                if in_use {
                    batch.skip(format!("record {id}: {secondary} secondary entries"));
                }
                return;
            }
            self.set = Some(PendingSet {
                id,
                deleted: !in_use,
                expected: secondary + 1,
                records: vec![*record],
            });
        } else if in_use && (kind == ENTRY_STREAM || kind == ENTRY_NAME) {
            debug!("Orphan exFAT secondary entry 0x{:02X} at record {id}", record[0]);
        }
    }

    fn abandon_set(&mut self, set: PendingSet, reason: &str, batch: &mut EntryBatch) {
        if set.deleted {
            debug!("Released entry set at record {} is unrecoverable: {reason}", set.id);
        } else {
            batch.skip(format!("record {}: {reason}", set.id));
        }
    }

    fn finish_set(&mut self, set: PendingSet, batch: &mut EntryBatch) {
        let file = set.records[0];
        let stream = set.records[1];

        if !set.deleted {
            let stored = u16_at(&file, 2);
            let computed = set_checksum(&set.records);
            if stored != computed {
                let reason = format!("set checksum 0x{stored:04X}, computed 0x{computed:04X}");
                return self.abandon_set(set, &reason, batch);
            }
        }

        let name_len = u8_at(&stream, 3) as usize;
        let units: Vec<u16> = set.records[2..]
            .iter()
            .flat_map(|rec| le_units(&rec[2..]))
            .take(name_len.min((set.records.len() - 2) * NAME_UNITS_PER_RECORD))
            .collect();
        let name = String::from_utf16_lossy(&units);
        if name.is_empty() && !set.deleted {
            return self.abandon_set(set, "empty file name", batch);
        }

        let attributes = u16_at(&file, 4);
        let is_dir = attributes & ATTR_DIRECTORY != 0;
        let first_cluster = u32_at(&stream, 20);
        let data_length = u64_at(&stream, 24);

        if !set.deleted && first_cluster != 0 && !self.fs.is_valid_cluster(first_cluster) {
            let reason = format!("first cluster {first_cluster} is out of range");
            return self.abandon_set(set, &reason, batch);
        }

        let location = (is_dir && self.fs.is_valid_cluster(first_cluster)).then(|| {
            DirLocation::Cluster {
                first: first_cluster,
                contiguous_len: (u8_at(&stream, 1) & FLAG_NO_FAT_CHAIN != 0)
                    .then_some(data_length),
            }
        });

        batch.push(DirectoryEntry {
            name,
            id: set.id,
            size: data_length,
            created: exfat_datetime(u32_at(&file, 8), u8_at(&file, 20), u8_at(&file, 22)),
            modified: exfat_datetime(u32_at(&file, 12), u8_at(&file, 21), u8_at(&file, 23)),
            accessed: exfat_datetime(u32_at(&file, 16), 0, u8_at(&file, 24)),
            changed: None,
            inode: None,
            kind: FileKind::from_directory_flag(is_dir),
            mode: attributes as u32,
            is_dir,
            is_deleted: set.deleted,
            volume: 0,
            location,
        });
    }
}

impl DirBlocks for ExFatDirCursor {
    fn next_block(&mut self, view: &VolumeView<'_>) -> Result<Option<Vec<u8>>, InspectError> {
        if self.ended {
            return Ok(None);
        }
        self.advance_chain(view)?;

        let Some(cluster) = self.next.take() else {
            return Ok(None);
        };
        if !self.fs.is_valid_cluster(cluster) {
            warn!("exFAT directory cluster {cluster} is out of range");
            return Ok(None);
        }
        if !self.visited.insert(cluster) {
            warn!("exFAT cluster chain loops back on itself at cluster {cluster}");
            return Ok(None);
        }

        let cluster_size = self.fs.cluster_size() as u64;
        let len = match self.remaining {
            Some(0) => return Ok(None),
            Some(left) => {
                let len = left.min(cluster_size);
                self.remaining = Some(left - len);
                len
            }
            None => cluster_size,
        };

        let offset = self.fs.cluster_offset(cluster);
        let block = view.read(offset, len as usize)?;
        self.block_offset = offset;
        self.last = Some(cluster);
        Ok(Some(block))
    }

    fn decode_block(&mut self, _view: &VolumeView<'_>, block: &[u8], batch: &mut EntryBatch) {
        for (i, chunk) in block.chunks_exact(RECORD_SIZE).enumerate() {
            if chunk[0] == 0x00 {
                self.ended = true;
                break;
            }
            let mut record = [0u8; RECORD_SIZE];
            record.copy_from_slice(chunk);
            let id = (self.block_offset + (i * RECORD_SIZE) as u64) / RECORD_SIZE as u64;
            self.decode_record(&record, id, batch);
        }

        if self.ended {
            if let Some(set) = self.set.take() {
                self.abandon_set(set, "directory ends inside an entry set", batch);
            }
        }
    }
}

/// Checksum over every byte of an entry set, skipping the checksum field itself.
pub fn set_checksum(records: &[[u8; RECORD_SIZE]]) -> u16 {
    records
        .iter()
        .flatten()
        .enumerate()
        .filter(|(i, _)| *i != 2 && *i != 3)
        .fold(0u16, |sum, (_, &b)| sum.rotate_right(1).wrapping_add(b as u16))
}

/// Converts an exFAT timestamp.
///
/// Layout: bits 31-25 year since 1980, 24-21 month, 20-16 day, 15-11 hours, 10-5 minutes,
/// 4-0 seconds/2. `increment` adds 10ms units (0-199); `utc_offset` bit 7 marks a valid
/// offset held in bits 6-0 as signed 15-minute steps.
pub fn exfat_datetime(timestamp: u32, increment: u8, utc_offset: u8) -> Option<DateTime<Utc>> {
    if timestamp == 0 {
        return None;
    }
    let year = (timestamp >> 25) as i32 + 1980;
    let month = (timestamp >> 21) & 0x0F;
    let day = (timestamp >> 16) & 0x1F;
    let hour = (timestamp >> 11) & 0x1F;
    let minute = (timestamp >> 5) & 0x3F;
    let second = (timestamp & 0x1F) * 2 + increment as u32 / 100;
    let millis = (increment as u32 % 100) * 10;

    let local = NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_milli_opt(hour, minute, second, millis)?
        .and_utc();

    if utc_offset & 0x80 == 0 {
        return Some(local);
    }
    // Sign-extend the 7-bit field.
    let quarters = ((utc_offset << 1) as i8 >> 1) as i64;
    Some(local - Duration::minutes(quarters * 15))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageSource;
    use chrono::Timelike;
    use std::io::Cursor;

    const VOL_LEN: usize = 1024 * 1024;
    const HEAP: usize = 64 * 512;
    const CLUSTER: usize = 4096;

    /// 1 MiB exFAT volume: 512-byte sectors, 4 KiB clusters, FAT at sector 24,
    /// cluster heap at sector 64, root directory in cluster 4.
    fn exfat_volume() -> Vec<u8> {
        let mut vol = vec![0u8; VOL_LEN];
        let s = &mut vol[0..512];
        s[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
        s[3..11].copy_from_slice(EXFAT_SIGNATURE);
        s[72..80].copy_from_slice(&((VOL_LEN / 512) as u64).to_le_bytes());
        s[80..84].copy_from_slice(&24u32.to_le_bytes());
        s[84..88].copy_from_slice(&8u32.to_le_bytes());
        s[88..92].copy_from_slice(&64u32.to_le_bytes());
        s[92..96].copy_from_slice(&248u32.to_le_bytes());
        s[96..100].copy_from_slice(&4u32.to_le_bytes());
        s[104..106].copy_from_slice(&0x0100u16.to_le_bytes());
        s[108] = 9;
        s[109] = 3;
        s[110] = 1;
        s[510] = 0x55;
        s[511] = 0xAA;
        set_fat(&mut vol, 4, 0xFFFF_FFFF);
        vol
    }

    fn set_fat(vol: &mut [u8], cluster: u32, value: u32) {
        let off = 24 * 512 + cluster as usize * 4;
        vol[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn cluster_at(cluster: usize) -> usize {
        HEAP + (cluster - 2) * CLUSTER
    }

    /// Builds the records of an entry set for `name`.
    fn entry_set(name: &str, attr: u16, cluster: u32, size: u64, flags: u8) -> Vec<[u8; 32]> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let mut records = vec![];

        let mut file = [0u8; 32];
        file[0] = 0x85;
        file[1] = (1 + units.len().div_ceil(15)) as u8;
        file[4..6].copy_from_slice(&attr.to_le_bytes());
        // 2021-03-04 05:06:08
        let ts: u32 = (41 << 25) | (3 << 21) | (4 << 16) | (5 << 11) | (6 << 5) | 4;
        file[12..16].copy_from_slice(&ts.to_le_bytes());
        file[23] = 0x80 | 4;
        records.push(file);

        let mut stream = [0u8; 32];
        stream[0] = 0xC0;
        stream[1] = 0x01 | flags;
        stream[3] = units.len() as u8;
        stream[8..16].copy_from_slice(&size.to_le_bytes());
        stream[20..24].copy_from_slice(&cluster.to_le_bytes());
        stream[24..32].copy_from_slice(&size.to_le_bytes());
        records.push(stream);

        for chunk in units.chunks(15) {
            let mut rec = [0u8; 32];
            rec[0] = 0xC1;
            for (i, u) in chunk.iter().enumerate() {
                rec[2 + i * 2..4 + i * 2].copy_from_slice(&u.to_le_bytes());
            }
            records.push(rec);
        }

        let sum = set_checksum(&records);
        records[0][2..4].copy_from_slice(&sum.to_le_bytes());
        records
    }

    fn write_records(vol: &mut [u8], at: usize, records: &[[u8; 32]]) -> usize {
        for (i, rec) in records.iter().enumerate() {
            vol[at + i * 32..at + (i + 1) * 32].copy_from_slice(rec);
        }
        at + records.len() * 32
    }

    fn delete(records: &mut [[u8; 32]]) {
        for rec in records {
            rec[0] &= !IN_USE;
        }
    }

    fn list(vol: Vec<u8>, location: Option<DirLocation>) -> (Vec<DirectoryEntry>, usize) {
        let image = ImageSource::from_source(Cursor::new(vol), "mem").unwrap();
        let view = VolumeView::new(&image, 0, VOL_LEN as u64);
        let fs = Arc::new(ExFatVol::probe(&view, true).unwrap());
        let mut cursor = fs.open_dir(location.unwrap_or(fs.root_location()));

        let mut entries = vec![];
        let mut skipped = 0;
        while let Some(block) = cursor.next_block(&view).unwrap() {
            let mut batch = EntryBatch::default();
            cursor.decode_block(&view, &block, &mut batch);
            entries.extend(batch.entries().iter().cloned());
            skipped += batch.skipped();
        }
        (entries, skipped)
    }

    #[test]
    fn fat_boot_sectors_are_not_exfat() {
        let mut vol = exfat_volume();
        vol[3..11].copy_from_slice(b"MSDOS5.0");
        let image = ImageSource::from_source(Cursor::new(vol), "mem").unwrap();
        let view = VolumeView::new(&image, 0, VOL_LEN as u64);
        assert!(matches!(
            ExFatVol::probe(&view, true),
            Err(FsError::BadMagic { .. })
        ));
    }

    #[test]
    fn root_listing_includes_released_sets() {
        let mut vol = exfat_volume();
        let mut off = cluster_at(4);
        // Allocation bitmap and up-case table records are not files.
        let mut bitmap = [0u8; 32];
        bitmap[0] = 0x81;
        off = write_records(&mut vol, off, &[bitmap]);
        off = write_records(&mut vol, off, &entry_set("report.pdf", 0x20, 5, 1000, 0));
        let mut gone = entry_set("a rather long deleted name.txt", 0x20, 6, 50, 0);
        delete(&mut gone);
        write_records(&mut vol, off, &gone);

        let (entries, skipped) = list(vol, None);
        assert_eq!(skipped, 0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name(), "report.pdf");
        assert_eq!(entries[0].size(), 1000);
        assert!(!entries[0].is_deleted());
        let modified = entries[0].modified().unwrap();
        // Local 05:06:08 at UTC+1
        assert_eq!((modified.hour(), modified.minute()), (4, 6));

        assert_eq!(entries[1].name(), "a rather long deleted name.txt");
        assert!(entries[1].is_deleted());
        assert_eq!(entries[1].id(), (cluster_at(4) / 32 + 4) as u64);
    }

    #[test]
    fn bad_checksum_skips_only_that_set() {
        let mut vol = exfat_volume();
        let mut broken = entry_set("broken.bin", 0x20, 0, 10, 0);
        broken[2][2] ^= 0x01;
        let off = write_records(&mut vol, cluster_at(4), &broken);
        write_records(&mut vol, off, &entry_set("fine.bin", 0x20, 0, 10, 0));

        let (entries, skipped) = list(vol, None);
        assert_eq!(skipped, 1);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(), "fine.bin");
    }

    #[test]
    fn contiguous_subdirectory_is_walked_without_the_fat() {
        let mut vol = exfat_volume();
        let dir_len = 2 * CLUSTER as u64;
        write_records(
            &mut vol,
            cluster_at(4),
            &entry_set("photos", ATTR_DIRECTORY, 10, dir_len, FLAG_NO_FAT_CHAIN),
        );
        // Fill cluster 10 completely so the walk continues into cluster 11.
        let mut off = cluster_at(10);
        for i in 0..(CLUSTER / 96) {
            off = write_records(
                &mut vol,
                off,
                &entry_set(&format!("img{i:03}.jpg"), 0x20, 0, 1, 0),
            );
        }
        // 42 sets of 3 records leave 2 records of the cluster free; pad with benign types.
        let mut pad = [0u8; 32];
        pad[0] = 0xA0;
        write_records(&mut vol, off, &[pad, pad]);
        write_records(&mut vol, cluster_at(11), &entry_set("last.jpg", 0x20, 0, 1, 0));

        let (root, _) = list(vol.clone(), None);
        let photos = root[0].dir_ref().unwrap();
        assert_eq!(
            photos.location(),
            DirLocation::Cluster {
                first: 10,
                contiguous_len: Some(dir_len)
            }
        );

        let (entries, skipped) = list(vol, Some(photos.location()));
        assert_eq!(skipped, 0);
        assert_eq!(entries.len(), CLUSTER / 96 + 1);
        assert_eq!(entries.last().unwrap().name(), "last.jpg");
    }

    #[test]
    fn timestamps_apply_the_utc_offset() {
        let ts: u32 = (41 << 25) | (3 << 21) | (4 << 16) | (5 << 11) | (6 << 5) | 4;
        let local = exfat_datetime(ts, 150, 0).unwrap();
        assert_eq!((local.hour(), local.second()), (5, 9));
        assert_eq!(local.timestamp_subsec_millis(), 500);

        // -8 quarters: UTC-2
        let west = exfat_datetime(ts, 0, 0x80 | 0x78).unwrap();
        assert_eq!(west.hour(), 7);
        assert!(exfat_datetime(0, 0, 0).is_none());
    }
}

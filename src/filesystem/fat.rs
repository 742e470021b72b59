//! FAT volume structure and operations.
//!
//! This module implements the core functions to interact with a FAT12/16/32 volume:
//! - Reading and validating the BPB
//! - Following cluster chains through the File Allocation Table
//! - Walking directories, including released records and long file names
//! - Displaying the volume layout

use log::{debug, warn};
use std::collections::HashSet;
use std::fmt::Write as FmtWrite;
use std::sync::Arc;

use super::bpb::Bpb;
use super::dir_entry::{self, DirEntry, LfnEntry, DIR_ENTRY_SIZE};
use super::entry::{DirLocation, DirectoryEntry, FileKind};
use super::fat_type::FATType;
use super::fs_error::FsError;
use super::walker::{DirBlocks, EntryBatch};
use crate::error::InspectError;
use crate::image::VolumeView;
use crate::traits::LayoutDisplay;
use crate::utils::{u16_at, u32_at, utf16_to_string};

/// Structure for a FAT volume.
///
/// Essentially, it is a wrapper around the Bpb with byte offsets relative to the volume.
#[derive(Debug)]
pub struct FATVol {
    bpb: Bpb,
    len: u64,
}

impl FATVol {
    /// Reads the Bpb from the first sector of the volume and validates it.
    ///
    /// # Errors
    /// - Returns `FsError::Read` if the boot sector cannot be read
    /// - Returns various `FsError` variants if validation fails
    pub fn probe(view: &VolumeView<'_>, strict: bool) -> Result<FATVol, FsError> {
        let sector = view.read(0, 512)?;
        let bpb = Bpb::from_sector(&sector, strict, view.len())?;
        debug!(
            "{} BPB: {} clusters of {} bytes",
            bpb.fat_type(),
            bpb.cluster_count(),
            bpb.bytes_per_sec() as u32 * bpb.sec_per_clus() as u32
        );

        Ok(Self {
            bpb,
            len: view.len(),
        })
    }

    pub fn bpb(&self) -> &Bpb {
        &self.bpb
    }

    pub fn fat_type(&self) -> FATType {
        self.bpb.fat_type()
    }

    pub fn cluster_size(&self) -> u32 {
        self.bpb.bytes_per_sec() as u32 * self.bpb.sec_per_clus() as u32
    }

    /// Location of the root directory.
    pub fn root_location(&self) -> DirLocation {
        match self.fat_type() {
            FATType::FAT32 => DirLocation::Cluster {
                first: self.bpb.root_clus(),
                contiguous_len: None,
            },
            _ => DirLocation::FatRoot,
        }
    }

    /// Returns true for clusters that address the data region.
    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster - 2 < self.bpb.cluster_count()
    }

    /// Byte offset of a cluster from the start of the volume.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_start() + (cluster as u64 - 2) * self.cluster_size() as u64
    }

    /// Reads the FAT entry of `cluster` from the first FAT.
    pub fn fat_entry(&self, view: &VolumeView<'_>, cluster: u32) -> Result<u32, InspectError> {
        let fat_type = self.fat_type();
        let off = self.fat_start() + cluster as u64 * fat_type.entry_bits() as u64 / 8;
        let value = match fat_type {
            FATType::FAT12 => {
                let raw = u16_at(&view.read(off, 2)?, 0) as u32;
                if cluster & 1 == 1 { raw >> 4 } else { raw & 0x0FFF }
            }
            FATType::FAT16 => u16_at(&view.read(off, 2)?, 0) as u32,
            FATType::FAT32 => u32_at(&view.read(off, 4)?, 0) & 0x0FFF_FFFF,
        };
        Ok(value)
    }

    /// Returns a cursor over the directory at `location`.
    ///
    /// A `..` record pointing at the root stores cluster 0, which is mapped back to the root.
    pub(crate) fn open_dir(self: &Arc<Self>, location: DirLocation) -> FatDirCursor {
        let position = match location {
            DirLocation::FatRoot | DirLocation::Cluster { first: 0, .. } => {
                match self.root_location() {
                    DirLocation::Cluster { first, .. } => Position::Chain(Some(first)),
                    _ => Position::Root(self.root_start()),
                }
            }
            DirLocation::Cluster { first, .. } => Position::Chain(Some(first)),
            DirLocation::Inode(_) => Position::Done,
        };

        FatDirCursor {
            fs: Arc::clone(self),
            position,
            last_cluster: None,
            visited: HashSet::new(),
            block_offset: 0,
            lfn: LfnRun::default(),
            ended: false,
        }
    }

    /// Returns the starting byte of the first FAT.
    fn fat_start(&self) -> u64 {
        self.bpb.rsvd_sec_cnt() as u64 * self.bpb.bytes_per_sec() as u64
    }

    /// Returns the starting byte of the fixed root directory.
    fn root_start(&self) -> u64 {
        self.fat_start()
            + self.bpb.fat_sz() as u64 * self.bpb.num_fat() as u64 * self.bpb.bytes_per_sec() as u64
    }

    /// Returns the starting byte of the data region.
    pub fn data_start(&self) -> u64 {
        self.bpb.data_start_sector() * self.bpb.bytes_per_sec() as u64
    }

    /// Returns the ending byte of the data region.
    fn data_end(&self) -> u64 {
        self.data_start() + self.bpb.cluster_count() as u64 * self.cluster_size() as u64
    }
}

/// Implements the LayoutDisplay trait for FATVol
impl LayoutDisplay for FATVol {
    fn display_layout(&self, indent: u8) -> Result<String, std::fmt::Error> {
        let mut out = String::from("");
        let indent = " ".repeat(indent.into());
        let title = format!(" {} Volume Layout ", self.fat_type());

        writeln!(out, "{}┌{:─^55}┐", indent, title)?;
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

        let mut row = |region: &str, start: u64, end: u64, desc: &str| {
            writeln!(
                out,
                "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
                indent, region, start, end, desc
            )
        };

        row("Reserved", 0, self.fat_start(), "Boot + Reserved")?;
        let fat_len = self.bpb.fat_sz() as u64 * self.bpb.bytes_per_sec() as u64;
        for i in 0..self.bpb.num_fat() as u64 {
            let fat_i_start = self.fat_start() + i * fat_len;
            row(
                &format!("FAT #{}", i),
                fat_i_start,
                fat_i_start + fat_len,
                "FAT Tables",
            )?;
        }
        if self.fat_type() != FATType::FAT32 {
            row("Root Dir", self.root_start(), self.data_start(), "Root Directory")?;
        }
        row("Data", self.data_start(), self.data_end(), "Cluster Data")?;
        if self.data_end() < self.len {
            row("", self.data_end(), self.len, "Volume Slack")?;
        }

        writeln!(
            out,
            "{}└{:─<12}┴{:─<12}┴{:─<12}┴{:─<16}┘",
            indent, "", "", "", ""
        )?;

        Ok(out)
    }
}

/// Where the next directory block comes from.
#[derive(Debug, Clone, Copy)]
enum Position {
    /// Byte offset of the next block in the fixed root region.
    Root(u64),
    /// Next cluster of the chain, `None` once the chain ended.
    Chain(Option<u32>),
    Done,
}

/// Long name parts collected ahead of the short record they describe.
///
/// Parts are stored in on-disk order, i.e. from the last 13 characters to the first.
#[derive(Default)]
struct LfnRun {
    parts: Vec<[u16; 13]>,
    checksum: Option<u8>,
    deleted: bool,
}

impl LfnRun {
    fn clear(&mut self) {
        self.parts.clear();
        self.checksum = None;
        self.deleted = false;
    }

    fn push(&mut self, lfn: &LfnEntry, deleted: bool) {
        let starts_run = !deleted && lfn.is_last_part();
        let foreign = self.checksum.is_some_and(|c| c != lfn.checksum());
        if starts_run || foreign || self.deleted != deleted {
            self.clear();
        }
        self.deleted = deleted;
        self.checksum = Some(lfn.checksum());
        self.parts.push(lfn.units());
    }

    /// Assembles the long name if the run belongs to `entry`.
    fn name_for(&self, entry: &DirEntry) -> Option<String> {
        let checksum = self.checksum?;
        let expected = if entry.is_deleted() {
            // The first character of the short name is gone; take it from the long name.
            let first = self.parts.last().map(|p| p[0]).filter(|&u| u < 0x80)?;
            entry.lfn_checksum_with(Some((first as u8).to_ascii_uppercase()))
        } else {
            entry.lfn_checksum_with(None)
        };
        if checksum != expected {
            debug!("LFN run checksum 0x{checksum:02X} does not match 0x{expected:02X}");
            return None;
        }

        let units: Vec<u16> = self.parts.iter().rev().flatten().copied().collect();
        let name = utf16_to_string(&units);
        (!name.is_empty()).then_some(name)
    }
}

/// Cursor over the records of one FAT directory.
pub(crate) struct FatDirCursor {
    fs: Arc<FATVol>,
    position: Position,
    last_cluster: Option<u32>,
    visited: HashSet<u32>,
    block_offset: u64,
    lfn: LfnRun,
    ended: bool,
}

impl FatDirCursor {
    /// Resolves the cluster following the last one read.
    fn advance_chain(&mut self, view: &VolumeView<'_>) -> Result<(), InspectError> {
        let Some(last) = self.last_cluster.take() else {
            return Ok(());
        };

        let fat_type = self.fs.fat_type();
        let next = self.fs.fat_entry(view, last)?;
        self.position = if fat_type.is_eoc(next) {
            Position::Chain(None)
        } else if next == fat_type.bad_cluster_marker() || !self.fs.is_valid_cluster(next) {
            warn!("Cluster chain broken after cluster {last} (FAT entry 0x{next:X})");
            Position::Chain(None)
        } else {
            Position::Chain(Some(next))
        };
        Ok(())
    }

    fn decode_record(&mut self, record: &[u8], id: u64, batch: &mut EntryBatch) {
        if dir_entry::is_lfn_record(record) {
            match LfnEntry::from_slice(record) {
                Ok(lfn) if lfn.is_well_formed() => {
                    self.lfn.push(&lfn, record[0] == dir_entry::DELETED_MARKER)
                }
                _ => self.lfn.clear(),
            }
            return;
        }

        let entry = match DirEntry::from_slice(record) {
            Ok(entry) => entry,
            Err(err) => {
                self.lfn.clear();
                batch.skip(format!("record {id}: {err}"));
                return;
            }
        };

        if entry.is_dot_entry() || entry.is_volume_label() {
            self.lfn.clear();
            return;
        }

        if let Some(reason) = entry.corruption() {
            self.lfn.clear();
            batch.skip(format!("record {id}: {reason}"));
            return;
        }

        let cluster = entry.cluster_number();
        if !entry.is_deleted() && cluster != 0 && !self.fs.is_valid_cluster(cluster) {
            self.lfn.clear();
            batch.skip(format!("record {id}: first cluster {cluster} is out of range"));
            return;
        }

        let name = self
            .lfn
            .name_for(&entry)
            .unwrap_or_else(|| entry.short_name());
        self.lfn.clear();

        let location = if entry.is_dir() && (cluster == 0 || self.fs.is_valid_cluster(cluster)) {
            Some(DirLocation::Cluster {
                first: cluster,
                contiguous_len: None,
            })
        } else {
            None
        };

        batch.push(DirectoryEntry {
            name,
            id,
            size: if entry.is_dir() { 0 } else { entry.file_size() as u64 },
            created: entry.created(),
            modified: entry.modified(),
            accessed: entry.accessed(),
            changed: None,
            inode: None,
            kind: FileKind::from_directory_flag(entry.is_dir()),
            mode: entry.attr() as u32,
            is_dir: entry.is_dir(),
            is_deleted: entry.is_deleted(),
            volume: 0,
            location,
        });
    }
}

impl DirBlocks for FatDirCursor {
    fn next_block(&mut self, view: &VolumeView<'_>) -> Result<Option<Vec<u8>>, InspectError> {
        if self.ended {
            return Ok(None);
        }
        self.advance_chain(view)?;

        match self.position {
            Position::Root(offset) => {
                let root_end = self.fs.data_start();
                if offset >= root_end {
                    return Ok(None);
                }
                let len = (root_end - offset).min(self.fs.cluster_size() as u64);
                let block = view.read(offset, len as usize)?;
                self.block_offset = offset;
                self.position = Position::Root(offset + len);
                Ok(Some(block))
            }
            Position::Chain(Some(cluster)) => {
                if !self.fs.is_valid_cluster(cluster) {
                    warn!("Directory starts at invalid cluster {cluster}");
                    return Ok(None);
                }
                if !self.visited.insert(cluster) {
                    warn!("Cluster chain loops back on itself at cluster {cluster}");
                    return Ok(None);
                }

                let offset = self.fs.cluster_offset(cluster);
                let block = view.read(offset, self.fs.cluster_size() as usize)?;
                self.block_offset = offset;
                self.last_cluster = Some(cluster);
                Ok(Some(block))
            }
            Position::Chain(None) | Position::Done => Ok(None),
        }
    }

    fn decode_block(&mut self, _view: &VolumeView<'_>, block: &[u8], batch: &mut EntryBatch) {
        for (i, record) in block.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            if record[0] == 0x00 {
                self.ended = true;
                break;
            }
            let id = (self.block_offset + (i * DIR_ENTRY_SIZE) as u64) / DIR_ENTRY_SIZE as u64;
            self.decode_record(record, id, batch);
        }
    }
}

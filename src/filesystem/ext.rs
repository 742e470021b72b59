//! ext2/3/4 volume structure and directory walking.
//!
//! This module implements:
//! - Superblock parsing and validation
//! - Inode lookup through the block group descriptor table
//! - Directory block enumeration through the classic block map or the ext4 extent tree
//! - Recovery of released directory records from `rec_len` slack

use binread::{BinRead, BinReaderExt};
use chrono::{DateTime, Utc};
use getset::CopyGetters;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as FmtWrite;
use std::io::{self, SeekFrom};
use std::sync::Arc;

use super::entry::{DirLocation, DirectoryEntry, FileKind};
use super::fs_error::FsError;
use super::walker::{DirBlocks, EntryBatch};
use crate::error::InspectError;
use crate::image::VolumeView;
use crate::traits::LayoutDisplay;
use crate::utils::{u16_at, u32_at, u8_at};

pub const EXT_MAGIC: u16 = 0xEF53;
pub const ROOT_INODE: u64 = 2;
const SUPERBLOCK_OFFSET: u64 = 1024;

const INCOMPAT_COMPRESSION: u32 = 0x0001;
const INCOMPAT_FILETYPE: u32 = 0x0002;
const INCOMPAT_META_BG: u32 = 0x0010;
const INCOMPAT_64BIT: u32 = 0x0080;

const EXTENTS_FL: u32 = 0x0008_0000;
const INLINE_DATA_FL: u32 = 0x1000_0000;
const EXTENT_MAGIC: u16 = 0xF30A;
const MAX_EXTENT_DEPTH: u16 = 5;
const UNINIT_EXTENT_LEN: u16 = 32768;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const FT_MAX: u8 = 7;

/// ext superblock, found 1024 bytes into the volume.
#[derive(BinRead, Debug, Clone, CopyGetters)]
#[br(little)]
#[getset(get_copy = "pub")]
pub struct Superblock {
    s_inodes_count: u32,
    s_blocks_count_lo: u32,
    s_r_blocks_count_lo: u32,
    s_free_blocks_count_lo: u32,
    s_free_inodes_count: u32,
    s_first_data_block: u32,
    s_log_block_size: u32,
    s_log_cluster_size: u32,
    s_blocks_per_group: u32,
    s_clusters_per_group: u32,
    s_inodes_per_group: u32,
    s_mtime: u32,
    s_wtime: u32,
    s_mnt_count: u16,
    s_max_mnt_count: u16,
    s_magic: u16,
    s_state: u16,
    s_errors: u16,
    s_minor_rev_level: u16,
    s_lastcheck: u32,
    s_checkinterval: u32,
    s_creator_os: u32,
    s_rev_level: u32,
    s_def_resuid: u16,
    s_def_resgid: u16,
    s_first_ino: u32,
    s_inode_size: u16,
    s_block_group_nr: u16,
    s_feature_compat: u32,
    s_feature_incompat: u32,
    s_feature_ro_compat: u32,
    s_uuid: [u8; 16],
    s_volume_name: [u8; 16],
    #[br(pad_before = 118)]
    s_desc_size: u16,
    #[br(seek_before = SeekFrom::Start(0x150))]
    s_blocks_count_hi: u32,
}

impl Superblock {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, FsError> {
        let mut reader = io::Cursor::new(buf);
        Ok(reader.read_le()?)
    }

    pub fn block_size(&self) -> u64 {
        1024 << self.s_log_block_size
    }

    pub fn blocks_count(&self) -> u64 {
        let hi = if self.is_64bit() {
            self.s_blocks_count_hi as u64
        } else {
            0
        };
        (hi << 32) | self.s_blocks_count_lo as u64
    }

    pub fn is_64bit(&self) -> bool {
        self.s_feature_incompat & INCOMPAT_64BIT != 0
    }

    pub fn has_filetype(&self) -> bool {
        self.s_feature_incompat & INCOMPAT_FILETYPE != 0
    }

    pub fn inode_size(&self) -> u64 {
        if self.s_rev_level == 0 {
            128
        } else {
            self.s_inode_size as u64
        }
    }

    pub fn desc_size(&self) -> u64 {
        if self.is_64bit() && self.s_desc_size >= 64 {
            self.s_desc_size as u64
        } else {
            32
        }
    }

    pub fn group_count(&self) -> u64 {
        let data_blocks = self.blocks_count() - self.s_first_data_block as u64;
        data_blocks.div_ceil(self.s_blocks_per_group as u64)
    }

    pub fn volume_label(&self) -> String {
        let end = self.s_volume_name.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.s_volume_name[..end]).into_owned()
    }

    fn validate(&self, strict: bool, volume_len: u64) -> Result<(), FsError> {
        if self.s_magic != EXT_MAGIC {
            return Err(FsError::BadMagic {
                expected: format!("0x{EXT_MAGIC:04X}"),
                found: format!("0x{:04X}", self.s_magic),
            });
        }
        if self.s_log_block_size > 6 {
            return Err(FsError::InvalidField {
                field: "log block size",
                value: self.s_log_block_size.into(),
            });
        }
        if self.s_inodes_per_group == 0 || self.s_blocks_per_group == 0 {
            return Err(FsError::InvalidField {
                field: "group size",
                value: 0,
            });
        }
        if self.blocks_count() <= self.s_first_data_block as u64 {
            return Err(FsError::InvalidField {
                field: "block count",
                value: self.blocks_count(),
            });
        }
        let inode_size = self.inode_size();
        if inode_size < 128 || !inode_size.is_power_of_two() || inode_size > self.block_size() {
            return Err(FsError::InvalidField {
                field: "inode size",
                value: inode_size,
            });
        }
        if self.s_inodes_count < ROOT_INODE as u32 {
            return Err(FsError::InvalidField {
                field: "inode count",
                value: self.s_inodes_count.into(),
            });
        }
        if self.s_feature_incompat & INCOMPAT_COMPRESSION != 0 {
            return Err(FsError::UnsupportedFeature(String::from("compression")));
        }
        if self.s_feature_incompat & INCOMPAT_META_BG != 0 {
            warn!("meta_bg layout: group descriptors past the first meta group may be misread");
        }

        if strict {
            let declared = self.blocks_count().saturating_mul(self.block_size());
            if declared > volume_len {
                return Err(FsError::InvalidTotSec(format!(
                    "{declared} bytes declared on a {volume_len}-byte volume"
                )));
            }
        }
        Ok(())
    }
}

/// The fixed 128-byte part of an inode.
#[derive(BinRead, Debug, Clone, CopyGetters)]
#[br(little)]
#[getset(get_copy = "pub")]
pub struct Inode {
    i_mode: u16,
    i_uid: u16,
    i_size_lo: u32,
    i_atime: u32,
    i_ctime: u32,
    i_mtime: u32,
    i_dtime: u32,
    i_gid: u16,
    i_links_count: u16,
    i_blocks_lo: u32,
    i_flags: u32,
    i_osd1: u32,
    i_block: [u32; 15],
    i_generation: u32,
    i_file_acl_lo: u32,
    i_size_high: u32,

    /// Extra timestamp fields, present on large inodes.
    #[br(ignore)]
    #[getset(skip)]
    extra: Option<InodeExtra>,
}

/// Timestamp fields stored past the first 128 bytes of a large inode.
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeExtra {
    ctime_extra: Option<u32>,
    mtime_extra: Option<u32>,
    atime_extra: Option<u32>,
    crtime: Option<u32>,
    crtime_extra: Option<u32>,
}

impl Inode {
    fn from_bytes(buf: &[u8]) -> Result<Self, FsError> {
        let mut reader = io::Cursor::new(buf);
        let mut inode: Inode = reader.read_le()?;

        if buf.len() > 128 {
            let extra_isize = u16_at(buf, 128) as usize;
            let field = |offset: usize| {
                (offset + 4 <= 128 + extra_isize && offset + 4 <= buf.len())
                    .then(|| u32_at(buf, offset))
            };
            inode.extra = Some(InodeExtra {
                ctime_extra: field(0x84),
                mtime_extra: field(0x88),
                atime_extra: field(0x8C),
                crtime: field(0x90),
                crtime_extra: field(0x94),
            });
        }
        Ok(inode)
    }

    pub fn is_dir(&self) -> bool {
        self.i_mode & S_IFMT == S_IFDIR
    }

    pub fn size(&self) -> u64 {
        if self.is_dir() {
            self.i_size_lo as u64
        } else {
            ((self.i_size_high as u64) << 32) | self.i_size_lo as u64
        }
    }

    fn extra_times(&self) -> InodeExtra {
        self.extra.unwrap_or_default()
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        ext_time(self.i_mtime, self.extra_times().mtime_extra)
    }

    pub fn accessed(&self) -> Option<DateTime<Utc>> {
        ext_time(self.i_atime, self.extra_times().atime_extra)
    }

    pub fn changed(&self) -> Option<DateTime<Utc>> {
        ext_time(self.i_ctime, self.extra_times().ctime_extra)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        ext_time(self.extra_times().crtime?, self.extra_times().crtime_extra)
    }

    /// The raw 60 bytes of `i_block`, where the extent tree root lives.
    fn block_bytes(&self) -> Vec<u8> {
        self.i_block.iter().flat_map(|b| b.to_le_bytes()).collect()
    }
}

/// Seconds since the epoch, widened by the two epoch bits of the `_extra` field.
fn ext_time(seconds: u32, extra: Option<u32>) -> Option<DateTime<Utc>> {
    if seconds == 0 && extra.unwrap_or(0) == 0 {
        return None;
    }
    let extra = extra.unwrap_or(0);
    let secs = seconds as i32 as i64 + (((extra & 0x3) as i64) << 32);
    DateTime::from_timestamp(secs, extra >> 2)
}

/// Structure for an ext2/3/4 volume.
#[derive(Debug)]
pub struct ExtVol {
    sb: Superblock,
    len: u64,
}

impl ExtVol {
    /// Reads the superblock and validates it.
    ///
    /// # Errors
    /// - `FsError::BadMagic` if the magic number is not 0xEF53
    /// - `FsError::InvalidField` / `FsError::UnsupportedFeature` for unusable layouts
    pub fn probe(view: &VolumeView<'_>, strict: bool) -> Result<ExtVol, FsError> {
        let buf = view.read(SUPERBLOCK_OFFSET, 1024)?;
        let sb = Superblock::from_bytes(&buf)?;
        sb.validate(strict, view.len())?;
        debug!(
            "ext superblock: {} blocks of {} bytes, {} inodes, incompat 0x{:X}",
            sb.blocks_count(),
            sb.block_size(),
            sb.s_inodes_count,
            sb.s_feature_incompat
        );
        Ok(Self {
            sb,
            len: view.len(),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn block_size(&self) -> u64 {
        self.sb.block_size()
    }

    pub fn root_location(&self) -> DirLocation {
        DirLocation::Inode(ROOT_INODE)
    }

    fn is_valid_inode(&self, ino: u64) -> bool {
        ino >= 1 && ino <= self.sb.s_inodes_count as u64
    }

    /// Byte offset of a block, rejecting numbers past the end of the filesystem.
    fn block_offset(&self, block: u64) -> Result<u64, InspectError> {
        if block >= self.sb.blocks_count() {
            return Err(InspectError::CorruptEntry(format!(
                "block {block} is past the end of the filesystem"
            )));
        }
        block.checked_mul(self.block_size()).ok_or_else(|| {
            InspectError::CorruptEntry(format!("block {block} is out of addressable range"))
        })
    }

    fn read_block(&self, view: &VolumeView<'_>, block: u64) -> Result<Vec<u8>, InspectError> {
        view.read(self.block_offset(block)?, self.block_size() as usize)
    }

    /// Reads the descriptor of a block group, returning `(inode bitmap, inode table)`.
    fn group_descriptor(
        &self,
        view: &VolumeView<'_>,
        group: u64,
    ) -> Result<(u64, u64), InspectError> {
        let gdt = (self.sb.s_first_data_block as u64 + 1) * self.block_size();
        let size = self.sb.desc_size();
        let buf = view.read(gdt + group * size, size as usize)?;

        let mut inode_bitmap = u32_at(&buf, 0x04) as u64;
        let mut inode_table = u32_at(&buf, 0x08) as u64;
        if size >= 64 {
            inode_bitmap |= (u32_at(&buf, 0x24) as u64) << 32;
            inode_table |= (u32_at(&buf, 0x28) as u64) << 32;
        }
        Ok((inode_bitmap, inode_table))
    }

    /// Reads an inode by number.
    pub fn inode(&self, view: &VolumeView<'_>, ino: u64) -> Result<Inode, InspectError> {
        if !self.is_valid_inode(ino) {
            return Err(InspectError::CorruptEntry(format!("inode {ino} is out of range")));
        }
        let ipg = self.sb.s_inodes_per_group as u64;
        let (_, table) = self.group_descriptor(view, (ino - 1) / ipg)?;
        let isz = self.sb.inode_size();
        let offset = self.block_offset(table)? + ((ino - 1) % ipg) * isz;
        Ok(Inode::from_bytes(&view.read(offset, isz as usize)?)?)
    }

    /// Lists the data blocks of a directory inode, in logical order.
    fn dir_blocks(&self, view: &VolumeView<'_>, inode: &Inode) -> Result<Vec<u64>, InspectError> {
        let wanted = inode.size().div_ceil(self.block_size()) as usize;

        if inode.i_flags & INLINE_DATA_FL != 0 {
            warn!("Directory stored as inline data is not walked");
            return Ok(vec![]);
        }

        let mut blocks = if inode.i_flags & EXTENTS_FL != 0 {
            let mut runs = vec![];
            self.collect_extents(view, &inode.block_bytes(), MAX_EXTENT_DEPTH, &mut runs)?;
            runs.sort_by_key(|&(logical, _, _)| logical);
            runs.into_iter()
                .flat_map(|(_, start, len)| start..start + len)
                .collect()
        } else {
            let mut blocks = vec![];
            for &b in inode.i_block.iter().take(12) {
                if b != 0 {
                    blocks.push(b as u64);
                }
            }
            for (level, &b) in inode.i_block[12..].iter().enumerate() {
                if blocks.len() >= wanted {
                    break;
                }
                if b != 0 {
                    self.collect_indirect(view, b as u64, level as u32 + 1, wanted, &mut blocks)?;
                }
            }
            blocks
        };
        blocks.truncate(wanted);
        Ok(blocks)
    }

    fn collect_indirect(
        &self,
        view: &VolumeView<'_>,
        block: u64,
        level: u32,
        wanted: usize,
        out: &mut Vec<u64>,
    ) -> Result<(), InspectError> {
        let pointers = self.read_block(view, block)?;
        for chunk in pointers.chunks_exact(4) {
            if out.len() >= wanted {
                break;
            }
            let ptr = u32_at(chunk, 0) as u64;
            if ptr == 0 {
                continue;
            }
            if level == 1 {
                out.push(ptr);
            } else {
                self.collect_indirect(view, ptr, level - 1, wanted, out)?;
            }
        }
        Ok(())
    }

    /// Walks an extent node, collecting `(logical block, physical block, length)` runs.
    fn collect_extents(
        &self,
        view: &VolumeView<'_>,
        node: &[u8],
        depth_budget: u16,
        out: &mut Vec<(u64, u64, u64)>,
    ) -> Result<(), InspectError> {
        let magic = u16_at(node, 0);
        if magic != EXTENT_MAGIC {
            return Err(InspectError::CorruptEntry(format!(
                "bad extent header magic 0x{magic:04X}"
            )));
        }
        let entries = u16_at(node, 2) as usize;
        let depth = u16_at(node, 6);
        if depth >= depth_budget {
            return Err(InspectError::CorruptEntry(format!(
                "extent tree deeper than {MAX_EXTENT_DEPTH} levels"
            )));
        }

        for i in 0..entries {
            let e = 12 + i * 12;
            if e + 12 > node.len() {
                break;
            }
            if depth == 0 {
                let logical = u32_at(node, e) as u64;
                let mut len = u16_at(node, e + 4);
                let start = ((u16_at(node, e + 6) as u64) << 32) | u32_at(node, e + 8) as u64;
                if len > UNINIT_EXTENT_LEN {
                    // Preallocated but never written.
                    len -= UNINIT_EXTENT_LEN;
                    debug!("Skipping uninitialized extent of {len} blocks at {start}");
                    continue;
                }
                out.push((logical, start, len as u64));
            } else {
                let leaf = ((u16_at(node, e + 8) as u64) << 32) | u32_at(node, e + 4) as u64;
                let child = self.read_block(view, leaf)?;
                self.collect_extents(view, &child, depth, out)?;
            }
        }
        Ok(())
    }

    pub(crate) fn open_dir(self: &Arc<Self>, location: DirLocation) -> ExtDirCursor {
        let ino = match location {
            DirLocation::Inode(ino) => ino,
            _ => ROOT_INODE,
        };
        ExtDirCursor {
            fs: Arc::clone(self),
            ino,
            blocks: None,
            current_block: 0,
            bitmaps: HashMap::new(),
        }
    }
}

impl LayoutDisplay for ExtVol {
    fn display_layout(&self, indent: u8) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        let indent = " ".repeat(indent.into());
        let bs = self.block_size();
        let gdt = (self.sb.s_first_data_block as u64 + 1) * bs;
        let gdt_end = gdt + self.sb.group_count() * self.sb.desc_size();
        let fs_end = self.sb.blocks_count() * bs;

        writeln!(out, "{}┌{:─^55}┐", indent, " ext Volume Layout ")?;
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
        writeln!(
            out,
            "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
            indent, "Superblock", SUPERBLOCK_OFFSET, SUPERBLOCK_OFFSET + 1024, "Superblock"
        )?;
        writeln!(
            out,
            "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
            indent, "GDT", gdt, gdt_end, "Group Desc."
        )?;
        writeln!(
            out,
            "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
            indent,
            "Groups",
            gdt_end,
            fs_end,
            format!("{} block groups", self.sb.group_count())
        )?;
        if fs_end < self.len {
            writeln!(
                out,
                "{}│{:<12}│{:<12}│{:<12}│{:<16}│",
                indent, "", fs_end, self.len, "Volume Slack"
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

/// One directory record as laid out on disk.
struct RawRecord<'a> {
    inode: u64,
    rec_len: usize,
    file_type: Option<u8>,
    name: &'a [u8],
}

impl RawRecord<'_> {
    /// Space the record actually needs, rounded up to 4 bytes.
    fn used_len(&self) -> usize {
        (8 + self.name.len()).next_multiple_of(4)
    }

    fn is_dot_entry(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

/// Decodes the record header at `off`, without validating it.
fn raw_record(block: &[u8], off: usize, filetype: bool) -> Option<RawRecord<'_>> {
    if off + 8 > block.len() {
        return None;
    }
    let inode = u32_at(block, off) as u64;
    let rec_len = u16_at(block, off + 4) as usize;
    let (name_len, file_type) = if filetype {
        (u8_at(block, off + 6) as usize, Some(u8_at(block, off + 7)))
    } else {
        (u16_at(block, off + 6) as usize, None)
    };
    let name = block.get(off + 8..off + 8 + name_len)?;
    Some(RawRecord {
        inode,
        rec_len,
        file_type,
        name,
    })
}

/// Cursor over the records of one ext directory.
pub(crate) struct ExtDirCursor {
    fs: Arc<ExtVol>,
    ino: u64,
    blocks: Option<VecDeque<u64>>,
    /// Block most recently handed out by `next_block`.
    current_block: u64,
    /// Inode bitmaps already read, by block group.
    bitmaps: HashMap<u64, Vec<u8>>,
}

impl ExtDirCursor {
    /// Returns true if the inode bitmap marks `ino` as in use.
    fn inode_allocated(&mut self, view: &VolumeView<'_>, ino: u64) -> Result<bool, InspectError> {
        let ipg = self.fs.sb.s_inodes_per_group as u64;
        let group = (ino - 1) / ipg;
        if !self.bitmaps.contains_key(&group) {
            let (bitmap_block, _) = self.fs.group_descriptor(view, group)?;
            let bitmap = self.fs.read_block(view, bitmap_block)?;
            self.bitmaps.insert(group, bitmap);
        }
        let bit = ((ino - 1) % ipg) as usize;
        Ok(self
            .bitmaps
            .get(&group)
            .and_then(|bitmap| bitmap.get(bit / 8))
            .is_some_and(|byte| byte & (1 << (bit % 8)) != 0))
    }

    fn make_entry(
        &mut self,
        view: &VolumeView<'_>,
        record: &RawRecord<'_>,
        offset: usize,
        released: bool,
    ) -> Result<DirectoryEntry, InspectError> {
        let inode = self.fs.inode(view, record.inode)?;
        let is_deleted = released || !self.inode_allocated(view, record.inode)?;
        let kind = match record.file_type {
            Some(ft) if ft != 0 => FileKind::from_ext_file_type(ft),
            _ => FileKind::from_ext_mode(inode.i_mode()),
        };
        let is_dir = kind == FileKind::Directory;

        Ok(DirectoryEntry {
            name: String::from_utf8_lossy(record.name).into_owned(),
            id: self.current_block * self.fs.block_size() + offset as u64,
            inode: Some(record.inode),
            kind,
            mode: inode.i_mode() as u32,
            size: inode.size(),
            created: inode.created(),
            modified: inode.modified(),
            accessed: inode.accessed(),
            changed: inode.changed(),
            is_dir,
            is_deleted,
            volume: 0,
            location: is_dir.then_some(DirLocation::Inode(record.inode)),
        })
    }

    /// Looks for released records in the unused tail of a live record.
    fn scan_slack(
        &mut self,
        view: &VolumeView<'_>,
        block: &[u8],
        start: usize,
        end: usize,
        batch: &mut EntryBatch,
    ) {
        let filetype = self.fs.sb.has_filetype();
        let mut off = start;
        while off + 8 <= end {
            let candidate = raw_record(block, off, filetype).filter(|r| {
                self.fs.is_valid_inode(r.inode)
                    && !r.name.is_empty()
                    && off + 8 + r.name.len() <= end
                    && r.rec_len >= r.used_len()
                    && r.rec_len % 4 == 0
                    && r.file_type.is_none_or(|ft| (1..=FT_MAX).contains(&ft))
                    && r.name.iter().all(|&b| b >= 0x20 && b != b'/' && b != 0x7F)
                    && !r.is_dot_entry()
            });

            match candidate {
                Some(record) => {
                    match self.make_entry(view, &record, off, true) {
                        Ok(entry) => batch.push(entry),
                        Err(err) => debug!("Released record at offset {off} unreadable: {err}"),
                    }
                    off += record.used_len();
                }
                None => off += 4,
            }
        }
    }
}

impl DirBlocks for ExtDirCursor {
    fn next_block(&mut self, view: &VolumeView<'_>) -> Result<Option<Vec<u8>>, InspectError> {
        if self.blocks.is_none() {
            let inode = self.fs.inode(view, self.ino)?;
            if !inode.is_dir() {
                return Err(InspectError::NotADirectory(format!("inode {}", self.ino)));
            }
            self.blocks = Some(self.fs.dir_blocks(view, &inode)?.into());
        }

        match self.blocks.as_mut().and_then(|b| b.pop_front()) {
            Some(block) => {
                self.current_block = block;
                Ok(Some(self.fs.read_block(view, block)?))
            }
            None => Ok(None),
        }
    }

    fn decode_block(&mut self, view: &VolumeView<'_>, block: &[u8], batch: &mut EntryBatch) {
        let filetype = self.fs.sb.has_filetype();
        let mut off = 0;

        while off + 8 <= block.len() {
            let Some(record) = raw_record(block, off, filetype) else {
                batch.skip(format!("inode {}: record at {off} overruns the block", self.ino));
                break;
            };
            let rec_len = record.rec_len;
            if rec_len < 8
                || rec_len % 4 != 0
                || off + rec_len > block.len()
                || rec_len < 8 + record.name.len()
            {
                batch.skip(format!(
                    "inode {}: bad rec_len {rec_len} at offset {off}",
                    self.ino
                ));
                break;
            }

            if record.inode != 0 && !record.is_dot_entry() {
                match self.make_entry(view, &record, off, false) {
                    Ok(entry) => batch.push(entry),
                    Err(err) => batch.skip(format!("inode {}: {err}", record.inode)),
                }
            }

            let used = if record.inode == 0 { 8 } else { record.used_len() };
            if used < rec_len {
                self.scan_slack(view, block, off + used, off + rec_len, batch);
            }
            off += rec_len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageSource;
    use std::io::Cursor;

    const BS: usize = 1024;
    const VOL_LEN: usize = 1024 * BS;

    /// 1 MiB ext2-style volume with 1 KiB blocks, one group of 32 inodes.
    ///
    /// Block 3 holds the block bitmap, block 4 the inode bitmap, blocks 5-8 the inode table,
    /// block 9 the root directory.
    struct ExtImage {
        data: Vec<u8>,
    }

    impl ExtImage {
        fn new(incompat: u32) -> Self {
            let mut data = vec![0u8; VOL_LEN];
            let sb = &mut data[1024..2048];
            sb[0..4].copy_from_slice(&32u32.to_le_bytes());
            sb[4..8].copy_from_slice(&1024u32.to_le_bytes());
            sb[20..24].copy_from_slice(&1u32.to_le_bytes());
            sb[32..36].copy_from_slice(&8192u32.to_le_bytes());
            sb[40..44].copy_from_slice(&32u32.to_le_bytes());
            sb[56..58].copy_from_slice(&EXT_MAGIC.to_le_bytes());
            sb[76..80].copy_from_slice(&1u32.to_le_bytes());
            sb[88..90].copy_from_slice(&128u16.to_le_bytes());
            sb[96..100].copy_from_slice(&(INCOMPAT_FILETYPE | incompat).to_le_bytes());

            let gd = &mut data[2048..2080];
            gd[0..4].copy_from_slice(&3u32.to_le_bytes());
            gd[4..8].copy_from_slice(&4u32.to_le_bytes());
            gd[8..12].copy_from_slice(&5u32.to_le_bytes());

            let mut image = Self { data };
            image.inode(ROOT_INODE, S_IFDIR | 0o755, 1024, &[9], 0);
            image
        }

        fn inode(&mut self, ino: u64, mode: u16, size: u32, blocks: &[u32], flags: u32) {
            let off = 5 * BS + (ino as usize - 1) * 128;
            let raw = &mut self.data[off..off + 128];
            raw[0..2].copy_from_slice(&mode.to_le_bytes());
            raw[4..8].copy_from_slice(&size.to_le_bytes());
            raw[16..20].copy_from_slice(&1_600_000_000u32.to_le_bytes());
            raw[26..28].copy_from_slice(&1u16.to_le_bytes());
            raw[32..36].copy_from_slice(&flags.to_le_bytes());
            for (i, b) in blocks.iter().enumerate() {
                raw[40 + i * 4..44 + i * 4].copy_from_slice(&b.to_le_bytes());
            }
            self.mark(ino);
        }

        fn mark(&mut self, ino: u64) {
            let bit = ino as usize - 1;
            self.data[4 * BS + bit / 8] |= 1 << (bit % 8);
        }

        fn unmark(&mut self, ino: u64) {
            let bit = ino as usize - 1;
            self.data[4 * BS + bit / 8] &= !(1 << (bit % 8));
        }

        /// Writes `(inode, rec_len, type, name)` records into `block`.
        fn records(&mut self, block: usize, records: &[(u32, u16, u8, &str)]) {
            let mut off = block * BS;
            for &(ino, rec_len, ft, name) in records {
                let rec = &mut self.data[off..off + 8 + name.len()];
                rec[0..4].copy_from_slice(&ino.to_le_bytes());
                rec[4..6].copy_from_slice(&rec_len.to_le_bytes());
                rec[6] = name.len() as u8;
                rec[7] = ft;
                rec[8..].copy_from_slice(name.as_bytes());
                off += rec_len as usize;
            }
        }

        /// Writes a record at an absolute offset, leaving surrounding bytes alone.
        fn record_at(&mut self, off: usize, ino: u32, rec_len: u16, ft: u8, name: &str) {
            let rec = &mut self.data[off..off + 8 + name.len()];
            rec[0..4].copy_from_slice(&ino.to_le_bytes());
            rec[4..6].copy_from_slice(&rec_len.to_le_bytes());
            rec[6] = name.len() as u8;
            rec[7] = ft;
            rec[8..].copy_from_slice(name.as_bytes());
        }

        fn list(self, location: DirLocation) -> (Vec<DirectoryEntry>, usize) {
            let image = ImageSource::from_source(Cursor::new(self.data), "mem").unwrap();
            let view = VolumeView::new(&image, 0, VOL_LEN as u64);
            let fs = Arc::new(ExtVol::probe(&view, true).unwrap());
            let mut cursor = fs.open_dir(location);

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
    }

    fn names(entries: &[DirectoryEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name().as_str()).collect()
    }

    #[test]
    fn root_listing_recovers_slack_records() {
        let mut img = ExtImage::new(0);
        img.inode(12, 0o100644, 100, &[20], 0);
        img.inode(13, 0o100644, 50, &[21], 0);
        img.unmark(13);
        // "a.txt" used to end at 40; its rec_len was extended over "b.txt" on deletion.
        img.records(9, &[(2, 12, 2, "."), (2, 12, 2, ".."), (12, 1000, 1, "a.txt")]);
        img.record_at(9 * BS + 40, 13, 984, 1, "b.txt");

        let (entries, skipped) = img.list(DirLocation::Inode(ROOT_INODE));
        assert_eq!(skipped, 0);
        assert_eq!(names(&entries), ["a.txt", "b.txt"]);
        assert_eq!((entries[0].inode(), entries[0].size()), (Some(12), 100));
        assert_eq!(entries[0].id(), (9 * BS + 24) as u64);
        assert_eq!(entries[0].kind(), FileKind::Regular);
        assert_eq!(entries[0].mode(), 0o100644);
        assert!(!entries[0].is_deleted());
        assert_eq!((entries[1].inode(), entries[1].size()), (Some(13), 50));
        assert_eq!(entries[1].id(), (9 * BS + 40) as u64);
        assert!(entries[1].is_deleted());
        assert_eq!(
            entries[0].modified().unwrap().timestamp(),
            1_600_000_000
        );
    }

    #[test]
    fn hard_links_in_one_directory_are_all_listed() {
        let mut img = ExtImage::new(0);
        img.inode(12, 0o100644, 10, &[], 0);
        img.inode(13, 0o100644, 20, &[], 0);
        img.inode(14, 0o120777, 5, &[], 0);
        img.records(
            9,
            &[
                (2, 12, 2, "."),
                (2, 12, 2, ".."),
                (12, 16, 1, "a.txt"),
                (12, 16, 1, "link.txt"),
                (13, 16, 1, "c.txt"),
                (14, 952, 7, "current"),
            ],
        );

        let (entries, skipped) = img.list(DirLocation::Inode(ROOT_INODE));
        assert_eq!(skipped, 0);
        assert_eq!(names(&entries), ["a.txt", "link.txt", "c.txt", "current"]);
        assert_eq!(entries[0].inode(), entries[1].inode());
        assert_ne!(entries[0].id(), entries[1].id());
        assert_eq!(entries[3].kind(), FileKind::Symlink);
        assert!(!entries[3].is_dir());
    }

    #[test]
    fn inode_table_past_the_end_is_an_error() {
        let mut img = ExtImage::new(0);
        img.data[2048 + 8..2048 + 12].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        let image = ImageSource::from_source(Cursor::new(img.data), "mem").unwrap();
        let view = VolumeView::new(&image, 0, VOL_LEN as u64);
        let fs = ExtVol::probe(&view, true).unwrap();
        assert!(matches!(
            fs.inode(&view, ROOT_INODE),
            Err(InspectError::CorruptEntry(_))
        ));
    }

    #[test]
    fn extent_directory_is_reachable_from_root() {
        let mut img = ExtImage::new(0x40);
        // Extent header with one leaf covering block 10.
        let mut root = [0u32; 15];
        root[0] = (EXTENT_MAGIC as u32) | (1 << 16);
        root[1] = 4;
        root[3] = 0;
        root[4] = 1;
        root[5] = 10;
        img.inode(14, S_IFDIR | 0o755, 1024, &root, EXTENTS_FL);
        img.inode(15, 0o100644, 7, &[], 0);
        img.inode(16, 0o100644, 9, &[], 0);
        img.unmark(16);

        img.records(
            9,
            &[(2, 12, 2, "."), (2, 12, 2, ".."), (14, 1000, 2, "docs")],
        );
        img.records(
            10,
            &[(14, 12, 2, "."), (2, 12, 2, ".."), (15, 16, 1, "notes.md"), (16, 984, 1, "ghost.log")],
        );

        let (root_entries, _) = img.list(DirLocation::Inode(ROOT_INODE));
        assert_eq!(names(&root_entries), ["docs"]);
        assert!(root_entries[0].is_dir());
        assert_eq!(
            root_entries[0].dir_ref().unwrap().location(),
            DirLocation::Inode(14)
        );
    }

    #[test]
    fn extent_subdirectory_lists_children() {
        let mut img = ExtImage::new(0x40);
        let mut root = [0u32; 15];
        root[0] = (EXTENT_MAGIC as u32) | (1 << 16);
        root[1] = 4;
        root[4] = 1;
        root[5] = 10;
        img.inode(14, S_IFDIR | 0o755, 1024, &root, EXTENTS_FL);
        img.inode(15, 0o100644, 7, &[], 0);
        img.inode(16, 0o100644, 9, &[], 0);
        img.unmark(16);
        img.records(
            10,
            &[(14, 12, 2, "."), (2, 12, 2, ".."), (15, 16, 1, "notes.md"), (16, 984, 1, "ghost.log")],
        );

        let (entries, skipped) = img.list(DirLocation::Inode(14));
        assert_eq!(skipped, 0);
        assert_eq!(names(&entries), ["notes.md", "ghost.log"]);
        assert!(!entries[0].is_deleted());
        // Listed by a live record, but the inode bitmap says the inode is free.
        assert!(entries[1].is_deleted());
    }

    #[test]
    fn bad_rec_len_skips_the_rest_of_the_block() {
        let mut img = ExtImage::new(0);
        img.inode(12, 0o100644, 1, &[], 0);
        img.records(9, &[(2, 12, 2, "."), (2, 12, 2, ".."), (12, 16, 1, "ok.txt"), (12, 6, 1, "x")]);

        let (entries, skipped) = img.list(DirLocation::Inode(ROOT_INODE));
        assert_eq!(names(&entries), ["ok.txt"]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut img = ExtImage::new(0);
        img.data[1024 + 56] = 0;
        let image = ImageSource::from_source(Cursor::new(img.data), "mem").unwrap();
        let view = VolumeView::new(&image, 0, VOL_LEN as u64);
        assert!(matches!(
            ExtVol::probe(&view, true),
            Err(FsError::BadMagic { .. })
        ));
    }

    #[test]
    fn extra_timestamp_bits_extend_the_epoch() {
        let t = ext_time(0x7FFF_FFFF, Some(0x1 | (500 << 2))).unwrap();
        assert_eq!(t.timestamp(), 0x7FFF_FFFF + (1 << 32));
        assert_eq!(t.timestamp_subsec_nanos(), 500);
        assert!(ext_time(0, None).is_none());
    }
}

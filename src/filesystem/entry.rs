//! Common directory entry shape shared by every filesystem driver.
//!
//! Drivers decode their own on-disk records and hand back [`DirectoryEntry`] snapshots;
//! callers never see driver-specific structures.

use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use std::fmt;

/// Where a directory's records live, in driver terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirLocation {
    /// The fixed root directory region of FAT12/16 volumes.
    FatRoot,
    /// First cluster of a FAT or exFAT directory.
    ///
    /// `contiguous_len` is set for exFAT directories flagged as not using the FAT: their
    /// clusters are consecutive and the length bounds the walk.
    Cluster {
        first: u32,
        contiguous_len: Option<u64>,
    },
    /// Inode number of an ext directory.
    Inode(u64),
}

/// A reference to a directory that can be passed back to a listing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, CopyGetters)]
pub struct DirRef {
    /// Index of the volume the directory belongs to.
    #[getset(get_copy = "pub")]
    volume: usize,
    #[getset(get_copy = "pub")]
    location: DirLocation,
}

impl DirRef {
    pub(crate) fn new(volume: usize, location: DirLocation) -> Self {
        Self { volume, location }
    }
}

/// Type of the object a directory entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    /// The record does not say, or says something invalid.
    #[default]
    Unknown,
}

impl FileKind {
    /// Decodes the type bits (`S_IFMT`) of an ext `i_mode`.
    pub fn from_ext_mode(mode: u16) -> Self {
        match mode & 0xF000 {
            0x8000 => FileKind::Regular,
            0x4000 => FileKind::Directory,
            0xA000 => FileKind::Symlink,
            0x2000 => FileKind::CharDevice,
            0x6000 => FileKind::BlockDevice,
            0x1000 => FileKind::Fifo,
            0xC000 => FileKind::Socket,
            _ => FileKind::Unknown,
        }
    }

    /// Decodes the file type byte of an ext directory record.
    pub fn from_ext_file_type(file_type: u8) -> Self {
        match file_type {
            1 => FileKind::Regular,
            2 => FileKind::Directory,
            3 => FileKind::CharDevice,
            4 => FileKind::BlockDevice,
            5 => FileKind::Fifo,
            6 => FileKind::Socket,
            7 => FileKind::Symlink,
            _ => FileKind::Unknown,
        }
    }

    /// FAT and exFAT only tell directories from files.
    pub fn from_directory_flag(is_dir: bool) -> Self {
        if is_dir {
            FileKind::Directory
        } else {
            FileKind::Regular
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileKind::Regular => "REG",
            FileKind::Directory => "DIR",
            FileKind::Symlink => "LNK",
            FileKind::CharDevice => "CHR",
            FileKind::BlockDevice => "BLK",
            FileKind::Fifo => "FIFO",
            FileKind::Socket => "SOCK",
            FileKind::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// One file or directory record, as found during a listing pass.
///
/// The identifier is unique within the listing it came from, not across the volume.
#[derive(Debug, Clone, Default, PartialEq, Getters, CopyGetters)]
pub struct DirectoryEntry {
    /// File name; may be lossy or partially recovered for damaged or deleted records.
    #[getset(get = "pub")]
    pub(crate) name: String,
    /// Address of the directory record: its byte offset in the volume (ext) or that offset
    /// divided by 32 (FAT, exFAT).
    #[getset(get_copy = "pub")]
    pub(crate) id: u64,
    /// Inode the record points at; ext only. Hard links share it.
    #[getset(get_copy = "pub")]
    pub(crate) inode: Option<u64>,
    #[getset(get_copy = "pub")]
    pub(crate) kind: FileKind,
    /// Raw `i_mode` (ext) or attribute bits (FAT, exFAT).
    #[getset(get_copy = "pub")]
    pub(crate) mode: u32,
    /// Size in bytes.
    #[getset(get_copy = "pub")]
    pub(crate) size: u64,
    #[getset(get_copy = "pub")]
    pub(crate) created: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    pub(crate) modified: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    pub(crate) accessed: Option<DateTime<Utc>>,
    /// Metadata change time, only recorded by ext.
    #[getset(get_copy = "pub")]
    pub(crate) changed: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    pub(crate) is_dir: bool,
    /// The record is still in the directory but its allocation has been released.
    #[getset(get_copy = "pub")]
    pub(crate) is_deleted: bool,
    pub(crate) volume: usize,
    pub(crate) location: Option<DirLocation>,
}

impl DirectoryEntry {
    /// Returns a reference suitable for listing this entry, if it is a directory.
    pub fn dir_ref(&self) -> Option<DirRef> {
        match (self.is_dir, self.location) {
            (true, Some(location)) => Some(DirRef::new(self.volume, location)),
            _ => None,
        }
    }
}

impl fmt::Display for DirectoryEntry {
    /// Formats the entry as `"NAME" 123B`, with a trailing slash for directories and a
    /// `(deleted)` marker for released records.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slash = if self.is_dir { "/" } else { "" };
        write!(f, "\"{}{}\" {}B", self.name, slash, self.size)?;
        if self.is_deleted {
            write!(f, " (deleted)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_directories_have_a_dir_ref() {
        let mut entry = DirectoryEntry {
            name: "docs".to_string(),
            id: 12,
            is_dir: true,
            volume: 3,
            location: Some(DirLocation::Inode(12)),
            ..Default::default()
        };
        let dir = entry.dir_ref().unwrap();
        assert_eq!(dir.volume(), 3);
        assert_eq!(dir.location(), DirLocation::Inode(12));

        entry.is_dir = false;
        assert!(entry.dir_ref().is_none());
    }

    #[test]
    fn ext_modes_and_file_types_agree() {
        assert_eq!(FileKind::from_ext_mode(0o120777), FileKind::Symlink);
        assert_eq!(FileKind::from_ext_mode(0o100644), FileKind::Regular);
        assert_eq!(FileKind::from_ext_file_type(7), FileKind::Symlink);
        assert_eq!(FileKind::from_ext_file_type(9), FileKind::Unknown);
        assert_eq!(FileKind::from_directory_flag(true).to_string(), "DIR");
    }

    #[test]
    fn display_marks_deleted_entries() {
        let entry = DirectoryEntry {
            name: "b.txt".to_string(),
            size: 50,
            is_deleted: true,
            ..Default::default()
        };
        assert_eq!(entry.to_string(), "\"b.txt\" 50B (deleted)");
    }
}
